use std::env;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ExecError, Result};

/// What `next_key()` does with values of the current key the caller did
/// not read.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UndrainedGroupPolicy {
    /// Skip them silently.
    #[default]
    Skip,
    /// Fail with a precondition error.
    Reject,
}

/// Memory and file budget for a whole join. Every count here is shared by
/// both inputs and split evenly by [`JoinConfig::split`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JoinConfig {
    pub num_sort_buffers: usize,
    pub sort_buffer_pages: usize,
    pub max_records_per_buffer: Option<usize>,
    pub merge_memory_pages: usize,
    pub max_open_files: usize,
    pub spill_segment_pages: usize,
    pub undrained_groups: UndrainedGroupPolicy,
    pub parallel_sort: bool,
}

impl Default for JoinConfig {
    fn default() -> Self {
        Self {
            num_sort_buffers: 4,
            sort_buffer_pages: 64,
            max_records_per_buffer: None,
            merge_memory_pages: 32,
            max_open_files: 16,
            spill_segment_pages: 64,
            undrained_groups: UndrainedGroupPolicy::Skip,
            parallel_sort: true,
        }
    }
}

/// One input's share of a [`JoinConfig`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SideConfig {
    pub num_sort_buffers: usize,
    pub sort_buffer_pages: usize,
    pub max_records_per_buffer: Option<usize>,
    pub merge_memory_pages: usize,
    pub max_open_files: usize,
    pub spill_segment_pages: usize,
}

impl SideConfig {
    /// Frames this side may hold at once: resident sort buffers, merge
    /// read-ahead and one staging page for spill writes.
    pub fn required_pages(&self) -> usize {
        self.num_sort_buffers * self.sort_buffer_pages + self.merge_memory_pages + 1
    }
}

const MIN_FILES_PER_SIDE: usize = 2;

impl JoinConfig {
    pub fn from_json_str(s: &str) -> Result<Self> {
        let config: JoinConfig = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&text)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Applies `SMJ_*` environment variables on top of `self`.
    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Some(v) = env_var("SMJ_NUM_SORT_BUFFERS")? {
            self.num_sort_buffers = v;
        }
        if let Some(v) = env_var("SMJ_SORT_BUFFER_PAGES")? {
            self.sort_buffer_pages = v;
        }
        if let Some(v) = env_var("SMJ_MAX_RECORDS_PER_BUFFER")? {
            self.max_records_per_buffer = Some(v);
        }
        if let Some(v) = env_var("SMJ_MERGE_MEMORY_PAGES")? {
            self.merge_memory_pages = v;
        }
        if let Some(v) = env_var("SMJ_MAX_OPEN_FILES")? {
            self.max_open_files = v;
        }
        if let Some(v) = env_var("SMJ_SPILL_SEGMENT_PAGES")? {
            self.spill_segment_pages = v;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        let checks = [
            ("num_sort_buffers", self.num_sort_buffers),
            ("sort_buffer_pages", self.sort_buffer_pages),
            ("merge_memory_pages", self.merge_memory_pages),
            ("max_open_files", self.max_open_files),
            ("spill_segment_pages", self.spill_segment_pages),
        ];
        for (name, value) in checks {
            if value == 0 {
                return Err(ExecError::Config(format!("{} must be at least 1", name)));
            }
        }
        if self.max_records_per_buffer == Some(0) {
            return Err(ExecError::Config(
                "max_records_per_buffer must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Even split between the two inputs. Each side gets at least one sort
    /// buffer, one merge page and two file handles.
    pub fn split(&self) -> SideConfig {
        SideConfig {
            num_sort_buffers: (self.num_sort_buffers / 2).max(1),
            sort_buffer_pages: self.sort_buffer_pages,
            max_records_per_buffer: self.max_records_per_buffer,
            merge_memory_pages: (self.merge_memory_pages / 2).max(1),
            max_open_files: (self.max_open_files / 2).max(MIN_FILES_PER_SIDE),
            spill_segment_pages: self.spill_segment_pages,
        }
    }

    /// Pool frames needed to run the join with this config.
    pub fn required_pages(&self) -> usize {
        self.split().required_pages() * 2
    }
}

fn env_var<T: FromStr>(name: &str) -> Result<Option<T>> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| {
                ExecError::Config(format!("{} must be a valid number, got {:?}", name, raw))
            }),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(ExecError::Config(format!("{}: {}", name, e))),
    }
}
