use std::fmt::Display;
use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use serde::de::DeserializeOwned;
use serde::Serialize;

use sort_merge_join::{
    BincodeCodec, BufferPool, DecodedKeyComparator, ExecError, JoinConfig, OnDiskSortMergeJoin,
    RecordSource, Result, SpillManager, UndrainedGroupPolicy,
};

#[derive(Parser, Debug)]
#[command(
    name = "smj",
    version,
    about = "Inner join of two key,value CSV files with an external sort-merge join"
)]
struct Args {
    left: PathBuf,
    right: PathBuf,

    /// JSON file with a JoinConfig. Flags below override its fields.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Join on column 0 parsed as i64 instead of as a string.
    #[arg(long)]
    numeric_keys: bool,

    /// Directory for spill files. Defaults to the system temp dir.
    #[arg(long)]
    spill_dir: Option<PathBuf>,

    /// Print per-side sort statistics to stderr.
    #[arg(long)]
    stats: bool,

    /// Print keys and values hex encoded.
    #[arg(long)]
    hex: bool,

    /// Field delimiter, a single ASCII character.
    #[arg(long, default_value_t = ',')]
    delim: char,

    #[arg(long)]
    num_sort_buffers: Option<usize>,
    #[arg(long)]
    sort_buffer_pages: Option<usize>,
    #[arg(long)]
    max_records_per_buffer: Option<usize>,
    #[arg(long)]
    merge_memory_pages: Option<usize>,
    #[arg(long)]
    max_open_files: Option<usize>,
    #[arg(long)]
    spill_segment_pages: Option<usize>,
    /// Fail instead of skipping when a group is left half read.
    #[arg(long)]
    reject_undrained: bool,
    /// Sort the two inputs one after the other.
    #[arg(long)]
    sequential: bool,
}

impl Args {
    fn join_config(&self) -> Result<JoinConfig> {
        if !self.delim.is_ascii() {
            return Err(ExecError::Config(format!(
                "--delim must be an ASCII character, got {:?}",
                self.delim
            )));
        }
        let mut config = match &self.config {
            Some(path) => JoinConfig::from_json_file(path)?,
            None => JoinConfig::default(),
        }
        .with_env_overrides()?;

        if let Some(v) = self.num_sort_buffers {
            config.num_sort_buffers = v;
        }
        if let Some(v) = self.sort_buffer_pages {
            config.sort_buffer_pages = v;
        }
        if let Some(v) = self.max_records_per_buffer {
            config.max_records_per_buffer = Some(v);
        }
        if let Some(v) = self.merge_memory_pages {
            config.merge_memory_pages = v;
        }
        if let Some(v) = self.max_open_files {
            config.max_open_files = v;
        }
        if let Some(v) = self.spill_segment_pages {
            config.spill_segment_pages = v;
        }
        if self.reject_undrained {
            config.undrained_groups = UndrainedGroupPolicy::Reject;
        }
        if self.sequential {
            config.parallel_sort = false;
        }
        config.validate()?;
        Ok(config)
    }
}

/// Header-less CSV: column 0 is the key, column 1 the value.
struct CsvSource<K> {
    records: csv::StringRecordsIntoIter<File>,
    parse_key: fn(&str) -> Result<K>,
}

impl<K> CsvSource<K> {
    fn open(path: &PathBuf, delim: u8, parse_key: fn(&str) -> Result<K>) -> Result<Self> {
        let reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .delimiter(delim)
            .flexible(true)
            .from_path(path)
            .map_err(csv_error)?;
        Ok(Self {
            records: reader.into_records(),
            parse_key,
        })
    }
}

impl<K: Send> RecordSource for CsvSource<K> {
    type Key = K;
    type Value = String;

    fn next_record(&mut self) -> Result<Option<(K, String)>> {
        let Some(record) = self.records.next() else {
            return Ok(None);
        };
        let record = record.map_err(csv_error)?;
        let key = record
            .get(0)
            .ok_or_else(|| ExecError::Codec("empty csv row".to_string()))?;
        let value = record.get(1).unwrap_or("").to_string();
        Ok(Some(((self.parse_key)(key.trim())?, value)))
    }
}

fn csv_error(e: csv::Error) -> ExecError {
    ExecError::Codec(e.to_string())
}

fn parse_i64(s: &str) -> Result<i64> {
    s.parse()
        .map_err(|e| ExecError::Codec(format!("bad numeric key {:?}: {}", s, e)))
}

fn parse_string(s: &str) -> Result<String> {
    Ok(s.to_string())
}

fn run<K>(args: &Args, config: JoinConfig, parse_key: fn(&str) -> Result<K>) -> Result<u64>
where
    K: Serialize + DeserializeOwned + Ord + Display + Send + Sync + 'static,
{
    let pool = Arc::new(BufferPool::new(config.required_pages()));
    let spill = match &args.spill_dir {
        Some(dir) => SpillManager::temp_in(dir)?,
        None => SpillManager::temp()?,
    };
    let codec = BincodeCodec::<K, String>::new();
    let cmp = Arc::new(DecodedKeyComparator::new(BincodeCodec::<K, String>::new()));
    let mut join = OnDiskSortMergeJoin::new(config, &pool, &spill, codec, cmp);

    join.open(
        CsvSource::open(&args.left, args.delim as u8, parse_key)?,
        CsvSource::open(&args.right, args.delim as u8, parse_key)?,
    )?;

    let mut out = csv::Writer::from_writer(io::stdout().lock());
    let mut rows = 0u64;
    while join.advance()? {
        // Hex output shows the key as it was sorted and compared.
        let key = if args.hex {
            hex::encode(join.key_bytes()?)
        } else {
            join.key()?.to_string()
        };
        let left = join.values1()?.collect_all()?;
        let right = join.values2()?.collect_all()?;
        for l in &left {
            for r in &right {
                let (l, r) = if args.hex {
                    (hex::encode(l), hex::encode(r))
                } else {
                    (l.clone(), r.clone())
                };
                out.write_record([key.as_str(), l.as_str(), r.as_str()])
                    .map_err(csv_error)?;
                rows += 1;
            }
        }
    }
    out.flush()?;

    if args.stats {
        let (left, right) = join.stats();
        eprintln!("left {}", left);
        eprintln!("right {}", right);
        eprintln!("spill {:?}", spill.stats());
    }
    join.close();
    Ok(rows)
}

fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = args.join_config()?;

    let rows = if args.numeric_keys {
        run(&args, config, parse_i64)?
    } else {
        run(&args, config, parse_string)?
    };
    eprintln!("{} rows", rows);
    Ok(())
}
