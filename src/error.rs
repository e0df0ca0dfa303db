use std::fmt;

use crate::mem_pool::MemPoolStatus;

#[derive(Debug)]
pub enum ExecError {
    /// Contract violation on a buffer or segment (append after freeze,
    /// write after the write phase, read before it).
    Capacity(String),
    /// API misuse on the iterator or driver level.
    Precondition(String),
    Io(std::io::Error),
    Config(String),
    Codec(String),
    MemPool(MemPoolStatus),
    RecordTooLarge { size: usize, max: usize },
    /// Failure while opening the join. The cause is kept intact.
    Open(Box<ExecError>),
    Other(String),
}

pub type Result<T> = std::result::Result<T, ExecError>;

impl ExecError {
    /// Strips `Open` wrappers.
    pub fn root_cause(&self) -> &ExecError {
        match self {
            ExecError::Open(inner) => inner.root_cause(),
            other => other,
        }
    }
}

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecError::Capacity(msg) => write!(f, "capacity error: {}", msg),
            ExecError::Precondition(msg) => write!(f, "precondition failed: {}", msg),
            ExecError::Io(e) => write!(f, "spill i/o error: {}", e),
            ExecError::Config(msg) => write!(f, "configuration error: {}", msg),
            ExecError::Codec(msg) => write!(f, "codec error: {}", msg),
            ExecError::MemPool(status) => write!(f, "memory pool error: {:?}", status),
            ExecError::RecordTooLarge { size, max } => write!(
                f,
                "record of {} bytes does not fit in a page (max {} bytes)",
                size, max
            ),
            ExecError::Open(inner) => write!(f, "failed to open join: {}", inner),
            ExecError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for ExecError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ExecError::Io(e) => Some(e),
            ExecError::Open(inner) => Some(inner.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ExecError {
    fn from(e: std::io::Error) -> Self {
        ExecError::Io(e)
    }
}

impl From<bincode::Error> for ExecError {
    fn from(e: bincode::Error) -> Self {
        ExecError::Codec(e.to_string())
    }
}

impl From<serde_json::Error> for ExecError {
    fn from(e: serde_json::Error) -> Self {
        ExecError::Codec(e.to_string())
    }
}

impl From<MemPoolStatus> for ExecError {
    fn from(status: MemPoolStatus) -> Self {
        ExecError::MemPool(status)
    }
}
