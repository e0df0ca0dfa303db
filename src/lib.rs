#[macro_use]
mod logger;

pub mod codec;
pub mod config;
pub mod error;
pub mod executor;
pub mod mem_pool;
pub mod spill;

pub use codec::{
    BincodeCodec, BytewiseComparator, DecodedKeyComparator, KeyComparator, KvCodec, RawCodec,
};
pub use config::{JoinConfig, SideConfig, UndrainedGroupPolicy};
pub use error::{ExecError, Result};
pub use executor::ondisk_pipeline::{OnDiskSortMergeJoin, SortStats};
pub use executor::{InMemSource, IterSource, Record, RecordSource, SortedStream};
pub use mem_pool::{BufferPool, MemPool, PAGE_SIZE};
pub use spill::{InMemBackend, SpillBackend, SpillManager, SpillStats, TempFileBackend};
