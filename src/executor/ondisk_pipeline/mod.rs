//! External sort and sort-merge join over pool pages and spill files.
//!
//! Bottom up: [`page`] is the slotted record layout shared by sort buffers and
//! spilled runs, [`sort_buffer`] turns records into sorted runs, [`run`]
//! spills and reads them back, [`merge`] combines runs, [`sort`] drives one
//! input through all of that, [`group`] walks a sorted stream key by key and
//! [`join`] zig-zags two of those.

pub mod group;
pub mod join;
pub mod merge;
pub mod page;
pub mod run;
pub mod sort;
pub mod sort_buffer;

pub use group::{GroupValues, KeyGroupIterator};
pub use join::{JoinValues, OnDiskSortMergeJoin};
pub use merge::{MergeIter, RunMerger};
pub use run::{RunCursor, SortedRun, SpilledRun};
pub use sort::{MergeStats, OnDiskSort, RunGenerationStats, SortStats, SortedRunStream};
pub use sort_buffer::SortBuffer;
