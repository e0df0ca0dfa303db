pub mod ondisk_pipeline;

use crate::error::Result;

/// An encoded `(key, value)` pair as it travels through the sort pipeline.
pub type Record = (Vec<u8>, Vec<u8>);

/// Pull-based input of typed records for one side of a join.
pub trait RecordSource: Send {
    type Key;
    type Value;

    /// `Ok(None)` marks the end of the stream.
    fn next_record(&mut self) -> Result<Option<(Self::Key, Self::Value)>>;
}

/// A stream of encoded records in key order.
pub trait SortedStream: Send {
    fn next_record(&mut self) -> Result<Option<Record>>;
}

/// Source over records already held in memory.
pub struct InMemSource<K, V> {
    records: std::vec::IntoIter<(K, V)>,
}

impl<K, V> InMemSource<K, V> {
    pub fn new(records: Vec<(K, V)>) -> Self {
        Self {
            records: records.into_iter(),
        }
    }
}

impl<K: Send, V: Send> RecordSource for InMemSource<K, V> {
    type Key = K;
    type Value = V;

    fn next_record(&mut self) -> Result<Option<(K, V)>> {
        Ok(self.records.next())
    }
}

/// Source over any iterator of fallible records.
pub struct IterSource<I> {
    iter: I,
}

impl<I> IterSource<I> {
    pub fn new(iter: I) -> Self {
        Self { iter }
    }
}

impl<I, K, V> RecordSource for IterSource<I>
where
    I: Iterator<Item = Result<(K, V)>> + Send,
{
    type Key = K;
    type Value = V;

    fn next_record(&mut self) -> Result<Option<(K, V)>> {
        self.iter.next().transpose()
    }
}
