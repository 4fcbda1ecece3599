//! Immutable view of one collection at a point in time.

use std::sync::Arc;

use crate::record::{CollectionKind, Record};

/// The full ordered list of records of one kind, as last published.
///
/// `seq` increases with every publish for the collection, so a larger `seq`
/// always means a fresher snapshot. Cloning is cheap.
#[derive(Debug, Clone)]
pub struct Snapshot {
    kind: CollectionKind,
    seq: u64,
    records: Arc<Vec<Record>>,
}

impl Snapshot {
    pub(crate) fn new(kind: CollectionKind, seq: u64, records: Arc<Vec<Record>>) -> Self {
        Self { kind, seq, records }
    }

    pub fn empty(kind: CollectionKind) -> Self {
        Self::new(kind, 0, Arc::new(Vec::new()))
    }

    pub fn kind(&self) -> CollectionKind {
        self.kind
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub(crate) fn shared_records(&self) -> Arc<Vec<Record>> {
        Arc::clone(&self.records)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Record> {
        self.records.iter().find(|r| r.id() == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn ids(&self) -> Vec<&str> {
        self.records.iter().map(Record::id).collect()
    }

    /// Same records in the same order, regardless of `seq`.
    pub fn same_records(&self, other: &Snapshot) -> bool {
        self.kind == other.kind && self.records == other.records
    }
}
