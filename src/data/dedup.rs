//! In-memory duplicate detection over every payload in the record log.
//!
//! The index is derived state: it is rebuilt from the log at startup
//! ([`DedupIndex::hydrate`]) and then kept in step with every successful append.
//! It never evicts; payload cardinality is bounded by how many things a person
//! can physically scan.

use super::record::Record;
use std::collections::HashSet;

/// Set of payloads already present in the record log.
#[derive(Debug, Default, Clone)]
pub struct DedupIndex {
    payloads: HashSet<String>,
}

impl DedupIndex {
    /// Create an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Populate the index from existing records.
    pub fn hydrate<'a, I>(&mut self, records: I)
    where
        I: IntoIterator<Item = &'a Record>,
    {
        self.payloads
            .extend(records.into_iter().map(|r| r.payload().to_string()));
    }

    /// Whether `payload` has been stored before.
    pub fn contains(&self, payload: &str) -> bool {
        self.payloads.contains(payload)
    }

    /// Record `payload` as stored. Returns `true` if it was not present.
    pub fn add(&mut self, payload: impl Into<String>) -> bool {
        self.payloads.insert(payload.into())
    }

    /// Number of distinct payloads.
    pub fn len(&self) -> usize {
        self.payloads.len()
    }

    /// Whether no payload has been stored yet.
    pub fn is_empty(&self) -> bool {
        self.payloads.is_empty()
    }
}
