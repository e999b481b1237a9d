//! In-memory state snapshot and the small value types handed back to
//! callers.

use crate::format::DatHeader;

/// First/last live seqnum and timestamp, the opaque milestone, and the
/// current end-of-data offset. Copied in and out under `state_lock`; no
/// I/O is ever performed while holding that lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct State {
    pub seqnum1: u64,
    pub timestamp1: u64,
    pub seqnum2: u64,
    pub timestamp2: u64,
    pub milestone: u64,
    pub dat_end: u64,
}

impl State {
    #[must_use]
    pub fn empty() -> Self {
        Self { seqnum1: 0, timestamp1: 0, seqnum2: 0, timestamp2: 0, milestone: 0, dat_end: DatHeader::SIZE as u64 }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.seqnum1 == 0
    }
}

/// An application-level record: identifiers plus opaque metadata/data
/// payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub seqnum: u64,
    pub timestamp: u64,
    pub metadata: Vec<u8>,
    pub data: Vec<u8>,
}

impl Entry {
    #[must_use]
    pub fn new(metadata: Vec<u8>, data: Vec<u8>) -> Self {
        Self { seqnum: 0, timestamp: 0, metadata, data }
    }
}

/// Aggregate statistics over a seqnum range.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    pub min_seqnum: u64,
    pub max_seqnum: u64,
    pub min_timestamp: u64,
    pub max_timestamp: u64,
    pub num_entries: u64,
    pub data_size: u64,
    pub index_size: u64,
}

/// Bias for `Store::search`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    /// Smallest seqnum whose timestamp is `>= ts`.
    Lower,
    /// Smallest seqnum whose timestamp is `> ts`.
    Upper,
}
