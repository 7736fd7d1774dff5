//! Low-latency cache for ranker summaries.
//!
//! Entries are keyed by [`crate::RankerKey::cache_name`]. Readers must stay
//! correct when every lookup misses, so [`NoopRankerCache`] is always a valid
//! choice.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RankerSummary {
    pub total_ranked_scores: i64,
    pub median: Option<i64>,
}

pub trait RankerCache: Send + Sync {
    fn get(&self, name: &str) -> Option<RankerSummary>;
    fn put(&self, name: &str, summary: RankerSummary);
    fn invalidate(&self, name: &str);
}

#[derive(Debug, Default)]
pub struct MemoryRankerCache {
    entries: Mutex<HashMap<String, RankerSummary>>,
}

impl MemoryRankerCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RankerCache for MemoryRankerCache {
    fn get(&self, name: &str) -> Option<RankerSummary> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .copied()
    }

    fn put(&self, name: &str, summary: RankerSummary) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), summary);
    }

    fn invalidate(&self, name: &str) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRankerCache;

impl RankerCache for NoopRankerCache {
    fn get(&self, _name: &str) -> Option<RankerSummary> {
        None
    }

    fn put(&self, _name: &str, _summary: RankerSummary) {}

    fn invalidate(&self, _name: &str) {}
}
