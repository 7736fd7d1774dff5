//! Versioned order-statistics rankers for browser benchmark results.
//!
//! The crate is storage-agnostic: persistence is reached through the traits in
//! [`store`] and [`tree::NodeStore`], and the rebuild pipeline
//! ([`rebuild::run_rebuild_chunk`], [`publish::run_publish_chunk`]) only talks
//! to those seams.

use time::{OffsetDateTime, UtcOffset};

pub mod aggregate;
pub mod cache;
pub mod catalog;
pub mod config;
pub mod group;
pub mod hierarchy;
pub mod key;
pub mod live;
pub mod publish;
pub mod rebuild;
pub mod store;
#[cfg(test)]
mod testing;
pub mod tree;

pub use aggregate::{aggregate_scores, AggregatedChunk};
pub use cache::{MemoryRankerCache, NoopRankerCache, RankerCache, RankerSummary};
pub use catalog::{ParsedScore, TestCatalog, TestDefinition, TestSet};
pub use config::{Deadline, RebuildLimits};
pub use group::{Cursor, MeasurementGroup, MeasurementGroupInput, ScanPage, ScoreRecord};
pub use hierarchy::{PrettyVersionHierarchy, VersionHierarchy};
pub use key::{ParamSignature, RankerKey, RankerRecord, RankerVersion};
pub use live::{drain_dirty, increment_group, LiveDrainReport, LiveOutcome};
pub use publish::{run_publish_chunk, PublishChunkReport, SweepMode};
pub use rebuild::{run_rebuild_chunk, RebuildChunkReport, RebuildProgress};
pub use store::{ControlStore, RankerStore, RebuildLease, ResultScanner};
pub use tree::{shallow_branching_factor, MemoryNodeStore, NodeId, NodeStore, ScoreRanker};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum RankerError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("unknown test {test_key} in category {category}")]
    UnknownTest { category: String, test_key: String },
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),
    #[error("results keys mismatch: expected={expected:?}, actual={actual:?}")]
    MalformedResultsKey {
        expected: Vec<String>,
        actual: Vec<String>,
    },
    #[error("results value is not an integer: {0}")]
    MalformedResultsValue(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl RankerError {
    /// True when the failed chunk can be retried unchanged.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::QuotaExceeded(_))
    }

    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "ranker.validation",
            Self::Configuration(_) => "ranker.configuration",
            Self::UnknownTest { .. } => "ranker.unknown_test",
            Self::QuotaExceeded(_) => "ranker.quota_exceeded",
            Self::MalformedResultsKey { .. } => "ranker.malformed_results_key",
            Self::MalformedResultsValue(_) => "ranker.malformed_results_value",
            Self::Storage(_) => "ranker.storage",
        }
    }
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`RankerError::Validation`] when parsing fails or an input
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, RankerError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| RankerError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(RankerError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`RankerError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, RankerError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| RankerError::Validation(format!("failed to format RFC3339 timestamp: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}
