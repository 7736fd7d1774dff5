use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::RankerError;

pub const DEFAULT_FETCH_LIMIT: usize = 100;
pub const DEFAULT_RANKER_LIMIT: usize = 80;
pub const DEFAULT_PUBLISH_FETCH_LIMIT: usize = 50;

/// Per-chunk sizing for the rebuild and publish sweeps.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RebuildLimits {
    #[serde(default = "default_fetch_limit")]
    pub fetch_limit: usize,
    #[serde(default = "default_ranker_limit")]
    pub ranker_limit: usize,
    #[serde(default = "default_publish_fetch_limit")]
    pub publish_fetch_limit: usize,
    #[serde(default)]
    pub chunk_deadline_ms: Option<u64>,
}

fn default_fetch_limit() -> usize {
    DEFAULT_FETCH_LIMIT
}

fn default_ranker_limit() -> usize {
    DEFAULT_RANKER_LIMIT
}

fn default_publish_fetch_limit() -> usize {
    DEFAULT_PUBLISH_FETCH_LIMIT
}

impl Default for RebuildLimits {
    fn default() -> Self {
        Self {
            fetch_limit: DEFAULT_FETCH_LIMIT,
            ranker_limit: DEFAULT_RANKER_LIMIT,
            publish_fetch_limit: DEFAULT_PUBLISH_FETCH_LIMIT,
            chunk_deadline_ms: None,
        }
    }
}

impl RebuildLimits {
    /// Validates limit ranges.
    ///
    /// # Errors
    /// Returns [`RankerError::Configuration`] when any limit is zero.
    pub fn validate(&self) -> Result<(), RankerError> {
        if self.fetch_limit == 0 {
            return Err(RankerError::Configuration(
                "fetch_limit MUST be > 0".to_string(),
            ));
        }
        if self.ranker_limit == 0 {
            return Err(RankerError::Configuration(
                "ranker_limit MUST be > 0".to_string(),
            ));
        }
        if self.publish_fetch_limit == 0 {
            return Err(RankerError::Configuration(
                "publish_fetch_limit MUST be > 0".to_string(),
            ));
        }
        if self.chunk_deadline_ms == Some(0) {
            return Err(RankerError::Configuration(
                "chunk_deadline_ms MUST be > 0 when set".to_string(),
            ));
        }
        Ok(())
    }

    /// Decodes limits from JSON, filling omitted fields with defaults.
    ///
    /// # Errors
    /// Returns [`RankerError::Configuration`] when decoding or validation fails.
    pub fn from_json(value: &Value) -> Result<Self, RankerError> {
        let limits: Self = serde_json::from_value(value.clone()).map_err(|err| {
            RankerError::Configuration(format!("invalid limits JSON payload: {err}"))
        })?;
        limits.validate()?;
        Ok(limits)
    }

    #[must_use]
    pub fn deadline(&self) -> Deadline {
        self.chunk_deadline_ms
            .map_or_else(Deadline::none, |ms| Deadline::after(Duration::from_millis(ms)))
    }
}

/// Wall-clock budget of one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    expires_at: Option<Instant>,
}

impl Deadline {
    #[must_use]
    pub fn none() -> Self {
        Self { expires_at: None }
    }

    #[must_use]
    pub fn after(budget: Duration) -> Self {
        Self {
            expires_at: Instant::now().checked_add(budget),
        }
    }

    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expires_at
            .is_some_and(|expires_at| Instant::now() >= expires_at)
    }

    /// Fails once the budget is spent.
    ///
    /// # Errors
    /// Returns [`RankerError::QuotaExceeded`] naming `stage`.
    pub fn check(&self, stage: &str) -> Result<(), RankerError> {
        if self.is_expired() {
            return Err(RankerError::QuotaExceeded(format!(
                "chunk deadline reached during {stage}"
            )));
        }
        Ok(())
    }
}

impl Default for Deadline {
    fn default() -> Self {
        Self::none()
    }
}
