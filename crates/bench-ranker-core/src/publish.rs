use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::Deadline;
use crate::store::{ControlStore, RankerStore};
use crate::RankerError;

/// What the sweep does with each `next` ranker.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SweepMode {
    Publish,
    Discard,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PublishChunkReport {
    pub total: u64,
    pub mapped: usize,
    pub is_done: bool,
}

/// Publishes or discards up to `fetch_limit` `next` rankers.
///
/// A short page means the listing is exhausted: the pause gate is cleared and
/// the migration marker rewritten. Rerunning a finished sweep is harmless.
///
/// # Errors
/// Returns [`RankerError::Configuration`] for a zero `fetch_limit`,
/// [`RankerError::QuotaExceeded`] when `deadline` passes, and propagates
/// storage failures.
pub fn run_publish_chunk<B>(
    backend: &mut B,
    mode: SweepMode,
    fetch_limit: usize,
    total_so_far: u64,
    deadline: &Deadline,
) -> Result<PublishChunkReport, RankerError>
where
    B: RankerStore + ControlStore + ?Sized,
{
    if fetch_limit == 0 {
        return Err(RankerError::Configuration(
            "fetch_limit MUST be > 0".to_string(),
        ));
    }

    deadline.check("list next rankers")?;
    let (keys, _) = backend.list_next_version_keys(fetch_limit)?;
    for key in &keys {
        deadline.check("publish")?;
        let swept = match mode {
            SweepMode::Publish => backend.publish(key)?,
            SweepMode::Discard => backend.discard(key)?,
        };
        debug!(ranker = %key, ?mode, swept, "swept next ranker");
    }

    let mapped = keys.len();
    let total = total_so_far + u64::try_from(mapped).unwrap_or(u64::MAX);
    let is_done = mapped < fetch_limit;
    if is_done {
        backend.set_paused(false)?;
        backend.mark_migration_complete(crate::now_utc())?;
    }

    info!(?mode, mapped, total, is_done, "publish chunk applied");
    Ok(PublishChunkReport {
        total,
        mapped,
        is_done,
    })
}
