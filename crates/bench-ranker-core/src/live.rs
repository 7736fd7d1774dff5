//! Per-measurement path that folds freshly stored scores into `current`.
//!
//! New score records arrive dirty. While no rebuild holds the pause gate,
//! each dirty record is added to every `current` ranker of its browser
//! hierarchy and then marked clean, which also makes it visible to the next
//! rebuild. While the gate is set the records stay dirty and are picked up
//! by a later drain.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::catalog::TestCatalog;
use crate::group::MeasurementGroup;
use crate::hierarchy::VersionHierarchy;
use crate::key::{RankerKey, RankerVersion};
use crate::store::{ControlStore, RankerStore, ResultScanner};
use crate::RankerError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum LiveOutcome {
    Applied { rankers_touched: usize },
    Deferred,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct LiveDrainReport {
    pub applied_groups: usize,
    pub deferred: bool,
}

/// Adds the dirty scores of `group` to the `current` rankers.
///
/// Every score is checked against the catalog before the first write; unknown
/// tests and out-of-bounds scores are skipped so the group still turns clean.
///
/// # Errors
/// Propagates storage failures.
pub fn increment_group<B, H>(
    backend: &mut B,
    catalog: &TestCatalog,
    hierarchy: &H,
    group: &MeasurementGroup,
) -> Result<LiveOutcome, RankerError>
where
    B: RankerStore + ResultScanner + ControlStore + ?Sized,
    H: VersionHierarchy + ?Sized,
{
    if backend.is_paused()? {
        debug!(group_id = %group.group_id, "rebuild in progress, deferring live increment");
        return Ok(LiveOutcome::Deferred);
    }

    let mut accepted = Vec::new();
    for record in group.dirty_scores() {
        let test = match catalog.get_test(&group.category, &record.test_key) {
            Ok(test) => test,
            Err(err) => {
                warn!(
                    category = %group.category,
                    test_key = %record.test_key,
                    error = %err,
                    "skipping live increment for unknown test"
                );
                continue;
            }
        };
        if !test.contains(record.score) {
            warn!(
                category = %group.category,
                test_key = %record.test_key,
                score = record.score,
                min_value = test.min_value,
                max_value = test.max_value,
                "skipping live increment outside test bounds"
            );
            continue;
        }
        accepted.push((test, record.score));
    }

    let versions = hierarchy.expand(&group.user_agent_pretty);
    let mut rankers_touched = 0_usize;
    for (test, score) in accepted {
        for version in &versions {
            let key = RankerKey::new(
                group.category.as_str(),
                test.key.as_str(),
                version.as_str(),
                group.params.clone(),
            );
            backend.get_or_create(&key, RankerVersion::Current, test)?;
            backend.add(&key, RankerVersion::Current, score)?;
            rankers_touched += 1;
        }
    }

    backend.mark_clean(group.group_id)?;
    Ok(LiveOutcome::Applied { rankers_touched })
}

/// Applies up to `limit` groups that still carry dirty scores.
///
/// # Errors
/// Propagates failures of [`increment_group`].
pub fn drain_dirty<B, H>(
    backend: &mut B,
    catalog: &TestCatalog,
    hierarchy: &H,
    limit: usize,
) -> Result<LiveDrainReport, RankerError>
where
    B: RankerStore + ResultScanner + ControlStore + ?Sized,
    H: VersionHierarchy + ?Sized,
{
    if backend.is_paused()? {
        return Ok(LiveDrainReport {
            applied_groups: 0,
            deferred: true,
        });
    }

    let mut applied_groups = 0;
    for group in backend.fetch_dirty(limit)? {
        match increment_group(backend, catalog, hierarchy, &group)? {
            LiveOutcome::Applied { .. } => applied_groups += 1,
            LiveOutcome::Deferred => {
                return Ok(LiveDrainReport {
                    applied_groups,
                    deferred: true,
                })
            }
        }
    }

    info!(applied_groups, "drained dirty measurement groups");
    Ok(LiveDrainReport {
        applied_groups,
        deferred: false,
    })
}
