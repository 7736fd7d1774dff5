//! One checkpointed increment of a ranker rebuild.
//!
//! A rebuild walks every category of the catalog in order. Each chunk reads a
//! page of measurement groups after the saved cursor, folds them into per-key
//! score lists and writes those into the `next` rankers. The returned
//! [`RebuildProgress`] is handed back unchanged by the caller on the following
//! call; a failed chunk leaves the caller's progress as it was.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::aggregate::aggregate_scores;
use crate::catalog::TestCatalog;
use crate::config::{Deadline, RebuildLimits};
use crate::group::Cursor;
use crate::hierarchy::VersionHierarchy;
use crate::key::RankerVersion;
use crate::store::{RankerStore, RebuildLease, ResultScanner};
use crate::RankerError;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RebuildProgress {
    #[serde(default)]
    pub category_index: usize,
    #[serde(default)]
    pub cursor: Option<Cursor>,
    #[serde(default)]
    pub total_results_processed: u64,
    #[serde(default)]
    pub is_done: bool,
}

impl RebuildProgress {
    /// Progress of a rebuild that has not started.
    #[must_use]
    pub fn start() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RebuildChunkReport {
    pub progress: RebuildProgress,
    pub rankers_updated: usize,
    pub results_consumed: usize,
    /// Test keys dropped from this chunk because the catalog no longer has them.
    pub unknown_tests: Vec<String>,
    /// Scores left out because they fall outside their test's bounds.
    #[serde(default)]
    pub out_of_range_scores: usize,
}

/// Runs one rebuild chunk and returns the progress to resume from.
///
/// Only clean score records are folded in. On the first chunk of a category
/// (no cursor) every touched `next` ranker that already holds scores is reset
/// first, so an abandoned earlier pass never leaks into this one.
///
/// # Errors
/// Returns [`RankerError::QuotaExceeded`] when `deadline` passes; keys written
/// before that point stay written and may be counted again when the same
/// chunk is retried. Storage and validation failures are propagated.
pub fn run_rebuild_chunk<B, H>(
    backend: &mut B,
    lease: &RebuildLease,
    catalog: &TestCatalog,
    hierarchy: &H,
    progress: &RebuildProgress,
    limits: &RebuildLimits,
    deadline: &Deadline,
) -> Result<RebuildChunkReport, RankerError>
where
    B: RankerStore + ResultScanner + ?Sized,
    H: VersionHierarchy + ?Sized,
{
    limits.validate()?;

    let Some(test_set) = catalog
        .get(progress.category_index)
        .filter(|_| !progress.is_done)
    else {
        return Ok(RebuildChunkReport {
            progress: RebuildProgress {
                is_done: true,
                ..progress.clone()
            },
            rankers_updated: 0,
            results_consumed: 0,
            unknown_tests: Vec::new(),
            out_of_range_scores: 0,
        });
    };
    let category = test_set.category.as_str();

    deadline.check("fetch")?;
    let page = backend.fetch(category, limits.fetch_limit, progress.cursor.as_ref())?;

    deadline.check("aggregate")?;
    let chunk = aggregate_scores(
        category,
        &page.groups,
        test_set.num_tests(),
        limits.ranker_limit,
        hierarchy,
    );
    debug!(
        category,
        fetched = page.groups.len(),
        consumed = chunk.consumed,
        keys = chunk.ranker_scores.len(),
        lease_acquired_at = %lease.acquired_at(),
        "aggregated rebuild chunk"
    );

    let fresh_pass = progress.cursor.is_none();
    let mut unknown_tests = BTreeSet::new();
    let mut rankers_updated = 0_usize;
    let mut out_of_range_scores = 0_usize;
    for (key, scores) in &chunk.ranker_scores {
        let test = match test_set.get_test(&key.test_key) {
            Ok(test) => test,
            Err(err) => {
                warn!(
                    category,
                    test_key = %key.test_key,
                    user_agent_version = %key.user_agent_version,
                    error = %err,
                    "skipping scores for unknown test"
                );
                unknown_tests.insert(key.test_key.clone());
                continue;
            }
        };

        let in_range = scores
            .iter()
            .copied()
            .filter(|score| test.contains(*score))
            .collect::<Vec<_>>();
        if in_range.len() < scores.len() {
            let dropped = scores.len() - in_range.len();
            warn!(
                category,
                test_key = %key.test_key,
                user_agent_version = %key.user_agent_version,
                dropped,
                min_value = test.min_value,
                max_value = test.max_value,
                "skipping scores outside test bounds"
            );
            out_of_range_scores += dropped;
        }
        if in_range.is_empty() {
            continue;
        }

        deadline.check("ranker update")?;
        backend.get_or_create(key, RankerVersion::Next, test)?;
        if fresh_pass && backend.total_ranked_scores(key, RankerVersion::Next)? > 0 {
            warn!(
                category,
                test_key = %key.test_key,
                user_agent_version = %key.user_agent_version,
                "resetting next ranker left over from an earlier rebuild"
            );
            backend.reset(key, RankerVersion::Next)?;
        }
        backend.update(key, RankerVersion::Next, &in_range)?;
        debug!(
            category,
            test_key = %key.test_key,
            user_agent_version = %key.user_agent_version,
            scores = in_range.len(),
            "updated next ranker"
        );
        rankers_updated += 1;
    }

    let cursor = if chunk.consumed >= page.groups.len() {
        page.next_cursor.clone()
    } else {
        chunk
            .consumed
            .checked_sub(1)
            .and_then(|index| page.groups.get(index))
            .map(Cursor::after)
            .or_else(|| progress.cursor.clone())
    };

    let mut next = RebuildProgress {
        category_index: progress.category_index,
        total_results_processed: progress.total_results_processed
            + u64::try_from(chunk.consumed).unwrap_or(u64::MAX),
        is_done: false,
        cursor,
    };
    if next.cursor.is_none() {
        next.category_index += 1;
        next.is_done = next.category_index >= catalog.len();
    }

    info!(
        category,
        category_index = next.category_index,
        bookmark = %next.cursor.as_ref().map(Cursor::encode).unwrap_or_default(),
        rankers_updated,
        results_consumed = chunk.consumed,
        total_results = next.total_results_processed,
        is_done = next.is_done,
        "rebuild chunk applied"
    );

    Ok(RebuildChunkReport {
        progress: next,
        rankers_updated,
        results_consumed: chunk.consumed,
        unknown_tests: unknown_tests.into_iter().collect(),
        out_of_range_scores,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{TestDefinition, TestSet};
    use crate::hierarchy::PrettyVersionHierarchy;
    use crate::key::{ParamSignature, RankerKey};
    use crate::testing::{must, MemoryBackend};
    use proptest::prelude::*;

    fn catalog() -> TestCatalog {
        let test = |key: &str| TestDefinition {
            key: key.to_string(),
            name: key.to_string(),
            min_value: 0,
            max_value: 1_000,
        };
        TestCatalog {
            categories: vec![
                TestSet {
                    category: "reflow".to_string(),
                    category_name: "Reflow".to_string(),
                    tests: vec![test("testDisplay"), test("testVisibility")],
                },
                TestSet {
                    category: "network".to_string(),
                    category_name: "Network".to_string(),
                    tests: vec![test("latency")],
                },
            ],
        }
    }

    fn limits(fetch_limit: usize, ranker_limit: usize) -> RebuildLimits {
        RebuildLimits {
            fetch_limit,
            ranker_limit,
            ..RebuildLimits::default()
        }
    }

    fn run_to_completion(backend: &mut MemoryBackend, limits: &RebuildLimits) -> usize {
        let catalog = catalog();
        let lease = must(RebuildLease::acquire(backend));
        let mut progress = RebuildProgress::start();
        let mut chunks = 0;
        while !progress.is_done {
            let report = must(run_rebuild_chunk(
                backend,
                &lease,
                &catalog,
                &PrettyVersionHierarchy,
                &progress,
                limits,
                &Deadline::none(),
            ));
            progress = report.progress;
            chunks += 1;
            assert!(chunks < 1_000, "rebuild did not terminate");
        }
        chunks
    }

    fn next_total(backend: &MemoryBackend, test_key: &str, version: &str) -> i64 {
        let key = RankerKey::new("reflow", test_key, version, ParamSignature::none());
        must(backend.total_ranked_scores(&key, RankerVersion::Next))
    }

    #[test]
    fn full_rebuild_counts_every_clean_score_per_version() {
        let mut backend = MemoryBackend::default();
        backend.push_group("reflow", "Firefox 3.5.3", &[("testDisplay", 10, false)]);
        backend.push_group("reflow", "Firefox 3.6", &[("testDisplay", 20, false)]);
        backend.push_group("reflow", "IE 8", &[("testDisplay", 30, true)]);
        backend.push_group("network", "IE 8", &[("latency", 5, false)]);

        run_to_completion(&mut backend, &limits(1, 80));

        assert_eq!(next_total(&backend, "testDisplay", "Firefox"), 2);
        assert_eq!(next_total(&backend, "testDisplay", "Firefox 3"), 2);
        assert_eq!(next_total(&backend, "testDisplay", "Firefox 3.5.3"), 1);
        assert!(backend
            .find(
                &RankerKey::new("reflow", "testDisplay", "IE 8", ParamSignature::none()),
                RankerVersion::Next
            )
            .ok()
            .flatten()
            .is_none());
        let latency = RankerKey::new("network", "latency", "IE", ParamSignature::none());
        assert_eq!(
            must(backend.total_ranked_scores(&latency, RankerVersion::Next)),
            1
        );
    }

    #[test]
    fn done_progress_is_returned_without_work() {
        let mut backend = MemoryBackend::default();
        let lease = must(RebuildLease::acquire(&mut backend));
        let progress = RebuildProgress {
            category_index: 7,
            ..RebuildProgress::start()
        };
        let report = must(run_rebuild_chunk(
            &mut backend,
            &lease,
            &catalog(),
            &PrettyVersionHierarchy,
            &progress,
            &RebuildLimits::default(),
            &Deadline::none(),
        ));
        assert!(report.progress.is_done);
        assert_eq!(report.rankers_updated, 0);
    }

    #[test]
    fn unknown_tests_are_skipped_not_fatal() {
        let mut backend = MemoryBackend::default();
        backend.push_group(
            "reflow",
            "IE 8",
            &[("testDisplay", 1, false), ("testRemoved", 2, false)],
        );
        let lease = must(RebuildLease::acquire(&mut backend));
        let report = must(run_rebuild_chunk(
            &mut backend,
            &lease,
            &catalog(),
            &PrettyVersionHierarchy,
            &RebuildProgress::start(),
            &RebuildLimits::default(),
            &Deadline::none(),
        ));
        assert_eq!(report.unknown_tests, vec!["testRemoved".to_string()]);
        assert_eq!(report.rankers_updated, 2);
        assert_eq!(report.progress.category_index, 1);
    }

    #[test]
    fn scores_outside_tightened_bounds_are_skipped() {
        let mut backend = MemoryBackend::default();
        backend.push_group(
            "reflow",
            "IE 8",
            &[("testDisplay", 10, false), ("testVisibility", 5_000, false)],
        );
        backend.push_group("reflow", "IE 8", &[("testDisplay", 20, false)]);
        let lease = must(RebuildLease::acquire(&mut backend));

        let mut progress = RebuildProgress::start();
        let mut skipped = 0;
        while !progress.is_done {
            let report = must(run_rebuild_chunk(
                &mut backend,
                &lease,
                &catalog(),
                &PrettyVersionHierarchy,
                &progress,
                &limits(1, 80),
                &Deadline::none(),
            ));
            skipped += report.out_of_range_scores;
            progress = report.progress;
        }

        // One bad score fans out to both hierarchy levels.
        assert_eq!(skipped, 2);
        assert_eq!(progress.total_results_processed, 2);
        assert_eq!(next_total(&backend, "testDisplay", "IE"), 2);
        assert!(must(backend.find(
            &RankerKey::new("reflow", "testVisibility", "IE 8", ParamSignature::none()),
            RankerVersion::Next
        ))
        .is_none());
    }

    #[test]
    fn expired_deadline_surfaces_quota_exceeded() {
        let mut backend = MemoryBackend::default();
        backend.push_group("reflow", "IE 8", &[("testDisplay", 1, false)]);
        let lease = must(RebuildLease::acquire(&mut backend));
        let result = run_rebuild_chunk(
            &mut backend,
            &lease,
            &catalog(),
            &PrettyVersionHierarchy,
            &RebuildProgress::start(),
            &RebuildLimits::default(),
            &Deadline::after(std::time::Duration::ZERO),
        );
        assert!(matches!(result, Err(RankerError::QuotaExceeded(_))));
    }

    #[test]
    fn fresh_pass_resets_leftover_next_rankers_once() {
        let mut backend = MemoryBackend::default();
        backend.push_group("reflow", "IE 8", &[("testDisplay", 1, false)]);
        backend.push_group("reflow", "IE 8", &[("testDisplay", 2, false)]);

        run_to_completion(&mut backend, &limits(1, 80));
        assert_eq!(next_total(&backend, "testDisplay", "IE 8"), 2);

        run_to_completion(&mut backend, &limits(1, 80));
        assert_eq!(next_total(&backend, "testDisplay", "IE 8"), 2);
    }

    proptest! {
        #[test]
        fn chunk_size_does_not_change_rebuilt_counts(
            groups in proptest::collection::vec((0_usize..4, 0_i64..1_000), 1..30),
            fetch_limit in 1_usize..8,
            ranker_limit in 1_usize..20,
        ) {
            let browsers = ["Firefox 3.5.3", "Firefox 3.6", "IE 8", "Safari 4.3"];
            let mut chunked = MemoryBackend::default();
            let mut single = MemoryBackend::default();
            for (browser, score) in &groups {
                chunked.push_group("reflow", browsers[*browser], &[("testDisplay", *score, false)]);
                single.push_group("reflow", browsers[*browser], &[("testDisplay", *score, false)]);
            }

            run_to_completion(&mut chunked, &limits(fetch_limit, ranker_limit));
            run_to_completion(&mut single, &limits(1_000, 10_000));

            prop_assert_eq!(chunked.next_snapshot(), single.next_snapshot());
        }
    }
}
