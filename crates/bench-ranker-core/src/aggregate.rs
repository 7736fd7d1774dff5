use std::collections::{BTreeMap, BTreeSet};

use crate::group::MeasurementGroup;
use crate::hierarchy::VersionHierarchy;
use crate::key::RankerKey;

/// Scores of one chunk grouped per ranker key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregatedChunk {
    pub ranker_scores: BTreeMap<RankerKey, Vec<i64>>,
    /// Number of leading groups folded in; the rest are pushed back.
    pub consumed: usize,
}

/// Folds `groups` into per-key score lists while the number of distinct keys
/// stays within `ranker_limit`.
///
/// The budget is checked once per new browser hierarchy, as
/// `num_tests * hierarchy.len()` additional keys. A group that would overflow
/// it ends the chunk, except for the first group, which is always taken so
/// a chunk can never stall. Dirty score records are skipped.
pub fn aggregate_scores<H>(
    category: &str,
    groups: &[MeasurementGroup],
    num_tests: usize,
    ranker_limit: usize,
    hierarchy: &H,
) -> AggregatedChunk
where
    H: VersionHierarchy + ?Sized,
{
    let mut chunk = AggregatedChunk::default();
    let mut seen = BTreeSet::<Vec<String>>::new();

    for group in groups {
        let versions = hierarchy.expand(&group.user_agent_pretty);
        if !seen.contains(&versions) {
            let projected = chunk.ranker_scores.len() + num_tests * versions.len();
            if chunk.consumed > 0 && projected > ranker_limit {
                break;
            }
            seen.insert(versions.clone());
        }

        for record in group.clean_scores() {
            for version in &versions {
                let key = RankerKey::new(
                    category,
                    record.test_key.as_str(),
                    version.as_str(),
                    group.params.clone(),
                );
                chunk.ranker_scores.entry(key).or_default().push(record.score);
            }
        }
        chunk.consumed += 1;
    }

    chunk
}
