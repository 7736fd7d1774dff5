use std::collections::BTreeMap;
use std::fmt::Display;

use time::OffsetDateTime;
use ulid::Ulid;

use crate::catalog::TestDefinition;
use crate::group::{Cursor, MeasurementGroup, ScanPage, ScoreRecord};
use crate::key::{ParamSignature, RankerKey, RankerRecord, RankerVersion};
use crate::store::{ControlStore, RankerStore, ResultScanner};
use crate::tree::{shallow_branching_factor, MemoryNodeStore, ScoreRanker};
use crate::RankerError;

pub(crate) fn must<T, E: Display>(result: Result<T, E>) -> T {
    match result {
        Ok(value) => value,
        Err(err) => panic!("expected Ok(..), got error: {err}"),
    }
}

type Slot = (RankerRecord, ScoreRanker<MemoryNodeStore>);

/// In-memory backend for exercising the pipeline without a database.
#[derive(Debug, Default)]
pub(crate) struct MemoryBackend {
    rankers: BTreeMap<(RankerKey, RankerVersion), Slot>,
    groups: Vec<MeasurementGroup>,
    paused: bool,
    migration_completed_at: Option<OffsetDateTime>,
}

impl MemoryBackend {
    pub(crate) fn push_group(
        &mut self,
        category: &str,
        pretty: &str,
        scores: &[(&str, i64, bool)],
    ) -> Ulid {
        let group_id = Ulid::new();
        self.groups.push(MeasurementGroup {
            group_id,
            category: category.to_string(),
            user_agent_pretty: pretty.to_string(),
            params: ParamSignature::none(),
            created_at: crate::now_utc(),
            scores: scores
                .iter()
                .map(|(test_key, score, dirty)| ScoreRecord {
                    test_key: (*test_key).to_string(),
                    score: *score,
                    dirty: *dirty,
                })
                .collect(),
        });
        group_id
    }

    /// Sorted scores of every `next` ranker.
    pub(crate) fn next_snapshot(&self) -> BTreeMap<RankerKey, Vec<i64>> {
        self.snapshot(RankerVersion::Next)
    }

    pub(crate) fn snapshot(&self, version: RankerVersion) -> BTreeMap<RankerKey, Vec<i64>> {
        self.rankers
            .iter()
            .filter(|((_, slot_version), _)| *slot_version == version)
            .map(|((key, _), (_, ranker))| {
                let total = must(ranker.total_ranked_scores());
                let scores = (0..total).map(|rank| must(ranker.find_score(rank))).collect();
                (key.clone(), scores)
            })
            .collect()
    }

    fn slot(&self, key: &RankerKey, version: RankerVersion) -> Result<&Slot, RankerError> {
        self.rankers
            .get(&(key.clone(), version))
            .ok_or_else(|| missing(key, version))
    }

    fn slot_mut(
        &mut self,
        key: &RankerKey,
        version: RankerVersion,
    ) -> Result<&mut Slot, RankerError> {
        self.rankers
            .get_mut(&(key.clone(), version))
            .ok_or_else(|| missing(key, version))
    }
}

fn missing(key: &RankerKey, version: RankerVersion) -> RankerError {
    RankerError::Validation(format!("no {} ranker for {key}", version.as_str()))
}

impl RankerStore for MemoryBackend {
    fn get_or_create(
        &mut self,
        key: &RankerKey,
        version: RankerVersion,
        test: &TestDefinition,
    ) -> Result<RankerRecord, RankerError> {
        if let Some((record, _)) = self.rankers.get(&(key.clone(), version)) {
            return Ok(record.clone());
        }
        let record = RankerRecord {
            record_id: Ulid::new(),
            key: key.clone(),
            version,
            min_value: test.min_value,
            max_value: test.max_value,
            branching_factor: shallow_branching_factor(test.min_value, test.max_value),
            created_at: crate::now_utc(),
        };
        let ranker = ScoreRanker::for_record(MemoryNodeStore::new(), &record)?;
        self.rankers
            .insert((key.clone(), version), (record.clone(), ranker));
        Ok(record)
    }

    fn find(
        &self,
        key: &RankerKey,
        version: RankerVersion,
    ) -> Result<Option<RankerRecord>, RankerError> {
        Ok(self
            .rankers
            .get(&(key.clone(), version))
            .map(|(record, _)| record.clone()))
    }

    fn update(
        &mut self,
        key: &RankerKey,
        version: RankerVersion,
        scores: &[i64],
    ) -> Result<(), RankerError> {
        self.slot_mut(key, version)?.1.update(scores)
    }

    fn add(&mut self, key: &RankerKey, version: RankerVersion, score: i64) -> Result<(), RankerError> {
        self.slot_mut(key, version)?.1.add(score)
    }

    fn remove(
        &mut self,
        key: &RankerKey,
        version: RankerVersion,
        score: i64,
    ) -> Result<(), RankerError> {
        self.slot_mut(key, version)?.1.remove(score)
    }

    fn find_score(
        &self,
        key: &RankerKey,
        version: RankerVersion,
        rank: i64,
    ) -> Result<i64, RankerError> {
        self.slot(key, version)?.1.find_score(rank)
    }

    fn total_ranked_scores(
        &self,
        key: &RankerKey,
        version: RankerVersion,
    ) -> Result<i64, RankerError> {
        self.slot(key, version)?.1.total_ranked_scores()
    }

    fn reset(&mut self, key: &RankerKey, version: RankerVersion) -> Result<(), RankerError> {
        self.slot_mut(key, version)?.1.reset()
    }

    fn publish(&mut self, key: &RankerKey) -> Result<bool, RankerError> {
        let Some((mut record, ranker)) = self.rankers.remove(&(key.clone(), RankerVersion::Next))
        else {
            return Ok(false);
        };
        record.version = RankerVersion::Current;
        self.rankers
            .insert((key.clone(), RankerVersion::Current), (record, ranker));
        Ok(true)
    }

    fn discard(&mut self, key: &RankerKey) -> Result<bool, RankerError> {
        Ok(self
            .rankers
            .remove(&(key.clone(), RankerVersion::Next))
            .is_some())
    }

    fn list_next_version_keys(
        &self,
        page_size: usize,
    ) -> Result<(Vec<RankerKey>, bool), RankerError> {
        let mut keys = self
            .rankers
            .keys()
            .filter(|(_, version)| *version == RankerVersion::Next)
            .map(|(key, _)| key.clone())
            .take(page_size + 1)
            .collect::<Vec<_>>();
        let has_more = keys.len() > page_size;
        keys.truncate(page_size);
        Ok((keys, has_more))
    }
}

impl ResultScanner for MemoryBackend {
    fn fetch(
        &self,
        category: &str,
        page_size: usize,
        cursor: Option<&Cursor>,
    ) -> Result<ScanPage, RankerError> {
        let mut ordered = self
            .groups
            .iter()
            .filter(|group| group.category == category)
            .filter(|group| match cursor {
                Some(cursor) => {
                    (group.user_agent_pretty.as_str(), group.group_id)
                        > (cursor.user_agent_pretty.as_str(), cursor.group_id)
                }
                None => true,
            })
            .cloned()
            .collect::<Vec<_>>();
        ordered.sort_by(|lhs, rhs| {
            (lhs.user_agent_pretty.as_str(), lhs.group_id)
                .cmp(&(rhs.user_agent_pretty.as_str(), rhs.group_id))
        });
        let has_more = ordered.len() > page_size;
        ordered.truncate(page_size);
        let next_cursor = if has_more {
            ordered.last().map(Cursor::after)
        } else {
            None
        };
        Ok(ScanPage {
            groups: ordered,
            next_cursor,
        })
    }

    fn fetch_dirty(&self, limit: usize) -> Result<Vec<MeasurementGroup>, RankerError> {
        Ok(self
            .groups
            .iter()
            .filter(|group| group.dirty_scores().next().is_some())
            .take(limit)
            .cloned()
            .collect())
    }

    fn mark_clean(&mut self, group_id: Ulid) -> Result<(), RankerError> {
        for group in self.groups.iter_mut().filter(|group| group.group_id == group_id) {
            for record in &mut group.scores {
                record.dirty = false;
            }
        }
        Ok(())
    }
}

impl ControlStore for MemoryBackend {
    fn is_paused(&self) -> Result<bool, RankerError> {
        Ok(self.paused)
    }

    fn set_paused(&mut self, paused: bool) -> Result<(), RankerError> {
        self.paused = paused;
        Ok(())
    }

    fn mark_migration_complete(&mut self, at: OffsetDateTime) -> Result<(), RankerError> {
        self.migration_completed_at = Some(at);
        Ok(())
    }

    fn migration_completed_at(&self) -> Result<Option<OffsetDateTime>, RankerError> {
        Ok(self.migration_completed_at)
    }
}
