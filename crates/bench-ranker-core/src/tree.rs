//! Counting tree over a fixed integer domain.
//!
//! The domain `[min_value, max_value]` is split `branching_factor` ways per
//! level until each leaf child covers exactly one value. Every node stores one
//! count per child, so a rank query walks a single root-to-leaf path and an
//! insert touches exactly `depth` nodes.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::key::RankerRecord;
use crate::RankerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId {
    pub level: u32,
    pub position: u64,
}

impl NodeId {
    pub const ROOT: Self = Self {
        level: 0,
        position: 0,
    };
}

/// Persistence seam for tree nodes of a single ranker.
pub trait NodeStore {
    /// Loads the child counts of a node, `None` if it was never written.
    ///
    /// # Errors
    /// Returns [`RankerError::Storage`] when the backend read fails.
    fn load_node(&self, node: NodeId) -> Result<Option<Vec<i64>>, RankerError>;

    /// Writes a batch of nodes; the batch must land together.
    ///
    /// # Errors
    /// Returns [`RankerError::Storage`] when the backend write fails.
    fn store_nodes(&mut self, nodes: &BTreeMap<NodeId, Vec<i64>>) -> Result<(), RankerError>;

    /// Drops every node of the ranker.
    ///
    /// # Errors
    /// Returns [`RankerError::Storage`] when the backend write fails.
    fn clear_nodes(&mut self) -> Result<(), RankerError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryNodeStore {
    nodes: BTreeMap<NodeId, Vec<i64>>,
}

impl MemoryNodeStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

impl NodeStore for MemoryNodeStore {
    fn load_node(&self, node: NodeId) -> Result<Option<Vec<i64>>, RankerError> {
        Ok(self.nodes.get(&node).cloned())
    }

    fn store_nodes(&mut self, nodes: &BTreeMap<NodeId, Vec<i64>>) -> Result<(), RankerError> {
        for (node, counts) in nodes {
            self.nodes.insert(*node, counts.clone());
        }
        Ok(())
    }

    fn clear_nodes(&mut self) -> Result<(), RankerError> {
        self.nodes.clear();
        Ok(())
    }
}

/// Smallest fan-out `>= 2` that keeps a domain at most three levels deep.
///
/// Deterministic in `(min_value, max_value)` so concurrent creators of the
/// same ranker agree on its shape.
#[must_use]
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss
)]
pub fn shallow_branching_factor(min_value: i64, max_value: i64) -> u32 {
    let width = domain_width(min_value, max_value);
    let mut factor = ((width as f64).cbrt().ceil() as u128).max(2);
    while factor > 2 && (factor - 1).pow(3) >= width {
        factor -= 1;
    }
    while factor.pow(3) < width {
        factor += 1;
    }
    u32::try_from(factor).unwrap_or(u32::MAX)
}

fn domain_width(min_value: i64, max_value: i64) -> u128 {
    let width = i128::from(max_value) - i128::from(min_value) + 1;
    u128::try_from(width).unwrap_or(0)
}

/// Order-statistics store backed by a [`NodeStore`].
#[derive(Debug)]
pub struct ScoreRanker<S> {
    storage: S,
    min_value: i64,
    max_value: i64,
    branching_factor: u64,
    depth: u32,
}

impl<S: NodeStore> ScoreRanker<S> {
    /// Builds a ranker over `[min_value, max_value]`.
    ///
    /// # Errors
    /// Returns [`RankerError::Configuration`] for an empty domain or a
    /// branching factor below 2.
    pub fn new(
        storage: S,
        min_value: i64,
        max_value: i64,
        branching_factor: u32,
    ) -> Result<Self, RankerError> {
        if min_value > max_value {
            return Err(RankerError::Configuration(format!(
                "min_value {min_value} MUST be <= max_value {max_value}"
            )));
        }
        if branching_factor < 2 {
            return Err(RankerError::Configuration(
                "branching_factor MUST be >= 2".to_string(),
            ));
        }

        let width = domain_width(min_value, max_value);
        let factor = u128::from(branching_factor);
        let mut depth = 1_u32;
        let mut span = factor;
        while span < width {
            span *= factor;
            depth += 1;
        }

        Ok(Self {
            storage,
            min_value,
            max_value,
            branching_factor: u64::from(branching_factor),
            depth,
        })
    }

    /// Builds a ranker with the domain and fan-out recorded for `record`.
    ///
    /// # Errors
    /// Same as [`ScoreRanker::new`].
    pub fn for_record(storage: S, record: &RankerRecord) -> Result<Self, RankerError> {
        Self::new(
            storage,
            record.min_value,
            record.max_value,
            record.branching_factor,
        )
    }

    #[must_use]
    pub fn depth(&self) -> u32 {
        self.depth
    }

    #[must_use]
    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn into_storage(self) -> S {
        self.storage
    }

    /// # Errors
    /// Returns [`RankerError::Validation`] when `score` is outside the domain.
    pub fn add(&mut self, score: i64) -> Result<(), RankerError> {
        self.apply(&[(score, 1)])
    }

    /// # Errors
    /// Returns [`RankerError::Validation`] when `score` was never added.
    pub fn remove(&mut self, score: i64) -> Result<(), RankerError> {
        self.apply(&[(score, -1)])
    }

    /// Adds a batch of scores with one storage write.
    ///
    /// # Errors
    /// Returns [`RankerError::Validation`] when any score is outside the
    /// domain; nothing is written in that case.
    pub fn update(&mut self, scores: &[i64]) -> Result<(), RankerError> {
        let changes = scores.iter().map(|score| (*score, 1)).collect::<Vec<_>>();
        self.apply(&changes)
    }

    /// Empties the ranker in place; domain and fan-out are kept.
    ///
    /// # Errors
    /// Propagates storage failures.
    pub fn reset(&mut self) -> Result<(), RankerError> {
        self.storage.clear_nodes()
    }

    /// # Errors
    /// Propagates storage failures.
    pub fn total_ranked_scores(&self) -> Result<i64, RankerError> {
        Ok(self
            .storage
            .load_node(NodeId::ROOT)?
            .map_or(0, |counts| counts.iter().sum()))
    }

    /// Returns the score at 0-based `rank` in ascending order.
    ///
    /// # Errors
    /// Returns [`RankerError::Validation`] when `rank` is outside
    /// `[0, total_ranked_scores())`.
    pub fn find_score(&self, rank: i64) -> Result<i64, RankerError> {
        let total = self.total_ranked_scores()?;
        if rank < 0 || rank >= total {
            return Err(RankerError::Validation(format!(
                "rank {rank} out of range for {total} ranked scores"
            )));
        }

        let mut remaining = rank;
        let mut position = 0_u64;
        for level in 0..self.depth {
            let node = NodeId { level, position };
            let counts = self.storage.load_node(node)?.ok_or_else(|| {
                RankerError::Storage(format!(
                    "missing tree node level={level} position={position}"
                ))
            })?;

            let mut chosen = None;
            for (child, count) in counts.iter().enumerate() {
                if remaining < *count {
                    chosen = Some(child);
                    break;
                }
                remaining -= count;
            }
            let child = chosen.ok_or_else(|| {
                RankerError::Storage(format!(
                    "tree node level={level} position={position} undercounts its parent"
                ))
            })?;
            position = position * self.branching_factor + child as u64;
        }

        let score = i128::from(self.min_value) + i128::from(position);
        i64::try_from(score)
            .map_err(|_| RankerError::Storage(format!("score offset {position} overflows")))
    }

    /// Median at rank `total / 2`, or `None` for an empty ranker.
    ///
    /// # Errors
    /// Propagates storage failures.
    pub fn median(&self) -> Result<Option<i64>, RankerError> {
        let total = self.total_ranked_scores()?;
        if total == 0 {
            return Ok(None);
        }
        self.find_score(total / 2).map(Some)
    }

    fn offset(&self, score: i64) -> Result<u64, RankerError> {
        if score < self.min_value || score > self.max_value {
            return Err(RankerError::Validation(format!(
                "score {score} outside ranker domain [{}, {}]",
                self.min_value, self.max_value
            )));
        }
        u64::try_from(i128::from(score) - i128::from(self.min_value))
            .map_err(|_| RankerError::Validation(format!("score {score} offset overflows")))
    }

    #[allow(clippy::cast_possible_truncation)]
    fn apply(&mut self, changes: &[(i64, i64)]) -> Result<(), RankerError> {
        let offsets = changes
            .iter()
            .map(|(score, delta)| self.offset(*score).map(|offset| (offset, *delta)))
            .collect::<Result<Vec<_>, _>>()?;

        let factor = u128::from(self.branching_factor);
        let width = self.branching_factor as usize;
        let mut touched: BTreeMap<NodeId, Vec<i64>> = BTreeMap::new();

        for (offset, delta) in offsets {
            let offset = u128::from(offset);
            for level in 0..self.depth {
                let child_span = factor.pow(self.depth - level - 1);
                let node = NodeId {
                    level,
                    position: (offset / (child_span * factor)) as u64,
                };
                let child = ((offset / child_span) % factor) as usize;

                let counts = match touched.entry(node) {
                    Entry::Occupied(entry) => entry.into_mut(),
                    Entry::Vacant(entry) => entry.insert(
                        self.storage
                            .load_node(node)?
                            .unwrap_or_else(|| vec![0; width]),
                    ),
                };
                counts[child] += delta;
                if counts[child] < 0 {
                    return Err(RankerError::Validation(format!(
                        "score {} is not ranked",
                        i128::from(self.min_value) + offset as i128
                    )));
                }
            }
        }

        if touched.is_empty() {
            return Ok(());
        }
        self.storage.store_nodes(&touched)
    }
}
