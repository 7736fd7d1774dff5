//! Persistence seams used by the rebuild pipeline and the live path.

use time::OffsetDateTime;
use ulid::Ulid;

use crate::catalog::TestDefinition;
use crate::group::{Cursor, MeasurementGroup, ScanPage};
use crate::key::{RankerKey, RankerRecord, RankerVersion};
use crate::RankerError;

/// Keyed, versioned catalog of rankers.
///
/// Mutating a `current` ranker invalidates its cache entry. Operations on a
/// missing record fail with [`RankerError::Validation`], except
/// [`RankerStore::get_or_create`] and the `bool`-returning sweeps.
pub trait RankerStore {
    /// Finds the record for `(key, version)` or creates an empty one shaped by
    /// `test`. A concurrent create of the same pair converges on one record.
    ///
    /// # Errors
    /// Returns [`RankerError::Storage`] on backend failure.
    fn get_or_create(
        &mut self,
        key: &RankerKey,
        version: RankerVersion,
        test: &TestDefinition,
    ) -> Result<RankerRecord, RankerError>;

    /// # Errors
    /// Returns [`RankerError::Storage`] on backend failure.
    fn find(
        &self,
        key: &RankerKey,
        version: RankerVersion,
    ) -> Result<Option<RankerRecord>, RankerError>;

    /// Inserts every score in one write.
    ///
    /// # Errors
    /// Returns [`RankerError::Validation`] for out-of-domain scores or a missing
    /// record, [`RankerError::Storage`] on backend failure.
    fn update(
        &mut self,
        key: &RankerKey,
        version: RankerVersion,
        scores: &[i64],
    ) -> Result<(), RankerError>;

    /// # Errors
    /// See [`RankerStore::update`].
    fn add(&mut self, key: &RankerKey, version: RankerVersion, score: i64)
        -> Result<(), RankerError>;

    /// # Errors
    /// Returns [`RankerError::Validation`] when the score is not present.
    fn remove(
        &mut self,
        key: &RankerKey,
        version: RankerVersion,
        score: i64,
    ) -> Result<(), RankerError>;

    /// # Errors
    /// Returns [`RankerError::Validation`] when `rank` is outside `[0, total)`.
    fn find_score(
        &self,
        key: &RankerKey,
        version: RankerVersion,
        rank: i64,
    ) -> Result<i64, RankerError>;

    /// # Errors
    /// Returns [`RankerError::Validation`] for a missing record.
    fn total_ranked_scores(&self, key: &RankerKey, version: RankerVersion)
        -> Result<i64, RankerError>;

    /// Empties the tree and keeps the record.
    ///
    /// # Errors
    /// Returns [`RankerError::Validation`] for a missing record.
    fn reset(&mut self, key: &RankerKey, version: RankerVersion) -> Result<(), RankerError>;

    /// Replaces `current` with `next` atomically. `false` when no `next` exists.
    ///
    /// # Errors
    /// Returns [`RankerError::Storage`] on backend failure.
    fn publish(&mut self, key: &RankerKey) -> Result<bool, RankerError>;

    /// Drops `next` without touching `current`. `false` when no `next` exists.
    ///
    /// # Errors
    /// Returns [`RankerError::Storage`] on backend failure.
    fn discard(&mut self, key: &RankerKey) -> Result<bool, RankerError>;

    /// First `page_size` keys that have a `next` record, in key order, and
    /// whether more exist.
    ///
    /// # Errors
    /// Returns [`RankerError::Storage`] on backend failure.
    fn list_next_version_keys(
        &self,
        page_size: usize,
    ) -> Result<(Vec<RankerKey>, bool), RankerError>;
}

/// Ordered, resumable reader over stored measurement groups.
pub trait ResultScanner {
    /// Groups of `category` strictly after `cursor`, ordered by
    /// `(user_agent_pretty, group_id)`.
    ///
    /// # Errors
    /// Returns [`RankerError::Storage`] on backend failure.
    fn fetch(
        &self,
        category: &str,
        page_size: usize,
        cursor: Option<&Cursor>,
    ) -> Result<ScanPage, RankerError>;

    /// Groups still holding dirty score records, oldest first.
    ///
    /// # Errors
    /// Returns [`RankerError::Storage`] on backend failure.
    fn fetch_dirty(&self, limit: usize) -> Result<Vec<MeasurementGroup>, RankerError>;

    /// # Errors
    /// Returns [`RankerError::Storage`] on backend failure.
    fn mark_clean(&mut self, group_id: Ulid) -> Result<(), RankerError>;
}

/// Durable control flags shared across chunk invocations.
pub trait ControlStore {
    /// # Errors
    /// Returns [`RankerError::Storage`] on backend failure.
    fn is_paused(&self) -> Result<bool, RankerError>;

    /// # Errors
    /// Returns [`RankerError::Storage`] on backend failure.
    fn set_paused(&mut self, paused: bool) -> Result<(), RankerError>;

    /// # Errors
    /// Returns [`RankerError::Storage`] on backend failure.
    fn mark_migration_complete(&mut self, at: OffsetDateTime) -> Result<(), RankerError>;

    /// # Errors
    /// Returns [`RankerError::Storage`] on backend failure.
    fn migration_completed_at(&self) -> Result<Option<OffsetDateTime>, RankerError>;
}

/// Proof that the pause gate was set before `next` rankers are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RebuildLease {
    acquired_at: OffsetDateTime,
}

impl RebuildLease {
    /// Sets the pause gate. Re-acquiring while paused is allowed, so every
    /// chunk of a resumed rebuild can take its own lease.
    ///
    /// # Errors
    /// Returns [`RankerError::Storage`] when the flag cannot be written.
    pub fn acquire<C: ControlStore + ?Sized>(control: &mut C) -> Result<Self, RankerError> {
        control.set_paused(true)?;
        Ok(Self {
            acquired_at: crate::now_utc(),
        })
    }

    #[must_use]
    pub fn acquired_at(&self) -> OffsetDateTime {
        self.acquired_at
    }
}
