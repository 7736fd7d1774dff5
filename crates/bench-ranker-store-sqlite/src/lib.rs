#![allow(clippy::missing_errors_doc)]

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use bench_ranker_core::{
    format_rfc3339, now_utc, parse_rfc3339_utc, ControlStore, Cursor, MeasurementGroup,
    MeasurementGroupInput, NodeId, NodeStore, NoopRankerCache, ParamSignature, RankerCache,
    RankerError, RankerKey, RankerRecord, RankerStore, RankerSummary, RankerVersion,
    ResultScanner, ScanPage, ScoreRanker, ScoreRecord, TestDefinition,
};
use rusqlite::{params, Connection, OptionalExtension};
use time::OffsetDateTime;
use tracing::debug;
use ulid::Ulid;

const RANKER_MIGRATION_VERSION: i64 = 1;
const CONTROL_PAUSED: &str = "rebuild_paused";
const CONTROL_MIGRATION_COMPLETED_AT: &str = "migration_completed_at";

const SCHEMA_RANKER_V1: &str = r"
CREATE TABLE IF NOT EXISTS ranker_records (
  record_id TEXT PRIMARY KEY,
  category TEXT NOT NULL,
  test_key TEXT NOT NULL,
  user_agent_version TEXT NOT NULL,
  params_str TEXT NOT NULL DEFAULT '',
  ranker_version TEXT NOT NULL CHECK (ranker_version IN ('current', 'next')),
  min_value INTEGER NOT NULL,
  max_value INTEGER NOT NULL CHECK (max_value >= min_value),
  branching_factor INTEGER NOT NULL CHECK (branching_factor >= 2),
  created_at TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_ranker_records_key_version
  ON ranker_records(category, test_key, user_agent_version, params_str, ranker_version);
CREATE INDEX IF NOT EXISTS idx_ranker_records_version_key
  ON ranker_records(ranker_version, category, test_key, user_agent_version, params_str);

CREATE TABLE IF NOT EXISTS ranker_nodes (
  record_id TEXT NOT NULL,
  level INTEGER NOT NULL CHECK (level >= 0),
  position INTEGER NOT NULL CHECK (position >= 0),
  child_counts TEXT NOT NULL,
  PRIMARY KEY (record_id, level, position),
  FOREIGN KEY (record_id) REFERENCES ranker_records(record_id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS result_parents (
  group_id TEXT PRIMARY KEY,
  category TEXT NOT NULL,
  user_agent_pretty TEXT NOT NULL,
  params_str TEXT NOT NULL DEFAULT '',
  created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_result_parents_scan
  ON result_parents(category, user_agent_pretty, group_id);

CREATE TABLE IF NOT EXISTS result_times (
  group_id TEXT NOT NULL,
  test_key TEXT NOT NULL,
  score INTEGER NOT NULL,
  dirty INTEGER NOT NULL DEFAULT 1 CHECK (dirty IN (0, 1)),
  PRIMARY KEY (group_id, test_key),
  FOREIGN KEY (group_id) REFERENCES result_parents(group_id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_result_times_dirty
  ON result_times(dirty, group_id);

CREATE TABLE IF NOT EXISTS ranker_control (
  name TEXT PRIMARY KEY,
  value TEXT NOT NULL,
  updated_at TEXT NOT NULL
);
";

/// SQLite-backed ranker catalog, result scanner and control flags.
pub struct SqliteRankerStore {
    conn: Connection,
    cache: Arc<dyn RankerCache>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct RankerStatus {
    pub paused: bool,
    pub migration_completed_at: Option<String>,
    pub current_rankers: usize,
    pub next_rankers: usize,
    pub result_groups: usize,
    pub dirty_scores: usize,
}

/// Tree nodes of one ranker record, read and written through `conn`.
struct SqliteNodeStore<'a> {
    conn: &'a Connection,
    record_id: Ulid,
}

impl NodeStore for SqliteNodeStore<'_> {
    fn load_node(&self, node: NodeId) -> Result<Option<Vec<i64>>, RankerError> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT child_counts FROM ranker_nodes
                 WHERE record_id = ?1 AND level = ?2 AND position = ?3",
                params![
                    self.record_id.to_string(),
                    i64::from(node.level),
                    position_to_sql(node.position)?
                ],
                |row| row.get(0),
            )
            .optional()
            .map_err(|err| RankerError::Storage(format!("failed to load ranker node: {err}")))?;

        raw.map(|json| {
            serde_json::from_str(&json).map_err(|err| {
                RankerError::Storage(format!("invalid stored child_counts JSON: {err}"))
            })
        })
        .transpose()
    }

    fn store_nodes(&mut self, nodes: &BTreeMap<NodeId, Vec<i64>>) -> Result<(), RankerError> {
        let mut stmt = self
            .conn
            .prepare_cached(
                "INSERT INTO ranker_nodes(record_id, level, position, child_counts)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(record_id, level, position) DO UPDATE SET
                   child_counts = excluded.child_counts",
            )
            .map_err(|err| RankerError::Storage(format!("failed to prepare node write: {err}")))?;

        for (node, counts) in nodes {
            let payload = serde_json::to_string(counts).map_err(|err| {
                RankerError::Storage(format!("failed to serialize child_counts: {err}"))
            })?;
            stmt.execute(params![
                self.record_id.to_string(),
                i64::from(node.level),
                position_to_sql(node.position)?,
                payload
            ])
            .map_err(|err| RankerError::Storage(format!("failed to write ranker node: {err}")))?;
        }
        Ok(())
    }

    fn clear_nodes(&mut self) -> Result<(), RankerError> {
        self.conn
            .execute(
                "DELETE FROM ranker_nodes WHERE record_id = ?1",
                params![self.record_id.to_string()],
            )
            .map_err(|err| RankerError::Storage(format!("failed to clear ranker nodes: {err}")))?;
        Ok(())
    }
}

impl SqliteRankerStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self {
            conn,
            cache: Arc::new(NoopRankerCache),
        })
    }

    /// Replaces the summary cache; the default never hits.
    #[must_use]
    pub fn with_cache(mut self, cache: Arc<dyn RankerCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_RANKER_V1)
            .context("failed to apply ranker schema")?;

        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![RANKER_MIGRATION_VERSION, now],
            )
            .context("failed to register ranker schema migration")?;

        Ok(())
    }

    /// Stores a measurement group; every score starts dirty.
    pub fn insert_group(&mut self, input: &MeasurementGroupInput) -> Result<MeasurementGroup> {
        input
            .validate()
            .context("measurement group validation failed")?;

        let group_id = input.group_id.unwrap_or_else(Ulid::new);
        let created_at = now_utc();

        let tx = self
            .conn
            .transaction()
            .context("failed to start result transaction")?;

        tx.execute(
            "INSERT INTO result_parents(group_id, category, user_agent_pretty, params_str, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                group_id.to_string(),
                input.category,
                input.user_agent_pretty,
                input.params.as_str(),
                format_rfc3339(created_at).map_err(|err| anyhow!(err.to_string()))?,
            ],
        )
        .context("failed to insert result parent")?;

        for (test_key, score) in &input.scores {
            tx.execute(
                "INSERT INTO result_times(group_id, test_key, score, dirty) VALUES (?1, ?2, ?3, 1)",
                params![group_id.to_string(), test_key, score],
            )
            .with_context(|| format!("failed to insert result time for {test_key}"))?;
        }

        tx.commit().context("failed to commit result transaction")?;

        let mut scores = input
            .scores
            .iter()
            .map(|(test_key, score)| ScoreRecord {
                test_key: test_key.clone(),
                score: *score,
                dirty: true,
            })
            .collect::<Vec<_>>();
        scores.sort_by(|lhs, rhs| lhs.test_key.cmp(&rhs.test_key));

        Ok(MeasurementGroup {
            group_id,
            category: input.category.clone(),
            user_agent_pretty: input.user_agent_pretty.clone(),
            params: input.params.clone(),
            created_at,
            scores,
        })
    }

    /// Total and median of the `current` ranker, served from the cache when
    /// possible. A key without a ranker reports zero scores.
    pub fn ranker_summary(&self, key: &RankerKey) -> Result<RankerSummary> {
        let cache_name = key.cache_name();
        if let Some(summary) = self.cache.get(&cache_name) {
            return Ok(summary);
        }
        let summary = self.summary_for(key, RankerVersion::Current)?;
        self.cache.put(&cache_name, summary);
        Ok(summary)
    }

    /// Uncached summary of either version.
    pub fn summary_for(&self, key: &RankerKey, version: RankerVersion) -> Result<RankerSummary> {
        let Some(record) = find_record(&self.conn, key, version)? else {
            return Ok(RankerSummary {
                total_ranked_scores: 0,
                median: None,
            });
        };
        let ranker = ScoreRanker::for_record(node_store(&self.conn, &record), &record)?;
        Ok(RankerSummary {
            total_ranked_scores: ranker.total_ranked_scores()?,
            median: ranker.median()?,
        })
    }

    pub fn status(&self) -> Result<RankerStatus> {
        Ok(RankerStatus {
            paused: self.paused()?,
            migration_completed_at: self
                .control_value(CONTROL_MIGRATION_COMPLETED_AT)?,
            current_rankers: self.count(
                "SELECT COUNT(*) FROM ranker_records WHERE ranker_version = 'current'",
            )?,
            next_rankers: self
                .count("SELECT COUNT(*) FROM ranker_records WHERE ranker_version = 'next'")?,
            result_groups: self.count("SELECT COUNT(*) FROM result_parents")?,
            dirty_scores: self.count("SELECT COUNT(*) FROM result_times WHERE dirty = 1")?,
        })
    }

    fn count(&self, sql: &str) -> Result<usize> {
        let value: i64 = self
            .conn
            .query_row(sql, [], |row| row.get(0))
            .with_context(|| format!("failed to count rows: {sql}"))?;
        usize::try_from(value).with_context(|| format!("invalid row count: {value}"))
    }

    fn create_record(
        &self,
        key: &RankerKey,
        version: RankerVersion,
        test: &TestDefinition,
    ) -> Result<RankerRecord> {
        let branching_factor =
            bench_ranker_core::shallow_branching_factor(test.min_value, test.max_value);
        let record_id = Ulid::new();
        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;

        let inserted = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO ranker_records(
                    record_id, category, test_key, user_agent_version, params_str,
                    ranker_version, min_value, max_value, branching_factor, created_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    record_id.to_string(),
                    key.category,
                    key.test_key,
                    key.user_agent_version,
                    key.params.as_str(),
                    version.as_str(),
                    test.min_value,
                    test.max_value,
                    i64::from(branching_factor),
                    now,
                ],
            )
            .with_context(|| format!("failed to create {} ranker for {key}", version.as_str()))?;
        if inserted > 0 {
            debug!(ranker = %key, version = version.as_str(), branching_factor, "created ranker");
        }

        find_record(&self.conn, key, version)?
            .ok_or_else(|| anyhow!("ranker for {key} vanished after creation"))
    }

    fn with_ranker<T>(
        &mut self,
        key: &RankerKey,
        version: RankerVersion,
        apply: impl FnOnce(&mut ScoreRanker<SqliteNodeStore<'_>>) -> Result<T, RankerError>,
    ) -> Result<T> {
        let tx = self
            .conn
            .transaction()
            .context("failed to start ranker transaction")?;
        let value = {
            let record = find_record(&tx, key, version)?.ok_or_else(|| missing(key, version))?;
            let mut ranker = ScoreRanker::for_record(node_store(&tx, &record), &record)?;
            apply(&mut ranker)?
        };
        tx.commit().context("failed to commit ranker transaction")?;

        if version == RankerVersion::Current {
            self.cache.invalidate(&key.cache_name());
        }
        Ok(value)
    }

    fn read_ranker<T>(
        &self,
        key: &RankerKey,
        version: RankerVersion,
        read: impl FnOnce(&ScoreRanker<SqliteNodeStore<'_>>) -> Result<T, RankerError>,
    ) -> Result<T> {
        let record = find_record(&self.conn, key, version)?.ok_or_else(|| missing(key, version))?;
        let ranker = ScoreRanker::for_record(node_store(&self.conn, &record), &record)?;
        Ok(read(&ranker)?)
    }

    fn publish_next(&mut self, key: &RankerKey) -> Result<bool> {
        let tx = self
            .conn
            .transaction()
            .context("failed to start publish transaction")?;

        let Some(next) = find_record(&tx, key, RankerVersion::Next)? else {
            return Ok(false);
        };
        if let Some(current) = find_record(&tx, key, RankerVersion::Current)? {
            tx.execute(
                "DELETE FROM ranker_records WHERE record_id = ?1",
                params![current.record_id.to_string()],
            )
            .with_context(|| format!("failed to delete current ranker for {key}"))?;
        }
        tx.execute(
            "UPDATE ranker_records SET ranker_version = 'current' WHERE record_id = ?1",
            params![next.record_id.to_string()],
        )
        .with_context(|| format!("failed to promote next ranker for {key}"))?;
        tx.commit().context("failed to commit publish transaction")?;

        self.cache.invalidate(&key.cache_name());
        Ok(true)
    }

    fn discard_next(&mut self, key: &RankerKey) -> Result<bool> {
        let deleted = self
            .conn
            .execute(
                "DELETE FROM ranker_records
                 WHERE category = ?1 AND test_key = ?2 AND user_agent_version = ?3
                   AND params_str = ?4 AND ranker_version = 'next'",
                params![
                    key.category,
                    key.test_key,
                    key.user_agent_version,
                    key.params.as_str()
                ],
            )
            .with_context(|| format!("failed to discard next ranker for {key}"))?;
        Ok(deleted > 0)
    }

    fn next_version_keys(&self, page_size: usize) -> Result<(Vec<RankerKey>, bool)> {
        let mut stmt = self.conn.prepare(
            "SELECT category, test_key, user_agent_version, params_str
             FROM ranker_records
             WHERE ranker_version = 'next'
             ORDER BY category, test_key, user_agent_version, params_str
             LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit_to_sql(page_size.saturating_add(1))?], |row| {
            let params_raw: String = row.get(3)?;
            Ok(RankerKey::new(
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                ParamSignature::from_canonical(&params_raw),
            ))
        })?;
        let mut keys = collect_rows(rows)?;
        let has_more = keys.len() > page_size;
        keys.truncate(page_size);
        Ok((keys, has_more))
    }

    fn scan(
        &self,
        category: &str,
        page_size: usize,
        cursor: Option<&Cursor>,
    ) -> Result<ScanPage> {
        let mut stmt = self.conn.prepare(
            "SELECT group_id, category, user_agent_pretty, params_str, created_at
             FROM result_parents
             WHERE category = ?1
               AND (?2 IS NULL
                    OR user_agent_pretty > ?2
                    OR (user_agent_pretty = ?2 AND group_id > ?3))
             ORDER BY user_agent_pretty ASC, group_id ASC
             LIMIT ?4",
        )?;
        let rows = stmt.query_map(
            params![
                category,
                cursor.map(|cursor| cursor.user_agent_pretty.as_str()),
                cursor.map(|cursor| cursor.group_id.to_string()),
                limit_to_sql(page_size.saturating_add(1))?,
            ],
            parse_group_row,
        )?;
        let mut groups = collect_rows(rows)?;

        let has_more = groups.len() > page_size;
        groups.truncate(page_size);
        for group in &mut groups {
            group.scores = self.load_scores(group.group_id)?;
        }
        let next_cursor = if has_more {
            groups.last().map(Cursor::after)
        } else {
            None
        };
        Ok(ScanPage {
            groups,
            next_cursor,
        })
    }

    fn dirty_groups(&self, limit: usize) -> Result<Vec<MeasurementGroup>> {
        let mut stmt = self.conn.prepare(
            "SELECT p.group_id, p.category, p.user_agent_pretty, p.params_str, p.created_at
             FROM result_parents p
             WHERE EXISTS (
               SELECT 1 FROM result_times t WHERE t.group_id = p.group_id AND t.dirty = 1
             )
             ORDER BY p.created_at ASC, p.group_id ASC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit_to_sql(limit)?], parse_group_row)?;
        let mut groups = collect_rows(rows)?;
        for group in &mut groups {
            group.scores = self.load_scores(group.group_id)?;
        }
        Ok(groups)
    }

    fn load_scores(&self, group_id: Ulid) -> Result<Vec<ScoreRecord>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT test_key, score, dirty FROM result_times WHERE group_id = ?1 ORDER BY test_key",
        )?;
        let rows = stmt.query_map(params![group_id.to_string()], |row| {
            Ok(ScoreRecord {
                test_key: row.get(0)?,
                score: row.get(1)?,
                dirty: row.get::<_, i64>(2)? != 0,
            })
        })?;
        collect_rows(rows)
    }

    fn clean_group(&self, group_id: Ulid) -> Result<()> {
        self.conn
            .execute(
                "UPDATE result_times SET dirty = 0 WHERE group_id = ?1",
                params![group_id.to_string()],
            )
            .with_context(|| format!("failed to mark group {group_id} clean"))?;
        Ok(())
    }

    fn paused(&self) -> Result<bool> {
        Ok(self.control_value(CONTROL_PAUSED)?.as_deref() == Some("1"))
    }

    fn control_value(&self, name: &str) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT value FROM ranker_control WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("failed to read control flag {name}"))
    }

    fn set_control_value(&self, name: &str, value: &str) -> Result<()> {
        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        self.conn
            .execute(
                "INSERT INTO ranker_control(name, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(name) DO UPDATE SET
                   value = excluded.value,
                   updated_at = excluded.updated_at",
                params![name, value, now],
            )
            .with_context(|| format!("failed to write control flag {name}"))?;
        Ok(())
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl RankerStore for SqliteRankerStore {
    fn get_or_create(
        &mut self,
        key: &RankerKey,
        version: RankerVersion,
        test: &TestDefinition,
    ) -> Result<RankerRecord, RankerError> {
        match find_record(&self.conn, key, version).map_err(into_ranker_error)? {
            Some(record) => Ok(record),
            None => self
                .create_record(key, version, test)
                .map_err(into_ranker_error),
        }
    }

    fn find(
        &self,
        key: &RankerKey,
        version: RankerVersion,
    ) -> Result<Option<RankerRecord>, RankerError> {
        find_record(&self.conn, key, version).map_err(into_ranker_error)
    }

    fn update(
        &mut self,
        key: &RankerKey,
        version: RankerVersion,
        scores: &[i64],
    ) -> Result<(), RankerError> {
        self.with_ranker(key, version, |ranker| ranker.update(scores))
            .map_err(into_ranker_error)
    }

    fn add(
        &mut self,
        key: &RankerKey,
        version: RankerVersion,
        score: i64,
    ) -> Result<(), RankerError> {
        self.with_ranker(key, version, |ranker| ranker.add(score))
            .map_err(into_ranker_error)
    }

    fn remove(
        &mut self,
        key: &RankerKey,
        version: RankerVersion,
        score: i64,
    ) -> Result<(), RankerError> {
        self.with_ranker(key, version, |ranker| ranker.remove(score))
            .map_err(into_ranker_error)
    }

    fn find_score(
        &self,
        key: &RankerKey,
        version: RankerVersion,
        rank: i64,
    ) -> Result<i64, RankerError> {
        self.read_ranker(key, version, |ranker| ranker.find_score(rank))
            .map_err(into_ranker_error)
    }

    fn total_ranked_scores(
        &self,
        key: &RankerKey,
        version: RankerVersion,
    ) -> Result<i64, RankerError> {
        self.read_ranker(key, version, |ranker| ranker.total_ranked_scores())
            .map_err(into_ranker_error)
    }

    fn reset(&mut self, key: &RankerKey, version: RankerVersion) -> Result<(), RankerError> {
        self.with_ranker(key, version, |ranker| ranker.reset())
            .map_err(into_ranker_error)
    }

    fn publish(&mut self, key: &RankerKey) -> Result<bool, RankerError> {
        self.publish_next(key).map_err(into_ranker_error)
    }

    fn discard(&mut self, key: &RankerKey) -> Result<bool, RankerError> {
        self.discard_next(key).map_err(into_ranker_error)
    }

    fn list_next_version_keys(
        &self,
        page_size: usize,
    ) -> Result<(Vec<RankerKey>, bool), RankerError> {
        self.next_version_keys(page_size).map_err(into_ranker_error)
    }
}

impl ResultScanner for SqliteRankerStore {
    fn fetch(
        &self,
        category: &str,
        page_size: usize,
        cursor: Option<&Cursor>,
    ) -> Result<ScanPage, RankerError> {
        self.scan(category, page_size, cursor)
            .map_err(into_ranker_error)
    }

    fn fetch_dirty(&self, limit: usize) -> Result<Vec<MeasurementGroup>, RankerError> {
        self.dirty_groups(limit).map_err(into_ranker_error)
    }

    fn mark_clean(&mut self, group_id: Ulid) -> Result<(), RankerError> {
        self.clean_group(group_id).map_err(into_ranker_error)
    }
}

impl ControlStore for SqliteRankerStore {
    fn is_paused(&self) -> Result<bool, RankerError> {
        self.paused().map_err(into_ranker_error)
    }

    fn set_paused(&mut self, paused: bool) -> Result<(), RankerError> {
        self.set_control_value(CONTROL_PAUSED, if paused { "1" } else { "0" })
            .map_err(into_ranker_error)
    }

    fn mark_migration_complete(&mut self, at: OffsetDateTime) -> Result<(), RankerError> {
        let value = format_rfc3339(at)?;
        self.set_control_value(CONTROL_MIGRATION_COMPLETED_AT, &value)
            .map_err(into_ranker_error)
    }

    fn migration_completed_at(&self) -> Result<Option<OffsetDateTime>, RankerError> {
        self.control_value(CONTROL_MIGRATION_COMPLETED_AT)
            .map_err(into_ranker_error)?
            .map(|raw| parse_rfc3339_utc(&raw))
            .transpose()
    }
}

fn find_record(
    conn: &Connection,
    key: &RankerKey,
    version: RankerVersion,
) -> Result<Option<RankerRecord>> {
    conn.query_row(
        "SELECT record_id, category, test_key, user_agent_version, params_str,
                ranker_version, min_value, max_value, branching_factor, created_at
         FROM ranker_records
         WHERE category = ?1 AND test_key = ?2 AND user_agent_version = ?3
           AND params_str = ?4 AND ranker_version = ?5",
        params![
            key.category,
            key.test_key,
            key.user_agent_version,
            key.params.as_str(),
            version.as_str()
        ],
        parse_record_row,
    )
    .optional()
    .with_context(|| format!("failed to load {} ranker for {key}", version.as_str()))
}

fn node_store<'a>(conn: &'a Connection, record: &RankerRecord) -> SqliteNodeStore<'a> {
    SqliteNodeStore {
        conn,
        record_id: record.record_id,
    }
}

fn parse_record_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RankerRecord> {
    let record_id_raw: String = row.get(0)?;
    let params_raw: String = row.get(4)?;
    let version_raw: String = row.get(5)?;
    let branching_factor_raw: i64 = row.get(8)?;
    let created_at_raw: String = row.get(9)?;

    let record_id = Ulid::from_string(&record_id_raw)
        .map_err(|_| conversion_error(0, format!("invalid ULID record_id: {record_id_raw}")))?;
    let version = RankerVersion::parse(&version_raw)
        .ok_or_else(|| conversion_error(5, format!("invalid ranker_version: {version_raw}")))?;
    let branching_factor = u32::try_from(branching_factor_raw).map_err(|_| {
        conversion_error(8, format!("invalid branching_factor: {branching_factor_raw}"))
    })?;
    let created_at =
        parse_rfc3339_utc(&created_at_raw).map_err(|err| conversion_error(9, err.to_string()))?;

    Ok(RankerRecord {
        record_id,
        key: RankerKey::new(
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            ParamSignature::from_canonical(&params_raw),
        ),
        version,
        min_value: row.get(6)?,
        max_value: row.get(7)?,
        branching_factor,
        created_at,
    })
}

fn parse_group_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MeasurementGroup> {
    let group_id_raw: String = row.get(0)?;
    let params_raw: String = row.get(3)?;
    let created_at_raw: String = row.get(4)?;

    let group_id = Ulid::from_string(&group_id_raw)
        .map_err(|_| conversion_error(0, format!("invalid ULID group_id: {group_id_raw}")))?;
    let created_at =
        parse_rfc3339_utc(&created_at_raw).map_err(|err| conversion_error(4, err.to_string()))?;

    Ok(MeasurementGroup {
        group_id,
        category: row.get(1)?,
        user_agent_pretty: row.get(2)?,
        params: ParamSignature::from_canonical(&params_raw),
        created_at,
        scores: Vec::new(),
    })
}

fn conversion_error(index: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            message,
        )),
    )
}

fn position_to_sql(position: u64) -> Result<i64, RankerError> {
    i64::try_from(position)
        .map_err(|_| RankerError::Storage(format!("node position {position} overflows i64")))
}

fn limit_to_sql(limit: usize) -> Result<i64> {
    i64::try_from(limit).with_context(|| format!("page size {limit} overflows i64"))
}

fn missing(key: &RankerKey, version: RankerVersion) -> RankerError {
    RankerError::Validation(format!("no {} ranker for {key}", version.as_str()))
}

/// Keeps a wrapped [`RankerError`] intact and folds everything else into
/// [`RankerError::Storage`].
fn into_ranker_error(err: anyhow::Error) -> RankerError {
    match err.downcast::<RankerError>() {
        Ok(err) => err,
        Err(err) => RankerError::Storage(format!("{err:#}")),
    }
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}
