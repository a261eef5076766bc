// src/store/sqlite.rs
//! SQLite-backed [`Store`]. Timestamps are stored as epoch milliseconds.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;

use super::memory::window_entry;
use super::Store;
use crate::error::StoreError;
use crate::ingest::state::FeedState;
use crate::ingest::types::{FeedId, RawItem};
use crate::models::{
    AiAnalysis, AnalysisStatus, AnalyzedItem, DedupDecision, ItemId, Publication,
    PublishCandidate, StoredItem, WindowEntry,
};

const ITEM_COLS: &str = "i.id AS i_id, i.item_json, i.created_at AS i_created_at";
const ANALYSIS_COLS: &str = "a.item_id AS a_item_id, a.status, a.language, a.importance, \
     a.category, a.summary, a.model, a.attempts, a.error, a.updated_at";
const DECISION_COLS: &str = "d.item_id AS d_item_id, d.compared_with, d.matched_item, \
     d.similarity, d.can_be_publish, d.group_key, d.reason, d.decided_at";

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if needed) the database file and apply migrations.
    pub async fn connect(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("opening {}", path.display()))?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Private in-memory database; a single connection so every query sees the same data.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Idempotent schema setup.
    pub async fn migrate(&self) -> Result<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS feed_state (
                feed_id INTEGER PRIMARY KEY,
                etag TEXT,
                last_modified TEXT,
                last_status INTEGER NOT NULL DEFAULT 0,
                error_count INTEGER NOT NULL DEFAULT 0,
                backoff_until INTEGER,
                fetched_at INTEGER
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS items (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                content_hash TEXT NOT NULL UNIQUE,
                feed_id INTEGER NOT NULL,
                item_json TEXT NOT NULL,
                created_at INTEGER NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS ai_analysis (
                item_id INTEGER PRIMARY KEY REFERENCES items(id),
                status TEXT NOT NULL,
                language TEXT,
                importance INTEGER,
                category TEXT,
                summary TEXT,
                model TEXT,
                attempts INTEGER NOT NULL DEFAULT 0,
                error TEXT,
                updated_at INTEGER NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS dedup_decisions (
                item_id INTEGER PRIMARY KEY REFERENCES items(id),
                compared_with TEXT NOT NULL DEFAULT '[]',
                matched_item INTEGER,
                similarity INTEGER NOT NULL,
                can_be_publish INTEGER NOT NULL,
                group_key TEXT NOT NULL,
                reason TEXT NOT NULL DEFAULT '',
                decided_at INTEGER NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS dedup_failures (
                item_id INTEGER PRIMARY KEY REFERENCES items(id),
                failures INTEGER NOT NULL,
                last_failed_at INTEGER NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS publications (
                group_key TEXT PRIMARY KEY,
                item_id INTEGER NOT NULL,
                reserved_at INTEGER NOT NULL,
                published_at INTEGER,
                message_id TEXT
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_analysis_status ON ai_analysis(status, updated_at)",
            "CREATE INDEX IF NOT EXISTS idx_decisions_decided_at ON dedup_decisions(decided_at DESC)",
            "CREATE INDEX IF NOT EXISTS idx_decisions_group_key ON dedup_decisions(group_key)",
        ];
        for sql in statements {
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .context("applying migrations")?;
        }
        Ok(())
    }
}

fn to_ms(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_ms(ms: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::Other(format!("timestamp out of range: {ms}")))
}

fn opt_from_ms(ms: Option<i64>) -> Result<Option<DateTime<Utc>>, StoreError> {
    ms.map(from_ms).transpose()
}

fn feed_state_from_row(row: &SqliteRow) -> Result<FeedState, StoreError> {
    Ok(FeedState {
        feed_id: row.try_get("feed_id")?,
        etag: row.try_get("etag")?,
        last_modified: row.try_get("last_modified")?,
        last_status: row.try_get::<i64, _>("last_status")? as u16,
        error_count: row.try_get::<i64, _>("error_count")? as u32,
        backoff_until: opt_from_ms(row.try_get("backoff_until")?)?,
        fetched_at: opt_from_ms(row.try_get("fetched_at")?)?,
    })
}

fn item_from_row(row: &SqliteRow) -> Result<StoredItem, StoreError> {
    let json: String = row.try_get("item_json")?;
    Ok(StoredItem {
        id: row.try_get("i_id")?,
        item: serde_json::from_str(&json)?,
        created_at: from_ms(row.try_get("i_created_at")?)?,
    })
}

/// `None` when the analysis side of a LEFT JOIN is empty.
fn analysis_from_row(row: &SqliteRow) -> Result<Option<AiAnalysis>, StoreError> {
    let Some(item_id) = row.try_get::<Option<i64>, _>("a_item_id")? else {
        return Ok(None);
    };
    let status: String = row.try_get("status")?;
    let status = AnalysisStatus::parse(&status)
        .ok_or_else(|| StoreError::Other(format!("unknown analysis status {status:?}")))?;
    Ok(Some(AiAnalysis {
        item_id,
        status,
        language: row.try_get("language")?,
        importance: row
            .try_get::<Option<i64>, _>("importance")?
            .map(|v| v.clamp(0, u8::MAX as i64) as u8),
        category: row.try_get("category")?,
        summary: row.try_get("summary")?,
        model: row.try_get("model")?,
        attempts: row.try_get::<i64, _>("attempts")? as u32,
        error: row.try_get("error")?,
        updated_at: from_ms(row.try_get("updated_at")?)?,
    }))
}

fn decision_from_row(row: &SqliteRow) -> Result<DedupDecision, StoreError> {
    let compared: String = row.try_get("compared_with")?;
    Ok(DedupDecision {
        item_id: row.try_get("d_item_id")?,
        compared_with: serde_json::from_str(&compared)?,
        matched_item: row.try_get("matched_item")?,
        similarity: row.try_get::<i64, _>("similarity")?.clamp(0, 100) as u8,
        can_be_publish: row.try_get("can_be_publish")?,
        group_key: row.try_get("group_key")?,
        reason: row.try_get("reason")?,
        decided_at: from_ms(row.try_get("decided_at")?)?,
    })
}

fn publication_from_row(row: &SqliteRow) -> Result<Publication, StoreError> {
    Ok(Publication {
        group_key: row.try_get("group_key")?,
        item_id: row.try_get("item_id")?,
        reserved_at: from_ms(row.try_get("reserved_at")?)?,
        published_at: opt_from_ms(row.try_get("published_at")?)?,
        message_id: row.try_get("message_id")?,
    })
}

#[async_trait]
impl Store for SqliteStore {
    async fn load_feed_state(&self, feed_id: FeedId) -> Result<Option<FeedState>, StoreError> {
        let row = sqlx::query("SELECT * FROM feed_state WHERE feed_id = ?")
            .bind(feed_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(feed_state_from_row).transpose()
    }

    async fn save_feed_state(&self, state: &FeedState) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO feed_state (feed_id, etag, last_modified, last_status,
                                    error_count, backoff_until, fetched_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(feed_id) DO UPDATE SET
                etag = excluded.etag,
                last_modified = excluded.last_modified,
                last_status = excluded.last_status,
                error_count = excluded.error_count,
                backoff_until = excluded.backoff_until,
                fetched_at = excluded.fetched_at
            "#,
        )
        .bind(state.feed_id)
        .bind(&state.etag)
        .bind(&state.last_modified)
        .bind(state.last_status as i64)
        .bind(state.error_count as i64)
        .bind(state.backoff_until.map(to_ms))
        .bind(state.fetched_at.map(to_ms))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_feed_states(&self) -> Result<Vec<FeedState>, StoreError> {
        let rows = sqlx::query("SELECT * FROM feed_state ORDER BY feed_id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(feed_state_from_row).collect()
    }

    async fn insert_item(
        &self,
        item: &RawItem,
        now: DateTime<Utc>,
    ) -> Result<(ItemId, bool), StoreError> {
        let json = serde_json::to_string(item)?;
        let inserted: Option<i64> = sqlx::query_scalar(
            r#"
            INSERT INTO items (content_hash, feed_id, item_json, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(content_hash) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(&item.content_hash)
        .bind(item.feed_id)
        .bind(&json)
        .bind(to_ms(now))
        .fetch_optional(&self.pool)
        .await?;

        if let Some(id) = inserted {
            return Ok((id, true));
        }
        let existing: i64 = sqlx::query_scalar("SELECT id FROM items WHERE content_hash = ?")
            .bind(&item.content_hash)
            .fetch_one(&self.pool)
            .await?;
        Ok((existing, false))
    }

    async fn get_item(&self, id: ItemId) -> Result<Option<StoredItem>, StoreError> {
        let row = sqlx::query(&format!("SELECT {ITEM_COLS} FROM items i WHERE i.id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(item_from_row).transpose()
    }

    async fn count_items(&self) -> Result<u64, StoreError> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM items")
            .fetch_one(&self.pool)
            .await?;
        Ok(n as u64)
    }

    async fn items_without_analysis(&self, limit: usize) -> Result<Vec<StoredItem>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {ITEM_COLS} FROM items i \
             LEFT JOIN ai_analysis a ON a.item_id = i.id \
             WHERE a.item_id IS NULL ORDER BY i.id LIMIT ?"
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(item_from_row).collect()
    }

    async fn claim_analysis(
        &self,
        item_id: ItemId,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let res = sqlx::query(
            r#"
            INSERT INTO ai_analysis (item_id, status, attempts, updated_at)
            VALUES (?, 'pending', 0, ?)
            ON CONFLICT(item_id) DO NOTHING
            "#,
        )
        .bind(item_id)
        .bind(to_ms(now))
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    async fn complete_analysis(&self, analysis: &AiAnalysis) -> Result<bool, StoreError> {
        let res = sqlx::query(
            r#"
            UPDATE ai_analysis SET
                status = ?, language = ?, importance = ?, category = ?, summary = ?,
                model = ?, attempts = ?, error = ?, updated_at = ?
            WHERE item_id = ? AND status = 'pending'
            "#,
        )
        .bind(analysis.status.as_str())
        .bind(&analysis.language)
        .bind(analysis.importance.map(i64::from))
        .bind(&analysis.category)
        .bind(&analysis.summary)
        .bind(&analysis.model)
        .bind(analysis.attempts as i64)
        .bind(&analysis.error)
        .bind(to_ms(analysis.updated_at))
        .bind(analysis.item_id)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    async fn get_analysis(&self, item_id: ItemId) -> Result<Option<AiAnalysis>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {ANALYSIS_COLS} FROM ai_analysis a WHERE a.item_id = ?"
        ))
        .bind(item_id)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(r) => analysis_from_row(&r),
            None => Ok(None),
        }
    }

    async fn analyzed_without_decision(
        &self,
        limit: usize,
    ) -> Result<Vec<AnalyzedItem>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {ITEM_COLS}, {ANALYSIS_COLS} FROM ai_analysis a \
             JOIN items i ON i.id = a.item_id \
             LEFT JOIN dedup_decisions d ON d.item_id = a.item_id \
             LEFT JOIN dedup_failures f ON f.item_id = a.item_id \
             WHERE a.status = 'success' AND d.item_id IS NULL \
             ORDER BY COALESCE(f.failures, 0), a.updated_at, a.item_id LIMIT ?"
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            if let Some(analysis) = analysis_from_row(row)? {
                out.push(AnalyzedItem {
                    item: item_from_row(row)?,
                    analysis,
                });
            }
        }
        Ok(out)
    }

    async fn record_dedup_failure(
        &self,
        item_id: ItemId,
        now: DateTime<Utc>,
    ) -> Result<u32, StoreError> {
        let n: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO dedup_failures (item_id, failures, last_failed_at)
            VALUES (?, 1, ?)
            ON CONFLICT(item_id) DO UPDATE SET
                failures = failures + 1,
                last_failed_at = excluded.last_failed_at
            RETURNING failures
            "#,
        )
        .bind(item_id)
        .bind(to_ms(now))
        .fetch_one(&self.pool)
        .await?;
        Ok(n as u32)
    }

    async fn insert_decision(&self, decision: &DedupDecision) -> Result<bool, StoreError> {
        let res = sqlx::query(
            r#"
            INSERT INTO dedup_decisions (item_id, compared_with, matched_item, similarity,
                                         can_be_publish, group_key, reason, decided_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(item_id) DO NOTHING
            "#,
        )
        .bind(decision.item_id)
        .bind(serde_json::to_string(&decision.compared_with)?)
        .bind(decision.matched_item)
        .bind(decision.similarity as i64)
        .bind(decision.can_be_publish)
        .bind(&decision.group_key)
        .bind(&decision.reason)
        .bind(to_ms(decision.decided_at))
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    async fn get_decision(&self, item_id: ItemId) -> Result<Option<DedupDecision>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {DECISION_COLS} FROM dedup_decisions d WHERE d.item_id = ?"
        ))
        .bind(item_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(decision_from_row).transpose()
    }

    async fn recent_window(
        &self,
        since: DateTime<Utc>,
        exclude: ItemId,
        limit: usize,
    ) -> Result<Vec<WindowEntry>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {ITEM_COLS}, {ANALYSIS_COLS}, {DECISION_COLS} FROM dedup_decisions d \
             JOIN items i ON i.id = d.item_id \
             LEFT JOIN ai_analysis a ON a.item_id = d.item_id \
             WHERE d.decided_at >= ? AND d.item_id != ? \
               AND (d.can_be_publish = 1 OR d.matched_item IS NOT NULL) \
             ORDER BY d.decided_at DESC, d.item_id DESC LIMIT ?"
        ))
        .bind(to_ms(since))
        .bind(exclude)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let stored = item_from_row(row)?;
            let analysis = analysis_from_row(row)?;
            let decision = decision_from_row(row)?;
            out.push(window_entry(&stored, analysis.as_ref(), &decision));
        }
        Ok(out)
    }

    async fn pending_publications(
        &self,
        since: DateTime<Utc>,
        min_importance: u8,
        limit: usize,
    ) -> Result<Vec<PublishCandidate>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {ITEM_COLS}, {ANALYSIS_COLS}, {DECISION_COLS} FROM dedup_decisions d \
             JOIN items i ON i.id = d.item_id \
             JOIN ai_analysis a ON a.item_id = d.item_id \
             LEFT JOIN publications p ON p.group_key = d.group_key \
             WHERE d.can_be_publish = 1 AND d.decided_at >= ? \
               AND a.status = 'success' AND COALESCE(a.importance, 0) >= ? \
               AND p.group_key IS NULL \
             ORDER BY d.decided_at, d.item_id LIMIT ?"
        ))
        .bind(to_ms(since))
        .bind(min_importance as i64)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            if let Some(analysis) = analysis_from_row(row)? {
                out.push(PublishCandidate {
                    item: item_from_row(row)?,
                    analysis,
                    decision: decision_from_row(row)?,
                });
            }
        }
        Ok(out)
    }

    async fn insert_publication(&self, publication: &Publication) -> Result<bool, StoreError> {
        let res = sqlx::query(
            r#"
            INSERT INTO publications (group_key, item_id, reserved_at, published_at, message_id)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(group_key) DO NOTHING
            "#,
        )
        .bind(&publication.group_key)
        .bind(publication.item_id)
        .bind(to_ms(publication.reserved_at))
        .bind(publication.published_at.map(to_ms))
        .bind(&publication.message_id)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    async fn mark_published(
        &self,
        group_key: &str,
        message_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let res = sqlx::query(
            "UPDATE publications SET published_at = ?, message_id = ? WHERE group_key = ?",
        )
        .bind(to_ms(at))
        .bind(message_id)
        .bind(group_key)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    async fn delete_reservation(&self, group_key: &str) -> Result<bool, StoreError> {
        let res =
            sqlx::query("DELETE FROM publications WHERE group_key = ? AND published_at IS NULL")
                .bind(group_key)
                .execute(&self.pool)
                .await?;
        Ok(res.rows_affected() == 1)
    }

    async fn get_publication(&self, group_key: &str) -> Result<Option<Publication>, StoreError> {
        let row = sqlx::query("SELECT * FROM publications WHERE group_key = ?")
            .bind(group_key)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(publication_from_row).transpose()
    }

    async fn prune_publications(&self, before: DateTime<Utc>) -> Result<u64, StoreError> {
        let res =
            sqlx::query("DELETE FROM publications WHERE COALESCE(published_at, reserved_at) < ?")
                .bind(to_ms(before))
                .execute(&self.pool)
                .await?;
        Ok(res.rows_affected())
    }
}
