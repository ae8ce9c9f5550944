//! State Store: account cursors, media dedupe registry, job lock.
//!
//! Backed by SQLite via `sqlx`: a connection pool built with
//! `SqlitePoolOptions`, an explicit `init()` bring-up step, and a
//! single-file WAL-mode database suited to a single-process daemon.

use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};

use crate::error::StateError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediaType {
    Photo,
    Video,
    Gif,
}

impl MediaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::Photo => "photo",
            MediaType::Video => "video",
            MediaType::Gif => "gif",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            MediaType::Photo => ".jpg",
            _ => ".mp4",
        }
    }
}

impl FromStr for MediaType {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "photo" => Ok(MediaType::Photo),
            "video" => Ok(MediaType::Video),
            "gif" => Ok(MediaType::Gif),
            other => Err(StateError::Migration(format!("unknown media_type '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediaStatus {
    Uploaded,
    SkippedOversize,
}

impl MediaStatus {
    fn as_str(&self) -> &'static str {
        match self {
            MediaStatus::Uploaded => "uploaded",
            MediaStatus::SkippedOversize => "skipped_oversize",
        }
    }
}

impl FromStr for MediaStatus {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uploaded" => Ok(MediaStatus::Uploaded),
            "skipped_oversize" => Ok(MediaStatus::SkippedOversize),
            other => Err(StateError::Migration(format!("unknown status '{other}'"))),
        }
    }
}

/// Per-account sync position: the newest post seen, how far backfill
/// has progressed, and any active rate-limit cooldown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountCursor {
    pub handle: String,
    pub latest_seen_post_id: Option<String>,
    pub backfill_cursor: Option<String>,
    pub backfill_done: bool,
    pub rate_limited_until: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl AccountCursor {
    pub fn zero_valued(handle: &str) -> Self {
        Self {
            handle: handle.to_string(),
            latest_seen_post_id: None,
            backfill_cursor: None,
            backfill_done: false,
            rate_limited_until: None,
            updated_at: Utc::now(),
        }
    }

    pub fn is_in_cooldown(&self, now: DateTime<Utc>) -> bool {
        self.rate_limited_until.map(|t| t > now).unwrap_or(false)
    }
}

/// One row per piece of media that has been uploaded or explicitly
/// skipped, keyed by its dedupe hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaRecord {
    pub media_key: String,
    pub post_id: String,
    pub account_handle: String,
    pub media_url: String,
    pub media_type: MediaType,
    pub uploaded_at: DateTime<Utc>,
    pub sink_message_ids: Vec<String>,
    pub status: MediaStatus,
}

/// Compute `media_key = sha256(post_id || "::" || media_url)`, lowercase hex.
pub fn media_key(post_id: &str, media_url: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(post_id.as_bytes());
    hasher.update(b"::");
    hasher.update(media_url.as_bytes());
    hex_lower(&hasher.finalize())
}

fn hex_lower(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        write!(s, "{b:02x}").expect("writing into a String never fails");
    }
    s
}

#[derive(Debug, Clone)]
pub struct JobLock {
    pub job_name: String,
    pub locked_until: DateTime<Utc>,
    pub holder_id: String,
}

#[derive(Clone)]
pub struct StateStore {
    pool: SqlitePool,
}

impl StateStore {
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self, StateError> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    /// Idempotent schema bring-up. Creates the three relations if absent
    /// and adds `rate_limited_until` if an older schema lacks it.
    pub async fn init(&self) -> Result<(), StateError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await?;
        sqlx::query("PRAGMA foreign_keys = ON")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS account_cursors (
                handle TEXT PRIMARY KEY,
                latest_seen_post_id TEXT,
                backfill_cursor TEXT,
                backfill_done INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS media_records (
                media_key TEXT PRIMARY KEY,
                post_id TEXT NOT NULL,
                account_handle TEXT NOT NULL,
                media_url TEXT NOT NULL,
                media_type TEXT NOT NULL,
                uploaded_at TEXT NOT NULL,
                sink_message_ids TEXT NOT NULL,
                status TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS job_locks (
                job_name TEXT PRIMARY KEY,
                locked_until TEXT NOT NULL,
                holder_id TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        self.ensure_rate_limited_until_column().await?;

        Ok(())
    }

    async fn ensure_rate_limited_until_column(&self) -> Result<(), StateError> {
        let columns = sqlx::query("PRAGMA table_info(account_cursors)")
            .fetch_all(&self.pool)
            .await?;
        let has_column = columns
            .iter()
            .any(|row| row.get::<String, _>("name") == "rate_limited_until");
        if !has_column {
            sqlx::query("ALTER TABLE account_cursors ADD COLUMN rate_limited_until TEXT")
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    pub async fn get_account(&self, handle: &str) -> Result<AccountCursor, StateError> {
        let row = sqlx::query(
            r#"
            SELECT handle, latest_seen_post_id, backfill_cursor, backfill_done,
                   rate_limited_until, updated_at
            FROM account_cursors WHERE handle = ?
            "#,
        )
        .bind(handle)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(AccountCursor::zero_valued(handle));
        };

        Ok(AccountCursor {
            handle: row.get("handle"),
            latest_seen_post_id: row.get("latest_seen_post_id"),
            backfill_cursor: row.get("backfill_cursor"),
            backfill_done: row.get::<i64, _>("backfill_done") != 0,
            rate_limited_until: parse_optional_ts(row.get("rate_limited_until")),
            updated_at: parse_ts(row.get("updated_at")),
        })
    }

    pub async fn put_account(&self, cursor: &AccountCursor) -> Result<(), StateError> {
        sqlx::query(
            r#"
            INSERT INTO account_cursors
                (handle, latest_seen_post_id, backfill_cursor, backfill_done, rate_limited_until, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(handle) DO UPDATE SET
                latest_seen_post_id = excluded.latest_seen_post_id,
                backfill_cursor = excluded.backfill_cursor,
                backfill_done = excluded.backfill_done,
                rate_limited_until = excluded.rate_limited_until,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&cursor.handle)
        .bind(&cursor.latest_seen_post_id)
        .bind(&cursor.backfill_cursor)
        .bind(cursor.backfill_done as i64)
        .bind(cursor.rate_limited_until.map(|t| t.to_rfc3339()))
        .bind(cursor.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn is_media_uploaded(&self, media_key: &str) -> Result<bool, StateError> {
        let row = sqlx::query("SELECT 1 FROM media_records WHERE media_key = ?")
            .bind(media_key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    pub async fn mark_media(&self, record: &MediaRecord) -> Result<(), StateError> {
        let ids_json = serde_json::to_string(&record.sink_message_ids)
            .expect("Vec<String> always serializes");
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO media_records
                (media_key, post_id, account_handle, media_url, media_type, uploaded_at, sink_message_ids, status)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.media_key)
        .bind(&record.post_id)
        .bind(&record.account_handle)
        .bind(&record.media_url)
        .bind(record.media_type.as_str())
        .bind(record.uploaded_at.to_rfc3339())
        .bind(ids_json)
        .bind(record.status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Atomically observe and, if unheld or expired, take the named lock.
    /// Runs inside an immediate-write transaction so concurrent callers
    /// can't both succeed.
    pub async fn acquire_lock(
        &self,
        job_name: &str,
        holder_id: &str,
        ttl_seconds: u64,
    ) -> Result<bool, StateError> {
        let mut tx = self
            .pool
            .begin_with("BEGIN IMMEDIATE")
            .await?;

        let now = Utc::now();
        let existing = sqlx::query("SELECT locked_until FROM job_locks WHERE job_name = ?")
            .bind(job_name)
            .fetch_optional(&mut *tx)
            .await?;

        let held = match existing {
            Some(row) => parse_ts(row.get("locked_until")) > now,
            None => false,
        };

        if held {
            tx.rollback().await?;
            return Ok(false);
        }

        let locked_until = now + chrono::Duration::seconds(ttl_seconds as i64);
        sqlx::query(
            r#"
            INSERT INTO job_locks (job_name, locked_until, holder_id)
            VALUES (?, ?, ?)
            ON CONFLICT(job_name) DO UPDATE SET
                locked_until = excluded.locked_until,
                holder_id = excluded.holder_id
            "#,
        )
        .bind(job_name)
        .bind(locked_until.to_rfc3339())
        .bind(holder_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    /// Delete the lock row iff `holder_id` matches the current holder.
    /// A mismatched holder is a no-op, never an error.
    pub async fn release_lock(&self, job_name: &str, holder_id: &str) -> Result<(), StateError> {
        sqlx::query("DELETE FROM job_locks WHERE job_name = ? AND holder_id = ?")
            .bind(job_name)
            .bind(holder_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn parse_ts(raw: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn parse_optional_ts(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|t| t.with_timezone(&Utc))
}
