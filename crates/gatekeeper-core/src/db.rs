//! SQLite persistence. Git refs remain authoritative for cascade and queue
//! state; this module backs the dispatcher's completed-job log, the
//! build-status cache, and the status page — a `Mutex<Connection>` plus one
//! typed method per query.

use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

const SCHEMA_SQL: &str = include_str!("../../../schema.sql");

pub struct Db {
    conn: Mutex<Connection>,
}

#[derive(Debug, Clone)]
pub struct JobRecord {
    pub id: i64,
    pub kind: String,
    pub job_key: String,
    pub status: String,
    pub attempt: i64,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct BuildStatusCacheRow {
    pub build_key: String,
    pub sha: String,
    pub state: String,
    pub url: String,
    pub description: String,
}

#[derive(Debug, Clone)]
pub struct QueueSnapshotRow {
    pub version: String,
    pub pr_id: i64,
    pub sha: String,
    pub position: i64,
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .map(|ndt| ndt.and_utc())
        .unwrap_or_else(|_| Utc::now())
}

fn now_str() -> String {
    Utc::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<JobRecord> {
    let created_at: String = row.get(6)?;
    let updated_at: String = row.get(7)?;
    Ok(JobRecord {
        id: row.get(0)?,
        kind: row.get(1)?,
        job_key: row.get(2)?,
        status: row.get(3)?,
        attempt: row.get(4)?,
        last_error: row.get(5)?,
        created_at: parse_ts(&created_at),
        updated_at: parse_ts(&updated_at),
    })
}

fn row_to_build_status(row: &rusqlite::Row<'_>) -> rusqlite::Result<BuildStatusCacheRow> {
    Ok(BuildStatusCacheRow {
        build_key: row.get(0)?,
        sha: row.get(1)?,
        state: row.get(2)?,
        url: row.get(3)?,
        description: row.get(4)?,
    })
}

fn row_to_queue_snapshot(row: &rusqlite::Row<'_>) -> rusqlite::Result<QueueSnapshotRow> {
    Ok(QueueSnapshotRow {
        version: row.get(0)?,
        pr_id: row.get(1)?,
        sha: row.get(2)?,
        position: row.get(3)?,
    })
}

impl Db {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open SQLite database at {path:?}"))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .context("failed to set PRAGMAs")?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute_batch(SCHEMA_SQL).context("failed to apply schema migrations")?;
        Ok(())
    }

    // ── Jobs ──────────────────────────────────────────────────────────────

    pub fn insert_job(&self, kind: &str, job_key: &str) -> Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let now = now_str();
        conn.execute(
            "INSERT INTO jobs (kind, job_key, status, attempt, created_at, updated_at) \
             VALUES (?1, ?2, 'pending', 0, ?3, ?3)",
            params![kind, job_key, now],
        )
        .context("insert_job")?;
        Ok(conn.last_insert_rowid())
    }

    pub fn update_job_status(&self, id: i64, status: &str, error: Option<&str>) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE jobs SET status = ?1, last_error = COALESCE(?2, last_error), updated_at = ?3 \
             WHERE id = ?4",
            params![status, error, now_str(), id],
        )
        .context("update_job_status")?;
        Ok(())
    }

    pub fn increment_job_attempt(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE jobs SET attempt = attempt + 1, updated_at = ?1 WHERE id = ?2",
            params![now_str(), id],
        )
        .context("increment_job_attempt")?;
        Ok(())
    }

    pub fn get_job(&self, id: i64) -> Result<Option<JobRecord>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.query_row(
            "SELECT id, kind, job_key, status, attempt, last_error, created_at, updated_at \
             FROM jobs WHERE id = ?1",
            params![id],
            row_to_job,
        )
        .optional()
        .context("get_job")
    }

    pub fn list_recent_jobs(&self, limit: i64) -> Result<Vec<JobRecord>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT id, kind, job_key, status, attempt, last_error, created_at, updated_at \
             FROM jobs ORDER BY id DESC LIMIT ?1",
        )?;
        let jobs = stmt
            .query_map(params![limit], row_to_job)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_recent_jobs")?;
        Ok(jobs)
    }

    // ── Build status cache ───────────────────────────────────────────────

    /// Only positive (`Successful`) results are worth caching across polls;
    /// callers store transient states too (for status-page display) but
    /// gating always treats a cached non-successful row as advisory only.
    pub fn cache_build_status(&self, row: &BuildStatusCacheRow) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO build_status_cache (build_key, sha, state, url, description, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
             ON CONFLICT(build_key, sha) DO UPDATE SET \
               state = excluded.state, url = excluded.url, description = excluded.description, \
               updated_at = excluded.updated_at",
            params![row.build_key, row.sha, row.state, row.url, row.description, now_str()],
        )
        .context("cache_build_status")?;
        Ok(())
    }

    pub fn get_cached_build_status(
        &self,
        build_key: &str,
        sha: &str,
    ) -> Result<Option<BuildStatusCacheRow>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.query_row(
            "SELECT build_key, sha, state, url, description \
             FROM build_status_cache WHERE build_key = ?1 AND sha = ?2",
            params![build_key, sha],
            row_to_build_status,
        )
        .optional()
        .context("get_cached_build_status")
    }

    /// Drops a cached row so the next poll hits the host fresh — used by the
    /// `build`/`clear` commands to force a re-check instead of replaying a
    /// stale cached result.
    pub fn clear_cached_build_status(&self, build_key: &str, sha: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "DELETE FROM build_status_cache WHERE build_key = ?1 AND sha = ?2",
            params![build_key, sha],
        )
        .context("clear_cached_build_status")?;
        Ok(())
    }

    // ── Queue snapshot (status page only; git refs are authoritative) ────

    pub fn replace_queue_snapshot(&self, version: &str, entries: &[(i64, String)]) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute("DELETE FROM queue_snapshot WHERE version = ?1", params![version])
            .context("replace_queue_snapshot delete")?;
        let now = now_str();
        for (position, (pr_id, sha)) in entries.iter().enumerate() {
            conn.execute(
                "INSERT INTO queue_snapshot (version, pr_id, sha, position, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![version, pr_id, sha, position as i64, now],
            )
            .context("replace_queue_snapshot insert")?;
        }
        Ok(())
    }

    pub fn list_queue_snapshot(&self, version: &str) -> Result<Vec<QueueSnapshotRow>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT version, pr_id, sha, position FROM queue_snapshot \
             WHERE version = ?1 ORDER BY position ASC",
        )?;
        let rows = stmt
            .query_map(params![version], row_to_queue_snapshot)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_queue_snapshot")?;
        Ok(rows)
    }

    // ── Queue halt ────────────────────────────────────────────────────────

    /// Records that queue promotions must stop. Idempotent: a second halt
    /// while one is already active overwrites the reason and timestamp
    /// rather than erroring.
    pub fn set_queue_halt(&self, reason: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO queue_halt (id, reason, halted_at) VALUES (1, ?1, ?2) \
             ON CONFLICT(id) DO UPDATE SET reason = excluded.reason, halted_at = excluded.halted_at",
            params![reason, now_str()],
        )
        .context("set_queue_halt")?;
        Ok(())
    }

    pub fn get_queue_halt(&self) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.query_row("SELECT reason FROM queue_halt WHERE id = 1", [], |r| r.get(0))
            .optional()
            .context("get_queue_halt")
    }

    pub fn clear_queue_halt(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute("DELETE FROM queue_halt WHERE id = 1", []).context("clear_queue_halt")?;
        Ok(())
    }

    // ── Event log ─────────────────────────────────────────────────────────

    pub fn log_event(&self, level: &str, category: &str, message: &str, metadata: &Value) -> Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let ts = Utc::now().timestamp();
        conn.execute(
            "INSERT INTO events (ts, level, category, message, metadata) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![ts, level, category, message, metadata.to_string()],
        )
        .context("log_event")?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_recent_events(&self, limit: i64) -> Result<Vec<(i64, i64, String, String, String)>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT id, ts, level, category, message FROM events ORDER BY ts DESC, id DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit], |r| {
                Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("get_recent_events")?;
        Ok(rows)
    }
}
