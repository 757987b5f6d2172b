//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. Status transitions are
//! guarded in SQL (`WHERE status = ...`) so a terminal row never changes.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info, warn};

use crate::config::OrphanPolicy;
use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::{Database, Turn};
use crate::worker::state::{NewTask, Task, TaskStatus};

/// Result text recorded on tasks failed by the startup sweep.
pub const INTERRUPTED_BY_RESTART: &str = "Interrupted by restart";

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    DatabaseError::Pool(format!("Failed to create database directory: {e}"))
                })?;
            }
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        // journal_mode returns a row, so it has to go through query().
        let mut rows = conn
            .query("PRAGMA journal_mode=WAL", ())
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to enable WAL: {e}")))?;
        while let Ok(Some(_)) = rows.next().await {}

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn query_tasks(
        &self,
        op: &str,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<Task>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut tasks = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => match row_to_task(&row) {
                    Ok(task) => tasks.push(task),
                    Err(e) => warn!("Skipping task row: {e}"),
                },
                Ok(None) => break,
                Err(e) => return Err(DatabaseError::Query(format!("{op}: {e}"))),
            }
        }
        Ok(tasks)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical timestamp format. Fixed width, so text order is time order.
fn now_str() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

/// Convert `Option<i64>` to libsql Value.
fn opt_int(v: Option<i64>) -> libsql::Value {
    match v {
        Some(v) => libsql::Value::Integer(v),
        None => libsql::Value::Null,
    }
}

const TASK_COLUMNS: &str = "id, submitter, context, prompt, status, result, tool_count, \
    progress_handle, orchestration_requested, created_at, started_at, finished_at";

/// Map a libsql Row to a Task. Column order matches TASK_COLUMNS.
fn row_to_task(row: &libsql::Row) -> Result<Task, DatabaseError> {
    let get_err = |e: libsql::Error| DatabaseError::Serialization(format!("task row: {e}"));

    let status_str: String = row.get(4).map_err(get_err)?;
    let status: TaskStatus = status_str.parse().map_err(DatabaseError::Serialization)?;
    let created_str: String = row.get(9).map_err(get_err)?;
    let started_str: Option<String> = row.get(10).map_err(get_err)?;
    let finished_str: Option<String> = row.get(11).map_err(get_err)?;

    Ok(Task {
        id: row.get(0).map_err(get_err)?,
        submitter: row.get(1).map_err(get_err)?,
        context: row.get(2).map_err(get_err)?,
        prompt: row.get(3).map_err(get_err)?,
        status,
        result: row.get(5).map_err(get_err)?,
        tool_count: row.get::<i64>(6).map_err(get_err)?.max(0) as u32,
        progress_handle: row.get(7).map_err(get_err)?,
        orchestration_requested: row.get::<i64>(8).map_err(get_err)? != 0,
        created_at: parse_datetime(&created_str),
        started_at: parse_optional_datetime(&started_str),
        finished_at: parse_optional_datetime(&finished_str),
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Tasks ───────────────────────────────────────────────────────

    async fn submit_task(&self, task: NewTask) -> Result<Task, DatabaseError> {
        let conn = self.conn();
        let now = now_str();
        let mut rows = conn
            .query(
                &format!(
                    "INSERT INTO tasks (submitter, context, prompt, status, progress_handle, orchestration_requested, created_at)
                     VALUES (?1, ?2, ?3, 'pending', ?4, ?5, ?6)
                     RETURNING {TASK_COLUMNS}"
                ),
                params![
                    task.submitter.as_str(),
                    task.context.as_str(),
                    task.prompt.as_str(),
                    opt_int(task.progress_handle),
                    task.orchestration_requested as i64,
                    now,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("submit_task: {e}")))?;

        let task = match rows.next().await {
            Ok(Some(row)) => row_to_task(&row)?,
            Ok(None) => {
                return Err(DatabaseError::Query(
                    "submit_task: insert returned no row".into(),
                ));
            }
            Err(e) => return Err(DatabaseError::Query(format!("submit_task: {e}"))),
        };

        debug!(task_id = task.id, context = %task.context, "Task submitted");
        Ok(task)
    }

    async fn claim_next(&self, excluded: &HashSet<String>) -> Result<Option<Task>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks WHERE status = 'pending'
                     ORDER BY created_at ASC, id ASC"
                ),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("claim_next: {e}")))?;

        loop {
            match rows.next().await {
                Ok(Some(row)) => {
                    let task = row_to_task(&row)?;
                    if !excluded.contains(&task.context) {
                        return Ok(Some(task));
                    }
                }
                Ok(None) => return Ok(None),
                Err(e) => return Err(DatabaseError::Query(format!("claim_next: {e}"))),
            }
        }
    }

    async fn mark_running(&self, id: i64) -> Result<bool, DatabaseError> {
        let affected = self
            .conn()
            .execute(
                "UPDATE tasks SET status = 'running', started_at = ?2
                 WHERE id = ?1 AND status = 'pending'",
                params![id, now_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_running: {e}")))?;
        Ok(affected > 0)
    }

    async fn mark_completed(
        &self,
        id: i64,
        result: &str,
        tool_count: u32,
    ) -> Result<bool, DatabaseError> {
        let affected = self
            .conn()
            .execute(
                "UPDATE tasks SET status = 'completed', result = ?2, tool_count = ?3, finished_at = ?4
                 WHERE id = ?1 AND status = 'running'",
                params![id, result, tool_count as i64, now_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_completed: {e}")))?;
        Ok(affected > 0)
    }

    async fn mark_failed(&self, id: i64, error: &str) -> Result<bool, DatabaseError> {
        let affected = self
            .conn()
            .execute(
                "UPDATE tasks SET status = 'failed', result = ?2, finished_at = ?3
                 WHERE id = ?1 AND status = 'running'",
                params![id, error, now_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_failed: {e}")))?;
        Ok(affected > 0)
    }

    async fn mark_cancelled(&self, id: i64) -> Result<bool, DatabaseError> {
        let affected = self
            .conn()
            .execute(
                "UPDATE tasks SET status = 'cancelled', finished_at = ?2
                 WHERE id = ?1 AND status IN ('pending', 'running')",
                params![id, now_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_cancelled: {e}")))?;
        Ok(affected > 0)
    }

    async fn get_task(&self, id: i64) -> Result<Option<Task>, DatabaseError> {
        let mut tasks = self
            .query_tasks(
                "get_task",
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![id],
            )
            .await?;
        Ok(tasks.pop())
    }

    async fn recent_tasks(&self, submitter: &str, limit: usize) -> Result<Vec<Task>, DatabaseError> {
        self.query_tasks(
            "recent_tasks",
            &format!(
                "SELECT {TASK_COLUMNS} FROM tasks WHERE submitter = ?1
                 ORDER BY created_at DESC, id DESC LIMIT ?2"
            ),
            params![submitter, limit as i64],
        )
        .await
    }

    async fn running_for(&self, context: &str) -> Result<Option<Task>, DatabaseError> {
        let mut tasks = self
            .query_tasks(
                "running_for",
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks WHERE context = ?1 AND status = 'running'
                     ORDER BY started_at DESC LIMIT 1"
                ),
                params![context],
            )
            .await?;
        Ok(tasks.pop())
    }

    async fn pending_count(&self, context: &str) -> Result<usize, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM tasks WHERE context = ?1 AND status = 'pending'",
                params![context],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("pending_count: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<i64>(0).unwrap_or(0).max(0) as usize),
            Ok(None) => Ok(0),
            Err(e) => Err(DatabaseError::Query(format!("pending_count: {e}"))),
        }
    }

    async fn all_running(&self) -> Result<Vec<Task>, DatabaseError> {
        self.query_tasks(
            "all_running",
            &format!(
                "SELECT {TASK_COLUMNS} FROM tasks WHERE status = 'running'
                 ORDER BY started_at ASC, id ASC"
            ),
            (),
        )
        .await
    }

    async fn cancel_all_pending(&self, context: &str) -> Result<usize, DatabaseError> {
        let affected = self
            .conn()
            .execute(
                "UPDATE tasks SET status = 'cancelled', finished_at = ?2
                 WHERE context = ?1 AND status = 'pending'",
                params![context, now_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("cancel_all_pending: {e}")))?;

        if affected > 0 {
            debug!(context, count = affected, "Cancelled pending tasks");
        }
        Ok(affected as usize)
    }

    async fn set_progress_handle(&self, id: i64, handle: i64) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE tasks SET progress_handle = ?2 WHERE id = ?1",
                params![id, handle],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_progress_handle: {e}")))?;
        Ok(())
    }

    async fn recover_orphans(&self, policy: OrphanPolicy) -> Result<Vec<Task>, DatabaseError> {
        let orphans = self.all_running().await?;
        if orphans.is_empty() {
            return Ok(orphans);
        }

        let conn = self.conn();
        match policy {
            OrphanPolicy::Fail => {
                conn.execute(
                    "UPDATE tasks SET status = 'failed', result = ?1, finished_at = ?2
                     WHERE status = 'running'",
                    params![INTERRUPTED_BY_RESTART, now_str()],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("recover_orphans: {e}")))?;
            }
            OrphanPolicy::Requeue => {
                conn.execute(
                    "UPDATE tasks SET status = 'pending', started_at = NULL
                     WHERE status = 'running'",
                    (),
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("recover_orphans: {e}")))?;
            }
            OrphanPolicy::Ignore => {}
        }

        info!(count = orphans.len(), ?policy, "Reconciled orphaned running tasks");
        Ok(orphans)
    }

    // ── Sessions & transcript ───────────────────────────────────────

    async fn get_session(
        &self,
        submitter: &str,
        context: &str,
    ) -> Result<Option<String>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT session_id FROM sessions WHERE submitter = ?1 AND context = ?2",
                params![submitter, context],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_session: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<String>(0).ok()),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_session: {e}"))),
        }
    }

    async fn set_session(
        &self,
        submitter: &str,
        context: &str,
        session_id: &str,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO sessions (submitter, context, session_id, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (submitter, context)
                 DO UPDATE SET session_id = excluded.session_id, updated_at = excluded.updated_at",
                params![submitter, context, session_id, now_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_session: {e}")))?;
        Ok(())
    }

    async fn clear_session(&self, submitter: &str, context: &str) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "DELETE FROM sessions WHERE submitter = ?1 AND context = ?2",
                params![submitter, context],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("clear_session: {e}")))?;
        Ok(())
    }

    async fn append_turn(
        &self,
        submitter: &str,
        context: &str,
        role: &str,
        content: &str,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO transcript (submitter, context, role, content, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![submitter, context, role, content, now_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("append_turn: {e}")))?;
        Ok(())
    }

    async fn recent_turns(
        &self,
        submitter: &str,
        context: &str,
        limit: usize,
    ) -> Result<Vec<Turn>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT role, content, created_at FROM transcript
                 WHERE submitter = ?1 AND context = ?2
                 ORDER BY id DESC LIMIT ?3",
                params![submitter, context, limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("recent_turns: {e}")))?;

        let mut turns = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let role: String = row.get(0).unwrap_or_default();
            let content: String = row.get(1).unwrap_or_default();
            let created_str: String = row.get(2).unwrap_or_default();
            turns.push(Turn {
                role,
                content,
                created_at: parse_datetime(&created_str),
            });
        }
        turns.reverse();
        Ok(turns)
    }

    async fn clear_turns(&self, submitter: &str, context: &str) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "DELETE FROM transcript WHERE submitter = ?1 AND context = ?2",
                params![submitter, context],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("clear_turns: {e}")))?;
        Ok(())
    }

    async fn clear_conversation(
        &self,
        submitter: &str,
        context: &str,
    ) -> Result<(), DatabaseError> {
        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("clear_conversation begin: {e}")))?;

        tx.execute(
            "DELETE FROM transcript WHERE submitter = ?1 AND context = ?2",
            params![submitter, context],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("clear_conversation transcript: {e}")))?;

        tx.execute(
            "DELETE FROM sessions WHERE submitter = ?1 AND context = ?2",
            params![submitter, context],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("clear_conversation session: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| DatabaseError::Query(format!("clear_conversation commit: {e}")))?;

        debug!(submitter, context, "Conversation cleared");
        Ok(())
    }

    // ── Contexts ────────────────────────────────────────────────────

    async fn get_active_context(&self, submitter: &str) -> Result<Option<String>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT context FROM active_contexts WHERE submitter = ?1",
                params![submitter],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_active_context: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<String>(0).ok()),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_active_context: {e}"))),
        }
    }

    async fn set_active_context(
        &self,
        submitter: &str,
        context: &str,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO active_contexts (submitter, context, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT (submitter)
                 DO UPDATE SET context = excluded.context, updated_at = excluded.updated_at",
                params![submitter, context, now_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_active_context: {e}")))?;
        Ok(())
    }

    async fn list_custom_contexts(&self) -> Result<Vec<(String, String)>, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT name, path FROM custom_contexts ORDER BY name ASC", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("list_custom_contexts: {e}")))?;

        let mut out = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let name: String = row.get(0).unwrap_or_default();
            let path: String = row.get(1).unwrap_or_default();
            out.push((name, path));
        }
        Ok(out)
    }

    async fn add_custom_context(&self, name: &str, path: &str) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO custom_contexts (name, path, created_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT (name) DO UPDATE SET path = excluded.path",
                params![name, path, now_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("add_custom_context: {e}")))?;
        Ok(())
    }

    async fn remove_custom_context(&self, name: &str) -> Result<bool, DatabaseError> {
        let affected = self
            .conn()
            .execute(
                "DELETE FROM custom_contexts WHERE name = ?1",
                params![name],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("remove_custom_context: {e}")))?;
        Ok(affected > 0)
    }
}
