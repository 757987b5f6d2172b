//! Unified `Database` trait: single async interface for all persistence.
//!
//! Covers the task queue, session continuity per (submitter, context), and
//! the context registry's persisted bindings.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::config::OrphanPolicy;
use crate::error::DatabaseError;
use crate::worker::state::{NewTask, Task};

/// One transcript entry of a conversation.
#[derive(Debug, Clone)]
pub struct Turn {
    pub role: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Backend-agnostic database trait.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Tasks ───────────────────────────────────────────────────────

    /// Insert a PENDING task and return it with its assigned id.
    async fn submit_task(&self, task: NewTask) -> Result<Task, DatabaseError>;

    /// Oldest PENDING task whose context is not in `excluded`.
    async fn claim_next(&self, excluded: &HashSet<String>) -> Result<Option<Task>, DatabaseError>;

    /// PENDING → RUNNING. Returns false if the task was not pending.
    async fn mark_running(&self, id: i64) -> Result<bool, DatabaseError>;

    /// RUNNING → COMPLETED. Returns false if the task was not running.
    async fn mark_completed(
        &self,
        id: i64,
        result: &str,
        tool_count: u32,
    ) -> Result<bool, DatabaseError>;

    /// RUNNING → FAILED with the error text as result.
    async fn mark_failed(&self, id: i64, error: &str) -> Result<bool, DatabaseError>;

    /// PENDING or RUNNING → CANCELLED.
    async fn mark_cancelled(&self, id: i64) -> Result<bool, DatabaseError>;

    async fn get_task(&self, id: i64) -> Result<Option<Task>, DatabaseError>;

    /// Most recent tasks of a submitter, newest first.
    async fn recent_tasks(&self, submitter: &str, limit: usize) -> Result<Vec<Task>, DatabaseError>;

    /// The RUNNING task of a context, if any.
    async fn running_for(&self, context: &str) -> Result<Option<Task>, DatabaseError>;

    async fn pending_count(&self, context: &str) -> Result<usize, DatabaseError>;

    async fn all_running(&self) -> Result<Vec<Task>, DatabaseError>;

    /// Cancel every PENDING task of a context. Returns how many were cancelled.
    async fn cancel_all_pending(&self, context: &str) -> Result<usize, DatabaseError>;

    /// Attach the transport's progress indicator to a task.
    async fn set_progress_handle(&self, id: i64, handle: i64) -> Result<(), DatabaseError>;

    /// Reconcile RUNNING rows left by a previous process. Returns the
    /// affected tasks as they were before the sweep.
    async fn recover_orphans(&self, policy: OrphanPolicy) -> Result<Vec<Task>, DatabaseError>;

    // ── Sessions & transcript ───────────────────────────────────────

    async fn get_session(
        &self,
        submitter: &str,
        context: &str,
    ) -> Result<Option<String>, DatabaseError>;

    /// Upsert the session handle, refreshing its timestamp.
    async fn set_session(
        &self,
        submitter: &str,
        context: &str,
        session_id: &str,
    ) -> Result<(), DatabaseError>;

    async fn clear_session(&self, submitter: &str, context: &str) -> Result<(), DatabaseError>;

    async fn append_turn(
        &self,
        submitter: &str,
        context: &str,
        role: &str,
        content: &str,
    ) -> Result<(), DatabaseError>;

    /// Most recent `limit` turns, returned oldest first.
    async fn recent_turns(
        &self,
        submitter: &str,
        context: &str,
        limit: usize,
    ) -> Result<Vec<Turn>, DatabaseError>;

    async fn clear_turns(&self, submitter: &str, context: &str) -> Result<(), DatabaseError>;

    /// Delete transcript and session together.
    async fn clear_conversation(&self, submitter: &str, context: &str)
    -> Result<(), DatabaseError>;

    // ── Contexts ────────────────────────────────────────────────────

    async fn get_active_context(&self, submitter: &str) -> Result<Option<String>, DatabaseError>;

    async fn set_active_context(&self, submitter: &str, context: &str)
    -> Result<(), DatabaseError>;

    /// Custom name → path bindings, sorted by name.
    async fn list_custom_contexts(&self) -> Result<Vec<(String, String)>, DatabaseError>;

    async fn add_custom_context(&self, name: &str, path: &str) -> Result<(), DatabaseError>;

    /// Returns false if no such binding existed.
    async fn remove_custom_context(&self, name: &str) -> Result<bool, DatabaseError>;
}
