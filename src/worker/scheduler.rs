//! Single-flight scheduler.
//!
//! Polls the task store and starts at most one supervising unit per
//! context. The busy table is locked across claim, mark-running and
//! registration, so two claims for the same context can never interleave.
//!
//! Two ways to bring a unit down: [`Scheduler::stop_context`] is the user's
//! stop and cancels the task and its backlog; [`Scheduler::shutdown`]
//! only terminates agents and leaves every row for the next start.

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::SchedulerConfig;
use crate::error::DatabaseError;
use crate::store::Database;
use crate::worker::state::{Task, TaskStatus};
use crate::worker::supervisor::Supervisor;

/// Result text of a task whose supervising unit panicked.
const INTERNAL_ERROR: &str = "Internal error";

/// Busy-table entry for a context with a task in flight.
struct RunningTask {
    task_id: i64,
    cancel: CancellationToken,
    /// Taken by the first `stop_context` that waits on it.
    handle: Option<JoinHandle<()>>,
}

/// Outcome of [`Scheduler::stop_context`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StopReport {
    /// The running task that was told to stop, if any.
    pub stopped_task: Option<i64>,
    /// Queued tasks moved to CANCELLED.
    pub cancelled_pending: usize,
}

pub struct Scheduler {
    db: Arc<dyn Database>,
    supervisor: Arc<Supervisor>,
    config: SchedulerConfig,
    kill_grace: Duration,
    busy: Arc<Mutex<HashMap<String, RunningTask>>>,
}

impl Scheduler {
    pub fn new(
        db: Arc<dyn Database>,
        supervisor: Arc<Supervisor>,
        config: SchedulerConfig,
        kill_grace: Duration,
    ) -> Self {
        Self {
            db,
            supervisor,
            config,
            kill_grace,
            busy: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Poll until `shutdown` is cancelled. Errors are logged, never fatal.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        tracing::info!(
            poll_ms = self.config.poll_interval.as_millis() as u64,
            "Scheduler started"
        );
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.poll_once().await {
                tracing::error!("Queue poll failed: {e}");
            }
        }
        tracing::info!("Scheduler stopped");
    }

    /// Start every task that is claimable right now. Returns how many
    /// were started.
    pub async fn poll_once(&self) -> Result<usize, DatabaseError> {
        let mut busy = self.busy.lock().await;
        if self.supervisor.is_shutting_down() {
            return Ok(0);
        }
        let mut started = 0;

        loop {
            let excluded: HashSet<String> = busy.keys().cloned().collect();
            let Some(mut task) = self.db.claim_next(&excluded).await? else {
                break;
            };
            if !self.db.mark_running(task.id).await? {
                tracing::debug!(task_id = task.id, "Task left the queue before it could start");
                continue;
            }
            task.status = TaskStatus::Running;
            task.started_at = Some(chrono::Utc::now());

            let cancel = self.supervisor.unit_token();
            let task_id = task.id;
            let context = task.context.clone();
            let handle = self.spawn_unit(task, cancel.clone());
            busy.insert(
                context,
                RunningTask {
                    task_id,
                    cancel,
                    handle: Some(handle),
                },
            );
            started += 1;
        }

        Ok(started)
    }

    fn spawn_unit(&self, task: Task, cancel: CancellationToken) -> JoinHandle<()> {
        let supervisor = self.supervisor.clone();
        let busy = self.busy.clone();
        let task_id = task.id;
        let context = task.context.clone();

        tokio::spawn(async move {
            match AssertUnwindSafe(supervisor.execute(task, cancel))
                .catch_unwind()
                .await
            {
                Ok(status) => tracing::debug!(task_id, %status, "Supervising unit exited"),
                Err(_) => {
                    tracing::error!(task_id, "Supervisor panicked");
                    supervisor.fail_abandoned(task_id, INTERNAL_ERROR).await;
                }
            }

            let mut busy = busy.lock().await;
            if busy.get(&context).is_some_and(|r| r.task_id == task_id) {
                busy.remove(&context);
            }
        })
    }

    /// Cancel the context's queued backlog and stop its running task.
    ///
    /// Waits for the running unit to exit for up to the kill grace plus
    /// the stop margin; after that the unit is aborted and the task is
    /// marked CANCELLED here.
    pub async fn stop_context(&self, context: &str) -> Result<StopReport, DatabaseError> {
        let cancelled_pending = self.db.cancel_all_pending(context).await?;

        let running = {
            let mut busy = self.busy.lock().await;
            busy.get_mut(context).map(|r| {
                r.cancel.cancel();
                (r.task_id, r.handle.take())
            })
        };

        let Some((task_id, handle)) = running else {
            return Ok(StopReport {
                stopped_task: None,
                cancelled_pending,
            });
        };
        tracing::info!(task_id, context, cancelled_pending, "Stopping context");

        if let Some(mut handle) = handle {
            let wait = self.kill_grace + self.config.stop_margin;
            if tokio::time::timeout(wait, &mut handle).await.is_err() {
                tracing::warn!(task_id, "Supervising unit did not exit, aborting");
                handle.abort();
                {
                    let mut busy = self.busy.lock().await;
                    if busy.get(context).is_some_and(|r| r.task_id == task_id) {
                        busy.remove(context);
                    }
                }
                self.supervisor.abandon(task_id).await;
            }
        }

        Ok(StopReport {
            stopped_task: Some(task_id),
            cancelled_pending,
        })
    }

    /// Interrupt every running unit for process shutdown.
    ///
    /// No more tasks are claimed afterwards. Agents are terminated, but
    /// PENDING rows stay queued and interrupted tasks keep their RUNNING row
    /// for the startup orphan sweep. Returns the interrupted task ids.
    pub async fn shutdown(&self) -> Vec<i64> {
        let running: Vec<(String, i64, Option<JoinHandle<()>>)> = {
            let mut busy = self.busy.lock().await;
            self.supervisor.begin_shutdown();
            busy.iter_mut()
                .map(|(ctx, r)| (ctx.clone(), r.task_id, r.handle.take()))
                .collect()
        };
        if running.is_empty() {
            return Vec::new();
        }
        tracing::info!(count = running.len(), "Interrupting running tasks for shutdown");

        let wait = self.kill_grace + self.config.stop_margin;
        let units = running.into_iter().map(|(context, task_id, handle)| async move {
            if let Some(mut handle) = handle {
                if tokio::time::timeout(wait, &mut handle).await.is_err() {
                    tracing::warn!(task_id, "Supervising unit did not exit, aborting");
                    handle.abort();
                    let mut busy = self.busy.lock().await;
                    if busy.get(&context).is_some_and(|r| r.task_id == task_id) {
                        busy.remove(&context);
                    }
                }
            }
            task_id
        });

        let mut interrupted = futures::future::join_all(units).await;
        interrupted.sort_unstable();
        interrupted
    }

    pub async fn is_context_busy(&self, context: &str) -> bool {
        self.busy.lock().await.contains_key(context)
    }

    pub async fn running_task_id(&self, context: &str) -> Option<i64> {
        self.busy.lock().await.get(context).map(|r| r.task_id)
    }

    /// Busy contexts, sorted.
    pub async fn busy_contexts(&self) -> Vec<String> {
        let mut contexts: Vec<String> = self.busy.lock().await.keys().cloned().collect();
        contexts.sort();
        contexts
    }
}
