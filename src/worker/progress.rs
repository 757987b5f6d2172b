//! Progress reporting for a running task.
//!
//! [`ProgressReporter`] owns the transport-side indicator of one task and
//! is best-effort throughout: delivery errors are logged and swallowed.
//! [`ProgressView`] holds what the indicator should currently say.

use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::channels::{Transport, chunk_message};
use crate::config::MAX_MESSAGE_CHARS;
use crate::worker::describe::describe_tool_call;
use crate::worker::events::ToolInvocation;
use crate::worker::runner::AgentKind;

/// Activity lines kept for the direct strategy's indicator.
const RECENT_ACTIVITY: usize = 5;

struct ReporterState {
    closed: bool,
    last_text: Option<String>,
}

/// Sink for one task's progress indicator and final messages.
pub struct ProgressReporter {
    transport: Arc<dyn Transport>,
    chat_id: String,
    handle: Option<i64>,
    // Held across the transport call so `retire` waits out an in-flight edit.
    state: Mutex<ReporterState>,
}

impl ProgressReporter {
    pub fn new(transport: Arc<dyn Transport>, chat_id: impl Into<String>, handle: Option<i64>) -> Self {
        Self {
            transport,
            chat_id: chat_id.into(),
            handle,
            state: Mutex::new(ReporterState {
                closed: false,
                last_text: None,
            }),
        }
    }

    /// Overwrite the indicator. Skipped when there is no indicator, after
    /// retirement, and when the text has not changed.
    pub async fn update(&self, text: &str) {
        let Some(handle) = self.handle else {
            return;
        };
        let mut state = self.state.lock().await;
        if state.closed || state.last_text.as_deref() == Some(text) {
            return;
        }
        match self.transport.update_progress(&self.chat_id, handle, text).await {
            Ok(()) => state.last_text = Some(text.to_string()),
            Err(e) => tracing::debug!(handle, "Progress update failed: {e}"),
        }
    }

    /// Stop all further updates and remove the indicator.
    pub async fn retire(&self) {
        let mut state = self.state.lock().await;
        if state.closed {
            return;
        }
        state.closed = true;
        if let Some(handle) = self.handle {
            if let Err(e) = self.transport.delete_progress(&self.chat_id, handle).await {
                tracing::debug!(handle, "Progress delete failed: {e}");
            }
        }
    }

    pub async fn is_retired(&self) -> bool {
        self.state.lock().await.closed
    }

    /// Send `text` as one or more messages within the transport limit.
    pub async fn deliver(&self, text: &str) {
        for chunk in chunk_message(text, MAX_MESSAGE_CHARS) {
            if let Err(e) = self.transport.send_message(&self.chat_id, &chunk).await {
                tracing::warn!(chat_id = %self.chat_id, "Result delivery failed: {e}");
            }
        }
    }

    /// Send a single short message.
    pub async fn notify(&self, text: &str) {
        if let Err(e) = self.transport.send_message(&self.chat_id, text).await {
            tracing::warn!(chat_id = %self.chat_id, "Notification failed: {e}");
        }
    }
}

/// What the indicator of one task attempt shows.
#[derive(Debug)]
pub struct ProgressView {
    task_id: i64,
    kind: AgentKind,
    started: Instant,
    /// Sub-roles in the order they were delegated to.
    roles: Vec<String>,
    current_role: Option<String>,
    activity: Vec<String>,
}

impl ProgressView {
    pub fn new(task_id: i64, kind: AgentKind) -> Self {
        Self {
            task_id,
            kind,
            started: Instant::now(),
            roles: Vec::new(),
            current_role: None,
            activity: Vec::new(),
        }
    }

    pub fn roles(&self) -> &[String] {
        &self.roles
    }

    /// Account for one tool invocation.
    pub fn record_tool(&mut self, call: &ToolInvocation, repos_dir: &Path) {
        let line = match call.delegation() {
            Some(role) => {
                self.current_role = Some(role.to_string());
                self.roles.push(role.to_string());
                format!("  > {role}: {}", call.delegation_description())
            }
            None => {
                let desc = describe_tool_call(call, repos_dir);
                match &self.current_role {
                    Some(role) => format!("  > {role}: {desc}"),
                    None => format!("  > {desc}"),
                }
            }
        };
        self.activity.push(line);
        if self.activity.len() > RECENT_ACTIVITY {
            self.activity.remove(0);
        }
    }

    pub fn render(&self) -> String {
        self.render_at(self.started.elapsed())
    }

    pub fn render_at(&self, elapsed: Duration) -> String {
        let clock = format_elapsed(elapsed);
        match self.kind {
            AgentKind::Orchestrated => {
                let mut text = format!("[#{}] Multi-agent ({clock})", self.task_id);
                if !self.roles.is_empty() {
                    text.push_str(&format!("\nAgents: {}", self.roles.join(" > ")));
                }
                match self.activity.last() {
                    Some(line) => text.push_str(&format!("\n{line}")),
                    None => text.push_str("\nStarting orchestrator..."),
                }
                text
            }
            AgentKind::Direct => {
                let mut text = format!("[#{}] Single agent ({clock})", self.task_id);
                if self.activity.is_empty() {
                    text.push_str("\nExecuting...");
                }
                for line in &self.activity {
                    text.push('\n');
                    text.push_str(line);
                }
                text
            }
        }
    }
}

/// `42s` or `3m 07s`.
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    if secs < 60 {
        format!("{secs}s")
    } else {
        format!("{}m {:02}s", secs / 60, secs % 60)
    }
}

/// Aborts the heartbeat task when dropped.
pub struct HeartbeatGuard(JoinHandle<()>);

impl Drop for HeartbeatGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Re-render the indicator every `interval` until the guard is dropped.
pub fn spawn_heartbeat(
    reporter: Arc<ProgressReporter>,
    view: Arc<StdMutex<ProgressView>>,
    interval: Duration,
) -> HeartbeatGuard {
    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // first tick fires immediately
        loop {
            ticker.tick().await;
            let text = match view.lock() {
                Ok(view) => view.render(),
                Err(_) => return,
            };
            reporter.update(&text).await;
        }
    });
    HeartbeatGuard(handle)
}
