//! Process supervisor: drives one task to a terminal state.
//!
//! An execution is a sequence of attempts. Each attempt spawns an agent with
//! one strategy, consumes its event stream, and ends completed, failed or
//! cancelled. Failures go through [`next_step`] to decide whether to retry
//! without the session, fall back to the direct strategy, or give up.
//!
//! Process shutdown is not a cancellation: an interrupted task keeps its
//! RUNNING row so the startup orphan sweep decides what happens to it.

use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use tokio_util::sync::CancellationToken;

use crate::channels::Transport;
use crate::config::{OrchestrationMode, SupervisorConfig};
use crate::contexts::ContextRegistry;
use crate::error::RunError;
use crate::store::Database;
use crate::worker::events::AgentEvent;
use crate::worker::policy::{AttemptState, Step, next_step};
use crate::worker::progress::{ProgressReporter, ProgressView, spawn_heartbeat};
use crate::worker::runner::{AgentKind, AgentRequest, AgentRunner};
use crate::worker::state::{Task, TaskStatus};

/// Stored when the agent finished without any result text.
pub const NO_RESPONSE: &str = "No response from agent.";

/// What a successful attempt produced.
#[derive(Debug, Clone)]
pub struct AttemptOutput {
    pub kind: AgentKind,
    pub text: String,
    pub session_id: Option<String>,
    pub tool_count: u32,
    /// Sub-roles delegated to, in order.
    pub roles: Vec<String>,
}

enum Attempt {
    Completed(AttemptOutput),
    Failed(RunError),
    Cancelled,
}

pub struct Supervisor {
    db: Arc<dyn Database>,
    transport: Arc<dyn Transport>,
    contexts: Arc<ContextRegistry>,
    orchestrated: Arc<dyn AgentRunner>,
    direct: Arc<dyn AgentRunner>,
    config: SupervisorConfig,
    /// Parent of every unit's cancel token; cancelled on process shutdown.
    shutdown: CancellationToken,
}

impl Supervisor {
    pub fn new(
        db: Arc<dyn Database>,
        transport: Arc<dyn Transport>,
        contexts: Arc<ContextRegistry>,
        orchestrated: Arc<dyn AgentRunner>,
        direct: Arc<dyn AgentRunner>,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            db,
            transport,
            contexts,
            orchestrated,
            direct,
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// Cancel token for a new supervising unit. It fires on an explicit
    /// stop and on shutdown.
    pub fn unit_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }

    /// Interrupt every unit without recording an outcome.
    pub fn begin_shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Strategy for the first attempt of `task`.
    pub fn initial_kind(&self, task: &Task) -> AgentKind {
        let wanted = match self.config.orchestration {
            OrchestrationMode::Auto => true,
            OrchestrationMode::OnRequest => task.orchestration_requested,
            OrchestrationMode::Off => false,
        };
        if !wanted {
            return AgentKind::Direct;
        }
        if self.orchestrated.is_available() {
            AgentKind::Orchestrated
        } else {
            tracing::warn!(task_id = task.id, "Orchestrator unavailable, using single agent");
            AgentKind::Direct
        }
    }

    /// Run `task` (already marked RUNNING) until it is completed, failed or
    /// cancelled. Returns the status the task ended in.
    pub async fn execute(&self, task: Task, cancel: CancellationToken) -> TaskStatus {
        let reporter = Arc::new(ProgressReporter::new(
            self.transport.clone(),
            task.submitter.clone(),
            task.progress_handle,
        ));
        let working_dir = self.contexts.working_dir(&task.context).await;
        let mut state = AttemptState {
            kind: self.initial_kind(&task),
            resumed: false,
            retried_fresh: false,
            fell_back: false,
        };

        tracing::info!(
            task_id = task.id,
            context = %task.context,
            kind = %state.kind,
            cwd = %working_dir.display(),
            "Task started"
        );

        loop {
            if cancel.is_cancelled() {
                return self.finish_stopped(&task, &reporter).await;
            }

            let resume = match self.db.get_session(&task.submitter, &task.context).await {
                Ok(session) => session,
                Err(e) => {
                    tracing::warn!(task_id = task.id, "Failed to load session: {e}");
                    None
                }
            };
            state.resumed = resume.is_some();

            let request = AgentRequest {
                prompt: task.prompt.clone(),
                working_dir: working_dir.clone(),
                resume,
            };

            let err = match self
                .run_attempt(&task, state.kind, &request, &reporter, &cancel)
                .await
            {
                Attempt::Completed(output) => {
                    return self.finish_completed(&task, output, &reporter).await;
                }
                Attempt::Cancelled => return self.finish_stopped(&task, &reporter).await,
                Attempt::Failed(err) => err,
            };

            tracing::warn!(task_id = task.id, kind = %state.kind, "Attempt failed: {err}");

            match next_step(&err, &state) {
                Step::RetryFresh => {
                    tracing::info!(task_id = task.id, "Session rejected, retrying without resume");
                    if let Err(e) = self.db.clear_session(&task.submitter, &task.context).await {
                        tracing::warn!(task_id = task.id, "Failed to clear session: {e}");
                    }
                    state.retried_fresh = true;
                }
                Step::FallBack => {
                    reporter
                        .update(&format!("[#{}] Falling back to single agent...", task.id))
                        .await;
                    state.kind = AgentKind::Direct;
                    state.fell_back = true;
                }
                Step::Fail => {
                    return self
                        .finish_failed(&task, &err.to_string(), &reporter)
                        .await;
                }
            }
        }
    }

    async fn run_attempt(
        &self,
        task: &Task,
        kind: AgentKind,
        request: &AgentRequest,
        reporter: &Arc<ProgressReporter>,
        cancel: &CancellationToken,
    ) -> Attempt {
        let runner = match kind {
            AgentKind::Orchestrated => &self.orchestrated,
            AgentKind::Direct => &self.direct,
        };

        let view = Arc::new(StdMutex::new(ProgressView::new(task.id, kind)));
        reporter.update(&render(&view)).await;

        let mut process = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Attempt::Cancelled,
            spawned = runner.spawn(request) => match spawned {
                Ok(process) => process,
                Err(e) => return Attempt::Failed(e),
            },
        };
        tracing::debug!(task_id = task.id, kind = %runner.kind(), "Agent attempt running");

        let _heartbeat = spawn_heartbeat(
            reporter.clone(),
            view.clone(),
            self.config.heartbeat_interval,
        );

        let mut tool_count = 0u32;
        let mut session_id: Option<String> = None;
        let mut outcome: Option<(String, bool)> = None;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                event = process.next_event() => Some(event),
            };
            let Some(event) = next else {
                process.terminate(self.config.kill_grace).await;
                return Attempt::Cancelled;
            };

            match event {
                Ok(Some(AgentEvent::Init { session_id: id })) => session_id = Some(id),
                Ok(Some(AgentEvent::Assistant { tool_calls })) => {
                    if tool_calls.is_empty() {
                        continue;
                    }
                    let text = {
                        let mut view = view.lock().unwrap_or_else(PoisonError::into_inner);
                        for call in &tool_calls {
                            tool_count += 1;
                            view.record_tool(call, &self.config.repos_dir);
                        }
                        view.render()
                    };
                    reporter.update(&text).await;
                }
                Ok(Some(AgentEvent::Result {
                    text,
                    session_id: result_session,
                    is_error,
                })) => {
                    if session_id.is_none() {
                        session_id = result_session;
                    }
                    outcome = Some((text, is_error));
                }
                Ok(None) => break,
                Err(e) => {
                    process.terminate(self.config.kill_grace).await;
                    return Attempt::Failed(e);
                }
            }
        }

        let finished = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            exit = process.finish() => Some(exit),
        };
        let exit = match finished {
            None => {
                process.terminate(self.config.kill_grace).await;
                return Attempt::Cancelled;
            }
            Some(Err(e)) => return Attempt::Failed(e),
            Some(Ok(exit)) => exit,
        };

        let roles = view
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .roles()
            .to_vec();

        let text = match outcome {
            Some((text, true)) => {
                let message = if text.trim().is_empty() {
                    format!("agent run failed (exit code {:?})", exit.code)
                } else {
                    text
                };
                return Attempt::Failed(RunError::Agent(message));
            }
            Some((text, false)) => text,
            None if !exit.success() => {
                return Attempt::Failed(RunError::Exited {
                    code: exit.code,
                    stderr: exit.stderr,
                });
            }
            None => String::new(),
        };

        let text = if text.trim().is_empty() {
            NO_RESPONSE.to_string()
        } else {
            text
        };

        Attempt::Completed(AttemptOutput {
            kind,
            text,
            session_id,
            tool_count,
            roles,
        })
    }

    async fn finish_completed(
        &self,
        task: &Task,
        output: AttemptOutput,
        reporter: &ProgressReporter,
    ) -> TaskStatus {
        let mut recorded = self
            .db
            .mark_completed(task.id, &output.text, output.tool_count)
            .await;
        if let Err(e) = &recorded {
            tracing::warn!(task_id = task.id, "Failed to record completion, retrying: {e}");
            recorded = self
                .db
                .mark_completed(task.id, &output.text, output.tool_count)
                .await;
        }

        match recorded {
            Ok(true) => {
                self.record_conversation(task, &output).await;
                reporter.retire().await;
                reporter.deliver(&format_result(task, &output)).await;
                tracing::info!(
                    task_id = task.id,
                    tools = output.tool_count,
                    kind = %output.kind,
                    "Task completed"
                );
                TaskStatus::Completed
            }
            Ok(false) => {
                reporter.retire().await;
                self.settled_status(task.id).await
            }
            Err(e) => {
                tracing::error!(task_id = task.id, "Failed to record completion: {e}");
                reporter.retire().await;
                reporter.deliver(&format_result(task, &output)).await;
                TaskStatus::Running
            }
        }
    }

    /// Session handle and transcript of a completed task.
    async fn record_conversation(&self, task: &Task, output: &AttemptOutput) {
        if let Some(session_id) = &output.session_id {
            if let Err(e) = self
                .db
                .set_session(&task.submitter, &task.context, session_id)
                .await
            {
                tracing::warn!(task_id = task.id, "Failed to save session: {e}");
            }
        }
        for (role, content) in [("user", task.prompt.as_str()), ("assistant", output.text.as_str())] {
            if let Err(e) = self
                .db
                .append_turn(&task.submitter, &task.context, role, content)
                .await
            {
                tracing::warn!(task_id = task.id, "Failed to record {role} turn: {e}");
            }
        }
    }

    async fn finish_failed(&self, task: &Task, message: &str, reporter: &ProgressReporter) -> TaskStatus {
        let text = format!("{} Error: {message}", task.tag());
        let mut recorded = self.db.mark_failed(task.id, message).await;
        if let Err(e) = &recorded {
            tracing::warn!(task_id = task.id, "Failed to record failure, retrying: {e}");
            recorded = self.db.mark_failed(task.id, message).await;
        }

        match recorded {
            Ok(true) => {
                reporter.retire().await;
                reporter.deliver(&text).await;
                tracing::info!(task_id = task.id, "Task failed");
                TaskStatus::Failed
            }
            Ok(false) => {
                reporter.retire().await;
                self.settled_status(task.id).await
            }
            Err(e) => {
                tracing::error!(task_id = task.id, "Failed to record failure: {e}");
                reporter.retire().await;
                reporter.deliver(&text).await;
                TaskStatus::Running
            }
        }
    }

    /// The unit's token fired: an explicit stop, or process shutdown.
    async fn finish_stopped(&self, task: &Task, reporter: &ProgressReporter) -> TaskStatus {
        if self.is_shutting_down() {
            tracing::info!(task_id = task.id, "Task interrupted by shutdown, left for restart recovery");
            return TaskStatus::Running;
        }
        self.finish_cancelled(task, reporter).await
    }

    async fn finish_cancelled(&self, task: &Task, reporter: &ProgressReporter) -> TaskStatus {
        let text = format!("{} Cancelled.", task.tag());
        let mut recorded = self.db.mark_cancelled(task.id).await;
        if let Err(e) = &recorded {
            tracing::warn!(task_id = task.id, "Failed to record cancellation, retrying: {e}");
            recorded = self.db.mark_cancelled(task.id).await;
        }

        match recorded {
            Ok(true) => {
                reporter.retire().await;
                reporter.notify(&text).await;
                tracing::info!(task_id = task.id, "Task cancelled");
                TaskStatus::Cancelled
            }
            Ok(false) => {
                reporter.retire().await;
                self.settled_status(task.id).await
            }
            Err(e) => {
                tracing::error!(task_id = task.id, "Failed to record cancellation: {e}");
                reporter.retire().await;
                reporter.notify(&text).await;
                TaskStatus::Running
            }
        }
    }

    /// Cancel a task whose supervising unit was aborted before it could
    /// record an outcome itself.
    pub async fn abandon(&self, task_id: i64) -> TaskStatus {
        match self.load_abandoned(task_id).await {
            Some((task, reporter)) => self.finish_cancelled(&task, &reporter).await,
            None => TaskStatus::Cancelled,
        }
    }

    /// Fail a task whose supervising unit died (panicked) without
    /// recording an outcome.
    pub async fn fail_abandoned(&self, task_id: i64, message: &str) -> TaskStatus {
        match self.load_abandoned(task_id).await {
            Some((task, reporter)) => self.finish_failed(&task, message, &reporter).await,
            None => TaskStatus::Failed,
        }
    }

    async fn load_abandoned(&self, task_id: i64) -> Option<(Task, ProgressReporter)> {
        match self.db.get_task(task_id).await {
            Ok(Some(task)) => {
                let reporter = ProgressReporter::new(
                    self.transport.clone(),
                    task.submitter.clone(),
                    task.progress_handle,
                );
                Some((task, reporter))
            }
            Ok(None) => {
                tracing::warn!(task_id, "Abandoned task not found");
                None
            }
            Err(e) => {
                tracing::error!(task_id, "Failed to load abandoned task: {e}");
                None
            }
        }
    }

    async fn settled_status(&self, task_id: i64) -> TaskStatus {
        match self.db.get_task(task_id).await {
            Ok(Some(task)) => {
                tracing::debug!(task_id, status = %task.status, "Task already settled");
                task.status
            }
            _ => TaskStatus::Cancelled,
        }
    }
}

fn render(view: &StdMutex<ProgressView>) -> String {
    view.lock().unwrap_or_else(PoisonError::into_inner).render()
}

/// Final message for a completed task.
pub fn format_result(task: &Task, output: &AttemptOutput) -> String {
    let tools = output.tool_count;
    let (suffix, summary) = if !output.roles.is_empty() {
        (
            " multi-agent".to_string(),
            format!(
                "\n_Agents used: {} ({tools} tool calls)_\n",
                output.roles.join(" > ")
            ),
        )
    } else if tools > 0 {
        let noun = match output.kind {
            AgentKind::Direct => "lookups",
            AgentKind::Orchestrated => "tools",
        };
        (format!(" ({tools} {noun})"), String::new())
    } else {
        (String::new(), String::new())
    };
    format!("*{}{suffix}*{summary}\n{}", task.tag(), output.text)
}

#[cfg(test)]
mod tests {
    use std::collections::{HashSet, VecDeque};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::config::OrphanPolicy;
    use crate::error::{ChannelError, DatabaseError};
    use crate::store::{LibSqlBackend, Turn};
    use crate::worker::events::ToolInvocation;
    use crate::worker::runner::{AgentProcess, ExitInfo};
    use crate::worker::state::NewTask;

    #[derive(Default)]
    struct Recorder {
        sent: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl Transport for Recorder {
        async fn create_progress(&self, _c: &str, _t: &str) -> Result<i64, ChannelError> {
            Ok(1)
        }
        async fn update_progress(&self, _c: &str, _h: i64, _t: &str) -> Result<(), ChannelError> {
            Ok(())
        }
        async fn delete_progress(&self, _c: &str, _h: i64) -> Result<(), ChannelError> {
            Ok(())
        }
        async fn send_message(&self, _c: &str, text: &str) -> Result<(), ChannelError> {
            self.sent.lock().unwrap().push(text.to_string());
            Ok(())
        }
    }

    /// Replays a fixed list of events per spawn, then exits with `code`.
    struct Scripted {
        kind: AgentKind,
        runs: StdMutex<VecDeque<(Vec<AgentEvent>, i32)>>,
        requests: StdMutex<Vec<AgentRequest>>,
    }

    impl Scripted {
        fn new(kind: AgentKind, runs: Vec<(Vec<AgentEvent>, i32)>) -> Arc<Self> {
            Arc::new(Self {
                kind,
                runs: StdMutex::new(runs.into()),
                requests: StdMutex::new(Vec::new()),
            })
        }
    }

    struct Replay {
        events: VecDeque<AgentEvent>,
        code: i32,
    }

    #[async_trait]
    impl AgentProcess for Replay {
        async fn next_event(&mut self) -> Result<Option<AgentEvent>, RunError> {
            Ok(self.events.pop_front())
        }
        async fn finish(&mut self) -> Result<ExitInfo, RunError> {
            Ok(ExitInfo {
                code: Some(self.code),
                stderr: format!("exit {}", self.code),
            })
        }
        async fn terminate(&mut self, _grace: Duration) {}
    }

    #[async_trait]
    impl AgentRunner for Scripted {
        fn kind(&self) -> AgentKind {
            self.kind
        }
        fn is_available(&self) -> bool {
            true
        }
        async fn spawn(&self, request: &AgentRequest) -> Result<Box<dyn AgentProcess>, RunError> {
            self.requests.lock().unwrap().push(request.clone());
            let (events, code) = self
                .runs
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or((Vec::new(), 1));
            Ok(Box::new(Replay {
                events: events.into(),
                code,
            }))
        }
    }

    fn result(text: &str, is_error: bool) -> AgentEvent {
        AgentEvent::Result {
            text: text.into(),
            session_id: None,
            is_error,
        }
    }

    async fn setup(
        orchestrated: Arc<Scripted>,
        direct: Arc<Scripted>,
    ) -> (Supervisor, Arc<dyn Database>, Arc<Recorder>, Task) {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        setup_with_db(db, orchestrated, direct).await
    }

    async fn setup_with_db(
        db: Arc<dyn Database>,
        orchestrated: Arc<Scripted>,
        direct: Arc<Scripted>,
    ) -> (Supervisor, Arc<dyn Database>, Arc<Recorder>, Task) {
        let recorder = Arc::new(Recorder::default());
        let contexts = Arc::new(ContextRegistry::new(
            db.clone(),
            std::env::temp_dir(),
            PathBuf::from("/nonexistent"),
        ));
        let supervisor = Supervisor::new(
            db.clone(),
            recorder.clone(),
            contexts,
            orchestrated,
            direct,
            SupervisorConfig::default(),
        );
        let task = db.submit_task(NewTask::new("chat", "vm", "do it")).await.unwrap();
        assert!(db.mark_running(task.id).await.unwrap());
        (supervisor, db, recorder, task)
    }

    #[tokio::test]
    async fn completes_and_persists_session_and_turns() {
        let orch = Scripted::new(
            AgentKind::Orchestrated,
            vec![(
                vec![
                    AgentEvent::Init {
                        session_id: "s-1".into(),
                    },
                    AgentEvent::Assistant {
                        tool_calls: vec![ToolInvocation {
                            name: "Read".into(),
                            input: serde_json::json!({"file_path": "/x"}),
                        }],
                    },
                    result("all done", false),
                ],
                0,
            )],
        );
        let direct = Scripted::new(AgentKind::Direct, vec![]);
        let (sup, db, rec, task) = setup(orch, direct).await;

        let status = sup.execute(task.clone(), CancellationToken::new()).await;
        assert_eq!(status, TaskStatus::Completed);

        let stored = db.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.result.as_deref(), Some("all done"));
        assert_eq!(stored.tool_count, 1);
        assert_eq!(db.get_session("chat", "vm").await.unwrap().as_deref(), Some("s-1"));
        let turns = db.recent_turns("chat", "vm", 10).await.unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].role, "user");

        let sent = rec.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].ends_with("\nall done"));
    }

    #[tokio::test]
    async fn orchestrated_error_falls_back_to_direct() {
        let orch = Scripted::new(
            AgentKind::Orchestrated,
            vec![(vec![result("orchestrator crashed", true)], 1)],
        );
        let direct = Scripted::new(AgentKind::Direct, vec![(vec![result("ok", false)], 0)]);
        let (sup, db, _rec, task) = setup(orch.clone(), direct.clone()).await;

        assert_eq!(sup.execute(task.clone(), CancellationToken::new()).await, TaskStatus::Completed);
        assert_eq!(orch.requests.lock().unwrap().len(), 1);
        assert_eq!(direct.requests.lock().unwrap().len(), 1);
        let stored = db.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.result.as_deref(), Some("ok"));
    }

    #[tokio::test]
    async fn silent_exit_fails_with_stderr() {
        let orch = Scripted::new(AgentKind::Orchestrated, vec![(vec![], 2)]);
        let direct = Scripted::new(AgentKind::Direct, vec![(vec![], 2)]);
        let (sup, db, rec, task) = setup(orch, direct).await;

        assert_eq!(sup.execute(task.clone(), CancellationToken::new()).await, TaskStatus::Failed);
        let stored = db.get_task(task.id).await.unwrap().unwrap();
        assert!(stored.result.unwrap().contains("exit 2"));
        let sent = rec.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].starts_with("[#1 | vm] Error:"));
    }

    #[tokio::test]
    async fn empty_result_gets_placeholder() {
        let orch = Scripted::new(AgentKind::Orchestrated, vec![(vec![], 0)]);
        let direct = Scripted::new(AgentKind::Direct, vec![]);
        let (sup, db, _rec, task) = setup(orch, direct).await;

        assert_eq!(sup.execute(task.clone(), CancellationToken::new()).await, TaskStatus::Completed);
        let stored = db.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.result.as_deref(), Some(NO_RESPONSE));
    }

    #[tokio::test]
    async fn pre_cancelled_token_cancels_without_spawning() {
        let orch = Scripted::new(AgentKind::Orchestrated, vec![]);
        let direct = Scripted::new(AgentKind::Direct, vec![]);
        let (sup, db, rec, task) = setup(orch.clone(), direct).await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(sup.execute(task.clone(), cancel).await, TaskStatus::Cancelled);
        assert!(orch.requests.lock().unwrap().is_empty());
        assert_eq!(
            db.get_task(task.id).await.unwrap().unwrap().status,
            TaskStatus::Cancelled
        );
        assert_eq!(rec.sent.lock().unwrap().clone(), vec!["[#1 | vm] Cancelled."]);
    }

    #[tokio::test]
    async fn on_request_mode_respects_task_flag() {
        let orch = Scripted::new(AgentKind::Orchestrated, vec![]);
        let direct = Scripted::new(AgentKind::Direct, vec![]);
        let (mut sup, _db, _rec, mut task) = setup(orch, direct).await;
        sup.config.orchestration = OrchestrationMode::OnRequest;

        assert_eq!(sup.initial_kind(&task), AgentKind::Direct);
        task.orchestration_requested = true;
        assert_eq!(sup.initial_kind(&task), AgentKind::Orchestrated);

        sup.config.orchestration = OrchestrationMode::Off;
        assert_eq!(sup.initial_kind(&task), AgentKind::Direct);
    }

    /// Delegates to an in-memory store, but the first `failures` status
    /// transitions (completed/failed/cancelled) return an error.
    struct FlakyStore {
        inner: LibSqlBackend,
        failures: AtomicUsize,
    }

    impl FlakyStore {
        async fn new(failures: usize) -> Arc<Self> {
            Arc::new(Self {
                inner: LibSqlBackend::new_memory().await.unwrap(),
                failures: AtomicUsize::new(failures),
            })
        }

        fn trip(&self) -> Result<(), DatabaseError> {
            let left = self.failures.load(Ordering::SeqCst);
            if left == 0 {
                return Ok(());
            }
            self.failures.store(left - 1, Ordering::SeqCst);
            Err(DatabaseError::Query("database is locked".into()))
        }
    }

    #[async_trait]
    impl Database for FlakyStore {
        async fn run_migrations(&self) -> Result<(), DatabaseError> {
            self.inner.run_migrations().await
        }
        async fn submit_task(&self, task: NewTask) -> Result<Task, DatabaseError> {
            self.inner.submit_task(task).await
        }
        async fn claim_next(&self, excluded: &HashSet<String>) -> Result<Option<Task>, DatabaseError> {
            self.inner.claim_next(excluded).await
        }
        async fn mark_running(&self, id: i64) -> Result<bool, DatabaseError> {
            self.inner.mark_running(id).await
        }
        async fn mark_completed(&self, id: i64, result: &str, tools: u32) -> Result<bool, DatabaseError> {
            self.trip()?;
            self.inner.mark_completed(id, result, tools).await
        }
        async fn mark_failed(&self, id: i64, error: &str) -> Result<bool, DatabaseError> {
            self.trip()?;
            self.inner.mark_failed(id, error).await
        }
        async fn mark_cancelled(&self, id: i64) -> Result<bool, DatabaseError> {
            self.trip()?;
            self.inner.mark_cancelled(id).await
        }
        async fn get_task(&self, id: i64) -> Result<Option<Task>, DatabaseError> {
            self.inner.get_task(id).await
        }
        async fn recent_tasks(&self, submitter: &str, limit: usize) -> Result<Vec<Task>, DatabaseError> {
            self.inner.recent_tasks(submitter, limit).await
        }
        async fn running_for(&self, context: &str) -> Result<Option<Task>, DatabaseError> {
            self.inner.running_for(context).await
        }
        async fn pending_count(&self, context: &str) -> Result<usize, DatabaseError> {
            self.inner.pending_count(context).await
        }
        async fn all_running(&self) -> Result<Vec<Task>, DatabaseError> {
            self.inner.all_running().await
        }
        async fn cancel_all_pending(&self, context: &str) -> Result<usize, DatabaseError> {
            self.inner.cancel_all_pending(context).await
        }
        async fn set_progress_handle(&self, id: i64, handle: i64) -> Result<(), DatabaseError> {
            self.inner.set_progress_handle(id, handle).await
        }
        async fn recover_orphans(&self, policy: OrphanPolicy) -> Result<Vec<Task>, DatabaseError> {
            self.inner.recover_orphans(policy).await
        }
        async fn get_session(&self, submitter: &str, context: &str) -> Result<Option<String>, DatabaseError> {
            self.inner.get_session(submitter, context).await
        }
        async fn set_session(&self, submitter: &str, context: &str, id: &str) -> Result<(), DatabaseError> {
            self.inner.set_session(submitter, context, id).await
        }
        async fn clear_session(&self, submitter: &str, context: &str) -> Result<(), DatabaseError> {
            self.inner.clear_session(submitter, context).await
        }
        async fn append_turn(
            &self,
            submitter: &str,
            context: &str,
            role: &str,
            content: &str,
        ) -> Result<(), DatabaseError> {
            self.inner.append_turn(submitter, context, role, content).await
        }
        async fn recent_turns(
            &self,
            submitter: &str,
            context: &str,
            limit: usize,
        ) -> Result<Vec<Turn>, DatabaseError> {
            self.inner.recent_turns(submitter, context, limit).await
        }
        async fn clear_turns(&self, submitter: &str, context: &str) -> Result<(), DatabaseError> {
            self.inner.clear_turns(submitter, context).await
        }
        async fn clear_conversation(&self, submitter: &str, context: &str) -> Result<(), DatabaseError> {
            self.inner.clear_conversation(submitter, context).await
        }
        async fn get_active_context(&self, submitter: &str) -> Result<Option<String>, DatabaseError> {
            self.inner.get_active_context(submitter).await
        }
        async fn set_active_context(&self, submitter: &str, context: &str) -> Result<(), DatabaseError> {
            self.inner.set_active_context(submitter, context).await
        }
        async fn list_custom_contexts(&self) -> Result<Vec<(String, String)>, DatabaseError> {
            self.inner.list_custom_contexts().await
        }
        async fn add_custom_context(&self, name: &str, path: &str) -> Result<(), DatabaseError> {
            self.inner.add_custom_context(name, path).await
        }
        async fn remove_custom_context(&self, name: &str) -> Result<bool, DatabaseError> {
            self.inner.remove_custom_context(name).await
        }
    }

    #[tokio::test]
    async fn transient_store_error_is_retried() {
        let store = FlakyStore::new(1).await;
        let orch = Scripted::new(AgentKind::Orchestrated, vec![(vec![result("fine", false)], 0)]);
        let direct = Scripted::new(AgentKind::Direct, vec![]);
        let (sup, db, rec, task) = setup_with_db(store, orch, direct).await;

        assert_eq!(sup.execute(task.clone(), CancellationToken::new()).await, TaskStatus::Completed);
        let stored = db.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        assert_eq!(rec.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn persistent_store_error_still_reports_outcome() {
        let store = FlakyStore::new(2).await;
        let orch = Scripted::new(AgentKind::Orchestrated, vec![(vec![], 2)]);
        let direct = Scripted::new(AgentKind::Direct, vec![(vec![], 2)]);
        let (sup, db, rec, task) = setup_with_db(store, orch, direct).await;

        assert_eq!(sup.execute(task.clone(), CancellationToken::new()).await, TaskStatus::Running);
        assert_eq!(
            db.get_task(task.id).await.unwrap().unwrap().status,
            TaskStatus::Running
        );
        let sent = rec.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].starts_with("[#1 | vm] Error:"));
    }

    #[tokio::test]
    async fn completion_after_stop_leaves_no_conversation() {
        let orch = Scripted::new(
            AgentKind::Orchestrated,
            vec![(
                vec![
                    AgentEvent::Init {
                        session_id: "s-late".into(),
                    },
                    result("too late", false),
                ],
                0,
            )],
        );
        let direct = Scripted::new(AgentKind::Direct, vec![]);
        let (sup, db, rec, task) = setup(orch, direct).await;
        // A stop settled the row while the agent was still finishing.
        assert!(db.mark_cancelled(task.id).await.unwrap());

        assert_eq!(sup.execute(task.clone(), CancellationToken::new()).await, TaskStatus::Cancelled);
        assert_eq!(db.get_session("chat", "vm").await.unwrap(), None);
        assert!(db.recent_turns("chat", "vm", 10).await.unwrap().is_empty());
        assert!(rec.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn shutdown_interrupts_without_recording() {
        let orch = Scripted::new(AgentKind::Orchestrated, vec![]);
        let direct = Scripted::new(AgentKind::Direct, vec![]);
        let (sup, db, rec, task) = setup(orch.clone(), direct).await;

        let cancel = sup.unit_token();
        sup.begin_shutdown();
        assert!(cancel.is_cancelled());

        assert_eq!(sup.execute(task.clone(), cancel).await, TaskStatus::Running);
        assert!(orch.requests.lock().unwrap().is_empty());
        assert_eq!(
            db.get_task(task.id).await.unwrap().unwrap().status,
            TaskStatus::Running
        );
        assert!(rec.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failing_an_abandoned_task_reports_it() {
        let orch = Scripted::new(AgentKind::Orchestrated, vec![]);
        let direct = Scripted::new(AgentKind::Direct, vec![]);
        let (sup, db, rec, task) = setup(orch, direct).await;

        assert_eq!(sup.fail_abandoned(task.id, "Internal error").await, TaskStatus::Failed);
        let stored = db.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.result.as_deref(), Some("Internal error"));
        assert_eq!(
            rec.sent.lock().unwrap().clone(),
            vec!["[#1 | vm] Error: Internal error"]
        );
    }

    fn sample_task() -> Task {
        Task {
            id: 4,
            submitter: "c".into(),
            context: "web".into(),
            prompt: "p".into(),
            status: TaskStatus::Running,
            result: None,
            tool_count: 0,
            progress_handle: None,
            orchestration_requested: false,
            created_at: chrono::Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    #[test]
    fn result_formatting() {
        let task = sample_task();
        let mut out = AttemptOutput {
            kind: AgentKind::Direct,
            text: "hello".into(),
            session_id: None,
            tool_count: 0,
            roles: vec![],
        };
        assert_eq!(format_result(&task, &out), "*[#4 | web]*\nhello");

        out.tool_count = 3;
        assert_eq!(format_result(&task, &out), "*[#4 | web] (3 lookups)*\nhello");

        out.kind = AgentKind::Orchestrated;
        assert_eq!(format_result(&task, &out), "*[#4 | web] (3 tools)*\nhello");

        out.roles = vec!["planner".into(), "coder".into()];
        assert_eq!(
            format_result(&task, &out),
            "*[#4 | web] multi-agent*\n_Agents used: planner > coder (3 tool calls)_\n\nhello"
        );
    }
}
