//! Shared fixtures: a recording transport, scripted agent runners and a
//! fully wired application over an in-memory store.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use secrecy::SecretString;

use agent_dispatch::app::AppContext;
use agent_dispatch::channels::Transport;
use agent_dispatch::config::{
    AgentConfig, DispatchConfig, OrchestrationMode, OrphanPolicy, SchedulerConfig, ShellConfig,
    SupervisorConfig, TelegramConfig,
};
use agent_dispatch::error::{ChannelError, RunError};
use agent_dispatch::store::{Database, LibSqlBackend};
use agent_dispatch::worker::events::AgentEvent;
use agent_dispatch::worker::{AgentKind, AgentProcess, AgentRequest, AgentRunner, ExitInfo};

// ── Transport ───────────────────────────────────────────────────────

/// Records every transport call as a short string.
#[derive(Default)]
pub struct RecordingTransport {
    events: Mutex<Vec<String>>,
    next_handle: Mutex<i64>,
}

impl RecordingTransport {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn sent(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| e.strip_prefix("send:").map(str::to_string))
            .collect()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.events().iter().filter(|e| e.starts_with(prefix)).count()
    }

    fn push(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn create_progress(&self, _chat: &str, text: &str) -> Result<i64, ChannelError> {
        let handle = {
            let mut next = self.next_handle.lock().unwrap();
            *next += 1;
            *next
        };
        self.push(format!("create:{handle}:{text}"));
        Ok(handle)
    }

    async fn update_progress(&self, _chat: &str, handle: i64, text: &str) -> Result<(), ChannelError> {
        self.push(format!("update:{handle}:{text}"));
        Ok(())
    }

    async fn delete_progress(&self, _chat: &str, handle: i64) -> Result<(), ChannelError> {
        self.push(format!("delete:{handle}"));
        Ok(())
    }

    async fn send_message(&self, _chat: &str, text: &str) -> Result<(), ChannelError> {
        self.push(format!("send:{text}"));
        Ok(())
    }
}

// ── Scripted agents ─────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum Step {
    Emit(AgentEvent),
    Delay(Duration),
    /// Never produce another event; only termination ends the run.
    Hang,
    /// Panic inside the supervising unit.
    Panic,
}

#[derive(Debug, Clone)]
pub struct Script {
    pub steps: Vec<Step>,
    pub exit_code: i32,
}

impl Script {
    pub fn ok(text: &str) -> Self {
        Self {
            steps: vec![Step::Emit(result(text, false))],
            exit_code: 0,
        }
    }

    pub fn slow_ok(text: &str, delay: Duration) -> Self {
        Self {
            steps: vec![Step::Delay(delay), Step::Emit(result(text, false))],
            exit_code: 0,
        }
    }

    pub fn error(text: &str) -> Self {
        Self {
            steps: vec![Step::Emit(result(text, true))],
            exit_code: 1,
        }
    }

    pub fn hang() -> Self {
        Self {
            steps: vec![Step::Hang],
            exit_code: 0,
        }
    }

    pub fn with_session(mut self, id: &str) -> Self {
        self.steps.insert(
            0,
            Step::Emit(AgentEvent::Init {
                session_id: id.into(),
            }),
        );
        self
    }
}

pub fn result(text: &str, is_error: bool) -> AgentEvent {
    AgentEvent::Result {
        text: text.into(),
        session_id: None,
        is_error,
    }
}

/// Plays scripts keyed by prompt; each spawn consumes the next script for
/// its prompt and falls back to a plain success.
pub struct ScriptedRunner {
    kind: AgentKind,
    available: bool,
    scripts: Mutex<HashMap<String, VecDeque<Script>>>,
    pub requests: Mutex<Vec<AgentRequest>>,
    /// `start:<prompt>`, `end:<prompt>` and `terminated:<prompt>`, shared
    /// across runners so ordering can be checked globally.
    log: Arc<Mutex<Vec<String>>>,
}

impl ScriptedRunner {
    pub fn new(kind: AgentKind, log: Arc<Mutex<Vec<String>>>) -> Self {
        Self {
            kind,
            available: true,
            scripts: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
            log,
        }
    }

    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    pub fn script(&self, prompt: &str, script: Script) {
        self.scripts
            .lock()
            .unwrap()
            .entry(prompt.to_string())
            .or_default()
            .push_back(script);
    }

    pub fn spawn_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

struct ScriptedProcess {
    prompt: String,
    steps: VecDeque<Step>,
    exit_code: i32,
    log: Arc<Mutex<Vec<String>>>,
    ended: bool,
}

impl ScriptedProcess {
    fn end(&mut self, label: &str) {
        if !self.ended {
            self.ended = true;
            self.log
                .lock()
                .unwrap()
                .push(format!("{label}:{}", self.prompt));
        }
    }
}

#[async_trait]
impl AgentProcess for ScriptedProcess {
    async fn next_event(&mut self) -> Result<Option<AgentEvent>, RunError> {
        while let Some(step) = self.steps.pop_front() {
            match step {
                Step::Emit(event) => return Ok(Some(event)),
                Step::Delay(d) => tokio::time::sleep(d).await,
                Step::Hang => {
                    self.steps.push_front(Step::Hang);
                    std::future::pending::<()>().await;
                }
                Step::Panic => panic!("scripted agent panic: {}", self.prompt),
            }
        }
        Ok(None)
    }

    async fn finish(&mut self) -> Result<ExitInfo, RunError> {
        self.end("end");
        Ok(ExitInfo {
            code: Some(self.exit_code),
            stderr: format!("scripted exit {}", self.exit_code),
        })
    }

    async fn terminate(&mut self, _grace: Duration) {
        self.end("terminated");
    }
}

#[async_trait]
impl AgentRunner for ScriptedRunner {
    fn kind(&self) -> AgentKind {
        self.kind
    }

    fn is_available(&self) -> bool {
        self.available
    }

    async fn spawn(&self, request: &AgentRequest) -> Result<Box<dyn AgentProcess>, RunError> {
        self.requests.lock().unwrap().push(request.clone());
        let script = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&request.prompt)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Script::ok(&format!("done: {}", request.prompt)));

        self.log
            .lock()
            .unwrap()
            .push(format!("start:{}", request.prompt));

        Ok(Box::new(ScriptedProcess {
            prompt: request.prompt.clone(),
            steps: script.steps.into(),
            exit_code: script.exit_code,
            log: self.log.clone(),
            ended: false,
        }))
    }
}

// ── Harness ─────────────────────────────────────────────────────────

pub const CHAT: &str = "555";

pub struct Harness {
    pub app: Arc<AppContext>,
    pub db: Arc<dyn Database>,
    pub transport: Arc<RecordingTransport>,
    pub orchestrated: Arc<ScriptedRunner>,
    pub direct: Arc<ScriptedRunner>,
    pub log: Arc<Mutex<Vec<String>>>,
    pub dir: tempfile::TempDir,
}

pub fn test_config(dir: &std::path::Path, orchestration: OrchestrationMode) -> DispatchConfig {
    let repos_dir = dir.join("repos");
    DispatchConfig {
        db_path: dir.join("dispatch.db"),
        repos_dir: repos_dir.clone(),
        home_dir: dir.to_path_buf(),
        context_window: 20,
        orphan_policy: OrphanPolicy::Fail,
        log_dir: None,
        scheduler: SchedulerConfig {
            poll_interval: Duration::from_millis(20),
            stop_margin: Duration::from_millis(500),
        },
        supervisor: SupervisorConfig {
            heartbeat_interval: Duration::from_millis(50),
            kill_grace: Duration::from_millis(100),
            orchestration,
            repos_dir,
        },
        agent: AgentConfig::default(),
        shell: ShellConfig {
            working_dir: dir.to_path_buf(),
            ..ShellConfig::default()
        },
        telegram: TelegramConfig {
            bot_token: SecretString::from("test-token".to_string()),
            allowed_users: Vec::new(),
        },
    }
}

impl Harness {
    pub async fn new(orchestration: OrchestrationMode) -> Self {
        Self::with_runners(orchestration, true).await
    }

    pub async fn with_runners(orchestration: OrchestrationMode, orchestrator_available: bool) -> Self {
        let dir = tempfile::tempdir().unwrap();
        for repo in ["web", "api"] {
            std::fs::create_dir_all(dir.path().join("repos").join(repo)).unwrap();
        }
        let config = test_config(dir.path(), orchestration);

        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let transport = Arc::new(RecordingTransport::default());
        let log = Arc::new(Mutex::new(Vec::new()));

        let mut orchestrated = ScriptedRunner::new(AgentKind::Orchestrated, log.clone());
        if !orchestrator_available {
            orchestrated = orchestrated.unavailable();
        }
        let orchestrated = Arc::new(orchestrated);
        let direct = Arc::new(ScriptedRunner::new(AgentKind::Direct, log.clone()));

        let app = Arc::new(AppContext::build(
            &config,
            db.clone(),
            transport.clone(),
            orchestrated.clone(),
            direct.clone(),
        ));

        Self {
            app,
            db,
            transport,
            orchestrated,
            direct,
            log,
            dir,
        }
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn position(&self, entry: &str) -> usize {
        self.log()
            .iter()
            .position(|e| e == entry)
            .unwrap_or_else(|| panic!("{entry} not in log {:?}", self.log()))
    }

    pub fn repo(&self, name: &str) -> PathBuf {
        self.dir.path().join("repos").join(name)
    }
}

/// Poll `check` every 10ms until it holds, panicking after 5s.
pub async fn wait_until<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check().await {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
