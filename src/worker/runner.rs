//! Agent process abstraction.
//!
//! A runner turns an [`AgentRequest`] into a live [`AgentProcess`] that yields
//! normalized [`AgentEvent`]s. The supervisor only talks to these traits, so
//! strategies and test doubles are interchangeable.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;

use crate::error::RunError;
use crate::worker::events::{AgentEvent, parse_line};

/// Stderr kept for error reports, in bytes.
const STDERR_TAIL_BYTES: usize = 8 * 1024;

/// Execution strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentKind {
    /// Orchestrator that delegates to sub-roles.
    Orchestrated,
    /// Plain single-agent CLI invocation.
    Direct,
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Orchestrated => write!(f, "orchestrated"),
            Self::Direct => write!(f, "direct"),
        }
    }
}

/// Everything an agent invocation needs.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub prompt: String,
    pub working_dir: PathBuf,
    /// Session handle to continue, if any.
    pub resume: Option<String>,
}

/// How a finished process exited.
#[derive(Debug, Clone, Default)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub stderr: String,
}

impl ExitInfo {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Launches agent processes for one strategy.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    fn kind(&self) -> AgentKind;

    /// Whether this strategy can be used at all on this host.
    fn is_available(&self) -> bool;

    async fn spawn(&self, request: &AgentRequest) -> Result<Box<dyn AgentProcess>, RunError>;
}

/// A running agent.
#[async_trait]
pub trait AgentProcess: Send {
    /// Next event, or `None` once the output stream has ended.
    async fn next_event(&mut self) -> Result<Option<AgentEvent>, RunError>;

    /// Wait for exit after the stream ended.
    async fn finish(&mut self) -> Result<ExitInfo, RunError>;

    /// Ask the process to stop, escalating to a hard kill after `grace`.
    async fn terminate(&mut self, grace: Duration);
}

// ── Subprocess implementation ───────────────────────────────────────

/// An agent running as a child process that writes JSON lines to stdout.
pub struct ChildAgent {
    child: Child,
    stdout: tokio::io::Split<BufReader<ChildStdout>>,
    stderr: Option<JoinHandle<String>>,
}

impl ChildAgent {
    /// Spawn `command` with piped output. The child is killed if this value
    /// is dropped while it is still running.
    pub fn spawn(mut command: Command) -> Result<Self, RunError> {
        let program = command.as_std().get_program().to_string_lossy().into_owned();

        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| RunError::Spawn {
            program: program.clone(),
            reason: e.to_string(),
        })?;

        let stdout = child.stdout.take().ok_or_else(|| RunError::Spawn {
            program: program.clone(),
            reason: "stdout not captured".into(),
        })?;

        // Drain stderr concurrently so a chatty agent never blocks on a full pipe.
        let stderr = child.stderr.take().map(|mut pipe| {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let _ = pipe.read_to_end(&mut buf).await;
                let start = buf.len().saturating_sub(STDERR_TAIL_BYTES);
                String::from_utf8_lossy(&buf[start..]).trim().to_string()
            })
        });

        tracing::debug!(program = %program, pid = ?child.id(), "Agent process spawned");

        Ok(Self {
            child,
            stdout: BufReader::with_capacity(64 * 1024, stdout).split(b'\n'),
            stderr,
        })
    }

    async fn collect_stderr(&mut self) -> String {
        match self.stderr.take() {
            Some(handle) => handle.await.unwrap_or_default(),
            None => String::new(),
        }
    }
}

#[async_trait]
impl AgentProcess for ChildAgent {
    async fn next_event(&mut self) -> Result<Option<AgentEvent>, RunError> {
        loop {
            let segment = self
                .stdout
                .next_segment()
                .await
                .map_err(|e| RunError::Stream(e.to_string()))?;

            let Some(bytes) = segment else {
                return Ok(None);
            };

            let line = String::from_utf8_lossy(&bytes);
            if let Some(event) = parse_line(&line) {
                return Ok(Some(event));
            }
        }
    }

    async fn finish(&mut self) -> Result<ExitInfo, RunError> {
        let status = self
            .child
            .wait()
            .await
            .map_err(|e| RunError::Stream(format!("waiting for agent exit: {e}")))?;
        let stderr = self.collect_stderr().await;
        Ok(ExitInfo {
            code: status.code(),
            stderr,
        })
    }

    async fn terminate(&mut self, grace: Duration) {
        send_sigterm(&mut self.child);

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(_) => tracing::debug!("Agent exited after SIGTERM"),
            Err(_) => {
                tracing::warn!(grace_secs = grace.as_secs(), "Agent ignored SIGTERM, killing");
                if let Err(e) = self.child.kill().await {
                    tracing::warn!("Failed to kill agent process: {e}");
                }
            }
        }
    }
}

#[cfg(unix)]
fn send_sigterm(child: &mut Child) {
    let Some(pid) = child.id() else {
        return; // already reaped
    };
    if unsafe { libc::kill(pid as i32, libc::SIGTERM) } != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            tracing::warn!(pid, "Failed to send SIGTERM: {err}");
        }
    }
}

#[cfg(not(unix))]
fn send_sigterm(child: &mut Child) {
    let _ = child.start_kill();
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[tokio::test]
    async fn streams_events_and_skips_noise() {
        let script = r#"
            echo 'not json'
            echo '{"type":"system","subtype":"init","session_id":"s1"}'
            echo ''
            echo '{"type":"result","result":"ok"}'
            echo 'oops' >&2
        "#;
        let mut agent = ChildAgent::spawn(sh(script)).unwrap();

        assert_eq!(
            agent.next_event().await.unwrap(),
            Some(AgentEvent::Init {
                session_id: "s1".into()
            })
        );
        assert!(matches!(
            agent.next_event().await.unwrap(),
            Some(AgentEvent::Result { ref text, .. }) if text == "ok"
        ));
        assert_eq!(agent.next_event().await.unwrap(), None);

        let exit = agent.finish().await.unwrap();
        assert!(exit.success());
        assert_eq!(exit.stderr, "oops");
    }

    #[tokio::test]
    async fn reports_nonzero_exit() {
        let mut agent = ChildAgent::spawn(sh("echo boom >&2; exit 3")).unwrap();
        assert_eq!(agent.next_event().await.unwrap(), None);
        let exit = agent.finish().await.unwrap();
        assert_eq!(exit.code, Some(3));
        assert_eq!(exit.stderr, "boom");
    }

    #[tokio::test]
    async fn spawn_failure_names_program() {
        let err = ChildAgent::spawn(Command::new("/nonexistent/agent-binary"))
            .err()
            .unwrap();
        assert!(matches!(err, RunError::Spawn { ref program, .. } if program.contains("agent-binary")));
    }

    #[tokio::test]
    async fn terminate_escalates_to_kill() {
        let mut agent = ChildAgent::spawn(sh("trap '' TERM; exec sleep 30")).unwrap();
        let started = std::time::Instant::now();
        agent.terminate(Duration::from_millis(200)).await;
        assert!(started.elapsed() < Duration::from_secs(5));
        let exit = agent.finish().await.unwrap();
        assert!(!exit.success());
    }

    #[tokio::test]
    async fn terminate_stops_cooperative_process_quickly() {
        let mut agent = ChildAgent::spawn(sh("exec sleep 30")).unwrap();
        let started = std::time::Instant::now();
        agent.terminate(Duration::from_secs(5)).await;
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
