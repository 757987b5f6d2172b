//! Agent CLI invocations for the orchestrated and direct strategies.

use std::path::Path;

use async_trait::async_trait;
use tokio::process::Command;

use crate::config::AgentConfig;
use crate::error::RunError;
use crate::worker::roles::agents_json;
use crate::worker::runner::{AgentKind, AgentProcess, AgentRequest, AgentRunner, ChildAgent};

/// Tools the orchestrator may use, including sub-role delegation.
const ORCHESTRATOR_TOOLS: &[&str] = &["Bash(*)", "Read", "Write", "Edit", "Glob", "Grep", "Task"];

/// Runs the agent CLI binary with strategy-specific flags.
pub struct CliRunner {
    kind: AgentKind,
    config: AgentConfig,
}

impl CliRunner {
    pub fn orchestrated(config: AgentConfig) -> Self {
        Self {
            kind: AgentKind::Orchestrated,
            config,
        }
    }

    pub fn direct(config: AgentConfig) -> Self {
        Self {
            kind: AgentKind::Direct,
            config,
        }
    }

    /// Command-line arguments for `request`, without the program name.
    pub fn build_args(&self, request: &AgentRequest) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            request.prompt.clone(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
        ];

        match self.kind {
            AgentKind::Orchestrated => {
                args.extend([
                    "--permission-mode".to_string(),
                    "bypassPermissions".to_string(),
                    "--allowedTools".to_string(),
                    ORCHESTRATOR_TOOLS.join(","),
                    "--agents".to_string(),
                    agents_json().to_string(),
                    "--max-turns".to_string(),
                    self.config.max_turns.to_string(),
                    "--setting-sources".to_string(),
                    "project".to_string(),
                ]);
            }
            AgentKind::Direct => {
                args.push("--dangerously-skip-permissions".to_string());
            }
        }

        if let Some(session) = &request.resume {
            args.push("--resume".to_string());
            args.push(session.clone());
        }
        args
    }
}

/// Whether `program` can be executed: an existing file for explicit paths,
/// otherwise something on `PATH`.
fn program_exists(program: &Path) -> bool {
    if program.components().count() > 1 {
        program.is_file()
    } else {
        which::which(program).is_ok()
    }
}

#[async_trait]
impl AgentRunner for CliRunner {
    fn kind(&self) -> AgentKind {
        self.kind
    }

    fn is_available(&self) -> bool {
        program_exists(&self.config.program)
    }

    async fn spawn(&self, request: &AgentRequest) -> Result<Box<dyn AgentProcess>, RunError> {
        if !request.working_dir.is_dir() {
            return Err(RunError::Workdir(request.working_dir.display().to_string()));
        }

        let mut command = Command::new(&self.config.program);
        command
            .args(self.build_args(request))
            .current_dir(&request.working_dir);
        for key in &self.config.scrubbed_env {
            command.env_remove(key);
        }

        tracing::info!(
            kind = %self.kind,
            cwd = %request.working_dir.display(),
            resume = request.resume.is_some(),
            "Launching agent"
        );
        Ok(Box::new(ChildAgent::spawn(command)?))
    }
}
