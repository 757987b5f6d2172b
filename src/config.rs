//! Configuration types.
//!
//! Everything is read from environment variables once at startup by
//! [`DispatchConfig::from_env`]; components receive their own slice.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Name of the context every submitter starts in.
pub const DEFAULT_CONTEXT: &str = "vm";

/// Maximum characters per outbound chat message.
pub const MAX_MESSAGE_CHARS: usize = 4096;

/// Which execution strategy the supervisor prefers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrchestrationMode {
    /// Use the orchestrated strategy whenever it is available.
    #[default]
    Auto,
    /// Only tasks that explicitly asked for orchestration use it.
    OnRequest,
    /// Always run the direct CLI strategy.
    Off,
}

impl FromStr for OrchestrationMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "auto" | "on" | "always" => Ok(Self::Auto),
            "on-request" | "on_request" | "request" => Ok(Self::OnRequest),
            "off" | "none" | "disabled" => Ok(Self::Off),
            other => Err(ConfigError::InvalidValue {
                key: "DISPATCH_ORCHESTRATION".into(),
                message: format!("unknown mode '{other}' (expected auto, on-request, off)"),
            }),
        }
    }
}

/// What the startup sweep does with RUNNING rows left by a previous process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrphanPolicy {
    /// Mark them FAILED and tell the submitter.
    #[default]
    Fail,
    /// Put them back in the queue.
    Requeue,
    /// Leave them as they are.
    Ignore,
}

impl FromStr for OrphanPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "fail" => Ok(Self::Fail),
            "requeue" => Ok(Self::Requeue),
            "ignore" => Ok(Self::Ignore),
            other => Err(ConfigError::InvalidValue {
                key: "DISPATCH_ORPHAN_POLICY".into(),
                message: format!("unknown policy '{other}' (expected fail, requeue, ignore)"),
            }),
        }
    }
}

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often the queue is polled for claimable work.
    pub poll_interval: Duration,
    /// How long `stop_context` waits for a cancelled run to wind down
    /// on top of the kill grace period.
    pub stop_margin: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            stop_margin: Duration::from_secs(5),
        }
    }
}

/// Process supervisor configuration.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Liveness refresh of the progress indicator.
    pub heartbeat_interval: Duration,
    /// Time between SIGTERM and SIGKILL when stopping an agent.
    pub kill_grace: Duration,
    /// Strategy preference.
    pub orchestration: OrchestrationMode,
    /// Prefix stripped from paths in progress lines.
    pub repos_dir: PathBuf,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(10),
            kill_grace: Duration::from_secs(5),
            orchestration: OrchestrationMode::Auto,
            repos_dir: PathBuf::from("/opt/dispatch/repos"),
        }
    }
}

/// External agent invocation settings.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Agent CLI binary.
    pub program: PathBuf,
    /// Turn cap passed to the orchestrated strategy.
    pub max_turns: u32,
    /// Environment variables removed before spawning the agent.
    pub scrubbed_env: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("claude"),
            max_turns: 60,
            scrubbed_env: vec!["ANTHROPIC_API_KEY".to_string()],
        }
    }
}

/// Direct shell pass-through settings.
#[derive(Debug, Clone)]
pub struct ShellConfig {
    pub timeout: Duration,
    /// Output budget in bytes before truncation.
    pub max_output: usize,
    pub working_dir: PathBuf,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            max_output: 4000,
            working_dir: PathBuf::from("/"),
        }
    }
}

/// Telegram transport settings.
#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub bot_token: SecretString,
    /// Allowed user ids/usernames; empty or `*` allows everyone.
    pub allowed_users: Vec<String>,
}

/// Full application configuration.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub db_path: PathBuf,
    pub repos_dir: PathBuf,
    /// Working directory of the default context.
    pub home_dir: PathBuf,
    /// Transcript turns kept in view per conversation.
    pub context_window: usize,
    pub orphan_policy: OrphanPolicy,
    pub log_dir: Option<PathBuf>,
    pub scheduler: SchedulerConfig,
    pub supervisor: SupervisorConfig,
    pub agent: AgentConfig,
    pub shell: ShellConfig,
    pub telegram: TelegramConfig,
}

impl DispatchConfig {
    /// Build the configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let bot_token = std::env::var("TELEGRAM_BOT_TOKEN")
            .map_err(|_| ConfigError::MissingEnvVar("TELEGRAM_BOT_TOKEN".into()))?;

        let allowed_users: Vec<String> = std::env::var("TELEGRAM_ALLOWED_USERS")
            .or_else(|_| std::env::var("ALLOWED_USER_IDS"))
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let home_dir = env_path("DISPATCH_HOME_DIR", "/opt/dispatch");
        let repos_dir = env_path("DISPATCH_REPOS_DIR", "/opt/dispatch/repos");
        let db_path = env_path("DISPATCH_DB_PATH", "/opt/dispatch/dispatch.db");

        let orchestration = match std::env::var("DISPATCH_ORCHESTRATION") {
            Ok(v) => v.parse()?,
            Err(_) => OrchestrationMode::default(),
        };
        let orphan_policy = match std::env::var("DISPATCH_ORPHAN_POLICY") {
            Ok(v) => v.parse()?,
            Err(_) => OrphanPolicy::default(),
        };

        let scheduler = SchedulerConfig {
            poll_interval: Duration::from_secs(env_parse("DISPATCH_POLL_INTERVAL_SECS", 2)?),
            ..SchedulerConfig::default()
        };

        let supervisor = SupervisorConfig {
            heartbeat_interval: Duration::from_secs(env_parse("DISPATCH_HEARTBEAT_SECS", 10)?),
            kill_grace: Duration::from_secs(env_parse("DISPATCH_KILL_GRACE_SECS", 5)?),
            orchestration,
            repos_dir: repos_dir.clone(),
        };

        let agent = AgentConfig {
            program: env_path("DISPATCH_AGENT_BIN", "claude"),
            max_turns: env_parse("DISPATCH_AGENT_MAX_TURNS", 60)?,
            ..AgentConfig::default()
        };

        let shell = ShellConfig {
            timeout: Duration::from_secs(env_parse("SHELL_TIMEOUT", 60)?),
            max_output: env_parse("SHELL_MAX_OUTPUT", 4000)?,
            ..ShellConfig::default()
        };

        Ok(Self {
            db_path,
            repos_dir,
            home_dir,
            context_window: env_parse("CONTEXT_WINDOW", 20)?,
            orphan_policy,
            log_dir: std::env::var("DISPATCH_LOG_DIR").ok().map(PathBuf::from),
            scheduler,
            supervisor,
            agent,
            shell,
            telegram: TelegramConfig {
                bot_token: SecretString::from(bot_token),
                allowed_users,
            },
        })
    }
}

fn env_path(key: &str, default: &str) -> PathBuf {
    std::env::var(key)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(default))
}

/// Parse an optional numeric variable, rejecting values that do not parse.
fn env_parse<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}
