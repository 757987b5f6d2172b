//! Error types for the dispatcher.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Agent run error: {0}")]
    Run(#[from] RunError),

    #[error("Shell error: {0}")]
    Shell(#[from] ShellError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Transport/channel errors.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Channel {name} failed to start: {reason}")]
    StartupFailed { name: String, reason: String },

    #[error("Failed to send on channel {name}: {reason}")]
    SendFailed { name: String, reason: String },

    #[error("Invalid message format: {0}")]
    InvalidMessage(String),

    #[error("HTTP error: {0}")]
    Http(String),
}

/// Errors raised by one agent invocation attempt.
///
/// Cancellation is not represented here: a cancelled run is a terminal
/// outcome, not a failure.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("Failed to spawn {program}: {reason}")]
    Spawn { program: String, reason: String },

    #[error("Agent stream read failed: {0}")]
    Stream(String),

    #[error("Agent exited with code {code:?}: {stderr}")]
    Exited { code: Option<i32>, stderr: String },

    #[error("Agent reported an error: {0}")]
    Agent(String),

    #[error("Working directory unavailable: {0}")]
    Workdir(String),

    #[error("Store error during run: {0}")]
    Store(#[from] DatabaseError),
}

impl RunError {
    /// Heuristic used by the retry policy: the agent rejected the resume
    /// instruction when its error text mentions "resume".
    pub fn mentions_resume(&self) -> bool {
        self.to_string().to_lowercase().contains("resume")
    }
}

/// Direct shell pass-through errors.
#[derive(Debug, thiserror::Error)]
pub enum ShellError {
    #[error("Blocked: {reason}")]
    Blocked { reason: String },

    #[error("Command timed out after {}s", .timeout.as_secs())]
    Timeout { timeout: Duration },

    #[error("Error executing command: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Result type alias for the dispatcher.
pub type Result<T> = std::result::Result<T, Error>;
