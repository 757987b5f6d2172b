//! Task execution.
//!
//! - `state`: task record and status state machine
//! - `scheduler`: single-flight polling loop, one running task per context
//! - `supervisor`: drives one task through attempts to a terminal state
//! - `policy`: retry/fallback decision after a failed attempt
//! - `runner`, `cli`: agent process abstraction and the CLI strategies
//! - `events`: agent output stream parsing
//! - `progress`, `describe`: progress indicator text and delivery
//! - `roles`: sub-role catalog passed to the orchestrator

pub mod cli;
pub mod describe;
pub mod events;
pub mod policy;
pub mod progress;
pub mod roles;
pub mod runner;
pub mod scheduler;
pub mod state;
pub mod supervisor;

pub use cli::CliRunner;
pub use runner::{AgentKind, AgentProcess, AgentRequest, AgentRunner, ExitInfo};
pub use scheduler::{Scheduler, StopReport};
pub use state::{NewTask, Task, TaskStatus};
pub use supervisor::Supervisor;
