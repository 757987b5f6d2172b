//! Host-side tools exposed directly to the submitter.

pub mod shell;

pub use shell::ShellExecutor;
