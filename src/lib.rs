//! Agent Dispatch: single-flight task dispatcher for coding agents.

pub mod app;
pub mod channels;
pub mod config;
pub mod contexts;
pub mod error;
pub mod router;
pub mod store;
pub mod tools;
pub mod worker;
