//! Shared application state.

use std::sync::Arc;

use crate::channels::Transport;
use crate::config::DispatchConfig;
use crate::contexts::ContextRegistry;
use crate::store::Database;
use crate::tools::ShellExecutor;
use crate::worker::runner::AgentRunner;
use crate::worker::scheduler::Scheduler;
use crate::worker::supervisor::Supervisor;

/// Everything the router and the background loops share.
pub struct AppContext {
    pub db: Arc<dyn Database>,
    pub contexts: Arc<ContextRegistry>,
    pub scheduler: Arc<Scheduler>,
    pub shell: ShellExecutor,
    pub transport: Arc<dyn Transport>,
    /// Transcript turns shown by `/history`.
    pub context_window: usize,
}

impl AppContext {
    /// Wire the registry, supervisor and scheduler around `db` and
    /// `transport`.
    pub fn build(
        config: &DispatchConfig,
        db: Arc<dyn Database>,
        transport: Arc<dyn Transport>,
        orchestrated: Arc<dyn AgentRunner>,
        direct: Arc<dyn AgentRunner>,
    ) -> Self {
        let contexts = Arc::new(ContextRegistry::new(
            db.clone(),
            config.home_dir.clone(),
            config.repos_dir.clone(),
        ));
        let supervisor = Arc::new(Supervisor::new(
            db.clone(),
            transport.clone(),
            contexts.clone(),
            orchestrated,
            direct,
            config.supervisor.clone(),
        ));
        let scheduler = Arc::new(Scheduler::new(
            db.clone(),
            supervisor,
            config.scheduler.clone(),
            config.supervisor.kill_grace,
        ));

        Self {
            db,
            contexts,
            scheduler,
            shell: ShellExecutor::new(config.shell.clone()),
            transport,
            context_window: config.context_window,
        }
    }
}
