use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use agent_dispatch::app::AppContext;
use agent_dispatch::channels::{TelegramChannel, Transport};
use agent_dispatch::config::{DispatchConfig, OrphanPolicy};
use agent_dispatch::router::Router;
use agent_dispatch::store::{Database, LibSqlBackend};
use agent_dispatch::worker::{AgentRunner, CliRunner};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = DispatchConfig::from_env().context("Failed to load configuration")?;
    let _log_guard = init_tracing(config.log_dir.as_deref());

    eprintln!("Agent Dispatch v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!("   Repos: {}", config.repos_dir.display());
    eprintln!("   Orchestration: {:?}", config.supervisor.orchestration);

    // ── Database ─────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("Failed to open database at {}", config.db_path.display()))?,
    );

    // ── Transport ────────────────────────────────────────────────────────
    let telegram = Arc::new(TelegramChannel::new(
        config.telegram.bot_token.clone(),
        config.telegram.allowed_users.clone(),
    ));
    eprintln!(
        "   Telegram: allowed {}",
        if config.telegram.allowed_users.is_empty() {
            "everyone".to_string()
        } else {
            config.telegram.allowed_users.join(", ")
        }
    );
    let transport: Arc<dyn Transport> = telegram.clone();

    // ── Startup recovery ─────────────────────────────────────────────────
    recover_orphans(&db, &transport, config.orphan_policy).await?;

    // ── Agents ───────────────────────────────────────────────────────────
    let orchestrated = Arc::new(CliRunner::orchestrated(config.agent.clone()));
    let direct = Arc::new(CliRunner::direct(config.agent.clone()));
    if !direct.is_available() {
        tracing::warn!(
            program = %config.agent.program.display(),
            "Agent binary not found; tasks will fail until it is installed"
        );
    }

    let app = Arc::new(AppContext::build(&config, db, transport, orchestrated, direct));
    let router = Arc::new(Router::new(app.clone()));

    let shutdown = CancellationToken::new();
    let scheduler = tokio::spawn(app.scheduler.clone().run(shutdown.clone()));

    let mut messages = telegram.start();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                tracing::info!("Shutdown requested");
                break;
            }
            msg = messages.next() => match msg {
                Some(msg) => {
                    let router = router.clone();
                    tokio::spawn(async move { router.handle(msg).await });
                }
                None => {
                    tracing::warn!("Message stream ended");
                    break;
                }
            }
        }
    }

    // Stop polling first so nothing new is claimed while units wind down.
    shutdown.cancel();
    if let Err(e) = scheduler.await {
        tracing::error!("Scheduler task failed: {e}");
    }
    let interrupted = app.scheduler.shutdown().await;
    if !interrupted.is_empty() {
        tracing::info!(
            tasks = ?interrupted,
            policy = ?config.orphan_policy,
            "Running tasks interrupted; the orphan policy applies on next start"
        );
    }

    Ok(())
}

/// Stderr logging, plus a daily-rolling file under `log_dir` when set.
fn init_tracing(
    log_dir: Option<&Path>,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr = tracing_subscriber::fmt::layer().with_target(false);

    match log_dir {
        Some(dir) => {
            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "dispatch.log"));
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_target(false)
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(filter).with(stderr).init();
            None
        }
    }
}

/// Apply the orphan policy to RUNNING rows left by a previous process.
async fn recover_orphans(
    db: &Arc<dyn Database>,
    transport: &Arc<dyn Transport>,
    policy: OrphanPolicy,
) -> anyhow::Result<()> {
    let orphans = db
        .recover_orphans(policy)
        .await
        .context("Failed to sweep orphaned tasks")?;
    if orphans.is_empty() {
        return Ok(());
    }
    tracing::warn!(count = orphans.len(), ?policy, "Found tasks interrupted by restart");

    if policy != OrphanPolicy::Fail {
        return Ok(());
    }
    for task in &orphans {
        if let Some(handle) = task.progress_handle {
            let _ = transport.delete_progress(&task.submitter, handle).await;
        }
        let text = format!("{} Interrupted by restart.", task.tag());
        if let Err(e) = transport.send_message(&task.submitter, &text).await {
            tracing::warn!(task_id = task.id, "Failed to notify about interrupted task: {e}");
        }
    }
    Ok(())
}
