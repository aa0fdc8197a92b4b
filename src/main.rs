#![forbid(unsafe_code)]

//! `acp-link`: connects to an ACP agent, opens a session, and optionally
//! sends one prompt.
//!
//! Agent `session/update` notifications are logged until Ctrl-C or SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use serde_json::json;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use acp_link::acp::router::{Inbound, MethodFilter, NotificationRouter};
use acp_link::acp::spawner::ProcessLauncher;
use acp_link::config::ClientConfig;
use acp_link::orchestrator::connection_manager::ConnectionManager;
use acp_link::orchestrator::session_controller::SessionController;
use acp_link::persistence::{KeyValueStore, MemoryStore};
use acp_link::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "acp-link", about = "ACP agent connection client", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Override the workspace root the agent runs in.
    #[arg(long)]
    workspace: Option<PathBuf>,

    /// Prompt to send once the session is open.
    #[arg(long)]
    prompt: Option<String>,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    let mut config = ClientConfig::load_from_path(&args.config)?;
    if let Some(ws) = args.workspace {
        config.set_workspace_root(ws)?;
    }
    info!(
        host_cli = %config.host_cli,
        workspace = %config.workspace_root.display(),
        "configuration loaded"
    );

    let router = NotificationRouter::new();
    router.register_handler(MethodFilter::exact("session/update"), |inbound| {
        info!(update = %inbound.params(), "session update");
        Ok(())
    });
    let (_permission_token, mut permissions) =
        router.register_channel(MethodFilter::exact("session/request_permission"));
    tokio::spawn(async move {
        while let Some(inbound) = permissions.recv().await {
            if let Inbound::Call(call) = inbound {
                warn!(params = %call.params(), "no interactive approver; cancelling permission request");
                if let Err(err) = call
                    .respond(json!({ "outcome": { "outcome": "cancelled" } }))
                    .await
                {
                    warn!(%err, "failed to answer permission request");
                }
            }
        }
    });

    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let launcher = Arc::new(ProcessLauncher::new(config.spawn_config()));
    let manager = ConnectionManager::new(
        launcher,
        config.connection_settings(),
        router,
        Arc::clone(&store),
    );
    let sessions = SessionController::new(manager.clone(), config.session_settings(), store);

    let mut states = manager.subscribe_state();
    tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let state = *states.borrow_and_update();
            info!(%state, "connection state");
        }
    });

    let session_id = sessions.create_session().await.map_err(|err| {
        if let Some(disconnect) = manager.last_disconnect() {
            error!(reason = disconnect.reason, stderr = ?disconnect.stderr_tail, "agent disconnected");
        }
        err
    })?;
    info!(session_id, "session ready");

    if let Some(prompt) = args.prompt {
        let work = sessions.clone();
        tokio::select! {
            outcome = work.prompt(&prompt) => match outcome {
                Ok(result) => info!(%result, "prompt finished"),
                Err(err) => error!(%err, "prompt failed"),
            },
            () = shutdown_signal() => {
                info!("shutdown signal received; cancelling turn");
                if let Err(err) = sessions.cancel().await {
                    warn!(%err, "cancel failed");
                }
                manager.disconnect().await;
                return Ok(());
            }
        }
    }

    shutdown_signal().await;
    info!("shutdown signal received");
    manager.disconnect().await;
    info!("acp-link shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter).with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
