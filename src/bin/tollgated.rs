//! tollgated: the Tollgate daemon.
//!
//! Serves the governed chat API over HTTP in front of an agent runtime.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use tollgate::config::{Config, LogFormat};
use tollgate::server::{self, AppState};
use tollgate::{HttpAgentClient, RequestGovernor};

/// Tollgate daemon, request governance for agent services.
#[derive(Parser)]
#[command(name = "tollgated")]
#[command(version = tollgate::PKG_VERSION)]
#[command(about = "Rate limiting, caching, retries and token budgets in front of an agent")]
struct Args {
    /// Path to configuration file.
    #[arg(short, long, env = "TOLLGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match Config::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("tollgated: {e}");
            return ExitCode::from(2);
        }
    };
    init_tracing(config.logging.format, args.verbose);

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "tollgated failed");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(format: LogFormat, verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().flatten_event(true).init(),
    }
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let addr = config.socket_addr()?;
    let agent = HttpAgentClient::with_timeout(&config.agent.url, config.agent_timeout())?;
    let governor = Arc::new(RequestGovernor::from_config(&config, Arc::new(agent))?);

    if config.storage.seed_memories {
        match governor.storage().seed_memories().await {
            Ok(created) if !created.is_empty() => {
                info!(count = created.len(), "seeded memory files");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "could not seed memory files"),
        }
    }
    governor.start();

    let app = server::router(AppState::new(Arc::clone(&governor), &config.server), &config.server);
    let listener = TcpListener::bind(addr).await?;
    info!(
        version = tollgate::PKG_VERSION,
        %addr,
        agent = %config.agent.url,
        provider = %config.agent.provider,
        "tollgated listening"
    );

    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await;

    governor.shutdown();
    served?;
    Ok(())
}

/// Resolves on Ctrl-C or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received, draining connections");
}
