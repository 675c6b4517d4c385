use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use coord::{Ready, Runner};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tps::{assemble, Cli, Collaborators};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)))
        .with_target(true)
        .init();

    match run(cli).await {
        Ok(()) => {
            info!("tps.exited");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %format!("{e:#}"), "tps.exited");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Arc::new(cli.into_config()?);
    let collaborators = Collaborators::connect(&config).await?;
    let mut group = assemble(&config, collaborators);

    let shutdown = CancellationToken::new();
    tokio::spawn(forward_signals(shutdown.clone()));

    let (ready, ready_rx) = Ready::channel();
    tokio::spawn(async move {
        if ready_rx.await.is_ok() {
            info!("tps.started");
        }
    });

    group.run(shutdown, ready).await?;
    Ok(())
}

/// Cancels `shutdown` on SIGINT or SIGTERM.
async fn forward_signals(shutdown: CancellationToken) {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "tps.signal-handler-failed");
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
                error!(error = %e, "tps.signal-handler-failed");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = interrupt => info!(signal = "SIGINT", "tps.signalled"),
        () = terminate => info!(signal = "SIGTERM", "tps.signalled"),
    }
    shutdown.cancel();
}
