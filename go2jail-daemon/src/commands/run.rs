//! `go2jail run` — the daemon proper.

use anyhow::Result;

use go2jail_pipeline::engine::{Engine, EngineOptions};

use crate::cli::RunArgs;
use crate::commands::{load_config, wait_for_shutdown_signal};

pub async fn run(args: RunArgs) -> Result<()> {
    let config = load_config(&args.config)?;
    let engine = Engine::start(
        config,
        EngineOptions {
            test_discipline: None,
            stats_listen: args.http_stats_listen_addr.clone(),
        },
    )
    .await?;
    tracing::info!("daemon started");

    tokio::select! {
        signal = wait_for_shutdown_signal() => {
            let signal = signal?;
            tracing::info!(signal, "shutdown signal received, stopping");
        }
        // When every watch finishes on its own, so does the daemon.
        _ = engine.wait() => {
            tracing::info!("all watches finished");
        }
    }

    engine.stop_and_wait().await;
    tracing::info!("daemon stopped");
    Ok(())
}
