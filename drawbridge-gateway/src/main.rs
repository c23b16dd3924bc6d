#[macro_use]
extern crate tracing;

mod service;

use anyhow::Context as _;
use drawbridge_gateway::config::ConfHandle;

use crate::service::GatewayService;

fn main() -> anyhow::Result<()> {
    let conf_handle = ConfHandle::init().context("configuration unavailable")?;

    let mut service = GatewayService::load(conf_handle).context("failed to load service")?;

    // Unrecoverable bind failures surface here and exit non-zero.
    service.start()?;

    wait_for_shutdown_signal()?;

    service.stop();

    Ok(())
}

/// Blocks until SIGINT or SIGTERM.
fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to create signal runtime")?;

    runtime.block_on(async {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};

            let mut terminate = signal(SignalKind::terminate()).context("failed to listen for SIGTERM")?;

            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
                _ = terminate.recv() => info!("Received SIGTERM"),
            }
        }

        #[cfg(not(unix))]
        {
            tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
            info!("Received interrupt");
        }

        anyhow::Ok(())
    })
}
