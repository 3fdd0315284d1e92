use anyhow::Context;
use futures::FutureExt;
use prefix_scan::{run_server, telemetry, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init();

    let config = Config::from_env().context("Invalid configuration")?;

    let shutdown = tokio::signal::ctrl_c().map(|res| {
        if let Err(err) = res {
            tracing::error!(%err, "cannot listen for ctrl-c, shutting down");
        }
    });

    let stats = run_server(&config, shutdown)
        .await
        .context("Server failed")?;

    tracing::info!(
        received = stats.received,
        completed = stats.completed,
        failed = stats.failed,
        rejected = stats.rejected,
        "bye"
    );

    Ok(())
}
