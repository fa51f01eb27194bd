//! hearthd - headless Hearth replica.
//!
//! Opens the local store, syncs once at startup, then keeps the replica in
//! step with the remote (periodically, when configured) until Ctrl-C.

use hearth_client::sync::SyncTrigger;
use hearth_client::{telemetry, AppContext, Config};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    dotenvy::dotenv().ok();
    telemetry::init()?;
    let config = Config::from_env()?;

    tracing::info!(
        database = %config.database_url,
        remote = config.remote_url.as_deref().unwrap_or("in-memory"),
        "Starting hearthd"
    );

    let ctx = AppContext::open(config).await?;

    let report = ctx.sync().request_sync(SyncTrigger::Startup).await?;
    match report.finished_at_utc() {
        Some(at) => tracing::info!(
            status = ?report.status,
            message = report.message.as_deref().unwrap_or(""),
            "Startup sync finished at {}",
            at.to_rfc3339()
        ),
        None => tracing::info!(status = ?report.status, "Startup sync finished"),
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    ctx.shutdown().await?;

    Ok(())
}
