use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Initialize logging. `RUST_LOG` overrides the default INFO level.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Resolves on Ctrl-C. A failing signal handler also resolves, so the
/// broker shuts down instead of running without a way to stop it.
pub async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to handle termination signal: {:?}", e);
    } else {
        info!("Broker is shutting down...");
    }
}
