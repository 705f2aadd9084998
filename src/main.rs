use motaflux::config::Config;
use motaflux::pipeline::IngestionPipeline;
use motaflux::service_utils::{init_logging, shutdown_signal};
use motaflux::store::SqliteStore;
use std::process;
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    init_logging();

    // Load configuration
    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Error loading configuration: {}", e);
            process::exit(1);
        }
    };

    let store = match SqliteStore::new(
        &config.database_path,
        &config.telemetry_table,
        config.store_busy_timeout(),
    ) {
        Ok(store) => store,
        Err(e) => {
            error!("Failed to create telemetry store: {}", e);
            process::exit(1);
        }
    };

    if config.ensure_schema {
        if let Err(e) = store.ensure_schema() {
            error!("Database initialization failed: {}", e);
            process::exit(1);
        }
    }
    info!("Telemetry store ready at '{}'.", config.database_path);

    let pipeline = IngestionPipeline::from_config(&config, Arc::new(store));

    if let Err(e) = pipeline.run_until(shutdown_signal()).await {
        error!("Broker failed to start: {}", e);
        process::exit(1);
    }
}
