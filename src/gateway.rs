use crate::models::TelemetryReading;
use crate::store::TelemetryStore;
use std::sync::Arc;
use tracing::{error, info};

/// Best-effort, at-most-once persistence of telemetry readings.
///
/// `persist` launches the insert on the blocking pool and returns at once.
/// The join handle is dropped: the caller cannot observe completion, failures
/// only surface as log lines, and nothing is drained on shutdown.
#[derive(Clone)]
pub struct PersistenceGateway {
    store: Arc<dyn TelemetryStore>,
}

impl PersistenceGateway {
    pub fn new(store: Arc<dyn TelemetryStore>) -> Self {
        Self { store }
    }

    pub fn persist(&self, vehicle_id: &str, reading: TelemetryReading) {
        let store = self.store.clone();
        let vehicle_id = vehicle_id.to_string();

        tokio::task::spawn_blocking(move || match store.insert(&vehicle_id, &reading) {
            Ok(()) => info!("Telemetry for {} persisted.", vehicle_id),
            Err(e) => error!("Failed to persist telemetry for {}: {}", vehicle_id, e),
        });
    }
}
