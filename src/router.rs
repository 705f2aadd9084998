use crate::config::Config;
use crate::error::DecodeError;
use crate::gateway::PersistenceGateway;
use crate::models::{InboundMessage, TelemetryReading};
use crate::telemetry;
use tracing::{info, warn};

/// What happened to one inbound message.
#[derive(Debug)]
pub enum RoutingOutcome {
    Persisting {
        vehicle_id: String,
        reading: TelemetryReading,
    },
    Alert {
        client_id: String,
        text: String,
    },
    Fallback {
        topic: String,
        text: String,
    },
    Dropped {
        topic: String,
        client_id: String,
        error: DecodeError,
    },
}

/// Dispatches messages by exact, case-sensitive topic match.
pub struct TopicRouter {
    telemetry_topic: String,
    alert_topic: String,
    gateway: PersistenceGateway,
}

impl TopicRouter {
    pub fn new(
        telemetry_topic: impl Into<String>,
        alert_topic: impl Into<String>,
        gateway: PersistenceGateway,
    ) -> Self {
        Self {
            telemetry_topic: telemetry_topic.into(),
            alert_topic: alert_topic.into(),
            gateway,
        }
    }

    pub fn from_config(config: &Config, gateway: PersistenceGateway) -> Self {
        Self::new(&config.telemetry_topic, &config.alert_topic, gateway)
    }

    pub fn route(&self, message: InboundMessage) -> RoutingOutcome {
        if message.topic == self.telemetry_topic {
            self.handle_telemetry(message)
        } else if message.topic == self.alert_topic {
            let text = message.payload_text();
            warn!("[Alert] VIN: {} - Message: {}", message.client_id, text);
            RoutingOutcome::Alert {
                client_id: message.client_id,
                text,
            }
        } else {
            let text = message.payload_text();
            info!("[Other topic] {} - Message: {}", message.topic, text);
            RoutingOutcome::Fallback {
                topic: message.topic,
                text,
            }
        }
    }

    fn handle_telemetry(&self, message: InboundMessage) -> RoutingOutcome {
        match telemetry::decode(&message.payload) {
            Ok(reading) => {
                info!(
                    "[Telemetry] VIN: {} - Battery: {}%, Km: {}, Location: {}, {}",
                    message.client_id,
                    reading.battery(),
                    reading.kilometers(),
                    reading.latitude(),
                    reading.longitude()
                );
                self.gateway.persist(&message.client_id, reading);
                RoutingOutcome::Persisting {
                    vehicle_id: message.client_id,
                    reading,
                }
            }
            Err(error) => {
                warn!(
                    "Dropping message on '{}' from {}: {}",
                    message.topic, message.client_id, error
                );
                RoutingOutcome::Dropped {
                    topic: message.topic,
                    client_id: message.client_id,
                    error,
                }
            }
        }
    }
}
