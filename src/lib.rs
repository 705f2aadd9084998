//! Ingestion of fleet telemetry over MQTT.
//!
//! Vehicles connect with their VIN as client id and publish on two topics:
//! telemetry readings, which are decoded and written to the store, and free
//! text alerts, which are only logged.

pub mod admission;
pub mod config;
pub mod error;
pub mod gateway;
pub mod listener;
pub mod models;
pub mod pipeline;
pub mod router;
pub mod service_utils;
pub mod store;
pub mod telemetry;

pub use admission::{AcceptAll, AdmissionGate, AdmissionPolicy, Decision, ReasonCode};
pub use config::Config;
pub use gateway::PersistenceGateway;
pub use listener::BrokerHooks;
pub use models::{ConnectionRequest, InboundMessage, TelemetryReading};
pub use pipeline::IngestionPipeline;
pub use router::{RoutingOutcome, TopicRouter};
pub use store::{SqliteStore, TelemetryStore};
