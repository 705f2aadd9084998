use bytes::Bytes;
use std::net::SocketAddr;

/// One vehicle's point-in-time state, as decoded from a telemetry publish.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TelemetryReading {
    battery: i32,
    kilometers: i64,
    latitude: f64,
    longitude: f64,
}

impl TelemetryReading {
    pub fn new(battery: i32, kilometers: i64, latitude: f64, longitude: f64) -> Self {
        Self {
            battery,
            kilometers,
            latitude,
            longitude,
        }
    }

    pub fn battery(&self) -> i32 {
        self.battery
    }

    pub fn kilometers(&self) -> i64 {
        self.kilometers
    }

    pub fn latitude(&self) -> f64 {
        self.latitude
    }

    pub fn longitude(&self) -> f64 {
        self.longitude
    }
}

/// A publish event as handed over by the transport.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub client_id: String,
    pub topic: String,
    pub payload: Bytes,
}

impl InboundMessage {
    pub fn new(client_id: impl Into<String>, topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            client_id: client_id.into(),
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    /// Payload rendered as text for log lines. Invalid UTF-8 is replaced.
    pub fn payload_text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionRequest {
    pub client_id: String,
    pub peer_addr: Option<SocketAddr>,
    pub username: Option<String>,
    pub keep_alive_secs: u16,
    pub clean_session: bool,
}

impl ConnectionRequest {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            peer_addr: None,
            username: None,
            keep_alive_secs: 0,
            clean_session: true,
        }
    }
}
