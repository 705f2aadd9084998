use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed telemetry payload: {0}")]
    Malformed(String),
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("failed to open store: {0}")]
    Open(#[source] rusqlite::Error),
    #[error("insert failed: {0}")]
    Insert(#[source] rusqlite::Error),
    #[error("schema setup failed: {0}")]
    Schema(#[source] rusqlite::Error),
    #[error("invalid table name '{0}'")]
    InvalidTable(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("admission policy failed: {0}")]
    Policy(String),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("pipeline already started")]
    AlreadyStarted,
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol error: {0:?}")]
    Protocol(rumqttc::mqttbytes::Error),
    #[error("first packet was not CONNECT")]
    ExpectedConnect,
    #[error("no packet within keep-alive window")]
    KeepAliveTimeout,
}

impl From<rumqttc::mqttbytes::Error> for ListenerError {
    fn from(e: rumqttc::mqttbytes::Error) -> Self {
        ListenerError::Protocol(e)
    }
}
