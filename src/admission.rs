use crate::error::AdmissionError;
use crate::models::ConnectionRequest;
use rumqttc::mqttbytes::v4::ConnectReturnCode;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::{error, info};

/// Connection reason codes, as carried in an MQTT 3.1.1 CONNACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReasonCode {
    Success,
    UnacceptableProtocolVersion,
    IdentifierRejected,
    ServerUnavailable,
    BadUsernameOrPassword,
    NotAuthorized,
}

impl From<ReasonCode> for ConnectReturnCode {
    fn from(code: ReasonCode) -> Self {
        match code {
            ReasonCode::Success => ConnectReturnCode::Success,
            ReasonCode::UnacceptableProtocolVersion => ConnectReturnCode::RefusedProtocolVersion,
            ReasonCode::IdentifierRejected => ConnectReturnCode::BadClientId,
            ReasonCode::ServerUnavailable => ConnectReturnCode::ServiceUnavailable,
            ReasonCode::BadUsernameOrPassword => ConnectReturnCode::BadUserNamePassword,
            ReasonCode::NotAuthorized => ConnectReturnCode::NotAuthorized,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub accepted: bool,
    pub reason: ReasonCode,
}

impl Decision {
    pub fn accept() -> Self {
        Self {
            accepted: true,
            reason: ReasonCode::Success,
        }
    }

    pub fn reject(reason: ReasonCode) -> Self {
        Self {
            accepted: false,
            reason,
        }
    }
}

pub trait AdmissionPolicy: Send + Sync {
    fn evaluate(&self, request: &ConnectionRequest) -> Result<Decision, AdmissionError>;
}

/// Admits every client.
pub struct AcceptAll;

impl AdmissionPolicy for AcceptAll {
    fn evaluate(&self, _request: &ConnectionRequest) -> Result<Decision, AdmissionError> {
        Ok(Decision::accept())
    }
}

pub struct AdmissionGate {
    policy: Box<dyn AdmissionPolicy>,
}

impl Default for AdmissionGate {
    fn default() -> Self {
        Self::new(Box::new(AcceptAll))
    }
}

impl AdmissionGate {
    pub fn new(policy: Box<dyn AdmissionPolicy>) -> Self {
        Self { policy }
    }

    /// Never fails. A policy error or panic turns into a rejection.
    pub fn evaluate(&self, request: &ConnectionRequest) -> Decision {
        info!("Connection requested - VIN: {} ({:?})", request.client_id, request.peer_addr);

        match catch_unwind(AssertUnwindSafe(|| self.policy.evaluate(request))) {
            Ok(Ok(decision)) => decision,
            Ok(Err(e)) => {
                error!("Admission policy failed for {}, rejecting: {}", request.client_id, e);
                Decision::reject(ReasonCode::ServerUnavailable)
            }
            Err(_) => {
                error!("Admission policy panicked for {}, rejecting.", request.client_id);
                Decision::reject(ReasonCode::ServerUnavailable)
            }
        }
    }
}
