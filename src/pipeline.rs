use crate::admission::{AdmissionGate, Decision};
use crate::config::{Config, ListenerConfig};
use crate::error::PipelineError;
use crate::gateway::PersistenceGateway;
use crate::listener::{BrokerHooks, IngestListener};
use crate::models::{ConnectionRequest, InboundMessage};
use crate::router::TopicRouter;
use crate::store::TelemetryStore;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Wires admission, routing and the transport together.
///
/// Lifecycle is start -> running -> stop. Stopping closes the listener and
/// its sessions; persistence tasks already launched are left to finish or
/// fail on their own.
pub struct IngestionPipeline {
    gate: AdmissionGate,
    router: TopicRouter,
    listener: ListenerConfig,
    started: AtomicBool,
    cancel: CancellationToken,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl IngestionPipeline {
    pub fn new(gate: AdmissionGate, router: TopicRouter, listener: ListenerConfig) -> Arc<Self> {
        Arc::new(Self {
            gate,
            router,
            listener,
            started: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            accept_task: Mutex::new(None),
        })
    }

    pub fn from_config(config: &Config, store: Arc<dyn TelemetryStore>) -> Arc<Self> {
        let gateway = PersistenceGateway::new(store);
        Self::new(
            AdmissionGate::default(),
            TopicRouter::from_config(config, gateway),
            ListenerConfig::from(config),
        )
    }

    /// Binds the listener and starts accepting. Returns the bound address.
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr, PipelineError> {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("Pipeline start requested twice, ignoring.");
            return Err(PipelineError::AlreadyStarted);
        }

        let listener = match IngestListener::bind(&self.listener).await {
            Ok(listener) => listener,
            Err(e) => {
                self.started.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        let local_addr = listener.local_addr().map_err(|e| PipelineError::Bind {
            address: self.listener.address.clone(),
            source: e,
        })?;

        let hooks: Arc<dyn BrokerHooks> = self.clone();
        let handle = tokio::spawn(listener.run(hooks, self.cancel.clone()));
        *self.accept_task.lock().await = Some(handle);

        info!("Broker active at tcp://{}", local_addr);
        Ok(local_addr)
    }

    /// Stops accepting and closes open sessions. Safe to call more than once.
    pub async fn stop(&self) {
        if !self.started.load(Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        let handle = self.accept_task.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
            info!("Broker shut down.");
        }
    }

    /// Starts, runs until `shutdown` resolves, then stops.
    pub async fn run_until<F>(self: &Arc<Self>, shutdown: F) -> Result<(), PipelineError>
    where
        F: Future<Output = ()>,
    {
        self.start().await?;
        shutdown.await;
        self.stop().await;
        Ok(())
    }
}

impl BrokerHooks for IngestionPipeline {
    fn validate_connection(&self, request: &ConnectionRequest) -> Decision {
        self.gate.evaluate(request)
    }

    fn client_connected(&self, client_id: &str) {
        info!("Client connected: {}", client_id);
    }

    fn intercept_publish(&self, message: InboundMessage) {
        self.router.route(message);
    }
}
