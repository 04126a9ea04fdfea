use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::adapters::{BackendListener, BackendResult, BillingBackend, SessionOutcome};
use super::engine::EngineCommand;
use super::models::{CatalogOffer, Purchase, SkuKind};
use super::response::ResponseCode;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        }
    }
}

/// key: billing-connection-manager -> backend session lifecycle
///
/// Owned by the engine worker. Session start runs on its own task and reports
/// back through the worker queue tagged with a generation; signals carrying
/// an older generation are ignored.
pub struct ConnectionManager {
    state: ConnectionState,
    generation: u64,
    backend: Arc<dyn BillingBackend>,
    signals: UnboundedSender<EngineCommand>,
    session_task: Option<JoinHandle<()>>,
}

impl ConnectionManager {
    pub(crate) fn new(
        backend: Arc<dyn BillingBackend>,
        signals: UnboundedSender<EngineCommand>,
    ) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            generation: 0,
            backend,
            signals,
            session_task: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_ready(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Starts a session when disconnected. Returns whether a start was issued.
    pub fn ensure_connected(&mut self) -> bool {
        if self.state != ConnectionState::Disconnected {
            return false;
        }
        self.generation += 1;
        self.state = ConnectionState::Connecting;
        let generation = self.generation;
        let backend = self.backend.clone();
        let signals = self.signals.clone();
        let listener = BackendListener::new(generation, signals.clone());
        info!(generation, "starting billing session");
        if let Some(previous) = self.session_task.take() {
            previous.abort();
        }
        self.session_task = Some(tokio::spawn(async move {
            let outcome = backend.start_session(listener).await;
            let _ = signals.send(EngineCommand::SessionStarted {
                generation,
                outcome,
            });
        }));
        true
    }

    /// Applies a session start result. Returns true when the session became ready.
    pub fn on_session_started(&mut self, generation: u64, outcome: SessionOutcome) -> bool {
        if generation != self.generation || self.state != ConnectionState::Connecting {
            debug!(generation, current = self.generation, "stale session start ignored");
            return false;
        }
        self.session_task = None;
        match outcome {
            SessionOutcome::Ready => {
                info!(generation, "billing session ready");
                self.state = ConnectionState::Connected;
                true
            }
            SessionOutcome::Lost(code) => {
                warn!(generation, %code, "billing session setup failed");
                self.state = ConnectionState::Disconnected;
                false
            }
        }
    }

    /// Returns true when the signal moved the connection to disconnected.
    pub fn on_session_lost(&mut self, generation: u64, code: ResponseCode) -> bool {
        if generation != self.generation || self.state == ConnectionState::Disconnected {
            debug!(generation, current = self.generation, "stale session loss ignored");
            return false;
        }
        warn!(generation, %code, "billing session lost");
        self.mark_lost();
        true
    }

    pub async fn query_purchases(&mut self) -> BackendResult<Vec<Purchase>> {
        self.require_ready()?;
        let result = self.backend.query_purchases().await;
        self.observe(result)
    }

    pub async fn acknowledge(&mut self, purchase_token: &str) -> BackendResult<()> {
        self.require_ready()?;
        let result = self.backend.acknowledge(purchase_token).await;
        self.observe(result)
    }

    pub async fn consume(&mut self, purchase_token: &str) -> BackendResult<()> {
        self.require_ready()?;
        let result = self.backend.consume(purchase_token).await;
        self.observe(result)
    }

    pub async fn query_catalog(
        &mut self,
        product_id: &str,
        kind: SkuKind,
    ) -> BackendResult<Option<CatalogOffer>> {
        self.require_ready()?;
        let result = self.backend.query_catalog(product_id, kind).await;
        self.observe(result)
    }

    pub async fn launch_purchase_ui(&mut self, offer: &CatalogOffer) -> ResponseCode {
        if !self.is_ready() {
            return ResponseCode::ServiceDisconnected;
        }
        let code = self.backend.launch_purchase_ui(offer).await;
        if code == ResponseCode::ServiceDisconnected {
            self.mark_lost();
        }
        code
    }

    /// Ends the session. Later signals from any earlier generation are ignored.
    pub async fn teardown(&mut self) {
        if let Some(task) = self.session_task.take() {
            task.abort();
        }
        if self.generation > 0 {
            self.backend.end_session().await;
        }
        self.generation += 1;
        self.state = ConnectionState::Disconnected;
        info!("billing session ended");
    }

    fn require_ready(&self) -> BackendResult<()> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(ResponseCode::ServiceDisconnected)
        }
    }

    fn observe<T>(&mut self, result: BackendResult<T>) -> BackendResult<T> {
        if let Err(ResponseCode::ServiceDisconnected) = result {
            self.mark_lost();
        }
        result
    }

    fn mark_lost(&mut self) {
        self.state = ConnectionState::Disconnected;
        if let Some(task) = self.session_task.take() {
            task.abort();
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(task) = self.session_task.take() {
            task.abort();
        }
    }
}
