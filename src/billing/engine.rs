use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};

use super::adapters::{BillingBackend, Ledger, SessionOutcome};
use super::backoff::RetryState;
use super::connection::ConnectionState;
use super::events::{BillingSubscription, EventBus};
use super::models::{Product, Purchase};
use super::reconciliation::{ReconciliationLoop, RetryFamily};
use super::response::ResponseCode;
use super::verifier::SignatureVerifier;

/// Work items for the engine worker. Callers use the bounded command queue;
/// backend callbacks, session starts and retry timers use the unbounded signal
/// queue so they never wait on the worker.
#[derive(Debug)]
pub(crate) enum EngineCommand {
    Reconcile,
    InitiatePurchase {
        product: Product,
    },
    Consume {
        purchase_token: String,
    },
    SessionStarted {
        generation: u64,
        outcome: SessionOutcome,
    },
    SessionLost {
        generation: u64,
        code: ResponseCode,
    },
    PurchasesUpdated {
        generation: u64,
        code: ResponseCode,
        purchases: Vec<Purchase>,
    },
    RetryElapsed(RetryFamily),
    Snapshot(oneshot::Sender<EngineSnapshot>),
    Products(oneshot::Sender<EngineResult<Vec<Product>>>),
}

/// Point-in-time view of the worker state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineSnapshot {
    pub engine_id: Uuid,
    pub connection: ConnectionState,
    pub generation: u64,
    pub query_retry: RetryState,
    pub consume_retry: RetryState,
    pub pending_retries: Vec<RetryFamily>,
    pub pending_consumes: Vec<String>,
}

/// key: billing-engine -> handle onto the single reconciliation worker
///
/// Cheap to clone. All state lives on one worker task; the handle only
/// enqueues commands. The worker stops on [`BillingEngine::shutdown`] or when
/// the last handle is dropped.
#[derive(Clone)]
pub struct BillingEngine {
    id: Uuid,
    commands: mpsc::Sender<EngineCommand>,
    events: EventBus,
    shutdown: Arc<watch::Sender<bool>>,
    worker: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl BillingEngine {
    /// Spawns the worker. Must be called from within a Tokio runtime.
    pub fn start(
        config: EngineConfig,
        backend: Arc<dyn BillingBackend>,
        verifier: Arc<dyn SignatureVerifier>,
        ledger: Arc<dyn Ledger>,
    ) -> EngineResult<Self> {
        config.validate()?;
        let id = Uuid::new_v4();
        let (commands, receiver) = mpsc::channel(config.command_buffer.max(1));
        let (signals, signal_receiver) = mpsc::unbounded_channel();
        let events = EventBus::new(config.event_buffer);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let state = ReconciliationLoop::new(
            id,
            Arc::new(config),
            backend,
            verifier,
            ledger,
            events.clone(),
            signals,
        );
        let worker = tokio::spawn(
            run_worker(state, receiver, signal_receiver, shutdown_rx)
                .instrument(info_span!("billing_engine", engine_id = %id)),
        );
        info!(engine_id = %id, "billing engine started");

        Ok(Self {
            id,
            commands,
            events,
            shutdown: Arc::new(shutdown),
            worker: Arc::new(Mutex::new(Some(worker))),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn subscribe(&self) -> BillingSubscription {
        self.events.subscribe()
    }

    /// Requests a reconciliation pass (resume or heartbeat trigger).
    pub async fn reconcile(&self) -> EngineResult<()> {
        self.send(EngineCommand::Reconcile).await
    }

    pub async fn initiate_purchase(&self, product: &Product) -> EngineResult<()> {
        self.send(EngineCommand::InitiatePurchase {
            product: product.clone(),
        })
        .await
    }

    pub async fn consume(&self, purchase_token: impl Into<String>) -> EngineResult<()> {
        self.send(EngineCommand::Consume {
            purchase_token: purchase_token.into(),
        })
        .await
    }

    pub async fn snapshot(&self) -> EngineResult<EngineSnapshot> {
        let (reply, response) = oneshot::channel();
        self.send(EngineCommand::Snapshot(reply)).await?;
        response.await.map_err(|_| EngineError::EngineStopped)
    }

    /// Reads the ledger through the worker, after every queued mutation.
    pub async fn products(&self) -> EngineResult<Vec<Product>> {
        let (reply, response) = oneshot::channel();
        self.send(EngineCommand::Products(reply)).await?;
        response.await.map_err(|_| EngineError::EngineStopped)?
    }

    /// Stops the worker: pending retries are cancelled, in-flight backend
    /// completions are discarded and the session is ended.
    pub async fn shutdown(&self) -> EngineResult<()> {
        let _ = self.shutdown.send(true);
        let worker = self.worker.lock().await.take();
        if let Some(worker) = worker {
            if let Err(err) = worker.await {
                warn!(?err, engine_id = %self.id, "billing engine worker ended abnormally");
            }
        }
        Ok(())
    }

    async fn send(&self, command: EngineCommand) -> EngineResult<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| EngineError::EngineStopped)
    }
}

async fn run_worker(
    mut state: ReconciliationLoop,
    mut commands: mpsc::Receiver<EngineCommand>,
    mut signals: mpsc::UnboundedReceiver<EngineCommand>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let command = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            Some(signal) = signals.recv() => signal,
            command = commands.recv() => match command {
                Some(command) => command,
                None => break,
            },
        };
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = dispatch(&mut state, command) => {}
        }
    }
    state.teardown().await;
}

async fn dispatch(state: &mut ReconciliationLoop, command: EngineCommand) {
    match command {
        EngineCommand::Reconcile => state.run().await,
        EngineCommand::InitiatePurchase { product } => state.initiate_purchase(product).await,
        EngineCommand::Consume { purchase_token } => state.consume(purchase_token).await,
        EngineCommand::SessionStarted {
            generation,
            outcome,
        } => state.on_session_started(generation, outcome).await,
        EngineCommand::SessionLost { generation, code } => {
            state.on_session_lost(generation, code)
        }
        EngineCommand::PurchasesUpdated {
            generation,
            code,
            purchases,
        } => state.on_purchases_updated(generation, code, purchases).await,
        EngineCommand::RetryElapsed(family) => state.on_retry_elapsed(family).await,
        EngineCommand::Snapshot(reply) => {
            let _ = reply.send(state.snapshot());
        }
        EngineCommand::Products(reply) => {
            let _ = reply.send(state.products().await);
        }
    }
}
