#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as Base64Engine;
use base64::Engine;
use billing_reconciler::billing::{
    BackendListener, BackendResult, BillingBackend, BillingEngine, BillingEvent,
    BillingSubscription, CatalogOffer, Ed25519SignatureVerifier, InMemoryLedger, Purchase,
    PurchaseState, ResponseCode, SessionOutcome, SkuKind,
};
use billing_reconciler::EngineConfig;
use ed25519_dalek::{Keypair, PublicKey, SecretKey, Signer};
use serde_json::json;
use tokio::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionScript {
    Ready,
    Lost(ResponseCode),
    /// Never completes; only teardown ends it.
    Hang,
}

#[derive(Debug, Default)]
pub struct Script {
    pub sessions: VecDeque<SessionScript>,
    pub session_default: Option<SessionScript>,
    pub purchases: Vec<Purchase>,
    pub query_results: VecDeque<BackendResult<Vec<Purchase>>>,
    pub ack_results: VecDeque<BackendResult<()>>,
    pub ack_default: Option<BackendResult<()>>,
    pub consume_results: VecDeque<BackendResult<()>>,
    pub offers: Vec<CatalogOffer>,
    pub launch_code: Option<ResponseCode>,

    pub session_starts: Vec<Instant>,
    pub session_ends: usize,
    pub queries: usize,
    pub acknowledged: Vec<String>,
    pub consumed: Vec<String>,
    pub catalog_lookups: Vec<(String, SkuKind)>,
    pub launched: Vec<CatalogOffer>,
    pub listener: Option<BackendListener>,
}

/// In-process purchasing service driven by a script. Every call is recorded.
#[derive(Debug, Default)]
pub struct ScriptedBackend {
    script: Mutex<Script>,
}

impl ScriptedBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap()
    }

    pub fn listener(&self) -> BackendListener {
        self.script()
            .listener
            .clone()
            .expect("no session has been started")
    }
}

#[async_trait]
impl BillingBackend for ScriptedBackend {
    async fn start_session(&self, listener: BackendListener) -> SessionOutcome {
        let step = {
            let mut script = self.script();
            script.session_starts.push(Instant::now());
            script.listener = Some(listener);
            script
                .sessions
                .pop_front()
                .or(script.session_default)
                .unwrap_or(SessionScript::Ready)
        };
        match step {
            SessionScript::Ready => SessionOutcome::Ready,
            SessionScript::Lost(code) => SessionOutcome::Lost(code),
            SessionScript::Hang => std::future::pending().await,
        }
    }

    async fn end_session(&self) {
        self.script().session_ends += 1;
    }

    async fn query_purchases(&self) -> BackendResult<Vec<Purchase>> {
        let mut script = self.script();
        script.queries += 1;
        let result = match script.query_results.pop_front() {
            Some(result) => result,
            None => Ok(script.purchases.clone()),
        };
        // A dropped connection is also signalled, as a real service would.
        if result == Err(ResponseCode::ServiceDisconnected) {
            if let Some(listener) = script.listener.as_ref() {
                listener.session_lost(ResponseCode::ServiceDisconnected);
            }
        }
        result
    }

    async fn acknowledge(&self, purchase_token: &str) -> BackendResult<()> {
        let mut script = self.script();
        script.acknowledged.push(purchase_token.to_string());
        let fallback = script.ack_default.clone().unwrap_or(Ok(()));
        script.ack_results.pop_front().unwrap_or(fallback)
    }

    async fn consume(&self, purchase_token: &str) -> BackendResult<()> {
        let mut script = self.script();
        script.consumed.push(purchase_token.to_string());
        script.consume_results.pop_front().unwrap_or(Ok(()))
    }

    async fn query_catalog(
        &self,
        product_id: &str,
        kind: SkuKind,
    ) -> BackendResult<Option<CatalogOffer>> {
        let mut script = self.script();
        script
            .catalog_lookups
            .push((product_id.to_string(), kind));
        Ok(script
            .offers
            .iter()
            .find(|offer| offer.product_id == product_id && offer.kind == kind)
            .cloned())
    }

    async fn launch_purchase_ui(&self, offer: &CatalogOffer) -> ResponseCode {
        let mut script = self.script();
        script.launched.push(offer.clone());
        script.launch_code.unwrap_or(ResponseCode::Ok)
    }
}

pub fn keypair(seed: u8) -> Keypair {
    let secret = SecretKey::from_bytes(&[seed; 32]).unwrap();
    let public = PublicKey::from(&secret);
    Keypair { secret, public }
}

pub fn verifier() -> Arc<Ed25519SignatureVerifier> {
    Arc::new(Ed25519SignatureVerifier::new(vec![keypair(7).public]))
}

/// Purchase signed by the trusted key.
pub fn signed_purchase(
    token: &str,
    product_id: &str,
    state: PurchaseState,
    acknowledged: bool,
) -> Purchase {
    purchase_signed_by(&keypair(7), token, product_id, state, acknowledged)
}

pub fn purchase_signed_by(
    keys: &Keypair,
    token: &str,
    product_id: &str,
    state: PurchaseState,
    acknowledged: bool,
) -> Purchase {
    let original_json = json!({
        "purchase_token": token,
        "product_id": product_id,
        "state": state,
    })
    .to_string();
    let signature = Base64Engine.encode(keys.sign(original_json.as_bytes()).to_bytes());
    Purchase {
        purchase_token: token.to_string(),
        product_ids: vec![product_id.to_string()],
        state,
        signature,
        original_json,
        acknowledged,
    }
}

pub fn start_engine(
    config: EngineConfig,
    backend: Arc<ScriptedBackend>,
    ledger: Arc<InMemoryLedger>,
) -> BillingEngine {
    BillingEngine::start(config, backend, verifier(), ledger).unwrap()
}

/// Lets queued commands, session tasks and short timers run.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

pub fn drain(subscription: &mut BillingSubscription) -> Vec<BillingEvent> {
    let mut events = Vec::new();
    while let Some(event) = subscription.try_recv() {
        events.push(event);
    }
    events
}

/// Events other than connection state changes.
pub fn purchase_events(subscription: &mut BillingSubscription) -> Vec<BillingEvent> {
    drain(subscription)
        .into_iter()
        .filter(|event| !matches!(event, BillingEvent::ConnectionChanged { .. }))
        .collect()
}
