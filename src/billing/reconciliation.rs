use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::EngineResult;

use super::adapters::{BillingBackend, Ledger, SessionOutcome};
use super::backoff::{BackoffScheduler, RetryState, ScheduleOutcome};
use super::connection::{ConnectionManager, ConnectionState};
use super::engine::{EngineCommand, EngineSnapshot};
use super::events::{BillingEvent, EventBus};
use super::models::{Product, ProductCatalog, Purchase, PurchaseState};
use super::processor::{ConsumeOutcome, PurchaseOutcome, PurchaseProcessor};
use super::response::ResponseCode;
use super::verifier::SignatureVerifier;

/// Operation families with independent retry state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryFamily {
    Query,
    Consume,
}

/// key: billing-reconciliation -> worker-owned reconciliation state
///
/// Every field is owned by the single engine worker task; external requests
/// and backend callbacks reach it only as queued commands.
pub struct ReconciliationLoop {
    engine_id: Uuid,
    config: Arc<EngineConfig>,
    connection: ConnectionManager,
    scheduler: BackoffScheduler<RetryFamily>,
    query_retry: RetryState,
    consume_retry: RetryState,
    pending_consumes: VecDeque<String>,
    processor: PurchaseProcessor,
    ledger: Arc<dyn Ledger>,
    events: EventBus,
    signals: UnboundedSender<EngineCommand>,
    published_state: ConnectionState,
}

impl ReconciliationLoop {
    pub(crate) fn new(
        engine_id: Uuid,
        config: Arc<EngineConfig>,
        backend: Arc<dyn BillingBackend>,
        verifier: Arc<dyn SignatureVerifier>,
        ledger: Arc<dyn Ledger>,
        events: EventBus,
        signals: UnboundedSender<EngineCommand>,
    ) -> Self {
        Self {
            engine_id,
            query_retry: config.query_retry_state(),
            consume_retry: config.consume_retry_state(),
            connection: ConnectionManager::new(backend, signals.clone()),
            scheduler: BackoffScheduler::new(),
            pending_consumes: VecDeque::new(),
            processor: PurchaseProcessor::new(verifier, ledger.clone(), config.clone()),
            ledger,
            events,
            signals,
            config,
            published_state: ConnectionState::Disconnected,
        }
    }

    /// External reconciliation trigger (resume, heartbeat). Dropped while a
    /// query retry is already pending.
    pub async fn run(&mut self) {
        if self.scheduler.is_pending(RetryFamily::Query) {
            debug!("reconciliation retry already pending; relying on it");
            return;
        }
        self.reconcile().await;
    }

    pub async fn on_retry_elapsed(&mut self, family: RetryFamily) {
        if !self.scheduler.complete(family) {
            debug!(?family, "retry fired after cancellation; ignoring");
            return;
        }
        self.run_family(family).await;
    }

    pub async fn on_session_started(&mut self, generation: u64, outcome: SessionOutcome) {
        let ready = self.connection.on_session_started(generation, outcome);
        self.publish_connection();
        if !ready {
            return;
        }
        for family in [RetryFamily::Query, RetryFamily::Consume] {
            if self.scheduler.cancel(family) {
                debug!(?family, "session ready; running pending retry now");
                self.run_family(family).await;
            }
        }
    }

    pub fn on_session_lost(&mut self, generation: u64, code: ResponseCode) {
        self.connection.on_session_lost(generation, code);
        self.publish_connection();
    }

    pub async fn on_purchases_updated(
        &mut self,
        generation: u64,
        code: ResponseCode,
        purchases: Vec<Purchase>,
    ) {
        if generation != self.connection.generation() {
            debug!(
                generation,
                current = self.connection.generation(),
                count = purchases.len(),
                "stale purchase update ignored"
            );
            return;
        }
        if code != ResponseCode::Ok {
            warn!(%code, count = purchases.len(), "purchase update reported failure");
            self.events.emit(BillingEvent::PurchaseError { code });
            return;
        }
        let now = Utc::now();
        let mut retry_needed = false;
        for purchase in &purchases {
            let outcome = self.processor.handle(&mut self.connection, purchase, now).await;
            retry_needed |= self.report(purchase, outcome);
        }
        self.publish_connection();
        if retry_needed {
            self.connection.ensure_connected();
            self.schedule_retry(RetryFamily::Query);
        }
    }

    pub async fn consume(&mut self, purchase_token: String) {
        if self.pending_consumes.contains(&purchase_token) {
            debug!(token = %purchase_token, "consume already pending; relying on it");
            return;
        }
        self.pending_consumes.push_back(purchase_token);
        if self.scheduler.is_pending(RetryFamily::Consume) {
            return;
        }
        self.drain_consumes().await;
    }

    pub async fn initiate_purchase(&mut self, product: Product) {
        let catalog = &self.config.catalog;
        if !catalog.is_empty() && !catalog.contains(&product.product_id) {
            warn!(
                product_id = %product.product_id,
                suggestion = ?catalog.closest(&product.product_id),
                "purchase requested for product outside the catalog"
            );
            self.events.emit(BillingEvent::PurchaseError {
                code: ResponseCode::ItemUnavailable,
            });
            return;
        }

        if !self.connection.is_ready() {
            self.connection.ensure_connected();
            self.publish_connection();
            self.events.emit(BillingEvent::PurchaseError {
                code: ResponseCode::ServiceDisconnected,
            });
            return;
        }

        let catalog_id = self.config.catalog_product_id(&product.product_id);
        let code = match self
            .connection
            .query_catalog(&catalog_id, product.sku_kind)
            .await
        {
            Ok(Some(offer)) => {
                let code = self.connection.launch_purchase_ui(&offer).await;
                if code == ResponseCode::Ok {
                    info!(product_id = %catalog_id, "purchase flow launched");
                }
                code
            }
            Ok(None) => {
                warn!(
                    product_id = %catalog_id,
                    kind = product.sku_kind.as_str(),
                    "product not found in backend catalog"
                );
                ResponseCode::ItemUnavailable
            }
            Err(code) => code,
        };
        if code != ResponseCode::Ok {
            self.events.emit(BillingEvent::PurchaseError { code });
        }
        self.publish_connection();
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        let mut pending_retries = self.scheduler.pending_keys();
        pending_retries.sort();
        EngineSnapshot {
            engine_id: self.engine_id,
            connection: self.connection.state(),
            generation: self.connection.generation(),
            query_retry: self.query_retry,
            consume_retry: self.consume_retry,
            pending_retries,
            pending_consumes: self.pending_consumes.iter().cloned().collect(),
        }
    }

    pub async fn products(&self) -> EngineResult<Vec<Product>> {
        Ok(self.ledger.products().await?)
    }

    /// Cancels every pending retry and ends the backend session.
    pub async fn teardown(&mut self) {
        let cancelled = self.scheduler.cancel_all();
        self.pending_consumes.clear();
        self.connection.teardown().await;
        info!(cancelled, "billing engine torn down");
    }

    async fn run_family(&mut self, family: RetryFamily) {
        match family {
            RetryFamily::Query => self.reconcile().await,
            RetryFamily::Consume => self.drain_consumes().await,
        }
    }

    async fn reconcile(&mut self) {
        if !self.connection.is_ready() {
            self.connection.ensure_connected();
            self.publish_connection();
            self.schedule_retry(RetryFamily::Query);
            return;
        }

        let purchases = match self.connection.query_purchases().await {
            Ok(purchases) => purchases,
            Err(code) => {
                self.publish_connection();
                if code.is_transient() {
                    self.connection.ensure_connected();
                    self.schedule_retry(RetryFamily::Query);
                } else {
                    warn!(%code, "purchase query failed");
                    self.events.emit(BillingEvent::PurchaseError { code });
                }
                return;
            }
        };
        info!(count = purchases.len(), "purchases queried");

        let now = Utc::now();
        let mut retry_needed = false;
        let mut active_tokens = HashSet::new();
        for purchase in &purchases {
            let outcome = self.processor.handle(&mut self.connection, purchase, now).await;
            if purchase.state == PurchaseState::Purchased && outcome != PurchaseOutcome::Rejected {
                active_tokens.insert(purchase.purchase_token.clone());
            }
            retry_needed |= self.report(purchase, outcome);
        }
        self.publish_connection();
        // The query family keeps backing off until a pass needs no retry.
        if retry_needed {
            self.connection.ensure_connected();
            self.schedule_retry(RetryFamily::Query);
        } else {
            self.query_retry.reset();
        }
        self.sweep(&active_tokens, now).await;
    }

    async fn drain_consumes(&mut self) {
        if !self.connection.is_ready() {
            self.connection.ensure_connected();
            self.publish_connection();
            self.schedule_retry(RetryFamily::Consume);
            return;
        }

        let now = Utc::now();
        let mut deferred = VecDeque::new();
        while let Some(token) = self.pending_consumes.pop_front() {
            match self.processor.consume(&mut self.connection, &token, now).await {
                ConsumeOutcome::Consumed => self.events.emit(BillingEvent::PurchaseConsumed {
                    code: ResponseCode::Ok,
                    purchase_token: token,
                }),
                ConsumeOutcome::RetryLater(code) => {
                    debug!(%token, %code, "consume deferred");
                    deferred.push_back(token);
                }
                ConsumeOutcome::Failed(code) => {
                    warn!(%token, %code, "consume rejected");
                    self.events.emit(BillingEvent::PurchaseError { code });
                }
            }
        }
        self.publish_connection();

        if deferred.is_empty() {
            self.consume_retry.reset();
        } else {
            self.pending_consumes = deferred;
            self.connection.ensure_connected();
            self.schedule_retry(RetryFamily::Consume);
        }
    }

    /// Emits the caller-facing report for one outcome. Returns whether the
    /// purchase needs another reconciliation attempt.
    fn report(&self, purchase: &Purchase, outcome: PurchaseOutcome) -> bool {
        match outcome {
            PurchaseOutcome::InProgress | PurchaseOutcome::Delivered { .. } => {
                self.events.emit(BillingEvent::PurchaseUpdated {
                    code: ResponseCode::Ok,
                    purchase: purchase.clone(),
                });
                false
            }
            PurchaseOutcome::Rejected => false,
            PurchaseOutcome::RetryLater(_) => true,
            PurchaseOutcome::Failed(code) => {
                self.events.emit(BillingEvent::PurchaseError { code });
                false
            }
        }
    }

    /// Marks vanished subscriptions and hands the invalid set to the ledger.
    async fn sweep(&self, active_tokens: &HashSet<String>, now: DateTime<Utc>) {
        let mut products = match self.ledger.products().await {
            Ok(products) => products,
            Err(err) => {
                error!(?err, "failed to load products for invalid-product check");
                return;
            }
        };

        for product in products.iter_mut() {
            let vanished = product
                .purchase_token
                .as_ref()
                .map_or(false, |token| !active_tokens.contains(token));
            if vanished && product.record_unsubscribed(now) {
                info!(product_id = %product.product_id, "subscription no longer reported; marked unsubscribed");
                if let Err(err) = self.ledger.save(product).await {
                    error!(?err, product_id = %product.product_id, "failed to save product into ledger");
                }
            }
        }

        let invalid = find_invalid_products(&products, &self.config.catalog, now);
        if !invalid.is_empty() {
            info!(
                products = ?invalid.iter().map(|p| p.product_id.as_str()).collect::<Vec<_>>(),
                "flagging invalid products"
            );
        }
        if let Err(err) = self.ledger.flag_invalid(&invalid).await {
            error!(?err, "failed to flag invalid products");
        }
    }

    fn schedule_retry(&mut self, family: RetryFamily) {
        let signals = self.signals.clone();
        let state = match family {
            RetryFamily::Query => &mut self.query_retry,
            RetryFamily::Consume => &mut self.consume_retry,
        };
        let outcome = self.scheduler.schedule(family, state, async move {
            let _ = signals.send(EngineCommand::RetryElapsed(family));
        });
        match outcome {
            ScheduleOutcome::Scheduled(_) | ScheduleOutcome::AlreadyPending => {}
            ScheduleOutcome::Exhausted => match family {
                RetryFamily::Query => {
                    warn!("could not reach purchasing service; giving up on reconciliation");
                    self.events.emit(BillingEvent::PurchaseError {
                        code: ResponseCode::ServiceUnavailable,
                    });
                }
                RetryFamily::Consume => {
                    warn!(
                        count = self.pending_consumes.len(),
                        "could not reach purchasing service; giving up on consume"
                    );
                    for token in self.pending_consumes.drain(..) {
                        self.events.emit(BillingEvent::PurchaseConsumed {
                            code: ResponseCode::ServiceUnavailable,
                            purchase_token: token,
                        });
                    }
                }
            },
        }
    }

    fn publish_connection(&mut self) {
        let state = self.connection.state();
        if state != self.published_state {
            self.published_state = state;
            self.events.emit(BillingEvent::ConnectionChanged { state });
        }
    }
}

/// Products whose subscription window has passed, or which the catalog no
/// longer sells. An empty catalog disables the second check.
pub fn find_invalid_products(
    products: &[Product],
    catalog: &ProductCatalog,
    now: DateTime<Utc>,
) -> Vec<Product> {
    products
        .iter()
        .filter(|product| {
            product.is_expired(now)
                || (!catalog.is_empty() && !catalog.contains(&product.product_id))
        })
        .cloned()
        .collect()
}
