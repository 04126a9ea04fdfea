use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;

use super::adapters::Ledger;
use super::connection::ConnectionManager;
use super::models::{BillingPeriod, Product, Purchase, PurchaseState};
use super::response::{ResponseClass, ResponseCode};
use super::verifier::SignatureVerifier;

/// What happened to one purchase notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurchaseOutcome {
    /// Pending or unspecified; a later Purchased delivery is expected.
    InProgress,
    /// Signature mismatch. Dropped without any report.
    Rejected,
    Delivered { acknowledged_now: bool },
    RetryLater(ResponseCode),
    Failed(ResponseCode),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeOutcome {
    Consumed,
    RetryLater(ResponseCode),
    Failed(ResponseCode),
}

/// key: billing-purchase-processor -> per-purchase state machine
pub struct PurchaseProcessor {
    verifier: Arc<dyn SignatureVerifier>,
    ledger: Arc<dyn Ledger>,
    config: Arc<EngineConfig>,
}

impl PurchaseProcessor {
    pub fn new(
        verifier: Arc<dyn SignatureVerifier>,
        ledger: Arc<dyn Ledger>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            verifier,
            ledger,
            config,
        }
    }

    pub async fn handle(
        &self,
        connection: &mut ConnectionManager,
        purchase: &Purchase,
        now: DateTime<Utc>,
    ) -> PurchaseOutcome {
        let token = purchase.purchase_token.as_str();
        match purchase.state {
            PurchaseState::Pending | PurchaseState::Unspecified => {
                debug!(%token, state = ?purchase.state, "purchase in progress");
                PurchaseOutcome::InProgress
            }
            PurchaseState::Purchased => {
                if !self
                    .verifier
                    .verify(&purchase.original_json, &purchase.signature)
                {
                    warn!(
                        %token,
                        products = ?purchase.product_ids,
                        "purchase signature invalid; dropping"
                    );
                    return PurchaseOutcome::Rejected;
                }

                if purchase.acknowledged {
                    self.bind_redelivered(purchase, now).await;
                    return PurchaseOutcome::Delivered {
                        acknowledged_now: false,
                    };
                }

                match connection.acknowledge(token).await {
                    Ok(()) => {
                        info!(%token, products = ?purchase.product_ids, "purchase acknowledged");
                        self.bind_acknowledged(purchase, now).await;
                        PurchaseOutcome::Delivered {
                            acknowledged_now: true,
                        }
                    }
                    Err(code) => match code.classify() {
                        ResponseClass::Transient => {
                            debug!(%token, %code, "acknowledge deferred");
                            PurchaseOutcome::RetryLater(code)
                        }
                        ResponseClass::Success | ResponseClass::Permanent => {
                            warn!(%token, %code, "acknowledge rejected by backend");
                            PurchaseOutcome::Failed(code)
                        }
                    },
                }
            }
        }
    }

    pub async fn consume(
        &self,
        connection: &mut ConnectionManager,
        purchase_token: &str,
        now: DateTime<Utc>,
    ) -> ConsumeOutcome {
        let bound = match self.ledger.find_by_token(purchase_token).await {
            Ok(product) => product,
            Err(err) => {
                error!(?err, token = %purchase_token, "failed to look up product for consume");
                None
            }
        };
        if let Some(product) = bound.as_ref() {
            if !product.sku_kind.rules().consumable {
                warn!(
                    token = %purchase_token,
                    product_id = %product.product_id,
                    kind = product.sku_kind.as_str(),
                    "refusing to consume non-consumable product"
                );
                return ConsumeOutcome::Failed(ResponseCode::DeveloperError);
            }
        }

        match connection.consume(purchase_token).await {
            Ok(()) => {
                info!(token = %purchase_token, "purchase consumed");
                if let Some(mut product) = bound {
                    if product.record_consumed(now) {
                        self.persist(&product).await;
                    }
                }
                ConsumeOutcome::Consumed
            }
            Err(code) if code.is_transient() => ConsumeOutcome::RetryLater(code),
            Err(code) => ConsumeOutcome::Failed(code),
        }
    }

    async fn bind_acknowledged(&self, purchase: &Purchase, now: DateTime<Utc>) {
        for product_id in &purchase.product_ids {
            let Some((mut product, period)) = self.resolve_product(product_id).await else {
                continue;
            };
            product.record_acknowledged(&purchase.purchase_token, now, period);
            self.persist(&product).await;
        }
    }

    async fn bind_redelivered(&self, purchase: &Purchase, now: DateTime<Utc>) {
        for product_id in &purchase.product_ids {
            let Some((mut product, period)) = self.resolve_product(product_id).await else {
                continue;
            };
            if product.record_redelivered(&purchase.purchase_token, now, period) {
                self.persist(&product).await;
            }
        }
    }

    /// Loads the ledger row for a backend product id, creating it from the
    /// catalog when missing.
    async fn resolve_product(
        &self,
        backend_product_id: &str,
    ) -> Option<(Product, Option<BillingPeriod>)> {
        let product_id = self.config.ledger_product_id(backend_product_id);
        let entry = self.config.catalog.get(product_id).copied();
        let existing = match self.ledger.load(product_id).await {
            Ok(existing) => existing,
            Err(err) => {
                error!(?err, %product_id, "failed to load product from ledger");
                return None;
            }
        };
        match (existing, entry) {
            (Some(product), entry) => Some((product, entry.and_then(|entry| entry.period))),
            (None, Some(entry)) => Some((Product::new(product_id, entry.kind), entry.period)),
            (None, None) => {
                warn!(%product_id, "purchased product is not in the catalog; not recorded");
                None
            }
        }
    }

    async fn persist(&self, product: &Product) {
        if let Err(err) = self.ledger.save(product).await {
            error!(
                ?err,
                product_id = %product.product_id,
                "failed to save product into ledger"
            );
        }
    }
}
