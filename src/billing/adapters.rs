use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

use super::engine::EngineCommand;
use super::models::{CatalogOffer, Product, Purchase, SkuKind};
use super::response::ResponseCode;

/// Backend failures are always expressed as a response code. `Err` never
/// carries [`ResponseCode::Ok`].
pub type BackendResult<T> = std::result::Result<T, ResponseCode>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    Ready,
    Lost(ResponseCode),
}

/// key: billing-backend-adapter -> purchasing service integration
#[async_trait]
pub trait BillingBackend: Send + Sync {
    /// Opens a session. `listener` stays valid for the whole session and is
    /// the only way to report a later session loss or purchase updates.
    async fn start_session(&self, listener: BackendListener) -> SessionOutcome;
    async fn end_session(&self);
    async fn query_purchases(&self) -> BackendResult<Vec<Purchase>>;
    async fn acknowledge(&self, purchase_token: &str) -> BackendResult<()>;
    async fn consume(&self, purchase_token: &str) -> BackendResult<()>;
    async fn query_catalog(
        &self,
        product_id: &str,
        kind: SkuKind,
    ) -> BackendResult<Option<CatalogOffer>>;
    async fn launch_purchase_ui(&self, offer: &CatalogOffer) -> ResponseCode;
}

/// key: billing-backend-listener -> callbacks onto the worker queue
///
/// Backend callbacks may run on any task, including the worker itself while it
/// awaits a backend call. They only enqueue onto the unbounded signal queue and
/// never wait; nothing here touches engine state directly.
#[derive(Debug, Clone)]
pub struct BackendListener {
    generation: u64,
    signals: UnboundedSender<EngineCommand>,
}

impl BackendListener {
    pub(crate) fn new(generation: u64, signals: UnboundedSender<EngineCommand>) -> Self {
        Self {
            generation,
            signals,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn session_lost(&self, code: ResponseCode) {
        let command = EngineCommand::SessionLost {
            generation: self.generation,
            code,
        };
        if self.signals.send(command).is_err() {
            debug!(generation = self.generation, "session loss after engine teardown ignored");
        }
    }

    pub fn purchases_updated(&self, code: ResponseCode, purchases: Vec<Purchase>) {
        let command = EngineCommand::PurchasesUpdated {
            generation: self.generation,
            code,
            purchases,
        };
        if self.signals.send(command).is_err() {
            debug!(
                generation = self.generation,
                "purchase update after engine teardown ignored"
            );
        }
    }
}

/// key: billing-ledger-adapter -> persisted product set
#[async_trait]
pub trait Ledger: Send + Sync {
    async fn save(&self, product: &Product) -> Result<()>;
    async fn load(&self, product_id: &str) -> Result<Option<Product>>;
    async fn products(&self) -> Result<Vec<Product>>;
    async fn flag_invalid(&self, products: &[Product]) -> Result<()>;

    async fn find_by_token(&self, purchase_token: &str) -> Result<Option<Product>> {
        Ok(self
            .products()
            .await?
            .into_iter()
            .find(|product| product.purchase_token.as_deref() == Some(purchase_token)))
    }
}

/// key: billing-ledger-memory -> process-local ledger
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    products: DashMap<String, Product>,
    flagged: DashMap<String, Product>,
    flag_calls: AtomicUsize,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_products(products: impl IntoIterator<Item = Product>) -> Self {
        let ledger = Self::new();
        for product in products {
            ledger.products.insert(product.product_id.clone(), product);
        }
        ledger
    }

    pub fn get(&self, product_id: &str) -> Option<Product> {
        self.products.get(product_id).map(|entry| entry.clone())
    }

    pub fn flagged_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.flagged.iter().map(|entry| entry.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn flag_calls(&self) -> usize {
        self.flag_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Ledger for InMemoryLedger {
    async fn save(&self, product: &Product) -> Result<()> {
        self.products
            .insert(product.product_id.clone(), product.clone());
        Ok(())
    }

    async fn load(&self, product_id: &str) -> Result<Option<Product>> {
        Ok(self.get(product_id))
    }

    async fn products(&self) -> Result<Vec<Product>> {
        let mut products: Vec<Product> =
            self.products.iter().map(|entry| entry.value().clone()).collect();
        products.sort_by(|a, b| a.product_id.cmp(&b.product_id));
        Ok(products)
    }

    async fn flag_invalid(&self, products: &[Product]) -> Result<()> {
        self.flag_calls.fetch_add(1, Ordering::SeqCst);
        for product in products {
            self.flagged
                .insert(product.product_id.clone(), product.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_ledger_finds_by_token() {
        let mut product = Product::new("coins_100", SkuKind::Consumable);
        product.purchase_token = Some("tok-9".into());
        let ledger = InMemoryLedger::with_products([product.clone()]);

        let found = ledger.find_by_token("tok-9").await.unwrap();
        assert_eq!(found, Some(product));
        assert!(ledger.find_by_token("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn in_memory_ledger_records_flags() {
        let ledger = InMemoryLedger::new();
        let product = Product::new("legacy", SkuKind::Subscription);
        ledger.flag_invalid(&[product]).await.unwrap();
        ledger.flag_invalid(&[]).await.unwrap();

        assert_eq!(ledger.flag_calls(), 2);
        assert_eq!(ledger.flagged_ids(), vec!["legacy".to_string()]);
    }
}
