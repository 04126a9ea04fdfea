pub mod adapters;
pub mod backoff;
pub mod connection;
pub mod engine;
pub mod events;
pub mod http;
pub mod models;
pub mod processor;
pub mod reconciliation;
pub mod response;
pub mod verifier;

pub use adapters::{
    BackendListener, BackendResult, BillingBackend, InMemoryLedger, Ledger, SessionOutcome,
};
pub use backoff::{BackoffScheduler, RetryState, RetryStep, ScheduleOutcome};
pub use connection::{ConnectionManager, ConnectionState};
pub use engine::{BillingEngine, EngineSnapshot};
pub use events::{BillingEvent, BillingSubscription};
pub use http::HttpBillingBackend;
pub use models::{
    BillingPeriod, CatalogEntry, CatalogOffer, Product, ProductCatalog, Purchase, PurchaseState,
    SkuKind, SkuRules,
};
pub use processor::{ConsumeOutcome, PurchaseOutcome, PurchaseProcessor};
pub use reconciliation::{find_invalid_products, ReconciliationLoop, RetryFamily};
pub use response::{ResponseClass, ResponseCode};
pub use verifier::{Ed25519SignatureVerifier, SignatureVerifier};
