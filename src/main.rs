use std::sync::Arc;

use billing_reconciler::billing::{
    BillingEngine, BillingEvent, Ed25519SignatureVerifier, HttpBillingBackend, InMemoryLedger,
};
use billing_reconciler::{config, telemetry, EngineConfig, EngineError};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    telemetry::init();

    let engine_config = EngineConfig::from_env()?;
    // Fail fast when no signing keys are configured
    let verifier = Ed25519SignatureVerifier::from_base64_keys(config::BILLING_PUBLIC_KEYS.iter())
        .map_err(|err| EngineError::InvalidKey(err.to_string()))?;
    let backend = HttpBillingBackend::from_env()?;
    let ledger = Arc::new(InMemoryLedger::new());

    let engine = BillingEngine::start(
        engine_config,
        Arc::new(backend),
        Arc::new(verifier),
        ledger,
    )?;
    info!(
        engine_id = %engine.id(),
        backend = %config::BILLING_BACKEND_URL.as_str(),
        "billing reconciler running"
    );

    let mut subscription = engine.subscribe();
    tokio::spawn(async move {
        while let Some(event) = subscription.recv().await {
            match &event {
                BillingEvent::PurchaseError { code } => warn!(%code, "purchase error"),
                other => info!(event = ?other, "billing event"),
            }
        }
    });

    let heartbeat = engine.clone();
    let ticker = tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(*config::BILLING_RECONCILE_INTERVAL_SECS));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = heartbeat.reconcile().await {
                error!(?err, "failed to queue reconciliation");
                break;
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    ticker.abort();
    engine.shutdown().await?;
    Ok(())
}
