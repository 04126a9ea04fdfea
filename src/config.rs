use std::fs;

use once_cell::sync::Lazy;
use regex::Regex;
use tokio::time::Duration;

use crate::billing::backoff::RetryState;
use crate::billing::models::{BillingPeriod, ProductCatalog, SkuKind};
use crate::error::{EngineError, EngineResult};

/// Prefix the purchasing service expects for product ids in test sessions.
pub const TEST_SESSION_PREFIX: &str = "temp_";

/// key: billing-config -> base delay shared by query and consume retries
pub static BILLING_QUERY_RETRY_BASE_MS: Lazy<u64> =
    Lazy::new(|| read_u64_env("BILLING_QUERY_RETRY_BASE_MS").unwrap_or(1_000));

/// key: billing-config -> query retry cap
pub static BILLING_QUERY_RETRY_CAP_MS: Lazy<u64> =
    Lazy::new(|| read_u64_env("BILLING_QUERY_RETRY_CAP_MS").unwrap_or(300_000));

/// key: billing-config -> consume retry cap; shorter since a user is waiting
pub static BILLING_CONSUME_RETRY_CAP_MS: Lazy<u64> =
    Lazy::new(|| read_u64_env("BILLING_CONSUME_RETRY_CAP_MS").unwrap_or(120_000));

/// When truthy, catalog lookups use the `temp_` test product ids.
pub static BILLING_TEST_SESSION: Lazy<bool> = Lazy::new(|| {
    read_optional_env("BILLING_TEST_SESSION")
        .map(|value| {
            let normalized = value.to_ascii_lowercase();
            matches!(normalized.as_str(), "1" | "true" | "yes")
        })
        .unwrap_or(false)
});

/// Products sold by the application, as `id:kind[:period]` separated by commas,
/// e.g. `premium:subscription:monthly,coins_100:consumable`.
pub static BILLING_CATALOG: Lazy<Option<String>> =
    Lazy::new(|| read_optional_env("BILLING_CATALOG"));

/// Base64 Ed25519 public keys trusted for purchase signatures, comma separated.
pub static BILLING_PUBLIC_KEYS: Lazy<Vec<String>> = Lazy::new(|| {
    read_optional_env("BILLING_PUBLIC_KEYS")
        .map(|value| {
            value
                .split(',')
                .map(str::trim)
                .filter(|key| !key.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
});

/// Base URL of the purchasing service. Defaults to `http://127.0.0.1:8787`.
pub static BILLING_BACKEND_URL: Lazy<String> = Lazy::new(|| {
    read_optional_env("BILLING_BACKEND_URL").unwrap_or_else(|| "http://127.0.0.1:8787".to_string())
});

pub static BILLING_BACKEND_TIMEOUT_SECS: Lazy<u64> = Lazy::new(|| {
    read_u64_env("BILLING_BACKEND_TIMEOUT_SECS")
        .filter(|value| *value > 0)
        .unwrap_or(15)
});

/// key: billing-config -> heartbeat reconciliation cadence
pub static BILLING_RECONCILE_INTERVAL_SECS: Lazy<u64> = Lazy::new(|| {
    read_u64_env("BILLING_RECONCILE_INTERVAL_SECS")
        .filter(|value| *value > 0)
        .unwrap_or(300)
});

static PRODUCT_ID_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9][a-z0-9._]*$").expect("invalid product id pattern"));

/// key: billing-engine-config -> explicit engine context
///
/// Passed to the engine at construction; the engine never reads the
/// environment itself.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub query_retry_base_ms: u64,
    pub query_retry_cap_ms: u64,
    pub consume_retry_base_ms: u64,
    pub consume_retry_cap_ms: u64,
    pub test_session: bool,
    pub catalog: ProductCatalog,
    pub command_buffer: usize,
    pub event_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            query_retry_base_ms: 1_000,
            query_retry_cap_ms: 300_000,
            consume_retry_base_ms: 1_000,
            consume_retry_cap_ms: 120_000,
            test_session: false,
            catalog: ProductCatalog::new(),
            command_buffer: 64,
            event_buffer: 256,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> EngineResult<Self> {
        let catalog = match BILLING_CATALOG.as_deref() {
            Some(raw) => parse_catalog(raw)?,
            None => ProductCatalog::new(),
        };
        let config = Self {
            query_retry_base_ms: *BILLING_QUERY_RETRY_BASE_MS,
            query_retry_cap_ms: *BILLING_QUERY_RETRY_CAP_MS,
            consume_retry_base_ms: *BILLING_QUERY_RETRY_BASE_MS,
            consume_retry_cap_ms: *BILLING_CONSUME_RETRY_CAP_MS,
            test_session: *BILLING_TEST_SESSION,
            catalog,
            ..Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn with_catalog(mut self, catalog: ProductCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn validate(&self) -> EngineResult<()> {
        for (family, base, cap) in [
            ("query", self.query_retry_base_ms, self.query_retry_cap_ms),
            ("consume", self.consume_retry_base_ms, self.consume_retry_cap_ms),
        ] {
            if base == 0 {
                return Err(EngineError::Config(format!(
                    "{family} retry base delay must be positive"
                )));
            }
            if cap < base {
                return Err(EngineError::Config(format!(
                    "{family} retry cap {cap}ms is below base {base}ms"
                )));
            }
        }
        Ok(())
    }

    pub fn query_retry_state(&self) -> RetryState {
        RetryState::new(
            Duration::from_millis(self.query_retry_base_ms),
            Duration::from_millis(self.query_retry_cap_ms),
        )
    }

    pub fn consume_retry_state(&self) -> RetryState {
        RetryState::new(
            Duration::from_millis(self.consume_retry_base_ms),
            Duration::from_millis(self.consume_retry_cap_ms),
        )
    }

    /// Product id as known to the purchasing service.
    pub fn catalog_product_id(&self, product_id: &str) -> String {
        if self.test_session {
            format!("{TEST_SESSION_PREFIX}{product_id}")
        } else {
            product_id.to_string()
        }
    }

    /// Product id as stored in the ledger.
    pub fn ledger_product_id<'a>(&self, backend_product_id: &'a str) -> &'a str {
        if self.test_session {
            backend_product_id
                .strip_prefix(TEST_SESSION_PREFIX)
                .unwrap_or(backend_product_id)
        } else {
            backend_product_id
        }
    }
}

/// Parses `id:kind[:period]` entries separated by commas.
pub fn parse_catalog(entries: &str) -> EngineResult<ProductCatalog> {
    let mut catalog = ProductCatalog::new();
    for raw in entries.split(',') {
        let entry = raw.trim();
        if entry.is_empty() {
            continue;
        }
        let mut parts = entry.split(':').map(str::trim);
        let product_id = parts.next().unwrap_or_default();
        if !PRODUCT_ID_PATTERN.is_match(product_id) {
            return Err(EngineError::Config(format!(
                "invalid product id '{product_id}' in catalog"
            )));
        }
        let kind = parts
            .next()
            .and_then(|raw_kind| raw_kind.parse::<SkuKind>().ok())
            .ok_or_else(|| EngineError::Config(format!("missing or unknown kind for '{product_id}'")))?;
        let period = match parts.next() {
            Some(raw_period) => Some(raw_period.parse::<BillingPeriod>().map_err(|_| {
                EngineError::Config(format!("unknown billing period '{raw_period}' for '{product_id}'"))
            })?),
            None => None,
        };
        if kind == SkuKind::Subscription && period.is_none() {
            return Err(EngineError::Config(format!(
                "subscription '{product_id}' needs a billing period"
            )));
        }
        catalog.insert(product_id, kind, period);
    }
    Ok(catalog)
}

/// Reads the request signing secret, preferring `BILLING_BACKEND_SECRET_FILE`.
pub fn backend_secret_from_env() -> EngineResult<Option<String>> {
    if let Some(path) = read_optional_env("BILLING_BACKEND_SECRET_FILE") {
        let contents = fs::read_to_string(&path).map_err(|err| {
            EngineError::Config(format!("failed to read BILLING_BACKEND_SECRET_FILE from {path}: {err}"))
        })?;
        let trimmed = contents.trim().to_string();
        if !trimmed.is_empty() {
            return Ok(Some(trimmed));
        }
    }
    Ok(read_optional_env("BILLING_BACKEND_SECRET"))
}

fn read_optional_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn read_u64_env(key: &str) -> Option<u64> {
    read_optional_env(key).and_then(|value| value.parse::<u64>().ok())
}
