use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, Duration, Months, Utc};
use serde::{Deserialize, Serialize};

/// key: billing-purchase-state -> backend purchase lifecycle
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PurchaseState {
    Pending,
    Purchased,
    Unspecified,
}

/// key: billing-purchase-model -> one backend notification
///
/// Immutable per notification. The same token may be delivered several times
/// (pending, purchased, re-delivered after acknowledge).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Purchase {
    pub purchase_token: String,
    pub product_ids: Vec<String>,
    pub state: PurchaseState,
    pub signature: String,
    pub original_json: String,
    pub acknowledged: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SkuKind {
    Consumable,
    Subscription,
}

/// Per-kind acknowledge/consume rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SkuRules {
    pub consumable: bool,
    pub tracks_window: bool,
    pub backend_type: &'static str,
}

const CONSUMABLE_RULES: SkuRules = SkuRules {
    consumable: true,
    tracks_window: false,
    backend_type: "inapp",
};

const SUBSCRIPTION_RULES: SkuRules = SkuRules {
    consumable: false,
    tracks_window: true,
    backend_type: "subs",
};

impl SkuKind {
    pub fn rules(&self) -> &'static SkuRules {
        match self {
            SkuKind::Consumable => &CONSUMABLE_RULES,
            SkuKind::Subscription => &SUBSCRIPTION_RULES,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SkuKind::Consumable => "consumable",
            SkuKind::Subscription => "subscription",
        }
    }
}

impl FromStr for SkuKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "consumable" | "inapp" => Ok(Self::Consumable),
            "subscription" | "subs" => Ok(Self::Subscription),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BillingPeriod {
    Daily,
    Weekly,
    Monthly,
    Quarterly,
    Annual,
}

impl FromStr for BillingPeriod {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "daily" => Ok(Self::Daily),
            "weekly" => Ok(Self::Weekly),
            "monthly" => Ok(Self::Monthly),
            "quarterly" => Ok(Self::Quarterly),
            "annual" | "yearly" => Ok(Self::Annual),
            _ => Err(()),
        }
    }
}

impl BillingPeriod {

    /// End of the period starting at `start`. Saturates at `start` on overflow.
    pub fn advance(&self, start: DateTime<Utc>) -> DateTime<Utc> {
        let next = match self {
            BillingPeriod::Daily => start.checked_add_signed(Duration::days(1)),
            BillingPeriod::Weekly => start.checked_add_signed(Duration::days(7)),
            BillingPeriod::Monthly => start.checked_add_months(Months::new(1)),
            BillingPeriod::Quarterly => start.checked_add_months(Months::new(3)),
            BillingPeriod::Annual => start.checked_add_months(Months::new(12)),
        };
        next.unwrap_or(start)
    }
}

/// key: billing-product-model -> application-owned ledger row
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Product {
    pub product_id: String,
    pub sku_kind: SkuKind,
    pub purchase_token: Option<String>,
    pub acknowledge_time: Option<DateTime<Utc>>,
    pub consume_time: Option<DateTime<Utc>>,
    pub subscribe_time: Option<DateTime<Utc>>,
    pub unsubscribe_time: Option<DateTime<Utc>>,
    pub end_subscribe_time: Option<DateTime<Utc>>,
}

impl Product {
    pub fn new(product_id: impl Into<String>, sku_kind: SkuKind) -> Self {
        Self {
            product_id: product_id.into(),
            sku_kind,
            purchase_token: None,
            acknowledge_time: None,
            consume_time: None,
            subscribe_time: None,
            unsubscribe_time: None,
            end_subscribe_time: None,
        }
    }

    /// Applies a successful backend acknowledge of `token`.
    pub fn record_acknowledged(
        &mut self,
        token: &str,
        now: DateTime<Utc>,
        period: Option<BillingPeriod>,
    ) {
        let rebound = self.purchase_token.as_deref() != Some(token);
        self.purchase_token = Some(token.to_string());
        self.acknowledge_time = Some(now);
        if self.sku_kind.rules().consumable {
            self.consume_time = None;
        }
        if self.sku_kind.rules().tracks_window && (rebound || self.subscribe_time.is_none()) {
            self.subscribe_time = Some(now);
            self.unsubscribe_time = None;
            self.end_subscribe_time = period.map(|period| period.advance(now));
        }
    }

    /// Applies an already-acknowledged re-delivery. Binds the token when the
    /// ledger has not seen it yet and rolls an elapsed subscription window
    /// forward. Returns whether anything changed.
    pub fn record_redelivered(
        &mut self,
        token: &str,
        now: DateTime<Utc>,
        period: Option<BillingPeriod>,
    ) -> bool {
        let mut changed = false;
        if self.purchase_token.as_deref() != Some(token) {
            self.purchase_token = Some(token.to_string());
            changed = true;
        }
        if !self.sku_kind.rules().tracks_window {
            return changed;
        }
        // Reported active again after a sweep marked it gone.
        if self.unsubscribe_time.take().is_some() {
            changed = true;
        }
        let Some(period) = period else {
            return changed;
        };
        if self.subscribe_time.is_none() {
            self.subscribe_time = Some(now);
            self.end_subscribe_time = Some(period.advance(now));
            return true;
        }
        if let Some(mut end) = self.end_subscribe_time {
            while end < now {
                let next = period.advance(end);
                if next <= end {
                    break;
                }
                end = next;
                changed = true;
            }
            self.end_subscribe_time = Some(end);
        }
        changed
    }

    /// Returns false when the kind does not allow consumption.
    pub fn record_consumed(&mut self, now: DateTime<Utc>) -> bool {
        if !self.sku_kind.rules().consumable {
            return false;
        }
        self.consume_time = Some(now);
        true
    }

    pub fn record_unsubscribed(&mut self, now: DateTime<Utc>) -> bool {
        if !self.sku_kind.rules().tracks_window || self.unsubscribe_time.is_some() {
            return false;
        }
        self.unsubscribe_time = Some(now);
        true
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match (self.sku_kind.rules().tracks_window, self.end_subscribe_time) {
            (true, Some(end)) => end < now,
            _ => false,
        }
    }
}

/// key: billing-catalog-entry -> what the application sells
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct CatalogEntry {
    pub kind: SkuKind,
    pub period: Option<BillingPeriod>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProductCatalog {
    entries: HashMap<String, CatalogEntry>,
}

impl ProductCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_product(
        mut self,
        product_id: impl Into<String>,
        kind: SkuKind,
        period: Option<BillingPeriod>,
    ) -> Self {
        self.insert(product_id, kind, period);
        self
    }

    pub fn insert(
        &mut self,
        product_id: impl Into<String>,
        kind: SkuKind,
        period: Option<BillingPeriod>,
    ) {
        self.entries
            .insert(product_id.into(), CatalogEntry { kind, period });
    }

    pub fn get(&self, product_id: &str) -> Option<&CatalogEntry> {
        self.entries.get(product_id)
    }

    pub fn contains(&self, product_id: &str) -> bool {
        self.entries.contains_key(product_id)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Closest catalog id by Jaro-Winkler similarity, if any is reasonably close.
    pub fn closest(&self, product_id: &str) -> Option<&str> {
        self.entries
            .keys()
            .map(|candidate| (candidate, strsim::jaro_winkler(candidate, product_id)))
            .filter(|(_, score)| *score >= 0.8)
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(candidate, _)| candidate.as_str())
    }
}

/// key: billing-catalog-offer -> launchable backend offer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CatalogOffer {
    pub product_id: String,
    pub kind: SkuKind,
    pub offer_token: String,
    #[serde(default)]
    pub details: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, 12, 0, 0).single().unwrap()
    }

    #[test]
    fn subscription_acknowledge_opens_window() {
        let mut product = Product::new("premium", SkuKind::Subscription);
        product.record_acknowledged("tok-1", at(1), Some(BillingPeriod::Weekly));

        assert_eq!(product.purchase_token.as_deref(), Some("tok-1"));
        assert_eq!(product.subscribe_time, Some(at(1)));
        assert_eq!(product.end_subscribe_time, Some(at(8)));
        assert!(product.consume_time.is_none());
        assert!(!product.is_expired(at(7)));
        assert!(product.is_expired(at(9)));
    }

    #[test]
    fn consumable_never_tracks_window() {
        let mut product = Product::new("coins", SkuKind::Consumable);
        product.record_acknowledged("tok-1", at(1), Some(BillingPeriod::Monthly));
        assert!(product.end_subscribe_time.is_none());
        assert!(product.record_consumed(at(2)));
        assert_eq!(product.consume_time, Some(at(2)));

        product.record_acknowledged("tok-2", at(3), None);
        assert!(product.consume_time.is_none());
    }

    #[test]
    fn subscription_cannot_be_consumed() {
        let mut product = Product::new("premium", SkuKind::Subscription);
        assert!(!product.record_consumed(at(2)));
        assert!(product.consume_time.is_none());
    }

    #[test]
    fn redelivery_rolls_elapsed_window_forward() {
        let mut product = Product::new("premium", SkuKind::Subscription);
        product.record_acknowledged("tok-1", at(1), Some(BillingPeriod::Weekly));

        assert!(product.record_redelivered("tok-1", at(16), Some(BillingPeriod::Weekly)));
        assert_eq!(product.end_subscribe_time, Some(at(22)));
        assert_eq!(product.subscribe_time, Some(at(1)));
        assert!(!product.record_redelivered("tok-1", at(17), Some(BillingPeriod::Weekly)));
    }

    #[test]
    fn redelivery_clears_unsubscribe_mark() {
        let mut product = Product::new("premium", SkuKind::Subscription);
        product.record_acknowledged("tok-1", at(1), Some(BillingPeriod::Monthly));
        assert!(product.record_unsubscribed(at(3)));

        assert!(product.record_redelivered("tok-1", at(4), Some(BillingPeriod::Monthly)));
        assert!(product.unsubscribe_time.is_none());
        assert_eq!(product.subscribe_time, Some(at(1)));
        assert!(!product.record_redelivered("tok-1", at(5), Some(BillingPeriod::Monthly)));
    }

    #[test]
    fn parses_kinds_and_periods() {
        assert_eq!("inapp".parse::<SkuKind>(), Ok(SkuKind::Consumable));
        assert_eq!("subscription".parse::<SkuKind>(), Ok(SkuKind::Subscription));
        assert!("lifetime".parse::<SkuKind>().is_err());
        assert_eq!("yearly".parse::<BillingPeriod>(), Ok(BillingPeriod::Annual));
        assert!("fortnightly".parse::<BillingPeriod>().is_err());
    }

    #[test]
    fn catalog_suggests_close_ids() {
        let catalog = ProductCatalog::new()
            .with_product("premium_monthly", SkuKind::Subscription, Some(BillingPeriod::Monthly))
            .with_product("coins_100", SkuKind::Consumable, None);
        assert_eq!(catalog.closest("premium_montly"), Some("premium_monthly"));
        assert_eq!(catalog.closest("zzz"), None);
    }
}
