use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sha2::Sha256;
use tracing::{debug, warn};
use url::Url;

use crate::config;
use crate::error::{EngineError, EngineResult};

use super::adapters::{BackendListener, BackendResult, BillingBackend, SessionOutcome};
use super::models::{CatalogOffer, Purchase, SkuKind};
use super::response::ResponseCode;

pub const SIGNATURE_HEADER: &str = "x-billing-signature";

trait WireResponse: DeserializeOwned {
    fn response_code(&self) -> i32;
}

#[derive(Debug, Deserialize)]
struct CodeResponse {
    response_code: i32,
}

#[derive(Debug, Deserialize)]
struct PurchasesResponse {
    response_code: i32,
    #[serde(default)]
    purchases: Vec<Purchase>,
}

#[derive(Debug, Deserialize)]
struct CatalogResponse {
    response_code: i32,
    #[serde(default)]
    offer: Option<CatalogOffer>,
}

impl WireResponse for CodeResponse {
    fn response_code(&self) -> i32 {
        self.response_code
    }
}

impl WireResponse for PurchasesResponse {
    fn response_code(&self) -> i32 {
        self.response_code
    }
}

impl WireResponse for CatalogResponse {
    fn response_code(&self) -> i32 {
        self.response_code
    }
}

/// key: billing-backend-http -> JSON purchasing service client
///
/// Every response body carries an integer `response_code`. Requests are signed
/// with HMAC-SHA256 over `METHOD\nPATH\nBODY` when a secret is configured.
pub struct HttpBillingBackend {
    client: Client,
    base: Url,
    secret: Option<String>,
    listener: Mutex<Option<BackendListener>>,
}

impl HttpBillingBackend {
    pub fn new(base_url: &str, secret: Option<String>, timeout: Duration) -> EngineResult<Self> {
        let base = Url::parse(base_url)?;
        if base.cannot_be_a_base() {
            return Err(EngineError::Config(format!(
                "billing backend url '{base_url}' cannot be used as a base"
            )));
        }
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base,
            secret,
            listener: Mutex::new(None),
        })
    }

    pub fn from_env() -> EngineResult<Self> {
        Self::new(
            config::BILLING_BACKEND_URL.as_str(),
            config::backend_secret_from_env()?,
            Duration::from_secs(*config::BILLING_BACKEND_TIMEOUT_SECS),
        )
    }

    fn endpoint(&self, segments: &[&str]) -> BackendResult<Url> {
        let mut url = self.base.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| ResponseCode::DeveloperError)?;
            path.pop_if_empty();
            path.extend(segments);
        }
        Ok(url)
    }

    fn current_listener(&self) -> Option<BackendListener> {
        self.listener.lock().ok().and_then(|guard| guard.clone())
    }

    fn replace_listener(&self, listener: Option<BackendListener>) {
        if let Ok(mut guard) = self.listener.lock() {
            *guard = listener;
        }
    }

    fn notify_lost(&self, code: ResponseCode) {
        if let Some(listener) = self.current_listener() {
            listener.session_lost(code);
        }
    }

    async fn call<T: WireResponse>(
        &self,
        method: Method,
        segments: &[&str],
        body: Option<Vec<u8>>,
    ) -> BackendResult<T> {
        let url = self.endpoint(segments)?;
        let payload = body.unwrap_or_default();
        let mut request = self
            .client
            .request(method.clone(), url.clone())
            .header(CONTENT_TYPE, "application/json");
        if let Some(secret) = self.secret.as_deref() {
            if let Some(signature) = sign_request(secret, method.as_str(), url.path(), &payload) {
                request = request.header(SIGNATURE_HEADER, signature);
            }
        }
        if !payload.is_empty() {
            request = request.body(payload);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(err) => return Err(self.transport_failure(&err)),
        };
        let status = response.status();
        let bytes = match response.bytes().await {
            Ok(bytes) => bytes,
            Err(err) => return Err(self.transport_failure(&err)),
        };

        let Ok(parsed) = serde_json::from_slice::<T>(&bytes) else {
            let code = code_for_status(status);
            warn!(%status, %code, path = url.path(), "unreadable response from billing backend");
            return Err(code);
        };
        let code = ResponseCode::from_code(parsed.response_code()).unwrap_or_else(|| {
            warn!(
                response_code = parsed.response_code(),
                "unknown response code from billing backend"
            );
            ResponseCode::Error
        });
        match code {
            ResponseCode::Ok => Ok(parsed),
            ResponseCode::ServiceDisconnected => {
                self.notify_lost(code);
                Err(code)
            }
            other => Err(other),
        }
    }

    fn transport_failure(&self, err: &reqwest::Error) -> ResponseCode {
        let code = if err.is_timeout() {
            ResponseCode::ServiceTimeout
        } else if err.is_connect() {
            ResponseCode::ServiceDisconnected
        } else {
            ResponseCode::ServiceUnavailable
        };
        debug!(?err, %code, "billing backend transport failure");
        if code == ResponseCode::ServiceDisconnected {
            self.notify_lost(code);
        }
        code
    }
}

#[async_trait]
impl BillingBackend for HttpBillingBackend {
    async fn start_session(&self, listener: BackendListener) -> SessionOutcome {
        self.replace_listener(None);
        match self.call::<CodeResponse>(Method::GET, &["session"], None).await {
            Ok(_) => {
                self.replace_listener(Some(listener));
                SessionOutcome::Ready
            }
            Err(code) => SessionOutcome::Lost(code),
        }
    }

    async fn end_session(&self) {
        self.replace_listener(None);
        if let Err(code) = self
            .call::<CodeResponse>(Method::DELETE, &["session"], None)
            .await
        {
            debug!(%code, "billing backend rejected session end");
        }
    }

    async fn query_purchases(&self) -> BackendResult<Vec<Purchase>> {
        self.call::<PurchasesResponse>(Method::GET, &["purchases"], None)
            .await
            .map(|response| response.purchases)
    }

    async fn acknowledge(&self, purchase_token: &str) -> BackendResult<()> {
        self.call::<CodeResponse>(
            Method::POST,
            &["purchases", purchase_token, "acknowledge"],
            None,
        )
        .await
        .map(|_| ())
    }

    async fn consume(&self, purchase_token: &str) -> BackendResult<()> {
        self.call::<CodeResponse>(
            Method::POST,
            &["purchases", purchase_token, "consume"],
            None,
        )
        .await
        .map(|_| ())
    }

    async fn query_catalog(
        &self,
        product_id: &str,
        kind: SkuKind,
    ) -> BackendResult<Option<CatalogOffer>> {
        self.call::<CatalogResponse>(
            Method::GET,
            &["catalog", kind.rules().backend_type, product_id],
            None,
        )
        .await
        .map(|response| response.offer)
    }

    async fn launch_purchase_ui(&self, offer: &CatalogOffer) -> ResponseCode {
        let body = match serde_json::to_vec(offer) {
            Ok(body) => body,
            Err(err) => {
                warn!(?err, "failed to encode checkout offer");
                return ResponseCode::DeveloperError;
            }
        };
        match self
            .call::<CodeResponse>(Method::POST, &["checkout"], Some(body))
            .await
        {
            Ok(_) => ResponseCode::Ok,
            Err(code) => code,
        }
    }
}

/// `sha256=<hex>` HMAC over method, path and body.
pub fn sign_request(secret: &str, method: &str, path: &str, body: &[u8]) -> Option<String> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(method.as_bytes());
    mac.update(b"\n");
    mac.update(path.as_bytes());
    mac.update(b"\n");
    mac.update(body);
    Some(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

fn code_for_status(status: StatusCode) -> ResponseCode {
    match status.as_u16() {
        200..=299 => ResponseCode::Error,
        404 => ResponseCode::ItemUnavailable,
        408 | 504 => ResponseCode::ServiceTimeout,
        400..=499 => ResponseCode::DeveloperError,
        _ => ResponseCode::ServiceUnavailable,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_unreadable_statuses() {
        assert_eq!(code_for_status(StatusCode::OK), ResponseCode::Error);
        assert_eq!(code_for_status(StatusCode::NOT_FOUND), ResponseCode::ItemUnavailable);
        assert_eq!(code_for_status(StatusCode::GATEWAY_TIMEOUT), ResponseCode::ServiceTimeout);
        assert_eq!(code_for_status(StatusCode::UNAUTHORIZED), ResponseCode::DeveloperError);
        assert_eq!(code_for_status(StatusCode::BAD_GATEWAY), ResponseCode::ServiceUnavailable);
    }

    #[test]
    fn signature_covers_method_path_and_body() {
        let a = sign_request("secret", "POST", "/checkout", b"{}").unwrap();
        let b = sign_request("secret", "POST", "/checkout", b"{ }").unwrap();
        let c = sign_request("secret", "GET", "/checkout", b"{}").unwrap();
        assert!(a.starts_with("sha256="));
        assert_eq!(a.len(), "sha256=".len() + 64);
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn endpoint_escapes_tokens() {
        let backend =
            HttpBillingBackend::new("http://billing.test/api/", None, Duration::from_secs(1))
                .unwrap();
        let url = backend
            .endpoint(&["purchases", "tok/1 2", "acknowledge"])
            .unwrap();
        assert_eq!(url.path(), "/api/purchases/tok%2F1%202/acknowledge");
    }

    #[test]
    fn rejects_non_base_urls() {
        assert!(HttpBillingBackend::new("mailto:billing@example.com", None, Duration::from_secs(1))
            .is_err());
    }
}
