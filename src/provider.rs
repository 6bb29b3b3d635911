// src/provider.rs
//
// Client for the recurring billing provider's REST API.
// Auth: OAuth2 client credentials, then Bearer token on every call.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Url;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("http error: {0}")]
    Http(reqwest::Error),

    #[error("provider api error status={status} body={body}")]
    Api { status: u16, body: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("invalid provider base url: {0}")]
    BaseUrl(String),

    #[error("provider request timed out")]
    Timeout,

    #[error("billing provider is not configured")]
    NotConfigured,
}

impl From<reqwest::Error> for ProviderError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_timeout() {
            Self::Timeout
        } else {
            Self::Http(value)
        }
    }
}

/// Runs a provider call under `limit`, folding the elapsed case into
/// `ProviderError::Timeout`.
pub async fn within<T, F>(limit: Duration, call: F) -> Result<T, ProviderError>
where
    F: Future<Output = Result<T, ProviderError>>,
{
    tokio::time::timeout(limit, call)
        .await
        .map_err(|_| ProviderError::Timeout)?
}

/// Decimal money string in minor units: "500", "500.0" and "500.00" are all
/// 50000. `None` for anything that is not a plain non-negative decimal or
/// carries non-zero digits past the cent.
pub fn minor_units(value: &str) -> Option<i64> {
    let value = value.trim();
    let (whole, frac) = value.split_once('.').unwrap_or((value, ""));
    if whole.is_empty() || !whole.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if !frac.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let (cents, rest) = frac.split_at(frac.len().min(2));
    if rest.bytes().any(|b| b != b'0') {
        return None;
    }
    let cents: i64 = format!("{cents:0<2}").parse().ok()?;
    whole.parse::<i64>().ok()?.checked_mul(100)?.checked_add(cents)
}

/// Order (or captured order) as reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderOrder {
    pub id: String,
    pub status: String,
    /// Captured amount when the order has a capture, else the first purchase unit's.
    pub amount: Option<String>,
    pub currency: Option<String>,
    pub capture_id: Option<String>,
}

/// Recurring billing subscription as reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderSubscription {
    pub id: String,
    pub status: String,
    pub plan_id: Option<String>,
}

/// Server-side order for a plan purchase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderRequest {
    pub reference_id: String,
    pub description: String,
    pub amount: String,
    pub currency: String,
}

/// Transmission headers the provider attaches to webhook deliveries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WebhookHeaders {
    pub transmission_id: String,
    pub transmission_time: String,
    pub transmission_sig: String,
    pub cert_id: String,
    pub auth_algo: String,
}

#[async_trait]
pub trait BillingProvider: Send + Sync {
    async fn order(&self, order_id: &str) -> Result<ProviderOrder, ProviderError>;

    async fn create_order(&self, request: &OrderRequest) -> Result<ProviderOrder, ProviderError>;

    async fn capture_order(&self, order_id: &str) -> Result<ProviderOrder, ProviderError>;

    async fn subscription(&self, subscription_id: &str)
        -> Result<ProviderSubscription, ProviderError>;

    /// Asks the provider whether `event` was signed for `webhook_id`.
    async fn verify_webhook(
        &self,
        webhook_id: &str,
        headers: &WebhookHeaders,
        event: &Value,
    ) -> Result<bool, ProviderError>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Clone, Deserialize)]
struct Money {
    currency_code: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct CaptureResponse {
    id: String,
    amount: Option<Money>,
}

#[derive(Debug, Default, Deserialize)]
struct PaymentsResponse {
    #[serde(default)]
    captures: Vec<CaptureResponse>,
}

#[derive(Debug, Deserialize)]
struct PurchaseUnitResponse {
    amount: Option<Money>,
    payments: Option<PaymentsResponse>,
}

#[derive(Debug, Deserialize)]
struct OrderResponse {
    id: String,
    status: String,
    #[serde(default)]
    purchase_units: Vec<PurchaseUnitResponse>,
}

impl From<OrderResponse> for ProviderOrder {
    fn from(order: OrderResponse) -> Self {
        let (unit_amount, capture) = match order.purchase_units.into_iter().next() {
            Some(unit) => (
                unit.amount,
                unit.payments.and_then(|p| p.captures.into_iter().next()),
            ),
            None => (None, None),
        };
        let money = capture
            .as_ref()
            .and_then(|c| c.amount.clone())
            .or(unit_amount);
        ProviderOrder {
            id: order.id,
            status: order.status,
            amount: money.as_ref().map(|m| m.value.clone()),
            currency: money.map(|m| m.currency_code),
            capture_id: capture.map(|c| c.id),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SubscriptionResponse {
    id: String,
    status: String,
    plan_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VerificationResponse {
    verification_status: String,
}

pub struct HttpBillingProvider {
    client: reqwest::Client,
    base_url: Url,
    client_id: String,
    client_secret: String,
}

impl HttpBillingProvider {
    pub fn new(
        base_url: &str,
        client_id: &str,
        client_secret: &str,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let base_url =
            Url::parse(base_url).map_err(|e| ProviderError::BaseUrl(format!("{base_url}: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(ProviderError::BaseUrl(base_url.to_string()));
        }
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url,
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
        })
    }

    /// Base url with `segments` appended, each one percent-encoded as a
    /// single path segment.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, ProviderError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ProviderError::BaseUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn access_token(&self) -> Result<String, ProviderError> {
        let resp = self
            .client
            .post(self.endpoint(&["v1", "oauth2", "token"])?)
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .header("Accept", "application/json")
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await?;

        read_json::<TokenResponse>(resp).await.map(|t| t.access_token)
    }

    async fn call<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, ProviderError> {
        let token = self.access_token().await?;
        let resp = request
            .bearer_auth(token)
            .header("Accept", "application/json")
            .send()
            .await?;
        read_json(resp).await
    }
}

async fn read_json<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, ProviderError> {
    let status = resp.status();
    let body = resp.text().await?;
    if !status.is_success() {
        return Err(ProviderError::Api {
            status: status.as_u16(),
            body,
        });
    }
    serde_json::from_str(&body)
        .map_err(|e| ProviderError::InvalidResponse(format!("{e}; body={body}")))
}

#[async_trait]
impl BillingProvider for HttpBillingProvider {
    async fn order(&self, order_id: &str) -> Result<ProviderOrder, ProviderError> {
        let url = self.endpoint(&["v2", "checkout", "orders", order_id])?;
        self.call::<OrderResponse>(self.client.get(url))
            .await
            .map(ProviderOrder::from)
    }

    async fn create_order(&self, request: &OrderRequest) -> Result<ProviderOrder, ProviderError> {
        let url = self.endpoint(&["v2", "checkout", "orders"])?;
        let body = json!({
            "intent": "CAPTURE",
            "purchase_units": [{
                "reference_id": request.reference_id,
                "description": request.description,
                "amount": {
                    "currency_code": request.currency,
                    "value": request.amount,
                },
            }],
        });
        let created: OrderResponse = self
            .call(
                self.client
                    .post(url)
                    .header("PayPal-Request-Id", uuid::Uuid::new_v4().to_string())
                    .json(&body),
            )
            .await?;

        let mut order = ProviderOrder::from(created);
        if order.amount.is_none() {
            order.amount = Some(request.amount.clone());
            order.currency = Some(request.currency.clone());
        }
        Ok(order)
    }

    async fn capture_order(&self, order_id: &str) -> Result<ProviderOrder, ProviderError> {
        let url = self.endpoint(&["v2", "checkout", "orders", order_id, "capture"])?;
        self.call::<OrderResponse>(self.client.post(url).json(&json!({})))
            .await
            .map(ProviderOrder::from)
    }

    async fn subscription(
        &self,
        subscription_id: &str,
    ) -> Result<ProviderSubscription, ProviderError> {
        let url = self.endpoint(&["v1", "billing", "subscriptions", subscription_id])?;
        let sub: SubscriptionResponse = self.call(self.client.get(url)).await?;
        Ok(ProviderSubscription {
            id: sub.id,
            status: sub.status,
            plan_id: sub.plan_id,
        })
    }

    async fn verify_webhook(
        &self,
        webhook_id: &str,
        headers: &WebhookHeaders,
        event: &Value,
    ) -> Result<bool, ProviderError> {
        let url = self.endpoint(&["v1", "notifications", "verify-webhook-signature"])?;
        let body = json!({
            "transmission_id": headers.transmission_id,
            "transmission_time": headers.transmission_time,
            "transmission_sig": headers.transmission_sig,
            "cert_id": headers.cert_id,
            "auth_algo": headers.auth_algo,
            "webhook_id": webhook_id,
            "webhook_event": event,
        });
        let verdict: VerificationResponse = self.call(self.client.post(url).json(&body)).await?;
        Ok(verdict.verification_status == "SUCCESS")
    }
}

/// Stand-in used when no provider credentials are configured.
pub struct UnconfiguredProvider;

#[async_trait]
impl BillingProvider for UnconfiguredProvider {
    async fn order(&self, _order_id: &str) -> Result<ProviderOrder, ProviderError> {
        Err(ProviderError::NotConfigured)
    }

    async fn create_order(&self, _request: &OrderRequest) -> Result<ProviderOrder, ProviderError> {
        Err(ProviderError::NotConfigured)
    }

    async fn capture_order(&self, _order_id: &str) -> Result<ProviderOrder, ProviderError> {
        Err(ProviderError::NotConfigured)
    }

    async fn subscription(
        &self,
        _subscription_id: &str,
    ) -> Result<ProviderSubscription, ProviderError> {
        Err(ProviderError::NotConfigured)
    }

    async fn verify_webhook(
        &self,
        _webhook_id: &str,
        _headers: &WebhookHeaders,
        _event: &Value,
    ) -> Result<bool, ProviderError> {
        Err(ProviderError::NotConfigured)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minor_units_normalizes_decimal_strings() {
        assert_eq!(minor_units("500"), Some(50_000));
        assert_eq!(minor_units("500.0"), Some(50_000));
        assert_eq!(minor_units(" 500.00 "), Some(50_000));
        assert_eq!(minor_units("1999.5"), Some(199_950));
        assert_eq!(minor_units("0.010"), Some(1));
        assert_eq!(minor_units("0.015"), None);
        assert_eq!(minor_units("-5"), None);
        assert_eq!(minor_units("5e2"), None);
        assert_eq!(minor_units(".50"), None);
        assert_eq!(minor_units(""), None);
    }

    #[test]
    fn endpoint_keeps_each_id_inside_one_segment() {
        let provider = HttpBillingProvider::new(
            "https://api.example.test/",
            "id",
            "secret",
            Duration::from_secs(1),
        )
        .unwrap();
        let url = provider
            .endpoint(&["v2", "checkout", "orders", "x/../ORDER-1?dup=1"])
            .unwrap();
        assert_eq!(url.path(), "/v2/checkout/orders/x%2F..%2FORDER-1%3Fdup=1");
        assert!(url.query().is_none());

        let prefixed = HttpBillingProvider::new(
            "https://api.example.test/sandbox",
            "id",
            "secret",
            Duration::from_secs(1),
        )
        .unwrap();
        let url = prefixed.endpoint(&["v1", "oauth2", "token"]).unwrap();
        assert_eq!(url.as_str(), "https://api.example.test/sandbox/v1/oauth2/token");
    }

    #[test]
    fn captured_amount_wins_over_purchase_unit_amount() {
        let order: OrderResponse = serde_json::from_value(json!({
            "id": "ORDER-1",
            "status": "COMPLETED",
            "purchase_units": [{
                "amount": { "currency_code": "PHP", "value": "500.00" },
                "payments": { "captures": [{
                    "id": "CAP-1",
                    "amount": { "currency_code": "PHP", "value": "499.00" }
                }]}
            }]
        }))
        .unwrap();
        let order = ProviderOrder::from(order);
        assert_eq!(order.amount.as_deref(), Some("499.00"));
        assert_eq!(order.capture_id.as_deref(), Some("CAP-1"));

        let bare: OrderResponse =
            serde_json::from_value(json!({ "id": "ORDER-2", "status": "CREATED" })).unwrap();
        let bare = ProviderOrder::from(bare);
        assert!(bare.amount.is_none());
        assert!(bare.currency.is_none());
    }
}
