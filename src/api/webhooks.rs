// src/api/webhooks.rs

use actix_web::{post, web, HttpRequest, HttpResponse};
use serde_json::{json, Value};

use crate::error::{AppError, AppResult};
use crate::provider::{within, WebhookHeaders};
use crate::provider_events::{EventOutcome, ProviderEvent};
use crate::AppState;

fn header(req: &HttpRequest, name: &str) -> Option<String> {
    req.headers()
        .get(name)
        .and_then(|h| h.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Transmission headers, all of which the provider sends on every delivery.
fn transmission_headers(req: &HttpRequest) -> Option<WebhookHeaders> {
    Some(WebhookHeaders {
        transmission_id: header(req, "PAYPAL-TRANSMISSION-ID")?,
        transmission_time: header(req, "PAYPAL-TRANSMISSION-TIME")?,
        transmission_sig: header(req, "PAYPAL-TRANSMISSION-SIG")?,
        cert_id: header(req, "PAYPAL-CERT-ID")?,
        auth_algo: header(req, "PAYPAL-AUTH-ALGO")?,
    })
}

#[utoipa::path(
    post,
    path = "/webhooks/provider",
    tag = "webhooks",
    request_body(content = String, content_type = "application/json", description = "Provider event"),
    responses(
        (status = 200, description = "Handled, duplicate or ignored"),
        (status = 400, description = "Body is not a provider event"),
        (status = 401, description = "Signature not verified"),
        (status = 500, description = "Handler failed; the provider will redeliver"),
        (status = 502, description = "Provider error"),
        (status = 504, description = "Provider timeout")
    )
)]
#[post("/webhooks/provider")]
pub async fn provider_webhook(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AppState>,
) -> AppResult<HttpResponse> {
    let raw: Value = serde_json::from_slice(&body)
        .map_err(|e| AppError::Validation(format!("Invalid JSON body: {e}")))?;
    let event: ProviderEvent = serde_json::from_value(raw.clone())
        .map_err(|e| AppError::Validation(format!("Not a provider event: {e}")))?;
    if event.id.trim().is_empty() {
        return Err(AppError::Validation("Event id is required.".into()));
    }

    let Some(webhook_id) = state.config.provider_webhook_id() else {
        log::warn!("provider event {} refused: no webhook id configured", event.id);
        return Err(AppError::Unauthenticated);
    };
    let Some(headers) = transmission_headers(&req) else {
        log::warn!("provider event {} refused: transmission headers missing", event.id);
        return Err(AppError::Unauthenticated);
    };
    let verified = within(
        state.config.provider_timeout(),
        state.provider.verify_webhook(webhook_id, &headers, &raw),
    )
    .await?;
    if !verified {
        log::warn!("provider event {} refused: signature not verified", event.id);
        return Err(AppError::Unauthenticated);
    }

    let body = match state.provider_events().process(&event).await? {
        EventOutcome::Applied => json!({ "ok": true }),
        EventOutcome::Duplicate => json!({ "ok": true, "duplicate": true }),
        EventOutcome::Ignored => json!({ "ok": true, "ignored": true }),
    };
    Ok(HttpResponse::Ok().json(body))
}
