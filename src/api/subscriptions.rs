// src/api/subscriptions.rs

use actix_web::{post, web, HttpRequest, HttpResponse};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use utoipa::ToSchema;

use crate::activation::ActivationRequest;
use crate::api::audit;
use crate::api::auth::AuthUser;
use crate::error::{AppError, AppResult};
use crate::AppState;

pub const SIGNATURE_HEADER: &str = "X-Signature";

/// Activation event from the billing provider checkout. Accepts camelCase
/// and the snake_case names the checkout page posts.
#[derive(Debug, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ActivateRequest {
    #[serde(alias = "subscription_id")]
    pub external_subscription_id: Option<String>,

    #[serde(alias = "planName", alias = "plan_name")]
    pub plan: Option<String>,

    #[serde(alias = "user_id", alias = "userId")]
    pub principal_id: Option<i32>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ActivateResponse {
    pub success: bool,
    pub message: String,
    pub subscription_id: i32,
    pub plan: String,
    pub expires_at: DateTime<Utc>,
}

/// Constant-time check of a hex signature over `body`.
pub fn verify_signature(secret: &str, body: &[u8], signature_hex: &str) -> bool {
    let Ok(signature) = hex::decode(signature_hex.trim()) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&signature).is_ok()
}

#[utoipa::path(
    post,
    path = "/subscriptions/activate",
    tag = "subscriptions",
    request_body = ActivateRequest,
    responses(
        (status = 200, body = ActivateResponse),
        (status = 400, description = "Missing fields, malformed body or unknown plan"),
        (status = 401, description = "Bad signature or no caller"),
        (status = 403, description = "Caller activating for another principal"),
        (status = 404, description = "Unknown principal"),
        (status = 409, description = "Subscription already activated for another principal")
    )
)]
#[post("/subscriptions/activate")]
pub async fn activate(
    req: HttpRequest,
    body: web::Bytes,
    caller: Option<AuthUser>,
    state: web::Data<AppState>,
) -> AppResult<HttpResponse> {
    let signature = req
        .headers()
        .get(SIGNATURE_HEADER)
        .and_then(|h| h.to_str().ok());
    let signed = match signature {
        Some(signature) => {
            let Some(secret) = state.config.activation_secret.as_deref() else {
                log::warn!("activation rejected: signed call but no activation secret configured");
                return Err(AppError::Unauthenticated);
            };
            if !verify_signature(secret, &body, signature) {
                log::warn!("activation rejected: bad signature");
                return Err(AppError::Unauthenticated);
            }
            true
        }
        None => false,
    };

    let payload: ActivateRequest = serde_json::from_slice(&body)
        .map_err(|e| AppError::Validation(format!("Invalid JSON body: {e}")))?;

    // Unsigned calls act for the caller only.
    let principal_id = if signed {
        payload.principal_id.or(caller.map(|c| c.id))
    } else {
        let caller = caller.ok_or(AppError::Unauthenticated)?;
        if let Some(requested) = payload.principal_id.filter(|id| *id != caller.id) {
            log::warn!(
                "principal {} tried to activate a subscription for principal {requested}",
                caller.id
            );
            return Err(AppError::Authorization);
        }
        Some(caller.id)
    };

    let external_subscription_id = payload
        .external_subscription_id
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    let plan_name = payload
        .plan
        .map(|p| p.trim().to_lowercase())
        .filter(|p| !p.is_empty());
    let (Some(external_subscription_id), Some(plan_name), Some(principal_id)) =
        (external_subscription_id, plan_name, principal_id)
    else {
        return Err(AppError::Validation("Missing required fields".into()));
    };

    let outcome = state
        .activator()
        .activate(
            ActivationRequest {
                external_subscription_id,
                plan_name,
                principal_id,
                confirm_with_provider: !signed,
            },
            audit::capture(&req),
        )
        .await?;

    let message = if outcome.replayed {
        "Subscription already activated"
    } else {
        "Subscription activated"
    };
    Ok(HttpResponse::Ok().json(ActivateResponse {
        success: true,
        message: message.to_string(),
        subscription_id: outcome.subscription_id,
        plan: outcome.plan,
        expires_at: outcome.expires_at,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    #[test]
    fn signature_round_trip() {
        let body = br#"{"subscription_id":"I-1","plan":"pro","user_id":42}"#;
        let sig = sign("secret", body);
        assert!(verify_signature("secret", body, &sig));
        assert!(verify_signature("secret", body, &sig.to_uppercase()));
        assert!(!verify_signature("other", body, &sig));
        assert!(!verify_signature("secret", body, "not-hex"));
    }

    #[test]
    fn request_accepts_both_naming_styles() {
        let snake: ActivateRequest =
            serde_json::from_str(r#"{"subscription_id":"I-1","plan":"pro","user_id":42}"#).unwrap();
        let camel: ActivateRequest = serde_json::from_str(
            r#"{"externalSubscriptionId":"I-1","planName":"pro","principalId":42}"#,
        )
        .unwrap();
        for req in [snake, camel] {
            assert_eq!(req.external_subscription_id.as_deref(), Some("I-1"));
            assert_eq!(req.plan.as_deref(), Some("pro"));
            assert_eq!(req.principal_id, Some(42));
        }
    }
}
