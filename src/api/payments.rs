// src/api/payments.rs

use std::collections::HashMap;

use actix_multipart::Multipart;
use actix_web::{get, post, web, HttpRequest, HttpResponse};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use utoipa::ToSchema;

use crate::api::audit;
use crate::api::auth::{issue_token, AuthUser};
use crate::checkout::NewOrder;
use crate::error::{AppError, AppResult};
use crate::evidence::MAX_EVIDENCE_BYTES;
use crate::intake::{self, ChannelSpec, Upload};
use crate::models::{Channel, PaymentStatus};
use crate::review::ReviewOutcome;
use crate::AppState;

const MAX_TEXT_FIELD: usize = 64 * 1024;
const MAX_TEXT_TOTAL: usize = 256 * 1024;
const MAX_PARTS: usize = 32;

/// Multipart registration form. Only the reference field of the chosen
/// channel is required; receipts go in `<channel>_receipt`.
#[derive(ToSchema)]
pub struct RegistrationForm {
    pub username: String,
    pub email: String,
    pub password: String,
    pub country: String,
    pub phone: String,
    pub bank_reference: Option<String>,
    pub wallet_reference: Option<String>,
    pub crypto_txhash: Option<String>,
    pub order_id: Option<String>,
    pub firstname: Option<String>,
    pub middlename: Option<String>,
    pub lastname: Option<String>,
    pub fullname: Option<String>,
    pub sponsor_id: Option<String>,
    pub package: Option<String>,
    /// Ignored for the provider channel, which is charged the plan price.
    pub package_amount: Option<String>,
    pub package_currency: Option<String>,
    #[schema(value_type = Option<String>, format = Binary)]
    pub bank_receipt: Option<Vec<u8>>,
    #[schema(value_type = Option<String>, format = Binary)]
    pub wallet_receipt: Option<Vec<u8>>,
    #[schema(value_type = Option<String>, format = Binary)]
    pub crypto_receipt: Option<Vec<u8>>,
    /// Accepted in place of the channel's own receipt field.
    #[schema(value_type = Option<String>, format = Binary)]
    pub receipt: Option<Vec<u8>>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationResponse {
    pub success: bool,
    pub message: String,
    pub transaction_id: String,
    pub payment_id: i32,
    pub user_id: i32,
    pub redirect: String,
    pub token: String,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StatusCheckResponse {
    pub success: bool,
    pub previous_status: PaymentStatus,
    pub current_status: PaymentStatus,
    pub status_changed: bool,
    pub message: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ReviewResponse {
    pub success: bool,
    pub message: String,
}

/// Checkout page request for a provider order. The amount may be a string or
/// a number and is only compared with the plan price.
#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct CreateOrderRequest {
    #[serde(alias = "package")]
    pub plan: Option<String>,
    #[schema(value_type = Option<String>)]
    pub amount: Option<Value>,
    pub currency: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CreateOrderResponse {
    pub success: bool,
    pub id: String,
    pub status: String,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct CaptureOrderRequest {
    #[serde(alias = "package")]
    pub plan: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CaptureOrderResponse {
    pub success: bool,
    pub order_id: String,
    pub capture_id: Option<String>,
    pub amount: Option<String>,
    pub currency: Option<String>,
    pub status: PaymentStatus,
    pub provider_status: String,
    pub message: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CryptoInfo {
    pub network: String,
    pub token: String,
    pub address: String,
}

fn malformed(e: impl std::fmt::Display) -> AppError {
    AppError::Validation(format!("Malformed form data: {e}"))
}

/// Buffers the multipart body within fixed bounds: at most `MAX_PARTS`
/// parts, one receipt under a field `spec` accepts, and `MAX_TEXT_TOTAL`
/// bytes of text. Parts are refused as soon as a bound is crossed.
async fn read_form(
    mut payload: Multipart,
    spec: &ChannelSpec,
) -> AppResult<(HashMap<String, String>, Vec<Upload>)> {
    let mut fields = HashMap::new();
    let mut uploads = Vec::new();
    let mut parts = 0;
    let mut text_total = 0;

    while let Some(item) = payload.next().await {
        let mut field = item.map_err(malformed)?;
        parts += 1;
        if parts > MAX_PARTS {
            return Err(AppError::Validation("Too many form fields.".into()));
        }

        let cd = field.content_disposition();
        let name = cd.get_name().unwrap_or_default().to_string();
        // Browsers send an unnamed empty part for an unused file input.
        let filename = cd
            .get_filename()
            .filter(|f| !f.is_empty())
            .map(str::to_string);

        if filename.is_some() {
            if !spec.accepts_evidence_field(&name) {
                return Err(AppError::Validation(format!("Unexpected file field '{name}'.")));
            }
            if !uploads.is_empty() {
                return Err(AppError::Validation("Only one receipt may be uploaded.".into()));
            }
        }

        let mut data = Vec::new();
        while let Some(chunk) = field.next().await {
            let chunk = chunk.map_err(malformed)?;
            data.extend_from_slice(&chunk);
            if filename.is_some() {
                if data.len() > MAX_EVIDENCE_BYTES {
                    return Err(AppError::Validation(
                        "File too large. Maximum size is 10MB.".into(),
                    ));
                }
            } else if data.len() >= MAX_TEXT_FIELD {
                return Err(AppError::Validation(format!("Field '{name}' is too long.")));
            } else if text_total + data.len() > MAX_TEXT_TOTAL {
                return Err(AppError::Validation("Form is too large.".into()));
            }
        }

        match filename {
            Some(filename) => uploads.push(Upload {
                field: name,
                filename,
                bytes: data,
            }),
            None => {
                text_total += data.len();
                let value = String::from_utf8(data)
                    .map_err(|_| AppError::Validation(format!("Field '{name}' is not valid text.")))?;
                fields.insert(name, value);
            }
        }
    }

    Ok((fields, uploads))
}

#[utoipa::path(
    post,
    path = "/payments/{channel}",
    tag = "payments",
    params(("channel" = String, Path, description = "bank | wallet | crypto | provider")),
    request_body(content = RegistrationForm, content_type = "multipart/form-data"),
    responses(
        (status = 200, description = "Account and pending payment created", body = RegistrationResponse),
        (status = 400, description = "Validation failure"),
        (status = 409, description = "Duplicate identity or reference"),
        (status = 500, description = "Storage failure")
    )
)]
#[post("/payments/{channel}")]
pub async fn submit_payment(
    req: HttpRequest,
    path: web::Path<String>,
    payload: Multipart,
    state: web::Data<AppState>,
) -> AppResult<HttpResponse> {
    let channel = Channel::from_path_segment(&path).ok_or(AppError::NotFound("payment channel"))?;

    let (fields, uploads) = read_form(payload, ChannelSpec::for_channel(channel)).await?;
    let submission = intake::validate(channel, &fields, uploads, &state.config.default_plan)?;
    let registered = state
        .registrar()
        .register(submission, audit::capture(&req))
        .await?;

    let token = issue_token(
        &state.config.jwt_secret,
        registered.principal.id,
        registered.principal.role,
        state.config.jwt_ttl_days,
    )
    .map_err(|e| {
        log::error!("jwt encode error: {e}");
        AppError::Storage("token issuance failed".into())
    })?;

    Ok(HttpResponse::Ok().json(RegistrationResponse {
        success: true,
        message: "Account created! Your premium status will be activated once we verify your payment."
            .to_string(),
        transaction_id: registered.payment.transaction_id,
        payment_id: registered.payment.id,
        user_id: registered.principal.id,
        redirect: "/chat".to_string(),
        token,
    }))
}

fn quoted_amount(value: Option<Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[utoipa::path(
    post,
    path = "/payments/provider/orders",
    tag = "payments",
    request_body = CreateOrderRequest,
    responses(
        (status = 200, description = "Provider order opened for the plan price", body = CreateOrderResponse),
        (status = 400, description = "Unknown plan or amount that differs from the plan price"),
        (status = 502, description = "Provider error"),
        (status = 504, description = "Provider timeout")
    )
)]
#[post("/payments/provider/orders")]
pub async fn create_order(
    payload: Option<web::Json<CreateOrderRequest>>,
    state: web::Data<AppState>,
) -> AppResult<HttpResponse> {
    let payload = payload.map(web::Json::into_inner).unwrap_or_default();
    let order = state
        .checkout()
        .create_order(NewOrder {
            plan: payload.plan,
            amount: quoted_amount(payload.amount),
            currency: payload.currency,
        })
        .await?;

    Ok(HttpResponse::Ok().json(CreateOrderResponse {
        success: true,
        id: order.id,
        status: order.status,
    }))
}

#[utoipa::path(
    post,
    path = "/payments/provider/orders/{order_id}/capture",
    tag = "payments",
    params(("order_id" = String, Path, description = "Provider order id")),
    request_body = CaptureOrderRequest,
    responses(
        (status = 200, description = "Captured, or still pending with the provider", body = CaptureOrderResponse),
        (status = 400, description = "Malformed order id, declined payment or amount mismatch"),
        (status = 502, description = "Provider error"),
        (status = 504, description = "Provider timeout")
    )
)]
#[post("/payments/provider/orders/{order_id}/capture")]
pub async fn capture_order(
    path: web::Path<String>,
    payload: Option<web::Json<CaptureOrderRequest>>,
    state: web::Data<AppState>,
) -> AppResult<HttpResponse> {
    let payload = payload.map(web::Json::into_inner).unwrap_or_default();
    let captured = state
        .checkout()
        .capture(&path, payload.plan.as_deref())
        .await?;

    Ok(HttpResponse::Ok().json(CaptureOrderResponse {
        success: captured.status == PaymentStatus::Completed,
        order_id: captured.order.id,
        capture_id: captured.order.capture_id,
        amount: captured.order.amount,
        currency: captured.order.currency,
        status: captured.status,
        provider_status: captured.order.status,
        message: captured.message,
    }))
}

#[utoipa::path(
    get,
    path = "/payments/crypto/info",
    tag = "payments",
    responses(
        (status = 200, description = "Deposit details for crypto payments", body = CryptoInfo),
        (status = 404, description = "No deposit address configured")
    )
)]
#[get("/payments/crypto/info")]
pub async fn crypto_info(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let address = state
        .config
        .crypto_address
        .clone()
        .filter(|a| !a.is_empty())
        .ok_or(AppError::NotFound("crypto deposit address"))?;
    Ok(HttpResponse::Ok().json(CryptoInfo {
        network: state.config.crypto_network.clone(),
        token: state.config.crypto_token.clone(),
        address,
    }))
}

#[utoipa::path(
    post,
    path = "/payments/{id}/check-status",
    tag = "payments",
    params(("id" = i32, Path, description = "Payment id")),
    responses(
        (status = 200, body = StatusCheckResponse),
        (status = 401), (status = 403), (status = 404),
        (status = 502, description = "Provider error"),
        (status = 504, description = "Provider timeout")
    ),
    security(("bearer" = []))
)]
#[post("/payments/{id}/check-status")]
pub async fn check_status(
    path: web::Path<i32>,
    user: AuthUser,
    state: web::Data<AppState>,
) -> AppResult<HttpResponse> {
    let payment = state
        .review_queue()
        .owned_payment(path.into_inner(), user.id)
        .await?;
    let check = state.reconciler().check(&payment).await?;

    Ok(HttpResponse::Ok().json(StatusCheckResponse {
        success: true,
        previous_status: check.previous_status,
        current_status: check.current_status,
        status_changed: check.changed,
        message: check.message,
    }))
}

#[utoipa::path(
    post,
    path = "/payments/{id}/request-review",
    tag = "payments",
    params(("id" = i32, Path, description = "Payment id")),
    responses((status = 200, body = ReviewResponse), (status = 401), (status = 403), (status = 404)),
    security(("bearer" = []))
)]
#[post("/payments/{id}/request-review")]
pub async fn request_review(
    path: web::Path<i32>,
    user: AuthUser,
    state: web::Data<AppState>,
) -> AppResult<HttpResponse> {
    let outcome = state
        .review_queue()
        .request_review(path.into_inner(), user.id)
        .await?;

    Ok(HttpResponse::Ok().json(ReviewResponse {
        success: !matches!(outcome, ReviewOutcome::Closed(_)),
        message: outcome.message(),
    }))
}

#[utoipa::path(
    get,
    path = "/payments/{id}/details",
    tag = "payments",
    params(("id" = i32, Path, description = "Payment id")),
    responses((status = 200, description = "Payment with review queue position"), (status = 401), (status = 403), (status = 404)),
    security(("bearer" = []))
)]
#[get("/payments/{id}/details")]
pub async fn payment_details(
    path: web::Path<i32>,
    user: AuthUser,
    state: web::Data<AppState>,
) -> AppResult<HttpResponse> {
    let queue = state.review_queue();
    let payment = queue.owned_payment(path.into_inner(), user.id).await?;
    let stats = queue.queue_stats(payment.id).await?;

    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "payment": payment,
        "pendingReviewsCount": stats.pending_reviews,
        "queuePosition": stats.position,
    })))
}
