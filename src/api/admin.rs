// src/api/admin.rs

use actix_web::{get, post, web, HttpResponse};
use serde::Deserialize;
use serde_json::json;
use utoipa::ToSchema;

use crate::api::auth::AuthUser;
use crate::error::AppResult;
use crate::moderation::ModerationOutcome;
use crate::AppState;

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct RejectRequest {
    pub reason: Option<String>,
}

fn outcome_response(payment_id: i32, outcome: ModerationOutcome) -> HttpResponse {
    match outcome {
        ModerationOutcome::Applied(status) => HttpResponse::Ok().json(json!({
            "success": true,
            "paymentId": payment_id,
            "status": status,
            "message": format!("Payment marked {status}."),
        })),
        ModerationOutcome::AlreadySettled(status) => HttpResponse::Ok().json(json!({
            "success": false,
            "paymentId": payment_id,
            "status": status,
            "message": format!("Payment is already {status}."),
        })),
    }
}

#[utoipa::path(
    get,
    path = "/admin/review-queue",
    tag = "admin",
    responses((status = 200, description = "Pending payments awaiting review, oldest request first"), (status = 401), (status = 403)),
    security(("bearer" = []))
)]
#[get("/admin/review-queue")]
pub async fn review_queue(user: AuthUser, state: web::Data<AppState>) -> AppResult<HttpResponse> {
    user.require_admin()?;
    let queue = state.moderation().review_queue().await?;
    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "count": queue.len(),
        "payments": queue,
    })))
}

#[utoipa::path(
    post,
    path = "/admin/payments/{id}/approve",
    tag = "admin",
    params(("id" = i32, Path, description = "Payment id")),
    responses((status = 200), (status = 401), (status = 403), (status = 404)),
    security(("bearer" = []))
)]
#[post("/admin/payments/{id}/approve")]
pub async fn approve_payment(
    path: web::Path<i32>,
    user: AuthUser,
    state: web::Data<AppState>,
) -> AppResult<HttpResponse> {
    user.require_admin()?;
    let payment_id = path.into_inner();
    let outcome = state.moderation().approve(payment_id, user.id).await?;
    Ok(outcome_response(payment_id, outcome))
}

#[utoipa::path(
    post,
    path = "/admin/payments/{id}/reject",
    tag = "admin",
    params(("id" = i32, Path, description = "Payment id")),
    request_body = RejectRequest,
    responses((status = 200), (status = 401), (status = 403), (status = 404)),
    security(("bearer" = []))
)]
#[post("/admin/payments/{id}/reject")]
pub async fn reject_payment(
    path: web::Path<i32>,
    user: AuthUser,
    body: Option<web::Json<RejectRequest>>,
    state: web::Data<AppState>,
) -> AppResult<HttpResponse> {
    user.require_admin()?;
    let payment_id = path.into_inner();
    let reason = body.and_then(|b| b.into_inner().reason);
    let outcome = state
        .moderation()
        .reject(payment_id, user.id, reason)
        .await?;
    Ok(outcome_response(payment_id, outcome))
}
