// src/api/evidence.rs

use actix_web::http::header;
use actix_web::{get, web, HttpResponse};

use crate::api::auth::AuthUser;
use crate::error::AppResult;
use crate::AppState;

#[utoipa::path(
    get,
    path = "/evidence/{filename}",
    tag = "payments",
    params(("filename" = String, Path, description = "Stored receipt name")),
    responses(
        (status = 200, description = "Receipt bytes"),
        (status = 401), (status = 403), (status = 404)
    ),
    security(("bearer" = []))
)]
#[get("/evidence/{filename}")]
pub async fn get_evidence(
    path: web::Path<String>,
    user: AuthUser,
    state: web::Data<AppState>,
) -> AppResult<HttpResponse> {
    let file = state.gatekeeper().read(&path, user.id, user.role).await?;

    Ok(HttpResponse::Ok()
        .content_type(file.content_type)
        .insert_header((
            header::CONTENT_DISPOSITION,
            format!("inline; filename=\"{}\"", file.filename),
        ))
        .insert_header((header::CACHE_CONTROL, "private, no-store"))
        .body(file.bytes))
}
