// src/api/auth.rs

use std::rc::Rc;
use std::sync::Arc;
use std::task::{Context, Poll};

use actix_web::body::MessageBody;
use actix_web::dev::{Payload, Service, ServiceRequest, ServiceResponse, Transform};
use actix_web::{Error, FromRequest, HttpMessage, HttpRequest};
use chrono::{Duration, Utc};
use futures_util::future::{ready, LocalBoxFuture, Ready};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::models::Role;

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: i32,
    role: Role,
    exp: usize,
}

/// Authenticated caller, placed in request extensions by `JwtMiddleware`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthUser {
    pub id: i32,
    pub role: Role,
}

impl AuthUser {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    pub fn require_admin(&self) -> Result<(), AppError> {
        if self.is_admin() {
            Ok(())
        } else {
            Err(AppError::Authorization)
        }
    }
}

impl FromRequest for AuthUser {
    type Error = AppError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        ready(
            req.extensions()
                .get::<AuthUser>()
                .copied()
                .ok_or(AppError::Unauthenticated),
        )
    }
}

pub fn issue_token(
    secret: &str,
    user_id: i32,
    role: Role,
    ttl_days: i64,
) -> Result<String, jsonwebtoken::errors::Error> {
    let expiration = (Utc::now() + Duration::days(ttl_days)).timestamp() as usize;

    let claims = Claims {
        sub: user_id,
        role,
        exp: expiration,
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_ref()),
    )
}

/// Middleware that:
/// - reads `Authorization: Bearer <jwt>`
/// - validates the JWT and puts an `AuthUser` into `req.extensions_mut()`
/// - rejects a present but invalid token with 401
///
/// Requests without a token pass through; handlers that need a caller take
/// `AuthUser` as an argument and fail with 401 on their own.
#[derive(Clone)]
pub struct JwtMiddleware {
    secret: Arc<str>,
}

impl JwtMiddleware {
    pub fn new(secret: &str) -> Self {
        Self {
            secret: Arc::from(secret),
        }
    }
}

impl<S, B> Transform<S, ServiceRequest> for JwtMiddleware
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    B: MessageBody + 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Transform = JwtMiddlewareInner<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(JwtMiddlewareInner {
            service: Rc::new(service),
            secret: self.secret.clone(),
        }))
    }
}

pub struct JwtMiddlewareInner<S> {
    service: Rc<S>,
    secret: Arc<str>,
}

impl<S, B> Service<ServiceRequest> for JwtMiddlewareInner<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    B: MessageBody + 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.service.poll_ready(cx)
    }

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let token = req
            .headers()
            .get(actix_web::http::header::AUTHORIZATION)
            .and_then(|h| h.to_str().ok())
            .and_then(|h| h.strip_prefix("Bearer "))
            .map(str::to_owned);

        if let Some(token) = token {
            match decode::<Claims>(
                &token,
                &DecodingKey::from_secret(self.secret.as_bytes()),
                &Validation::default(),
            ) {
                Ok(data) => {
                    req.extensions_mut().insert(AuthUser {
                        id: data.claims.sub,
                        role: data.claims.role,
                    });
                }
                Err(e) => {
                    log::debug!("rejected bearer token: {e}");
                    let err: Error = AppError::Unauthenticated.into();
                    return Box::pin(async move { Err(err) });
                }
            }
        }

        let service = self.service.clone();
        Box::pin(async move { service.call(req).await })
    }
}
