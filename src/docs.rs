use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme};
use utoipa::{Modify, OpenApi};

struct BearerAuth;

impl Modify for BearerAuth {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .build(),
                ),
            );
        }
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::api::payments::submit_payment,
        crate::api::payments::crypto_info,
        crate::api::payments::create_order,
        crate::api::payments::capture_order,
        crate::api::payments::check_status,
        crate::api::payments::request_review,
        crate::api::payments::payment_details,
        crate::api::subscriptions::activate,
        crate::api::webhooks::provider_webhook,
        crate::api::evidence::get_evidence,
        crate::api::admin::review_queue,
        crate::api::admin::approve_payment,
        crate::api::admin::reject_payment
    ),
    components(
        schemas(
            crate::api::payments::RegistrationForm,
            crate::api::payments::RegistrationResponse,
            crate::api::payments::StatusCheckResponse,
            crate::api::payments::ReviewResponse,
            crate::api::payments::CryptoInfo,
            crate::api::payments::CreateOrderRequest,
            crate::api::payments::CreateOrderResponse,
            crate::api::payments::CaptureOrderRequest,
            crate::api::payments::CaptureOrderResponse,
            crate::api::subscriptions::ActivateRequest,
            crate::api::subscriptions::ActivateResponse,
            crate::api::admin::RejectRequest,
            crate::models::PaymentStatus,
            crate::models::Channel
        )
    ),
    modifiers(&BearerAuth),
    tags(
        (name = "payments", description = "Registration payments and status"),
        (name = "subscriptions", description = "Recurring billing activation"),
        (name = "webhooks", description = "Provider event deliveries"),
        (name = "admin", description = "Manual payment review")
    )
)]
pub struct ApiDoc;
