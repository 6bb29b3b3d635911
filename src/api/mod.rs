pub mod admin;
pub mod audit;
pub mod auth;
pub mod evidence;
pub mod payments;
pub mod subscriptions;
pub mod webhooks;

use actix_web::web;

/// Registers every API route. Authentication is resolved by `auth::JwtMiddleware`
/// wrapped around the app; handlers that need a caller extract `AuthUser`.
pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg
        // Public
        .service(payments::crypto_info)
        .service(payments::create_order)
        .service(payments::capture_order)
        .service(payments::submit_payment)
        .service(subscriptions::activate)
        // Provider-signed
        .service(webhooks::provider_webhook)
        // Owner
        .service(payments::check_status)
        .service(payments::request_review)
        .service(payments::payment_details)
        .service(evidence::get_evidence)
        // Admin
        .service(admin::review_queue)
        .service(admin::approve_payment)
        .service(admin::reject_payment);
}
