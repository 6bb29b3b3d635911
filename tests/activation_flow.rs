use actix_web::{test, App};
use serde_json::{json, Value};

use payment_intake::api;
use payment_intake::api::subscriptions::SIGNATURE_HEADER;
use payment_intake::models::{
    AccountPaymentStatus, Channel, PaymentKind, PaymentStatus, Role, SubscriptionStatus,
};
use payment_intake::store::PaymentStore;

mod support;

fn activate(body: Value) -> test::TestRequest {
    test::TestRequest::post()
        .uri("/subscriptions/activate")
        .set_json(body)
}

#[actix_web::test]
async fn activation_is_idempotent_per_subscription_id() {
    let ctx = support::TestContext::new();
    let app = test::init_service(
        App::new()
            .app_data(ctx.data())
            .wrap(support::jwt())
            .configure(api::routes),
    )
    .await;
    let principal = support::seed_principal(&ctx.store, "sub1").await;
    ctx.provider.add_subscription("sub_1", "ACTIVE", "P-PRO");
    let body = json!({ "subscription_id": "sub_1", "plan": "pro", "user_id": principal.id });

    let resp = test::call_service(
        &app,
        activate(body.clone())
            .insert_header(support::bearer(principal.id, Role::Member))
            .to_request(),
    )
    .await;
    assert_eq!(resp.status(), 200);
    let first: Value = test::read_body_json(resp).await;
    assert_eq!(first["success"], true);
    assert_eq!(first["message"], "Subscription activated");
    assert_eq!(first["plan"], "pro");

    let resp = test::call_service(
        &app,
        activate(body)
            .insert_header(support::bearer(principal.id, Role::Member))
            .to_request(),
    )
    .await;
    assert_eq!(resp.status(), 200);
    let second: Value = test::read_body_json(resp).await;
    assert_eq!(second["message"], "Subscription already activated");
    assert_eq!(second["subscriptionId"], first["subscriptionId"]);
    assert_eq!(second["expiresAt"], first["expiresAt"]);

    let subs = ctx.store.list_subscriptions(principal.id).await.unwrap();
    assert_eq!(subs.len(), 1);
    assert_eq!(ctx.store.payment_count(), 1);

    let payment = ctx
        .store
        .find_payment_by_reference(Channel::RecurringBilling, "sub_1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(payment.status, PaymentStatus::Completed);
    assert_eq!(payment.kind, PaymentKind::Registration);
    assert_eq!(payment.amount, "2000.00");
    assert_eq!(payment.subscription_id, Some(subs[0].id));

    let principal = ctx.store.get_principal(principal.id).await.unwrap().unwrap();
    assert_eq!(principal.payment_status, AccountPaymentStatus::Completed);
    assert_eq!(principal.subscription_plan.as_deref(), Some("pro"));
}

#[actix_web::test]
async fn repeated_activations_leave_one_active_subscription() {
    let ctx = support::TestContext::new();
    let app = test::init_service(
        App::new()
            .app_data(ctx.data())
            .wrap(support::jwt())
            .configure(api::routes),
    )
    .await;
    let principal = support::seed_principal(&ctx.store, "multi").await;

    let mut last_id = Value::Null;
    for (n, (plan, provider_plan)) in [("go", "P-GO"), ("plus", "P-PLUS"), ("pro", "P-PRO")]
        .into_iter()
        .enumerate()
    {
        let id = format!("I-MULTI-{n}");
        ctx.provider.add_subscription(&id, "ACTIVE", provider_plan);
        let body = json!({
            "externalSubscriptionId": id,
            "planName": plan,
            "principalId": principal.id,
        });
        let req = activate(body)
            .insert_header(support::bearer(principal.id, Role::Member))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 200);
        let body: Value = test::read_body_json(resp).await;
        last_id = body["subscriptionId"].clone();
    }

    let subs = ctx.store.list_subscriptions(principal.id).await.unwrap();
    assert_eq!(subs.len(), 3);
    let active: Vec<_> = subs
        .iter()
        .filter(|s| s.status == SubscriptionStatus::Active)
        .collect();
    assert_eq!(active.len(), 1);
    assert_eq!(Value::from(active[0].id), last_id);
    assert_eq!(active[0].external_subscription_id, "I-MULTI-2");
    assert!(subs
        .iter()
        .filter(|s| s.status == SubscriptionStatus::Cancelled)
        .all(|s| s.cancelled_at.is_some()));

    let first = ctx
        .store
        .find_payment_by_reference(Channel::RecurringBilling, "I-MULTI-0")
        .await
        .unwrap()
        .unwrap();
    let latest = ctx
        .store
        .find_payment_by_reference(Channel::RecurringBilling, "I-MULTI-2")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.kind, PaymentKind::Registration);
    assert_eq!(latest.kind, PaymentKind::Renewal);

    let principal = ctx.store.get_principal(principal.id).await.unwrap().unwrap();
    assert_eq!(principal.subscription_plan.as_deref(), Some("pro"));
}

#[actix_web::test]
async fn activation_rejects_bad_input_without_writes() {
    let ctx = support::TestContext::new();
    ctx.store.add_plan("legacy", "100.00", "PHP", false);
    let app = test::init_service(
        App::new()
            .app_data(ctx.data())
            .wrap(support::jwt())
            .configure(api::routes),
    )
    .await;
    let principal = support::seed_principal(&ctx.store, "bad").await;
    ctx.provider.add_subscription("I-X", "ACTIVE", "P-PRO");
    let as_owner = |body: Value| {
        activate(body)
            .insert_header(support::bearer(principal.id, Role::Member))
            .to_request()
    };

    let resp = test::call_service(
        &app,
        as_owner(json!({ "subscription_id": "I-X", "plan": "gold", "user_id": principal.id })),
    )
    .await;
    assert_eq!(resp.status(), 400);

    let resp = test::call_service(
        &app,
        as_owner(json!({ "subscription_id": "I-X", "plan": "legacy", "user_id": principal.id })),
    )
    .await;
    assert_eq!(resp.status(), 400);

    let resp = test::call_service(
        &app,
        as_owner(json!({ "subscription_id": "I-X", "user_id": principal.id })),
    )
    .await;
    assert_eq!(resp.status(), 400);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["message"], "Missing required fields");

    // Valid token for a principal that no longer exists.
    let resp = test::call_service(
        &app,
        activate(json!({ "subscription_id": "I-X", "plan": "pro" }))
            .insert_header(support::bearer(9999, Role::Member))
            .to_request(),
    )
    .await;
    assert_eq!(resp.status(), 404);

    let resp = test::call_service(
        &app,
        test::TestRequest::post()
            .uri("/subscriptions/activate")
            .insert_header(("content-type", "application/json"))
            .set_payload("{not json")
            .to_request(),
    )
    .await;
    assert_eq!(resp.status(), 400);

    assert_eq!(ctx.store.payment_count(), 0);
    assert!(ctx.store.list_subscriptions(principal.id).await.unwrap().is_empty());
}

#[actix_web::test]
async fn principal_defaults_to_authenticated_caller() {
    let ctx = support::TestContext::new();
    let app = test::init_service(
        App::new()
            .app_data(ctx.data())
            .wrap(support::jwt())
            .configure(api::routes),
    )
    .await;
    let principal = support::seed_principal(&ctx.store, "caller").await;
    ctx.provider.add_subscription("I-CALLER", "ACTIVE", "P-PLUS");

    let req = activate(json!({ "subscription_id": "I-CALLER", "plan": "plus" }))
        .insert_header(support::bearer(principal.id, Role::Member))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);

    let subs = ctx.store.list_subscriptions(principal.id).await.unwrap();
    assert_eq!(subs.len(), 1);
    assert_eq!(subs[0].external_subscription_id, "I-CALLER");
}

#[actix_web::test]
async fn signed_activation_requires_valid_signature() {
    let ctx = support::TestContext::build(
        support::StubProvider::new("COMPLETED"),
        &["--activation-secret", "hook-secret"],
    );
    let app = test::init_service(
        App::new()
            .app_data(ctx.data())
            .wrap(support::jwt())
            .configure(api::routes),
    )
    .await;
    let principal = support::seed_principal(&ctx.store, "signed").await;
    let body = serde_json::to_vec(&json!({
        "subscription_id": "I-SIGNED",
        "plan": "go",
        "user_id": principal.id,
    }))
    .unwrap();

    let unsigned = test::TestRequest::post()
        .uri("/subscriptions/activate")
        .insert_header(("content-type", "application/json"))
        .set_payload(body.clone())
        .to_request();
    assert_eq!(test::call_service(&app, unsigned).await.status(), 401);

    let forged = test::TestRequest::post()
        .uri("/subscriptions/activate")
        .insert_header(("content-type", "application/json"))
        .insert_header((SIGNATURE_HEADER, support::sign("wrong", &body)))
        .set_payload(body.clone())
        .to_request();
    assert_eq!(test::call_service(&app, forged).await.status(), 401);
    assert_eq!(ctx.store.payment_count(), 0);

    let signed = test::TestRequest::post()
        .uri("/subscriptions/activate")
        .insert_header(("content-type", "application/json"))
        .insert_header((SIGNATURE_HEADER, support::sign("hook-secret", &body)))
        .set_payload(body)
        .to_request();
    assert_eq!(test::call_service(&app, signed).await.status(), 200);
    assert_eq!(ctx.store.payment_count(), 1);
    // Signed calls come from the checkout backend and skip the provider lookup.
    assert_eq!(ctx.provider.calls(), 0);
}

#[actix_web::test]
async fn signed_activation_is_refused_without_configured_secret() {
    let ctx = support::TestContext::new();
    let app = test::init_service(
        App::new()
            .app_data(ctx.data())
            .wrap(support::jwt())
            .configure(api::routes),
    )
    .await;
    let principal = support::seed_principal(&ctx.store, "nosecret").await;
    let body = serde_json::to_vec(&json!({
        "subscription_id": "I-NOSECRET",
        "plan": "go",
        "user_id": principal.id,
    }))
    .unwrap();

    let req = test::TestRequest::post()
        .uri("/subscriptions/activate")
        .insert_header(("content-type", "application/json"))
        .insert_header((SIGNATURE_HEADER, support::sign("", &body)))
        .set_payload(body)
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 401);
    assert_eq!(ctx.store.payment_count(), 0);
}

#[actix_web::test]
async fn activation_for_another_principal_is_refused() {
    let ctx = support::TestContext::new();
    let app = test::init_service(
        App::new()
            .app_data(ctx.data())
            .wrap(support::jwt())
            .configure(api::routes),
    )
    .await;
    let victim = support::seed_principal(&ctx.store, "victim").await;
    let attacker = support::seed_principal(&ctx.store, "attacker").await;
    ctx.provider.add_subscription("I-ATTACK", "ACTIVE", "P-PRO");
    let body = json!({ "subscription_id": "I-ATTACK", "plan": "pro", "principalId": victim.id });

    let resp = test::call_service(&app, activate(body.clone()).to_request()).await;
    assert_eq!(resp.status(), 401);

    let req = activate(body)
        .insert_header(support::bearer(attacker.id, Role::Member))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 403);

    assert_eq!(ctx.store.payment_count(), 0);
    let victim = ctx.store.get_principal(victim.id).await.unwrap().unwrap();
    assert_eq!(victim.subscription_plan, None);
    assert_eq!(victim.payment_status, AccountPaymentStatus::Pending);
    assert!(ctx.store.list_subscriptions(victim.id).await.unwrap().is_empty());
}

#[actix_web::test]
async fn provider_must_confirm_subscription_and_plan() {
    let ctx = support::TestContext::new();
    let app = test::init_service(
        App::new()
            .app_data(ctx.data())
            .wrap(support::jwt())
            .configure(api::routes),
    )
    .await;
    let principal = support::seed_principal(&ctx.store, "confirm").await;
    ctx.provider.add_subscription("I-SUSPENDED", "SUSPENDED", "P-PRO");
    ctx.provider.add_subscription("I-GO", "ACTIVE", "P-GO");
    let call = |body: Value| {
        activate(body)
            .insert_header(support::bearer(principal.id, Role::Member))
            .to_request()
    };

    let resp = test::call_service(&app, call(json!({ "subscription_id": "I-SUSPENDED", "plan": "pro" }))).await;
    assert_eq!(resp.status(), 400);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(
        body["message"],
        "Subscription is not active with the provider (status: SUSPENDED)."
    );

    // Paid for go, asking for pro.
    let resp = test::call_service(&app, call(json!({ "subscription_id": "I-GO", "plan": "pro" }))).await;
    assert_eq!(resp.status(), 400);

    // Unknown to the provider.
    let resp = test::call_service(&app, call(json!({ "subscription_id": "I-MADE-UP", "plan": "go" }))).await;
    assert_eq!(resp.status(), 502);

    assert_eq!(ctx.store.payment_count(), 0);
    let principal = ctx.store.get_principal(principal.id).await.unwrap().unwrap();
    assert_eq!(principal.subscription_plan, None);

    let resp = test::call_service(&app, call(json!({ "subscription_id": "I-GO", "plan": "go" }))).await;
    assert_eq!(resp.status(), 200);
}

#[actix_web::test]
async fn replayed_subscription_id_cannot_move_to_another_principal() {
    let ctx = support::TestContext::new();
    let app = test::init_service(
        App::new()
            .app_data(ctx.data())
            .wrap(support::jwt())
            .configure(api::routes),
    )
    .await;
    let owner = support::seed_principal(&ctx.store, "owner").await;
    let other = support::seed_principal(&ctx.store, "other").await;
    ctx.provider.add_subscription("I-SHARED", "ACTIVE", "P-PLUS");
    let body = json!({ "subscription_id": "I-SHARED", "plan": "plus" });

    let req = activate(body.clone())
        .insert_header(support::bearer(owner.id, Role::Member))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 200);

    let req = activate(body)
        .insert_header(support::bearer(other.id, Role::Member))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 409);

    let other = ctx.store.get_principal(other.id).await.unwrap().unwrap();
    assert_eq!(other.subscription_plan, None);
    assert!(ctx.store.list_subscriptions(other.id).await.unwrap().is_empty());
}
