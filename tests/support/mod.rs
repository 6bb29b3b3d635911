#![allow(dead_code)]

use std::collections::HashMap;
use std::env;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock};
use std::time::Duration;

use actix_web::web;
use async_trait::async_trait;
use clap::Parser;
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use sqlx::PgPool;
use tempfile::TempDir;
use tokio::sync::{Mutex, MutexGuard};

use payment_intake::api::auth::{issue_token, JwtMiddleware};
use payment_intake::config::Config;
use payment_intake::models::{
    AuditCapture, Channel, NewPaymentRecord, NewPrincipal, PaymentKind, PaymentRecord,
    PaymentStatus, Principal, Role,
};
use payment_intake::provider::{
    BillingProvider, OrderRequest, ProviderError, ProviderOrder, ProviderSubscription,
    WebhookHeaders,
};
use payment_intake::store::{MemoryStore, PaymentStore};
use payment_intake::AppState;

pub const JWT_SECRET: &str = "test-jwt-secret";
pub const BOUNDARY: &str = "BOUNDARY";

/// Minimal PNG header, enough for content sniffing.
pub const PNG: [u8; 16] = [
    0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0x0D, 0x49, 0x48, 0x44, 0x52,
];

/// Billing provider double. Orders report a settable status and amount;
/// subscriptions must be registered before they can be looked up.
pub struct StubProvider {
    status: StdMutex<String>,
    order_amount: StdMutex<(Option<String>, Option<String>)>,
    subscriptions: StdMutex<HashMap<String, ProviderSubscription>>,
    created: StdMutex<Vec<OrderRequest>>,
    verifies: AtomicBool,
    delay: Duration,
    calls: AtomicUsize,
}

impl StubProvider {
    pub fn new(status: &str) -> Self {
        Self::slow(status, Duration::ZERO)
    }

    pub fn slow(status: &str, delay: Duration) -> Self {
        Self {
            status: StdMutex::new(status.to_string()),
            order_amount: StdMutex::new((Some("500.00".into()), Some("PHP".into()))),
            subscriptions: StdMutex::new(HashMap::new()),
            created: StdMutex::new(Vec::new()),
            verifies: AtomicBool::new(true),
            delay,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set_status(&self, status: &str) {
        *self.status.lock().unwrap() = status.to_string();
    }

    /// Amount and currency reported on every order; defaults to the go plan.
    pub fn set_order_amount(&self, amount: Option<&str>, currency: Option<&str>) {
        *self.order_amount.lock().unwrap() =
            (amount.map(str::to_string), currency.map(str::to_string));
    }

    pub fn add_subscription(&self, id: &str, status: &str, plan_id: &str) {
        self.subscriptions.lock().unwrap().insert(
            id.to_string(),
            ProviderSubscription {
                id: id.to_string(),
                status: status.to_string(),
                plan_id: Some(plan_id.to_string()),
            },
        );
    }

    pub fn set_verifies(&self, verifies: bool) {
        self.verifies.store(verifies, Ordering::SeqCst);
    }

    pub fn created_orders(&self) -> Vec<OrderRequest> {
        self.created.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn tick(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
    }

    fn current_order(&self, id: &str) -> ProviderOrder {
        let (amount, currency) = self.order_amount.lock().unwrap().clone();
        ProviderOrder {
            id: id.to_string(),
            status: self.status.lock().unwrap().clone(),
            amount,
            currency,
            capture_id: None,
        }
    }
}

#[async_trait]
impl BillingProvider for StubProvider {
    async fn order(&self, order_id: &str) -> Result<ProviderOrder, ProviderError> {
        self.tick().await;
        Ok(self.current_order(order_id))
    }

    async fn create_order(&self, request: &OrderRequest) -> Result<ProviderOrder, ProviderError> {
        self.tick().await;
        self.created.lock().unwrap().push(request.clone());
        Ok(ProviderOrder {
            id: "ORDER-NEW".into(),
            status: "CREATED".into(),
            amount: Some(request.amount.clone()),
            currency: Some(request.currency.clone()),
            capture_id: None,
        })
    }

    async fn capture_order(&self, order_id: &str) -> Result<ProviderOrder, ProviderError> {
        self.tick().await;
        let mut order = self.current_order(order_id);
        order.capture_id = Some(format!("CAP-{order_id}"));
        Ok(order)
    }

    async fn subscription(
        &self,
        subscription_id: &str,
    ) -> Result<ProviderSubscription, ProviderError> {
        self.tick().await;
        self.subscriptions
            .lock()
            .unwrap()
            .get(subscription_id)
            .cloned()
            .ok_or_else(|| ProviderError::Api {
                status: 404,
                body: "RESOURCE_NOT_FOUND".into(),
            })
    }

    async fn verify_webhook(
        &self,
        _webhook_id: &str,
        _headers: &WebhookHeaders,
        _event: &Value,
    ) -> Result<bool, ProviderError> {
        self.tick().await;
        Ok(self.verifies.load(Ordering::SeqCst))
    }
}

/// Lowercase hex HMAC-SHA256 of `body`, as the checkout backend signs it.
pub fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

pub fn test_config(evidence_root: &std::path::Path, extra: &[&str]) -> Config {
    let mut args = vec![
        "payment-intake".to_string(),
        "--jwt-secret".to_string(),
        JWT_SECRET.to_string(),
        "--bcrypt-cost".to_string(),
        "4".to_string(),
        "--evidence-root".to_string(),
        evidence_root.display().to_string(),
        "--provider-plan".to_string(),
        "go=P-GO,plus=P-PLUS,pro=P-PRO".to_string(),
    ];
    args.extend(extra.iter().map(|s| s.to_string()));
    Config::try_parse_from(args).expect("test config")
}

/// In-memory store, temp evidence root and a stub provider wired into `AppState`.
pub struct TestContext {
    pub store: Arc<MemoryStore>,
    pub provider: Arc<StubProvider>,
    pub evidence_dir: TempDir,
    pub state: AppState,
}

impl TestContext {
    pub fn new() -> Self {
        Self::build(StubProvider::new("COMPLETED"), &[])
    }

    pub fn build(provider: StubProvider, extra_args: &[&str]) -> Self {
        let evidence_dir = tempfile::tempdir().expect("tempdir");
        let config = test_config(evidence_dir.path(), extra_args);
        let store = Arc::new(MemoryStore::with_default_plans());
        let provider = Arc::new(provider);
        let state = AppState {
            store: store.clone(),
            evidence: Arc::new(payment_intake::evidence::FsEvidenceStore::new(
                evidence_dir.path(),
            )),
            provider: provider.clone(),
            config: Arc::new(config),
        };
        Self {
            store,
            provider,
            evidence_dir,
            state,
        }
    }

    pub fn data(&self) -> web::Data<AppState> {
        web::Data::new(self.state.clone())
    }

    pub fn with_provider(&self, provider: Arc<dyn BillingProvider>) -> web::Data<AppState> {
        let mut state = self.state.clone();
        state.provider = provider;
        web::Data::new(state)
    }

    pub fn evidence_files(&self, channel: Channel) -> Vec<String> {
        let dir = self.evidence_dir.path().join(channel.evidence_dir());
        match std::fs::read_dir(dir) {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect(),
            Err(_) => Vec::new(),
        }
    }
}

pub fn jwt() -> JwtMiddleware {
    JwtMiddleware::new(JWT_SECRET)
}

pub fn bearer(user_id: i32, role: Role) -> (&'static str, String) {
    let token = issue_token(JWT_SECRET, user_id, role, 1).expect("token");
    ("Authorization", format!("Bearer {token}"))
}

pub fn build_multipart_body(
    boundary: &str,
    fields: &[(&str, &str)],
    files: &[(&str, &str, &str, &[u8])],
) -> Vec<u8> {
    let mut body = Vec::new();
    for (name, value) in fields {
        body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
        body.extend_from_slice(
            format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes(),
        );
        body.extend_from_slice(value.as_bytes());
        body.extend_from_slice(b"\r\n");
    }
    for (field_name, filename, content_type, data) in files {
        body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
        body.extend_from_slice(
            format!(
                "Content-Disposition: form-data; name=\"{field_name}\"; filename=\"{filename}\"\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(format!("Content-Type: {content_type}\r\n\r\n").as_bytes());
        body.extend_from_slice(data);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());
    body
}

pub fn multipart_content_type() -> (&'static str, String) {
    ("content-type", format!("multipart/form-data; boundary={BOUNDARY}"))
}

/// Identity fields for a registration, unique per `tag`.
pub fn identity(tag: &str) -> Vec<(String, String)> {
    vec![
        ("username".into(), format!("user_{tag}")),
        ("email".into(), format!("{tag}@example.com")),
        ("password".into(), "secret123".into()),
        ("country".into(), "PH".into()),
        ("phone".into(), format!("+63917{tag}")),
    ]
}

pub fn as_refs(fields: &[(String, String)]) -> Vec<(&str, &str)> {
    fields.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect()
}

pub async fn seed_principal(store: &MemoryStore, tag: &str) -> Principal {
    store
        .insert_principal(NewPrincipal {
            email: format!("{tag}@example.com"),
            handle: format!("user_{tag}"),
            full_name: format!("User {tag}"),
            phone: format!("+63917{tag}"),
            country: "PH".into(),
            referred_by: 2,
            public_id: format!("{:0>12}", tag),
            password_hash: "hash".into(),
        })
        .await
        .expect("seed principal")
}

static SEED_SEQ: AtomicUsize = AtomicUsize::new(1);

pub async fn seed_payment(
    store: &MemoryStore,
    principal_id: i32,
    channel: Channel,
    reference: &str,
    evidence_filename: Option<&str>,
) -> PaymentRecord {
    let plan = store
        .find_active_plan("go")
        .await
        .expect("plan lookup")
        .expect("go plan");
    store
        .insert_payment(NewPaymentRecord {
            principal_id,
            subscription_id: None,
            plan_id: plan.id,
            kind: PaymentKind::Registration,
            amount: plan.price.clone(),
            currency: plan.currency.clone(),
            channel,
            external_reference: reference.to_string(),
            status: PaymentStatus::Pending,
            evidence_filename: evidence_filename.map(str::to_string),
            audit: json!({ "reference": reference }),
            pending_email: None,
            transaction_id: format!("GNT-T{:07}", SEED_SEQ.fetch_add(1, Ordering::SeqCst)),
            capture: AuditCapture::default(),
        })
        .await
        .expect("seed payment")
}

fn split_db_url(url: &str) -> Result<(String, String), String> {
    let (base, query) = match url.split_once('?') {
        Some((base, query)) => (base.to_string(), Some(query)),
        None => (url.to_string(), None),
    };

    let db_start = base
        .rfind('/')
        .ok_or_else(|| "invalid database url".to_string())?;
    if db_start + 1 >= base.len() {
        return Err("database name is empty".to_string());
    }

    let db_name = base[db_start + 1..].to_string();
    let mut admin_url = format!("{}postgres", &base[..db_start + 1]);
    if let Some(query) = query {
        admin_url = format!("{admin_url}?{query}");
    }

    Ok((admin_url, db_name))
}

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

static TEST_DB_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

pub struct TestDb {
    pub pool: PgPool,
    _guard: MutexGuard<'static, ()>,
}

/// Fresh, migrated database from `TEST_DATABASE_URL`, or `None` when unset.
pub async fn init_test_db() -> Option<TestDb> {
    dotenvy::dotenv().ok();
    let test_url = env::var("TEST_DATABASE_URL").ok()?;
    let (admin_url, db_name) =
        split_db_url(&test_url).expect("invalid TEST_DATABASE_URL format");

    let lock = TEST_DB_LOCK.get_or_init(|| Mutex::new(()));
    let guard = lock.lock().await;

    let admin_pool = PgPool::connect(&admin_url)
        .await
        .expect("connect admin db");

    let quoted_name = quote_identifier(&db_name);
    let drop_sql = format!("DROP DATABASE IF EXISTS {quoted_name} WITH (FORCE)");
    let create_sql = format!("CREATE DATABASE {quoted_name}");

    let _ = sqlx::query(&drop_sql).execute(&admin_pool).await;
    sqlx::query(&create_sql)
        .execute(&admin_pool)
        .await
        .expect("create test db");
    admin_pool.close().await;

    let pool = PgPool::connect(&test_url)
        .await
        .expect("connect test db");
    sqlx::migrate!().run(&pool).await.expect("migrations");
    Some(TestDb { pool, _guard: guard })
}
