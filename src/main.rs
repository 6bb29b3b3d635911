// src/main.rs
use std::sync::Arc;

use actix_web::middleware::Logger;
use actix_web::{web, App, HttpResponse, HttpServer, Responder};
use aws_config::meta::region::RegionProviderChain;
use aws_sdk_s3::Client as S3Client;
use clap::Parser;
use dotenvy::dotenv;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use payment_intake::config::{Config, EvidenceBackend};
use payment_intake::evidence::{EvidenceStore, FsEvidenceStore, S3EvidenceStore};
use payment_intake::provider::{BillingProvider, HttpBillingProvider, UnconfiguredProvider};
use payment_intake::store::{MemoryStore, PaymentStore, PgStore};
use payment_intake::{api, docs, AppState};

async fn index() -> impl Responder {
    HttpResponse::Ok().body("Service ready!")
}

async fn s3_client(endpoint: Option<&str>) -> S3Client {
    let region_provider = RegionProviderChain::default_provider().or_else("us-east-1");
    let aws_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
        .region(region_provider)
        .load()
        .await;
    let mut s3_config_builder = aws_sdk_s3::config::Builder::from(&aws_config);

    // Custom S3-compatible endpoints (MinIO etc.) need path-style addressing
    if let Some(endpoint) = endpoint {
        s3_config_builder = s3_config_builder
            .endpoint_url(endpoint)
            .force_path_style(true);
    }

    S3Client::from_conf(s3_config_builder.build())
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenv().ok();
    let config = Config::parse();

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("payment_intake=info,actix_web=info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let store: Arc<dyn PaymentStore> = match &config.database_url {
        Some(url) => Arc::new(
            PgStore::connect(url)
                .await
                .expect("Failed to connect to DB and run migrations"),
        ),
        None => {
            log::warn!("DATABASE_URL not set, using in-memory store");
            Arc::new(MemoryStore::with_default_plans())
        }
    };

    let evidence: Arc<dyn EvidenceStore> = match config.evidence_backend {
        EvidenceBackend::Fs => {
            log::info!("evidence stored under {}", config.evidence_root.display());
            Arc::new(FsEvidenceStore::new(config.evidence_root.clone()))
        }
        EvidenceBackend::S3 => {
            let bucket = config
                .s3_bucket
                .clone()
                .expect("S3_BUCKET required for the s3 evidence backend");
            let client = s3_client(config.s3_endpoint.as_deref()).await;
            Arc::new(S3EvidenceStore::new(client, bucket))
        }
    };

    let provider: Arc<dyn BillingProvider> = match config.provider_credentials() {
        Some((client_id, client_secret)) => Arc::new(
            HttpBillingProvider::new(
                &config.provider_base_url,
                client_id,
                client_secret,
                config.provider_timeout(),
            )
            .expect("Failed to build billing provider client"),
        ),
        None => {
            log::warn!("billing provider credentials not set, status checks will fail upstream");
            Arc::new(UnconfiguredProvider)
        }
    };

    let bind = (config.bind_addr.clone(), config.port);
    let jwt = api::auth::JwtMiddleware::new(&config.jwt_secret);
    let state = web::Data::new(AppState {
        store,
        evidence,
        provider,
        config: Arc::new(config),
    });

    log::info!("listening on {}:{}", bind.0, bind.1);
    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .wrap(jwt.clone())
            .wrap(Logger::default())
            .route("/", web::get().to(index))
            .service(
                SwaggerUi::new("/docs/{_:.*}")
                    .url("/api-docs/openapi.json", docs::ApiDoc::openapi()),
            )
            .configure(api::routes)
    })
    .bind(bind)?
    .run()
    .await
}
