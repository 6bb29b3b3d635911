// src/config.rs
//
// CLI arguments with environment fallbacks; `.env` is loaded by main before parsing.

use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum EvidenceBackend {
    Fs,
    S3,
}

#[derive(Parser, Debug, Clone)]
#[command(name = "payment-intake")]
#[command(about = "Payment intake, registration and subscription reconciliation service")]
pub struct Config {
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0")]
    pub bind_addr: String,

    #[arg(long, env = "PORT", default_value_t = 8065)]
    pub port: u16,

    /// Postgres URL. Without it the service runs on the in-memory store.
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,

    #[arg(long, env = "JWT_SECRET")]
    pub jwt_secret: String,

    #[arg(long, env = "JWT_TTL_DAYS", default_value_t = 30)]
    pub jwt_ttl_days: i64,

    #[arg(long, env = "BCRYPT_COST", default_value_t = bcrypt::DEFAULT_COST)]
    pub bcrypt_cost: u32,

    /// Referrer assigned when a registration names no resolvable sponsor
    #[arg(long, env = "DEFAULT_SPONSOR_ID", default_value_t = 2)]
    pub default_sponsor_id: i32,

    /// Plan used when a registration does not name one
    #[arg(long, env = "DEFAULT_PLAN", default_value = "go")]
    pub default_plan: String,

    #[arg(long, env = "EVIDENCE_BACKEND", value_enum, default_value = "fs")]
    pub evidence_backend: EvidenceBackend,

    #[arg(long, env = "EVIDENCE_ROOT", default_value = "./storage/payments")]
    pub evidence_root: PathBuf,

    #[arg(long, env = "S3_BUCKET")]
    pub s3_bucket: Option<String>,

    /// Custom S3-compatible endpoint (MinIO etc.)
    #[arg(long, env = "S3_ENDPOINT")]
    pub s3_endpoint: Option<String>,

    #[arg(long, env = "PROVIDER_BASE_URL", default_value = "https://api-m.sandbox.paypal.com")]
    pub provider_base_url: String,

    #[arg(long, env = "PROVIDER_CLIENT_ID")]
    pub provider_client_id: Option<String>,

    #[arg(long, env = "PROVIDER_CLIENT_SECRET")]
    pub provider_client_secret: Option<String>,

    #[arg(long, env = "PROVIDER_TIMEOUT_SECS", default_value_t = 10)]
    pub provider_timeout_secs: u64,

    /// Webhook id the provider signs deliveries for. Deliveries are refused
    /// while unset.
    #[arg(long, env = "PROVIDER_WEBHOOK_ID")]
    pub provider_webhook_id: Option<String>,

    /// Provider billing plan behind each local plan, as `name=PLAN-ID`
    #[arg(
        long = "provider-plan",
        env = "PROVIDER_PLANS",
        value_delimiter = ',',
        value_parser = parse_plan_mapping
    )]
    pub provider_plans: Vec<(String, String)>,

    /// Shared secret for `X-Signature` on trusted activation calls. Signed
    /// calls are refused while unset.
    #[arg(long, env = "ACTIVATION_SECRET")]
    pub activation_secret: Option<String>,

    #[arg(long, env = "CRYPTO_NETWORK", default_value = "BEP20")]
    pub crypto_network: String,

    #[arg(long, env = "CRYPTO_TOKEN", default_value = "USDT")]
    pub crypto_token: String,

    #[arg(long, env = "CRYPTO_ADDRESS")]
    pub crypto_address: Option<String>,
}

fn parse_plan_mapping(raw: &str) -> Result<(String, String), String> {
    let (name, id) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected name=PLAN-ID, got '{raw}'"))?;
    let (name, id) = (name.trim().to_lowercase(), id.trim().to_string());
    if name.is_empty() || id.is_empty() {
        return Err(format!("expected name=PLAN-ID, got '{raw}'"));
    }
    Ok((name, id))
}

impl Config {
    pub fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_timeout_secs)
    }

    /// Client id and secret, when both are present.
    pub fn provider_credentials(&self) -> Option<(&str, &str)> {
        match (&self.provider_client_id, &self.provider_client_secret) {
            (Some(id), Some(secret)) if !id.is_empty() && !secret.is_empty() => {
                Some((id.as_str(), secret.as_str()))
            }
            _ => None,
        }
    }

    /// Provider plan id configured for local plan `plan`.
    pub fn provider_plan_id(&self, plan: &str) -> Option<&str> {
        self.provider_plans
            .iter()
            .find(|(name, _)| name == plan)
            .map(|(_, id)| id.as_str())
    }

    pub fn provider_webhook_id(&self) -> Option<&str> {
        self.provider_webhook_id.as_deref().filter(|id| !id.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_with_only_jwt_secret() {
        let cfg = Config::try_parse_from(["payment-intake", "--jwt-secret", "s"]).unwrap();
        assert_eq!(cfg.default_sponsor_id, 2);
        assert_eq!(cfg.default_plan, "go");
        assert_eq!(cfg.provider_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn provider_credentials_need_both_halves() {
        let cfg = Config::try_parse_from([
            "payment-intake",
            "--jwt-secret",
            "s",
            "--provider-client-id",
            "id",
        ])
        .unwrap();
        assert!(cfg.provider_credentials().is_none());
    }

    #[test]
    fn provider_plans_parse_as_name_id_pairs() {
        let cfg = Config::try_parse_from([
            "payment-intake",
            "--jwt-secret",
            "s",
            "--provider-plan",
            "Go=P-GO,pro=P-PRO",
        ])
        .unwrap();
        assert_eq!(cfg.provider_plan_id("go"), Some("P-GO"));
        assert_eq!(cfg.provider_plan_id("pro"), Some("P-PRO"));
        assert_eq!(cfg.provider_plan_id("plus"), None);

        assert!(Config::try_parse_from([
            "payment-intake",
            "--jwt-secret",
            "s",
            "--provider-plan",
            "go",
        ])
        .is_err());
    }
}
