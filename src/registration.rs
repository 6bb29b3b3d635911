// src/registration.rs
//
// Creates the principal and its first payment record as one logical unit.
// Writes are discrete; every completed stage registers its compensation and
// a failure unwinds them in reverse before the error is surfaced.

use std::sync::Arc;

use rand::Rng;
use serde_json::json;

use crate::config::Config;
use crate::duplicates;
use crate::error::{AppError, AppResult};
use crate::evidence::{self, EvidenceStore};
use crate::intake::{ChannelSpec, DuplicateStrategy, Submission};
use crate::models::{
    AuditCapture, Channel, NewPaymentRecord, NewPrincipal, PaymentKind, PaymentRecord,
    PaymentStatus, Principal,
};
use crate::store::{PaymentStore, StoreError};

const TRANSACTION_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
const TRANSACTION_ATTEMPTS: usize = 10;

/// Unique `GNT-XXXXXXXX` id, checked against existing records.
pub async fn new_transaction_id(store: &dyn PaymentStore) -> AppResult<String> {
    for _ in 0..TRANSACTION_ATTEMPTS {
        let candidate = {
            let mut rng = rand::thread_rng();
            let suffix: String = (0..8)
                .map(|_| TRANSACTION_ALPHABET[rng.gen_range(0..TRANSACTION_ALPHABET.len())] as char)
                .collect();
            format!("GNT-{suffix}")
        };
        if !store.transaction_id_exists(&candidate).await? {
            return Ok(candidate);
        }
    }
    Err(AppError::Storage("could not allocate a transaction id".into()))
}

fn new_public_id() -> String {
    let bytes: [u8; 6] = rand::random();
    hex::encode(bytes)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Validated,
    EvidenceStored,
    PrincipalCreated,
    Committed,
}

#[derive(Debug)]
enum Compensation {
    DeleteEvidence { channel: Channel, name: String },
    DeletePrincipal(i32),
}

struct Saga<'a> {
    stage: Stage,
    undo: Vec<Compensation>,
    store: &'a dyn PaymentStore,
    evidence: &'a dyn EvidenceStore,
}

impl<'a> Saga<'a> {
    fn new(store: &'a dyn PaymentStore, evidence: &'a dyn EvidenceStore) -> Self {
        Self {
            stage: Stage::Validated,
            undo: Vec::new(),
            store,
            evidence,
        }
    }

    fn advance(&mut self, stage: Stage, compensation: Option<Compensation>) {
        log::debug!("registration stage {:?} -> {:?}", self.stage, stage);
        self.stage = stage;
        self.undo.extend(compensation);
    }

    /// Runs compensations newest first and returns `cause` unchanged.
    async fn abort(mut self, cause: AppError) -> AppError {
        log::warn!("registration failed at stage {:?}: {cause}", self.stage);
        while let Some(step) = self.undo.pop() {
            let result = match &step {
                Compensation::DeletePrincipal(id) => self
                    .store
                    .delete_principal(*id)
                    .await
                    .map_err(|e| e.to_string()),
                Compensation::DeleteEvidence { channel, name } => self
                    .evidence
                    .delete(*channel, name)
                    .await
                    .map_err(|e| e.to_string()),
            };
            if let Err(e) = result {
                log::error!("compensation {step:?} failed: {e}");
            }
        }
        cause
    }
}

/// Store write failures after the duplicate pre-check: constraint hits are
/// duplicates lost to a concurrent writer, everything else is storage.
fn write_failure(err: StoreError) -> AppError {
    match err {
        StoreError::Conflict(field) => AppError::Duplicate(field),
        other => {
            log::error!("registration write failed: {other}");
            AppError::Storage(other.to_string())
        }
    }
}

#[derive(Debug, Clone)]
pub struct Registered {
    pub principal: Principal,
    pub payment: PaymentRecord,
}

pub struct Registrar {
    store: Arc<dyn PaymentStore>,
    evidence: Arc<dyn EvidenceStore>,
    config: Arc<Config>,
}

impl Registrar {
    pub fn new(
        store: Arc<dyn PaymentStore>,
        evidence: Arc<dyn EvidenceStore>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            store,
            evidence,
            config,
        }
    }

    /// Numeric sponsor ids are taken as-is; otherwise handle, then public id,
    /// then the configured default.
    pub async fn resolve_referrer(&self, sponsor: Option<&str>) -> AppResult<i32> {
        let Some(sponsor) = sponsor.map(str::trim).filter(|s| !s.is_empty()) else {
            return Ok(self.config.default_sponsor_id);
        };
        if let Ok(id) = sponsor.parse::<i32>() {
            return Ok(id);
        }
        if let Some(id) = self.store.find_principal_id_by_handle(sponsor).await? {
            return Ok(id);
        }
        if let Some(id) = self.store.find_principal_id_by_public_id(sponsor).await? {
            return Ok(id);
        }
        Ok(self.config.default_sponsor_id)
    }

    pub async fn register(&self, sub: Submission, capture: AuditCapture) -> AppResult<Registered> {
        duplicates::check(self.store.as_ref(), &sub).await?;

        let plan = self
            .store
            .find_active_plan(&sub.plan_name)
            .await?
            .ok_or_else(|| AppError::InvalidPlan(sub.plan_name.clone()))?;
        let referred_by = self.resolve_referrer(sub.sponsor.as_deref()).await?;
        // Provider-verified records carry the plan price; reconciliation
        // compares the provider's captured amount against it.
        let (amount, currency) = if sub.channel.is_machine_verifiable() {
            if sub.amount.is_some() || sub.currency.is_some() {
                log::debug!("ignoring client package amount for {} registration", sub.channel);
            }
            (plan.price.clone(), plan.currency.clone())
        } else {
            let amount = sub.amount.clone().unwrap_or_else(|| plan.price.clone());
            let currency = match (&sub.currency, sub.channel) {
                (Some(c), _) => c.clone(),
                (None, Channel::CryptoOnchain) => self.config.crypto_token.clone(),
                (None, _) => plan.currency.clone(),
            };
            (amount, currency)
        };
        let password_hash = bcrypt::hash(&sub.password, self.config.bcrypt_cost).map_err(|e| {
            log::error!("bcrypt hash error: {e}");
            AppError::Storage("password hashing failed".into())
        })?;
        let transaction_id = new_transaction_id(self.store.as_ref()).await?;

        let mut saga = Saga::new(self.store.as_ref(), self.evidence.as_ref());

        let mut evidence_filename = None;
        if let Some(upload) = &sub.evidence {
            let name = evidence::generate_name(upload.extension);
            if let Err(e) = self
                .evidence
                .put(sub.channel, &name, &upload.bytes, upload.mime)
                .await
            {
                return Err(saga.abort(e.into()).await);
            }
            saga.advance(
                Stage::EvidenceStored,
                Some(Compensation::DeleteEvidence {
                    channel: sub.channel,
                    name: name.clone(),
                }),
            );
            evidence_filename = Some(name);
        }

        let principal = match self
            .store
            .insert_principal(NewPrincipal {
                email: sub.email.clone(),
                handle: sub.handle.clone(),
                full_name: sub.full_name.clone(),
                phone: sub.phone.clone(),
                country: sub.country.clone(),
                referred_by,
                public_id: new_public_id(),
                password_hash,
            })
            .await
        {
            Ok(p) => p,
            Err(e) => return Err(saga.abort(write_failure(e)).await),
        };
        saga.advance(
            Stage::PrincipalCreated,
            Some(Compensation::DeletePrincipal(principal.id)),
        );

        let audit = json!({
            "email": sub.email,
            "username": sub.handle,
            "fullname": sub.full_name,
            "phone": sub.phone,
            "country": sub.country,
            "referrer_id": referred_by,
            "original_filename": sub.evidence.as_ref().map(|e| e.original_filename.clone()),
            "mime_type": sub.evidence.as_ref().map(|e| e.mime),
            "file_size": sub.evidence.as_ref().map(|e| e.size()),
        });
        let pending_email = (ChannelSpec::for_channel(sub.channel).duplicates
            == DuplicateStrategy::PendingEmail)
            .then(|| sub.email.clone());

        let payment = match self
            .store
            .insert_payment(NewPaymentRecord {
                principal_id: principal.id,
                subscription_id: None,
                plan_id: plan.id,
                kind: PaymentKind::Registration,
                amount,
                currency,
                channel: sub.channel,
                external_reference: sub.reference.clone(),
                status: PaymentStatus::Pending,
                evidence_filename,
                audit,
                pending_email,
                transaction_id,
                capture,
            })
            .await
        {
            Ok(p) => p,
            Err(e) => return Err(saga.abort(write_failure(e)).await),
        };
        saga.advance(Stage::Committed, None);

        log::info!(
            "{} registration: principal={} payment={} transaction={}",
            sub.channel,
            principal.id,
            payment.id,
            payment.transaction_id
        );
        Ok(Registered { principal, payment })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn transaction_ids_use_unambiguous_alphabet() {
        let store = MemoryStore::new();
        let id = new_transaction_id(&store).await.unwrap();
        assert!(id.starts_with("GNT-"));
        assert_eq!(id.len(), 12);
        assert!(id[4..].bytes().all(|b| TRANSACTION_ALPHABET.contains(&b)));
    }

    #[test]
    fn public_ids_are_twelve_hex_chars() {
        let id = new_public_id();
        assert_eq!(id.len(), 12);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }
}
