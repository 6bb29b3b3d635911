// src/moderation.rs
//
// Admin verdicts on self-attested payments.

use std::sync::Arc;

use chrono::Utc;

use crate::error::{AppError, AppResult};
use crate::models::{PaymentRecord, PaymentStatus};
use crate::store::{AccountUpdate, PaymentStore, Verdict};

pub const DEFAULT_REJECTION_REASON: &str = "Rejected by admin";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModerationOutcome {
    Applied(PaymentStatus),
    /// Record was no longer pending; nothing changed.
    AlreadySettled(PaymentStatus),
}

pub struct Moderation {
    store: Arc<dyn PaymentStore>,
}

impl Moderation {
    pub fn new(store: Arc<dyn PaymentStore>) -> Self {
        Self { store }
    }

    pub async fn review_queue(&self) -> AppResult<Vec<PaymentRecord>> {
        Ok(self.store.list_review_queue().await?)
    }

    pub async fn approve(&self, payment_id: i32, admin_id: i32) -> AppResult<ModerationOutcome> {
        let payment = self.load(payment_id).await?;
        let plan_name = self.store.get_plan(payment.plan_id).await?.map(|p| p.name);
        let verdict = Verdict {
            status: PaymentStatus::Completed,
            verified_by: admin_id,
            verified_at: Utc::now(),
            rejection_reason: None,
            account: Some(AccountUpdate::completed(plan_name)),
        };
        if !self.store.record_verdict(payment_id, verdict).await? {
            return self.settled(payment_id).await;
        }

        log::info!("payment {payment_id} approved by admin {admin_id}");
        Ok(ModerationOutcome::Applied(PaymentStatus::Completed))
    }

    pub async fn reject(
        &self,
        payment_id: i32,
        admin_id: i32,
        reason: Option<String>,
    ) -> AppResult<ModerationOutcome> {
        self.load(payment_id).await?;
        let reason = reason
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| DEFAULT_REJECTION_REASON.to_string());
        let verdict = Verdict {
            status: PaymentStatus::Failed,
            verified_by: admin_id,
            verified_at: Utc::now(),
            rejection_reason: Some(reason),
            account: None,
        };
        if !self.store.record_verdict(payment_id, verdict).await? {
            return self.settled(payment_id).await;
        }

        log::info!("payment {payment_id} rejected by admin {admin_id}");
        Ok(ModerationOutcome::Applied(PaymentStatus::Failed))
    }

    async fn load(&self, payment_id: i32) -> AppResult<PaymentRecord> {
        self.store
            .get_payment(payment_id)
            .await?
            .ok_or(AppError::NotFound("payment"))
    }

    async fn settled(&self, payment_id: i32) -> AppResult<ModerationOutcome> {
        let current = self.load(payment_id).await?;
        Ok(ModerationOutcome::AlreadySettled(current.status))
    }
}
