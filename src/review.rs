// src/review.rs

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::error::{AppError, AppResult};
use crate::models::{PaymentRecord, PaymentStatus};
use crate::store::{PaymentStore, QueueStats};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReviewOutcome {
    Requested { at: DateTime<Utc> },
    AlreadyRequested,
    /// The record left `pending` and can no longer be queued.
    Closed(PaymentStatus),
}

impl ReviewOutcome {
    pub fn message(&self) -> String {
        match self {
            ReviewOutcome::Requested { .. } => {
                "Review requested. An admin will verify your payment shortly.".to_string()
            }
            ReviewOutcome::AlreadyRequested => "Review has already been requested.".to_string(),
            ReviewOutcome::Closed(status) => {
                format!("Payment is already {status}; no review needed.")
            }
        }
    }
}

pub struct ReviewQueue {
    store: Arc<dyn PaymentStore>,
}

impl ReviewQueue {
    pub fn new(store: Arc<dyn PaymentStore>) -> Self {
        Self { store }
    }

    /// Loads a payment and checks that `principal_id` owns it.
    pub async fn owned_payment(&self, payment_id: i32, principal_id: i32) -> AppResult<PaymentRecord> {
        let payment = self
            .store
            .get_payment(payment_id)
            .await?
            .ok_or(AppError::NotFound("payment"))?;
        if payment.principal_id != principal_id {
            return Err(AppError::Authorization);
        }
        Ok(payment)
    }

    pub async fn request_review(&self, payment_id: i32, principal_id: i32) -> AppResult<ReviewOutcome> {
        let payment = self.owned_payment(payment_id, principal_id).await?;
        if payment.status != PaymentStatus::Pending {
            return Ok(ReviewOutcome::Closed(payment.status));
        }
        if payment.review_requested {
            return Ok(ReviewOutcome::AlreadyRequested);
        }

        let at = Utc::now();
        if self.store.flag_for_review(payment_id, at).await? {
            log::info!("review requested for payment {payment_id}");
            return Ok(ReviewOutcome::Requested { at });
        }

        // Lost a race with another request or a settlement.
        let current = self
            .store
            .get_payment(payment_id)
            .await?
            .ok_or(AppError::NotFound("payment"))?;
        Ok(if current.status != PaymentStatus::Pending {
            ReviewOutcome::Closed(current.status)
        } else {
            ReviewOutcome::AlreadyRequested
        })
    }

    pub async fn queue_stats(&self, payment_id: i32) -> AppResult<QueueStats> {
        Ok(self.store.review_queue_stats(payment_id).await?)
    }
}
