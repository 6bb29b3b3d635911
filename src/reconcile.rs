// src/reconcile.rs
//
// On-demand status polling for machine-verifiable payments.

use std::sync::Arc;
use std::time::Duration;

use crate::error::{AppError, AppResult};
use crate::models::{PaymentRecord, PaymentStatus};
use crate::provider::{minor_units, within, BillingProvider, ProviderOrder};
use crate::store::{AccountUpdate, PaymentStore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusCheck {
    pub previous_status: PaymentStatus,
    pub current_status: PaymentStatus,
    pub changed: bool,
    pub message: String,
}

/// Provider order vocabulary to internal status. `None` leaves the stored
/// status untouched.
pub fn map_provider_status(raw: &str) -> Option<PaymentStatus> {
    match raw.to_ascii_uppercase().as_str() {
        "COMPLETED" => Some(PaymentStatus::Completed),
        "APPROVED" | "PAYER_ACTION_REQUIRED" | "CREATED" | "SAVED" | "PENDING" => {
            Some(PaymentStatus::Pending)
        }
        "VOIDED" | "DECLINED" => Some(PaymentStatus::Failed),
        _ => None,
    }
}

fn stored_status_message(status: PaymentStatus) -> &'static str {
    match status {
        PaymentStatus::Pending => "Payment is pending admin verification.",
        PaymentStatus::Completed => "Payment has been approved.",
        PaymentStatus::Failed => "Payment was rejected.",
        PaymentStatus::Cancelled => "Payment was cancelled.",
    }
}

fn unchanged(payment: &PaymentRecord, message: impl Into<String>) -> StatusCheck {
    StatusCheck {
        previous_status: payment.status,
        current_status: payment.status,
        changed: false,
        message: message.into(),
    }
}

/// Whether the provider's order is for the amount and currency on the record.
fn order_matches(order: &ProviderOrder, payment: &PaymentRecord) -> Option<bool> {
    let amount = minor_units(order.amount.as_deref()?)?;
    let currency = order.currency.as_deref()?;
    Some(
        Some(amount) == minor_units(&payment.amount)
            && currency.eq_ignore_ascii_case(&payment.currency),
    )
}

pub struct Reconciler {
    store: Arc<dyn PaymentStore>,
    provider: Arc<dyn BillingProvider>,
    timeout: Duration,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn PaymentStore>,
        provider: Arc<dyn BillingProvider>,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            provider,
            timeout,
        }
    }

    /// Re-derives the status of `payment`. Safe to call repeatedly.
    pub async fn check(&self, payment: &PaymentRecord) -> AppResult<StatusCheck> {
        if !payment.channel.is_machine_verifiable() || payment.status.is_terminal() {
            return Ok(unchanged(payment, stored_status_message(payment.status)));
        }

        let order = within(
            self.timeout,
            self.provider.order(&payment.external_reference),
        )
        .await
        .map_err(|e| {
            log::warn!("status check for payment {} failed: {e}", payment.id);
            AppError::from(e)
        })?;
        let raw = order.status.as_str();

        let Some(mut mapped) = map_provider_status(raw) else {
            return Ok(unchanged(payment, format!("Provider status: {raw}")));
        };
        if mapped == payment.status {
            return Ok(unchanged(payment, format!("Payment is still {}.", payment.status)));
        }

        let mut message = None;
        if mapped == PaymentStatus::Completed {
            match order_matches(&order, payment) {
                Some(true) => {}
                Some(false) => {
                    log::warn!(
                        "payment {} order {} settled for {:?} {:?}, expected {} {}",
                        payment.id,
                        order.id,
                        order.amount,
                        order.currency,
                        payment.amount,
                        payment.currency
                    );
                    mapped = PaymentStatus::Failed;
                    message = Some("Order amount does not match this payment.".to_string());
                }
                None => {
                    return Ok(unchanged(payment, "Order amount could not be confirmed."));
                }
            }
        }

        let account = (mapped == PaymentStatus::Completed).then(|| AccountUpdate::completed(None));
        if !self.store.settle_payment(payment.id, mapped, account).await? {
            // Settled concurrently; report what is stored now.
            let current = self
                .store
                .get_payment(payment.id)
                .await?
                .ok_or(AppError::NotFound("payment"))?;
            return Ok(StatusCheck {
                previous_status: payment.status,
                current_status: current.status,
                changed: current.status != payment.status,
                message: stored_status_message(current.status).to_string(),
            });
        }

        log::info!(
            "payment {} reconciled {} -> {} (provider {raw})",
            payment.id,
            payment.status,
            mapped
        );
        let message = message.unwrap_or_else(|| match mapped {
            PaymentStatus::Completed => "Payment confirmed by provider.".to_string(),
            PaymentStatus::Failed => format!("Payment was not completed (provider status: {raw})."),
            other => format!("Payment status updated to {other}."),
        });
        Ok(StatusCheck {
            previous_status: payment.status,
            current_status: mapped,
            changed: true,
            message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_vocabulary_mapping() {
        assert_eq!(map_provider_status("COMPLETED"), Some(PaymentStatus::Completed));
        assert_eq!(map_provider_status("approved"), Some(PaymentStatus::Pending));
        assert_eq!(map_provider_status("PAYER_ACTION_REQUIRED"), Some(PaymentStatus::Pending));
        assert_eq!(map_provider_status("VOIDED"), Some(PaymentStatus::Failed));
        assert_eq!(map_provider_status("DECLINED"), Some(PaymentStatus::Failed));
        assert_eq!(map_provider_status("REFUNDED"), None);
    }

    fn record(amount: &str, currency: &str) -> PaymentRecord {
        use crate::models::{AuditCapture, Channel, PaymentKind};
        PaymentRecord {
            id: 1,
            principal_id: 1,
            subscription_id: None,
            plan_id: 1,
            kind: PaymentKind::Registration,
            amount: amount.into(),
            currency: currency.into(),
            channel: Channel::RecurringBilling,
            external_reference: "ORDER-1".into(),
            status: PaymentStatus::Pending,
            evidence_filename: None,
            audit: serde_json::Value::Null,
            pending_email: None,
            review_requested: false,
            review_requested_at: None,
            transaction_id: "GNT-1".into(),
            capture: AuditCapture::default(),
            verified_by: None,
            verified_at: None,
            rejection_reason: None,
            created_at: chrono::Utc::now(),
        }
    }

    fn order(amount: Option<&str>, currency: Option<&str>) -> ProviderOrder {
        ProviderOrder {
            id: "ORDER-1".into(),
            status: "COMPLETED".into(),
            amount: amount.map(str::to_string),
            currency: currency.map(str::to_string),
            capture_id: None,
        }
    }

    #[test]
    fn order_amount_is_compared_in_minor_units() {
        let payment = record("500.00", "PHP");
        assert_eq!(order_matches(&order(Some("500"), Some("php")), &payment), Some(true));
        assert_eq!(order_matches(&order(Some("0.01"), Some("PHP")), &payment), Some(false));
        assert_eq!(order_matches(&order(Some("500.00"), Some("USD")), &payment), Some(false));
        assert_eq!(order_matches(&order(None, Some("PHP")), &payment), None);
        assert_eq!(order_matches(&order(Some("500.00"), None), &payment), None);
    }
}
