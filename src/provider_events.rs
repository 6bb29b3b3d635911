// src/provider_events.rs
//
// Verified provider webhook deliveries applied to local state. Each event id
// is recorded once it has been handled; a failed handler leaves it
// unrecorded so the provider's redelivery runs it again.

use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;

use crate::error::AppResult;
use crate::intake::normalize_order_id;
use crate::models::{Channel, PaymentStatus, SubscriptionStatus};
use crate::reconcile::Reconciler;
use crate::store::{PaymentStore, SubscriptionEnd};

/// Plan a principal falls back to when its paid subscription ends.
pub const FALLBACK_PLAN: &str = "free";

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderEvent {
    pub id: String,
    pub event_type: String,
    #[serde(default)]
    pub resource: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    Applied,
    /// Already handled under the same event id.
    Duplicate,
    /// Event type or subject this service does not track.
    Ignored,
}

/// Local effect of an event type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    EndSubscription {
        status: SubscriptionStatus,
        downgrade: bool,
        /// Resource field holding the provider subscription id.
        id_field: &'static str,
    },
    ReconcileOrder,
}

fn action_for(event_type: &str) -> Option<Action> {
    let end = |status, downgrade, id_field| {
        Some(Action::EndSubscription {
            status,
            downgrade,
            id_field,
        })
    };
    match event_type {
        "BILLING.SUBSCRIPTION.CANCELLED" | "BILLING.SUBSCRIPTION.EXPIRED" => {
            end(SubscriptionStatus::Cancelled, true, "id")
        }
        "BILLING.SUBSCRIPTION.SUSPENDED" => end(SubscriptionStatus::Suspended, true, "id"),
        // Failed renewal charges suspend without taking the plan away; the
        // provider follows up with SUSPENDED or CANCELLED if retries run out.
        "BILLING.SUBSCRIPTION.PAYMENT.FAILED" => end(SubscriptionStatus::Suspended, false, "id"),
        "PAYMENT.SALE.DENIED" | "PAYMENT.SALE.FAILED" => {
            end(SubscriptionStatus::Suspended, false, "billing_agreement_id")
        }
        "PAYMENT.CAPTURE.COMPLETED" | "PAYMENT.CAPTURE.DENIED" => Some(Action::ReconcileOrder),
        _ => None,
    }
}

fn resource_str<'a>(resource: &'a Value, pointer: &str) -> Option<&'a str> {
    resource
        .pointer(pointer)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

pub struct ProviderEvents {
    store: Arc<dyn PaymentStore>,
    reconciler: Reconciler,
}

impl ProviderEvents {
    pub fn new(store: Arc<dyn PaymentStore>, reconciler: Reconciler) -> Self {
        Self { store, reconciler }
    }

    pub async fn process(&self, event: &ProviderEvent) -> AppResult<EventOutcome> {
        if self.store.webhook_event_seen(&event.id).await? {
            log::info!("provider event {} already handled", event.id);
            return Ok(EventOutcome::Duplicate);
        }

        let outcome = match action_for(&event.event_type) {
            Some(action) => self.apply(action, event).await?,
            None => EventOutcome::Ignored,
        };

        if !self
            .store
            .record_webhook_event(&event.id, &event.event_type, Utc::now())
            .await?
        {
            // A concurrent delivery of the same event got there first.
            return Ok(EventOutcome::Duplicate);
        }
        log::info!(
            "provider event {} ({}) -> {:?}",
            event.id,
            event.event_type,
            outcome
        );
        Ok(outcome)
    }

    async fn apply(&self, action: Action, event: &ProviderEvent) -> AppResult<EventOutcome> {
        match action {
            Action::EndSubscription {
                status,
                downgrade,
                id_field,
            } => {
                let Some(subscription_id) = resource_str(&event.resource, &format!("/{id_field}"))
                else {
                    log::warn!("provider event {} has no {id_field}", event.id);
                    return Ok(EventOutcome::Ignored);
                };
                let end = SubscriptionEnd {
                    status,
                    at: Utc::now(),
                    downgrade_to: downgrade.then(|| FALLBACK_PLAN.to_string()),
                };
                match self.store.end_subscription(subscription_id, end).await? {
                    Some(sub) => {
                        log::info!(
                            "subscription {} of principal {} is now {}",
                            subscription_id,
                            sub.principal_id,
                            sub.status.as_str()
                        );
                        Ok(EventOutcome::Applied)
                    }
                    None => Ok(EventOutcome::Ignored),
                }
            }
            Action::ReconcileOrder => {
                let Some(order_id) = resource_str(
                    &event.resource,
                    "/supplementary_data/related_ids/order_id",
                )
                .and_then(|raw| normalize_order_id(raw).ok()) else {
                    return Ok(EventOutcome::Ignored);
                };
                let Some(payment) = self
                    .store
                    .find_payment_by_reference(Channel::RecurringBilling, &order_id)
                    .await?
                    .filter(|p| p.status == PaymentStatus::Pending)
                else {
                    return Ok(EventOutcome::Ignored);
                };
                let check = self.reconciler.check(&payment).await?;
                log::info!(
                    "order {order_id} event moved payment {} to {}",
                    payment.id,
                    check.current_status
                );
                Ok(EventOutcome::Applied)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_types_map_to_actions() {
        assert_eq!(
            action_for("BILLING.SUBSCRIPTION.CANCELLED"),
            Some(Action::EndSubscription {
                status: SubscriptionStatus::Cancelled,
                downgrade: true,
                id_field: "id"
            })
        );
        assert_eq!(
            action_for("PAYMENT.SALE.DENIED"),
            Some(Action::EndSubscription {
                status: SubscriptionStatus::Suspended,
                downgrade: false,
                id_field: "billing_agreement_id"
            })
        );
        assert_eq!(action_for("PAYMENT.CAPTURE.COMPLETED"), Some(Action::ReconcileOrder));
        assert_eq!(action_for("CHECKOUT.ORDER.APPROVED"), None);
    }

    #[test]
    fn event_resource_is_optional() {
        let event: ProviderEvent =
            serde_json::from_str(r#"{"id":"WH-1","event_type":"X"}"#).unwrap();
        assert!(event.resource.is_null());
        assert_eq!(resource_str(&event.resource, "/id"), None);
    }
}
