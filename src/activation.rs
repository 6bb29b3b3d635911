// src/activation.rs

use std::sync::Arc;

use chrono::{DateTime, Months, Utc};

use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::models::{AuditCapture, Channel, NewActivation, PaymentRecord, Plan};
use crate::provider::{within, BillingProvider};
use crate::registration::new_transaction_id;
use crate::store::{PaymentStore, StoreError, UniqueField};

#[derive(Debug, Clone)]
pub struct ActivationRequest {
    pub external_subscription_id: String,
    pub plan_name: String,
    pub principal_id: i32,
    /// Look the subscription up with the provider before activating. Off
    /// only for signed calls from the checkout backend.
    pub confirm_with_provider: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivationOutcome {
    pub subscription_id: i32,
    pub plan: String,
    pub expires_at: DateTime<Utc>,
    /// True when the subscription id had already been activated.
    pub replayed: bool,
}

/// One billing period after `from`.
pub fn period_end(from: DateTime<Utc>) -> AppResult<DateTime<Utc>> {
    from.checked_add_months(Months::new(1))
        .ok_or_else(|| AppError::Storage("subscription expiry out of range".into()))
}

pub struct Activator {
    store: Arc<dyn PaymentStore>,
    provider: Arc<dyn BillingProvider>,
    config: Arc<Config>,
}

impl Activator {
    pub fn new(
        store: Arc<dyn PaymentStore>,
        provider: Arc<dyn BillingProvider>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            store,
            provider,
            config,
        }
    }

    /// Activates a provider subscription. Idempotent per external subscription id.
    pub async fn activate(
        &self,
        req: ActivationRequest,
        capture: AuditCapture,
    ) -> AppResult<ActivationOutcome> {
        let plan = self
            .store
            .find_active_plan(&req.plan_name)
            .await?
            .ok_or_else(|| AppError::InvalidPlan(req.plan_name.clone()))?;

        if let Some(existing) = self
            .store
            .find_payment_by_reference(Channel::RecurringBilling, &req.external_subscription_id)
            .await?
        {
            return self.replay(&existing, req.principal_id).await;
        }

        self.store
            .get_principal(req.principal_id)
            .await?
            .ok_or(AppError::NotFound("principal"))?;

        if req.confirm_with_provider {
            self.confirm(&req.external_subscription_id, &plan).await?;
        }

        let started_at = Utc::now();
        let activation = NewActivation {
            principal_id: req.principal_id,
            plan: plan.clone(),
            external_subscription_id: req.external_subscription_id.clone(),
            started_at,
            expires_at: period_end(started_at)?,
            transaction_id: new_transaction_id(self.store.as_ref()).await?,
            capture,
        };

        match self.store.activate_subscription(activation).await {
            Ok(activated) => {
                log::info!(
                    "activated subscription {} ({}) for principal {}, cancelled {:?}",
                    activated.subscription.id,
                    plan.name,
                    req.principal_id,
                    activated.cancelled
                );
                Ok(ActivationOutcome {
                    subscription_id: activated.subscription.id,
                    plan: plan.name,
                    expires_at: activated.subscription.expires_at,
                    replayed: false,
                })
            }
            // Lost the race against a concurrent activation of the same id.
            Err(StoreError::Conflict(UniqueField::ExternalReference)) => {
                let winner = self
                    .store
                    .find_payment_by_reference(
                        Channel::RecurringBilling,
                        &req.external_subscription_id,
                    )
                    .await?
                    .ok_or(AppError::Duplicate(UniqueField::ExternalReference))?;
                self.replay(&winner, req.principal_id).await
            }
            Err(e) => Err(e.into()),
        }
    }

    /// The provider must report the subscription active and on the billing
    /// plan configured for `plan`.
    async fn confirm(&self, external_subscription_id: &str, plan: &Plan) -> AppResult<()> {
        let expected = self.config.provider_plan_id(&plan.name).ok_or_else(|| {
            AppError::Validation("Plan is not offered through the billing provider.".into())
        })?;
        let subscription = within(
            self.config.provider_timeout(),
            self.provider.subscription(external_subscription_id),
        )
        .await
        .map_err(|e| {
            log::warn!("subscription lookup for {external_subscription_id} failed: {e}");
            AppError::from(e)
        })?;

        if !subscription.status.eq_ignore_ascii_case("ACTIVE") {
            return Err(AppError::Validation(format!(
                "Subscription is not active with the provider (status: {}).",
                subscription.status
            )));
        }
        if subscription.plan_id.as_deref() != Some(expected) {
            log::warn!(
                "subscription {external_subscription_id} is on provider plan {:?}, expected {expected} for {}",
                subscription.plan_id,
                plan.name
            );
            return Err(AppError::Validation(
                "Subscription plan does not match the requested plan.".into(),
            ));
        }
        Ok(())
    }

    async fn replay(&self, payment: &PaymentRecord, principal_id: i32) -> AppResult<ActivationOutcome> {
        if payment.principal_id != principal_id {
            log::warn!(
                "activation of {} for principal {principal_id} refused, owned by {}",
                payment.external_reference,
                payment.principal_id
            );
            return Err(AppError::Duplicate(UniqueField::ExternalReference));
        }
        let subscription_id = payment
            .subscription_id
            .ok_or(AppError::Duplicate(UniqueField::ExternalReference))?;
        let subscription = self
            .store
            .get_subscription(subscription_id)
            .await?
            .ok_or(AppError::NotFound("subscription"))?;
        let plan = self
            .store
            .get_plan(subscription.plan_id)
            .await?
            .map(|p| p.name)
            .unwrap_or_default();

        log::info!(
            "activation replay for {} -> subscription {}",
            subscription.external_subscription_id,
            subscription.id
        );
        Ok(ActivationOutcome {
            subscription_id: subscription.id,
            plan,
            expires_at: subscription.expires_at,
            replayed: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn period_is_one_calendar_month() {
        let jan31 = Utc.with_ymd_and_hms(2025, 1, 31, 12, 0, 0).unwrap();
        let end = period_end(jan31).unwrap();
        assert_eq!(end, Utc.with_ymd_and_hms(2025, 2, 28, 12, 0, 0).unwrap());
    }
}
