// src/checkout.rs
//
// Server-side provider orders for plan purchases. The price always comes from
// the plan catalogue; a client-quoted amount is only compared against it.

use std::sync::Arc;

use chrono::Utc;

use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::intake::normalize_order_id;
use crate::models::{PaymentStatus, Plan};
use crate::provider::{minor_units, within, BillingProvider, OrderRequest, ProviderOrder};
use crate::reconcile::map_provider_status;
use crate::store::PaymentStore;

#[derive(Debug, Clone, Default)]
pub struct NewOrder {
    pub plan: Option<String>,
    /// Amount the checkout page displayed, if it sent one.
    pub amount: Option<String>,
    pub currency: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Captured {
    pub order: ProviderOrder,
    pub status: PaymentStatus,
    pub message: String,
}

fn same_amount(a: &str, b: &str) -> bool {
    matches!((minor_units(a), minor_units(b)), (Some(x), Some(y)) if x == y)
}

pub struct Checkout {
    store: Arc<dyn PaymentStore>,
    provider: Arc<dyn BillingProvider>,
    config: Arc<Config>,
}

impl Checkout {
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

    async fn plan(&self, requested: Option<&str>) -> AppResult<Plan> {
        let name = requested
            .map(|p| p.trim().to_lowercase())
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| self.config.default_plan.clone());
        self.store
            .find_active_plan(&name)
            .await?
            .ok_or(AppError::InvalidPlan(name))
    }

    /// Opens a provider order for the plan price.
    pub async fn create_order(&self, req: NewOrder) -> AppResult<ProviderOrder> {
        let plan = self.plan(req.plan.as_deref()).await?;

        if let Some(quoted) = req.amount.as_deref().map(str::trim).filter(|a| !a.is_empty()) {
            if !same_amount(quoted, &plan.price) {
                log::warn!("order for plan {} quoted {quoted}, price is {}", plan.name, plan.price);
                return Err(AppError::Validation(format!(
                    "Amount mismatch. The {} plan costs {} {}.",
                    plan.name, plan.price, plan.currency
                )));
            }
        }
        if let Some(quoted) = req.currency.as_deref().map(str::trim).filter(|c| !c.is_empty()) {
            if !quoted.eq_ignore_ascii_case(&plan.currency) {
                return Err(AppError::Validation(format!(
                    "Currency mismatch. The {} plan is billed in {}.",
                    plan.name, plan.currency
                )));
            }
        }

        let request = OrderRequest {
            reference_id: format!("REG-{}-{}", plan.id, Utc::now().timestamp()),
            description: format!("{} plan registration", plan.name),
            amount: plan.price.clone(),
            currency: plan.currency.clone(),
        };
        let order = within(self.config.provider_timeout(), self.provider.create_order(&request))
            .await
            .map_err(|e| {
                log::warn!("order creation for plan {} failed: {e}", plan.name);
                AppError::from(e)
            })?;

        log::info!("created provider order {} for plan {}", order.id, plan.name);
        Ok(order)
    }

    /// Captures an approved order and checks it was paid at the plan price.
    pub async fn capture(&self, order_id: &str, plan: Option<&str>) -> AppResult<Captured> {
        let order_id = normalize_order_id(order_id)?;
        let plan = self.plan(plan).await?;

        let order = within(self.config.provider_timeout(), self.provider.capture_order(&order_id))
            .await
            .map_err(|e| {
                log::warn!("capture of order {order_id} failed: {e}");
                AppError::from(e)
            })?;

        match map_provider_status(&order.status) {
            Some(PaymentStatus::Completed) => {
                let paid = match (order.amount.as_deref(), order.currency.as_deref()) {
                    (Some(amount), Some(currency)) => {
                        same_amount(amount, &plan.price)
                            && currency.eq_ignore_ascii_case(&plan.currency)
                    }
                    _ => false,
                };
                if !paid {
                    log::warn!(
                        "order {order_id} captured {:?} {:?}, plan {} costs {} {}",
                        order.amount,
                        order.currency,
                        plan.name,
                        plan.price,
                        plan.currency
                    );
                    return Err(AppError::Validation(
                        "Captured amount does not match the plan price.".into(),
                    ));
                }
                log::info!("order {order_id} captured for plan {}", plan.name);
                Ok(Captured {
                    order,
                    status: PaymentStatus::Completed,
                    message: "Payment captured.".into(),
                })
            }
            Some(PaymentStatus::Failed) => Err(AppError::Validation(format!(
                "Payment was declined (provider status: {}).",
                order.status
            ))),
            _ => {
                let message = format!("Payment is pending with the provider (status: {}).", order.status);
                Ok(Captured {
                    order,
                    status: PaymentStatus::Pending,
                    message,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn amounts_compare_in_minor_units() {
        assert!(same_amount("500", "500.00"));
        assert!(same_amount("1000.0", "1000.00"));
        assert!(!same_amount("499.99", "500.00"));
        assert!(!same_amount("abc", "abc"));
    }
}
