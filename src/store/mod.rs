//! Persistence seam for principals, plans, payment records and subscriptions.
//!
//! `PgStore` is the production backend. `MemoryStore` keeps the same
//! uniqueness and transition rules in process and is used for local runs
//! without a database and for tests.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{
    AccountPaymentStatus, Activated, Channel, NewActivation, NewPaymentRecord, NewPrincipal,
    PaymentRecord, PaymentStatus, Plan, Principal, SubscriptionStatus, UserSubscription,
};

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Column guarded by a unique constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UniqueField {
    Email,
    Handle,
    Phone,
    /// Crypto tx hash or provider order/subscription id.
    ExternalReference,
    /// Open submission for the same email on a self-attested channel.
    PendingEmail,
    TransactionId,
    /// Second active subscription for a principal.
    ActiveSubscription,
}

impl UniqueField {
    pub fn message(self) -> &'static str {
        match self {
            UniqueField::Email => "User with this email already exists.",
            UniqueField::Handle => "Username already taken.",
            UniqueField::Phone => "Phone number already registered.",
            UniqueField::ExternalReference => "This transaction has already been submitted.",
            UniqueField::PendingEmail => "A pending registration with this email already exists.",
            UniqueField::TransactionId => "Transaction id collision.",
            UniqueField::ActiveSubscription => "Principal already has an active subscription.",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("unique constraint violated: {0:?}")]
    Conflict(UniqueField),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Position of a payment in the manual review queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub pending_reviews: i64,
    pub position: Option<i64>,
}

/// Principal change written in the same unit as a payment settlement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountUpdate {
    pub status: AccountPaymentStatus,
    /// Replaces the principal's plan when set.
    pub plan_name: Option<String>,
}

impl AccountUpdate {
    pub fn completed(plan_name: Option<String>) -> Self {
        Self {
            status: AccountPaymentStatus::Completed,
            plan_name,
        }
    }
}

/// Outcome of a moderation decision applied to a pending payment.
#[derive(Debug, Clone)]
pub struct Verdict {
    pub status: PaymentStatus,
    pub verified_by: i32,
    pub verified_at: DateTime<Utc>,
    pub rejection_reason: Option<String>,
    pub account: Option<AccountUpdate>,
}

/// How a subscription leaves the active state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionEnd {
    /// `Cancelled` or `Suspended`.
    pub status: SubscriptionStatus,
    pub at: DateTime<Utc>,
    /// Plan the principal drops to when the ended subscription was its active one.
    pub downgrade_to: Option<String>,
}

#[async_trait]
pub trait PaymentStore: Send + Sync {
    // Principals
    async fn principal_exists(&self, field: UniqueField, value: &str) -> StoreResult<bool>;
    async fn find_principal_id_by_handle(&self, handle: &str) -> StoreResult<Option<i32>>;
    async fn find_principal_id_by_public_id(&self, public_id: &str) -> StoreResult<Option<i32>>;
    async fn get_principal(&self, id: i32) -> StoreResult<Option<Principal>>;
    async fn insert_principal(&self, principal: NewPrincipal) -> StoreResult<Principal>;
    async fn delete_principal(&self, id: i32) -> StoreResult<()>;

    // Plans
    async fn find_active_plan(&self, name: &str) -> StoreResult<Option<Plan>>;
    async fn get_plan(&self, id: i32) -> StoreResult<Option<Plan>>;

    // Payment records
    async fn reference_exists(&self, channel: Channel, reference: &str) -> StoreResult<bool>;
    async fn pending_email_exists(&self, channel: Channel, email: &str) -> StoreResult<bool>;
    async fn transaction_id_exists(&self, transaction_id: &str) -> StoreResult<bool>;
    async fn insert_payment(&self, payment: NewPaymentRecord) -> StoreResult<PaymentRecord>;
    async fn get_payment(&self, id: i32) -> StoreResult<Option<PaymentRecord>>;
    async fn find_payment_by_reference(
        &self,
        channel: Channel,
        reference: &str,
    ) -> StoreResult<Option<PaymentRecord>>;
    async fn find_payment_by_evidence(&self, filename: &str) -> StoreResult<Option<PaymentRecord>>;

    /// Moves a pending record to `status` and applies `account` to its
    /// principal, both or neither. Returns false when the record had already
    /// left `pending`.
    async fn settle_payment(
        &self,
        id: i32,
        status: PaymentStatus,
        account: Option<AccountUpdate>,
    ) -> StoreResult<bool>;

    /// Applies an admin verdict, including its account update, to a pending
    /// record; false when already settled.
    async fn record_verdict(&self, id: i32, verdict: Verdict) -> StoreResult<bool>;

    /// Sets the review flag on a pending, not yet flagged record. Returns
    /// false when either condition did not hold.
    async fn flag_for_review(&self, id: i32, at: DateTime<Utc>) -> StoreResult<bool>;
    async fn review_queue_stats(&self, id: i32) -> StoreResult<QueueStats>;
    async fn list_review_queue(&self) -> StoreResult<Vec<PaymentRecord>>;

    // Subscriptions
    /// Cancels every active subscription of the principal, inserts the new
    /// active one with its completed payment and updates the principal, all
    /// or nothing.
    async fn activate_subscription(&self, activation: NewActivation) -> StoreResult<Activated>;
    async fn get_subscription(&self, id: i32) -> StoreResult<Option<UserSubscription>>;
    async fn list_subscriptions(&self, principal_id: i32) -> StoreResult<Vec<UserSubscription>>;

    /// Ends the subscription known to the provider as `external_id`. Only an
    /// active subscription changes state and only then is the principal
    /// downgraded. `None` when the id is unknown.
    async fn end_subscription(
        &self,
        external_id: &str,
        end: SubscriptionEnd,
    ) -> StoreResult<Option<UserSubscription>>;

    // Provider webhook deliveries
    async fn webhook_event_seen(&self, event_id: &str) -> StoreResult<bool>;
    /// Records a processed delivery; false when it was already recorded.
    async fn record_webhook_event(
        &self,
        event_id: &str,
        event_type: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<bool>;
}
