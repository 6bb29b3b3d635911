// src/models.rs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use utoipa::ToSchema;

/// Payment method a submission arrived through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    BankTransfer,
    MobileWallet,
    CryptoOnchain,
    RecurringBilling,
}

impl Channel {
    pub const ALL: [Channel; 4] = [
        Channel::BankTransfer,
        Channel::MobileWallet,
        Channel::CryptoOnchain,
        Channel::RecurringBilling,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Channel::BankTransfer => "bank_transfer",
            Channel::MobileWallet => "mobile_wallet",
            Channel::CryptoOnchain => "crypto_onchain",
            Channel::RecurringBilling => "recurring_billing",
        }
    }

    /// Segment used in `POST /payments/{channel}`.
    pub fn from_path_segment(segment: &str) -> Option<Self> {
        match segment {
            "bank" => Some(Channel::BankTransfer),
            "wallet" => Some(Channel::MobileWallet),
            "crypto" => Some(Channel::CryptoOnchain),
            "provider" => Some(Channel::RecurringBilling),
            _ => None,
        }
    }

    /// Directory name receipts for this channel are kept under.
    pub fn evidence_dir(self) -> &'static str {
        match self {
            Channel::BankTransfer => "bank-transfer",
            Channel::MobileWallet => "mobile-wallet",
            Channel::CryptoOnchain => "crypto",
            Channel::RecurringBilling => "recurring-billing",
        }
    }

    /// Whether the status of a payment can be polled from the billing provider.
    pub fn is_machine_verifiable(self) -> bool {
        matches!(self, Channel::RecurringBilling)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Channel::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| format!("unknown channel: {s}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
    Cancelled,
}

impl PaymentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, PaymentStatus::Pending)
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PaymentStatus::Pending),
            "completed" => Ok(PaymentStatus::Completed),
            "failed" => Ok(PaymentStatus::Failed),
            "cancelled" => Ok(PaymentStatus::Cancelled),
            other => Err(format!("unknown payment status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum PaymentKind {
    Registration,
    Renewal,
}

impl PaymentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PaymentKind::Registration => "registration",
            PaymentKind::Renewal => "renewal",
        }
    }
}

impl FromStr for PaymentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "registration" => Ok(PaymentKind::Registration),
            "renewal" => Ok(PaymentKind::Renewal),
            other => Err(format!("unknown payment kind: {other}")),
        }
    }
}

/// Payment standing of an account, independent of any single record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum AccountPaymentStatus {
    None,
    Pending,
    Completed,
}

impl AccountPaymentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AccountPaymentStatus::None => "none",
            AccountPaymentStatus::Pending => "pending",
            AccountPaymentStatus::Completed => "completed",
        }
    }
}

impl FromStr for AccountPaymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(AccountPaymentStatus::None),
            "pending" => Ok(AccountPaymentStatus::Pending),
            "completed" => Ok(AccountPaymentStatus::Completed),
            other => Err(format!("unknown account payment status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Member,
    Admin,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Member => "member",
            Role::Admin => "admin",
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "member" => Ok(Role::Member),
            "admin" => Ok(Role::Admin),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Cancelled,
    /// Provider reported a failed renewal charge.
    Suspended,
}

impl SubscriptionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Cancelled => "cancelled",
            SubscriptionStatus::Suspended => "suspended",
        }
    }
}

impl FromStr for SubscriptionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(SubscriptionStatus::Active),
            "cancelled" => Ok(SubscriptionStatus::Cancelled),
            "suspended" => Ok(SubscriptionStatus::Suspended),
            other => Err(format!("unknown subscription status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Principal {
    pub id: i32,
    pub email: String,
    pub handle: String,
    pub full_name: String,
    pub phone: String,
    pub country: String,
    pub referred_by: i32,
    pub public_id: String,
    pub payment_status: AccountPaymentStatus,
    pub role: Role,
    pub subscription_plan: Option<String>,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewPrincipal {
    pub email: String,
    pub handle: String,
    pub full_name: String,
    pub phone: String,
    pub country: String,
    pub referred_by: i32,
    pub public_id: String,
    pub password_hash: String,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct Plan {
    pub id: i32,
    pub name: String,
    pub price: String,
    pub currency: String,
    pub is_active: bool,
}

/// Request metadata stored with every payment for fraud review.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct AuditCapture {
    pub client_address: Option<String>,
    pub user_agent: Option<String>,
    #[schema(value_type = Object)]
    pub device_info: Option<serde_json::Value>,
    pub geo_country: Option<String>,
    pub geo_city: Option<String>,
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PaymentRecord {
    pub id: i32,
    pub principal_id: i32,
    pub subscription_id: Option<i32>,
    pub plan_id: i32,
    pub kind: PaymentKind,
    pub amount: String,
    pub currency: String,
    pub channel: Channel,
    pub external_reference: String,
    pub status: PaymentStatus,
    pub evidence_filename: Option<String>,
    pub audit: serde_json::Value,
    #[serde(skip_serializing)]
    pub pending_email: Option<String>,
    pub review_requested: bool,
    pub review_requested_at: Option<DateTime<Utc>>,
    pub transaction_id: String,
    #[serde(flatten)]
    pub capture: AuditCapture,
    pub verified_by: Option<i32>,
    pub verified_at: Option<DateTime<Utc>>,
    pub rejection_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl PaymentRecord {
    /// Whether this record currently sits in the manual review queue.
    pub fn is_queued_for_review(&self) -> bool {
        self.review_requested && self.status == PaymentStatus::Pending
    }
}

#[derive(Debug, Clone)]
pub struct NewPaymentRecord {
    pub principal_id: i32,
    pub subscription_id: Option<i32>,
    pub plan_id: i32,
    pub kind: PaymentKind,
    pub amount: String,
    pub currency: String,
    pub channel: Channel,
    pub external_reference: String,
    pub status: PaymentStatus,
    pub evidence_filename: Option<String>,
    pub audit: serde_json::Value,
    pub pending_email: Option<String>,
    pub transaction_id: String,
    pub capture: AuditCapture,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserSubscription {
    pub id: i32,
    pub principal_id: i32,
    pub plan_id: i32,
    pub status: SubscriptionStatus,
    pub started_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub channel: Channel,
    pub external_subscription_id: String,
    pub auto_renew: bool,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Everything the store needs to switch a principal onto a new subscription.
#[derive(Debug, Clone)]
pub struct NewActivation {
    pub principal_id: i32,
    pub plan: Plan,
    pub external_subscription_id: String,
    pub started_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub transaction_id: String,
    pub capture: AuditCapture,
}

#[derive(Debug, Clone)]
pub struct Activated {
    pub subscription: UserSubscription,
    pub payment: PaymentRecord,
    pub cancelled: Vec<i32>,
}
