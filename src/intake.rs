// src/intake.rs
//
// Field, format and upload validation for registration submissions. One
// pipeline for every channel, parametrized by `ChannelSpec`.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::{AppError, AppResult};
use crate::evidence::{sniff, MAX_EVIDENCE_BYTES};
use crate::models::Channel;

static TX_HASH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^0x[0-9a-fA-F]{64}$").expect("valid tx hash regex"));

static ORDER_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Z0-9-]{1,64}$").expect("valid order id regex"));

static AMOUNT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{1,10}(\.\d{1,2})?$").expect("valid amount regex"));

const IDENTITY_FIELDS: [&str; 5] = ["username", "email", "password", "country", "phone"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvidencePolicy {
    Optional,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceFormat {
    FreeText,
    TxHash,
    /// Provider order id: upper-case letters, digits and dashes.
    OrderId,
}

/// How a channel's submissions are checked against earlier ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateStrategy {
    /// Reference must be unique across all records of the channel.
    ExactReference,
    /// At most one pending record per normalized email in the channel.
    PendingEmail,
}

#[derive(Debug, Clone, Copy)]
pub struct ChannelSpec {
    pub channel: Channel,
    pub reference_field: &'static str,
    pub evidence_field: &'static str,
    pub reference_format: ReferenceFormat,
    pub evidence: EvidencePolicy,
    pub duplicates: DuplicateStrategy,
}

static SPECS: [ChannelSpec; 4] = [
    ChannelSpec {
        channel: Channel::BankTransfer,
        reference_field: "bank_reference",
        evidence_field: "bank_receipt",
        reference_format: ReferenceFormat::FreeText,
        evidence: EvidencePolicy::Optional,
        duplicates: DuplicateStrategy::PendingEmail,
    },
    ChannelSpec {
        channel: Channel::MobileWallet,
        reference_field: "wallet_reference",
        evidence_field: "wallet_receipt",
        reference_format: ReferenceFormat::FreeText,
        evidence: EvidencePolicy::Optional,
        duplicates: DuplicateStrategy::PendingEmail,
    },
    ChannelSpec {
        channel: Channel::CryptoOnchain,
        reference_field: "crypto_txhash",
        evidence_field: "crypto_receipt",
        reference_format: ReferenceFormat::TxHash,
        evidence: EvidencePolicy::Optional,
        duplicates: DuplicateStrategy::ExactReference,
    },
    ChannelSpec {
        channel: Channel::RecurringBilling,
        reference_field: "order_id",
        evidence_field: "receipt",
        reference_format: ReferenceFormat::OrderId,
        evidence: EvidencePolicy::Rejected,
        duplicates: DuplicateStrategy::ExactReference,
    },
];

impl ChannelSpec {
    pub fn for_channel(channel: Channel) -> &'static ChannelSpec {
        match channel {
            Channel::BankTransfer => &SPECS[0],
            Channel::MobileWallet => &SPECS[1],
            Channel::CryptoOnchain => &SPECS[2],
            Channel::RecurringBilling => &SPECS[3],
        }
    }

    /// Multipart file fields this channel reads a receipt from.
    pub fn accepts_evidence_field(&self, name: &str) -> bool {
        name == self.evidence_field || name == "receipt"
    }
}

/// Canonical provider order id, or a validation error naming the format.
pub fn normalize_order_id(raw: &str) -> AppResult<String> {
    let id = raw.trim().to_ascii_uppercase();
    if !ORDER_ID.is_match(&id) {
        return Err(AppError::Validation(
            "Invalid order id. Use the id shown by the payment provider.".into(),
        ));
    }
    Ok(id)
}

/// A file part from the multipart body.
#[derive(Debug, Clone)]
pub struct Upload {
    pub field: String,
    pub filename: String,
    pub bytes: Vec<u8>,
}

/// Upload that passed content sniffing and the size limit.
#[derive(Debug, Clone)]
pub struct EvidenceUpload {
    pub original_filename: String,
    pub mime: &'static str,
    pub extension: &'static str,
    pub bytes: Vec<u8>,
}

impl EvidenceUpload {
    pub fn size(&self) -> usize {
        self.bytes.len()
    }
}

/// A submission that passed every stateless check.
#[derive(Debug, Clone)]
pub struct Submission {
    pub channel: Channel,
    pub handle: String,
    pub email: String,
    pub password: String,
    pub full_name: String,
    pub phone: String,
    pub country: String,
    pub reference: String,
    pub sponsor: Option<String>,
    pub plan_name: String,
    pub amount: Option<String>,
    pub currency: Option<String>,
    pub evidence: Option<EvidenceUpload>,
}

pub fn normalize_email(raw: &str) -> String {
    raw.trim().to_lowercase()
}

fn looks_like_email(email: &str) -> bool {
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && !email.chars().any(char::is_whitespace)
}

fn field<'a>(fields: &'a HashMap<String, String>, names: &[&str]) -> Option<&'a str> {
    names
        .iter()
        .filter_map(|n| fields.get(*n))
        .map(|v| v.trim())
        .find(|v| !v.is_empty())
}

fn full_name(fields: &HashMap<String, String>) -> String {
    let parts: Vec<&str> = [
        field(fields, &["firstname", "firstName"]),
        field(fields, &["middlename", "middleName"]),
        field(fields, &["lastname", "lastName"]),
    ]
    .into_iter()
    .flatten()
    .collect();

    if parts.is_empty() {
        field(fields, &["fullname"]).unwrap_or_default().to_string()
    } else {
        parts.join(" ")
    }
}

fn check_evidence(upload: Upload) -> AppResult<EvidenceUpload> {
    if upload.bytes.len() > MAX_EVIDENCE_BYTES {
        return Err(AppError::Validation(
            "File too large. Maximum size is 10MB.".into(),
        ));
    }
    let (mime, extension) = sniff(&upload.bytes).ok_or_else(|| {
        AppError::Validation(
            "Invalid file type. Please upload an image (JPG, PNG, GIF, WebP) or PDF.".into(),
        )
    })?;
    Ok(EvidenceUpload {
        original_filename: upload.filename,
        mime,
        extension,
        bytes: upload.bytes,
    })
}

/// Validates a raw submission for `channel`. Has no side effects.
pub fn validate(
    channel: Channel,
    fields: &HashMap<String, String>,
    uploads: Vec<Upload>,
    default_plan: &str,
) -> AppResult<Submission> {
    let spec = ChannelSpec::for_channel(channel);

    for name in IDENTITY_FIELDS.into_iter().chain([spec.reference_field]) {
        if field(fields, &[name]).is_none() {
            return Err(AppError::Validation(format!("Field '{name}' is required.")));
        }
    }
    let required = |name: &str| field(fields, &[name]).unwrap_or_default().to_string();

    let email = normalize_email(&required("email"));
    if !looks_like_email(&email) {
        return Err(AppError::Validation("Invalid email address.".into()));
    }

    let reference = required(spec.reference_field);
    let reference = match spec.reference_format {
        ReferenceFormat::FreeText => reference,
        ReferenceFormat::TxHash => {
            if !TX_HASH.is_match(&reference) {
                return Err(AppError::Validation(
                    "Invalid transaction hash format. Must be 0x followed by 64 hex characters."
                        .into(),
                ));
            }
            reference.to_lowercase()
        }
        ReferenceFormat::OrderId => normalize_order_id(&reference)?,
    };

    let amount = field(fields, &["package_amount"]).map(str::to_string);
    if let Some(amount) = &amount {
        if !AMOUNT.is_match(amount) {
            return Err(AppError::Validation("Invalid package amount.".into()));
        }
    }

    let mut uploads = uploads.into_iter().filter(|u| !u.bytes.is_empty());
    let evidence = match spec.evidence {
        EvidencePolicy::Rejected => {
            if uploads.next().is_some() {
                return Err(AppError::Validation(
                    "Receipt uploads are not accepted for this payment method.".into(),
                ));
            }
            None
        }
        EvidencePolicy::Optional => uploads
            .find(|u| spec.accepts_evidence_field(&u.field))
            .map(check_evidence)
            .transpose()?,
    };

    Ok(Submission {
        channel,
        handle: required("username"),
        email,
        password: fields.get("password").cloned().unwrap_or_default(),
        full_name: full_name(fields),
        phone: required("phone"),
        country: required("country"),
        reference,
        sponsor: field(fields, &["sponsor_id"]).map(str::to_string),
        plan_name: field(fields, &["package"])
            .map(str::to_lowercase)
            .unwrap_or_else(|| default_plan.to_string()),
        amount,
        currency: field(fields, &["package_currency"]).map(str::to_uppercase),
        evidence,
    })
}
