// src/duplicates.rs

use crate::error::{AppError, AppResult};
use crate::intake::{ChannelSpec, DuplicateStrategy, Submission};
use crate::store::{PaymentStore, UniqueField};

/// Read-only pre-check for identity and reference collisions.
///
/// The store's unique constraints stay authoritative: two concurrent
/// submissions can both pass here, and the loser then fails on insert.
pub async fn check(store: &dyn PaymentStore, submission: &Submission) -> AppResult<()> {
    let identity = [
        (UniqueField::Email, submission.email.as_str()),
        (UniqueField::Handle, submission.handle.as_str()),
        (UniqueField::Phone, submission.phone.as_str()),
    ];
    for (field, value) in identity {
        if store.principal_exists(field, value).await? {
            return Err(AppError::Duplicate(field));
        }
    }

    let spec = ChannelSpec::for_channel(submission.channel);
    match spec.duplicates {
        DuplicateStrategy::ExactReference => {
            if store
                .reference_exists(submission.channel, &submission.reference)
                .await?
            {
                return Err(AppError::Duplicate(UniqueField::ExternalReference));
            }
        }
        DuplicateStrategy::PendingEmail => {
            if store
                .pending_email_exists(submission.channel, &submission.email)
                .await?
            {
                return Err(AppError::Duplicate(UniqueField::PendingEmail));
            }
        }
    }
    Ok(())
}
