// src/store/memory.rs

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{
    AccountUpdate, PaymentStore, QueueStats, StoreError, StoreResult, SubscriptionEnd,
    UniqueField, Verdict,
};
use crate::models::{
    AccountPaymentStatus, Activated, Channel, NewActivation, NewPaymentRecord, NewPrincipal,
    PaymentKind, PaymentRecord, PaymentStatus, Plan, Principal, Role, SubscriptionStatus,
    UserSubscription,
};

#[derive(Default)]
struct Tables {
    principals: Vec<Principal>,
    plans: Vec<Plan>,
    payments: Vec<PaymentRecord>,
    subscriptions: Vec<UserSubscription>,
    webhook_events: Vec<(String, String, DateTime<Utc>)>,
    next_principal: i32,
    next_plan: i32,
    next_payment: i32,
    next_subscription: i32,
}

impl Tables {
    fn principal_conflict(&self, p: &NewPrincipal) -> Option<UniqueField> {
        self.principals.iter().find_map(|existing| {
            if existing.email == p.email {
                Some(UniqueField::Email)
            } else if existing.handle == p.handle {
                Some(UniqueField::Handle)
            } else if existing.phone == p.phone {
                Some(UniqueField::Phone)
            } else {
                None
            }
        })
    }

    fn payment_conflict(&self, p: &NewPaymentRecord) -> Option<UniqueField> {
        let globally_unique = matches!(
            p.channel,
            Channel::CryptoOnchain | Channel::RecurringBilling
        );
        self.payments.iter().find_map(|existing| {
            if existing.transaction_id == p.transaction_id {
                Some(UniqueField::TransactionId)
            } else if globally_unique
                && existing.channel == p.channel
                && existing.external_reference == p.external_reference
            {
                Some(UniqueField::ExternalReference)
            } else if p.status == PaymentStatus::Pending
                && p.pending_email.is_some()
                && existing.status == PaymentStatus::Pending
                && existing.channel == p.channel
                && existing.pending_email == p.pending_email
            {
                Some(UniqueField::PendingEmail)
            } else {
                None
            }
        })
    }

    fn push_payment(&mut self, p: NewPaymentRecord, now: DateTime<Utc>) -> PaymentRecord {
        self.next_payment += 1;
        let record = PaymentRecord {
            id: self.next_payment,
            principal_id: p.principal_id,
            subscription_id: p.subscription_id,
            plan_id: p.plan_id,
            kind: p.kind,
            amount: p.amount,
            currency: p.currency,
            channel: p.channel,
            external_reference: p.external_reference,
            status: p.status,
            evidence_filename: p.evidence_filename,
            audit: p.audit,
            pending_email: p.pending_email,
            review_requested: false,
            review_requested_at: None,
            transaction_id: p.transaction_id,
            capture: p.capture,
            verified_by: None,
            verified_at: None,
            rejection_reason: None,
            created_at: now,
        };
        self.payments.push(record.clone());
        record
    }

    fn payment_mut(&mut self, id: i32) -> Option<&mut PaymentRecord> {
        self.payments.iter_mut().find(|p| p.id == id)
    }

    /// Owner of payment `id` while it is still pending. Settlements that
    /// carry an account update need that owner to exist before anything moves.
    fn settlement_owner(&self, id: i32, account: Option<&AccountUpdate>) -> StoreResult<Option<i32>> {
        let Some(owner) = self
            .payments
            .iter()
            .find(|p| p.id == id && p.status == PaymentStatus::Pending)
            .map(|p| p.principal_id)
        else {
            return Ok(None);
        };
        if account.is_some() && !self.principals.iter().any(|p| p.id == owner) {
            return Err(StoreError::NotFound("principal"));
        }
        Ok(Some(owner))
    }

    fn apply_account(&mut self, principal_id: i32, account: AccountUpdate) {
        if let Some(principal) = self.principals.iter_mut().find(|p| p.id == principal_id) {
            principal.payment_status = account.status;
            if let Some(plan) = account.plan_name {
                principal.subscription_plan = Some(plan);
            }
        }
    }
}

/// In-process store with the same constraints as the Postgres schema.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    fail_payment_inserts: AtomicBool,
    fail_principal_inserts: AtomicBool,
    fail_account_updates: AtomicBool,
    interleaved_payment: Mutex<Option<NewPaymentRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store preloaded with the standard plan catalogue.
    pub fn with_default_plans() -> Self {
        let store = Self::new();
        for (name, price) in [("free", "0.00"), ("go", "500.00"), ("plus", "1000.00"), ("pro", "2000.00")] {
            store.add_plan(name, price, "PHP", true);
        }
        store
    }

    pub fn add_plan(&self, name: &str, price: &str, currency: &str, is_active: bool) -> Plan {
        let mut tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        tables.next_plan += 1;
        let plan = Plan {
            id: tables.next_plan,
            name: name.to_string(),
            price: price.to_string(),
            currency: currency.to_string(),
            is_active,
        };
        tables.plans.push(plan.clone());
        plan
    }

    /// Makes every following payment insert fail with an unavailable store
    /// until switched off again.
    pub fn fail_payment_inserts(&self, fail: bool) {
        self.fail_payment_inserts.store(fail, Ordering::SeqCst);
    }

    pub fn fail_principal_inserts(&self, fail: bool) {
        self.fail_principal_inserts.store(fail, Ordering::SeqCst);
    }

    /// Makes settlements that carry an account update fail before writing
    /// anything, until switched off again.
    pub fn fail_account_updates(&self, fail: bool) {
        self.fail_account_updates.store(fail, Ordering::SeqCst);
    }

    /// Writes `rival` immediately before the next payment insert, the way a
    /// concurrent request that passed the same pre-checks would.
    pub fn interleave_payment(&self, rival: NewPaymentRecord) {
        let mut slot = self
            .interleaved_payment
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        *slot = Some(rival);
    }

    pub fn set_role(&self, principal_id: i32, role: Role) {
        let mut tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(p) = tables.principals.iter_mut().find(|p| p.id == principal_id) {
            p.role = role;
        }
    }

    pub fn principal_count(&self) -> usize {
        self.tables.lock().map(|t| t.principals.len()).unwrap_or(0)
    }

    pub fn payment_count(&self) -> usize {
        self.tables.lock().map(|t| t.payments.len()).unwrap_or(0)
    }

    fn tables(&self) -> StoreResult<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))
    }
}

#[async_trait]
impl PaymentStore for MemoryStore {
    async fn principal_exists(&self, field: UniqueField, value: &str) -> StoreResult<bool> {
        let tables = self.tables()?;
        Ok(tables.principals.iter().any(|p| match field {
            UniqueField::Email => p.email == value,
            UniqueField::Handle => p.handle == value,
            UniqueField::Phone => p.phone == value,
            _ => false,
        }))
    }

    async fn find_principal_id_by_handle(&self, handle: &str) -> StoreResult<Option<i32>> {
        let tables = self.tables()?;
        Ok(tables.principals.iter().find(|p| p.handle == handle).map(|p| p.id))
    }

    async fn find_principal_id_by_public_id(&self, public_id: &str) -> StoreResult<Option<i32>> {
        let tables = self.tables()?;
        Ok(tables
            .principals
            .iter()
            .find(|p| p.public_id == public_id)
            .map(|p| p.id))
    }

    async fn get_principal(&self, id: i32) -> StoreResult<Option<Principal>> {
        let tables = self.tables()?;
        Ok(tables.principals.iter().find(|p| p.id == id).cloned())
    }

    async fn insert_principal(&self, principal: NewPrincipal) -> StoreResult<Principal> {
        if self.fail_principal_inserts.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("principal insert rejected".into()));
        }
        let mut tables = self.tables()?;
        if let Some(field) = tables.principal_conflict(&principal) {
            return Err(StoreError::Conflict(field));
        }
        tables.next_principal += 1;
        let row = Principal {
            id: tables.next_principal,
            email: principal.email,
            handle: principal.handle,
            full_name: principal.full_name,
            phone: principal.phone,
            country: principal.country,
            referred_by: principal.referred_by,
            public_id: principal.public_id,
            payment_status: AccountPaymentStatus::Pending,
            role: Role::Member,
            subscription_plan: None,
            password_hash: principal.password_hash,
            created_at: Utc::now(),
        };
        tables.principals.push(row.clone());
        Ok(row)
    }

    async fn delete_principal(&self, id: i32) -> StoreResult<()> {
        let mut tables = self.tables()?;
        tables.principals.retain(|p| p.id != id);
        tables.payments.retain(|p| p.principal_id != id);
        tables.subscriptions.retain(|s| s.principal_id != id);
        Ok(())
    }

    async fn find_active_plan(&self, name: &str) -> StoreResult<Option<Plan>> {
        let tables = self.tables()?;
        Ok(tables
            .plans
            .iter()
            .find(|p| p.name == name && p.is_active)
            .cloned())
    }

    async fn get_plan(&self, id: i32) -> StoreResult<Option<Plan>> {
        let tables = self.tables()?;
        Ok(tables.plans.iter().find(|p| p.id == id).cloned())
    }

    async fn reference_exists(&self, channel: Channel, reference: &str) -> StoreResult<bool> {
        let tables = self.tables()?;
        Ok(tables
            .payments
            .iter()
            .any(|p| p.channel == channel && p.external_reference == reference))
    }

    async fn pending_email_exists(&self, channel: Channel, email: &str) -> StoreResult<bool> {
        let tables = self.tables()?;
        Ok(tables.payments.iter().any(|p| {
            p.channel == channel
                && p.status == PaymentStatus::Pending
                && p.pending_email.as_deref() == Some(email)
        }))
    }

    async fn transaction_id_exists(&self, transaction_id: &str) -> StoreResult<bool> {
        let tables = self.tables()?;
        Ok(tables.payments.iter().any(|p| p.transaction_id == transaction_id))
    }

    async fn insert_payment(&self, payment: NewPaymentRecord) -> StoreResult<PaymentRecord> {
        if self.fail_payment_inserts.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("payment insert rejected".into()));
        }
        let rival = self
            .interleaved_payment
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))?
            .take();
        let mut tables = self.tables()?;
        if let Some(rival) = rival {
            if tables.payment_conflict(&rival).is_none() {
                tables.push_payment(rival, Utc::now());
            }
        }
        if !tables.principals.iter().any(|p| p.id == payment.principal_id) {
            return Err(StoreError::NotFound("principal"));
        }
        if let Some(field) = tables.payment_conflict(&payment) {
            return Err(StoreError::Conflict(field));
        }
        Ok(tables.push_payment(payment, Utc::now()))
    }

    async fn get_payment(&self, id: i32) -> StoreResult<Option<PaymentRecord>> {
        let tables = self.tables()?;
        Ok(tables.payments.iter().find(|p| p.id == id).cloned())
    }

    async fn find_payment_by_reference(
        &self,
        channel: Channel,
        reference: &str,
    ) -> StoreResult<Option<PaymentRecord>> {
        let tables = self.tables()?;
        Ok(tables
            .payments
            .iter()
            .find(|p| p.channel == channel && p.external_reference == reference)
            .cloned())
    }

    async fn find_payment_by_evidence(&self, filename: &str) -> StoreResult<Option<PaymentRecord>> {
        let tables = self.tables()?;
        Ok(tables
            .payments
            .iter()
            .find(|p| p.evidence_filename.as_deref() == Some(filename))
            .cloned())
    }

    async fn settle_payment(
        &self,
        id: i32,
        status: PaymentStatus,
        account: Option<AccountUpdate>,
    ) -> StoreResult<bool> {
        if account.is_some() && self.fail_account_updates.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("account update rejected".into()));
        }
        let mut tables = self.tables()?;
        let Some(owner) = tables.settlement_owner(id, account.as_ref())? else {
            return Ok(false);
        };
        if let Some(p) = tables.payment_mut(id) {
            p.status = status;
        }
        if let Some(account) = account {
            tables.apply_account(owner, account);
        }
        Ok(true)
    }

    async fn record_verdict(&self, id: i32, verdict: Verdict) -> StoreResult<bool> {
        if verdict.account.is_some() && self.fail_account_updates.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("account update rejected".into()));
        }
        let mut tables = self.tables()?;
        let Some(owner) = tables.settlement_owner(id, verdict.account.as_ref())? else {
            return Ok(false);
        };
        if let Some(p) = tables.payment_mut(id) {
            p.status = verdict.status;
            p.verified_by = Some(verdict.verified_by);
            p.verified_at = Some(verdict.verified_at);
            p.rejection_reason = verdict.rejection_reason;
        }
        if let Some(account) = verdict.account {
            tables.apply_account(owner, account);
        }
        Ok(true)
    }

    async fn flag_for_review(&self, id: i32, at: DateTime<Utc>) -> StoreResult<bool> {
        let mut tables = self.tables()?;
        match tables.payment_mut(id) {
            Some(p) if p.status == PaymentStatus::Pending && !p.review_requested => {
                p.review_requested = true;
                p.review_requested_at = Some(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn review_queue_stats(&self, id: i32) -> StoreResult<QueueStats> {
        let tables = self.tables()?;
        let queued: Vec<&PaymentRecord> = tables
            .payments
            .iter()
            .filter(|p| p.is_queued_for_review())
            .collect();

        let position = tables
            .payments
            .iter()
            .find(|p| p.id == id && p.is_queued_for_review())
            .map(|me| {
                let key = (me.review_requested_at, me.id);
                queued
                    .iter()
                    .filter(|q| (q.review_requested_at, q.id) <= key)
                    .count() as i64
            });

        Ok(QueueStats {
            pending_reviews: queued.len() as i64,
            position,
        })
    }

    async fn list_review_queue(&self) -> StoreResult<Vec<PaymentRecord>> {
        let tables = self.tables()?;
        let mut queued: Vec<PaymentRecord> = tables
            .payments
            .iter()
            .filter(|p| p.is_queued_for_review())
            .cloned()
            .collect();
        queued.sort_by_key(|p| (p.review_requested_at, p.id));
        Ok(queued)
    }

    async fn activate_subscription(&self, a: NewActivation) -> StoreResult<Activated> {
        let mut tables = self.tables()?;

        // All checks run before the first write so a failure leaves nothing behind.
        if !tables.principals.iter().any(|p| p.id == a.principal_id) {
            return Err(StoreError::NotFound("principal"));
        }
        if tables
            .subscriptions
            .iter()
            .any(|s| s.external_subscription_id == a.external_subscription_id)
        {
            return Err(StoreError::Conflict(UniqueField::ExternalReference));
        }
        let audit = serde_json::json!({
            "plan": a.plan.name,
            "external_subscription_id": a.external_subscription_id,
        });
        let mut payment = NewPaymentRecord {
            principal_id: a.principal_id,
            subscription_id: None,
            plan_id: a.plan.id,
            kind: PaymentKind::Registration,
            amount: a.plan.price.clone(),
            currency: a.plan.currency.clone(),
            channel: Channel::RecurringBilling,
            external_reference: a.external_subscription_id.clone(),
            status: PaymentStatus::Completed,
            evidence_filename: None,
            audit,
            pending_email: None,
            transaction_id: a.transaction_id.clone(),
            capture: a.capture.clone(),
        };
        if let Some(field) = tables.payment_conflict(&payment) {
            return Err(StoreError::Conflict(field));
        }

        let mut cancelled = Vec::new();
        for sub in tables
            .subscriptions
            .iter_mut()
            .filter(|s| s.principal_id == a.principal_id && s.status == SubscriptionStatus::Active)
        {
            sub.status = SubscriptionStatus::Cancelled;
            sub.cancelled_at = Some(a.started_at);
            sub.updated_at = a.started_at;
            cancelled.push(sub.id);
        }

        tables.next_subscription += 1;
        let subscription = UserSubscription {
            id: tables.next_subscription,
            principal_id: a.principal_id,
            plan_id: a.plan.id,
            status: SubscriptionStatus::Active,
            started_at: a.started_at,
            expires_at: a.expires_at,
            channel: Channel::RecurringBilling,
            external_subscription_id: a.external_subscription_id.clone(),
            auto_renew: true,
            cancelled_at: None,
            created_at: a.started_at,
            updated_at: a.started_at,
        };
        tables.subscriptions.push(subscription.clone());

        payment.subscription_id = Some(subscription.id);
        if !cancelled.is_empty() {
            payment.kind = PaymentKind::Renewal;
        }
        let payment = tables.push_payment(payment, a.started_at);

        if let Some(principal) = tables.principals.iter_mut().find(|p| p.id == a.principal_id) {
            principal.subscription_plan = Some(a.plan.name.clone());
            principal.payment_status = AccountPaymentStatus::Completed;
        }

        Ok(Activated {
            subscription,
            payment,
            cancelled,
        })
    }

    async fn get_subscription(&self, id: i32) -> StoreResult<Option<UserSubscription>> {
        let tables = self.tables()?;
        Ok(tables.subscriptions.iter().find(|s| s.id == id).cloned())
    }

    async fn list_subscriptions(&self, principal_id: i32) -> StoreResult<Vec<UserSubscription>> {
        let tables = self.tables()?;
        let mut subs: Vec<UserSubscription> = tables
            .subscriptions
            .iter()
            .filter(|s| s.principal_id == principal_id)
            .cloned()
            .collect();
        subs.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(subs)
    }

    async fn end_subscription(
        &self,
        external_id: &str,
        end: SubscriptionEnd,
    ) -> StoreResult<Option<UserSubscription>> {
        let mut tables = self.tables()?;
        let Some(sub) = tables
            .subscriptions
            .iter_mut()
            .find(|s| s.external_subscription_id == external_id)
        else {
            return Ok(None);
        };
        if sub.status != SubscriptionStatus::Active {
            return Ok(Some(sub.clone()));
        }

        sub.status = end.status;
        if end.status == SubscriptionStatus::Cancelled {
            sub.cancelled_at = Some(end.at);
            sub.auto_renew = false;
        }
        sub.updated_at = end.at;
        let ended = sub.clone();

        if let Some(plan) = end.downgrade_to {
            if let Some(p) = tables.principals.iter_mut().find(|p| p.id == ended.principal_id) {
                p.subscription_plan = Some(plan);
            }
        }
        Ok(Some(ended))
    }

    async fn webhook_event_seen(&self, event_id: &str) -> StoreResult<bool> {
        let tables = self.tables()?;
        Ok(tables.webhook_events.iter().any(|(id, _, _)| id == event_id))
    }

    async fn record_webhook_event(
        &self,
        event_id: &str,
        event_type: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut tables = self.tables()?;
        if tables.webhook_events.iter().any(|(id, _, _)| id == event_id) {
            return Ok(false);
        }
        tables
            .webhook_events
            .push((event_id.to_string(), event_type.to_string(), at));
        Ok(true)
    }
}
