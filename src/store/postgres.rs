// src/store/postgres.rs

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Row};

use super::{
    AccountUpdate, PaymentStore, QueueStats, StoreError, StoreResult, SubscriptionEnd,
    UniqueField, Verdict,
};
use crate::models::{
    AccountPaymentStatus, Activated, AuditCapture, Channel, NewActivation, NewPaymentRecord,
    NewPrincipal, PaymentKind, PaymentRecord, PaymentStatus, Plan, Principal, SubscriptionStatus,
    UserSubscription,
};

const PRINCIPAL_COLUMNS: &str = "id, email, handle, full_name, phone, country, referred_by, \
    public_id, payment_status, role, subscription_plan, password_hash, created_at";

const PAYMENT_COLUMNS: &str = "id, principal_id, subscription_id, plan_id, kind, \
    amount::text AS amount, currency, channel, external_reference, status, evidence_filename, \
    audit, pending_email, review_requested, review_requested_at, transaction_id, client_address, \
    user_agent, device_info, geo_country, geo_city, session_id, verified_by, verified_at, \
    rejection_reason, created_at";

const SUBSCRIPTION_COLUMNS: &str = "id, principal_id, plan_id, status, started_at, expires_at, \
    channel, external_subscription_id, auto_renew, cancelled_at, created_at, updated_at";

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, sqlx::Error> {
        let pool = PgPool::connect(database_url).await?;
        sqlx::migrate!().run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn parse_column<T>(row: &PgRow, column: &str) -> StoreResult<T>
where
    T: std::str::FromStr<Err = String>,
{
    let raw: String = row.get(column);
    raw.parse().map_err(StoreError::Corrupt)
}

/// Translates unique violations into the field they protect.
fn map_write_err(err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &err {
        if db.is_unique_violation() {
            let field = match db.constraint() {
                Some("principals_email_key") => UniqueField::Email,
                Some("principals_handle_key") => UniqueField::Handle,
                Some("principals_phone_key") => UniqueField::Phone,
                Some("payment_records_crypto_reference")
                | Some("payment_records_provider_reference")
                | Some("user_subscriptions_external_key") => UniqueField::ExternalReference,
                Some("payment_records_pending_email") => UniqueField::PendingEmail,
                Some("payment_records_transaction_id_key") => UniqueField::TransactionId,
                Some("user_subscriptions_one_active") => UniqueField::ActiveSubscription,
                other => {
                    log::warn!("unmapped unique constraint {other:?}");
                    return StoreError::Database(err);
                }
            };
            return StoreError::Conflict(field);
        }
    }
    StoreError::Database(err)
}

fn principal_from_row(r: &PgRow) -> StoreResult<Principal> {
    Ok(Principal {
        id: r.get("id"),
        email: r.get("email"),
        handle: r.get("handle"),
        full_name: r.get("full_name"),
        phone: r.get("phone"),
        country: r.get("country"),
        referred_by: r.get("referred_by"),
        public_id: r.get("public_id"),
        payment_status: parse_column::<AccountPaymentStatus>(r, "payment_status")?,
        role: parse_column(r, "role")?,
        subscription_plan: r.get("subscription_plan"),
        password_hash: r.get("password_hash"),
        created_at: r.get("created_at"),
    })
}

fn plan_from_row(r: &PgRow) -> Plan {
    Plan {
        id: r.get("id"),
        name: r.get("name"),
        price: r.get("price"),
        currency: r.get("currency"),
        is_active: r.get("is_active"),
    }
}

fn payment_from_row(r: &PgRow) -> StoreResult<PaymentRecord> {
    Ok(PaymentRecord {
        id: r.get("id"),
        principal_id: r.get("principal_id"),
        subscription_id: r.get("subscription_id"),
        plan_id: r.get("plan_id"),
        kind: parse_column::<PaymentKind>(r, "kind")?,
        amount: r.get("amount"),
        currency: r.get("currency"),
        channel: parse_column::<Channel>(r, "channel")?,
        external_reference: r.get("external_reference"),
        status: parse_column::<PaymentStatus>(r, "status")?,
        evidence_filename: r.get("evidence_filename"),
        audit: r.get("audit"),
        pending_email: r.get("pending_email"),
        review_requested: r.get("review_requested"),
        review_requested_at: r.get("review_requested_at"),
        transaction_id: r.get("transaction_id"),
        capture: AuditCapture {
            client_address: r.get("client_address"),
            user_agent: r.get("user_agent"),
            device_info: r.get("device_info"),
            geo_country: r.get("geo_country"),
            geo_city: r.get("geo_city"),
            session_id: r.get("session_id"),
        },
        verified_by: r.get("verified_by"),
        verified_at: r.get("verified_at"),
        rejection_reason: r.get("rejection_reason"),
        created_at: r.get("created_at"),
    })
}

fn subscription_from_row(r: &PgRow) -> StoreResult<UserSubscription> {
    Ok(UserSubscription {
        id: r.get("id"),
        principal_id: r.get("principal_id"),
        plan_id: r.get("plan_id"),
        status: parse_column::<SubscriptionStatus>(r, "status")?,
        started_at: r.get("started_at"),
        expires_at: r.get("expires_at"),
        channel: parse_column::<Channel>(r, "channel")?,
        external_subscription_id: r.get("external_subscription_id"),
        auto_renew: r.get("auto_renew"),
        cancelled_at: r.get("cancelled_at"),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
    })
}

async fn apply_account(
    conn: &mut PgConnection,
    principal_id: i32,
    account: &AccountUpdate,
) -> StoreResult<()> {
    let result = sqlx::query(
        r#"UPDATE principals
           SET payment_status = $2,
               subscription_plan = COALESCE($3, subscription_plan)
           WHERE id = $1"#,
    )
    .bind(principal_id)
    .bind(account.status.as_str())
    .bind(&account.plan_name)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(StoreError::NotFound("principal"));
    }
    Ok(())
}

fn insert_payment_sql() -> String {
    format!(
        r#"INSERT INTO payment_records
               (principal_id, subscription_id, plan_id, kind, amount, currency, channel,
                external_reference, status, evidence_filename, audit, pending_email,
                transaction_id, client_address, user_agent, device_info, geo_country,
                geo_city, session_id)
           VALUES ($1, $2, $3, $4, $5::numeric, $6, $7, $8, $9, $10, $11, $12, $13, $14,
                   $15, $16, $17, $18, $19)
           RETURNING {PAYMENT_COLUMNS}"#
    )
}

#[async_trait]
impl PaymentStore for PgStore {
    async fn principal_exists(&self, field: UniqueField, value: &str) -> StoreResult<bool> {
        let sql = match field {
            UniqueField::Email => "SELECT EXISTS(SELECT 1 FROM principals WHERE email = $1)",
            UniqueField::Handle => "SELECT EXISTS(SELECT 1 FROM principals WHERE handle = $1)",
            UniqueField::Phone => "SELECT EXISTS(SELECT 1 FROM principals WHERE phone = $1)",
            _ => return Ok(false),
        };
        let row = sqlx::query(sql).bind(value).fetch_one(&self.pool).await?;
        Ok(row.get(0))
    }

    async fn find_principal_id_by_handle(&self, handle: &str) -> StoreResult<Option<i32>> {
        let row = sqlx::query("SELECT id FROM principals WHERE handle = $1")
            .bind(handle)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("id")))
    }

    async fn find_principal_id_by_public_id(&self, public_id: &str) -> StoreResult<Option<i32>> {
        let row = sqlx::query("SELECT id FROM principals WHERE public_id = $1")
            .bind(public_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("id")))
    }

    async fn get_principal(&self, id: i32) -> StoreResult<Option<Principal>> {
        let row = sqlx::query(&format!("SELECT {PRINCIPAL_COLUMNS} FROM principals WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(principal_from_row).transpose()
    }

    async fn insert_principal(&self, principal: NewPrincipal) -> StoreResult<Principal> {
        let row = sqlx::query(&format!(
            r#"INSERT INTO principals
                   (email, handle, full_name, phone, country, referred_by, public_id,
                    payment_status, password_hash)
               VALUES ($1, $2, $3, $4, $5, $6, $7, 'pending', $8)
               RETURNING {PRINCIPAL_COLUMNS}"#
        ))
        .bind(&principal.email)
        .bind(&principal.handle)
        .bind(&principal.full_name)
        .bind(&principal.phone)
        .bind(&principal.country)
        .bind(principal.referred_by)
        .bind(&principal.public_id)
        .bind(&principal.password_hash)
        .fetch_one(&self.pool)
        .await
        .map_err(map_write_err)?;

        principal_from_row(&row)
    }

    async fn delete_principal(&self, id: i32) -> StoreResult<()> {
        sqlx::query("DELETE FROM principals WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn find_active_plan(&self, name: &str) -> StoreResult<Option<Plan>> {
        let row = sqlx::query(
            r#"SELECT id, name, price::text AS price, currency, is_active
               FROM plans
               WHERE name = $1 AND is_active = true"#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(plan_from_row))
    }

    async fn get_plan(&self, id: i32) -> StoreResult<Option<Plan>> {
        let row = sqlx::query(
            r#"SELECT id, name, price::text AS price, currency, is_active
               FROM plans
               WHERE id = $1"#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(plan_from_row))
    }

    async fn reference_exists(&self, channel: Channel, reference: &str) -> StoreResult<bool> {
        let row = sqlx::query(
            r#"SELECT EXISTS(
                   SELECT 1 FROM payment_records
                   WHERE channel = $1 AND external_reference = $2
               )"#,
        )
        .bind(channel.as_str())
        .bind(reference)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get(0))
    }

    async fn pending_email_exists(&self, channel: Channel, email: &str) -> StoreResult<bool> {
        let row = sqlx::query(
            r#"SELECT EXISTS(
                   SELECT 1 FROM payment_records
                   WHERE channel = $1 AND pending_email = $2 AND status = 'pending'
               )"#,
        )
        .bind(channel.as_str())
        .bind(email)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get(0))
    }

    async fn transaction_id_exists(&self, transaction_id: &str) -> StoreResult<bool> {
        let row = sqlx::query(
            "SELECT EXISTS(SELECT 1 FROM payment_records WHERE transaction_id = $1)",
        )
        .bind(transaction_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get(0))
    }

    async fn insert_payment(&self, p: NewPaymentRecord) -> StoreResult<PaymentRecord> {
        let row = sqlx::query(&insert_payment_sql())
            .bind(p.principal_id)
            .bind(p.subscription_id)
            .bind(p.plan_id)
            .bind(p.kind.as_str())
            .bind(&p.amount)
            .bind(&p.currency)
            .bind(p.channel.as_str())
            .bind(&p.external_reference)
            .bind(p.status.as_str())
            .bind(&p.evidence_filename)
            .bind(&p.audit)
            .bind(&p.pending_email)
            .bind(&p.transaction_id)
            .bind(&p.capture.client_address)
            .bind(&p.capture.user_agent)
            .bind(&p.capture.device_info)
            .bind(&p.capture.geo_country)
            .bind(&p.capture.geo_city)
            .bind(&p.capture.session_id)
            .fetch_one(&self.pool)
            .await
            .map_err(map_write_err)?;

        payment_from_row(&row)
    }

    async fn get_payment(&self, id: i32) -> StoreResult<Option<PaymentRecord>> {
        let row = sqlx::query(&format!("SELECT {PAYMENT_COLUMNS} FROM payment_records WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(payment_from_row).transpose()
    }

    async fn find_payment_by_reference(
        &self,
        channel: Channel,
        reference: &str,
    ) -> StoreResult<Option<PaymentRecord>> {
        let row = sqlx::query(&format!(
            r#"SELECT {PAYMENT_COLUMNS}
               FROM payment_records
               WHERE channel = $1 AND external_reference = $2
               ORDER BY id ASC
               LIMIT 1"#
        ))
        .bind(channel.as_str())
        .bind(reference)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(payment_from_row).transpose()
    }

    async fn find_payment_by_evidence(&self, filename: &str) -> StoreResult<Option<PaymentRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payment_records WHERE evidence_filename = $1 LIMIT 1"
        ))
        .bind(filename)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(payment_from_row).transpose()
    }

    async fn settle_payment(
        &self,
        id: i32,
        status: PaymentStatus,
        account: Option<AccountUpdate>,
    ) -> StoreResult<bool> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            r#"UPDATE payment_records
               SET status = $2
               WHERE id = $1 AND status = 'pending'
               RETURNING principal_id"#,
        )
        .bind(id)
        .bind(status.as_str())
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            return Ok(false);
        };

        if let Some(account) = &account {
            apply_account(&mut tx, row.get("principal_id"), account).await?;
        }
        tx.commit().await?;
        Ok(true)
    }

    async fn record_verdict(&self, id: i32, verdict: Verdict) -> StoreResult<bool> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            r#"UPDATE payment_records
               SET status = $2, verified_by = $3, verified_at = $4, rejection_reason = $5
               WHERE id = $1 AND status = 'pending'
               RETURNING principal_id"#,
        )
        .bind(id)
        .bind(verdict.status.as_str())
        .bind(verdict.verified_by)
        .bind(verdict.verified_at)
        .bind(&verdict.rejection_reason)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            return Ok(false);
        };

        if let Some(account) = &verdict.account {
            apply_account(&mut tx, row.get("principal_id"), account).await?;
        }
        tx.commit().await?;
        Ok(true)
    }

    async fn flag_for_review(&self, id: i32, at: DateTime<Utc>) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"UPDATE payment_records
               SET review_requested = true, review_requested_at = $2
               WHERE id = $1 AND status = 'pending' AND review_requested = false"#,
        )
        .bind(id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn review_queue_stats(&self, id: i32) -> StoreResult<QueueStats> {
        let row = sqlx::query(
            r#"SELECT
                   (SELECT COUNT(*) FROM payment_records
                     WHERE review_requested AND status = 'pending') AS pending_reviews,
                   (SELECT COUNT(*) FROM payment_records q
                     JOIN payment_records me ON me.id = $1
                     WHERE q.review_requested AND q.status = 'pending'
                       AND (q.review_requested_at, q.id) <= (me.review_requested_at, me.id)
                   ) AS position,
                   EXISTS(SELECT 1 FROM payment_records
                     WHERE id = $1 AND review_requested AND status = 'pending') AS queued"#,
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await?;

        let queued: bool = row.get("queued");
        Ok(QueueStats {
            pending_reviews: row.get("pending_reviews"),
            position: queued.then(|| row.get("position")),
        })
    }

    async fn list_review_queue(&self) -> StoreResult<Vec<PaymentRecord>> {
        let rows = sqlx::query(&format!(
            r#"SELECT {PAYMENT_COLUMNS}
               FROM payment_records
               WHERE review_requested AND status = 'pending'
               ORDER BY review_requested_at ASC, id ASC"#
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(payment_from_row).collect()
    }

    async fn activate_subscription(&self, a: NewActivation) -> StoreResult<Activated> {
        let mut tx = self.pool.begin().await?;

        let cancelled: Vec<i32> = sqlx::query(
            r#"UPDATE user_subscriptions
               SET status = 'cancelled', cancelled_at = $2, updated_at = $2
               WHERE principal_id = $1 AND status = 'active'
               RETURNING id"#,
        )
        .bind(a.principal_id)
        .bind(a.started_at)
        .fetch_all(&mut *tx)
        .await?
        .into_iter()
        .map(|r| r.get("id"))
        .collect();

        let sub_row = sqlx::query(&format!(
            r#"INSERT INTO user_subscriptions
                   (principal_id, plan_id, status, started_at, expires_at, channel,
                    external_subscription_id, auto_renew, created_at, updated_at)
               VALUES ($1, $2, 'active', $3, $4, $5, $6, true, $3, $3)
               RETURNING {SUBSCRIPTION_COLUMNS}"#
        ))
        .bind(a.principal_id)
        .bind(a.plan.id)
        .bind(a.started_at)
        .bind(a.expires_at)
        .bind(Channel::RecurringBilling.as_str())
        .bind(&a.external_subscription_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(map_write_err)?;
        let subscription = subscription_from_row(&sub_row)?;

        let kind = if cancelled.is_empty() {
            PaymentKind::Registration
        } else {
            PaymentKind::Renewal
        };
        let audit = serde_json::json!({
            "plan": a.plan.name,
            "external_subscription_id": a.external_subscription_id,
        });

        let payment_row = sqlx::query(&insert_payment_sql())
            .bind(a.principal_id)
            .bind(Some(subscription.id))
            .bind(a.plan.id)
            .bind(kind.as_str())
            .bind(&a.plan.price)
            .bind(&a.plan.currency)
            .bind(Channel::RecurringBilling.as_str())
            .bind(&a.external_subscription_id)
            .bind(PaymentStatus::Completed.as_str())
            .bind(None::<String>)
            .bind(&audit)
            .bind(None::<String>)
            .bind(&a.transaction_id)
            .bind(&a.capture.client_address)
            .bind(&a.capture.user_agent)
            .bind(&a.capture.device_info)
            .bind(&a.capture.geo_country)
            .bind(&a.capture.geo_city)
            .bind(&a.capture.session_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(map_write_err)?;
        let payment = payment_from_row(&payment_row)?;

        let updated = sqlx::query(
            r#"UPDATE principals
               SET subscription_plan = $2, payment_status = 'completed'
               WHERE id = $1"#,
        )
        .bind(a.principal_id)
        .bind(&a.plan.name)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(StoreError::NotFound("principal"));
        }

        tx.commit().await?;

        Ok(Activated {
            subscription,
            payment,
            cancelled,
        })
    }

    async fn get_subscription(&self, id: i32) -> StoreResult<Option<UserSubscription>> {
        let row = sqlx::query(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM user_subscriptions WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(subscription_from_row).transpose()
    }

    async fn list_subscriptions(&self, principal_id: i32) -> StoreResult<Vec<UserSubscription>> {
        let rows = sqlx::query(&format!(
            r#"SELECT {SUBSCRIPTION_COLUMNS}
               FROM user_subscriptions
               WHERE principal_id = $1
               ORDER BY created_at DESC, id DESC"#
        ))
        .bind(principal_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(subscription_from_row).collect()
    }

    async fn end_subscription(
        &self,
        external_id: &str,
        end: SubscriptionEnd,
    ) -> StoreResult<Option<UserSubscription>> {
        let mut tx = self.pool.begin().await?;

        let current = sqlx::query(&format!(
            r#"SELECT {SUBSCRIPTION_COLUMNS}
               FROM user_subscriptions
               WHERE external_subscription_id = $1
               FOR UPDATE"#
        ))
        .bind(external_id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(current) = current.as_ref().map(subscription_from_row).transpose()? else {
            return Ok(None);
        };
        if current.status != SubscriptionStatus::Active {
            return Ok(Some(current));
        }

        let cancelled = end.status == SubscriptionStatus::Cancelled;
        let row = sqlx::query(&format!(
            r#"UPDATE user_subscriptions
               SET status = $2,
                   cancelled_at = CASE WHEN $3 THEN $4 ELSE cancelled_at END,
                   auto_renew = auto_renew AND NOT $3,
                   updated_at = $4
               WHERE id = $1
               RETURNING {SUBSCRIPTION_COLUMNS}"#
        ))
        .bind(current.id)
        .bind(end.status.as_str())
        .bind(cancelled)
        .bind(end.at)
        .fetch_one(&mut *tx)
        .await?;
        let ended = subscription_from_row(&row)?;

        if let Some(plan) = &end.downgrade_to {
            sqlx::query("UPDATE principals SET subscription_plan = $2 WHERE id = $1")
                .bind(ended.principal_id)
                .bind(plan)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(Some(ended))
    }

    async fn webhook_event_seen(&self, event_id: &str) -> StoreResult<bool> {
        let row = sqlx::query(
            "SELECT EXISTS(SELECT 1 FROM provider_webhook_events WHERE event_id = $1)",
        )
        .bind(event_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get(0))
    }

    async fn record_webhook_event(
        &self,
        event_id: &str,
        event_type: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"INSERT INTO provider_webhook_events (event_id, event_type, received_at)
               VALUES ($1, $2, $3)
               ON CONFLICT (event_id) DO NOTHING"#,
        )
        .bind(event_id)
        .bind(event_type)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}
