//! PostgreSQL store
//!
//! Optional columns are probed once at startup. Queries are built per call so a
//! column disabled at runtime drops out of every later statement.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use super::{
    DeliveryLog, DeliveryStatus, GrantStore, OptionalColumn, SchemaCapabilities,
    WebhookDeliveryRecord,
};
use crate::error::{BillingError, BillingResult};
use crate::models::{
    CreditGrant, GrantPatch, NewGrant, NewPaymentRecord, PaymentInsert, PaymentRecord, Provider,
};

#[derive(Debug, sqlx::FromRow)]
struct GrantRow {
    id: Uuid,
    user_id: Uuid,
    provider: String,
    provider_subscription_id: Option<String>,
    provider_checkout_id: Option<String>,
    plan_type: String,
    membership: String,
    credits: i64,
    status: String,
    canceled_flag: bool,
    expires_at: Option<OffsetDateTime>,
    version: i64,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<GrantRow> for CreditGrant {
    type Error = BillingError;

    fn try_from(row: GrantRow) -> Result<Self, Self::Error> {
        Ok(CreditGrant {
            id: row.id,
            user_id: row.user_id,
            provider: row.provider.parse()?,
            provider_subscription_id: row.provider_subscription_id,
            provider_checkout_id: row.provider_checkout_id,
            plan_type: row.plan_type.parse()?,
            membership: row.membership.parse()?,
            credits: row.credits,
            status: row.status.parse()?,
            canceled_flag: row.canceled_flag,
            expires_at: row.expires_at,
            version: row.version,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct PaymentRow {
    id: Uuid,
    user_id: Uuid,
    provider: String,
    amount: i64,
    currency: String,
    provider_checkout_id: Option<String>,
    provider_order_id: Option<String>,
    status_label: String,
    created_at: OffsetDateTime,
}

impl TryFrom<PaymentRow> for PaymentRecord {
    type Error = BillingError;

    fn try_from(row: PaymentRow) -> Result<Self, Self::Error> {
        Ok(PaymentRecord {
            id: row.id,
            user_id: row.user_id,
            provider: row.provider.parse()?,
            amount: row.amount,
            currency: row.currency,
            provider_checkout_id: row.provider_checkout_id,
            provider_order_id: row.provider_order_id,
            status_label: row.status_label,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct DeliveryRow {
    id: Uuid,
    delivery_id: String,
    event_type: String,
    payload: serde_json::Value,
    processing_result: String,
    processing_started_at: Option<OffsetDateTime>,
    error_message: Option<String>,
    created_at: OffsetDateTime,
}

impl TryFrom<DeliveryRow> for WebhookDeliveryRecord {
    type Error = BillingError;

    fn try_from(row: DeliveryRow) -> Result<Self, Self::Error> {
        let processing_result = DeliveryStatus::parse(&row.processing_result).ok_or_else(|| {
            BillingError::Storage(format!(
                "unknown delivery status '{}'",
                row.processing_result
            ))
        })?;
        Ok(WebhookDeliveryRecord {
            id: row.id,
            delivery_id: row.delivery_id,
            event_type: row.event_type,
            payload: row.payload,
            processing_result,
            processing_started_at: row.processing_started_at,
            error_message: row.error_message,
            created_at: row.created_at,
        })
    }
}

fn into_grants(rows: Vec<GrantRow>) -> BillingResult<Vec<CreditGrant>> {
    rows.into_iter().map(CreditGrant::try_from).collect()
}

const DELIVERY_COLUMNS: &str = "id, delivery_id, event_type, payload, processing_result, \
     processing_started_at, error_message, created_at";

/// Grant, payment and delivery persistence backed by PostgreSQL
pub struct PgStore {
    pool: PgPool,
    capabilities: SchemaCapabilities,
}

impl PgStore {
    /// Create a store, probing the schema for optional columns
    pub async fn connect(pool: PgPool) -> BillingResult<Self> {
        let capabilities = probe_capabilities(&pool).await?;
        tracing::info!(
            grant_checkout_id = capabilities.supports(OptionalColumn::GrantCheckoutId),
            payment_checkout_id = capabilities.supports(OptionalColumn::PaymentCheckoutId),
            "Probed optional billing columns"
        );
        Ok(Self { pool, capabilities })
    }

    /// Create a store with known capabilities, skipping the probe
    pub fn with_capabilities(pool: PgPool, capabilities: SchemaCapabilities) -> Self {
        Self { pool, capabilities }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn checkout_select(&self, column: OptionalColumn) -> &'static str {
        if self.capabilities.supports(column) {
            "provider_checkout_id"
        } else {
            "NULL::TEXT AS provider_checkout_id"
        }
    }

    fn grant_columns(&self) -> String {
        format!(
            "id, user_id, provider, provider_subscription_id, {}, plan_type, membership, \
             credits, status, canceled_flag, expires_at, version, created_at, updated_at",
            self.checkout_select(OptionalColumn::GrantCheckoutId)
        )
    }

    fn payment_columns(&self) -> String {
        format!(
            "id, user_id, provider, amount, currency, {}, provider_order_id, status_label, created_at",
            self.checkout_select(OptionalColumn::PaymentCheckoutId)
        )
    }
}

async fn probe_capabilities(pool: &PgPool) -> BillingResult<SchemaCapabilities> {
    let tables: Vec<(String,)> = sqlx::query_as(
        r#"
        SELECT table_name::TEXT
        FROM information_schema.columns
        WHERE table_schema = current_schema()
          AND column_name = 'provider_checkout_id'
          AND table_name IN ('credit_grants', 'payment_records')
        "#,
    )
    .fetch_all(pool)
    .await?;

    let present: Vec<OptionalColumn> = OptionalColumn::ALL
        .into_iter()
        .filter(|column| tables.iter().any(|(table,)| table == column.table()))
        .collect();
    Ok(SchemaCapabilities::with_columns(&present))
}

#[async_trait]
impl GrantStore for PgStore {
    fn capabilities(&self) -> &SchemaCapabilities {
        &self.capabilities
    }

    async fn get_grant(&self, id: Uuid) -> BillingResult<Option<CreditGrant>> {
        let sql = format!(
            "SELECT {} FROM credit_grants WHERE id = $1",
            self.grant_columns()
        );
        let row: Option<GrantRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(CreditGrant::try_from).transpose()
    }

    async fn find_by_subscription_id(
        &self,
        provider: Provider,
        subscription_id: &str,
    ) -> BillingResult<Option<CreditGrant>> {
        let sql = format!(
            "SELECT {} FROM credit_grants WHERE provider = $1 AND provider_subscription_id = $2",
            self.grant_columns()
        );
        let row: Option<GrantRow> = sqlx::query_as(&sql)
            .bind(provider.as_str())
            .bind(subscription_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(CreditGrant::try_from).transpose()
    }

    async fn find_latest_unlinked(
        &self,
        user_id: Uuid,
        provider: Provider,
    ) -> BillingResult<Option<CreditGrant>> {
        let sql = format!(
            r#"
            SELECT {} FROM credit_grants
            WHERE user_id = $1
              AND provider = $2
              AND provider_subscription_id IS NULL
              AND plan_type <> 'one_time'
              AND status = 'active'
            ORDER BY created_at DESC
            LIMIT 1
            "#,
            self.grant_columns()
        );
        let row: Option<GrantRow> = sqlx::query_as(&sql)
            .bind(user_id)
            .bind(provider.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(CreditGrant::try_from).transpose()
    }

    async fn find_by_checkout_id(
        &self,
        provider: Provider,
        checkout_id: &str,
    ) -> BillingResult<Option<CreditGrant>> {
        if !self.capabilities.supports(OptionalColumn::GrantCheckoutId) {
            return Ok(None);
        }
        let sql = format!(
            "SELECT {} FROM credit_grants WHERE provider = $1 AND provider_checkout_id = $2",
            self.grant_columns()
        );
        let row: Option<GrantRow> = sqlx::query_as(&sql)
            .bind(provider.as_str())
            .bind(checkout_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(CreditGrant::try_from).transpose()
    }

    async fn find_latest_subscription_since(
        &self,
        user_id: Uuid,
        provider: Provider,
        since: OffsetDateTime,
    ) -> BillingResult<Option<CreditGrant>> {
        let sql = format!(
            r#"
            SELECT {} FROM credit_grants
            WHERE user_id = $1
              AND provider = $2
              AND plan_type <> 'one_time'
              AND status = 'active'
              AND created_at >= $3
            ORDER BY created_at DESC
            LIMIT 1
            "#,
            self.grant_columns()
        );
        let row: Option<GrantRow> = sqlx::query_as(&sql)
            .bind(user_id)
            .bind(provider.as_str())
            .bind(since)
            .fetch_optional(&self.pool)
            .await?;
        row.map(CreditGrant::try_from).transpose()
    }

    async fn find_uncorrelated_since(
        &self,
        user_id: Uuid,
        provider: Provider,
        since: OffsetDateTime,
    ) -> BillingResult<Option<CreditGrant>> {
        let checkout_filter = if self.capabilities.supports(OptionalColumn::GrantCheckoutId) {
            "AND provider_checkout_id IS NULL"
        } else {
            ""
        };
        let sql = format!(
            r#"
            SELECT {} FROM credit_grants
            WHERE user_id = $1
              AND provider = $2
              AND created_at >= $3
              {}
            ORDER BY created_at DESC
            LIMIT 1
            "#,
            self.grant_columns(),
            checkout_filter
        );
        let row: Option<GrantRow> = sqlx::query_as(&sql)
            .bind(user_id)
            .bind(provider.as_str())
            .bind(since)
            .fetch_optional(&self.pool)
            .await?;
        row.map(CreditGrant::try_from).transpose()
    }

    async fn list_grants_for_user(&self, user_id: Uuid) -> BillingResult<Vec<CreditGrant>> {
        let sql = format!(
            "SELECT {} FROM credit_grants WHERE user_id = $1 ORDER BY created_at",
            self.grant_columns()
        );
        let rows: Vec<GrantRow> = sqlx::query_as(&sql)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        into_grants(rows)
    }

    async fn list_lapsed(
        &self,
        now: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<CreditGrant>> {
        let sql = format!(
            r#"
            SELECT {} FROM credit_grants
            WHERE status = 'active' AND expires_at < $1
            ORDER BY expires_at
            LIMIT $2
            "#,
            self.grant_columns()
        );
        let rows: Vec<GrantRow> = sqlx::query_as(&sql)
            .bind(now)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        into_grants(rows)
    }

    async fn insert_grant(&self, grant: &NewGrant) -> BillingResult<CreditGrant> {
        let with_checkout = self.capabilities.supports(OptionalColumn::GrantCheckoutId);
        let sql = format!(
            r#"
            INSERT INTO credit_grants
                (user_id, provider, provider_subscription_id, plan_type, membership,
                 credits, expires_at{})
            VALUES ($1, $2, $3, $4, $5, $6, $7{})
            RETURNING {}
            "#,
            if with_checkout { ", provider_checkout_id" } else { "" },
            if with_checkout { ", $8" } else { "" },
            self.grant_columns()
        );

        let mut query = sqlx::query_as::<_, GrantRow>(&sql)
            .bind(grant.user_id)
            .bind(grant.provider.as_str())
            .bind(grant.provider_subscription_id.as_deref())
            .bind(grant.plan_type.as_str())
            .bind(grant.membership.as_str())
            .bind(grant.credits)
            .bind(grant.expires_at);
        if with_checkout {
            query = query.bind(grant.provider_checkout_id.as_deref());
        }

        let row = query.fetch_one(&self.pool).await?;
        CreditGrant::try_from(row)
    }

    async fn update_grant(
        &self,
        id: Uuid,
        expected_version: i64,
        patch: &GrantPatch,
    ) -> BillingResult<Option<CreditGrant>> {
        let with_checkout = patch.provider_checkout_id.is_some()
            && self.capabilities.supports(OptionalColumn::GrantCheckoutId);
        let sql = format!(
            r#"
            UPDATE credit_grants SET
                provider_subscription_id = COALESCE($3, provider_subscription_id),
                plan_type = COALESCE($4, plan_type),
                membership = COALESCE($5, membership),
                credits = COALESCE($6, credits),
                status = COALESCE($7, status),
                canceled_flag = COALESCE($8, canceled_flag),
                expires_at = COALESCE($9, expires_at),{}
                version = version + 1,
                updated_at = NOW()
            WHERE id = $1 AND version = $2
            RETURNING {}
            "#,
            if with_checkout {
                "\n                provider_checkout_id = COALESCE($10, provider_checkout_id),"
            } else {
                ""
            },
            self.grant_columns()
        );

        let mut query = sqlx::query_as::<_, GrantRow>(&sql)
            .bind(id)
            .bind(expected_version)
            .bind(patch.provider_subscription_id.as_deref())
            .bind(patch.plan_type.map(|p| p.as_str()))
            .bind(patch.membership.map(|m| m.as_str()))
            .bind(patch.credits)
            .bind(patch.status.map(|s| s.as_str()))
            .bind(patch.canceled_flag)
            .bind(patch.expires_at);
        if with_checkout {
            query = query.bind(patch.provider_checkout_id.as_deref());
        }

        let row = query.fetch_optional(&self.pool).await?;
        row.map(CreditGrant::try_from).transpose()
    }

    async fn payment_exists_for_checkout(
        &self,
        provider: Provider,
        checkout_id: &str,
    ) -> BillingResult<bool> {
        if !self.capabilities.supports(OptionalColumn::PaymentCheckoutId) {
            return Ok(false);
        }
        let (exists,): (bool,) = sqlx::query_as(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM payment_records
                WHERE provider = $1 AND provider_checkout_id = $2
            )
            "#,
        )
        .bind(provider.as_str())
        .bind(checkout_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn insert_payment(&self, record: &NewPaymentRecord) -> BillingResult<PaymentInsert> {
        let with_checkout = self
            .capabilities
            .supports(OptionalColumn::PaymentCheckoutId);
        let sql = format!(
            r#"
            INSERT INTO payment_records
                (user_id, provider, amount, currency, provider_order_id, status_label{})
            VALUES ($1, $2, $3, $4, $5, $6{})
            ON CONFLICT DO NOTHING
            RETURNING {}
            "#,
            if with_checkout { ", provider_checkout_id" } else { "" },
            if with_checkout { ", $7" } else { "" },
            self.payment_columns()
        );

        let mut query = sqlx::query_as::<_, PaymentRow>(&sql)
            .bind(record.user_id)
            .bind(record.provider.as_str())
            .bind(record.amount)
            .bind(&record.currency)
            .bind(record.provider_order_id.as_deref())
            .bind(&record.status_label);
        if with_checkout {
            query = query.bind(record.provider_checkout_id.as_deref());
        }

        match query.fetch_optional(&self.pool).await? {
            Some(row) => Ok(PaymentInsert::Inserted(PaymentRecord::try_from(row)?)),
            None => Ok(PaymentInsert::Duplicate),
        }
    }

    async fn list_payments_for_user(&self, user_id: Uuid) -> BillingResult<Vec<PaymentRecord>> {
        let sql = format!(
            "SELECT {} FROM payment_records WHERE user_id = $1 ORDER BY created_at",
            self.payment_columns()
        );
        let rows: Vec<PaymentRow> = sqlx::query_as(&sql)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(PaymentRecord::try_from).collect()
    }
}

#[async_trait]
impl DeliveryLog for PgStore {
    async fn claim_delivery(
        &self,
        delivery_id: &str,
        event_type: &str,
        payload: &serde_json::Value,
        stuck_after: Duration,
    ) -> BillingResult<bool> {
        // A row comes back only when we inserted it or took it over from a
        // failed, reset, or stuck attempt.
        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO webhook_deliveries
                (delivery_id, event_type, payload, processing_result, processing_started_at)
            VALUES ($1, $2, $3, 'processing', NOW())
            ON CONFLICT (delivery_id) DO UPDATE SET
                processing_result = 'processing',
                processing_started_at = NOW(),
                payload = EXCLUDED.payload,
                error_message = CONCAT('Reclaimed from ', webhook_deliveries.processing_result,
                                       ' at ', NOW()::TEXT)
            WHERE webhook_deliveries.processing_result IN ('error', 'pending_replay')
               OR (webhook_deliveries.processing_result = 'processing'
                   AND webhook_deliveries.processing_started_at
                       < NOW() - make_interval(secs => $4))
            RETURNING id
            "#,
        )
        .bind(delivery_id)
        .bind(event_type)
        .bind(payload)
        .bind(stuck_after.as_secs_f64())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!(
                delivery_id = %delivery_id,
                error = %e,
                "Failed to claim webhook delivery for processing"
            );
            BillingError::from(e)
        })?;

        Ok(claimed.is_some())
    }

    async fn get_delivery(
        &self,
        delivery_id: &str,
    ) -> BillingResult<Option<WebhookDeliveryRecord>> {
        let sql = format!(
            "SELECT {} FROM webhook_deliveries WHERE delivery_id = $1",
            DELIVERY_COLUMNS
        );
        let row: Option<DeliveryRow> = sqlx::query_as(&sql)
            .bind(delivery_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(WebhookDeliveryRecord::try_from).transpose()
    }

    async fn set_delivery_status(
        &self,
        delivery_id: &str,
        status: DeliveryStatus,
        error_message: Option<&str>,
    ) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE webhook_deliveries SET
                processing_result = $2,
                error_message = $3,
                processing_started_at = CASE WHEN $2 = 'replaying' THEN NOW()
                                             ELSE processing_started_at END
            WHERE delivery_id = $1
            "#,
        )
        .bind(delivery_id)
        .bind(status.as_str())
        .bind(error_message)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::NotFound(format!("delivery {}", delivery_id)));
        }
        Ok(())
    }

    async fn list_deliveries(
        &self,
        statuses: &[DeliveryStatus],
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<WebhookDeliveryRecord>> {
        let statuses: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();
        let sql = format!(
            r#"
            SELECT {} FROM webhook_deliveries
            WHERE cardinality($1::TEXT[]) = 0 OR processing_result = ANY($1)
            ORDER BY created_at
            LIMIT $2 OFFSET $3
            "#,
            DELIVERY_COLUMNS
        );
        let rows: Vec<DeliveryRow> = sqlx::query_as(&sql)
            .bind(statuses)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(WebhookDeliveryRecord::try_from)
            .collect()
    }

    async fn reset_delivery(&self, delivery_id: &str) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE webhook_deliveries
            SET processing_result = 'pending_replay',
                error_message = 'Reset for replay'
            WHERE delivery_id = $1
              AND processing_result IN ('processing', 'error')
            "#,
        )
        .bind(delivery_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}
