//! Storage seams for grants, the payment ledger and the delivery log
//!
//! Every read-modify-write of a grant goes through [`GrantStore::update_grant`],
//! which is a compare-and-swap on the row `version`. Uniqueness of linked
//! subscription ids, of checkout ids, and of the single unlinked subscription grant
//! per user/provider is enforced by the store and reported as
//! [`BillingError::RaceLostOnLink`].

pub mod memory;
pub mod postgres;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::models::{
    CreditGrant, GrantPatch, NewGrant, NewPaymentRecord, PaymentInsert, PaymentRecord, Provider,
};

pub use memory::InMemoryStore;
pub use postgres::PgStore;

/// Columns that may be absent in deployments that have not run every migration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum OptionalColumn {
    /// `credit_grants.provider_checkout_id`
    GrantCheckoutId,
    /// `payment_records.provider_checkout_id`
    PaymentCheckoutId,
}

impl OptionalColumn {
    pub const ALL: [OptionalColumn; 2] = [
        OptionalColumn::GrantCheckoutId,
        OptionalColumn::PaymentCheckoutId,
    ];

    pub fn table(&self) -> &'static str {
        match self {
            OptionalColumn::GrantCheckoutId => "credit_grants",
            OptionalColumn::PaymentCheckoutId => "payment_records",
        }
    }

    pub fn column(&self) -> &'static str {
        "provider_checkout_id"
    }

    /// Map a server-reported column name back to the optional column it belongs to.
    /// Both optional columns share a name, so the grant column wins; the payment
    /// insert path re-targets the error itself.
    pub fn from_column_name(name: &str) -> Option<Self> {
        match name {
            "provider_checkout_id" => Some(OptionalColumn::GrantCheckoutId),
            _ => None,
        }
    }
}

impl fmt::Display for OptionalColumn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.table(), self.column())
    }
}

/// Which optional columns a store can write. Starts from a probe of the live
/// schema and is narrowed when a write discovers a column is missing.
#[derive(Debug, Default)]
pub struct SchemaCapabilities {
    grant_checkout_id: AtomicBool,
    payment_checkout_id: AtomicBool,
}

impl SchemaCapabilities {
    pub fn all() -> Self {
        Self::with_columns(&OptionalColumn::ALL)
    }

    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_columns(columns: &[OptionalColumn]) -> Self {
        let caps = Self::default();
        for column in columns {
            caps.flag(*column).store(true, Ordering::Relaxed);
        }
        caps
    }

    fn flag(&self, column: OptionalColumn) -> &AtomicBool {
        match column {
            OptionalColumn::GrantCheckoutId => &self.grant_checkout_id,
            OptionalColumn::PaymentCheckoutId => &self.payment_checkout_id,
        }
    }

    pub fn supports(&self, column: OptionalColumn) -> bool {
        self.flag(column).load(Ordering::Relaxed)
    }

    /// Stop writing `column` for the rest of the process lifetime
    pub fn disable(&self, column: OptionalColumn) {
        if self.flag(column).swap(false, Ordering::Relaxed) {
            tracing::warn!(
                column = %column,
                "Optional column missing from schema, writes will omit it"
            );
        }
    }

    /// Whether any checkout id is persisted at all
    pub fn persists_checkout_ids(&self) -> bool {
        self.supports(OptionalColumn::GrantCheckoutId)
            || self.supports(OptionalColumn::PaymentCheckoutId)
    }
}

/// Grant and payment persistence
#[async_trait]
pub trait GrantStore: Send + Sync {
    fn capabilities(&self) -> &SchemaCapabilities;

    async fn get_grant(&self, id: Uuid) -> BillingResult<Option<CreditGrant>>;

    async fn find_by_subscription_id(
        &self,
        provider: Provider,
        subscription_id: &str,
    ) -> BillingResult<Option<CreditGrant>>;

    /// Most recent active, subscription-typed grant with no subscription id
    async fn find_latest_unlinked(
        &self,
        user_id: Uuid,
        provider: Provider,
    ) -> BillingResult<Option<CreditGrant>>;

    /// Any grant carrying this checkout id. Returns `None` when the column is unsupported.
    async fn find_by_checkout_id(
        &self,
        provider: Provider,
        checkout_id: &str,
    ) -> BillingResult<Option<CreditGrant>>;

    /// Most recent active, subscription-typed grant created at or after `since`
    async fn find_latest_subscription_since(
        &self,
        user_id: Uuid,
        provider: Provider,
        since: OffsetDateTime,
    ) -> BillingResult<Option<CreditGrant>>;

    /// Most recent grant (any plan type) created at or after `since` that
    /// carries no checkout id. Every grant qualifies when the column is unsupported.
    async fn find_uncorrelated_since(
        &self,
        user_id: Uuid,
        provider: Provider,
        since: OffsetDateTime,
    ) -> BillingResult<Option<CreditGrant>>;

    async fn list_grants_for_user(&self, user_id: Uuid) -> BillingResult<Vec<CreditGrant>>;

    /// Active grants whose `expires_at` is before `now`
    async fn list_lapsed(&self, now: OffsetDateTime, limit: i64)
        -> BillingResult<Vec<CreditGrant>>;

    /// Insert a grant. Unique violations surface as `RaceLostOnLink`; a missing
    /// optional column surfaces as `SchemaColumnMissing`.
    async fn insert_grant(&self, grant: &NewGrant) -> BillingResult<CreditGrant>;

    /// Conditionally apply `patch` when the row still has `expected_version`.
    /// Returns `Ok(None)` when another writer got there first.
    async fn update_grant(
        &self,
        id: Uuid,
        expected_version: i64,
        patch: &GrantPatch,
    ) -> BillingResult<Option<CreditGrant>>;

    async fn payment_exists_for_checkout(
        &self,
        provider: Provider,
        checkout_id: &str,
    ) -> BillingResult<bool>;

    async fn insert_payment(&self, record: &NewPaymentRecord) -> BillingResult<PaymentInsert>;

    async fn list_payments_for_user(&self, user_id: Uuid) -> BillingResult<Vec<PaymentRecord>>;
}

/// Processing state of a webhook delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Processing,
    Success,
    Error,
    PendingReplay,
    Replaying,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Processing => "processing",
            DeliveryStatus::Success => "success",
            DeliveryStatus::Error => "error",
            DeliveryStatus::PendingReplay => "pending_replay",
            DeliveryStatus::Replaying => "replaying",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "processing" => Some(DeliveryStatus::Processing),
            "success" => Some(DeliveryStatus::Success),
            "error" => Some(DeliveryStatus::Error),
            "pending_replay" => Some(DeliveryStatus::PendingReplay),
            "replaying" => Some(DeliveryStatus::Replaying),
            _ => None,
        }
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stored webhook delivery
#[derive(Debug, Clone, Serialize)]
pub struct WebhookDeliveryRecord {
    pub id: Uuid,
    pub delivery_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub processing_result: DeliveryStatus,
    pub processing_started_at: Option<OffsetDateTime>,
    pub error_message: Option<String>,
    pub created_at: OffsetDateTime,
}

/// Per-delivery claim log
#[async_trait]
pub trait DeliveryLog: Send + Sync {
    /// Atomically claim exclusive processing rights for a delivery.
    ///
    /// Succeeds for a new delivery, for one that previously failed, for one reset
    /// for replay, and for one stuck in `processing` longer than `stuck_after`.
    async fn claim_delivery(
        &self,
        delivery_id: &str,
        event_type: &str,
        payload: &serde_json::Value,
        stuck_after: Duration,
    ) -> BillingResult<bool>;

    async fn get_delivery(&self, delivery_id: &str)
        -> BillingResult<Option<WebhookDeliveryRecord>>;

    async fn set_delivery_status(
        &self,
        delivery_id: &str,
        status: DeliveryStatus,
        error_message: Option<&str>,
    ) -> BillingResult<()>;

    async fn list_deliveries(
        &self,
        statuses: &[DeliveryStatus],
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<WebhookDeliveryRecord>>;

    /// Move a `processing` or `error` delivery to `pending_replay`.
    /// Returns `false` when the delivery is missing or in another state.
    async fn reset_delivery(&self, delivery_id: &str) -> BillingResult<bool>;
}

/// Insert a grant, writing only the optional columns the store supports and
/// retrying once without a column the schema turns out not to have.
pub async fn insert_grant_tolerant(
    store: &dyn GrantStore,
    grant: &NewGrant,
) -> BillingResult<CreditGrant> {
    let mut grant = grant.clone();
    if !store.capabilities().supports(OptionalColumn::GrantCheckoutId) {
        grant.provider_checkout_id = None;
    }

    match store.insert_grant(&grant).await {
        Err(BillingError::SchemaColumnMissing(column)) => {
            store.capabilities().disable(OptionalColumn::GrantCheckoutId);
            grant.provider_checkout_id = None;
            tracing::warn!(
                column = %column,
                user_id = %grant.user_id,
                "Retrying grant insert without optional column"
            );
            store.insert_grant(&grant).await.map_err(|e| match e {
                BillingError::SchemaColumnMissing(column) => BillingError::Storage(format!(
                    "column {} still missing after retry",
                    column
                )),
                other => other,
            })
        }
        other => other,
    }
}

/// Update a grant with the same optional-column policy as [`insert_grant_tolerant`]
pub async fn update_grant_tolerant(
    store: &dyn GrantStore,
    grant: &CreditGrant,
    patch: &GrantPatch,
) -> BillingResult<Option<CreditGrant>> {
    let mut patch = patch.clone();
    if !store.capabilities().supports(OptionalColumn::GrantCheckoutId) {
        patch.provider_checkout_id = None;
    }

    match store.update_grant(grant.id, grant.version, &patch).await {
        Err(BillingError::SchemaColumnMissing(column)) => {
            store.capabilities().disable(OptionalColumn::GrantCheckoutId);
            patch.provider_checkout_id = None;
            tracing::warn!(
                column = %column,
                grant_id = %grant.id,
                "Retrying grant update without optional column"
            );
            store
                .update_grant(grant.id, grant.version, &patch)
                .await
                .map_err(|e| match e {
                    BillingError::SchemaColumnMissing(column) => BillingError::Storage(format!(
                        "column {} still missing after retry",
                        column
                    )),
                    other => other,
                })
        }
        other => other,
    }
}

/// Insert a ledger row with the optional-column policy applied to the checkout id
pub async fn insert_payment_tolerant(
    store: &dyn GrantStore,
    record: &NewPaymentRecord,
) -> BillingResult<PaymentInsert> {
    let mut record = record.clone();
    if !store.capabilities().supports(OptionalColumn::PaymentCheckoutId) {
        record.provider_checkout_id = None;
    }

    match store.insert_payment(&record).await {
        Err(BillingError::SchemaColumnMissing(_)) => {
            store
                .capabilities()
                .disable(OptionalColumn::PaymentCheckoutId);
            record.provider_checkout_id = None;
            tracing::warn!(
                column = %OptionalColumn::PaymentCheckoutId,
                user_id = %record.user_id,
                "Retrying payment insert without optional column"
            );
            store.insert_payment(&record).await.map_err(|e| match e {
                BillingError::SchemaColumnMissing(_) => BillingError::Storage(format!(
                    "column {} still missing after retry",
                    OptionalColumn::PaymentCheckoutId
                )),
                other => other,
            })
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capabilities_disable_is_sticky() {
        let caps = SchemaCapabilities::all();
        assert!(caps.supports(OptionalColumn::GrantCheckoutId));
        caps.disable(OptionalColumn::GrantCheckoutId);
        assert!(!caps.supports(OptionalColumn::GrantCheckoutId));
        assert!(caps.supports(OptionalColumn::PaymentCheckoutId));
        assert!(caps.persists_checkout_ids());
    }

    #[test]
    fn test_no_capabilities_persist_nothing() {
        assert!(!SchemaCapabilities::none().persists_checkout_ids());
    }

    #[test]
    fn test_optional_column_display() {
        assert_eq!(
            OptionalColumn::PaymentCheckoutId.to_string(),
            "payment_records.provider_checkout_id"
        );
    }

    #[test]
    fn test_delivery_status_parse() {
        assert_eq!(
            DeliveryStatus::parse("pending_replay"),
            Some(DeliveryStatus::PendingReplay)
        );
        assert_eq!(DeliveryStatus::parse("done"), None);
    }
}
