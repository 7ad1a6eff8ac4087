//! In-memory store
//!
//! Enforces the same uniqueness rules as the PostgreSQL schema so races and
//! idempotency can be exercised without a database. Columns can be marked
//! missing to exercise the schema-tolerant write path.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    DeliveryLog, DeliveryStatus, GrantStore, OptionalColumn, SchemaCapabilities,
    WebhookDeliveryRecord,
};
use crate::error::{BillingError, BillingResult};
use crate::models::{
    CreditGrant, GrantPatch, GrantStatus, NewGrant, NewPaymentRecord, PaymentInsert,
    PaymentRecord, PlanType, Provider,
};

#[derive(Default)]
struct State {
    /// Insertion order doubles as creation order
    grants: Vec<CreditGrant>,
    payments: Vec<PaymentRecord>,
    deliveries: HashMap<String, WebhookDeliveryRecord>,
}

pub struct InMemoryStore {
    capabilities: SchemaCapabilities,
    missing_columns: HashSet<OptionalColumn>,
    state: Mutex<State>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            capabilities: SchemaCapabilities::all(),
            missing_columns: HashSet::new(),
            state: Mutex::new(State::default()),
        }
    }

    /// A store whose schema advertises no optional columns
    pub fn without_optional_columns() -> Self {
        Self {
            capabilities: SchemaCapabilities::none(),
            missing_columns: OptionalColumn::ALL.into_iter().collect(),
            state: Mutex::new(State::default()),
        }
    }

    /// A store that advertises every optional column but fails writes that
    /// include one of `missing`, like a deployment mid-migration.
    pub fn with_missing_columns(missing: &[OptionalColumn]) -> Self {
        Self {
            capabilities: SchemaCapabilities::all(),
            missing_columns: missing.iter().copied().collect(),
            state: Mutex::new(State::default()),
        }
    }

    /// Move a grant's creation time, for exercising the trailing correlation window
    pub async fn backdate_grant(&self, id: Uuid, created_at: OffsetDateTime) {
        let mut state = self.state.lock().await;
        if let Some(grant) = state.grants.iter_mut().find(|g| g.id == id) {
            grant.created_at = created_at;
        }
    }

    pub async fn grant_count(&self) -> usize {
        self.state.lock().await.grants.len()
    }

    pub async fn payment_count(&self) -> usize {
        self.state.lock().await.payments.len()
    }

    fn column_write_fails(&self, column: OptionalColumn) -> bool {
        self.missing_columns.contains(&column) && self.capabilities.supports(column)
    }

    fn column_readable(&self, column: OptionalColumn) -> bool {
        !self.missing_columns.contains(&column)
    }
}

fn is_open_unlinked(grant: &CreditGrant) -> bool {
    grant.provider_subscription_id.is_none()
        && grant.plan_type != PlanType::OneTime
        && grant.status == GrantStatus::Active
}

/// Check a candidate row against every other row's unique keys
fn check_unique(grants: &[CreditGrant], candidate: &CreditGrant) -> BillingResult<()> {
    for other in grants.iter().filter(|g| g.id != candidate.id) {
        if other.provider != candidate.provider {
            continue;
        }
        if candidate.provider_subscription_id.is_some()
            && other.provider_subscription_id == candidate.provider_subscription_id
        {
            return Err(BillingError::RaceLostOnLink(
                "credit_grants_subscription_key".to_string(),
            ));
        }
        if candidate.provider_checkout_id.is_some()
            && other.provider_checkout_id == candidate.provider_checkout_id
        {
            return Err(BillingError::RaceLostOnLink(
                "credit_grants_checkout_key".to_string(),
            ));
        }
        if is_open_unlinked(candidate)
            && is_open_unlinked(other)
            && other.user_id == candidate.user_id
        {
            return Err(BillingError::RaceLostOnLink(
                "credit_grants_single_unlinked".to_string(),
            ));
        }
    }
    Ok(())
}

#[async_trait]
impl GrantStore for InMemoryStore {
    fn capabilities(&self) -> &SchemaCapabilities {
        &self.capabilities
    }

    async fn get_grant(&self, id: Uuid) -> BillingResult<Option<CreditGrant>> {
        let state = self.state.lock().await;
        Ok(state.grants.iter().find(|g| g.id == id).cloned())
    }

    async fn find_by_subscription_id(
        &self,
        provider: Provider,
        subscription_id: &str,
    ) -> BillingResult<Option<CreditGrant>> {
        let state = self.state.lock().await;
        Ok(state
            .grants
            .iter()
            .find(|g| {
                g.provider == provider
                    && g.provider_subscription_id.as_deref() == Some(subscription_id)
            })
            .cloned())
    }

    async fn find_latest_unlinked(
        &self,
        user_id: Uuid,
        provider: Provider,
    ) -> BillingResult<Option<CreditGrant>> {
        let state = self.state.lock().await;
        Ok(state
            .grants
            .iter()
            .rev()
            .find(|g| g.user_id == user_id && g.provider == provider && is_open_unlinked(g))
            .cloned())
    }

    async fn find_by_checkout_id(
        &self,
        provider: Provider,
        checkout_id: &str,
    ) -> BillingResult<Option<CreditGrant>> {
        if !self.column_readable(OptionalColumn::GrantCheckoutId) {
            return Ok(None);
        }
        let state = self.state.lock().await;
        Ok(state
            .grants
            .iter()
            .find(|g| g.provider == provider && g.provider_checkout_id.as_deref() == Some(checkout_id))
            .cloned())
    }

    async fn find_latest_subscription_since(
        &self,
        user_id: Uuid,
        provider: Provider,
        since: OffsetDateTime,
    ) -> BillingResult<Option<CreditGrant>> {
        let state = self.state.lock().await;
        Ok(state
            .grants
            .iter()
            .rev()
            .find(|g| {
                g.user_id == user_id
                    && g.provider == provider
                    && g.plan_type.is_subscription()
                    && g.status == GrantStatus::Active
                    && g.created_at >= since
            })
            .cloned())
    }

    async fn find_uncorrelated_since(
        &self,
        user_id: Uuid,
        provider: Provider,
        since: OffsetDateTime,
    ) -> BillingResult<Option<CreditGrant>> {
        let state = self.state.lock().await;
        Ok(state
            .grants
            .iter()
            .rev()
            .find(|g| {
                g.user_id == user_id
                    && g.provider == provider
                    && g.provider_checkout_id.is_none()
                    && g.created_at >= since
            })
            .cloned())
    }

    async fn list_grants_for_user(&self, user_id: Uuid) -> BillingResult<Vec<CreditGrant>> {
        let state = self.state.lock().await;
        Ok(state
            .grants
            .iter()
            .filter(|g| g.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn list_lapsed(
        &self,
        now: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<CreditGrant>> {
        let state = self.state.lock().await;
        Ok(state
            .grants
            .iter()
            .filter(|g| g.status == GrantStatus::Active && g.expires_at.is_some_and(|at| at < now))
            .take(usize::try_from(limit).unwrap_or(0))
            .cloned()
            .collect())
    }

    async fn insert_grant(&self, grant: &NewGrant) -> BillingResult<CreditGrant> {
        if self.column_write_fails(OptionalColumn::GrantCheckoutId) {
            return Err(BillingError::SchemaColumnMissing(
                OptionalColumn::GrantCheckoutId,
            ));
        }

        let now = OffsetDateTime::now_utc();
        let row = CreditGrant {
            id: Uuid::new_v4(),
            user_id: grant.user_id,
            provider: grant.provider,
            provider_subscription_id: grant.provider_subscription_id.clone(),
            provider_checkout_id: grant.provider_checkout_id.clone(),
            plan_type: grant.plan_type,
            membership: grant.membership,
            credits: grant.credits,
            status: GrantStatus::Active,
            canceled_flag: false,
            expires_at: grant.expires_at,
            version: 1,
            created_at: now,
            updated_at: now,
        };

        let mut state = self.state.lock().await;
        check_unique(&state.grants, &row)?;
        state.grants.push(row.clone());
        Ok(row)
    }

    async fn update_grant(
        &self,
        id: Uuid,
        expected_version: i64,
        patch: &GrantPatch,
    ) -> BillingResult<Option<CreditGrant>> {
        if patch.provider_checkout_id.is_some()
            && self.column_write_fails(OptionalColumn::GrantCheckoutId)
        {
            return Err(BillingError::SchemaColumnMissing(
                OptionalColumn::GrantCheckoutId,
            ));
        }

        let mut state = self.state.lock().await;
        let Some(index) = state
            .grants
            .iter()
            .position(|g| g.id == id && g.version == expected_version)
        else {
            return Ok(None);
        };

        let mut updated = state.grants[index].clone();
        patch.apply_to(&mut updated);
        updated.version += 1;
        updated.updated_at = OffsetDateTime::now_utc();
        check_unique(&state.grants, &updated)?;

        state.grants[index] = updated.clone();
        Ok(Some(updated))
    }

    async fn payment_exists_for_checkout(
        &self,
        provider: Provider,
        checkout_id: &str,
    ) -> BillingResult<bool> {
        if !self.column_readable(OptionalColumn::PaymentCheckoutId) {
            return Ok(false);
        }
        let state = self.state.lock().await;
        Ok(state
            .payments
            .iter()
            .any(|p| p.provider == provider && p.provider_checkout_id.as_deref() == Some(checkout_id)))
    }

    async fn insert_payment(&self, record: &NewPaymentRecord) -> BillingResult<PaymentInsert> {
        if self.column_write_fails(OptionalColumn::PaymentCheckoutId) {
            return Err(BillingError::SchemaColumnMissing(
                OptionalColumn::PaymentCheckoutId,
            ));
        }

        let mut state = self.state.lock().await;
        let duplicate = state.payments.iter().any(|p| {
            p.provider == record.provider
                && ((record.provider_checkout_id.is_some()
                    && p.provider_checkout_id == record.provider_checkout_id)
                    || (record.provider_order_id.is_some()
                        && p.provider_order_id == record.provider_order_id))
        });
        if duplicate {
            return Ok(PaymentInsert::Duplicate);
        }

        let row = PaymentRecord {
            id: Uuid::new_v4(),
            user_id: record.user_id,
            provider: record.provider,
            amount: record.amount,
            currency: record.currency.clone(),
            provider_checkout_id: record.provider_checkout_id.clone(),
            provider_order_id: record.provider_order_id.clone(),
            status_label: record.status_label.clone(),
            created_at: OffsetDateTime::now_utc(),
        };
        state.payments.push(row.clone());
        Ok(PaymentInsert::Inserted(row))
    }

    async fn list_payments_for_user(&self, user_id: Uuid) -> BillingResult<Vec<PaymentRecord>> {
        let state = self.state.lock().await;
        Ok(state
            .payments
            .iter()
            .filter(|p| p.user_id == user_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl DeliveryLog for InMemoryStore {
    async fn claim_delivery(
        &self,
        delivery_id: &str,
        event_type: &str,
        payload: &serde_json::Value,
        stuck_after: Duration,
    ) -> BillingResult<bool> {
        let now = OffsetDateTime::now_utc();
        let mut state = self.state.lock().await;

        match state.deliveries.get_mut(delivery_id) {
            None => {
                state.deliveries.insert(
                    delivery_id.to_string(),
                    WebhookDeliveryRecord {
                        id: Uuid::new_v4(),
                        delivery_id: delivery_id.to_string(),
                        event_type: event_type.to_string(),
                        payload: payload.clone(),
                        processing_result: DeliveryStatus::Processing,
                        processing_started_at: Some(now),
                        error_message: None,
                        created_at: now,
                    },
                );
                Ok(true)
            }
            Some(existing) => {
                let stuck = existing.processing_result == DeliveryStatus::Processing
                    && existing
                        .processing_started_at
                        .map_or(true, |started| now - started > stuck_after);
                let reclaimable = matches!(
                    existing.processing_result,
                    DeliveryStatus::Error | DeliveryStatus::PendingReplay
                );

                if stuck || reclaimable {
                    existing.processing_result = DeliveryStatus::Processing;
                    existing.processing_started_at = Some(now);
                    existing.payload = payload.clone();
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
        }
    }

    async fn get_delivery(
        &self,
        delivery_id: &str,
    ) -> BillingResult<Option<WebhookDeliveryRecord>> {
        let state = self.state.lock().await;
        Ok(state.deliveries.get(delivery_id).cloned())
    }

    async fn set_delivery_status(
        &self,
        delivery_id: &str,
        status: DeliveryStatus,
        error_message: Option<&str>,
    ) -> BillingResult<()> {
        let mut state = self.state.lock().await;
        let record = state
            .deliveries
            .get_mut(delivery_id)
            .ok_or_else(|| BillingError::NotFound(format!("delivery {}", delivery_id)))?;
        record.processing_result = status;
        record.error_message = error_message.map(str::to_string);
        if status == DeliveryStatus::Replaying {
            record.processing_started_at = Some(OffsetDateTime::now_utc());
        }
        Ok(())
    }

    async fn list_deliveries(
        &self,
        statuses: &[DeliveryStatus],
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<WebhookDeliveryRecord>> {
        let state = self.state.lock().await;
        let mut records: Vec<_> = state
            .deliveries
            .values()
            .filter(|d| statuses.is_empty() || statuses.contains(&d.processing_result))
            .cloned()
            .collect();
        records.sort_by_key(|d| d.created_at);
        Ok(records
            .into_iter()
            .skip(usize::try_from(offset).unwrap_or(0))
            .take(usize::try_from(limit).unwrap_or(0))
            .collect())
    }

    async fn reset_delivery(&self, delivery_id: &str) -> BillingResult<bool> {
        let mut state = self.state.lock().await;
        match state.deliveries.get_mut(delivery_id) {
            Some(record)
                if matches!(
                    record.processing_result,
                    DeliveryStatus::Processing | DeliveryStatus::Error
                ) =>
            {
                record.processing_result = DeliveryStatus::PendingReplay;
                record.error_message = Some("Reset for replay".to_string());
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Membership;

    fn subscription_grant(user_id: Uuid, subscription_id: Option<&str>) -> NewGrant {
        NewGrant {
            user_id,
            provider: Provider::Polar,
            provider_subscription_id: subscription_id.map(str::to_string),
            provider_checkout_id: None,
            plan_type: PlanType::Monthly,
            membership: Membership::Pro,
            credits: 500,
            expires_at: Some(OffsetDateTime::now_utc()),
        }
    }

    #[tokio::test]
    async fn test_duplicate_subscription_id_is_rejected() {
        let store = InMemoryStore::new();
        store
            .insert_grant(&subscription_grant(Uuid::new_v4(), Some("sub_1")))
            .await
            .unwrap();
        let err = store
            .insert_grant(&subscription_grant(Uuid::new_v4(), Some("sub_1")))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::RaceLostOnLink(_)));
    }

    #[tokio::test]
    async fn test_single_unlinked_grant_per_user() {
        let store = InMemoryStore::new();
        let user_id = Uuid::new_v4();
        store
            .insert_grant(&subscription_grant(user_id, None))
            .await
            .unwrap();
        let err = store
            .insert_grant(&subscription_grant(user_id, None))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::RaceLostOnLink(_)));
    }

    #[tokio::test]
    async fn test_one_time_grants_do_not_count_as_unlinked() {
        let store = InMemoryStore::new();
        let user_id = Uuid::new_v4();
        let mut one_time = subscription_grant(user_id, None);
        one_time.plan_type = PlanType::OneTime;
        one_time.expires_at = None;
        store.insert_grant(&one_time).await.unwrap();
        store.insert_grant(&one_time).await.unwrap();
        store
            .insert_grant(&subscription_grant(user_id, None))
            .await
            .unwrap();
        assert_eq!(store.grant_count().await, 3);
    }

    #[tokio::test]
    async fn test_stale_version_update_returns_none() {
        let store = InMemoryStore::new();
        let grant = store
            .insert_grant(&subscription_grant(Uuid::new_v4(), Some("sub_1")))
            .await
            .unwrap();
        let patch = GrantPatch {
            credits: Some(10),
            ..Default::default()
        };
        assert!(store
            .update_grant(grant.id, grant.version, &patch)
            .await
            .unwrap()
            .is_some());
        assert!(store
            .update_grant(grant.id, grant.version, &patch)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_claim_delivery_once() {
        let store = InMemoryStore::new();
        let payload = serde_json::json!({"type": "order.paid"});
        let stuck = Duration::from_secs(1800);
        assert!(store
            .claim_delivery("msg_1", "order.paid", &payload, stuck)
            .await
            .unwrap());
        assert!(!store
            .claim_delivery("msg_1", "order.paid", &payload, stuck)
            .await
            .unwrap());

        store
            .set_delivery_status("msg_1", DeliveryStatus::Error, Some("db down"))
            .await
            .unwrap();
        assert!(store
            .claim_delivery("msg_1", "order.paid", &payload, stuck)
            .await
            .unwrap());
    }
}
