//! Checkout idempotency guard
//!
//! Subscription re-deliveries are detected structurally by the state machine;
//! this guard covers checkout completions, which have no subscription id yet.
//! Lookups go payment ledger, then grant checkout id, then the correlation
//! window over grants that carry no checkout id.

use std::sync::Arc;

use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::models::{CreditGrant, GrantPatch, Provider};
use crate::store::{update_grant_tolerant, GrantStore, OptionalColumn};

/// Why a checkout counts as already applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppliedReason {
    PaymentRecorded,
    GrantCarriesCheckout,
    RecentGrant,
    /// No usable checkout id; fail closed
    Ambiguous,
}

impl AppliedReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppliedReason::PaymentRecorded => "payment already recorded for checkout",
            AppliedReason::GrantCarriesCheckout => "grant already carries checkout id",
            AppliedReason::RecentGrant => "grant created within correlation window",
            AppliedReason::Ambiguous => "checkout id missing",
        }
    }
}

#[derive(Clone)]
pub struct IdempotencyGuard {
    store: Arc<dyn GrantStore>,
    window: time::Duration,
}

impl IdempotencyGuard {
    pub fn new(store: Arc<dyn GrantStore>, window: time::Duration) -> Self {
        Self { store, window }
    }

    /// `Some(reason)` when the checkout was already applied. Storage errors propagate.
    pub async fn checkout_applied(
        &self,
        provider: Provider,
        checkout_id: Option<&str>,
        user_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<Option<AppliedReason>> {
        let Some(checkout_id) = checkout_id.filter(|id| !id.trim().is_empty()) else {
            return Ok(Some(AppliedReason::Ambiguous));
        };

        let capabilities = self.store.capabilities();

        if capabilities.supports(OptionalColumn::PaymentCheckoutId)
            && self
                .store
                .payment_exists_for_checkout(provider, checkout_id)
                .await?
        {
            return Ok(Some(AppliedReason::PaymentRecorded));
        }

        if capabilities.supports(OptionalColumn::GrantCheckoutId)
            && self
                .store
                .find_by_checkout_id(provider, checkout_id)
                .await?
                .is_some()
        {
            return Ok(Some(AppliedReason::GrantCarriesCheckout));
        }

        // Heuristic: a grant created moments ago that no checkout id ties to
        // anything. That is either a schema without the columns, or an
        // activation that arrived first without its checkout id. False
        // positives drop a genuine second purchase made inside the window.
        if let Some(grant) = self
            .store
            .find_uncorrelated_since(user_id, provider, now - self.window)
            .await?
        {
            tracing::warn!(
                user_id = %user_id,
                checkout_id = %checkout_id,
                grant_id = %grant.id,
                subscription_id = ?grant.provider_subscription_id,
                "Checkout treated as applied by correlation window"
            );
            self.claim_for_checkout(&grant, checkout_id).await;
            return Ok(Some(AppliedReason::RecentGrant));
        }

        Ok(None)
    }

    /// Stamp the checkout id on a window-matched grant so redeliveries after
    /// the window closes still find it
    async fn claim_for_checkout(&self, grant: &CreditGrant, checkout_id: &str) {
        if !self.store.capabilities().supports(OptionalColumn::GrantCheckoutId) {
            return;
        }

        let patch = GrantPatch {
            provider_checkout_id: Some(checkout_id.to_string()),
            ..Default::default()
        };
        match update_grant_tolerant(self.store.as_ref(), grant, &patch).await {
            Ok(Some(_)) => {}
            Ok(None) => tracing::debug!(
                grant_id = %grant.id,
                "Grant changed before checkout id could be attached"
            ),
            Err(e) => tracing::warn!(
                grant_id = %grant.id,
                checkout_id = %checkout_id,
                error = %e,
                "Failed to attach checkout id to correlated grant"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Membership, NewGrant, NewPaymentRecord, PlanType};
    use crate::store::InMemoryStore;

    fn one_time(user_id: Uuid, checkout_id: Option<&str>) -> NewGrant {
        NewGrant {
            user_id,
            provider: Provider::Polar,
            provider_subscription_id: None,
            provider_checkout_id: checkout_id.map(str::to_string),
            plan_type: PlanType::OneTime,
            membership: Membership::Starter,
            credits: 100,
            expires_at: None,
        }
    }

    #[tokio::test]
    async fn test_missing_checkout_id_fails_closed() {
        let guard = IdempotencyGuard::new(Arc::new(InMemoryStore::new()), time::Duration::minutes(5));
        let applied = guard
            .checkout_applied(Provider::Polar, Some("  "), Uuid::new_v4(), OffsetDateTime::now_utc())
            .await
            .unwrap();
        assert_eq!(applied, Some(AppliedReason::Ambiguous));
    }

    #[tokio::test]
    async fn test_payment_record_marks_applied() {
        let store = Arc::new(InMemoryStore::new());
        let user_id = Uuid::new_v4();
        store
            .insert_payment(&NewPaymentRecord {
                user_id,
                provider: Provider::Polar,
                amount: 500,
                currency: "usd".into(),
                provider_checkout_id: Some("co_1".into()),
                provider_order_id: None,
                status_label: "paid".into(),
            })
            .await
            .unwrap();

        let guard = IdempotencyGuard::new(store, time::Duration::minutes(5));
        let now = OffsetDateTime::now_utc();
        assert_eq!(
            guard
                .checkout_applied(Provider::Polar, Some("co_1"), user_id, now)
                .await
                .unwrap(),
            Some(AppliedReason::PaymentRecorded)
        );
        assert_eq!(
            guard
                .checkout_applied(Provider::Polar, Some("co_2"), user_id, now)
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_window_ignores_grants_tied_to_another_checkout() {
        let user_id = Uuid::new_v4();
        let store = Arc::new(InMemoryStore::new());
        store
            .insert_grant(&one_time(user_id, Some("co_1")))
            .await
            .unwrap();

        let guard = IdempotencyGuard::new(store, time::Duration::minutes(5));
        assert_eq!(
            guard
                .checkout_applied(Provider::Polar, Some("co_2"), user_id, OffsetDateTime::now_utc())
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_window_matches_legacy_schema() {
        let user_id = Uuid::new_v4();
        let legacy = Arc::new(InMemoryStore::without_optional_columns());
        legacy.insert_grant(&one_time(user_id, None)).await.unwrap();

        let guard = IdempotencyGuard::new(legacy, time::Duration::minutes(5));
        assert_eq!(
            guard
                .checkout_applied(Provider::Polar, Some("co_2"), user_id, OffsetDateTime::now_utc())
                .await
                .unwrap(),
            Some(AppliedReason::RecentGrant)
        );
    }

    #[tokio::test]
    async fn test_window_matches_uncorrelated_activation_and_attaches_checkout() {
        let user_id = Uuid::new_v4();
        let store = Arc::new(InMemoryStore::new());
        let activation = store
            .insert_grant(&NewGrant {
                provider_subscription_id: Some("sub_1".into()),
                plan_type: PlanType::Monthly,
                membership: Membership::Pro,
                ..one_time(user_id, None)
            })
            .await
            .unwrap();

        let guard = IdempotencyGuard::new(store.clone(), time::Duration::minutes(5));
        let now = OffsetDateTime::now_utc();
        assert_eq!(
            guard
                .checkout_applied(Provider::Polar, Some("co_1"), user_id, now)
                .await
                .unwrap(),
            Some(AppliedReason::RecentGrant)
        );

        let stamped = store.get_grant(activation.id).await.unwrap().unwrap();
        assert_eq!(stamped.provider_checkout_id.as_deref(), Some("co_1"));

        // Redelivery outside the window still resolves through the grant
        let later = now + time::Duration::hours(1);
        assert_eq!(
            guard
                .checkout_applied(Provider::Polar, Some("co_1"), user_id, later)
                .await
                .unwrap(),
            Some(AppliedReason::GrantCarriesCheckout)
        );
    }
}
