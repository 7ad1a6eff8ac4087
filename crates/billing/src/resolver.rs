//! Entity resolution
//!
//! Finds the internal user behind a payload and the grant a subscription event
//! should act on.

use std::sync::Arc;

use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::events::PayloadIdentity;
use crate::models::{CreditGrant, GrantStatus, Provider};
use crate::store::{GrantStore, OptionalColumn};

/// Which resolution step found the grant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchedBy {
    /// Exact provider subscription id
    SubscriptionId,
    /// The user's open unlinked subscription grant
    Unlinked,
    /// Unlinked grant carrying the event's checkout id
    CheckoutId,
    /// Most recent subscription grant inside the correlation window
    RecentWindow,
}

impl MatchedBy {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchedBy::SubscriptionId => "subscription_id",
            MatchedBy::Unlinked => "unlinked",
            MatchedBy::CheckoutId => "checkout_id",
            MatchedBy::RecentWindow => "recent_window",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedGrant {
    pub grant: CreditGrant,
    pub matched_by: MatchedBy,
}

/// What a subscription event references
#[derive(Debug, Clone, Copy)]
pub struct GrantLookup<'a> {
    pub user_id: Uuid,
    pub provider: Provider,
    pub subscription_id: &'a str,
    pub checkout_id: Option<&'a str>,
}

#[derive(Clone)]
pub struct EntityResolver {
    store: Arc<dyn GrantStore>,
    correlation_window: time::Duration,
}

impl EntityResolver {
    pub fn new(store: Arc<dyn GrantStore>, correlation_window: time::Duration) -> Self {
        Self {
            store,
            correlation_window,
        }
    }

    /// Platform metadata first, then the provider's external customer id.
    /// The provider's own customer id is never trusted alone.
    pub fn resolve_user(&self, payload: &dyn PayloadIdentity) -> BillingResult<Uuid> {
        if let Some(user_id) = payload.metadata_user_id() {
            return Ok(user_id);
        }

        if let Some(external) = payload.external_customer_id() {
            return Uuid::parse_str(external.trim()).map_err(|_| {
                BillingError::UnresolvedUser(format!(
                    "external customer id '{}' is not a user id",
                    external
                ))
            });
        }

        Err(BillingError::UnresolvedUser(
            "no metadata.user_id or external customer id".to_string(),
        ))
    }

    /// Resolve the grant an activation applies to, first match wins
    pub async fn resolve_grant(
        &self,
        lookup: GrantLookup<'_>,
        now: OffsetDateTime,
    ) -> BillingResult<Option<ResolvedGrant>> {
        if let Some(resolved) = self.resolve_existing(lookup).await? {
            return Ok(Some(resolved));
        }

        let since = now - self.correlation_window;
        let recent = self
            .store
            .find_latest_subscription_since(lookup.user_id, lookup.provider, since)
            .await?;

        Ok(recent.map(|grant| {
            tracing::warn!(
                user_id = %lookup.user_id,
                grant_id = %grant.id,
                subscription_id = %lookup.subscription_id,
                previous_subscription_id = ?grant.provider_subscription_id,
                "Matched grant by correlation window, relinking"
            );
            ResolvedGrant {
                grant,
                matched_by: MatchedBy::RecentWindow,
            }
        }))
    }

    /// Resolution without the correlation-window fallback, for lifecycle events
    /// that must never touch an unrelated subscription
    pub async fn resolve_existing(
        &self,
        lookup: GrantLookup<'_>,
    ) -> BillingResult<Option<ResolvedGrant>> {
        if let Some(grant) = self
            .store
            .find_by_subscription_id(lookup.provider, lookup.subscription_id)
            .await?
        {
            return Ok(Some(ResolvedGrant {
                grant,
                matched_by: MatchedBy::SubscriptionId,
            }));
        }

        if let Some(grant) = self
            .store
            .find_latest_unlinked(lookup.user_id, lookup.provider)
            .await?
        {
            return Ok(Some(ResolvedGrant {
                grant,
                matched_by: MatchedBy::Unlinked,
            }));
        }

        if let Some(checkout_id) = lookup.checkout_id {
            if self
                .store
                .capabilities()
                .supports(OptionalColumn::GrantCheckoutId)
            {
                let found = self
                    .store
                    .find_by_checkout_id(lookup.provider, checkout_id)
                    .await?
                    .filter(|g| !g.is_linked() && g.status == GrantStatus::Active);
                if let Some(grant) = found {
                    return Ok(Some(ResolvedGrant {
                        grant,
                        matched_by: MatchedBy::CheckoutId,
                    }));
                }
            }
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CheckoutPayload;
    use crate::models::{Membership, NewGrant, PlanType};
    use crate::store::InMemoryStore;
    use serde_json::Value;

    fn resolver(store: Arc<InMemoryStore>) -> EntityResolver {
        EntityResolver::new(store, time::Duration::minutes(5))
    }

    fn new_grant(user_id: Uuid, subscription_id: Option<&str>, plan_type: PlanType) -> NewGrant {
        NewGrant {
            user_id,
            provider: Provider::Polar,
            provider_subscription_id: subscription_id.map(str::to_string),
            provider_checkout_id: None,
            plan_type,
            membership: Membership::Pro,
            credits: 500,
            expires_at: plan_type
                .is_subscription()
                .then(|| OffsetDateTime::now_utc() + time::Duration::days(30)),
        }
    }

    fn lookup(user_id: Uuid, subscription_id: &str) -> GrantLookup<'_> {
        GrantLookup {
            user_id,
            provider: Provider::Polar,
            subscription_id,
            checkout_id: None,
        }
    }

    #[test]
    fn test_resolve_user_prefers_metadata() {
        let store = Arc::new(InMemoryStore::new());
        let user_id = Uuid::new_v4();
        let mut payload = CheckoutPayload {
            external_customer_id: Some(Uuid::new_v4().to_string()),
            ..Default::default()
        };
        payload
            .metadata
            .insert("user_id".into(), Value::String(user_id.to_string()));

        assert_eq!(resolver(store).resolve_user(&payload).unwrap(), user_id);
    }

    #[test]
    fn test_resolve_user_never_uses_provider_customer_id() {
        let store = Arc::new(InMemoryStore::new());
        let payload = CheckoutPayload {
            customer_id: Some("cus_123".into()),
            ..Default::default()
        };
        assert!(matches!(
            resolver(store).resolve_user(&payload),
            Err(BillingError::UnresolvedUser(_))
        ));
    }

    #[tokio::test]
    async fn test_exact_id_wins_over_unlinked() {
        let store = Arc::new(InMemoryStore::new());
        let user_id = Uuid::new_v4();
        let linked = store
            .insert_grant(&new_grant(user_id, Some("sub_1"), PlanType::Monthly))
            .await
            .unwrap();
        store
            .insert_grant(&new_grant(user_id, None, PlanType::Monthly))
            .await
            .unwrap();

        let resolved = resolver(store)
            .resolve_grant(lookup(user_id, "sub_1"), OffsetDateTime::now_utc())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resolved.grant.id, linked.id);
        assert_eq!(resolved.matched_by, MatchedBy::SubscriptionId);
    }

    #[tokio::test]
    async fn test_unlinked_one_time_grants_are_ignored() {
        let store = Arc::new(InMemoryStore::new());
        let user_id = Uuid::new_v4();
        store
            .insert_grant(&new_grant(user_id, None, PlanType::OneTime))
            .await
            .unwrap();

        let resolved = resolver(store)
            .resolve_grant(lookup(user_id, "sub_2"), OffsetDateTime::now_utc())
            .await
            .unwrap();
        assert!(resolved.is_none());
    }

    #[tokio::test]
    async fn test_recent_window_fallback() {
        let store = Arc::new(InMemoryStore::new());
        let user_id = Uuid::new_v4();
        let previous = store
            .insert_grant(&new_grant(user_id, Some("sub_old"), PlanType::Monthly))
            .await
            .unwrap();

        let now = OffsetDateTime::now_utc();
        let resolver = resolver(store.clone());

        let resolved = resolver
            .resolve_grant(lookup(user_id, "sub_new"), now)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resolved.grant.id, previous.id);
        assert_eq!(resolved.matched_by, MatchedBy::RecentWindow);

        assert!(resolver
            .resolve_existing(lookup(user_id, "sub_new"))
            .await
            .unwrap()
            .is_none());

        store
            .backdate_grant(previous.id, now - time::Duration::minutes(10))
            .await;
        assert!(resolver
            .resolve_grant(lookup(user_id, "sub_new"), now)
            .await
            .unwrap()
            .is_none());
    }
}
