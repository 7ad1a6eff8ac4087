//! Reconciliation orchestrator
//!
//! One entry point per event kind. Each handler resolves the user and grant,
//! asks the state machine for a transition, commits it with a conditional
//! update, and hands side effects to the dispatcher.

use std::sync::Arc;

use time::OffsetDateTime;
use uuid::Uuid;

use crate::attribution::AttributionRecorder;
use crate::catalog::{ProductCatalog, ProductCatalogEntry};
use crate::config::ReconcileConfig;
use crate::credits::{compute_expiry, CreditCalculator};
use crate::dispatcher::{Confirmation, Conversion, SideEffectDispatcher, SideEffects};
use crate::email::{NotificationKind, Notifier};
use crate::error::{BillingError, BillingResult};
use crate::events::{
    BillingReason, CheckoutPayload, EventKind, OrderPayload, PayloadIdentity, RefundPayload,
    SubscriptionPayload,
};
use crate::idempotency::IdempotencyGuard;
use crate::models::{CreditGrant, GrantPatch, NewPaymentRecord, Provider, UserProfile};
use crate::resolver::{EntityResolver, GrantLookup, MatchedBy, ResolvedGrant};
use crate::state_machine::{self, Entitlement, GrantState, PlanChange, Transition};
use crate::store::{insert_grant_tolerant, update_grant_tolerant, GrantStore};
use crate::users::UserDirectory;

/// What processing an event did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// A grant or the ledger changed
    Applied,
    /// Nothing to do; the event was a repeat or carries no effect
    Skipped(String),
    /// The event can never be applied and is acknowledged anyway
    Dropped(String),
}

/// External collaborators the orchestrator drives
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn GrantStore>,
    pub users: Arc<dyn UserDirectory>,
    pub notifier: Arc<dyn Notifier>,
    pub attribution: Arc<dyn AttributionRecorder>,
}

/// Result of committing a lifecycle transition
enum Committed {
    Updated {
        before: ResolvedGrant,
        after: CreditGrant,
    },
    Skipped(String),
}

#[derive(Clone)]
pub struct Reconciler {
    provider: Provider,
    store: Arc<dyn GrantStore>,
    users: Arc<dyn UserDirectory>,
    catalog: Arc<ProductCatalog>,
    resolver: EntityResolver,
    guard: IdempotencyGuard,
    calculator: CreditCalculator,
    dispatcher: SideEffectDispatcher,
    max_attempts: u32,
}

impl Reconciler {
    pub fn new(
        provider: Provider,
        catalog: ProductCatalog,
        config: &ReconcileConfig,
        collaborators: Collaborators,
    ) -> Self {
        let Collaborators {
            store,
            users,
            notifier,
            attribution,
        } = collaborators;

        Self {
            provider,
            resolver: EntityResolver::new(Arc::clone(&store), config.correlation_window),
            guard: IdempotencyGuard::new(Arc::clone(&store), config.correlation_window),
            calculator: CreditCalculator::new(config.offer_bonus),
            dispatcher: SideEffectDispatcher::new(
                Arc::clone(&store),
                Arc::clone(&users),
                notifier,
                attribution,
            ),
            catalog: Arc::new(catalog),
            max_attempts: config.grant_update_max_attempts,
            store,
            users,
        }
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    /// Apply one event. Non-retryable failures are logged and turned into
    /// [`Outcome::Dropped`]; retryable ones propagate so the provider redelivers.
    pub async fn process_event(&self, event: EventKind) -> BillingResult<Outcome> {
        let event_type = event.name().to_string();

        let result = match event {
            EventKind::CheckoutUpdated(payload) => self.handle_checkout(&payload).await,
            EventKind::SubscriptionActive(payload) => self.handle_activation(&payload).await,
            EventKind::SubscriptionCanceled(payload) => self.handle_cancel(&payload).await,
            EventKind::SubscriptionUncanceled(payload) => self.handle_uncancel(&payload).await,
            EventKind::SubscriptionRevoked(payload) => self.handle_revoke(&payload).await,
            EventKind::SubscriptionUpdated(payload) => self.handle_plan_change(&payload).await,
            EventKind::OrderPaid(payload) => self.handle_order_paid(&payload).await,
            EventKind::RefundCreated(payload) => Ok(self.handle_refund(&payload)),
            EventKind::Unhandled(name) => {
                tracing::info!(event_type = %name, "Ignoring unhandled event type");
                Ok(Outcome::Skipped(format!("unhandled event type {}", name)))
            }
        };

        match result {
            Err(BillingError::AlreadyApplied(reason)) => {
                tracing::info!(event_type = %event_type, reason = %reason, "Event already applied");
                Ok(Outcome::Skipped(reason))
            }
            Err(e) if !e.is_retryable() => {
                tracing::warn!(event_type = %event_type, error = %e, "Dropping event");
                Ok(Outcome::Dropped(e.to_string()))
            }
            Err(e) => {
                tracing::error!(event_type = %event_type, error = %e, "Event processing failed");
                Err(e)
            }
            Ok(outcome) => Ok(outcome),
        }
    }

    fn product_for(&self, product_id: Option<&str>) -> BillingResult<&ProductCatalogEntry> {
        let product_id = product_id
            .ok_or_else(|| BillingError::UnresolvedProduct("payload has no product id".into()))?;
        self.catalog.get_product(product_id)
    }

    fn entitlement(
        &self,
        product: &ProductCatalogEntry,
        with_offer: bool,
        period_end: Option<OffsetDateTime>,
        now: OffsetDateTime,
    ) -> Entitlement {
        Entitlement {
            membership: product.membership,
            plan_type: product.plan_type,
            credits: self.calculator.compute_credits(product.credits, with_offer),
            expires_at: compute_expiry(product.plan_type, period_end, now),
        }
    }

    fn purchase_effects(
        &self,
        user_id: Uuid,
        profile: Option<UserProfile>,
        entitlement: &Entitlement,
        payment: NewPaymentRecord,
    ) -> SideEffects {
        let consume_offer = profile.as_ref().is_some_and(|p| p.has_offer);
        let conversion = Conversion {
            amount_paid: payment.amount,
            currency: payment.currency.clone(),
        };
        let notification = match profile {
            Some(profile) => Some(Confirmation {
                kind: NotificationKind {
                    membership: entitlement.membership,
                    is_subscription: entitlement.plan_type.is_subscription(),
                },
                profile,
                credits: entitlement.credits,
            }),
            None => {
                tracing::warn!(user_id = %user_id, "No profile for user, skipping confirmation");
                None
            }
        };

        SideEffects {
            payment: Some(payment),
            consume_offer,
            notification,
            conversion: Some(conversion),
        }
    }

    async fn handle_checkout(&self, payload: &CheckoutPayload) -> BillingResult<Outcome> {
        if !payload.is_succeeded() {
            return Ok(Outcome::Skipped(format!(
                "checkout status is {}",
                payload.status
            )));
        }

        let user_id = self.resolver.resolve_user(payload)?;
        let product = self.product_for(payload.product_id())?;
        let now = OffsetDateTime::now_utc();

        if let Some(reason) = self
            .guard
            .checkout_applied(self.provider, payload.checkout_key(), user_id, now)
            .await?
        {
            return Err(BillingError::AlreadyApplied(reason.as_str().to_string()));
        }
        // Activation may have arrived first and created the grant already
        if let Some(subscription_id) = payload.subscription_id.as_deref() {
            if self
                .store
                .find_by_subscription_id(self.provider, subscription_id)
                .await?
                .is_some()
            {
                return Err(BillingError::AlreadyApplied(format!(
                    "subscription {} already granted",
                    subscription_id
                )));
            }
        }
        let checkout_id = payload
            .checkout_key()
            .ok_or_else(|| BillingError::AlreadyApplied("checkout id missing".into()))?;

        let profile = self.users.get_profile(user_id).await?;
        let has_offer = profile.as_ref().is_some_and(|p| p.has_offer);
        let entitlement = self.entitlement(product, has_offer, None, now);

        let new_grant =
            state_machine::checkout_grant(user_id, self.provider, checkout_id, &entitlement);
        let grant = match insert_grant_tolerant(self.store.as_ref(), &new_grant).await {
            Ok(grant) => grant,
            Err(BillingError::RaceLostOnLink(constraint)) => {
                tracing::info!(
                    user_id = %user_id,
                    checkout_id = %checkout_id,
                    constraint = %constraint,
                    "Checkout grant insert conflicted, re-resolving"
                );
                self.merge_into_existing(user_id, checkout_id, &entitlement)
                    .await?
            }
            Err(e) => return Err(e),
        };

        tracing::info!(
            user_id = %user_id,
            grant_id = %grant.id,
            checkout_id = %checkout_id,
            membership = %grant.membership,
            plan_type = %grant.plan_type,
            credits = grant.credits,
            state = GrantState::of(&grant).as_str(),
            "Checkout granted credits"
        );

        let payment = NewPaymentRecord {
            user_id,
            provider: self.provider,
            amount: payload.amount_paid().unwrap_or(product.price),
            currency: payload
                .currency
                .clone()
                .unwrap_or_else(|| product.currency.clone()),
            provider_checkout_id: Some(checkout_id.to_string()),
            provider_order_id: None,
            status_label: "paid".to_string(),
        };
        let effects = self.purchase_effects(user_id, profile, &entitlement, payment);
        self.dispatcher.dispatch(user_id, effects).await;

        Ok(Outcome::Applied)
    }

    /// A checkout insert lost a uniqueness race. Either the same checkout was
    /// applied concurrently, or the user already holds an unlinked subscription
    /// grant that this purchase now refreshes.
    async fn merge_into_existing(
        &self,
        user_id: Uuid,
        checkout_id: &str,
        entitlement: &Entitlement,
    ) -> BillingResult<CreditGrant> {
        for _ in 0..self.max_attempts {
            if self
                .store
                .find_by_checkout_id(self.provider, checkout_id)
                .await?
                .is_some()
            {
                return Err(BillingError::AlreadyApplied(
                    "checkout applied concurrently".to_string(),
                ));
            }

            let Some(existing) = self
                .store
                .find_latest_unlinked(user_id, self.provider)
                .await?
            else {
                return Err(BillingError::RaceLostOnLink(format!(
                    "no grant found after conflict for checkout {}",
                    checkout_id
                )));
            };

            let patch = GrantPatch {
                provider_checkout_id: Some(checkout_id.to_string()),
                membership: Some(entitlement.membership),
                plan_type: Some(entitlement.plan_type),
                credits: Some(existing.credits.max(entitlement.credits)),
                expires_at: entitlement.expires_at,
                ..Default::default()
            };
            if let Some(updated) =
                update_grant_tolerant(self.store.as_ref(), &existing, &patch).await?
            {
                return Ok(updated);
            }
        }

        Err(BillingError::ConcurrentModification(format!(
            "unlinked grant for checkout {}",
            checkout_id
        )))
    }

    async fn handle_activation(&self, payload: &SubscriptionPayload) -> BillingResult<Outcome> {
        let user_id = self.resolver.resolve_user(payload)?;
        let product = self.product_for(payload.product_id())?;
        let profile = self.users.get_profile(user_id).await?;
        let has_offer = profile.as_ref().is_some_and(|p| p.has_offer);

        let lookup = GrantLookup {
            user_id,
            provider: self.provider,
            subscription_id: &payload.id,
            checkout_id: payload.checkout_key(),
        };

        for attempt in 1..=self.max_attempts {
            let now = OffsetDateTime::now_utc();
            let plain = self.entitlement(product, false, payload.current_period_end, now);

            let Some(resolved) = self.resolver.resolve_grant(lookup, now).await? else {
                let entitlement =
                    self.entitlement(product, has_offer, payload.current_period_end, now);
                let new_grant = state_machine::activation_grant(
                    user_id,
                    self.provider,
                    &payload.id,
                    payload.checkout_key(),
                    &entitlement,
                );

                match insert_grant_tolerant(self.store.as_ref(), &new_grant).await {
                    Ok(grant) => {
                        tracing::info!(
                            user_id = %user_id,
                            grant_id = %grant.id,
                            subscription_id = %payload.id,
                            credits = grant.credits,
                            "Activation created linked grant"
                        );
                        let payment = NewPaymentRecord {
                            user_id,
                            provider: self.provider,
                            amount: payload.amount.unwrap_or(product.price),
                            currency: payload
                                .currency
                                .clone()
                                .unwrap_or_else(|| product.currency.clone()),
                            provider_checkout_id: payload.checkout_key().map(str::to_string),
                            provider_order_id: None,
                            status_label: "paid".to_string(),
                        };
                        let effects =
                            self.purchase_effects(user_id, profile, &entitlement, payment);
                        self.dispatcher.dispatch(user_id, effects).await;
                        return Ok(Outcome::Applied);
                    }
                    Err(BillingError::RaceLostOnLink(constraint)) => {
                        tracing::info!(
                            subscription_id = %payload.id,
                            constraint = %constraint,
                            attempt = attempt,
                            "Activation insert lost race, re-resolving"
                        );
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            };

            let transition = state_machine::on_activation(
                &resolved,
                &payload.id,
                payload.cancel_at_period_end,
                payload.current_period_end,
                &plain,
            );
            let patch = match transition {
                Transition::Skip(reason) => {
                    tracing::info!(
                        subscription_id = %payload.id,
                        grant_id = %resolved.grant.id,
                        reason = reason.as_str(),
                        "Activation skipped"
                    );
                    return Ok(Outcome::Skipped(reason.as_str().to_string()));
                }
                Transition::Apply(patch) => patch,
            };

            match update_grant_tolerant(self.store.as_ref(), &resolved.grant, &patch).await {
                Ok(Some(updated)) => {
                    let action = if resolved.matched_by == MatchedBy::SubscriptionId {
                        "renewed"
                    } else {
                        "linked"
                    };
                    tracing::info!(
                        subscription_id = %payload.id,
                        grant_id = %updated.id,
                        matched_by = resolved.matched_by.as_str(),
                        credits = updated.credits,
                        action = action,
                        "Activation applied"
                    );
                    return Ok(Outcome::Applied);
                }
                Ok(None) | Err(BillingError::RaceLostOnLink(_)) => {
                    tracing::debug!(
                        subscription_id = %payload.id,
                        grant_id = %resolved.grant.id,
                        attempt = attempt,
                        "Grant changed underneath activation, retrying"
                    );
                }
                Err(e) => return Err(e),
            }
        }

        Err(BillingError::ConcurrentModification(format!(
            "subscription {}",
            payload.id
        )))
    }

    /// Resolve the grant a lifecycle event refers to. The subscription id alone
    /// is enough when the grant is linked; otherwise the user must resolve.
    async fn resolve_lifecycle(
        &self,
        payload: &SubscriptionPayload,
    ) -> BillingResult<ResolvedGrant> {
        match self.resolver.resolve_user(payload) {
            Ok(user_id) => {
                let lookup = GrantLookup {
                    user_id,
                    provider: self.provider,
                    subscription_id: &payload.id,
                    checkout_id: payload.checkout_key(),
                };
                self.resolver
                    .resolve_existing(lookup)
                    .await?
                    .ok_or_else(|| BillingError::GrantNotFound(payload.id.clone()))
            }
            Err(unresolved) => {
                let grant = self
                    .store
                    .find_by_subscription_id(self.provider, &payload.id)
                    .await?
                    .ok_or(unresolved)?;
                Ok(ResolvedGrant {
                    grant,
                    matched_by: MatchedBy::SubscriptionId,
                })
            }
        }
    }

    /// Resolve, decide and conditionally update, re-resolving on conflicts
    async fn commit_lifecycle(
        &self,
        payload: &SubscriptionPayload,
        decide: &(dyn Fn(&ResolvedGrant, OffsetDateTime) -> Transition + Send + Sync),
    ) -> BillingResult<Committed> {
        for attempt in 1..=self.max_attempts {
            let resolved = self.resolve_lifecycle(payload).await?;
            let patch = match decide(&resolved, OffsetDateTime::now_utc()) {
                Transition::Skip(reason) => {
                    return Ok(Committed::Skipped(reason.as_str().to_string()))
                }
                Transition::Apply(patch) => patch,
            };

            match update_grant_tolerant(self.store.as_ref(), &resolved.grant, &patch).await {
                Ok(Some(after)) => {
                    return Ok(Committed::Updated {
                        before: resolved,
                        after,
                    })
                }
                Ok(None) | Err(BillingError::RaceLostOnLink(_)) => {
                    tracing::debug!(
                        subscription_id = %payload.id,
                        grant_id = %resolved.grant.id,
                        attempt = attempt,
                        "Grant changed underneath lifecycle event, retrying"
                    );
                }
                Err(e) => return Err(e),
            }
        }

        Err(BillingError::ConcurrentModification(format!(
            "subscription {}",
            payload.id
        )))
    }

    fn lifecycle_outcome(&self, event: &str, subscription_id: &str, committed: Committed) -> Outcome {
        match committed {
            Committed::Updated { before, after } => {
                tracing::info!(
                    subscription_id = %subscription_id,
                    grant_id = %after.id,
                    matched_by = before.matched_by.as_str(),
                    from = GrantState::of(&before.grant).as_str(),
                    to = GrantState::of(&after).as_str(),
                    expires_at = ?after.expires_at,
                    "Applied {}",
                    event
                );
                Outcome::Applied
            }
            Committed::Skipped(reason) => {
                tracing::info!(
                    subscription_id = %subscription_id,
                    reason = %reason,
                    "Skipped {}",
                    event
                );
                Outcome::Skipped(reason)
            }
        }
    }

    async fn handle_cancel(&self, payload: &SubscriptionPayload) -> BillingResult<Outcome> {
        let subscription_id = payload.id.as_str();
        let period_end = payload.current_period_end;
        let started_at = payload.started_at;
        let decide = move |resolved: &ResolvedGrant, now: OffsetDateTime| {
            state_machine::on_cancel(resolved, subscription_id, period_end, started_at, now)
        };

        let committed = self.commit_lifecycle(payload, &decide).await?;
        Ok(self.lifecycle_outcome("cancellation", subscription_id, committed))
    }

    async fn handle_uncancel(&self, payload: &SubscriptionPayload) -> BillingResult<Outcome> {
        let subscription_id = payload.id.as_str();
        let decide = move |resolved: &ResolvedGrant, _: OffsetDateTime| {
            state_machine::on_uncancel(resolved, subscription_id)
        };

        let committed = self.commit_lifecycle(payload, &decide).await?;
        Ok(self.lifecycle_outcome("uncancellation", subscription_id, committed))
    }

    async fn handle_revoke(&self, payload: &SubscriptionPayload) -> BillingResult<Outcome> {
        let subscription_id = payload.id.as_str();
        let decide = move |resolved: &ResolvedGrant, _: OffsetDateTime| {
            state_machine::on_revoke(resolved, subscription_id)
        };

        let committed = self.commit_lifecycle(payload, &decide).await?;
        Ok(self.lifecycle_outcome("revocation", subscription_id, committed))
    }

    async fn handle_plan_change(&self, payload: &SubscriptionPayload) -> BillingResult<Outcome> {
        let product = self.product_for(payload.product_id())?;
        let subscription_id = payload.id.as_str();
        let period_end = payload.current_period_end;
        let decide = |resolved: &ResolvedGrant, now: OffsetDateTime| {
            let fresh = self.entitlement(product, false, period_end, now);
            state_machine::on_plan_change(resolved, subscription_id, &fresh)
        };

        let committed = self.commit_lifecycle(payload, &decide).await?;
        if let Committed::Updated { before, after } = &committed {
            let direction = PlanChange::between(before.grant.credits, after.credits);
            let payment = NewPaymentRecord {
                user_id: after.user_id,
                provider: self.provider,
                amount: payload.amount.unwrap_or(product.price),
                currency: payload
                    .currency
                    .clone()
                    .unwrap_or_else(|| product.currency.clone()),
                provider_checkout_id: None,
                provider_order_id: Some(plan_change_key(
                    subscription_id,
                    &product.product_id,
                    period_end,
                )),
                status_label: direction.as_str().to_string(),
            };
            self.dispatcher
                .dispatch(
                    after.user_id,
                    SideEffects {
                        payment: Some(payment),
                        ..Default::default()
                    },
                )
                .await;
        }

        Ok(self.lifecycle_outcome("plan change", subscription_id, committed))
    }

    async fn handle_order_paid(&self, payload: &OrderPayload) -> BillingResult<Outcome> {
        let user_id = self.resolver.resolve_user(payload)?;
        let reason = payload.billing_reason();

        // Initial purchases are recorded by the checkout or activation that granted them
        if reason == BillingReason::Initial {
            if let Some(checkout_id) = payload.checkout_key() {
                return Ok(Outcome::Skipped(format!(
                    "initial order for checkout {} is recorded by the checkout",
                    checkout_id
                )));
            }
        }

        let currency = match payload.currency.clone() {
            Some(currency) => currency,
            None => self
                .product_for(payload.product_id.as_deref())
                .map(|p| p.currency.clone())
                .unwrap_or_else(|_| "usd".to_string()),
        };
        let payment = NewPaymentRecord {
            user_id,
            provider: self.provider,
            amount: payload.amount_paid(),
            currency,
            provider_checkout_id: None,
            provider_order_id: Some(payload.id.clone()),
            status_label: reason.as_str().to_string(),
        };

        let report = self
            .dispatcher
            .dispatch(
                user_id,
                SideEffects {
                    payment: Some(payment),
                    ..Default::default()
                },
            )
            .await;

        tracing::info!(
            user_id = %user_id,
            order_id = %payload.id,
            billing_reason = reason.as_str(),
            subscription_id = ?payload.subscription_id,
            recorded = report.payment_recorded,
            "Order paid"
        );

        if report.payment_recorded {
            Ok(Outcome::Applied)
        } else {
            Ok(Outcome::Skipped(format!("order {} not recorded", payload.id)))
        }
    }

    fn handle_refund(&self, payload: &RefundPayload) -> Outcome {
        tracing::info!(
            refund_id = %payload.id,
            order_id = ?payload.order_id,
            subscription_id = ?payload.subscription_id,
            amount = ?payload.amount,
            currency = ?payload.currency,
            reason = ?payload.reason,
            "Refund created, credits left unchanged"
        );
        Outcome::Skipped("refunds are logged only".to_string())
    }
}

/// Ledger key for a plan change. The provider sends no order id with
/// `subscription.updated`, so the row is keyed by subscription, target product
/// and billing period.
fn plan_change_key(
    subscription_id: &str,
    product_id: &str,
    period_end: Option<OffsetDateTime>,
) -> String {
    let period = period_end
        .map(|at| at.unix_timestamp().to_string())
        .unwrap_or_else(|| "none".to_string());
    format!("plan_change:{}:{}:{}", subscription_id, product_id, period)
}
