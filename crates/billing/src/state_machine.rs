//! Grant lifecycle
//!
//! Each transition is a pure function from the current grant and the event's
//! facts to either a patch for one conditional update or a reason to skip.
//! A patch that would change nothing is reported as [`SkipReason::Unchanged`],
//! which is how redelivered events become no-ops.

use time::OffsetDateTime;
use uuid::Uuid;

use crate::credits::{compute_expiry, correct_yearly_expiry};
use crate::models::{
    CreditGrant, GrantPatch, GrantStatus, Membership, NewGrant, PlanType, Provider,
};
use crate::resolver::{MatchedBy, ResolvedGrant};

/// Lifecycle state derived from a grant row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantState {
    /// Paid, subscription id not known yet
    Created,
    Active,
    ActiveCanceled,
    Expired,
}

impl GrantState {
    pub fn of(grant: &CreditGrant) -> Self {
        if grant.status == GrantStatus::Expired {
            GrantState::Expired
        } else if grant.canceled_flag {
            GrantState::ActiveCanceled
        } else if grant.plan_type.is_subscription() && !grant.is_linked() {
            GrantState::Created
        } else {
            GrantState::Active
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            GrantState::Created => "created",
            GrantState::Active => "active",
            GrantState::ActiveCanceled => "active_canceled",
            GrantState::Expired => "expired",
        }
    }
}

/// What a product purchase entitles the user to, after the offer bonus
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entitlement {
    pub membership: Membership,
    pub plan_type: PlanType,
    pub credits: i64,
    pub expires_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The grant is expired and accepts no further transitions
    Terminal,
    /// `subscription.active` re-sent for a subscription scheduled to cancel
    CancellationEcho,
    /// The event would not change the grant
    Unchanged,
    /// Subscription-only transition against a one-time grant
    NotSubscription,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::Terminal => "grant is expired",
            SkipReason::CancellationEcho => "cancellation echo",
            SkipReason::Unchanged => "no change",
            SkipReason::NotSubscription => "grant is not a subscription",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Apply(GrantPatch),
    Skip(SkipReason),
}

impl Transition {
    fn checked(grant: &CreditGrant, patch: GrantPatch) -> Self {
        if patch.is_noop_for(grant) {
            Transition::Skip(SkipReason::Unchanged)
        } else {
            Transition::Apply(patch)
        }
    }
}

/// Direction of a plan change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanChange {
    Upgrade,
    Downgrade,
}

impl PlanChange {
    pub fn between(old_credits: i64, new_credits: i64) -> Self {
        if new_credits > old_credits {
            PlanChange::Upgrade
        } else {
            PlanChange::Downgrade
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PlanChange::Upgrade => "upgrade",
            PlanChange::Downgrade => "downgrade",
        }
    }
}

/// Patch with the subscription id attached when the grant was matched any
/// other way than by that id
fn base_patch(resolved: &ResolvedGrant, subscription_id: &str) -> GrantPatch {
    GrantPatch {
        provider_subscription_id: (resolved.matched_by != MatchedBy::SubscriptionId)
            .then(|| subscription_id.to_string()),
        ..Default::default()
    }
}

/// Grant created by a successful checkout. Subscription products stay unlinked.
pub fn checkout_grant(
    user_id: Uuid,
    provider: Provider,
    checkout_id: &str,
    entitlement: &Entitlement,
) -> NewGrant {
    NewGrant {
        user_id,
        provider,
        provider_subscription_id: None,
        provider_checkout_id: Some(checkout_id.to_string()),
        plan_type: entitlement.plan_type,
        membership: entitlement.membership,
        credits: entitlement.credits,
        expires_at: entitlement.expires_at,
    }
}

/// Grant created by an activation that matched nothing
pub fn activation_grant(
    user_id: Uuid,
    provider: Provider,
    subscription_id: &str,
    checkout_id: Option<&str>,
    entitlement: &Entitlement,
) -> NewGrant {
    NewGrant {
        user_id,
        provider,
        provider_subscription_id: Some(subscription_id.to_string()),
        provider_checkout_id: checkout_id.map(str::to_string),
        plan_type: entitlement.plan_type,
        membership: entitlement.membership,
        credits: entitlement.credits,
        expires_at: entitlement.expires_at,
    }
}

/// Whether the provider's period end moves the grant into a new billing period
fn period_advances(grant: &CreditGrant, period_end: Option<OffsetDateTime>) -> bool {
    match (period_end, grant.expires_at) {
        (Some(end), Some(current)) => end > current,
        (Some(_), None) => true,
        (None, _) => false,
    }
}

/// `subscription.active` against a resolved grant.
///
/// `period_end` is the provider's `current_period_end` as sent; `fresh` is the
/// catalog entitlement without any offer bonus.
pub fn on_activation(
    resolved: &ResolvedGrant,
    subscription_id: &str,
    cancel_at_period_end: bool,
    period_end: Option<OffsetDateTime>,
    fresh: &Entitlement,
) -> Transition {
    let grant = &resolved.grant;
    if grant.is_expired() {
        return Transition::Skip(SkipReason::Terminal);
    }

    match (resolved.matched_by, cancel_at_period_end) {
        (MatchedBy::SubscriptionId, true) => Transition::Skip(SkipReason::CancellationEcho),
        (MatchedBy::SubscriptionId, false) if period_advances(grant, period_end) => {
            // Renewal: the balance is reset, never accumulated
            let patch = GrantPatch {
                credits: Some(fresh.credits),
                expires_at: fresh.expires_at,
                canceled_flag: Some(false),
                ..Default::default()
            };
            Transition::checked(grant, patch)
        }
        (MatchedBy::SubscriptionId, false) => {
            // Same period: a redelivery or a lost creation race. Credits stay.
            let patch = GrantPatch {
                canceled_flag: Some(false),
                ..Default::default()
            };
            Transition::checked(grant, patch)
        }
        (MatchedBy::Unlinked | MatchedBy::CheckoutId | MatchedBy::RecentWindow, _) => {
            // Link: keep a bonus the checkout already granted
            let patch = GrantPatch {
                membership: Some(fresh.membership),
                plan_type: Some(fresh.plan_type),
                credits: Some(grant.credits.max(fresh.credits)),
                expires_at: fresh.expires_at,
                canceled_flag: Some(cancel_at_period_end),
                ..base_patch(resolved, subscription_id)
            };
            Transition::checked(grant, patch)
        }
    }
}

/// `subscription.canceled`: keep credits, stop renewal at period end
pub fn on_cancel(
    resolved: &ResolvedGrant,
    subscription_id: &str,
    period_end: Option<OffsetDateTime>,
    started_at: Option<OffsetDateTime>,
    now: OffsetDateTime,
) -> Transition {
    let grant = &resolved.grant;
    if grant.is_expired() {
        return Transition::Skip(SkipReason::Terminal);
    }

    let Some(expiry) = period_end
        .or(grant.expires_at)
        .or_else(|| compute_expiry(grant.plan_type, None, now))
    else {
        return Transition::Skip(SkipReason::NotSubscription);
    };
    let expiry = correct_yearly_expiry(
        grant.plan_type,
        expiry,
        started_at.unwrap_or(grant.created_at),
    );

    let patch = GrantPatch {
        canceled_flag: Some(true),
        expires_at: Some(expiry),
        ..base_patch(resolved, subscription_id)
    };
    Transition::checked(grant, patch)
}

/// `subscription.uncanceled`: clear the flag, leave credits alone
pub fn on_uncancel(resolved: &ResolvedGrant, subscription_id: &str) -> Transition {
    let grant = &resolved.grant;
    if grant.is_expired() {
        return Transition::Skip(SkipReason::Terminal);
    }

    let patch = GrantPatch {
        canceled_flag: Some(false),
        ..base_patch(resolved, subscription_id)
    };
    Transition::checked(grant, patch)
}

/// `subscription.revoked`: immediate and terminal
pub fn on_revoke(resolved: &ResolvedGrant, subscription_id: &str) -> Transition {
    let grant = &resolved.grant;
    if grant.is_expired() {
        return Transition::Skip(SkipReason::Terminal);
    }

    let patch = GrantPatch {
        status: Some(GrantStatus::Expired),
        canceled_flag: Some(true),
        ..base_patch(resolved, subscription_id)
    };
    Transition::checked(grant, patch)
}

/// `subscription.updated`: overwrite tier, plan and credits when the product
/// moved to another tier or plan. Credits alone never signal a change, since a
/// bonus grant always differs from the catalog amount.
pub fn on_plan_change(
    resolved: &ResolvedGrant,
    subscription_id: &str,
    fresh: &Entitlement,
) -> Transition {
    let grant = &resolved.grant;
    if grant.is_expired() {
        return Transition::Skip(SkipReason::Terminal);
    }
    if grant.membership == fresh.membership && grant.plan_type == fresh.plan_type {
        return Transition::Skip(SkipReason::Unchanged);
    }

    let patch = GrantPatch {
        membership: Some(fresh.membership),
        plan_type: Some(fresh.plan_type),
        credits: Some(fresh.credits),
        expires_at: fresh.expires_at,
        ..base_patch(resolved, subscription_id)
    };
    Transition::checked(grant, patch)
}

/// Expiry sweep: a grant past its `expires_at` becomes terminal
pub fn on_lapse(grant: &CreditGrant, now: OffsetDateTime) -> Transition {
    if grant.is_expired() {
        return Transition::Skip(SkipReason::Terminal);
    }
    match grant.expires_at {
        Some(at) if at < now => Transition::Apply(GrantPatch {
            status: Some(GrantStatus::Expired),
            ..Default::default()
        }),
        _ => Transition::Skip(SkipReason::Unchanged),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn grant(subscription_id: Option<&str>, plan_type: PlanType) -> CreditGrant {
        let created = datetime!(2025-01-01 00:00 UTC);
        CreditGrant {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            provider: Provider::Polar,
            provider_subscription_id: subscription_id.map(str::to_string),
            provider_checkout_id: None,
            plan_type,
            membership: Membership::Pro,
            credits: 600,
            status: GrantStatus::Active,
            canceled_flag: false,
            expires_at: Some(datetime!(2025-02-01 00:00 UTC)),
            version: 1,
            created_at: created,
            updated_at: created,
        }
    }

    fn resolved(grant: CreditGrant, matched_by: MatchedBy) -> ResolvedGrant {
        ResolvedGrant { grant, matched_by }
    }

    fn next_period() -> Option<OffsetDateTime> {
        Some(datetime!(2025-03-01 00:00 UTC))
    }

    fn entitlement(credits: i64) -> Entitlement {
        Entitlement {
            membership: Membership::Pro,
            plan_type: PlanType::Monthly,
            credits,
            expires_at: Some(datetime!(2025-03-01 00:00 UTC)),
        }
    }

    #[test]
    fn test_cancellation_echo_is_ignored() {
        let r = resolved(grant(Some("sub_1"), PlanType::Monthly), MatchedBy::SubscriptionId);
        assert_eq!(
            on_activation(&r, "sub_1", true, next_period(), &entitlement(500)),
            Transition::Skip(SkipReason::CancellationEcho)
        );
    }

    #[test]
    fn test_renewal_overwrites_credits() {
        let r = resolved(grant(Some("sub_1"), PlanType::Monthly), MatchedBy::SubscriptionId);
        let Transition::Apply(patch) =
            on_activation(&r, "sub_1", false, next_period(), &entitlement(500))
        else {
            panic!("expected renewal");
        };
        assert_eq!(patch.credits, Some(500));
        assert_eq!(patch.canceled_flag, Some(false));
        assert_eq!(patch.provider_subscription_id, None);
    }

    #[test]
    fn test_repeated_renewal_is_unchanged() {
        let mut g = grant(Some("sub_1"), PlanType::Monthly);
        g.credits = 500;
        g.expires_at = Some(datetime!(2025-03-01 00:00 UTC));
        let r = resolved(g, MatchedBy::SubscriptionId);
        assert_eq!(
            on_activation(&r, "sub_1", false, next_period(), &entitlement(500)),
            Transition::Skip(SkipReason::Unchanged)
        );
    }

    #[test]
    fn test_same_period_activation_keeps_bonus_credits() {
        let mut g = grant(Some("sub_1"), PlanType::Monthly);
        g.credits = 600;
        g.expires_at = next_period();
        let r = resolved(g.clone(), MatchedBy::SubscriptionId);
        assert_eq!(
            on_activation(&r, "sub_1", false, next_period(), &entitlement(500)),
            Transition::Skip(SkipReason::Unchanged)
        );
        assert_eq!(
            on_activation(&r, "sub_1", false, None, &entitlement(500)),
            Transition::Skip(SkipReason::Unchanged)
        );

        // Reactivation inside the period clears the flag only
        g.canceled_flag = true;
        let r = resolved(g, MatchedBy::SubscriptionId);
        let Transition::Apply(patch) =
            on_activation(&r, "sub_1", false, next_period(), &entitlement(500))
        else {
            panic!("expected flag reset");
        };
        assert_eq!(patch.canceled_flag, Some(false));
        assert_eq!(patch.credits, None);
    }

    #[test]
    fn test_link_keeps_bonus_credits() {
        let r = resolved(grant(None, PlanType::Monthly), MatchedBy::Unlinked);
        let Transition::Apply(patch) =
            on_activation(&r, "sub_9", false, next_period(), &entitlement(500))
        else {
            panic!("expected link");
        };
        assert_eq!(patch.provider_subscription_id.as_deref(), Some("sub_9"));
        assert_eq!(patch.credits, Some(600));
    }

    #[test]
    fn test_expired_is_terminal() {
        let mut g = grant(Some("sub_1"), PlanType::Monthly);
        g.status = GrantStatus::Expired;
        let r = resolved(g, MatchedBy::SubscriptionId);
        let now = datetime!(2025-01-15 00:00 UTC);

        assert_eq!(
            on_activation(&r, "sub_1", false, next_period(), &entitlement(500)),
            Transition::Skip(SkipReason::Terminal)
        );
        assert_eq!(on_cancel(&r, "sub_1", None, None, now), Transition::Skip(SkipReason::Terminal));
        assert_eq!(on_uncancel(&r, "sub_1"), Transition::Skip(SkipReason::Terminal));
        assert_eq!(on_revoke(&r, "sub_1"), Transition::Skip(SkipReason::Terminal));
    }

    #[test]
    fn test_cancel_applies_yearly_correction() {
        let r = resolved(grant(Some("sub_1"), PlanType::Yearly), MatchedBy::SubscriptionId);
        let Transition::Apply(patch) = on_cancel(
            &r,
            "sub_1",
            Some(datetime!(2025-02-01 00:00 UTC)),
            Some(datetime!(2025-01-01 00:00 UTC)),
            datetime!(2025-01-20 00:00 UTC),
        ) else {
            panic!("expected cancel");
        };
        assert_eq!(patch.canceled_flag, Some(true));
        assert_eq!(patch.expires_at, Some(datetime!(2026-01-01 00:00 UTC)));
        assert_eq!(patch.credits, None);
    }

    #[test]
    fn test_revoke_expires() {
        let r = resolved(grant(Some("sub_1"), PlanType::Monthly), MatchedBy::SubscriptionId);
        let Transition::Apply(patch) = on_revoke(&r, "sub_1") else {
            panic!("expected revoke");
        };
        assert_eq!(patch.status, Some(GrantStatus::Expired));
        assert_eq!(patch.canceled_flag, Some(true));
    }

    #[test]
    fn test_plan_change_direction() {
        let r = resolved(grant(Some("sub_1"), PlanType::Monthly), MatchedBy::SubscriptionId);
        let premium = Entitlement {
            membership: Membership::Premium,
            credits: 1500,
            ..entitlement(1500)
        };
        assert!(matches!(
            on_plan_change(&r, "sub_1", &premium),
            Transition::Apply(_)
        ));
        assert_eq!(PlanChange::between(600, 1500), PlanChange::Upgrade);
        assert_eq!(PlanChange::between(600, 100), PlanChange::Downgrade);

        // Same tier and plan with a different credit amount is not a change
        assert_eq!(
            on_plan_change(&r, "sub_1", &entitlement(500)),
            Transition::Skip(SkipReason::Unchanged)
        );
        assert_eq!(
            on_plan_change(&r, "sub_1", &entitlement(600)),
            Transition::Skip(SkipReason::Unchanged)
        );
    }

    #[test]
    fn test_state_of() {
        let mut g = grant(None, PlanType::Monthly);
        assert_eq!(GrantState::of(&g), GrantState::Created);
        g.provider_subscription_id = Some("sub_1".into());
        assert_eq!(GrantState::of(&g), GrantState::Active);
        g.canceled_flag = true;
        assert_eq!(GrantState::of(&g), GrantState::ActiveCanceled);
        g.status = GrantStatus::Expired;
        assert_eq!(GrantState::of(&g), GrantState::Expired);
    }

    #[test]
    fn test_lapse() {
        let g = grant(Some("sub_1"), PlanType::Monthly);
        assert!(matches!(
            on_lapse(&g, datetime!(2025-03-01 00:00 UTC)),
            Transition::Apply(_)
        ));
        assert_eq!(
            on_lapse(&g, datetime!(2025-01-15 00:00 UTC)),
            Transition::Skip(SkipReason::Unchanged)
        );
    }
}
