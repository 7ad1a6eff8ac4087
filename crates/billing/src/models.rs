//! Credit grant and payment ledger models

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingError;

/// Billing provider that delivers the webhooks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    Polar,
    Paypal,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Polar => "polar",
            Provider::Paypal => "paypal",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "polar" => Ok(Provider::Polar),
            "paypal" => Ok(Provider::Paypal),
            other => Err(BillingError::Storage(format!("unknown provider '{}'", other))),
        }
    }
}

/// How a purchase is billed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanType {
    OneTime,
    Monthly,
    Yearly,
}

impl PlanType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanType::OneTime => "one_time",
            PlanType::Monthly => "monthly",
            PlanType::Yearly => "yearly",
        }
    }

    pub fn is_subscription(&self) -> bool {
        !matches!(self, PlanType::OneTime)
    }
}

impl fmt::Display for PlanType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlanType {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "one_time" => Ok(PlanType::OneTime),
            "monthly" => Ok(PlanType::Monthly),
            "yearly" => Ok(PlanType::Yearly),
            other => Err(BillingError::Storage(format!("unknown plan type '{}'", other))),
        }
    }
}

/// Membership tier granted by a product
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Membership {
    Starter,
    Pro,
    Premium,
}

impl Membership {
    pub fn as_str(&self) -> &'static str {
        match self {
            Membership::Starter => "starter",
            Membership::Pro => "pro",
            Membership::Premium => "premium",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Membership::Starter => "Starter",
            Membership::Pro => "Pro",
            Membership::Premium => "Premium",
        }
    }
}

impl fmt::Display for Membership {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Membership {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "starter" => Ok(Membership::Starter),
            "pro" => Ok(Membership::Pro),
            "premium" => Ok(Membership::Premium),
            other => Err(BillingError::Storage(format!("unknown membership '{}'", other))),
        }
    }
}

/// Persisted grant status. `Expired` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantStatus {
    Active,
    Expired,
}

impl GrantStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GrantStatus::Active => "active",
            GrantStatus::Expired => "expired",
        }
    }
}

impl FromStr for GrantStatus {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(GrantStatus::Active),
            "expired" => Ok(GrantStatus::Expired),
            other => Err(BillingError::Storage(format!("unknown grant status '{}'", other))),
        }
    }
}

/// One purchase's credit allocation and subscription lifecycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditGrant {
    pub id: Uuid,
    pub user_id: Uuid,
    pub provider: Provider,
    /// Null until an activation event links the grant
    pub provider_subscription_id: Option<String>,
    pub provider_checkout_id: Option<String>,
    pub plan_type: PlanType,
    pub membership: Membership,
    /// Current balance granted by this record. Overwritten on renewal.
    pub credits: i64,
    pub status: GrantStatus,
    /// Will not renew; independent of `status`
    pub canceled_flag: bool,
    pub expires_at: Option<OffsetDateTime>,
    /// Row version for conditional updates
    pub version: i64,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl CreditGrant {
    pub fn is_linked(&self) -> bool {
        self.provider_subscription_id.is_some()
    }

    pub fn is_expired(&self) -> bool {
        self.status == GrantStatus::Expired
    }
}

/// Values for a grant that does not exist yet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewGrant {
    pub user_id: Uuid,
    pub provider: Provider,
    pub provider_subscription_id: Option<String>,
    pub provider_checkout_id: Option<String>,
    pub plan_type: PlanType,
    pub membership: Membership,
    pub credits: i64,
    pub expires_at: Option<OffsetDateTime>,
}

/// Field-level change applied to an existing grant in one conditional update.
/// `None` leaves the column untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GrantPatch {
    pub provider_subscription_id: Option<String>,
    pub provider_checkout_id: Option<String>,
    pub plan_type: Option<PlanType>,
    pub membership: Option<Membership>,
    pub credits: Option<i64>,
    pub status: Option<GrantStatus>,
    pub canceled_flag: Option<bool>,
    pub expires_at: Option<OffsetDateTime>,
}

impl GrantPatch {
    /// True when applying the patch would leave `grant` unchanged
    pub fn is_noop_for(&self, grant: &CreditGrant) -> bool {
        fn same<T: PartialEq>(patch: &Option<T>, current: &T) -> bool {
            patch.as_ref().map_or(true, |p| p == current)
        }

        self.provider_subscription_id
            .as_ref()
            .map_or(true, |id| grant.provider_subscription_id.as_ref() == Some(id))
            && self
                .provider_checkout_id
                .as_ref()
                .map_or(true, |id| grant.provider_checkout_id.as_ref() == Some(id))
            && same(&self.plan_type, &grant.plan_type)
            && same(&self.membership, &grant.membership)
            && same(&self.credits, &grant.credits)
            && same(&self.status, &grant.status)
            && same(&self.canceled_flag, &grant.canceled_flag)
            && self
                .expires_at
                .map_or(true, |at| grant.expires_at == Some(at))
    }

    /// Apply the patch to an in-memory copy of the grant
    pub fn apply_to(&self, grant: &mut CreditGrant) {
        if let Some(id) = &self.provider_subscription_id {
            grant.provider_subscription_id = Some(id.clone());
        }
        if let Some(id) = &self.provider_checkout_id {
            grant.provider_checkout_id = Some(id.clone());
        }
        if let Some(plan_type) = self.plan_type {
            grant.plan_type = plan_type;
        }
        if let Some(membership) = self.membership {
            grant.membership = membership;
        }
        if let Some(credits) = self.credits {
            grant.credits = credits;
        }
        if let Some(status) = self.status {
            grant.status = status;
        }
        if let Some(canceled) = self.canceled_flag {
            grant.canceled_flag = canceled;
        }
        if let Some(expires_at) = self.expires_at {
            grant.expires_at = Some(expires_at);
        }
    }
}

/// Insert-only payment ledger entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub provider: Provider,
    /// Minor currency units
    pub amount: i64,
    pub currency: String,
    pub provider_checkout_id: Option<String>,
    pub provider_order_id: Option<String>,
    pub status_label: String,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPaymentRecord {
    pub user_id: Uuid,
    pub provider: Provider,
    pub amount: i64,
    pub currency: String,
    pub provider_checkout_id: Option<String>,
    pub provider_order_id: Option<String>,
    pub status_label: String,
}

/// Outcome of a ledger insert
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentInsert {
    Inserted(PaymentRecord),
    /// A row with the same checkout or order key already exists
    Duplicate,
}

/// Profile fields this subsystem reads from the user directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: Uuid,
    pub email: String,
    pub display_name: Option<String>,
    /// Pending one-shot bonus offer
    pub has_offer: bool,
}

impl UserProfile {
    /// Name used in notifications; falls back to the email local part
    pub fn greeting_name(&self) -> &str {
        match self.display_name.as_deref() {
            Some(name) if !name.trim().is_empty() => name,
            _ => self.email.split('@').next().unwrap_or(&self.email),
        }
    }
}
