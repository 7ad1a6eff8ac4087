//! Grant invariants
//!
//! Read-only consistency checks over `credit_grants`. They can be run after a
//! replay or on a schedule; they never write.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    pub invariant: String,
    pub user_ids: Vec<Uuid>,
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Credits may be granted twice
    Critical,
    High,
    Medium,
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

impl InvariantCheckSummary {
    pub fn from_violations(checked_at: OffsetDateTime, violations: Vec<InvariantViolation>) -> Self {
        let checks_run = InvariantChecker::available_checks().len();
        let checks_failed = violations
            .iter()
            .map(|v| v.invariant.as_str())
            .collect::<HashSet<_>>()
            .len();

        Self {
            checked_at,
            checks_run,
            checks_passed: checks_run.saturating_sub(checks_failed),
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct DuplicateSubscriptionRow {
    provider: String,
    provider_subscription_id: String,
    user_ids: Vec<Uuid>,
    grant_count: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct GrantRefRow {
    grant_id: Uuid,
    user_id: Uuid,
    plan_type: String,
    provider_subscription_id: Option<String>,
    expires_at: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
}

#[derive(Debug, sqlx::FromRow)]
struct MultipleUnlinkedRow {
    user_id: Uuid,
    provider: String,
    grant_count: i64,
}

/// Hours after which an unlinked subscription grant is considered stuck
const STALE_UNLINKED_HOURS: i32 = 24;

pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        violations.extend(self.check_unique_subscription_id().await?);
        violations.extend(self.check_one_time_unlinked().await?);
        violations.extend(self.check_canceled_has_expiry().await?);
        violations.extend(self.check_single_unlinked().await?);
        violations.extend(self.check_stale_unlinked().await?);
        violations.extend(self.check_lapsed_still_active().await?);

        Ok(InvariantCheckSummary::from_violations(now, violations))
    }

    /// Invariant 1: one grant per (provider, subscription id)
    async fn check_unique_subscription_id(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<DuplicateSubscriptionRow> = sqlx::query_as(
            r#"
            SELECT provider, provider_subscription_id,
                   ARRAY_AGG(DISTINCT user_id) AS user_ids,
                   COUNT(*) AS grant_count
            FROM credit_grants
            WHERE provider_subscription_id IS NOT NULL
            GROUP BY provider, provider_subscription_id
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "unique_subscription_id".to_string(),
                description: format!(
                    "Subscription {} has {} grants (expected 1)",
                    row.provider_subscription_id, row.grant_count
                ),
                context: serde_json::json!({
                    "provider": row.provider,
                    "subscription_id": row.provider_subscription_id,
                    "grant_count": row.grant_count,
                }),
                user_ids: row.user_ids,
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 2: one-time grants carry neither a subscription id nor an expiry
    async fn check_one_time_unlinked(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<GrantRefRow> = sqlx::query_as(
            r#"
            SELECT id AS grant_id, user_id, plan_type, provider_subscription_id,
                   expires_at, created_at
            FROM credit_grants
            WHERE plan_type = 'one_time'
              AND (provider_subscription_id IS NOT NULL OR expires_at IS NOT NULL)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "one_time_unlinked".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "One-time grant {} has a subscription id or expiry",
                    row.grant_id
                ),
                context: grant_context(&row),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 3: canceled grants know when they end
    async fn check_canceled_has_expiry(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<GrantRefRow> = sqlx::query_as(
            r#"
            SELECT id AS grant_id, user_id, plan_type, provider_subscription_id,
                   expires_at, created_at
            FROM credit_grants
            WHERE canceled_flag
              AND expires_at IS NULL
              AND status = 'active'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "canceled_has_expiry".to_string(),
                user_ids: vec![row.user_id],
                description: format!("Canceled grant {} has no expiry", row.grant_id),
                context: grant_context(&row),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 4: at most one open unlinked subscription grant per user and provider
    async fn check_single_unlinked(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<MultipleUnlinkedRow> = sqlx::query_as(
            r#"
            SELECT user_id, provider, COUNT(*) AS grant_count
            FROM credit_grants
            WHERE provider_subscription_id IS NULL
              AND plan_type <> 'one_time'
              AND status = 'active'
            GROUP BY user_id, provider
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "single_unlinked".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "User has {} unlinked {} subscription grants (expected at most 1)",
                    row.grant_count, row.provider
                ),
                context: serde_json::json!({
                    "provider": row.provider,
                    "grant_count": row.grant_count,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 5: unlinked subscription grants get linked within a day
    ///
    /// A grant that stays unlinked means the activation event was lost or
    /// could not be matched.
    async fn check_stale_unlinked(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<GrantRefRow> = sqlx::query_as(
            r#"
            SELECT id AS grant_id, user_id, plan_type, provider_subscription_id,
                   expires_at, created_at
            FROM credit_grants
            WHERE provider_subscription_id IS NULL
              AND plan_type <> 'one_time'
              AND status = 'active'
              AND created_at < NOW() - make_interval(hours => $1)
            "#,
        )
        .bind(STALE_UNLINKED_HOURS)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "stale_unlinked".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Grant {} still unlinked since {}",
                    row.grant_id, row.created_at
                ),
                context: grant_context(&row),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Invariant 6: the expiry sweep keeps up
    async fn check_lapsed_still_active(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<GrantRefRow> = sqlx::query_as(
            r#"
            SELECT id AS grant_id, user_id, plan_type, provider_subscription_id,
                   expires_at, created_at
            FROM credit_grants
            WHERE status = 'active'
              AND expires_at < NOW() - INTERVAL '2 hours'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "lapsed_still_active".to_string(),
                user_ids: vec![row.user_id],
                description: format!("Grant {} is past its expiry but still active", row.grant_id),
                context: grant_context(&row),
                severity: ViolationSeverity::Low,
            })
            .collect())
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "unique_subscription_id" => self.check_unique_subscription_id().await,
            "one_time_unlinked" => self.check_one_time_unlinked().await,
            "canceled_has_expiry" => self.check_canceled_has_expiry().await,
            "single_unlinked" => self.check_single_unlinked().await,
            "stale_unlinked" => self.check_stale_unlinked().await,
            "lapsed_still_active" => self.check_lapsed_still_active().await,
            _ => Ok(vec![]),
        }
    }

    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "unique_subscription_id",
            "one_time_unlinked",
            "canceled_has_expiry",
            "single_unlinked",
            "stale_unlinked",
            "lapsed_still_active",
        ]
    }
}

fn grant_context(row: &GrantRefRow) -> serde_json::Value {
    serde_json::json!({
        "grant_id": row.grant_id,
        "plan_type": row.plan_type,
        "subscription_id": row.provider_subscription_id,
        "expires_at": row.expires_at.map(|at| at.to_string()),
        "created_at": row.created_at.to_string(),
    })
}
