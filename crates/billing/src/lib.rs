// Billing crate clippy configuration
#![allow(clippy::result_large_err)] // BillingError variants carry owned context strings
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Creditsync Billing Module
//!
//! Reconciles payment-provider webhooks into per-user credit grants.
//!
//! ## Features
//!
//! - **Entity Resolution**: Map provider identifiers to internal users and grants
//! - **Idempotency**: Redelivered and out-of-order events apply at most once
//! - **Grant Lifecycle**: Activation, renewal, cancellation, revocation, plan changes
//! - **Credit Calculation**: Catalog credits, one-shot offer bonus, expiry math
//! - **Side Effects**: Payment ledger, offer consumption, confirmation email, attribution
//! - **Webhooks**: Per-delivery claim log with replay of failed deliveries
//! - **Maintenance**: Expiry sweep and grant invariant checks

pub mod attribution;
pub mod catalog;
pub mod config;
pub mod credits;
pub mod dispatcher;
pub mod email;
pub mod error;
pub mod events;
pub mod idempotency;
pub mod invariants;
pub mod models;
pub mod reconcile;
pub mod resolver;
pub mod state_machine;
pub mod store;
pub mod sweep;
pub mod users;
pub mod webhooks;

#[cfg(test)]
mod test_support;

// Attribution
pub use attribution::{AttributionRecorder, HttpAttributionRecorder};

// Catalog
pub use catalog::{ProductCatalog, ProductCatalogEntry};

// Config
pub use config::{OfferBonus, ReconcileConfig};

// Credits
pub use credits::{compute_expiry, correct_yearly_expiry, CreditCalculator};

// Dispatcher
pub use dispatcher::{DispatchReport, SideEffectDispatcher, SideEffects};

// Email
pub use email::{EmailConfig, NotificationKind, Notifier, ResendNotifier};

// Error
pub use error::{BillingError, BillingResult};

// Events
pub use events::{EventKind, WebhookEnvelope};

// Idempotency
pub use idempotency::{AppliedReason, IdempotencyGuard};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Models
pub use models::{
    CreditGrant, GrantStatus, Membership, PaymentRecord, PlanType, Provider, UserProfile,
};

// Reconcile
pub use reconcile::{Collaborators, Outcome, Reconciler};

// Resolver
pub use resolver::{EntityResolver, MatchedBy, ResolvedGrant};

// State machine
pub use state_machine::{GrantState, Transition};

// Store
pub use store::{
    DeliveryLog, DeliveryStatus, GrantStore, InMemoryStore, OptionalColumn, PgStore,
    SchemaCapabilities, WebhookDeliveryRecord,
};

// Sweep
pub use sweep::{ExpirySweep, SweepReport};

// Users
pub use users::{InMemoryUserDirectory, PgUserDirectory, UserDirectory};

// Webhooks
pub use webhooks::{DeliveryOutcome, WebhookHandler, WebhookReplayResult};

use std::sync::Arc;

use sqlx::PgPool;

/// Grants examined per expiry sweep run
const SWEEP_BATCH_SIZE: i64 = 500;

/// Main billing service that combines all reconciliation functionality
pub struct BillingService {
    pub store: Arc<PgStore>,
    pub webhooks: WebhookHandler,
    pub sweep: ExpirySweep,
    pub invariants: InvariantChecker,
}

impl BillingService {
    /// Create a new billing service from environment variables.
    ///
    /// Probes the schema for optional columns before the first event is handled.
    pub async fn from_env(pool: PgPool) -> BillingResult<Self> {
        let config = ReconcileConfig::from_env()?;
        let catalog = ProductCatalog::from_env()?;
        Self::new(pool, catalog, config).await
    }

    /// Create a new billing service with explicit config
    pub async fn new(
        pool: PgPool,
        catalog: ProductCatalog,
        config: ReconcileConfig,
    ) -> BillingResult<Self> {
        let store = Arc::new(PgStore::connect(pool.clone()).await?);

        let collaborators = Collaborators {
            store: store.clone(),
            users: Arc::new(PgUserDirectory::new(pool.clone())),
            notifier: Arc::new(ResendNotifier::from_env()),
            attribution: Arc::new(HttpAttributionRecorder::from_env()),
        };
        let reconciler = Reconciler::new(Provider::Polar, catalog, &config, collaborators);

        Ok(Self {
            webhooks: WebhookHandler::new(
                reconciler,
                store.clone(),
                config.delivery_stuck_after,
            ),
            sweep: ExpirySweep::new(store.clone(), SWEEP_BATCH_SIZE),
            invariants: InvariantChecker::new(pool),
            store,
        })
    }
}
