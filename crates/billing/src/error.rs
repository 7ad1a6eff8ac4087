//! Billing error types

use creditsync_shared::{classify, PgFailure};
use thiserror::Error;

use crate::store::OptionalColumn;

/// Reconciliation errors
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Could not resolve a user for the event: {0}")]
    UnresolvedUser(String),

    #[error("Product not found in catalog: {0}")]
    UnresolvedProduct(String),

    #[error("Event already applied: {0}")]
    AlreadyApplied(String),

    #[error("Optional column missing from schema: {0}")]
    SchemaColumnMissing(OptionalColumn),

    #[error("Lost a race creating or linking a grant: {0}")]
    RaceLostOnLink(String),

    #[error("Concurrent modification detected: {0}")]
    ConcurrentModification(String),

    #[error("No grant found for subscription: {0}")]
    GrantNotFound(String),

    #[error("Invalid webhook payload: {0}")]
    InvalidPayload(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Notification failed: {0}")]
    Notification(String),

    #[error("Attribution failed: {0}")]
    Attribution(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl BillingError {
    /// Whether the provider should redeliver the event.
    ///
    /// Resolution and payload errors will not change on redelivery, so they are
    /// acknowledged and dropped. Storage-shaped errors are retried because every
    /// handler is idempotent.
    pub fn is_retryable(&self) -> bool {
        match self {
            BillingError::UnresolvedUser(_)
            | BillingError::UnresolvedProduct(_)
            | BillingError::AlreadyApplied(_)
            | BillingError::InvalidPayload(_)
            | BillingError::Notification(_)
            | BillingError::Attribution(_)
            | BillingError::NotFound(_) => false,

            BillingError::SchemaColumnMissing(_)
            | BillingError::RaceLostOnLink(_)
            | BillingError::ConcurrentModification(_)
            | BillingError::GrantNotFound(_)
            | BillingError::Database(_)
            | BillingError::Storage(_)
            | BillingError::Config(_) => true,
        }
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        match classify(&err) {
            PgFailure::UniqueViolation(constraint) => BillingError::RaceLostOnLink(
                constraint.unwrap_or_else(|| "unique constraint".to_string()),
            ),
            PgFailure::UndefinedColumn(column) => match OptionalColumn::from_column_name(&column) {
                Some(optional) => BillingError::SchemaColumnMissing(optional),
                None => BillingError::Storage(err.to_string()),
            },
            PgFailure::Other => BillingError::Database(err.to_string()),
        }
    }
}

pub type BillingResult<T> = Result<T, BillingError>;
