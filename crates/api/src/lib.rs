// API crate clippy configuration
#![allow(clippy::result_large_err)] // ApiError carries messages by value
// Test code patterns:
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! creditsync API Library
//!
//! HTTP surface for creditsync: signature-verified provider webhooks plus
//! health probes. All reconciliation happens in `creditsync-billing`.

pub mod config;
pub mod error;
pub mod routes;
pub mod signature;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use signature::{SignatureError, WebhookVerifier};
pub use state::AppState;
