//! creditsync shared utilities
//!
//! Database pool construction, migrations and PostgreSQL error classification
//! used by the API server, the worker and the billing crate.

pub mod db;

pub use db::*;
