//! Application state

use std::sync::Arc;

use creditsync_billing::WebhookHandler;
use sqlx::PgPool;

use crate::{
    config::Config,
    signature::{SignatureError, WebhookVerifier},
};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
    /// Delivery claim log and reconciler
    pub webhooks: Arc<WebhookHandler>,
    pub verifier: WebhookVerifier,
}

impl AppState {
    pub fn new(
        pool: PgPool,
        config: Config,
        webhooks: WebhookHandler,
    ) -> Result<Self, SignatureError> {
        let verifier = WebhookVerifier::new(&config.polar_webhook_secret)?;
        tracing::info!(
            provider = %webhooks.reconciler().provider(),
            "Webhook verification configured"
        );

        Ok(Self {
            pool,
            config,
            webhooks: Arc::new(webhooks),
            verifier,
        })
    }
}
