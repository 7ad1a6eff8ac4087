//! Purchase confirmation emails
//!
//! Sends transactional emails via the Resend API. Callers run this off the
//! acknowledgment path; failures are reported, never retried by the provider.

use async_trait::async_trait;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;

use crate::error::{BillingError, BillingResult};
use crate::models::Membership;

/// Confirmation category
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotificationKind {
    pub membership: Membership,
    pub is_subscription: bool,
}

impl NotificationKind {
    pub fn subject(&self, app_name: &str) -> String {
        if self.is_subscription {
            format!(
                "Welcome to {} {}",
                app_name,
                self.membership.display_name()
            )
        } else {
            format!("Your {} credits have arrived", app_name)
        }
    }
}

/// Confirmation sender
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(
        &self,
        kind: NotificationKind,
        email: &str,
        name: &str,
        credits: i64,
    ) -> BillingResult<()>;
}

/// Email configuration
#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub resend_api_key: String,
    pub email_from: String,
    pub app_name: String,
    pub dashboard_url: String,
}

impl EmailConfig {
    pub fn from_env() -> Self {
        Self {
            resend_api_key: std::env::var("RESEND_API_KEY").unwrap_or_default(),
            email_from: std::env::var("EMAIL_FROM")
                .unwrap_or_else(|_| "Creditsync <noreply@localhost>".to_string()),
            app_name: std::env::var("APP_NAME").unwrap_or_else(|_| "Creditsync".to_string()),
            dashboard_url: std::env::var("PUBLIC_URL")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.resend_api_key.is_empty()
    }
}

const RESEND_URL: &str = "https://api.resend.com/emails";
const SEND_ATTEMPTS: usize = 3;

/// Resend-backed notifier
#[derive(Clone)]
pub struct ResendNotifier {
    config: EmailConfig,
    client: reqwest::Client,
}

impl ResendNotifier {
    pub fn new(config: EmailConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    pub fn from_env() -> Self {
        Self::new(EmailConfig::from_env())
    }

    fn render(&self, kind: NotificationKind, name: &str, credits: i64) -> String {
        let headline = if kind.is_subscription {
            format!(
                "Your {} membership is active",
                kind.membership.display_name()
            )
        } else {
            "Thanks for your purchase".to_string()
        };

        format!(
            r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"></head>
<body style="font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif; line-height: 1.6; color: #333; max-width: 600px; margin: 0 auto; padding: 20px;">
    <h2 style="color: #6366f1;">{headline}</h2>
    <p>Hi {name},</p>
    <p><strong>{credits}</strong> credits have been added to your account.</p>
    <p>
        <a href="{dashboard}" style="display: inline-block; padding: 12px 24px; background-color: #6366f1; color: white; text-decoration: none; border-radius: 6px; font-weight: bold;">
            Start creating
        </a>
    </p>
    <hr style="border: none; border-top: 1px solid #eee; margin: 20px 0;">
    <p style="color: #999; font-size: 12px;">{app_name}</p>
</body>
</html>"#,
            headline = headline,
            name = name,
            credits = credits,
            dashboard = self.config.dashboard_url,
            app_name = self.config.app_name,
        )
    }

    async fn post_once(&self, body: &serde_json::Value) -> Result<(), SendFailure> {
        let response = self
            .client
            .post(RESEND_URL)
            .bearer_auth(&self.config.resend_api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| SendFailure::Transient(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let text = response.text().await.unwrap_or_default();
        let message = format!("{}: {}", status, text);
        if status.is_server_error() || status.as_u16() == 429 {
            Err(SendFailure::Transient(message))
        } else {
            Err(SendFailure::Permanent(message))
        }
    }
}

enum SendFailure {
    Transient(String),
    Permanent(String),
}

#[async_trait]
impl Notifier for ResendNotifier {
    async fn send(
        &self,
        kind: NotificationKind,
        email: &str,
        name: &str,
        credits: i64,
    ) -> BillingResult<()> {
        if !self.config.is_enabled() {
            tracing::warn!(to = %email, "Email not configured, skipping confirmation");
            return Ok(());
        }

        let subject = kind.subject(&self.config.app_name);
        let body = serde_json::json!({
            "from": self.config.email_from,
            "to": [email],
            "subject": subject,
            "html": self.render(kind, name, credits),
        });

        let strategy = ExponentialBackoff::from_millis(200)
            .max_delay(std::time::Duration::from_secs(5))
            .map(jitter)
            .take(SEND_ATTEMPTS - 1);

        // Permanent failures come back as Ok(Err) to stop retrying
        let outcome = Retry::spawn(strategy, || async {
            match self.post_once(&body).await {
                Ok(()) => Ok(Ok(())),
                Err(SendFailure::Transient(message)) => {
                    tracing::debug!(to = %email, error = %message, "Transient email failure, retrying");
                    Err(message)
                }
                Err(SendFailure::Permanent(message)) => Ok(Err(message)),
            }
        })
        .await;

        match outcome {
            Ok(Ok(())) => {
                tracing::info!(to = %email, subject = %subject, "Confirmation email sent");
                Ok(())
            }
            Ok(Err(message)) | Err(message) => Err(BillingError::Notification(message)),
        }
    }
}
