//! Conversion attribution
//!
//! Reports paid conversions to the marketing attribution service. Best-effort.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

#[async_trait]
pub trait AttributionRecorder: Send + Sync {
    async fn record_conversion(
        &self,
        user_id: Uuid,
        amount_paid: i64,
        currency: &str,
    ) -> BillingResult<()>;
}

/// Posts conversions to `ATTRIBUTION_URL`
#[derive(Clone)]
pub struct HttpAttributionRecorder {
    endpoint: Option<String>,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpAttributionRecorder {
    pub fn new(endpoint: Option<String>, api_key: Option<String>) -> Self {
        Self {
            endpoint: endpoint.filter(|url| !url.is_empty()),
            api_key: api_key.filter(|key| !key.is_empty()),
            client: reqwest::Client::new(),
        }
    }

    pub fn from_env() -> Self {
        Self::new(
            std::env::var("ATTRIBUTION_URL").ok(),
            std::env::var("ATTRIBUTION_API_KEY").ok(),
        )
    }
}

#[async_trait]
impl AttributionRecorder for HttpAttributionRecorder {
    async fn record_conversion(
        &self,
        user_id: Uuid,
        amount_paid: i64,
        currency: &str,
    ) -> BillingResult<()> {
        let Some(endpoint) = &self.endpoint else {
            tracing::debug!(user_id = %user_id, "Attribution not configured, skipping");
            return Ok(());
        };

        let mut request = self.client.post(endpoint).json(&serde_json::json!({
            "event": "purchase",
            "user_id": user_id,
            "amount": amount_paid,
            "currency": currency,
        }));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| BillingError::Attribution(e.to_string()))?;
        if !response.status().is_success() {
            return Err(BillingError::Attribution(format!(
                "attribution endpoint returned {}",
                response.status()
            )));
        }

        tracing::info!(user_id = %user_id, amount = amount_paid, "Conversion recorded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unconfigured_recorder_is_noop() {
        let recorder = HttpAttributionRecorder::new(Some(String::new()), None);
        assert!(recorder
            .record_conversion(Uuid::new_v4(), 1900, "usd")
            .await
            .is_ok());
    }
}
