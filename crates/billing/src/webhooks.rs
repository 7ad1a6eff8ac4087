//! Webhook delivery handling
//!
//! Wraps the reconciler with the per-delivery claim log: every delivery is
//! claimed atomically before processing, its result is recorded, and failed
//! deliveries can be replayed from the stored payload.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::events::WebhookEnvelope;
use crate::reconcile::{Outcome, Reconciler};
use crate::store::{DeliveryLog, DeliveryStatus, WebhookDeliveryRecord};

/// Result of handling one delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Processed(Outcome),
    /// Another attempt already succeeded or is in flight
    Duplicate(String),
}

/// Result of a replay operation
#[derive(Debug, Clone, Serialize)]
pub struct WebhookReplayResult {
    pub record_id: Uuid,
    pub delivery_id: String,
    pub event_type: String,
    pub previous_status: String,
    pub previous_error: Option<String>,
    pub new_status: String,
    pub new_error: Option<String>,
    pub success: bool,
}

/// Webhook handler for provider deliveries
#[derive(Clone)]
pub struct WebhookHandler {
    reconciler: Reconciler,
    deliveries: Arc<dyn DeliveryLog>,
    stuck_after: Duration,
}

impl WebhookHandler {
    pub fn new(
        reconciler: Reconciler,
        deliveries: Arc<dyn DeliveryLog>,
        stuck_after: Duration,
    ) -> Self {
        Self {
            reconciler,
            deliveries,
            stuck_after,
        }
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    /// Handle a verified delivery body.
    ///
    /// Malformed bodies are dropped without a claim. Retryable errors are
    /// returned after the failure is recorded so the provider redelivers.
    pub async fn handle_delivery(
        &self,
        delivery_id: &str,
        body: &[u8],
    ) -> BillingResult<DeliveryOutcome> {
        let envelope = match WebhookEnvelope::parse(body) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(delivery_id = %delivery_id, error = %e, "Dropping malformed delivery");
                return Ok(DeliveryOutcome::Processed(Outcome::Dropped(e.to_string())));
            }
        };
        let payload = serde_json::to_value(&envelope)
            .map_err(|e| BillingError::InvalidPayload(e.to_string()))?;

        let claimed = self
            .deliveries
            .claim_delivery(delivery_id, &envelope.event_type, &payload, self.stuck_after)
            .await?;

        if !claimed {
            let reason = match self.deliveries.get_delivery(delivery_id).await {
                Ok(Some(record)) => match record.processing_result {
                    DeliveryStatus::Success => "already processed successfully",
                    DeliveryStatus::Processing | DeliveryStatus::Replaying => {
                        "currently being processed by another worker"
                    }
                    _ => "exists with another status",
                },
                Ok(None) => "unknown (race condition?)",
                Err(_) => "status lookup failed",
            };
            tracing::info!(
                delivery_id = %delivery_id,
                event_type = %envelope.event_type,
                reason = %reason,
                "Duplicate webhook delivery"
            );
            return Ok(DeliveryOutcome::Duplicate(reason.to_string()));
        }

        tracing::info!(
            delivery_id = %delivery_id,
            event_type = %envelope.event_type,
            "Processing webhook delivery"
        );

        let result = self.process(envelope).await;
        self.record_result(delivery_id, &result).await;
        result.map(DeliveryOutcome::Processed)
    }

    async fn process(&self, envelope: WebhookEnvelope) -> BillingResult<Outcome> {
        match envelope.into_event() {
            Ok(event) => self.reconciler.process_event(event).await,
            Err(e) => {
                tracing::warn!(error = %e, "Dropping undecodable event");
                Ok(Outcome::Dropped(e.to_string()))
            }
        }
    }

    /// Record the processing result, retrying once
    async fn record_result(&self, delivery_id: &str, result: &BillingResult<Outcome>) {
        let (status, error_message) = match result {
            Ok(_) => (DeliveryStatus::Success, None),
            Err(e) => (DeliveryStatus::Error, Some(e.to_string())),
        };

        let first = self
            .deliveries
            .set_delivery_status(delivery_id, status, error_message.as_deref())
            .await;
        if let Err(e) = first {
            tracing::warn!(
                delivery_id = %delivery_id,
                error = %e,
                "First attempt to record delivery result failed, retrying"
            );
            if let Err(retry_err) = self
                .deliveries
                .set_delivery_status(delivery_id, status, error_message.as_deref())
                .await
            {
                tracing::error!(
                    delivery_id = %delivery_id,
                    processing_result = %status,
                    error_message = ?error_message,
                    first_error = %e,
                    retry_error = %retry_err,
                    "Failed to record delivery result after retry; \
                     delivery will be reclaimed once it is considered stuck"
                );
            }
        }
    }

    /// Deliveries that failed or never finished
    pub async fn list_failed(
        &self,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<WebhookDeliveryRecord>> {
        self.deliveries
            .list_deliveries(
                &[DeliveryStatus::Error, DeliveryStatus::Processing],
                limit,
                offset,
            )
            .await
    }

    /// All deliveries, optionally filtered by status
    pub async fn list_deliveries(
        &self,
        status: Option<DeliveryStatus>,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<WebhookDeliveryRecord>> {
        let statuses: Vec<DeliveryStatus> = status.into_iter().collect();
        self.deliveries
            .list_deliveries(&statuses, limit, offset)
            .await
    }

    /// Re-process a stored delivery from its saved payload
    pub async fn replay_delivery(&self, delivery_id: &str) -> BillingResult<WebhookReplayResult> {
        tracing::info!(delivery_id = %delivery_id, "Attempting to replay webhook delivery");

        let record = self
            .deliveries
            .get_delivery(delivery_id)
            .await?
            .ok_or_else(|| {
                BillingError::NotFound(format!("Webhook delivery {} not found", delivery_id))
            })?;

        let previous_status = record.processing_result.to_string();
        let previous_error = record.error_message.clone();

        let note = format!(
            "Replay initiated. Previous status: {}. Previous error: {}",
            previous_status,
            previous_error.as_deref().unwrap_or("none")
        );
        self.deliveries
            .set_delivery_status(delivery_id, DeliveryStatus::Replaying, Some(&note))
            .await?;

        let result = match serde_json::from_value::<WebhookEnvelope>(record.payload.clone()) {
            Ok(envelope) => self.process(envelope).await,
            Err(e) => Ok(Outcome::Dropped(format!("stored payload unreadable: {}", e))),
        };
        self.record_result(delivery_id, &result).await;

        let (new_status, new_error) = match &result {
            Ok(_) => (DeliveryStatus::Success, None),
            Err(e) => (DeliveryStatus::Error, Some(e.to_string())),
        };

        tracing::info!(
            delivery_id = %delivery_id,
            previous_status = %previous_status,
            new_status = %new_status,
            success = result.is_ok(),
            "Webhook replay completed"
        );

        Ok(WebhookReplayResult {
            record_id: record.id,
            delivery_id: delivery_id.to_string(),
            event_type: record.event_type,
            previous_status,
            previous_error,
            new_status: new_status.to_string(),
            new_error,
            success: result.is_ok(),
        })
    }

    /// Replay failed and reset deliveries, oldest first
    pub async fn replay_all_failed(
        &self,
        max_deliveries: Option<i64>,
    ) -> BillingResult<Vec<WebhookReplayResult>> {
        let limit = max_deliveries.unwrap_or(100);
        let failed = self
            .deliveries
            .list_deliveries(
                &[DeliveryStatus::Error, DeliveryStatus::PendingReplay],
                limit,
                0,
            )
            .await?;

        let mut results = Vec::with_capacity(failed.len());
        for record in failed {
            match self.replay_delivery(&record.delivery_id).await {
                Ok(result) => results.push(result),
                Err(e) => {
                    tracing::error!(
                        delivery_id = %record.delivery_id,
                        error = %e,
                        "Failed to replay webhook delivery"
                    );
                    results.push(WebhookReplayResult {
                        record_id: record.id,
                        delivery_id: record.delivery_id,
                        event_type: record.event_type,
                        previous_status: record.processing_result.to_string(),
                        previous_error: record.error_message,
                        new_status: DeliveryStatus::Error.to_string(),
                        new_error: Some(e.to_string()),
                        success: false,
                    });
                }
            }
        }

        Ok(results)
    }

    /// Move a stuck or failed delivery to `pending_replay`
    pub async fn reset_stuck(&self, delivery_id: &str) -> BillingResult<()> {
        if !self.deliveries.reset_delivery(delivery_id).await? {
            return Err(BillingError::NotFound(format!(
                "Webhook delivery {} not found or not in resettable state",
                delivery_id
            )));
        }

        tracing::info!(delivery_id = %delivery_id, "Webhook delivery reset for replay");
        Ok(())
    }
}
