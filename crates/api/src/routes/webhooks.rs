//! Provider webhook endpoint

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    Json,
};
use creditsync_billing::{DeliveryOutcome, Outcome};
use serde::Serialize;
use time::OffsetDateTime;

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl From<DeliveryOutcome> for WebhookAck {
    fn from(outcome: DeliveryOutcome) -> Self {
        let (status, reason) = match outcome {
            DeliveryOutcome::Processed(Outcome::Applied) => ("applied", None),
            DeliveryOutcome::Processed(Outcome::Skipped(reason)) => ("skipped", Some(reason)),
            DeliveryOutcome::Processed(Outcome::Dropped(reason)) => ("dropped", Some(reason)),
            DeliveryOutcome::Duplicate(reason) => ("duplicate", Some(reason)),
        };
        Self { status, reason }
    }
}

/// Handle Polar webhook deliveries.
///
/// Anything acknowledged with 2xx is never redelivered, so only retryable
/// failures produce a 5xx.
pub async fn polar(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<WebhookAck>)> {
    tracing::info!(body_len = body.len(), "Polar webhook received");

    let delivery_id = state
        .verifier
        .verify(&headers, &body, OffsetDateTime::now_utc())
        .map_err(|e| {
            tracing::warn!(error = %e, "Polar webhook signature verification failed");
            ApiError::InvalidSignature
        })?;

    match state.webhooks.handle_delivery(&delivery_id, &body).await {
        Ok(outcome) => {
            let ack = WebhookAck::from(outcome);
            tracing::info!(
                delivery_id = %delivery_id,
                status = ack.status,
                reason = ?ack.reason,
                "Polar webhook acknowledged"
            );
            Ok((StatusCode::OK, Json(ack)))
        }
        Err(e) if e.is_retryable() => {
            tracing::error!(delivery_id = %delivery_id, error = %e, "Polar webhook failed, provider will retry");
            Err(e.into())
        }
        Err(e) => {
            tracing::warn!(delivery_id = %delivery_id, error = %e, "Polar webhook dropped");
            Ok((
                StatusCode::OK,
                Json(WebhookAck {
                    status: "dropped",
                    reason: Some(e.to_string()),
                }),
            ))
        }
    }
}
