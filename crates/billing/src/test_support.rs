//! Recording collaborators for tests

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::attribution::AttributionRecorder;
use crate::email::{NotificationKind, Notifier};
use crate::error::{BillingError, BillingResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentNotification {
    pub kind: NotificationKind,
    pub email: String,
    pub name: String,
    pub credits: i64,
}

#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<SentNotification>>,
}

impl RecordingNotifier {
    pub async fn sent(&self) -> Vec<SentNotification> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(
        &self,
        kind: NotificationKind,
        email: &str,
        name: &str,
        credits: i64,
    ) -> BillingResult<()> {
        self.sent.lock().await.push(SentNotification {
            kind,
            email: email.to_string(),
            name: name.to_string(),
            credits,
        });
        Ok(())
    }
}

pub struct FailingNotifier;

#[async_trait]
impl Notifier for FailingNotifier {
    async fn send(&self, _: NotificationKind, _: &str, _: &str, _: i64) -> BillingResult<()> {
        Err(BillingError::Notification("smtp unavailable".into()))
    }
}

#[derive(Default)]
pub struct RecordingAttribution {
    conversions: Mutex<Vec<(Uuid, i64, String)>>,
}

impl RecordingAttribution {
    pub async fn conversions(&self) -> Vec<(Uuid, i64, String)> {
        self.conversions.lock().await.clone()
    }
}

#[async_trait]
impl AttributionRecorder for RecordingAttribution {
    async fn record_conversion(
        &self,
        user_id: Uuid,
        amount_paid: i64,
        currency: &str,
    ) -> BillingResult<()> {
        self.conversions
            .lock()
            .await
            .push((user_id, amount_paid, currency.to_string()));
        Ok(())
    }
}

/// Let spawned fire-and-forget tasks run on a current-thread runtime
pub async fn settle() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
}
