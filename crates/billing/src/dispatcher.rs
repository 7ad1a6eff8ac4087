//! Side effects of a committed transition
//!
//! The ledger insert and the offer clear are awaited because they carry
//! once-only meaning. Notification and attribution are spawned. Nothing here
//! fails the delivery.

use std::sync::Arc;

use uuid::Uuid;

use crate::attribution::AttributionRecorder;
use crate::email::{NotificationKind, Notifier};
use crate::models::{NewPaymentRecord, PaymentInsert, UserProfile};
use crate::store::{insert_payment_tolerant, GrantStore};
use crate::users::UserDirectory;

/// Effects requested by the orchestrator for one transition
#[derive(Debug, Clone, Default)]
pub struct SideEffects {
    pub payment: Option<NewPaymentRecord>,
    /// Clear the pending offer; set only when the bonus was applied
    pub consume_offer: bool,
    pub notification: Option<Confirmation>,
    pub conversion: Option<Conversion>,
}

#[derive(Debug, Clone)]
pub struct Confirmation {
    pub kind: NotificationKind,
    pub profile: UserProfile,
    pub credits: i64,
}

#[derive(Debug, Clone)]
pub struct Conversion {
    pub amount_paid: i64,
    pub currency: String,
}

/// What the awaited effects did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub payment_recorded: bool,
    pub offer_cleared: bool,
}

#[derive(Clone)]
pub struct SideEffectDispatcher {
    store: Arc<dyn GrantStore>,
    users: Arc<dyn UserDirectory>,
    notifier: Arc<dyn Notifier>,
    attribution: Arc<dyn AttributionRecorder>,
}

impl SideEffectDispatcher {
    pub fn new(
        store: Arc<dyn GrantStore>,
        users: Arc<dyn UserDirectory>,
        notifier: Arc<dyn Notifier>,
        attribution: Arc<dyn AttributionRecorder>,
    ) -> Self {
        Self {
            store,
            users,
            notifier,
            attribution,
        }
    }

    pub async fn dispatch(&self, user_id: Uuid, effects: SideEffects) -> DispatchReport {
        let mut report = DispatchReport::default();

        if let Some(record) = &effects.payment {
            match insert_payment_tolerant(self.store.as_ref(), record).await {
                Ok(PaymentInsert::Inserted(payment)) => {
                    tracing::info!(
                        user_id = %user_id,
                        payment_id = %payment.id,
                        amount = payment.amount,
                        label = %payment.status_label,
                        "Payment recorded"
                    );
                    report.payment_recorded = true;
                }
                Ok(PaymentInsert::Duplicate) => {
                    tracing::info!(
                        user_id = %user_id,
                        checkout_id = ?record.provider_checkout_id,
                        order_id = ?record.provider_order_id,
                        "Payment already recorded"
                    );
                }
                Err(e) => {
                    tracing::error!(
                        user_id = %user_id,
                        error = %e,
                        "Failed to record payment - non-fatal"
                    );
                }
            }
        }

        if effects.consume_offer {
            match self.users.clear_offer(user_id).await {
                Ok(cleared) => report.offer_cleared = cleared,
                Err(e) => {
                    tracing::error!(
                        user_id = %user_id,
                        error = %e,
                        "Failed to clear offer flag - non-fatal"
                    );
                }
            }
        }

        if let Some(confirmation) = effects.notification {
            let notifier = Arc::clone(&self.notifier);
            tokio::spawn(async move {
                let profile = &confirmation.profile;
                if let Err(e) = notifier
                    .send(
                        confirmation.kind,
                        &profile.email,
                        profile.greeting_name(),
                        confirmation.credits,
                    )
                    .await
                {
                    tracing::error!(
                        user_id = %profile.user_id,
                        error = %e,
                        "Failed to send confirmation - non-fatal"
                    );
                }
            });
        }

        if let Some(conversion) = effects.conversion {
            let attribution = Arc::clone(&self.attribution);
            tokio::spawn(async move {
                if let Err(e) = attribution
                    .record_conversion(user_id, conversion.amount_paid, &conversion.currency)
                    .await
                {
                    tracing::error!(
                        user_id = %user_id,
                        error = %e,
                        "Failed to record conversion - non-fatal"
                    );
                }
            });
        }

        report
    }
}
