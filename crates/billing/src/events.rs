//! Provider webhook payloads
//!
//! The envelope is `{type, data}`. The type string is parsed into [`EventKind`],
//! a closed set that the orchestrator matches exhaustively; anything we do not
//! handle lands in [`EventKind::Unhandled`] and is acknowledged without effect.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// Raw delivery body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEnvelope {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub data: Value,
}

impl WebhookEnvelope {
    pub fn parse(body: &[u8]) -> BillingResult<Self> {
        serde_json::from_slice(body)
            .map_err(|e| BillingError::InvalidPayload(format!("malformed envelope: {}", e)))
    }

    /// Decode `data` according to `type`
    pub fn into_event(self) -> BillingResult<EventKind> {
        let event_type = self.event_type;
        let data = self.data;

        fn decode<T: serde::de::DeserializeOwned>(event_type: &str, data: Value) -> BillingResult<T> {
            serde_json::from_value(data).map_err(|e| {
                BillingError::InvalidPayload(format!("{} payload: {}", event_type, e))
            })
        }

        Ok(match event_type.as_str() {
            "checkout.updated" => EventKind::CheckoutUpdated(decode(&event_type, data)?),
            "subscription.active" => EventKind::SubscriptionActive(decode(&event_type, data)?),
            "subscription.canceled" => EventKind::SubscriptionCanceled(decode(&event_type, data)?),
            "subscription.uncanceled" => {
                EventKind::SubscriptionUncanceled(decode(&event_type, data)?)
            }
            "subscription.revoked" => EventKind::SubscriptionRevoked(decode(&event_type, data)?),
            "subscription.updated" => EventKind::SubscriptionUpdated(decode(&event_type, data)?),
            "order.paid" => EventKind::OrderPaid(decode(&event_type, data)?),
            "refund.created" => EventKind::RefundCreated(decode(&event_type, data)?),
            _ => EventKind::Unhandled(event_type),
        })
    }
}

#[derive(Debug, Clone)]
pub enum EventKind {
    CheckoutUpdated(CheckoutPayload),
    SubscriptionActive(SubscriptionPayload),
    SubscriptionCanceled(SubscriptionPayload),
    SubscriptionUncanceled(SubscriptionPayload),
    SubscriptionRevoked(SubscriptionPayload),
    SubscriptionUpdated(SubscriptionPayload),
    OrderPaid(OrderPayload),
    RefundCreated(RefundPayload),
    Unhandled(String),
}

impl EventKind {
    pub fn name(&self) -> &str {
        match self {
            EventKind::CheckoutUpdated(_) => "checkout.updated",
            EventKind::SubscriptionActive(_) => "subscription.active",
            EventKind::SubscriptionCanceled(_) => "subscription.canceled",
            EventKind::SubscriptionUncanceled(_) => "subscription.uncanceled",
            EventKind::SubscriptionRevoked(_) => "subscription.revoked",
            EventKind::SubscriptionUpdated(_) => "subscription.updated",
            EventKind::OrderPaid(_) => "order.paid",
            EventKind::RefundCreated(_) => "refund.created",
            EventKind::Unhandled(name) => name,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CustomerRef {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub external_id: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProductRef {
    pub id: String,
}

/// Fields the resolver reads to find the internal user
pub trait PayloadIdentity {
    fn metadata(&self) -> &HashMap<String, Value>;

    /// The platform user id as the provider knows it
    fn external_customer_id(&self) -> Option<&str>;

    /// `metadata.user_id`, attached when the checkout was created
    fn metadata_user_id(&self) -> Option<Uuid> {
        self.metadata()
            .get("user_id")
            .and_then(Value::as_str)
            .and_then(|raw| Uuid::parse_str(raw.trim()).ok())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckoutPayload {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub product_id: Option<String>,
    #[serde(default)]
    pub product: Option<ProductRef>,
    #[serde(default)]
    pub customer_id: Option<String>,
    #[serde(default, alias = "customer_external_id")]
    pub external_customer_id: Option<String>,
    #[serde(default)]
    pub customer: Option<CustomerRef>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    #[serde(default)]
    pub total_amount: Option<i64>,
    #[serde(default)]
    pub amount: Option<i64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub subscription_id: Option<String>,
}

impl CheckoutPayload {
    pub fn is_succeeded(&self) -> bool {
        self.status == "succeeded"
    }

    pub fn product_id(&self) -> Option<&str> {
        self.product_id
            .as_deref()
            .or_else(|| self.product.as_ref().map(|p| p.id.as_str()))
    }

    pub fn amount_paid(&self) -> Option<i64> {
        self.total_amount.or(self.amount)
    }

    /// Checkout id usable as an idempotency key
    pub fn checkout_key(&self) -> Option<&str> {
        Some(self.id.trim()).filter(|id| !id.is_empty())
    }
}

impl PayloadIdentity for CheckoutPayload {
    fn metadata(&self) -> &HashMap<String, Value> {
        &self.metadata
    }

    fn external_customer_id(&self) -> Option<&str> {
        self.external_customer_id
            .as_deref()
            .or_else(|| self.customer.as_ref()?.external_id.as_deref())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubscriptionPayload {
    pub id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub product_id: Option<String>,
    #[serde(default)]
    pub product: Option<ProductRef>,
    #[serde(default)]
    pub customer_id: Option<String>,
    #[serde(default)]
    pub customer: Option<CustomerRef>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    #[serde(default)]
    pub amount: Option<i64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub recurring_interval: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub current_period_start: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub current_period_end: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub cancel_at_period_end: bool,
    #[serde(default)]
    pub checkout_id: Option<String>,
}

impl SubscriptionPayload {
    pub fn product_id(&self) -> Option<&str> {
        self.product_id
            .as_deref()
            .or_else(|| self.product.as_ref().map(|p| p.id.as_str()))
    }

    pub fn checkout_key(&self) -> Option<&str> {
        self.checkout_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }
}

impl PayloadIdentity for SubscriptionPayload {
    fn metadata(&self) -> &HashMap<String, Value> {
        &self.metadata
    }

    fn external_customer_id(&self) -> Option<&str> {
        self.customer.as_ref()?.external_id.as_deref()
    }
}

/// Why an order was billed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BillingReason {
    Initial,
    Renewal,
    PlanChange,
}

impl BillingReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingReason::Initial => "initial",
            BillingReason::Renewal => "renewal",
            BillingReason::PlanChange => "plan_change",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderPayload {
    pub id: String,
    #[serde(default)]
    pub billing_reason: Option<String>,
    #[serde(default)]
    pub subscription_id: Option<String>,
    #[serde(default)]
    pub checkout_id: Option<String>,
    #[serde(default)]
    pub product_id: Option<String>,
    #[serde(default)]
    pub customer: Option<CustomerRef>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    #[serde(default)]
    pub total_amount: Option<i64>,
    #[serde(default)]
    pub amount: Option<i64>,
    #[serde(default)]
    pub currency: Option<String>,
}

impl OrderPayload {
    pub fn billing_reason(&self) -> BillingReason {
        match self.billing_reason.as_deref() {
            Some("subscription_cycle") => BillingReason::Renewal,
            Some("subscription_update") => BillingReason::PlanChange,
            _ => BillingReason::Initial,
        }
    }

    pub fn amount_paid(&self) -> i64 {
        self.total_amount.or(self.amount).unwrap_or(0)
    }

    pub fn checkout_key(&self) -> Option<&str> {
        self.checkout_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }
}

impl PayloadIdentity for OrderPayload {
    fn metadata(&self) -> &HashMap<String, Value> {
        &self.metadata
    }

    fn external_customer_id(&self) -> Option<&str> {
        self.customer.as_ref()?.external_id.as_deref()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RefundPayload {
    pub id: String,
    #[serde(default)]
    pub order_id: Option<String>,
    #[serde(default)]
    pub subscription_id: Option<String>,
    #[serde(default)]
    pub amount: Option<i64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_checkout_envelope() {
        let body = json!({
            "type": "checkout.updated",
            "data": {
                "id": "co_1",
                "status": "succeeded",
                "product_id": "prod_pro_monthly",
                "metadata": {"user_id": "0a6b2c3e-2f46-4a1d-9a56-8a3c6c1b7f10"},
                "total_amount": 1900,
                "currency": "usd"
            }
        });
        let event = WebhookEnvelope::parse(body.to_string().as_bytes())
            .unwrap()
            .into_event()
            .unwrap();

        let EventKind::CheckoutUpdated(checkout) = event else {
            panic!("expected checkout event");
        };
        assert!(checkout.is_succeeded());
        assert_eq!(checkout.product_id(), Some("prod_pro_monthly"));
        assert!(checkout.metadata_user_id().is_some());
        assert_eq!(checkout.amount_paid(), Some(1900));
    }

    #[test]
    fn test_subscription_period_end_parses() {
        let body = json!({
            "type": "subscription.canceled",
            "data": {
                "id": "sub_1",
                "status": "active",
                "product": {"id": "prod_pro_yearly"},
                "customer": {"id": "cus_1", "external_id": "0a6b2c3e-2f46-4a1d-9a56-8a3c6c1b7f10"},
                "current_period_end": "2025-02-01T00:00:00Z",
                "cancel_at_period_end": true
            }
        });
        let event = WebhookEnvelope::parse(body.to_string().as_bytes())
            .unwrap()
            .into_event()
            .unwrap();

        let EventKind::SubscriptionCanceled(sub) = event else {
            panic!("expected cancel event");
        };
        assert_eq!(sub.product_id(), Some("prod_pro_yearly"));
        assert!(sub.cancel_at_period_end);
        assert_eq!(
            sub.current_period_end,
            Some(time::macros::datetime!(2025-02-01 00:00 UTC))
        );
        assert!(sub.external_customer_id().is_some());
    }

    #[test]
    fn test_unknown_type_is_unhandled() {
        let event = WebhookEnvelope::parse(br#"{"type": "benefit.created", "data": {}}"#)
            .unwrap()
            .into_event()
            .unwrap();
        assert!(matches!(event, EventKind::Unhandled(ref name) if name == "benefit.created"));
    }

    #[test]
    fn test_malformed_payload_is_invalid() {
        let err = WebhookEnvelope::parse(br#"{"type": "order.paid", "data": {"total_amount": 5}}"#)
            .unwrap()
            .into_event()
            .unwrap_err();
        assert!(matches!(err, BillingError::InvalidPayload(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_order_billing_reason() {
        let order = OrderPayload {
            id: "ord_1".into(),
            billing_reason: Some("subscription_cycle".into()),
            ..Default::default()
        };
        assert_eq!(order.billing_reason(), BillingReason::Renewal);
        assert_eq!(OrderPayload::default().billing_reason(), BillingReason::Initial);
    }

    #[test]
    fn test_blank_metadata_user_id_is_ignored() {
        let mut checkout = CheckoutPayload::default();
        checkout
            .metadata
            .insert("user_id".into(), Value::String("not-a-uuid".into()));
        assert_eq!(checkout.metadata_user_id(), None);
    }
}
