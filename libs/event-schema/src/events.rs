//! Commerce event types for the order workflow.
//!
//! Saga step commands and their replies come in matched pairs: the forward
//! command (`inventory.reserve`) with a success reply (`inventory.reserved`)
//! and a rejection reply (`inventory.reserve_failed`), plus the compensation
//! pair (`inventory.release` / `inventory.released`). Replies carry the name
//! of the saga step they answer so the orchestrator can correlate them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::codec::EnvelopeError;

// ============================================================================
// ORDER EVENTS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderItem {
    pub sku: String,
    pub quantity: u32,
    pub unit_price_cents: i64,
}

impl OrderItem {
    pub fn line_total_cents(&self) -> i64 {
        self.unit_price_cents * i64::from(self.quantity)
    }
}

/// External command that opens the order workflow. The command's
/// correlation id becomes the saga instance identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitOrder {
    pub order_id: Uuid,
    pub customer_id: Uuid,
    pub items: Vec<OrderItem>,
    pub total_cents: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderSubmitted {
    pub order_id: Uuid,
    pub customer_id: Uuid,
    pub items: Vec<OrderItem>,
    pub total_cents: i64,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderConfirmed {
    pub order_id: Uuid,
    pub tracking_number: String,
    pub confirmed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderCancelled {
    pub order_id: Uuid,
    pub reason: String,
    pub cancelled_at: DateTime<Utc>,
}

// ============================================================================
// INVENTORY COMMANDS & REPLIES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReserveInventory {
    pub order_id: Uuid,
    pub items: Vec<OrderItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryReserved {
    pub order_id: Uuid,
    pub reservation_id: Uuid,
    pub step: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryReserveFailed {
    pub order_id: Uuid,
    pub reason: String,
    pub step: String,
}

/// Compensation for `inventory.reserve`. Releasing a reservation that never
/// materialised must be a safe no-op on the participant side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseInventory {
    pub order_id: Uuid,
    pub items: Vec<OrderItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryReleased {
    pub order_id: Uuid,
    pub step: String,
}

// ============================================================================
// PAYMENT COMMANDS & REPLIES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChargePayment {
    pub order_id: Uuid,
    pub customer_id: Uuid,
    pub amount_cents: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentCharged {
    pub order_id: Uuid,
    pub charge_id: Uuid,
    pub amount_cents: i64,
    pub step: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentChargeFailed {
    pub order_id: Uuid,
    pub reason: String,
    pub step: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefundPayment {
    pub order_id: Uuid,
    pub charge_id: Option<Uuid>,
    pub amount_cents: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentRefunded {
    pub order_id: Uuid,
    pub step: String,
}

// ============================================================================
// SHIPPING COMMANDS & REPLIES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateShipment {
    pub order_id: Uuid,
    pub items: Vec<OrderItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShipmentCreated {
    pub order_id: Uuid,
    pub tracking_number: String,
    pub step: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShipmentCreateFailed {
    pub order_id: Uuid,
    pub reason: String,
    pub step: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelShipment {
    pub order_id: Uuid,
    pub tracking_number: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShipmentCancelled {
    pub order_id: Uuid,
    pub step: String,
}

// ============================================================================
// STATIC DISPATCH
// ============================================================================

/// All commerce events, decodable from `(event_type, payload)`.
///
/// Dispatch is a static match on the event type string. Event types not in
/// this registry decode to a malformed-envelope error and are routed to the
/// dead-letter queue by the consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum DomainEvent {
    SubmitOrder(SubmitOrder),
    OrderSubmitted(OrderSubmitted),
    OrderConfirmed(OrderConfirmed),
    OrderCancelled(OrderCancelled),
    ReserveInventory(ReserveInventory),
    InventoryReserved(InventoryReserved),
    InventoryReserveFailed(InventoryReserveFailed),
    ReleaseInventory(ReleaseInventory),
    InventoryReleased(InventoryReleased),
    ChargePayment(ChargePayment),
    PaymentCharged(PaymentCharged),
    PaymentChargeFailed(PaymentChargeFailed),
    RefundPayment(RefundPayment),
    PaymentRefunded(PaymentRefunded),
    CreateShipment(CreateShipment),
    ShipmentCreated(ShipmentCreated),
    ShipmentCreateFailed(ShipmentCreateFailed),
    CancelShipment(CancelShipment),
    ShipmentCancelled(ShipmentCancelled),
}

macro_rules! decode_as {
    ($variant:ident, $payload:expr) => {
        serde_json::from_value($payload.clone())
            .map(DomainEvent::$variant)
            .map_err(|e| EnvelopeError::malformed(format!("payload mismatch: {e}")))
    };
}

impl DomainEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::SubmitOrder(_) => "order.submit",
            Self::OrderSubmitted(_) => "order.submitted",
            Self::OrderConfirmed(_) => "order.confirmed",
            Self::OrderCancelled(_) => "order.cancelled",
            Self::ReserveInventory(_) => "inventory.reserve",
            Self::InventoryReserved(_) => "inventory.reserved",
            Self::InventoryReserveFailed(_) => "inventory.reserve_failed",
            Self::ReleaseInventory(_) => "inventory.release",
            Self::InventoryReleased(_) => "inventory.released",
            Self::ChargePayment(_) => "payment.charge",
            Self::PaymentCharged(_) => "payment.charged",
            Self::PaymentChargeFailed(_) => "payment.charge_failed",
            Self::RefundPayment(_) => "payment.refund",
            Self::PaymentRefunded(_) => "payment.refunded",
            Self::CreateShipment(_) => "shipping.create",
            Self::ShipmentCreated(_) => "shipping.created",
            Self::ShipmentCreateFailed(_) => "shipping.create_failed",
            Self::CancelShipment(_) => "shipping.cancel",
            Self::ShipmentCancelled(_) => "shipping.cancelled",
        }
    }

    pub fn decode(event_type: &str, payload: &serde_json::Value) -> Result<Self, EnvelopeError> {
        match event_type {
            "order.submit" => decode_as!(SubmitOrder, payload),
            "order.submitted" => decode_as!(OrderSubmitted, payload),
            "order.confirmed" => decode_as!(OrderConfirmed, payload),
            "order.cancelled" => decode_as!(OrderCancelled, payload),
            "inventory.reserve" => decode_as!(ReserveInventory, payload),
            "inventory.reserved" => decode_as!(InventoryReserved, payload),
            "inventory.reserve_failed" => decode_as!(InventoryReserveFailed, payload),
            "inventory.release" => decode_as!(ReleaseInventory, payload),
            "inventory.released" => decode_as!(InventoryReleased, payload),
            "payment.charge" => decode_as!(ChargePayment, payload),
            "payment.charged" => decode_as!(PaymentCharged, payload),
            "payment.charge_failed" => decode_as!(PaymentChargeFailed, payload),
            "payment.refund" => decode_as!(RefundPayment, payload),
            "payment.refunded" => decode_as!(PaymentRefunded, payload),
            "shipping.create" => decode_as!(CreateShipment, payload),
            "shipping.created" => decode_as!(ShipmentCreated, payload),
            "shipping.create_failed" => decode_as!(ShipmentCreateFailed, payload),
            "shipping.cancel" => decode_as!(CancelShipment, payload),
            "shipping.cancelled" => decode_as!(ShipmentCancelled, payload),
            other => Err(EnvelopeError::malformed(format!(
                "unknown event type '{other}'"
            ))),
        }
    }

    pub fn to_payload(&self) -> serde_json::Value {
        match self {
            Self::SubmitOrder(e) => serde_json::to_value(e),
            Self::OrderSubmitted(e) => serde_json::to_value(e),
            Self::OrderConfirmed(e) => serde_json::to_value(e),
            Self::OrderCancelled(e) => serde_json::to_value(e),
            Self::ReserveInventory(e) => serde_json::to_value(e),
            Self::InventoryReserved(e) => serde_json::to_value(e),
            Self::InventoryReserveFailed(e) => serde_json::to_value(e),
            Self::ReleaseInventory(e) => serde_json::to_value(e),
            Self::InventoryReleased(e) => serde_json::to_value(e),
            Self::ChargePayment(e) => serde_json::to_value(e),
            Self::PaymentCharged(e) => serde_json::to_value(e),
            Self::PaymentChargeFailed(e) => serde_json::to_value(e),
            Self::RefundPayment(e) => serde_json::to_value(e),
            Self::PaymentRefunded(e) => serde_json::to_value(e),
            Self::CreateShipment(e) => serde_json::to_value(e),
            Self::ShipmentCreated(e) => serde_json::to_value(e),
            Self::ShipmentCreateFailed(e) => serde_json::to_value(e),
            Self::CancelShipment(e) => serde_json::to_value(e),
            Self::ShipmentCancelled(e) => serde_json::to_value(e),
        }
        .unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decode_dispatches_by_event_type() {
        let order_id = Uuid::new_v4();
        let payload = json!({
            "order_id": order_id,
            "items": [{"sku": "A", "quantity": 2, "unit_price_cents": 1000}],
        });

        let event = DomainEvent::decode("inventory.reserve", &payload).unwrap();
        match event {
            DomainEvent::ReserveInventory(cmd) => {
                assert_eq!(cmd.order_id, order_id);
                assert_eq!(cmd.items.len(), 1);
                assert_eq!(cmd.items[0].line_total_cents(), 2000);
            }
            other => panic!("decoded wrong variant: {other:?}"),
        }
    }

    #[test]
    fn decode_rejects_unknown_event_type() {
        let err = DomainEvent::decode("inventory.vaporised", &json!({})).unwrap_err();
        assert!(matches!(err, EnvelopeError::Malformed { .. }));
    }

    #[test]
    fn decode_rejects_mismatched_payload() {
        let err = DomainEvent::decode("payment.charge", &json!({"nope": true})).unwrap_err();
        assert!(matches!(err, EnvelopeError::Malformed { .. }));
    }

    #[test]
    fn event_type_round_trips_through_payload() {
        let event = DomainEvent::PaymentCharged(PaymentCharged {
            order_id: Uuid::new_v4(),
            charge_id: Uuid::new_v4(),
            amount_cents: 2500,
            step: "charge-payment".to_string(),
        });

        let decoded = DomainEvent::decode(event.event_type(), &event.to_payload()).unwrap();
        assert_eq!(decoded, event);
    }
}
