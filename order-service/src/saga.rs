//! The order workflow saga.
//!
//! Steps, in declared order:
//!
//! 1. `place-order` (local): records the `order.submitted` fact; its
//!    compensation publishes `order.cancelled`, so a compensated saga
//!    announces the cancellation exactly once, at the end of the reverse
//!    walk.
//! 2. `reserve-inventory`: remote, compensated by `inventory.release`.
//! 3. `charge-payment`: remote, compensated by `payment.refund`.
//! 4. `create-shipment`: remote, compensated by `shipping.cancel`.
//! 5. `confirm-order` (local): publishes `order.confirmed`. No
//!    compensation: once confirmed, the saga cannot fail.
//!
//! All publications go through the outbox; there is no direct produce path.

use serde::Deserialize;
use serde_json::json;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use async_trait::async_trait;
use event_schema::events::{
    CancelShipment, ChargePayment, CreateShipment, OrderCancelled, OrderConfirmed, OrderItem,
    OrderSubmitted, RefundPayment, ReleaseInventory, ReserveInventory, SubmitOrder,
};
use event_schema::{DomainEvent, EventEnvelope};
use saga_core::{
    step_command_id, CommandSpec, CompensationError, EventStep, ReplyRouter, SagaDefinition,
    SagaStep, StepContext, StepResult,
};
use transactional_outbox::{outbox_event, OutboxStore};

pub const ORDER_SAGA_TYPE: &str = "create-order";

/// What the saga accumulates in its state payload: the submitted order plus
/// the results each reply merges in.
#[derive(Debug, Deserialize)]
struct OrderContext {
    order_id: Uuid,
    customer_id: Uuid,
    items: Vec<OrderItem>,
    total_cents: i64,
    #[serde(default)]
    charge_id: Option<Uuid>,
    #[serde(default)]
    tracking_number: Option<String>,
}

fn order_context(state: &serde_json::Value) -> Result<OrderContext, String> {
    serde_json::from_value(state.clone()).map_err(|e| format!("order state malformed: {e}"))
}

fn spec_for(event: DomainEvent, aggregate_key: String) -> CommandSpec {
    CommandSpec {
        event_type: event.event_type().to_string(),
        aggregate_key,
        payload: event.to_payload(),
    }
}

/// Initial saga state from the submit command.
pub fn initial_state(command: &SubmitOrder) -> serde_json::Value {
    json!({
        "order_id": command.order_id,
        "customer_id": command.customer_id,
        "items": command.items,
        "total_cents": command.total_cents,
    })
}

pub fn reserve_inventory_command(
    _correlation_id: Uuid,
    state: &serde_json::Value,
) -> Result<CommandSpec, String> {
    let order = order_context(state)?;
    Ok(spec_for(
        DomainEvent::ReserveInventory(ReserveInventory {
            order_id: order.order_id,
            items: order.items,
        }),
        order.order_id.to_string(),
    ))
}

pub fn release_inventory_command(
    _correlation_id: Uuid,
    state: &serde_json::Value,
) -> Result<CommandSpec, String> {
    let order = order_context(state)?;
    Ok(spec_for(
        DomainEvent::ReleaseInventory(ReleaseInventory {
            order_id: order.order_id,
            items: order.items,
        }),
        order.order_id.to_string(),
    ))
}

pub fn charge_payment_command(
    _correlation_id: Uuid,
    state: &serde_json::Value,
) -> Result<CommandSpec, String> {
    let order = order_context(state)?;
    Ok(spec_for(
        DomainEvent::ChargePayment(ChargePayment {
            order_id: order.order_id,
            customer_id: order.customer_id,
            amount_cents: order.total_cents,
        }),
        order.order_id.to_string(),
    ))
}

pub fn refund_payment_command(
    _correlation_id: Uuid,
    state: &serde_json::Value,
) -> Result<CommandSpec, String> {
    let order = order_context(state)?;
    Ok(spec_for(
        DomainEvent::RefundPayment(RefundPayment {
            order_id: order.order_id,
            charge_id: order.charge_id,
            amount_cents: order.total_cents,
        }),
        order.order_id.to_string(),
    ))
}

pub fn create_shipment_command(
    _correlation_id: Uuid,
    state: &serde_json::Value,
) -> Result<CommandSpec, String> {
    let order = order_context(state)?;
    Ok(spec_for(
        DomainEvent::CreateShipment(CreateShipment {
            order_id: order.order_id,
            items: order.items,
        }),
        order.order_id.to_string(),
    ))
}

pub fn cancel_shipment_command(
    _correlation_id: Uuid,
    state: &serde_json::Value,
) -> Result<CommandSpec, String> {
    let order = order_context(state)?;
    Ok(spec_for(
        DomainEvent::CancelShipment(CancelShipment {
            order_id: order.order_id,
            tracking_number: order.tracking_number,
        }),
        order.order_id.to_string(),
    ))
}

async fn queue_fact(
    pool: &PgPool,
    outbox: &Arc<dyn OutboxStore>,
    envelope: &EventEnvelope,
) -> Result<(), String> {
    let mut tx = pool.begin().await.map_err(|e| format!("begin failed: {e}"))?;
    outbox_event!(&mut tx, outbox, envelope)
        .map_err(|e| format!("outbox append failed: {e}"))?;
    tx.commit().await.map_err(|e| format!("commit failed: {e}"))
}

/// Local step 1: make the submitted order a published fact. Compensation is
/// the cancellation announcement.
struct PlaceOrderStep {
    pool: PgPool,
    outbox: Arc<dyn OutboxStore>,
}

#[async_trait]
impl SagaStep for PlaceOrderStep {
    fn name(&self) -> &str {
        "place-order"
    }

    async fn execute(&self, ctx: StepContext<'_>) -> StepResult {
        let order = match order_context(ctx.state) {
            Ok(order) => order,
            Err(reason) => return StepResult::failure(reason),
        };

        let event = DomainEvent::OrderSubmitted(OrderSubmitted {
            order_id: order.order_id,
            customer_id: order.customer_id,
            items: order.items,
            total_cents: order.total_cents,
            submitted_at: chrono::Utc::now(),
        });
        let envelope = EventEnvelope::new(
            event.event_type(),
            order.order_id.to_string(),
            ctx.correlation_id,
            event.to_payload(),
        )
        .with_event_id(step_command_id(ctx.correlation_id, self.name()));

        match queue_fact(&self.pool, &self.outbox, &envelope).await {
            Ok(()) => StepResult::success(),
            Err(detail) => StepResult::failure_with_cause("order fact not queued", detail),
        }
    }

    async fn compensate(&self, ctx: StepContext<'_>) -> Result<(), CompensationError> {
        let order = order_context(ctx.state).map_err(CompensationError)?;

        let event = DomainEvent::OrderCancelled(OrderCancelled {
            order_id: order.order_id,
            reason: ctx.error.unwrap_or("cancelled").to_string(),
            cancelled_at: chrono::Utc::now(),
        });
        let envelope = EventEnvelope::new(
            event.event_type(),
            order.order_id.to_string(),
            ctx.correlation_id,
            event.to_payload(),
        )
        .with_event_id(Uuid::new_v5(
            &ctx.correlation_id,
            b"place-order:cancelled",
        ));

        queue_fact(&self.pool, &self.outbox, &envelope)
            .await
            .map_err(CompensationError)
    }
}

/// Local step 5: announce confirmation with the shipment's tracking number.
struct ConfirmOrderStep {
    pool: PgPool,
    outbox: Arc<dyn OutboxStore>,
}

#[async_trait]
impl SagaStep for ConfirmOrderStep {
    fn name(&self) -> &str {
        "confirm-order"
    }

    async fn execute(&self, ctx: StepContext<'_>) -> StepResult {
        let order = match order_context(ctx.state) {
            Ok(order) => order,
            Err(reason) => return StepResult::failure(reason),
        };
        let Some(tracking_number) = order.tracking_number else {
            return StepResult::failure("confirm-order requires a tracking number");
        };

        let event = DomainEvent::OrderConfirmed(OrderConfirmed {
            order_id: order.order_id,
            tracking_number,
            confirmed_at: chrono::Utc::now(),
        });
        let envelope = EventEnvelope::new(
            event.event_type(),
            order.order_id.to_string(),
            ctx.correlation_id,
            event.to_payload(),
        )
        .with_event_id(step_command_id(ctx.correlation_id, self.name()));

        match queue_fact(&self.pool, &self.outbox, &envelope).await {
            Ok(()) => StepResult::success(),
            Err(detail) => StepResult::failure_with_cause("confirmation not queued", detail),
        }
    }

    async fn compensate(&self, _ctx: StepContext<'_>) -> Result<(), CompensationError> {
        // Confirmation is the last step; nothing downstream can fail after
        // it, so there is nothing to undo.
        Ok(())
    }
}

/// Assemble the order saga definition.
pub fn build_order_saga(
    pool: PgPool,
    outbox: Arc<dyn OutboxStore>,
    router: Arc<ReplyRouter>,
    compensation_wait: Duration,
) -> SagaDefinition {
    SagaDefinition::new(ORDER_SAGA_TYPE)
        .step(Arc::new(PlaceOrderStep {
            pool: pool.clone(),
            outbox: outbox.clone(),
        }))
        .step(Arc::new(
            EventStep::new(
                "reserve-inventory",
                pool.clone(),
                outbox.clone(),
                router.clone(),
                Box::new(reserve_inventory_command),
            )
            .with_compensation(Box::new(release_inventory_command))
            .with_compensation_wait(compensation_wait),
        ))
        .step(Arc::new(
            EventStep::new(
                "charge-payment",
                pool.clone(),
                outbox.clone(),
                router.clone(),
                Box::new(charge_payment_command),
            )
            .with_compensation(Box::new(refund_payment_command))
            .with_compensation_wait(compensation_wait),
        ))
        .step(Arc::new(
            EventStep::new(
                "create-shipment",
                pool.clone(),
                outbox.clone(),
                router,
                Box::new(create_shipment_command),
            )
            .with_compensation(Box::new(cancel_shipment_command))
            .with_compensation_wait(compensation_wait),
        ))
        .step(Arc::new(ConfirmOrderStep { pool, outbox }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn submitted_state() -> serde_json::Value {
        json!({
            "order_id": Uuid::new_v4(),
            "customer_id": Uuid::new_v4(),
            "items": [
                {"sku": "A", "quantity": 2, "unit_price_cents": 1000},
                {"sku": "B", "quantity": 1, "unit_price_cents": 500},
            ],
            "total_cents": 2500,
        })
    }

    #[test]
    fn initial_state_round_trips_through_context() {
        let command = SubmitOrder {
            order_id: Uuid::new_v4(),
            customer_id: Uuid::new_v4(),
            items: vec![OrderItem {
                sku: "A".to_string(),
                quantity: 2,
                unit_price_cents: 1000,
            }],
            total_cents: 2000,
        };

        let state = initial_state(&command);
        let order = order_context(&state).unwrap();
        assert_eq!(order.order_id, command.order_id);
        assert_eq!(order.total_cents, 2000);
        assert!(order.charge_id.is_none());
        assert!(order.tracking_number.is_none());
    }

    #[test]
    fn reserve_command_carries_items_and_routes_by_order() {
        let state = submitted_state();
        let spec = reserve_inventory_command(Uuid::new_v4(), &state).unwrap();

        assert_eq!(spec.event_type, "inventory.reserve");
        assert_eq!(spec.aggregate_key, state["order_id"].as_str().unwrap());
        assert_eq!(spec.payload["items"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn charge_command_uses_order_total() {
        let state = submitted_state();
        let spec = charge_payment_command(Uuid::new_v4(), &state).unwrap();

        assert_eq!(spec.event_type, "payment.charge");
        assert_eq!(spec.payload["amount_cents"], 2500);
    }

    #[test]
    fn refund_includes_charge_when_known() {
        let mut state = submitted_state();
        let charge_id = Uuid::new_v4();
        state["charge_id"] = json!(charge_id);

        let spec = refund_payment_command(Uuid::new_v4(), &state).unwrap();
        assert_eq!(spec.event_type, "payment.refund");
        assert_eq!(spec.payload["charge_id"], json!(charge_id));
        assert_eq!(spec.payload["amount_cents"], 2500);
    }

    #[test]
    fn refund_without_charge_is_still_buildable() {
        // Compensation of a step whose effect never landed must be safe.
        let spec = refund_payment_command(Uuid::new_v4(), &submitted_state()).unwrap();
        assert_eq!(spec.payload["charge_id"], serde_json::Value::Null);
    }

    #[test]
    fn cancel_shipment_tolerates_missing_tracking_number() {
        let spec = cancel_shipment_command(Uuid::new_v4(), &submitted_state()).unwrap();
        assert_eq!(spec.event_type, "shipping.cancel");
        assert_eq!(spec.payload["tracking_number"], serde_json::Value::Null);
    }

    #[test]
    fn malformed_state_is_a_build_failure() {
        let err = charge_payment_command(Uuid::new_v4(), &json!({"nope": 1})).unwrap_err();
        assert!(err.contains("order state malformed"));
    }
}
