//! Order fulfilment saga
//!
//! Reserve stock, then charge the customer. If the charge fails for good,
//! the reservation is released before the run fails.

use std::time::Duration;

use async_trait::async_trait;
use keelrun_durable::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

pub const RESERVE: &str = "reserve";
pub const CHARGE: &str = "charge";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderInput {
    pub order_id: String,
    pub sku: String,
    pub quantity: u32,
    pub amount_cents: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderReceipt {
    pub order_id: String,
    pub reservation_id: String,
    pub charge_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reservation {
    pub reservation_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Charge {
    pub charge_id: String,
}

pub struct OrderWorkflow {
    input: OrderInput,
    reservation_id: Option<String>,
}

impl Workflow for OrderWorkflow {
    const TYPE: &'static str = "order_workflow";
    type Input = OrderInput;
    type Output = OrderReceipt;

    fn new(input: Self::Input) -> Self {
        Self {
            input,
            reservation_id: None,
        }
    }

    fn on_start(&mut self) -> Vec<WorkflowAction> {
        vec![WorkflowAction::schedule_activity(
            RESERVE,
            ReserveInventory::TYPE,
            json!({
                "order_id": self.input.order_id,
                "sku": self.input.sku,
                "quantity": self.input.quantity,
            }),
        )]
    }

    fn on_activity_completed(
        &mut self,
        activity_id: &str,
        result: serde_json::Value,
    ) -> Vec<WorkflowAction> {
        match activity_id {
            RESERVE => {
                let reservation: Reservation = match serde_json::from_value(result) {
                    Ok(r) => r,
                    Err(e) => return vec![WorkflowAction::fail(WorkflowError::new(e.to_string()))],
                };
                self.reservation_id = Some(reservation.reservation_id.clone());

                let charge_options = ActivityOptions::default()
                    .with_retry(
                        RetryPolicy::exponential()
                            .with_initial_interval(Duration::from_millis(200))
                            .with_non_retryable_error("card_declined"),
                    )
                    .with_start_to_close_timeout(Duration::from_secs(30));

                vec![
                    WorkflowAction::compensate_with(
                        ReleaseInventory::TYPE,
                        json!({ "reservation_id": reservation.reservation_id }),
                    ),
                    WorkflowAction::schedule_activity_with(
                        CHARGE,
                        ChargePayment::TYPE,
                        json!({
                            "order_id": self.input.order_id,
                            "amount_cents": self.input.amount_cents,
                        }),
                        charge_options,
                    ),
                ]
            }
            CHARGE => {
                let charge: Charge = match serde_json::from_value(result) {
                    Ok(c) => c,
                    Err(e) => return vec![WorkflowAction::fail(WorkflowError::new(e.to_string()))],
                };
                let receipt = OrderReceipt {
                    order_id: self.input.order_id.clone(),
                    reservation_id: self.reservation_id.clone().unwrap_or_default(),
                    charge_id: charge.charge_id,
                };
                vec![WorkflowAction::complete(json!(receipt))]
            }
            _ => vec![],
        }
    }

    fn on_activity_failed(
        &mut self,
        activity_id: &str,
        error: &ActivityError,
    ) -> Vec<WorkflowAction> {
        let error = WorkflowError::from(error);
        let message = format!("{} failed: {}", activity_id, error.message);
        vec![WorkflowAction::fail(WorkflowError {
            message,
            code: error.code,
        })]
    }

    /// Cancelling an order gives the stock back
    fn on_cancel_requested(&mut self, reason: &str) -> Vec<WorkflowAction> {
        vec![WorkflowAction::fail(
            WorkflowError::new(format!("order cancelled: {reason}")).with_code("cancelled"),
        )]
    }
}

// =============================================================================
// Activities
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReserveRequest {
    pub order_id: String,
    pub sku: String,
    pub quantity: u32,
}

pub struct ReserveInventory;

#[async_trait]
impl Activity for ReserveInventory {
    const TYPE: &'static str = "reserve_inventory";
    type Input = ReserveRequest;
    type Output = Reservation;

    async fn execute(
        &self,
        ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError> {
        if input.quantity == 0 {
            return Err(ActivityError::non_retryable("quantity must be positive"));
        }
        info!(order_id = %input.order_id, sku = %input.sku, attempt = ctx.attempt, "reserving stock");
        // Derived from the order so a repeated attempt reserves the same stock
        Ok(Reservation {
            reservation_id: format!("rsv-{}", input.order_id),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChargeRequest {
    pub order_id: String,
    pub amount_cents: u64,
}

/// Simulated payment provider
pub struct ChargePayment {
    /// Share of attempts that fail with a transient error
    pub failure_rate: f64,
    /// Amounts above this are declined
    pub limit_cents: u64,
}

impl Default for ChargePayment {
    fn default() -> Self {
        Self {
            failure_rate: 0.0,
            limit_cents: 100_000,
        }
    }
}

#[async_trait]
impl Activity for ChargePayment {
    const TYPE: &'static str = "charge_payment";
    type Input = ChargeRequest;
    type Output = Charge;

    async fn execute(
        &self,
        ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError> {
        if input.amount_cents > self.limit_cents {
            return Err(ActivityError::non_retryable("card declined").with_type("card_declined"));
        }
        if rand::random::<f64>() < self.failure_rate {
            return Err(ActivityError::retryable("payment provider unavailable"));
        }
        ctx.heartbeat(None)
            .await
            .map_err(|e| ActivityError::retryable(e.to_string()))?;

        info!(order_id = %input.order_id, amount_cents = input.amount_cents, attempt = ctx.attempt, "charged");
        Ok(Charge {
            charge_id: format!("ch-{}-{}", input.order_id, ctx.attempt),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseRequest {
    pub reservation_id: String,
}

pub struct ReleaseInventory;

#[async_trait]
impl Activity for ReleaseInventory {
    const TYPE: &'static str = "release_inventory";
    type Input = ReleaseRequest;
    type Output = serde_json::Value;

    async fn execute(
        &self,
        _ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError> {
        info!(reservation_id = %input.reservation_id, "releasing stock");
        Ok(json!({ "released": input.reservation_id }))
    }
}

/// Register the order activities on a pool
pub fn register_activities(pool: &WorkerPool, charge: ChargePayment) {
    pool.register_activity(ReserveInventory);
    pool.register_activity(charge);
    pool.register_activity(ReleaseInventory);
}
