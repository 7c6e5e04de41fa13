//! Saga step contract
//!
//! Steps are value-only (forward, compensate) pairs registered into the
//! orchestrator; the orchestrator owns all persisted state, steps stay
//! stateless. Step outputs are a tagged sum rather than a string-keyed map:
//! the serialized wire shape is unchanged, but inside the orchestrator the
//! compiler knows which step produced what.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core_types::{BookingId, PaymentId, SagaId, UserId};
use crate::errors::BookingError;
use crate::models::Reservation;
use crate::reservation::ReserveSpec;

use super::state::SagaState;

/// How a step failed, which decides what the orchestrator does next.
#[derive(Error, Debug)]
pub enum StepError {
    /// Worth retrying within the step's budget.
    #[error("transient: {0}")]
    Transient(String),

    /// Retrying cannot help; compensate and terminate.
    #[error("definitive: {0}")]
    Definitive(String),

    /// Definitive, with the typed error the client should see verbatim.
    #[error("{0}")]
    Domain(BookingError),
}

impl StepError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StepError::Transient(_))
            || matches!(self, StepError::Domain(e) if e.is_transient())
    }

    /// Surface to the HTTP layer.
    pub fn into_booking_error(self) -> BookingError {
        match self {
            StepError::Domain(e) => e,
            StepError::Transient(msg) => BookingError::ServiceUnavailable(msg),
            StepError::Definitive(msg) => BookingError::Internal(msg),
        }
    }
}

impl From<BookingError> for StepError {
    fn from(e: BookingError) -> Self {
        if e.is_transient() {
            StepError::Transient(e.to_string())
        } else {
            StepError::Domain(e)
        }
    }
}

/// What a completed step produced. Serialized (tagged) into the saga's
/// persisted step-output columns.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum StepOutput {
    Reserved {
        reservation_id: BookingId,
        expires_at: DateTime<Utc>,
        total: Decimal,
    },
    Paid {
        payment_id: PaymentId,
    },
    Confirmed {
        confirmation_code: String,
    },
    Notified,
}

/// Outputs accumulated across steps, readable by later steps.
#[derive(Debug, Default, Clone)]
pub struct SagaOutputs {
    pub reservation: Option<Reservation>,
    pub payment_id: Option<PaymentId>,
    pub confirmation_code: Option<String>,
}

/// Everything a step may read. The orchestrator builds one per run and
/// persists output changes after each completed step.
pub struct SagaContext {
    pub saga_id: SagaId,
    pub user: UserId,
    pub spec: ReserveSpec,
    pub idempotency_key: String,
    pub queue_pass: Option<String>,
    /// Client payment reference, present once the confirm call arrives.
    pub payment_reference: Option<String>,
    outputs: Mutex<SagaOutputs>,
}

impl SagaContext {
    pub fn new(
        saga_id: SagaId,
        user: UserId,
        spec: ReserveSpec,
        idempotency_key: String,
        queue_pass: Option<String>,
    ) -> Self {
        Self {
            saga_id,
            user,
            spec,
            idempotency_key,
            queue_pass,
            payment_reference: None,
            outputs: Mutex::new(SagaOutputs::default()),
        }
    }

    pub fn with_payment_reference(mut self, reference: String) -> Self {
        self.payment_reference = Some(reference);
        self
    }

    pub fn outputs(&self) -> SagaOutputs {
        self.outputs.lock().unwrap().clone()
    }

    /// Stash the full reservation so later steps read it without a refetch.
    pub fn set_reservation(&self, reservation: Reservation) {
        self.outputs.lock().unwrap().reservation = Some(reservation);
    }

    pub fn record(&self, output: &StepOutput) {
        let mut outputs = self.outputs.lock().unwrap();
        match output {
            StepOutput::Reserved { .. } => {} // the full row is stashed by the step
            StepOutput::Paid { payment_id } => outputs.payment_id = Some(*payment_id),
            StepOutput::Confirmed { confirmation_code } => {
                outputs.confirmation_code = Some(confirmation_code.clone())
            }
            StepOutput::Notified => {}
        }
    }

    pub fn reservation(&self) -> Option<Reservation> {
        self.outputs.lock().unwrap().reservation.clone()
    }

    pub fn reservation_id(&self) -> Option<BookingId> {
        self.outputs.lock().unwrap().reservation.as_ref().map(|r| r.id)
    }

    pub fn payment_id(&self) -> Option<PaymentId> {
        self.outputs.lock().unwrap().payment_id
    }
}

/// One step of the booking pipeline.
#[async_trait]
pub trait SagaStep: Send + Sync {
    fn name(&self) -> &'static str;

    /// State the saga reaches when this step completes.
    fn completed_state(&self) -> SagaState;

    /// Non-critical steps never trigger compensation on failure.
    fn critical(&self) -> bool {
        true
    }

    async fn execute(&self, ctx: &SagaContext) -> Result<StepOutput, StepError>;

    /// Undo a completed forward action. Must be idempotent: recovery may
    /// call it again after a crash mid-compensation.
    async fn compensate(&self, ctx: &SagaContext) -> Result<(), StepError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_step_output_wire_shape() {
        let output = StepOutput::Paid {
            payment_id: Uuid::nil(),
        };
        let json = serde_json::to_value(&output).unwrap();
        assert_eq!(json["step"], "paid");
        assert_eq!(json["payment_id"], "00000000-0000-0000-0000-000000000000");

        let back: StepOutput = serde_json::from_value(json).unwrap();
        assert!(matches!(back, StepOutput::Paid { .. }));
    }

    #[test]
    fn test_outputs_accumulate() {
        let ctx = SagaContext::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            ReserveSpec {
                event_id: Uuid::new_v4(),
                show_id: Uuid::new_v4(),
                zone_id: Uuid::new_v4(),
                quantity: 1,
                unit_price: None,
            },
            "key".into(),
            None,
        );

        ctx.record(&StepOutput::Paid {
            payment_id: Uuid::nil(),
        });
        ctx.record(&StepOutput::Confirmed {
            confirmation_code: "ABCD1234".into(),
        });

        let outputs = ctx.outputs();
        assert_eq!(outputs.payment_id, Some(Uuid::nil()));
        assert_eq!(outputs.confirmation_code.as_deref(), Some("ABCD1234"));
        assert!(outputs.reservation.is_none());
    }

    #[test]
    fn test_transient_classification_via_domain() {
        let err: StepError = BookingError::ServiceUnavailable("down".into()).into();
        assert!(err.is_transient());
        let err: StepError = BookingError::InsufficientStock(0).into();
        assert!(!err.is_transient());
    }
}
