//! Payment collaborator
//!
//! Gateway integration details are out of scope; the saga only needs
//! charge/refund with a clean transient-vs-definitive split. A decline is
//! an outcome, not an error: it terminates the saga without retry.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::core_types::{BookingId, PaymentId, UserId};

#[derive(Error, Debug)]
pub enum PaymentError {
    /// Timeout, 5xx, connection refused. Retried within the step budget.
    #[error("payment service unavailable: {0}")]
    Transient(String),

    /// Malformed request or collaborator contract violation. Not retried.
    #[error("payment request rejected: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentOutcome {
    Approved { payment_id: PaymentId },
    Declined { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct ChargeRequest {
    pub booking_id: BookingId,
    pub user_id: UserId,
    pub amount: Decimal,
    pub currency: String,
    /// Client payment reference (card token, wallet id, ...)
    pub reference: String,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn charge(&self, request: &ChargeRequest) -> Result<PaymentOutcome, PaymentError>;

    async fn refund(&self, payment_id: &PaymentId) -> Result<(), PaymentError>;
}

// ============================================================
// HTTP implementation
// ============================================================

#[derive(Debug, Deserialize)]
struct ChargeReply {
    approved: bool,
    payment_id: Option<PaymentId>,
    reason: Option<String>,
}

pub struct HttpPaymentGateway {
    client: reqwest::Client,
    base_url: String,
}

impl HttpPaymentGateway {
    pub fn new(base_url: String, timeout: Duration) -> Result<Self, PaymentError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PaymentError::Rejected(format!("client init: {e}")))?;
        Ok(Self { client, base_url })
    }
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    async fn charge(&self, request: &ChargeRequest) -> Result<PaymentOutcome, PaymentError> {
        let url = format!("{}/charges", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| PaymentError::Transient(e.to_string()))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(PaymentError::Transient(format!("status {status}")));
        }
        if !status.is_success() {
            return Err(PaymentError::Rejected(format!("status {status}")));
        }

        let reply: ChargeReply = response
            .json()
            .await
            .map_err(|e| PaymentError::Rejected(format!("bad reply: {e}")))?;

        if reply.approved {
            let payment_id = reply
                .payment_id
                .ok_or_else(|| PaymentError::Rejected("approved without payment_id".into()))?;
            Ok(PaymentOutcome::Approved { payment_id })
        } else {
            Ok(PaymentOutcome::Declined {
                reason: reply.reason.unwrap_or_else(|| "declined".into()),
            })
        }
    }

    async fn refund(&self, payment_id: &PaymentId) -> Result<(), PaymentError> {
        let url = format!("{}/refunds", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "payment_id": payment_id }))
            .send()
            .await
            .map_err(|e| PaymentError::Transient(e.to_string()))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(PaymentError::Transient(format!("status {status}")));
        }
        if !status.is_success() {
            return Err(PaymentError::Rejected(format!("status {status}")));
        }
        Ok(())
    }
}

// ============================================================
// Mock implementation (tests, standalone mode)
// ============================================================

/// Scripted behavior for the mock gateway.
#[derive(Debug, Clone)]
pub enum MockBehavior {
    ApproveAll,
    DeclineAll { reason: String },
    /// Fail transiently `failures` times, then approve.
    FlakyThenApprove { failures: u32 },
}

pub struct MockPaymentGateway {
    behavior: Mutex<MockBehavior>,
    charges: Mutex<Vec<ChargeRequest>>,
    refunds: Mutex<Vec<PaymentId>>,
}

impl MockPaymentGateway {
    pub fn new(behavior: MockBehavior) -> Self {
        Self {
            behavior: Mutex::new(behavior),
            charges: Mutex::new(Vec::new()),
            refunds: Mutex::new(Vec::new()),
        }
    }

    pub fn approve_all() -> Self {
        Self::new(MockBehavior::ApproveAll)
    }

    pub fn decline_all(reason: &str) -> Self {
        Self::new(MockBehavior::DeclineAll {
            reason: reason.to_string(),
        })
    }

    pub fn charge_count(&self) -> usize {
        self.charges.lock().unwrap().len()
    }

    pub fn refunded(&self) -> Vec<PaymentId> {
        self.refunds.lock().unwrap().clone()
    }
}

#[async_trait]
impl PaymentGateway for MockPaymentGateway {
    async fn charge(&self, request: &ChargeRequest) -> Result<PaymentOutcome, PaymentError> {
        self.charges.lock().unwrap().push(request.clone());
        let mut behavior = self.behavior.lock().unwrap();
        match &mut *behavior {
            MockBehavior::ApproveAll => Ok(PaymentOutcome::Approved {
                payment_id: Uuid::new_v4(),
            }),
            MockBehavior::DeclineAll { reason } => Ok(PaymentOutcome::Declined {
                reason: reason.clone(),
            }),
            MockBehavior::FlakyThenApprove { failures } => {
                if *failures > 0 {
                    *failures -= 1;
                    Err(PaymentError::Transient("simulated outage".into()))
                } else {
                    Ok(PaymentOutcome::Approved {
                        payment_id: Uuid::new_v4(),
                    })
                }
            }
        }
    }

    async fn refund(&self, payment_id: &PaymentId) -> Result<(), PaymentError> {
        self.refunds.lock().unwrap().push(*payment_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn charge_request() -> ChargeRequest {
        ChargeRequest {
            booking_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            amount: Decimal::new(10000, 2),
            currency: "USD".into(),
            reference: "tok_visa".into(),
        }
    }

    #[tokio::test]
    async fn test_mock_decline() {
        let gateway = MockPaymentGateway::decline_all("card_declined");
        match gateway.charge(&charge_request()).await.unwrap() {
            PaymentOutcome::Declined { reason } => assert_eq!(reason, "card_declined"),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(gateway.charge_count(), 1);
    }

    #[tokio::test]
    async fn test_mock_flaky_then_approve() {
        let gateway = MockPaymentGateway::new(MockBehavior::FlakyThenApprove { failures: 2 });
        assert!(gateway.charge(&charge_request()).await.is_err());
        assert!(gateway.charge(&charge_request()).await.is_err());
        assert!(matches!(
            gateway.charge(&charge_request()).await.unwrap(),
            PaymentOutcome::Approved { .. }
        ));
    }
}
