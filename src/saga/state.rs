//! Saga state definitions
//!
//! State ids are SMALLINTs in PostgreSQL. Terminal states other than
//! CONFIRMED are negative. Transitions are monotone: once terminal, a saga
//! never moves again, and every CAS is guarded by the expected from-state.

use std::fmt;

/// Booking saga states.
///
/// ```text
/// CREATED ──► RESERVED ──► PAID ──► CONFIRMED   (happy path)
///     │           │          │
///     │           │          └──► FAILED        (confirm fails → refund + release)
///     │           ├─────────────► FAILED        (payment fails → release)
///     │           └─────────────► CANCELLED     (user released the hold)
///     ├─────────────────────────► FAILED        (reserve step failed)
///     └─► CANCELLED                             (user cancel before reserve)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i16)]
pub enum SagaState {
    /// Saga row written, no step completed yet
    Created = 0,

    /// Seats held, payment pending
    Reserved = 10,

    /// Payment captured, confirmation pending
    Paid = 20,

    /// Terminal: booking confirmed
    Confirmed = 30,

    /// Terminal: a step failed definitively; completed steps compensated
    Failed = -10,

    /// Terminal: cancelled by the user
    Cancelled = -20,
}

impl SagaState {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SagaState::Confirmed | SagaState::Failed | SagaState::Cancelled
        )
    }

    /// Numeric id for PostgreSQL storage.
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(SagaState::Created),
            10 => Some(SagaState::Reserved),
            20 => Some(SagaState::Paid),
            30 => Some(SagaState::Confirmed),
            -10 => Some(SagaState::Failed),
            -20 => Some(SagaState::Cancelled),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SagaState::Created => "CREATED",
            SagaState::Reserved => "RESERVED",
            SagaState::Paid => "PAID",
            SagaState::Confirmed => "CONFIRMED",
            SagaState::Failed => "FAILED",
            SagaState::Cancelled => "CANCELLED",
        }
    }

    /// Whether `from → to` is a legal edge of the machine above.
    pub fn valid_transition(from: SagaState, to: SagaState) -> bool {
        use SagaState::*;
        matches!(
            (from, to),
            (Created, Reserved)
                | (Created, Cancelled)
                | (Created, Failed)
                | (Reserved, Paid)
                | (Reserved, Failed)
                | (Reserved, Cancelled)
                | (Paid, Confirmed)
                | (Paid, Failed)
        )
    }
}

impl fmt::Display for SagaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(SagaState::Confirmed.is_terminal());
        assert!(SagaState::Failed.is_terminal());
        assert!(SagaState::Cancelled.is_terminal());

        assert!(!SagaState::Created.is_terminal());
        assert!(!SagaState::Reserved.is_terminal());
        assert!(!SagaState::Paid.is_terminal());
    }

    #[test]
    fn test_state_id_roundtrip() {
        let states = [
            SagaState::Created,
            SagaState::Reserved,
            SagaState::Paid,
            SagaState::Confirmed,
            SagaState::Failed,
            SagaState::Cancelled,
        ];
        for state in states {
            assert_eq!(SagaState::from_id(state.id()), Some(state));
        }
        assert_eq!(SagaState::from_id(999), None);
    }

    #[test]
    fn test_happy_path_edges() {
        assert!(SagaState::valid_transition(SagaState::Created, SagaState::Reserved));
        assert!(SagaState::valid_transition(SagaState::Reserved, SagaState::Paid));
        assert!(SagaState::valid_transition(SagaState::Paid, SagaState::Confirmed));
    }

    #[test]
    fn test_no_backward_or_skip_edges() {
        assert!(!SagaState::valid_transition(SagaState::Paid, SagaState::Reserved));
        assert!(!SagaState::valid_transition(SagaState::Created, SagaState::Paid));
        assert!(!SagaState::valid_transition(SagaState::Confirmed, SagaState::Failed));
        assert!(!SagaState::valid_transition(SagaState::Failed, SagaState::Reserved));
    }
}
