//! Error types for booking lifecycle operations.

use std::fmt;

use thiserror::Error;

use crate::model::{BookingId, EscrowState, PartyId, PartyRole, RideStatus};
use crate::store::StoreError;

/// The lifecycle operation being performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Create,
    Accept,
    Complete,
    Cancel,
    Lock,
    Release,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Create => "create",
            Operation::Accept => "accept",
            Operation::Complete => "complete",
            Operation::Cancel => "cancel",
            Operation::Lock => "lock",
            Operation::Release => "release",
        };
        f.write_str(name)
    }
}

/// Error returned by [`Engine`](super::Engine) operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The party already has a waiting or accepted ride.
    #[error("{party} already has active ride {booking}; finish your current ride first")]
    Conflict { party: PartyId, booking: BookingId },

    /// Another driver won the race to accept.
    #[error("booking {0} is no longer available")]
    AlreadyTaken(BookingId),

    /// The row moved on concurrently; refresh before retrying.
    #[error("{operation}: booking {id} changed concurrently (now {status})")]
    StaleBooking {
        operation: Operation,
        id: BookingId,
        status: RideStatus,
    },

    /// Cancel on a completed or cancelled booking. Callers treat it as a no-op.
    #[error("booking {id} is already {status}")]
    AlreadyFinalized { id: BookingId, status: RideStatus },

    #[error("booking {0} not found")]
    NotFound(BookingId),

    #[error("{operation}: {party} is not the {role} of booking {id}")]
    NotAParty {
        operation: Operation,
        id: BookingId,
        role: PartyRole,
        party: PartyId,
    },

    #[error("{operation}: booking {id} is {status}")]
    InvalidState {
        operation: Operation,
        id: BookingId,
        status: RideStatus,
    },

    #[error("{operation}: booking {id} escrow is {state}")]
    InvalidEscrowState {
        operation: Operation,
        id: BookingId,
        state: EscrowState,
    },

    #[error("{0}")]
    TransientStore(#[from] StoreError),
}

impl EngineError {
    /// Whether retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::TransientStore(StoreError::Unavailable(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_unavailable_store_is_transient() {
        let id = BookingId::new();
        assert!(EngineError::from(StoreError::Unavailable("down".into())).is_transient());
        assert!(!EngineError::from(StoreError::DuplicateId(id)).is_transient());
        assert!(!EngineError::AlreadyTaken(id).is_transient());
    }

    #[test]
    fn conflict_message_tells_user_to_finish_ride() {
        let err = EngineError::Conflict {
            party: PartyId::new("p1"),
            booking: BookingId::new(),
        };
        assert!(err.to_string().contains("finish your current ride first"));
    }
}
