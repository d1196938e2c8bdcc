use crate::model::{BookingId, PartyId, PartyRole, RideBooking, RideStatus};

use super::error::{EngineError, Operation};

/// Outcome of one party marking a ride complete.
#[derive(Debug, Clone)]
pub struct Completion {
    /// The row as re-read after this caller's writes.
    pub booking: RideBooking,
    /// True only for the caller whose write moved the ride to `completed`.
    /// That caller, and no other, must release the escrow.
    pub should_release_payment: bool,
}

/// Check that `party` is the stored `role` of `booking`.
pub(super) fn ensure_party(
    operation: Operation,
    booking: &RideBooking,
    role: PartyRole,
    party: &PartyId,
) -> Result<(), EngineError> {
    if booking.party(role) == Some(party) {
        return Ok(());
    }
    Err(EngineError::NotAParty {
        operation,
        id: booking.id,
        role,
        party: party.clone(),
    })
}

/// Map a failed conditional write to the error matching the row's state now.
pub(super) fn lost_race(
    operation: Operation,
    id: BookingId,
    current: Option<RideBooking>,
) -> EngineError {
    match current {
        None => EngineError::NotFound(id),
        Some(row) if operation == Operation::Cancel && row.status.is_terminal() => {
            EngineError::AlreadyFinalized {
                id,
                status: row.status,
            }
        }
        Some(row) => EngineError::StaleBooking {
            operation,
            id,
            status: row.status,
        },
    }
}

/// Which role `party` can cancel `booking` as, if any.
///
/// The passenger may cancel while the ride is active; the assigned driver
/// only once it has been accepted.
pub(super) fn cancel_role(booking: &RideBooking, party: &PartyId) -> Option<PartyRole> {
    if &booking.passenger_id == party {
        Some(PartyRole::Passenger)
    } else if booking.status == RideStatus::Accepted && booking.driver_id.as_ref() == Some(party) {
        Some(PartyRole::Driver)
    } else {
        None
    }
}
