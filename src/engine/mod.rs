//! Booking lifecycle engine.
//!
//! Drives a booking through `waiting → accepted → completed`, with
//! `cancelled` reachable from either active state. The engine keeps no copy
//! of the rows: every transition is a single predicated write against the
//! store, so concurrent callers racing on the same booking are arbitrated by
//! the store's row-level atomicity.
//!
//! The one-active-ride-per-party rule is a check-then-act against the store
//! and can be raced by concurrent submissions from the same party.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::geo::{self, Candidate, Coordinate};
use crate::model::{
    BookingId, EscrowState, NewBooking, PartyId, PartyRole, RideBooking, RideStatus, TxnId,
    WalletAddress,
};
use crate::store::{BookingStore, Guard, Patch};

mod state;
pub use state::Completion;

mod error;
pub use error::{EngineError, Operation};

/// The booking lifecycle engine.
pub struct Engine<S> {
    store: Arc<S>,
    config: EngineConfig,
}

impl<S> Clone for Engine<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            config: self.config.clone(),
        }
    }
}

/// Public API
impl<S: BookingStore> Engine<S> {
    pub fn new(store: Arc<S>, config: EngineConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Passenger requests a ride.
    pub async fn create(&self, request: NewBooking) -> Result<RideBooking, EngineError> {
        let passenger = request.passenger_id.clone();
        let result = self.apply_create(request).await;
        Self::log_result(Operation::Create, None, &passenger, &result);
        result
    }

    /// Driver claims a waiting ride.
    pub async fn accept(
        &self,
        id: BookingId,
        driver: &PartyId,
        wallet: Option<WalletAddress>,
    ) -> Result<RideBooking, EngineError> {
        let result = self.apply_accept(id, driver, wallet).await;
        Self::log_result(Operation::Accept, Some(id), driver, &result);
        result
    }

    /// One side confirms the ride is done.
    pub async fn mark_completed(
        &self,
        id: BookingId,
        role: PartyRole,
        party: &PartyId,
    ) -> Result<Completion, EngineError> {
        let result = self.apply_completion(id, role, party).await;
        Self::log_result(Operation::Complete, Some(id), party, &result);
        if let Ok(completion) = &result {
            if completion.should_release_payment {
                info!(booking = %id, party = %party, "ride finalized; payment release due");
            }
        }
        result
    }

    /// Cancel a ride that has not finished yet.
    pub async fn cancel(
        &self,
        id: BookingId,
        caller: &PartyId,
    ) -> Result<RideBooking, EngineError> {
        let result = self.apply_cancel(id, caller).await;
        Self::log_result(Operation::Cancel, Some(id), caller, &result);
        result
    }

    /// Move escrow from `none` to `pending_lock` before funds are locked.
    ///
    /// A row already in `pending_lock` holds an attempt whose gateway reply
    /// never arrived; it is returned unchanged so the same lock can be
    /// re-issued.
    pub async fn begin_lock(
        &self,
        id: BookingId,
        passenger: &PartyId,
    ) -> Result<RideBooking, EngineError> {
        let result = self.apply_begin_lock(id, passenger).await;
        Self::log_result(Operation::Lock, Some(id), passenger, &result);
        result
    }

    /// Persist a successful gateway lock.
    pub async fn record_lock(&self, id: BookingId, txn: TxnId) -> Result<RideBooking, EngineError> {
        let patch = Patch {
            escrow_state: Some(EscrowState::Locked),
            lock_txn_id: Some(txn),
            ..Patch::default()
        };
        let guard = Guard::default().escrow_in(&[EscrowState::PendingLock]);
        self.update_escrow(Operation::Lock, id, guard, patch).await
    }

    /// Roll `pending_lock` back to `none` after the gateway refused the lock.
    pub async fn abort_lock(&self, id: BookingId) -> Result<RideBooking, EngineError> {
        self.update_escrow(
            Operation::Lock,
            id,
            Guard::default().escrow_in(&[EscrowState::PendingLock]),
            Patch::escrow(EscrowState::None),
        )
        .await
    }

    /// Persist a successful gateway release.
    ///
    /// Recording a release twice returns the already-released row unchanged.
    pub async fn record_release(
        &self,
        id: BookingId,
        txn: TxnId,
    ) -> Result<RideBooking, EngineError> {
        let patch = Patch {
            escrow_state: Some(EscrowState::Released),
            release_txn_id: Some(txn),
            ..Patch::default()
        };
        let guard = Guard::status(RideStatus::Completed).escrow_in(&[EscrowState::Locked]);
        match self.store.update_where(id, guard, patch).await? {
            Some(row) => {
                info!(booking = %id, txn = ?row.release_txn_id, "escrow release recorded");
                Ok(row)
            }
            None => {
                let current = self.get(id).await?;
                if current.escrow_state == EscrowState::Released {
                    warn!(booking = %id, "escrow release already recorded");
                    return Ok(current);
                }
                if current.status != RideStatus::Completed {
                    return Err(EngineError::InvalidState {
                        operation: Operation::Release,
                        id,
                        status: current.status,
                    });
                }
                Err(EngineError::InvalidEscrowState {
                    operation: Operation::Release,
                    id,
                    state: current.escrow_state,
                })
            }
        }
    }

    pub async fn get(&self, id: BookingId) -> Result<RideBooking, EngineError> {
        self.store.get(id).await?.ok_or(EngineError::NotFound(id))
    }

    /// The party's waiting or accepted ride, if any.
    pub async fn active_for(
        &self,
        party: &PartyId,
    ) -> Result<Option<RideBooking>, EngineError> {
        let rides = self.store.by_party(party).await?;
        Ok(rides.into_iter().find(|b| b.status.is_active()))
    }

    /// Every waiting ride, newest first.
    pub async fn fetch_waiting(&self) -> Result<Vec<RideBooking>, EngineError> {
        Ok(self.store.by_status(&[RideStatus::Waiting]).await?)
    }

    /// Every ride involving the party, newest first.
    pub async fn fetch_for_party(
        &self,
        party: &PartyId,
    ) -> Result<Vec<RideBooking>, EngineError> {
        Ok(self.store.by_party(party).await?)
    }

    /// Waiting rides within the configured radius of `driver`.
    pub async fn candidates(&self, driver: Coordinate) -> Result<Vec<Candidate>, EngineError> {
        let waiting = self.fetch_waiting().await?;
        Ok(geo::nearby(driver, &waiting, self.config.search_radius_km))
    }
}

/// Private API
impl<S: BookingStore> Engine<S> {
    /// Small helper to log operation results
    fn log_result<T>(
        operation: Operation,
        id: Option<BookingId>,
        party: &PartyId,
        result: &Result<T, EngineError>,
    ) {
        match (result, id) {
            (Ok(_), Some(id)) => info!(booking = %id, party = %party, "{operation} applied"),
            (Ok(_), None) => info!(party = %party, "{operation} applied"),
            (Err(e), _) if e.is_transient() => {
                warn!(booking = ?id, party = %party, reason = %e, "{operation} failed")
            }
            (Err(e), Some(id)) => {
                info!(booking = %id, party = %party, reason = %e, "{operation} skipped")
            }
            (Err(e), None) => info!(party = %party, reason = %e, "{operation} skipped"),
        }
    }

    /// Reject the call if the party already has an active ride.
    async fn ensure_no_active(&self, party: &PartyId) -> Result<(), EngineError> {
        match self.active_for(party).await? {
            Some(active) => Err(EngineError::Conflict {
                party: party.clone(),
                booking: active.id,
            }),
            None => Ok(()),
        }
    }

    /// Create a booking:
    /// - Ensure the passenger has no active ride (best effort)
    /// - Insert a `waiting` row with both flags cleared and no escrow
    async fn apply_create(&self, request: NewBooking) -> Result<RideBooking, EngineError> {
        self.ensure_no_active(&request.passenger_id).await?;
        let booking = RideBooking::from_request(request, Utc::now());
        Ok(self.store.insert(booking).await?)
    }

    /// Accept a booking:
    /// - Ensure the driver has no active ride (best effort)
    /// - Claim the row with one write predicated on `status = waiting`
    ///
    /// Of several drivers racing, exactly one write matches the row.
    async fn apply_accept(
        &self,
        id: BookingId,
        driver: &PartyId,
        wallet: Option<WalletAddress>,
    ) -> Result<RideBooking, EngineError> {
        self.ensure_no_active(driver).await?;

        let patch = Patch {
            status: Some(RideStatus::Accepted),
            driver_id: Some(driver.clone()),
            driver_wallet: wallet,
            passenger_completed: Some(false),
            driver_completed: Some(false),
            ..Patch::default()
        };
        let guard = Guard::status(RideStatus::Waiting);
        if let Some(row) = self.store.update_where(id, guard, patch).await? {
            return Ok(row);
        }

        // nothing matched: either the row is gone or someone else moved it first
        match self.store.get(id).await? {
            None => Err(EngineError::NotFound(id)),
            Some(_) => Err(EngineError::AlreadyTaken(id)),
        }
    }

    /// Mark one side complete:
    /// - Check the caller is the stored party for `role`
    /// - Set that side's flag, predicated on `accepted` and the flag unset
    /// - Re-read; if both flags are set, finalize with a write predicated on
    ///   `accepted` and both flags set
    ///
    /// Only the caller whose finalizing write matched gets
    /// `should_release_payment`.
    async fn apply_completion(
        &self,
        id: BookingId,
        role: PartyRole,
        party: &PartyId,
    ) -> Result<Completion, EngineError> {
        let booking = self.get(id).await?;
        state::ensure_party(Operation::Complete, &booking, role, party)?;
        match booking.status {
            RideStatus::Accepted => {}
            RideStatus::Waiting => {
                return Err(EngineError::InvalidState {
                    operation: Operation::Complete,
                    id,
                    status: booking.status,
                });
            }
            RideStatus::Completed | RideStatus::Cancelled => {
                return Err(state::lost_race(Operation::Complete, id, Some(booking)));
            }
        }
        if booking.completed_by(role) {
            return Err(state::lost_race(Operation::Complete, id, Some(booking)));
        }

        let flag_guard = Guard::status(RideStatus::Accepted).completed(role, false);
        if self
            .store
            .update_where(id, flag_guard, Patch::completed(role))
            .await?
            .is_none()
        {
            let current = self.store.get(id).await?;
            return Err(state::lost_race(Operation::Complete, id, current));
        }

        let current = self.get(id).await?;
        if current.status != RideStatus::Accepted || !current.both_completed() {
            return Ok(Completion {
                booking: current,
                should_release_payment: false,
            });
        }

        let finalize_guard = Guard::status(RideStatus::Accepted)
            .completed(PartyRole::Passenger, true)
            .completed(PartyRole::Driver, true);
        match self
            .store
            .update_where(id, finalize_guard, Patch::status(RideStatus::Completed))
            .await?
        {
            Some(done) => Ok(Completion {
                booking: done,
                should_release_payment: true,
            }),
            None => Ok(Completion {
                booking: self.get(id).await?,
                should_release_payment: false,
            }),
        }
    }

    /// Cancel a booking:
    /// - Terminal rows report `AlreadyFinalized` and are left untouched
    /// - Passenger may cancel `waiting` or `accepted`; the driver only `accepted`
    /// - Escrow is left as it is; funds held for a cancelled ride are logged
    ///   for manual refund
    async fn apply_cancel(
        &self,
        id: BookingId,
        caller: &PartyId,
    ) -> Result<RideBooking, EngineError> {
        let booking = self.get(id).await?;
        if booking.status.is_terminal() {
            return Err(EngineError::AlreadyFinalized {
                id,
                status: booking.status,
            });
        }

        let guard = match state::cancel_role(&booking, caller) {
            Some(PartyRole::Passenger) => Guard::status_in(&RideStatus::ACTIVE),
            Some(PartyRole::Driver) => Guard::status(RideStatus::Accepted),
            None => {
                let role = if booking.driver_id.as_ref() == Some(caller) {
                    PartyRole::Driver
                } else {
                    PartyRole::Passenger
                };
                return Err(EngineError::NotAParty {
                    operation: Operation::Cancel,
                    id,
                    role,
                    party: caller.clone(),
                });
            }
        };

        match self
            .store
            .update_where(id, guard, Patch::status(RideStatus::Cancelled))
            .await?
        {
            Some(row) => {
                if matches!(row.escrow_state, EscrowState::Locked | EscrowState::PendingLock) {
                    warn!(
                        booking = %id,
                        escrow = %row.escrow_state,
                        txn = ?row.lock_txn_id,
                        "ride cancelled with funds in escrow; refund needs manual settlement"
                    );
                }
                Ok(row)
            }
            None => {
                let current = self.store.get(id).await?;
                Err(state::lost_race(Operation::Cancel, id, current))
            }
        }
    }

    /// Start funding the escrow:
    /// - Only the passenger of an `accepted` ride with no escrow yet
    /// - An unconfirmed `pending_lock` on a ride that was not cancelled is
    ///   handed back as is
    async fn apply_begin_lock(
        &self,
        id: BookingId,
        passenger: &PartyId,
    ) -> Result<RideBooking, EngineError> {
        let booking = self.get(id).await?;
        state::ensure_party(Operation::Lock, &booking, PartyRole::Passenger, passenger)?;
        if booking.escrow_state == EscrowState::PendingLock
            && matches!(booking.status, RideStatus::Accepted | RideStatus::Completed)
        {
            return Ok(booking);
        }
        if booking.status != RideStatus::Accepted {
            return Err(EngineError::InvalidState {
                operation: Operation::Lock,
                id,
                status: booking.status,
            });
        }
        if booking.escrow_state != EscrowState::None {
            return Err(EngineError::InvalidEscrowState {
                operation: Operation::Lock,
                id,
                state: booking.escrow_state,
            });
        }

        let guard = Guard::status(RideStatus::Accepted).escrow_in(&[EscrowState::None]);
        match self
            .store
            .update_where(id, guard, Patch::escrow(EscrowState::PendingLock))
            .await?
        {
            Some(row) => Ok(row),
            None => {
                let current = self.store.get(id).await?;
                Err(state::lost_race(Operation::Lock, id, current))
            }
        }
    }

    async fn update_escrow(
        &self,
        operation: Operation,
        id: BookingId,
        guard: Guard,
        patch: Patch,
    ) -> Result<RideBooking, EngineError> {
        match self.store.update_where(id, guard, patch).await? {
            Some(row) => {
                info!(booking = %id, escrow = %row.escrow_state, "escrow state updated");
                Ok(row)
            }
            None => {
                let current = self.get(id).await?;
                Err(EngineError::InvalidEscrowState {
                    operation,
                    id,
                    state: current.escrow_state,
                })
            }
        }
    }
}
