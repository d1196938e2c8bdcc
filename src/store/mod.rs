//! Booking persistence.
//!
//! The store owns every booking row. All mutation goes through
//! [`BookingStore::update_where`], a single-row predicated write: it either
//! applies the patch against the latest committed row or affects nothing.
//! Callers must state their precondition in the [`Guard`] rather than rely on
//! an earlier read.

use std::future::Future;

use thiserror::Error;

use crate::bus::ChangeBus;
use crate::model::{
    BookingId, EscrowState, PartyId, PartyRole, RideBooking, RideStatus, TxnId, WalletAddress,
};

mod memory;
pub use memory::MemoryStore;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("booking {0} already exists")]
    DuplicateId(BookingId),
}

/// Predicate a row must satisfy for a conditional update to apply.
///
/// Unset fields are not checked.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Guard {
    status_in: Option<Vec<RideStatus>>,
    escrow_in: Option<Vec<EscrowState>>,
    passenger_completed: Option<bool>,
    driver_completed: Option<bool>,
}

impl Guard {
    /// Require the row's status to be one of `statuses`.
    pub fn status_in(statuses: &[RideStatus]) -> Self {
        Self {
            status_in: Some(statuses.to_vec()),
            ..Self::default()
        }
    }

    pub fn status(status: RideStatus) -> Self {
        Self::status_in(&[status])
    }

    pub fn escrow_in(mut self, states: &[EscrowState]) -> Self {
        self.escrow_in = Some(states.to_vec());
        self
    }

    /// Require the completion flag of `role` to equal `value`.
    pub fn completed(mut self, role: PartyRole, value: bool) -> Self {
        match role {
            PartyRole::Passenger => self.passenger_completed = Some(value),
            PartyRole::Driver => self.driver_completed = Some(value),
        }
        self
    }

    pub fn holds(&self, row: &RideBooking) -> bool {
        self.status_in.as_ref().is_none_or(|s| s.contains(&row.status))
            && self.escrow_in.as_ref().is_none_or(|s| s.contains(&row.escrow_state))
            && self.passenger_completed.is_none_or(|v| row.passenger_completed == v)
            && self.driver_completed.is_none_or(|v| row.driver_completed == v)
    }
}

/// Field assignments of a conditional update. Unset fields are left as is.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Patch {
    pub status: Option<RideStatus>,
    pub driver_id: Option<PartyId>,
    pub driver_wallet: Option<WalletAddress>,
    pub passenger_completed: Option<bool>,
    pub driver_completed: Option<bool>,
    pub escrow_state: Option<EscrowState>,
    pub lock_txn_id: Option<TxnId>,
    pub release_txn_id: Option<TxnId>,
}

impl Patch {
    pub fn status(status: RideStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn escrow(state: EscrowState) -> Self {
        Self {
            escrow_state: Some(state),
            ..Self::default()
        }
    }

    pub fn completed(role: PartyRole) -> Self {
        let mut patch = Self::default();
        match role {
            PartyRole::Passenger => patch.passenger_completed = Some(true),
            PartyRole::Driver => patch.driver_completed = Some(true),
        }
        patch
    }

    /// Whether the status change, if any, is one the lifecycle allows.
    pub fn keeps_lifecycle(&self, row: &RideBooking) -> bool {
        self.status
            .is_none_or(|next| next == row.status || row.status.can_transition_to(next))
    }

    /// Assign the set fields and bump the row's revision.
    pub fn apply(self, row: &mut RideBooking) {
        if let Some(status) = self.status {
            row.status = status;
        }
        if let Some(driver) = self.driver_id {
            row.driver_id = Some(driver);
        }
        if let Some(wallet) = self.driver_wallet {
            row.driver_wallet = Some(wallet);
        }
        if let Some(flag) = self.passenger_completed {
            row.passenger_completed = flag;
        }
        if let Some(flag) = self.driver_completed {
            row.driver_completed = flag;
        }
        if let Some(state) = self.escrow_state {
            row.escrow_state = state;
        }
        if let Some(txn) = self.lock_txn_id {
            row.lock_txn_id = Some(txn);
        }
        if let Some(txn) = self.release_txn_id {
            row.release_txn_id = Some(txn);
        }
        row.revision += 1;
    }
}

/// Persistence for booking rows with a change feed.
///
/// Query results are ordered newest first.
pub trait BookingStore: Send + Sync + 'static {
    /// Insert a new row and publish an insert event.
    fn insert(
        &self,
        booking: RideBooking,
    ) -> impl Future<Output = Result<RideBooking, StoreError>> + Send;

    fn get(&self, id: BookingId)
    -> impl Future<Output = Result<Option<RideBooking>, StoreError>> + Send;

    /// Apply `patch` to row `id` only if `guard` holds on its committed state.
    ///
    /// Returns the updated row, or `None` when no row was affected (missing
    /// row or failed predicate). A successful update publishes an update event.
    fn update_where(
        &self,
        id: BookingId,
        guard: Guard,
        patch: Patch,
    ) -> impl Future<Output = Result<Option<RideBooking>, StoreError>> + Send;

    fn by_status(
        &self,
        statuses: &[RideStatus],
    ) -> impl Future<Output = Result<Vec<RideBooking>, StoreError>> + Send;

    /// Rows where `party` is passenger or driver.
    fn by_party(
        &self,
        party: &PartyId,
    ) -> impl Future<Output = Result<Vec<RideBooking>, StoreError>> + Send;

    /// The change feed fed by this store's commits.
    fn changes(&self) -> &ChangeBus;
}
