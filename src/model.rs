//! Core domain types for ride bookings.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::geo::Coordinate;

/// Booking identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BookingId(Uuid);

impl BookingId {
    pub fn new() -> Self {
        BookingId(Uuid::new_v4())
    }
}

impl Default for BookingId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BookingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifier of a user taking part in a booking (passenger or driver).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartyId(String);

impl PartyId {
    pub fn new(id: impl Into<String>) -> Self {
        PartyId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PartyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PartyId {
    fn from(value: &str) -> Self {
        PartyId::new(value)
    }
}

/// Address of a wallet able to pay into or receive from the escrow.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WalletAddress(String);

impl WalletAddress {
    pub fn new(address: impl Into<String>) -> Self {
        WalletAddress(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WalletAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Escrow transaction reference returned by the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxnId(String);

impl TxnId {
    pub fn new(id: impl Into<String>) -> Self {
        TxnId(id.into())
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle status of a booking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RideStatus {
    Waiting,
    Accepted,
    Completed,
    Cancelled,
}

impl RideStatus {
    /// Statuses that count towards the one-active-ride-per-party rule.
    pub const ACTIVE: [RideStatus; 2] = [RideStatus::Waiting, RideStatus::Accepted];

    pub fn is_active(self) -> bool {
        matches!(self, RideStatus::Waiting | RideStatus::Accepted)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: RideStatus) -> bool {
        use RideStatus::*;
        matches!(
            (self, next),
            (Waiting, Accepted)
                | (Accepted, Completed)
                | (Waiting, Cancelled)
                | (Accepted, Cancelled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RideStatus::Waiting => "waiting",
            RideStatus::Accepted => "accepted",
            RideStatus::Completed => "completed",
            RideStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RideStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Escrow progress of a booking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscrowState {
    #[default]
    None,
    PendingLock,
    Locked,
    Released,
}

impl EscrowState {
    pub fn as_str(self) -> &'static str {
        match self {
            EscrowState::None => "none",
            EscrowState::PendingLock => "pending_lock",
            EscrowState::Locked => "locked",
            EscrowState::Released => "released",
        }
    }
}

impl fmt::Display for EscrowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side of a booking a caller acts for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartyRole {
    Passenger,
    Driver,
}

impl fmt::Display for PartyRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartyRole::Passenger => f.write_str("passenger"),
            PartyRole::Driver => f.write_str("driver"),
        }
    }
}

/// A ride booking row, as persisted by the store.
///
/// Field names are the persisted column names and are read by other
/// collaborators; do not rename them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RideBooking {
    pub id: BookingId,
    pub passenger_id: PartyId,
    pub driver_id: Option<PartyId>,
    pub origin_lat: f64,
    pub origin_lng: f64,
    pub destination_lat: f64,
    pub destination_lng: f64,
    pub pickup_place_name: Option<String>,
    pub destination_place_name: Option<String>,
    pub status: RideStatus,
    pub passenger_completed: bool,
    pub driver_completed: bool,
    pub escrow_state: EscrowState,
    pub passenger_wallet: Option<WalletAddress>,
    pub driver_wallet: Option<WalletAddress>,
    pub lock_txn_id: Option<TxnId>,
    pub release_txn_id: Option<TxnId>,
    pub created_at: DateTime<Utc>,
    /// Bumped on every committed write. Orders versions of the same row.
    #[serde(default)]
    pub revision: u64,
}

impl RideBooking {
    /// Build a fresh `waiting` booking from a passenger request.
    pub fn from_request(request: NewBooking, created_at: DateTime<Utc>) -> Self {
        Self {
            id: BookingId::new(),
            passenger_id: request.passenger_id,
            driver_id: None,
            origin_lat: request.origin.lat,
            origin_lng: request.origin.lng,
            destination_lat: request.destination.lat,
            destination_lng: request.destination.lng,
            pickup_place_name: request.pickup_place_name,
            destination_place_name: request.destination_place_name,
            status: RideStatus::Waiting,
            passenger_completed: false,
            driver_completed: false,
            escrow_state: EscrowState::None,
            passenger_wallet: request.passenger_wallet,
            driver_wallet: None,
            lock_txn_id: None,
            release_txn_id: None,
            created_at,
            revision: 0,
        }
    }

    pub fn origin(&self) -> Coordinate {
        Coordinate::new(self.origin_lat, self.origin_lng)
    }

    pub fn destination(&self) -> Coordinate {
        Coordinate::new(self.destination_lat, self.destination_lng)
    }

    /// Whether `party` is either side of this booking.
    pub fn involves(&self, party: &PartyId) -> bool {
        &self.passenger_id == party || self.driver_id.as_ref() == Some(party)
    }

    /// Id stored for the given side, if any.
    pub fn party(&self, role: PartyRole) -> Option<&PartyId> {
        match role {
            PartyRole::Passenger => Some(&self.passenger_id),
            PartyRole::Driver => self.driver_id.as_ref(),
        }
    }

    pub fn completed_by(&self, role: PartyRole) -> bool {
        match role {
            PartyRole::Passenger => self.passenger_completed,
            PartyRole::Driver => self.driver_completed,
        }
    }

    pub fn both_completed(&self) -> bool {
        self.passenger_completed && self.driver_completed
    }
}

/// A passenger's request for a new ride.
#[derive(Debug, Clone)]
pub struct NewBooking {
    pub passenger_id: PartyId,
    pub origin: Coordinate,
    pub destination: Coordinate,
    pub pickup_place_name: Option<String>,
    pub destination_place_name: Option<String>,
    pub passenger_wallet: Option<WalletAddress>,
}

impl NewBooking {
    pub fn new(passenger_id: PartyId, origin: Coordinate, destination: Coordinate) -> Self {
        Self {
            passenger_id,
            origin,
            destination,
            pickup_place_name: None,
            destination_place_name: None,
            passenger_wallet: None,
        }
    }

    pub fn with_place_names(mut self, pickup: Option<String>, destination: Option<String>) -> Self {
        self.pickup_place_name = pickup;
        self.destination_place_name = destination;
        self
    }

    pub fn with_wallet(mut self, wallet: Option<WalletAddress>) -> Self {
        self.passenger_wallet = wallet;
        self
    }
}

/// Role a user picked in their profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Driver,
    Passenger,
}

/// Read-only view of a user profile, owned by the profile subsystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: PartyId,
    pub role: Option<UserRole>,
    pub wallet_address: Option<WalletAddress>,
    pub rating_avg: Option<f64>,
}

impl UserProfile {
    pub fn new(id: PartyId, role: UserRole) -> Self {
        Self {
            id,
            role: Some(role),
            wallet_address: None,
            rating_avg: None,
        }
    }

    pub fn with_wallet(mut self, wallet: WalletAddress) -> Self {
        self.wallet_address = Some(wallet);
        self
    }
}
