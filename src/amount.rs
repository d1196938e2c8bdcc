use std::fmt;

use serde::{Deserialize, Serialize};

/// Escrow amount in micro-units of the settlement asset (1 unit = 1_000_000).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct MicroAlgos(u64);

impl MicroAlgos {
    const SCALE: u64 = 1_000_000;

    /// Smallest amount the escrow will lock for a ride.
    pub const MIN_ESCROW: MicroAlgos = MicroAlgos(1_000);

    /// Micro-units locked per unit of fare.
    const PER_FARE_UNIT: f64 = 1_000.0;

    pub fn from_micro(value: u64) -> Self {
        MicroAlgos(value)
    }

    /// Convert a fare quote into the amount locked in escrow.
    ///
    /// The conversion keeps escrow small but never below [`Self::MIN_ESCROW`].
    /// Negative or non-finite fares collapse to the minimum.
    pub fn from_fare(fare: f64) -> Self {
        if !fare.is_finite() || fare <= 0.0 {
            return Self::MIN_ESCROW;
        }
        let scaled = (fare * Self::PER_FARE_UNIT).round() as u64;
        MicroAlgos(scaled).max(Self::MIN_ESCROW)
    }

    pub fn as_micro(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for MicroAlgos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let whole = self.0 / Self::SCALE;
        let frac = self.0 % Self::SCALE;
        write!(f, "{whole}.{frac:06}")
    }
}

impl std::ops::Add for MicroAlgos {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        MicroAlgos(self.0.saturating_add(rhs.0))
    }
}

impl std::ops::AddAssign for MicroAlgos {
    fn add_assign(&mut self, rhs: Self) {
        self.0 = self.0.saturating_add(rhs.0);
    }
}
