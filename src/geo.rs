//! Great-circle distance and proximity filtering of waiting rides.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::model::RideBooking;

/// Mean Earth radius used by the haversine formula.
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Default search radius around a driver.
pub const DEFAULT_RADIUS_KM: f64 = 8.0;

/// A point on the globe in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub lat: f64,
    pub lng: f64,
}

impl Coordinate {
    pub const fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }
}

/// Haversine distance between two coordinates, in kilometres.
pub fn haversine_km(from: Coordinate, to: Coordinate) -> f64 {
    let d_lat = (to.lat - from.lat).to_radians();
    let d_lng = (to.lng - from.lng).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + from.lat.to_radians().cos() * to.lat.to_radians().cos() * (d_lng / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_KM * c
}

/// A waiting booking surfaced to a driver, with its pickup distance.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub booking: RideBooking,
    pub distance_km: f64,
}

/// Keep the bookings whose origin lies within `radius_km` of `driver`.
///
/// The boundary is inclusive. Results are ordered by distance, nearest first,
/// with ties broken by recency (newest first).
pub fn nearby<'a>(
    driver: Coordinate,
    bookings: impl IntoIterator<Item = &'a RideBooking>,
    radius_km: f64,
) -> Vec<Candidate> {
    let mut candidates: Vec<Candidate> = bookings
        .into_iter()
        .filter_map(|booking| {
            let distance_km = haversine_km(driver, booking.origin());
            (distance_km <= radius_km).then(|| Candidate {
                booking: booking.clone(),
                distance_km,
            })
        })
        .collect();

    candidates.sort_by(|a, b| {
        a.distance_km
            .partial_cmp(&b.distance_km)
            .unwrap_or(Ordering::Equal)
            .then_with(|| b.booking.created_at.cmp(&a.booking.created_at))
    });
    candidates
}
