use crate::model::{BookingId, RideBooking};

/// A session's local, non-authoritative copy of booking rows, newest first.
#[derive(Debug, Default, Clone)]
pub struct BookingCache {
    rows: Vec<RideBooking>,
}

impl BookingCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole cache with rows fetched from the store.
    pub fn replace_all(&mut self, rows: Vec<RideBooking>) {
        self.rows = rows;
    }

    /// Merge a row seen in a notification or returned by the store.
    ///
    /// Known rows are replaced in place, unseen rows are prepended. A version
    /// whose revision is not newer than the cached one is ignored. Returns
    /// whether the cache changed.
    pub fn merge(&mut self, booking: RideBooking) -> bool {
        match self.rows.iter_mut().find(|b| b.id == booking.id) {
            Some(cached) if booking.revision <= cached.revision => false,
            Some(cached) => {
                *cached = booking;
                true
            }
            None => {
                self.rows.insert(0, booking);
                true
            }
        }
    }

    pub fn remove(&mut self, id: BookingId) -> Option<RideBooking> {
        let index = self.rows.iter().position(|b| b.id == id)?;
        Some(self.rows.remove(index))
    }

    pub fn get(&self, id: BookingId) -> Option<&RideBooking> {
        self.rows.iter().find(|b| b.id == id)
    }

    /// The newest waiting or accepted row.
    pub fn active(&self) -> Option<&RideBooking> {
        self.rows.iter().find(|b| b.status.is_active())
    }

    pub fn iter(&self) -> impl Iterator<Item = &RideBooking> + '_ {
        self.rows.iter()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}
