use std::collections::HashSet;
use std::sync::Arc;

use tracing::warn;

use super::{BookingCache, CompletionReport, Core, SessionError, log_event};
use crate::bus::{ChangeEvent, FeedError, Interest, Subscription};
use crate::engine::{Engine, EngineError};
use crate::escrow::EscrowGateway;
use crate::geo::{self, Candidate, Coordinate};
use crate::model::{BookingId, PartyRole, RideBooking, RideStatus, UserProfile, UserRole};
use crate::retry::retry_with_predicate;
use crate::store::BookingStore;

enum Source {
    Waiting,
    Own,
}

/// A driver's session: browse nearby requests, claim one, drive and settle it.
pub struct DriverSession<S, G> {
    core: Core<S, G>,
    position: Option<Coordinate>,
    waiting: BookingCache,
    waiting_feed: Option<Subscription>,
    /// Rides seen leaving `waiting` whose older events may still be queued
    /// on the waiting feed. Emptied whenever that feed is fully drained.
    retired: HashSet<BookingId>,
}

/// Public API
impl<S: BookingStore, G: EscrowGateway> DriverSession<S, G> {
    /// Fails unless the profile is registered as a driver.
    pub fn new(
        engine: Engine<S>,
        gateway: Arc<G>,
        profile: UserProfile,
    ) -> Result<Self, SessionError> {
        Ok(Self {
            core: Core::new(engine, gateway, profile, UserRole::Driver)?,
            position: None,
            waiting: BookingCache::new(),
            waiting_feed: None,
            retired: HashSet::new(),
        })
    }

    pub fn profile(&self) -> &UserProfile {
        &self.core.profile
    }

    pub fn position(&self) -> Option<Coordinate> {
        self.position
    }

    pub fn set_position(&mut self, position: Coordinate) {
        self.position = Some(position);
    }

    /// Subscribe to waiting rides and this driver's own rides, then load both.
    pub async fn mount(&mut self) -> Result<(), SessionError> {
        let feed = self.core.engine.store().changes().subscribe(Interest::Waiting);
        self.waiting_feed = Some(feed);
        self.core.subscribe_own();
        self.reconcile().await
    }

    /// Discard both caches and re-fetch from the store.
    pub async fn reconcile(&mut self) -> Result<(), SessionError> {
        self.reconcile_waiting().await?;
        self.core.reconcile_own().await
    }

    /// Apply every queued change notification. Returns how many were applied.
    pub async fn sync(&mut self) -> Result<usize, SessionError> {
        let mut applied = 0;
        loop {
            let Some(feed) = self.waiting_feed.as_mut() else {
                break;
            };
            match feed.try_recv() {
                Ok(Some(event)) => {
                    log_event(self.core.party(), &event);
                    self.apply_waiting(event.booking);
                    applied += 1;
                }
                Ok(None) => {
                    // every event older than a retirement has been seen
                    self.retired.clear();
                    break;
                }
                Err(FeedError::Lagged(missed)) => {
                    warn!(party = %self.core.party(), missed, "waiting feed lagged; re-fetching");
                    self.reconcile_waiting().await?;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(applied + self.core.drain_own().await?)
    }

    /// Wait for the next change on either feed.
    pub async fn next_change(&mut self) -> Result<ChangeEvent, SessionError> {
        loop {
            let feeds = (self.waiting_feed.as_mut(), self.core.own_feed.as_mut());
            let (Some(waiting), Some(own)) = feeds else {
                return Err(FeedError::Closed.into());
            };
            let (source, received) = tokio::select! {
                r = waiting.recv() => (Source::Waiting, r),
                r = own.recv() => (Source::Own, r),
            };

            match (source, received) {
                (source, Ok(event)) => {
                    log_event(self.core.party(), &event);
                    match source {
                        Source::Waiting => self.apply_waiting(event.booking.clone()),
                        Source::Own => self.core.merge_own(event.booking.clone()),
                    }
                    return Ok(event);
                }
                (Source::Waiting, Err(FeedError::Lagged(missed))) => {
                    warn!(party = %self.core.party(), missed, "waiting feed lagged; re-fetching");
                    self.reconcile_waiting().await?;
                }
                (Source::Own, Err(FeedError::Lagged(missed))) => {
                    warn!(party = %self.core.party(), missed, "party feed lagged; re-fetching");
                    self.core.reconcile_own().await?;
                }
                (_, Err(e)) => return Err(e.into()),
            }
        }
    }

    /// Waiting rides within the configured radius of the driver, nearest first.
    pub fn candidates(&self) -> Result<Vec<Candidate>, SessionError> {
        let position = self.position.ok_or(SessionError::NoPosition)?;
        let radius = self.core.engine.config().search_radius_km;
        Ok(geo::nearby(position, self.waiting.iter(), radius))
    }

    /// Every waiting ride as last seen, regardless of distance.
    pub fn waiting(&self) -> impl Iterator<Item = &RideBooking> + '_ {
        self.waiting.iter()
    }

    /// The ride this driver is currently assigned to, as last seen.
    pub fn active_booking(&self) -> Option<&RideBooking> {
        self.core.own.active()
    }

    pub fn booking(&self, id: BookingId) -> Option<&RideBooking> {
        self.core.own.get(id)
    }

    /// Every ride this driver has taken, newest first, as last seen.
    pub fn bookings(&self) -> impl Iterator<Item = &RideBooking> + '_ {
        self.core.own.iter()
    }

    /// Claim a waiting ride, offering the driver's wallet as payee.
    ///
    /// On failure the caches are left as they were; the feed removes a ride
    /// some other driver took.
    pub async fn accept(&mut self, id: BookingId) -> Result<RideBooking, SessionError> {
        let wallet = self.core.profile.wallet_address.clone();
        let booking = self.core.engine.accept(id, &self.core.profile.id, wallet).await?;
        self.retire(id);
        self.core.own.merge(booking.clone());
        Ok(booking)
    }

    /// Confirm the ride is done from the driver's side.
    ///
    /// If this call finalized the ride, the escrow is released here and the
    /// outcome reported in the returned [`CompletionReport`].
    pub async fn complete(&mut self, id: BookingId) -> Result<CompletionReport, SessionError> {
        self.core.complete(id, PartyRole::Driver).await
    }

    /// Retry a payment release that failed after this session finalized
    /// the ride `id`.
    pub async fn retry_release(&mut self, id: BookingId) -> Result<RideBooking, SessionError> {
        self.core.retry_release(id).await
    }

    /// Rides this session finalized whose payment is still owed.
    pub fn owed_releases(&self) -> impl Iterator<Item = BookingId> + '_ {
        self.core.owed_releases()
    }

    /// Back out of an accepted ride.
    pub async fn cancel(&mut self, id: BookingId) -> Result<RideBooking, SessionError> {
        self.core.cancel(id).await
    }
}

/// Private API
impl<S: BookingStore, G: EscrowGateway> DriverSession<S, G> {
    async fn reconcile_waiting(&mut self) -> Result<(), SessionError> {
        let engine = &self.core.engine;
        let rows = retry_with_predicate(
            &engine.config().retry,
            || engine.fetch_waiting(),
            EngineError::is_transient,
        )
        .await?;
        let retired = &self.retired;
        self.waiting
            .replace_all(rows.into_iter().filter(|b| !retired.contains(&b.id)).collect());
        Ok(())
    }

    /// Keep a row in the waiting list only while it is still waiting.
    fn apply_waiting(&mut self, booking: RideBooking) {
        if booking.status == RideStatus::Waiting && !self.retired.contains(&booking.id) {
            self.waiting.merge(booking);
        } else {
            self.retire(booking.id);
        }
    }

    fn retire(&mut self, id: BookingId) {
        self.retired.insert(id);
        self.waiting.remove(id);
    }
}
