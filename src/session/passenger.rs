use std::sync::Arc;

use tokio::time::timeout;
use tracing::warn;

use super::{CompletionReport, Core, SessionError, log_event};
use crate::amount::MicroAlgos;
use crate::bus::{ChangeEvent, FeedError};
use crate::engine::Engine;
use crate::escrow::{EscrowGateway, GatewayError};
use crate::geo::Coordinate;
use crate::model::{BookingId, NewBooking, PartyRole, RideBooking, UserProfile, UserRole};
use crate::store::BookingStore;

/// A passenger's session: request a ride, follow it, fund and settle it.
pub struct PassengerSession<S, G> {
    core: Core<S, G>,
}

impl<S: BookingStore, G: EscrowGateway> PassengerSession<S, G> {
    /// Fails unless the profile is registered as a passenger.
    pub fn new(
        engine: Engine<S>,
        gateway: Arc<G>,
        profile: UserProfile,
    ) -> Result<Self, SessionError> {
        Ok(Self {
            core: Core::new(engine, gateway, profile, UserRole::Passenger)?,
        })
    }

    pub fn profile(&self) -> &UserProfile {
        &self.core.profile
    }

    /// Subscribe to this passenger's rides and load their current state.
    ///
    /// The subscription is opened before the fetch so nothing committed in
    /// between is missed; replays are absorbed by the cache merge.
    pub async fn mount(&mut self) -> Result<(), SessionError> {
        self.core.subscribe_own();
        self.core.reconcile_own().await
    }

    /// Discard the cache and re-fetch from the store.
    pub async fn reconcile(&mut self) -> Result<(), SessionError> {
        self.core.reconcile_own().await
    }

    /// Apply every queued change notification. Returns how many were applied.
    pub async fn sync(&mut self) -> Result<usize, SessionError> {
        self.core.drain_own().await
    }

    /// Wait for the next change to one of this passenger's rides.
    pub async fn next_change(&mut self) -> Result<ChangeEvent, SessionError> {
        loop {
            let Some(feed) = self.core.own_feed.as_mut() else {
                return Err(FeedError::Closed.into());
            };
            match feed.recv().await {
                Ok(event) => {
                    log_event(self.core.party(), &event);
                    self.core.merge_own(event.booking.clone());
                    return Ok(event);
                }
                Err(FeedError::Lagged(missed)) => {
                    warn!(party = %self.core.party(), missed, "party feed lagged; re-fetching");
                    self.core.reconcile_own().await?;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// The current waiting or accepted ride, as last seen.
    pub fn active_booking(&self) -> Option<&RideBooking> {
        self.core.own.active()
    }

    pub fn booking(&self, id: BookingId) -> Option<&RideBooking> {
        self.core.own.get(id)
    }

    /// Every ride of this passenger, newest first, as last seen.
    pub fn bookings(&self) -> impl Iterator<Item = &RideBooking> + '_ {
        self.core.own.iter()
    }

    /// Request a ride from `origin` to `destination`.
    pub async fn request_ride(
        &mut self,
        origin: Coordinate,
        destination: Coordinate,
        pickup_place_name: Option<String>,
        destination_place_name: Option<String>,
    ) -> Result<RideBooking, SessionError> {
        let request = NewBooking::new(self.core.profile.id.clone(), origin, destination)
            .with_place_names(pickup_place_name, destination_place_name)
            .with_wallet(self.core.profile.wallet_address.clone());
        let booking = self.core.engine.create(request).await?;
        self.core.own.merge(booking.clone());
        Ok(booking)
    }

    /// Lock `amount` in escrow for an accepted ride, payable to its driver.
    ///
    /// A refused lock rolls the escrow back to `none` so funding can be
    /// attempted again. A lock that may have gone through (timeout) stays in
    /// `pending_lock`; calling this again with the same amount re-issues the
    /// lock, which the gateway answers with the original transaction.
    pub async fn fund_escrow(
        &mut self,
        id: BookingId,
        amount: MicroAlgos,
    ) -> Result<RideBooking, SessionError> {
        let Some(payer) = self.core.profile.wallet_address.clone() else {
            return Err(SessionError::MissingWallet(self.core.profile.id.clone()));
        };

        let pending = self.core.engine.begin_lock(id, &self.core.profile.id).await?;
        let Some(payee) = pending.driver_wallet.clone() else {
            self.core.engine.abort_lock(id).await?;
            return Err(SessionError::Gateway {
                booking: id,
                source: GatewayError::MissingWallet(id, PartyRole::Driver),
            });
        };

        let limit = self.core.engine.config().gateway_timeout;
        let locked = timeout(limit, self.core.gateway.lock(id, &payer, &payee, amount))
            .await
            .unwrap_or(Err(GatewayError::Timeout(limit)));
        match locked {
            Ok(txn) => {
                let row = self.core.engine.record_lock(id, txn).await?;
                self.core.own.merge(row.clone());
                Ok(row)
            }
            Err(source) if source.may_hold_funds() => {
                warn!(booking = %id, reason = %source, "escrow lock unconfirmed; retry to resume");
                Err(SessionError::Gateway { booking: id, source })
            }
            Err(source) => {
                warn!(booking = %id, reason = %source, "escrow lock failed");
                self.core.engine.abort_lock(id).await?;
                Err(SessionError::Gateway { booking: id, source })
            }
        }
    }

    /// Confirm the ride is done from the passenger's side.
    ///
    /// If this call finalized the ride, the escrow is released here and the
    /// outcome reported in the returned [`CompletionReport`].
    pub async fn complete(&mut self, id: BookingId) -> Result<CompletionReport, SessionError> {
        self.core.complete(id, PartyRole::Passenger).await
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

    /// Cancel the ride. Cancelling a finished ride is a no-op that returns
    /// its final state.
    pub async fn cancel(&mut self, id: BookingId) -> Result<RideBooking, SessionError> {
        self.core.cancel(id).await
    }
}
