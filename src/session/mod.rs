//! Client session coordinators.
//!
//! A session is one user's view of the marketplace: a passenger following
//! their own ride, or a driver browsing nearby requests and driving one. It
//! subscribes to the change feed, keeps a local cache of rows, and calls the
//! engine for every mutation.
//!
//! Rules every session follows:
//! - the cache only ever takes rows the store returned or published; a
//!   mutation's intended effect is never applied ahead of the store
//! - a failed mutation leaves the cache untouched
//! - the escrow is released only by the session whose own completion call
//!   finalized the ride, never because a notification says `completed`

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::bus::{ChangeEvent, FeedError, Interest, Subscription};
use crate::engine::{Engine, EngineError};
use crate::escrow::{EscrowGateway, GatewayError};
use crate::model::{
    BookingId, EscrowState, PartyId, PartyRole, RideBooking, TxnId, UserProfile, UserRole,
};
use crate::retry::retry_with_predicate;
use crate::store::BookingStore;

mod cache;
pub use cache::BookingCache;

mod driver;
pub use driver::DriverSession;

mod passenger;
pub use passenger::PassengerSession;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// The ride state is committed; only the payment step failed.
    #[error("payment for booking {booking} failed: {source}; retry the payment")]
    Gateway {
        booking: BookingId,
        #[source]
        source: GatewayError,
    },

    #[error("{0} is not registered as a {1:?}")]
    WrongRole(PartyId, UserRole),

    #[error("{0} has no wallet connected")]
    MissingWallet(PartyId),

    #[error("driver position is unknown")]
    NoPosition,

    #[error("no payment release is pending for booking {0}")]
    NothingToRelease(BookingId),

    #[error(transparent)]
    Feed(#[from] FeedError),
}

impl SessionError {
    /// Whether the same call may succeed if retried later.
    pub fn is_retryable(&self) -> bool {
        match self {
            SessionError::Engine(e) => e.is_transient(),
            SessionError::Gateway { .. } => true,
            _ => false,
        }
    }
}

/// What happened to the payment after a completion call.
#[derive(Debug)]
pub enum PaymentOutcome {
    /// The other party's call finalized the ride, or it is not finished yet.
    NotFinalizer,
    /// The ride finished but its escrow was never funded.
    NotFunded,
    Released(TxnId),
    /// The ride is completed but the release did not go through.
    /// Call `retry_release` with the booking id on the same session.
    Failed(SessionError),
}

/// Result of a session's completion call.
#[derive(Debug)]
pub struct CompletionReport {
    pub booking: RideBooking,
    pub payment: PaymentOutcome,
}

/// State and behaviour shared by passenger and driver sessions.
struct Core<S, G> {
    engine: Engine<S>,
    gateway: Arc<G>,
    profile: UserProfile,
    own: BookingCache,
    own_feed: Option<Subscription>,
    /// Releases this session owes after finalizing rides. The txn is set
    /// once the gateway paid out but the store has not recorded it yet.
    pending_releases: HashMap<BookingId, Option<TxnId>>,
}

impl<S: BookingStore, G: EscrowGateway> Core<S, G> {
    fn new(
        engine: Engine<S>,
        gateway: Arc<G>,
        profile: UserProfile,
        role: UserRole,
    ) -> Result<Self, SessionError> {
        if profile.role != Some(role) {
            return Err(SessionError::WrongRole(profile.id, role));
        }
        Ok(Self {
            engine,
            gateway,
            profile,
            own: BookingCache::new(),
            own_feed: None,
            pending_releases: HashMap::new(),
        })
    }

    fn party(&self) -> &PartyId {
        &self.profile.id
    }

    fn subscribe_own(&mut self) {
        let interest = Interest::Party(self.profile.id.clone());
        self.own_feed = Some(self.engine.store().changes().subscribe(interest));
    }

    /// Re-fetch this party's rows from the store, retrying transient failures.
    async fn reconcile_own(&mut self) -> Result<(), SessionError> {
        let engine = &self.engine;
        let party = &self.profile.id;
        let rows = retry_with_predicate(
            &engine.config().retry,
            || engine.fetch_for_party(party),
            EngineError::is_transient,
        )
        .await?;
        self.own.replace_all(rows);
        Ok(())
    }

    fn merge_own(&mut self, booking: RideBooking) {
        if booking.involves(&self.profile.id) {
            self.own.merge(booking);
        }
    }

    /// Drain queued events from the party feed without waiting.
    async fn drain_own(&mut self) -> Result<usize, SessionError> {
        let mut merged = 0;
        loop {
            let Some(feed) = self.own_feed.as_mut() else {
                return Ok(merged);
            };
            match feed.try_recv() {
                Ok(Some(event)) => {
                    log_event(&self.profile.id, &event);
                    self.merge_own(event.booking);
                    merged += 1;
                }
                Ok(None) => return Ok(merged),
                Err(FeedError::Lagged(missed)) => {
                    warn!(party = %self.profile.id, missed, "party feed lagged; re-fetching");
                    self.reconcile_own().await?;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn complete(
        &mut self,
        id: BookingId,
        role: PartyRole,
    ) -> Result<CompletionReport, SessionError> {
        let completion = self
            .engine
            .mark_completed(id, role, &self.profile.id)
            .await?;
        self.own.merge(completion.booking.clone());

        if !completion.should_release_payment {
            return Ok(CompletionReport {
                booking: completion.booking,
                payment: PaymentOutcome::NotFinalizer,
            });
        }

        self.pending_releases.entry(id).or_insert(None);
        let payment = match self.settle(id).await {
            Ok(Some(row)) => {
                let txn = row.release_txn_id.clone();
                self.own.merge(row);
                match txn {
                    Some(txn) => PaymentOutcome::Released(txn),
                    None => PaymentOutcome::NotFunded,
                }
            }
            Ok(None) => PaymentOutcome::NotFunded,
            Err(e) => {
                warn!(booking = %id, reason = %e, "payment release failed");
                PaymentOutcome::Failed(e)
            }
        };
        let booking = self.own.get(id).cloned().unwrap_or(completion.booking);
        Ok(CompletionReport { booking, payment })
    }

    fn owed_releases(&self) -> impl Iterator<Item = BookingId> + '_ {
        self.pending_releases.keys().copied()
    }

    /// Release the escrow for a booking this session finalized and record it.
    ///
    /// Returns `None` when the escrow was never funded. The pending entry is
    /// kept on failure so it can be retried.
    async fn settle(&mut self, id: BookingId) -> Result<Option<RideBooking>, SessionError> {
        let Some(paid) = self.pending_releases.get(&id).cloned() else {
            return Err(SessionError::NothingToRelease(id));
        };

        let txn = match paid {
            Some(txn) => txn,
            None => {
                let booking = self.engine.get(id).await?;
                match booking.escrow_state {
                    EscrowState::None => {
                        info!(booking = %id, "ride completed without escrow; nothing to release");
                        self.pending_releases.remove(&id);
                        return Ok(None);
                    }
                    EscrowState::Released => {
                        self.pending_releases.remove(&id);
                        return Ok(Some(booking));
                    }
                    EscrowState::PendingLock => {
                        return Err(SessionError::Gateway {
                            booking: id,
                            source: GatewayError::NotLocked(id),
                        });
                    }
                    EscrowState::Locked => {}
                }
                let Some(payee) = booking.driver_wallet.as_ref() else {
                    return Err(SessionError::Gateway {
                        booking: id,
                        source: GatewayError::MissingWallet(id, PartyRole::Driver),
                    });
                };

                let limit = self.engine.config().gateway_timeout;
                let txn = match timeout(limit, self.gateway.release(payee, id)).await {
                    Ok(Ok(txn)) => txn,
                    Ok(Err(source)) => return Err(SessionError::Gateway { booking: id, source }),
                    Err(_) => {
                        return Err(SessionError::Gateway {
                            booking: id,
                            source: GatewayError::Timeout(limit),
                        });
                    }
                };
                // paid out; from here on only the store write may be retried
                self.pending_releases.insert(id, Some(txn.clone()));
                txn
            }
        };

        let row = self.engine.record_release(id, txn).await?;
        self.pending_releases.remove(&id);
        Ok(Some(row))
    }

    async fn retry_release(&mut self, id: BookingId) -> Result<RideBooking, SessionError> {
        match self.settle(id).await? {
            Some(row) => {
                self.own.merge(row.clone());
                Ok(row)
            }
            None => Ok(self.engine.get(id).await?),
        }
    }

    async fn cancel(&mut self, id: BookingId) -> Result<RideBooking, SessionError> {
        match self.engine.cancel(id, &self.profile.id).await {
            Ok(row) => {
                self.own.merge(row.clone());
                Ok(row)
            }
            // already over: nothing to do but pick up the final row
            Err(EngineError::AlreadyFinalized { .. }) => {
                let row = self.engine.get(id).await?;
                self.merge_own(row.clone());
                Ok(row)
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn log_event(party: &PartyId, event: &ChangeEvent) {
    tracing::debug!(
        party = %party,
        booking = %event.booking.id,
        kind = ?event.kind,
        status = %event.booking.status,
        "change received"
    );
}
