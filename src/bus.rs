//! Change notification bus.
//!
//! The store publishes every committed insert and update here. Sessions
//! subscribe with an [`Interest`] and receive only the events matching it.
//!
//! Delivery is advisory: the store is the source of truth. Events for the
//! same row arrive in commit order because the store publishes while it
//! still holds its write lock; nothing is promised across rows. A subscriber
//! that falls behind gets [`FeedError::Lagged`] and must re-fetch.

use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::{Stream, StreamExt};

use crate::model::{PartyId, RideBooking, RideStatus};

/// Kind of row change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
}

/// A committed row change, carrying the row as written.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub booking: RideBooking,
}

impl ChangeEvent {
    pub fn insert(booking: RideBooking) -> Self {
        Self {
            kind: ChangeKind::Insert,
            booking,
        }
    }

    pub fn update(booking: RideBooking) -> Self {
        Self {
            kind: ChangeKind::Update,
            booking,
        }
    }
}

/// What a subscriber wants to hear about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Interest {
    /// Inserts of waiting rides and every update (driver candidate lists).
    Waiting,
    /// Inserts and updates of rides where the party is passenger or driver.
    Party(PartyId),
}

impl Interest {
    pub fn matches(&self, event: &ChangeEvent) -> bool {
        match self {
            Interest::Waiting => match event.kind {
                ChangeKind::Insert => event.booking.status == RideStatus::Waiting,
                ChangeKind::Update => true,
            },
            Interest::Party(party) => event.booking.involves(party),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FeedError {
    #[error("subscriber fell behind by {0} events; re-fetch from the store")]
    Lagged(u64),
    #[error("change feed closed")]
    Closed,
}

/// Fan-out point for row changes.
#[derive(Debug, Clone)]
pub struct ChangeBus {
    sender: broadcast::Sender<ChangeEvent>,
}

impl ChangeBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish a change; returns how many subscribers were live.
    pub fn publish(&self, event: ChangeEvent) -> usize {
        // no live subscribers is not an error for an advisory feed
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self, interest: Interest) -> Subscription {
        Subscription {
            receiver: self.sender.subscribe(),
            interest,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// A filtered view of the change feed.
#[derive(Debug)]
pub struct Subscription {
    receiver: broadcast::Receiver<ChangeEvent>,
    interest: Interest,
}

impl Subscription {
    pub fn interest(&self) -> &Interest {
        &self.interest
    }

    /// Wait for the next matching event.
    pub async fn recv(&mut self) -> Result<ChangeEvent, FeedError> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if self.interest.matches(&event) => return Ok(event),
                Ok(_) => continue,
                Err(RecvError::Lagged(missed)) => return Err(FeedError::Lagged(missed)),
                Err(RecvError::Closed) => return Err(FeedError::Closed),
            }
        }
    }

    /// Take the next matching event if one is already queued.
    pub fn try_recv(&mut self) -> Result<Option<ChangeEvent>, FeedError> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) if self.interest.matches(&event) => return Ok(Some(event)),
                Ok(_) => continue,
                Err(TryRecvError::Empty) => return Ok(None),
                Err(TryRecvError::Lagged(missed)) => return Err(FeedError::Lagged(missed)),
                Err(TryRecvError::Closed) => return Err(FeedError::Closed),
            }
        }
    }

    /// Turn the subscription into a stream of matching events.
    pub fn into_stream(self) -> impl Stream<Item = Result<ChangeEvent, FeedError>> + Send {
        let interest = self.interest;
        BroadcastStream::new(self.receiver).filter_map(move |item| match item {
            Ok(event) if interest.matches(&event) => Some(Ok(event)),
            Ok(_) => None,
            Err(BroadcastStreamRecvError::Lagged(missed)) => Some(Err(FeedError::Lagged(missed))),
        })
    }
}
