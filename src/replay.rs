//! Scripted replay of user actions against the engine.
//!
//! Every actor gets its own session, created on first use: a `request` or
//! `fund` makes the actor a passenger, an `accept` makes it a driver. Any
//! command that fails is logged and skipped; the replay never stops.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;

use thiserror::Error;
use tokio_stream::{Stream, StreamExt};
use tracing::{info, warn};

use crate::amount::MicroAlgos;
use crate::engine::Engine;
use crate::escrow::EscrowGateway;
use crate::model::{BookingId, PartyId, RideBooking, UserProfile, UserRole, WalletAddress};
use crate::script::Command;
use crate::session::{
    CompletionReport, DriverSession, PassengerSession, PaymentOutcome, SessionError,
};
use crate::store::BookingStore;

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("ride '{0}' was never requested")]
    UnknownRide(String),

    #[error("ride '{0}' is already in use")]
    DuplicateRide(String),

    #[error("{0} has not taken part in any ride yet")]
    UnknownActor(PartyId),

    #[error("{actor} already acts as a {existing:?}")]
    RoleMismatch { actor: PartyId, existing: UserRole },

    #[error("ride '{0}' is not within reach of the driver")]
    OutOfReach(String),

    #[error(transparent)]
    Session(#[from] SessionError),
}

enum Actor<S, G> {
    Passenger(PassengerSession<S, G>),
    Driver(DriverSession<S, G>),
}

impl<S, G> Actor<S, G> {
    fn role(&self) -> UserRole {
        match self {
            Actor::Passenger(_) => UserRole::Passenger,
            Actor::Driver(_) => UserRole::Driver,
        }
    }
}

pub struct Replay<S, G> {
    engine: Engine<S>,
    gateway: Arc<G>,
    actors: HashMap<PartyId, Actor<S, G>>,
    /// Ride labels in the order they were requested.
    rides: Vec<(String, BookingId)>,
}

/// Public API
impl<S: BookingStore, G: EscrowGateway> Replay<S, G> {
    pub fn new(engine: Engine<S>, gateway: Arc<G>) -> Self {
        Self {
            engine,
            gateway,
            actors: HashMap::new(),
            rides: Vec::new(),
        }
    }

    /// Apply commands from the incoming stream until it ends.
    pub async fn run(&mut self, mut stream: impl Stream<Item = Command> + Unpin) {
        while let Some(command) = stream.next().await {
            // a failed command must not stop the replay
            let _ = self.apply(command).await;
        }
    }

    /// Apply a single command
    pub async fn apply(&mut self, command: Command) -> Result<(), ReplayError> {
        let actor = command.actor().clone();
        let ride = command.ride().to_string();
        let result = self.apply_command(command).await;
        if let Err(e) = &result {
            warn!(actor = %actor, ride = %ride, reason = %e, "command skipped");
        }
        result
    }

    /// Final state of every requested ride, in request order.
    pub async fn bookings(&self) -> Vec<(String, RideBooking)> {
        let mut rows = Vec::with_capacity(self.rides.len());
        for (label, id) in &self.rides {
            match self.engine.get(*id).await {
                Ok(booking) => rows.push((label.clone(), booking)),
                Err(e) => warn!(ride = %label, reason = %e, "cannot read final state"),
            }
        }
        rows
    }
}

/// Private API
impl<S: BookingStore, G: EscrowGateway> Replay<S, G> {
    async fn apply_command(&mut self, command: Command) -> Result<(), ReplayError> {
        match command {
            Command::Request {
                passenger,
                ride,
                origin,
                destination,
            } => {
                if self.ride_id(&ride).is_ok() {
                    return Err(ReplayError::DuplicateRide(ride));
                }
                let session = self.passenger(&passenger).await?;
                let booking = session.request_ride(origin, destination, None, None).await?;
                self.rides.push((ride, booking.id));
            }
            Command::Accept {
                driver,
                ride,
                position,
            } => {
                let id = self.ride_id(&ride)?;
                let session = self.driver(&driver).await?;
                if let Some(position) = position {
                    session.set_position(position);
                    session.sync().await?;
                    if !session.candidates()?.iter().any(|c| c.booking.id == id) {
                        return Err(ReplayError::OutOfReach(ride));
                    }
                }
                session.accept(id).await?;
            }
            Command::Fund {
                passenger,
                ride,
                fare,
            } => {
                let id = self.ride_id(&ride)?;
                let session = self.passenger(&passenger).await?;
                let funded = session.fund_escrow(id, MicroAlgos::from_fare(fare)).await?;
                info!(ride = %ride, txn = ?funded.lock_txn_id, "escrow funded");
            }
            Command::Complete { actor, ride } => {
                let id = self.ride_id(&ride)?;
                let report = match self.actors.get_mut(&actor) {
                    Some(Actor::Passenger(session)) => session.complete(id).await?,
                    Some(Actor::Driver(session)) => session.complete(id).await?,
                    None => return Err(ReplayError::UnknownActor(actor)),
                };
                Self::log_payment(&ride, report)?;
            }
            Command::Cancel { actor, ride } => {
                let id = self.ride_id(&ride)?;
                match self.actors.get_mut(&actor) {
                    Some(Actor::Passenger(session)) => session.cancel(id).await?,
                    Some(Actor::Driver(session)) => session.cancel(id).await?,
                    None => return Err(ReplayError::UnknownActor(actor)),
                };
            }
        }
        Ok(())
    }

    fn log_payment(ride: &str, report: CompletionReport) -> Result<(), ReplayError> {
        match report.payment {
            PaymentOutcome::Released(txn) => info!(ride, txn = %txn, "payment released"),
            PaymentOutcome::NotFunded => info!(ride, "ride completed without escrow"),
            PaymentOutcome::NotFinalizer => {}
            PaymentOutcome::Failed(e) => return Err(e.into()),
        }
        Ok(())
    }

    fn ride_id(&self, label: &str) -> Result<BookingId, ReplayError> {
        self.rides
            .iter()
            .find(|(l, _)| l == label)
            .map(|(_, id)| *id)
            .ok_or_else(|| ReplayError::UnknownRide(label.to_string()))
    }

    fn profile(party: &PartyId, role: UserRole) -> UserProfile {
        UserProfile::new(party.clone(), role)
            .with_wallet(WalletAddress::new(format!("wallet-{party}")))
    }

    async fn passenger(
        &mut self,
        party: &PartyId,
    ) -> Result<&mut PassengerSession<S, G>, ReplayError> {
        let (engine, gateway) = (self.engine.clone(), Arc::clone(&self.gateway));
        let actor = match self.actors.entry(party.clone()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let profile = Self::profile(party, UserRole::Passenger);
                let mut session = PassengerSession::new(engine, gateway, profile)?;
                session.mount().await?;
                entry.insert(Actor::Passenger(session))
            }
        };
        match actor {
            Actor::Passenger(session) => {
                session.sync().await?;
                Ok(session)
            }
            other => Err(ReplayError::RoleMismatch {
                actor: party.clone(),
                existing: other.role(),
            }),
        }
    }

    async fn driver(
        &mut self,
        party: &PartyId,
    ) -> Result<&mut DriverSession<S, G>, ReplayError> {
        let (engine, gateway) = (self.engine.clone(), Arc::clone(&self.gateway));
        let actor = match self.actors.entry(party.clone()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let profile = Self::profile(party, UserRole::Driver);
                let mut session = DriverSession::new(engine, gateway, profile)?;
                session.mount().await?;
                entry.insert(Actor::Driver(session))
            }
        };
        match actor {
            Actor::Driver(session) => {
                session.sync().await?;
                Ok(session)
            }
            other => Err(ReplayError::RoleMismatch {
                actor: party.clone(),
                existing: other.role(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::escrow::LedgerGateway;
    use crate::geo::Coordinate;
    use crate::model::{EscrowState, RideStatus};
    use crate::store::MemoryStore;

    fn replay() -> (Replay<MemoryStore, LedgerGateway>, Arc<LedgerGateway>) {
        let engine = Engine::new(Arc::new(MemoryStore::with_capacity(64)), EngineConfig::default());
        let gateway = Arc::new(LedgerGateway::new());
        (Replay::new(engine, gateway.clone()), gateway)
    }

    fn request(passenger: &str, ride: &str) -> Command {
        Command::Request {
            passenger: PartyId::new(passenger),
            ride: ride.into(),
            origin: Coordinate::new(28.6139, 77.2090),
            destination: Coordinate::new(28.7041, 77.1025),
        }
    }

    fn accept(driver: &str, ride: &str, position: Option<Coordinate>) -> Command {
        Command::Accept {
            driver: PartyId::new(driver),
            ride: ride.into(),
            position,
        }
    }

    fn complete(actor: &str, ride: &str) -> Command {
        Command::Complete {
            actor: PartyId::new(actor),
            ride: ride.into(),
        }
    }

    #[tokio::test]
    async fn full_ride_is_settled() {
        let (mut replay, gateway) = replay();
        let commands = vec![
            request("p1", "r1"),
            accept("d1", "r1", Some(Coordinate::new(28.62, 77.21))),
            Command::Fund {
                passenger: PartyId::new("p1"),
                ride: "r1".into(),
                fare: 150.0,
            },
            complete("d1", "r1"),
            complete("p1", "r1"),
        ];
        replay.run(tokio_stream::iter(commands)).await;

        let rows = replay.bookings().await;
        assert_eq!(rows.len(), 1);
        let (label, booking) = &rows[0];
        assert_eq!(label, "r1");
        assert_eq!(booking.status, RideStatus::Completed);
        assert_eq!(booking.escrow_state, EscrowState::Released);
        assert_eq!(
            gateway.released_to(&WalletAddress::new("wallet-d1")).await,
            MicroAlgos::from_micro(150_000)
        );
    }

    #[tokio::test]
    async fn failing_commands_do_not_stop_replay() {
        let (mut replay, _) = replay();
        let commands = vec![
            complete("p1", "nope"),
            request("p1", "r1"),
            request("p1", "r2"),
            accept("d1", "r1", Some(Coordinate::new(29.5, 78.5))),
            accept("d2", "r1", None),
        ];
        replay.run(tokio_stream::iter(commands)).await;

        let rows = replay.bookings().await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].1.status, RideStatus::Accepted);
        assert_eq!(rows[0].1.driver_id, Some(PartyId::new("d2")));
    }

    #[tokio::test]
    async fn errors_are_reported_per_command() {
        let (mut replay, _) = replay();
        replay.apply(request("p1", "r1")).await.unwrap();

        assert!(matches!(
            replay.apply(request("p2", "r1")).await,
            Err(ReplayError::DuplicateRide(_))
        ));
        assert!(matches!(
            replay.apply(accept("p1", "r1", None)).await,
            Err(ReplayError::RoleMismatch {
                existing: UserRole::Passenger,
                ..
            })
        ));
        assert!(matches!(
            replay.apply(accept("d1", "r1", Some(Coordinate::new(29.5, 78.5)))).await,
            Err(ReplayError::OutOfReach(_))
        ));
    }
}
