pub mod amount;
pub mod bus;
pub mod config;
pub mod engine;
pub mod escrow;
pub mod geo;
pub mod model;
pub mod replay;
pub mod retry;
pub mod script;
pub mod session;
pub mod store;

pub use amount::MicroAlgos;
pub use config::EngineConfig;
pub use engine::{Completion, Engine, EngineError};
pub use escrow::{EscrowGateway, LedgerGateway};
pub use geo::Coordinate;
pub use model::{BookingId, EscrowState, PartyId, RideBooking, RideStatus};
pub use session::{DriverSession, PassengerSession};
pub use store::{BookingStore, MemoryStore};
