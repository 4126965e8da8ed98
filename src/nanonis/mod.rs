pub mod client;
pub mod interface;
pub mod protocol;

pub use client::{ConnectionConfig, NanonisClient, NanonisClientBuilder};
pub use interface::{shared, Instrument, SharedInstrument, SimulatedInstrument};
pub use protocol::Protocol;
