//! Relay server engine: client registry, readiness gating and frame routing.

pub mod config;
pub mod connection;
pub mod registry;
pub mod router;

pub use config::GatewayConfig;
pub use connection::Gateway;
pub use registry::{ClientRecord, MIN_PEERS, Outbox, Readiness, Registry};
pub use router::Router;
