//! Stratum v1 server side: framing, connection handling, and the
//! listener/registry.

pub mod connection;
pub mod rpc;
pub mod server;

pub use connection::{ConnectionHandler, StratumConnection};
pub use server::StratumServer;
