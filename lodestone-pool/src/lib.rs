//! Stratum v1 mining pool server core.
//!
//! The crate is organized around three long-lived actors: the
//! [`job::JobManager`] polls the coin daemon for block templates and
//! publishes jobs, the [`stratum::StratumServer`] owns the listeners and
//! the connection registry, and the [`pool::Pool`] ties them together as
//! the protocol handler that grades shares and applies difficulty and
//! banning policy.

pub mod banning;
pub mod coin;
pub mod config;
pub mod daemon;
pub mod error;
pub mod job;
pub mod pool;
pub mod share;
pub mod stratum;
pub mod tracing;
pub mod vardiff;

pub use error::{Error, Result};
