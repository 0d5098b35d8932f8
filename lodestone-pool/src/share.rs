//! The share record emitted for every accepted submission.

use serde::Serialize;
use time::OffsetDateTime;

/// One accepted share, enriched with connection and chain context.
///
/// This is the unit handed to downstream consumers (persistence, payout
/// accounting, statistics). Candidate shares additionally carry the block
/// hash they produced.
#[derive(Debug, Clone, Serialize)]
pub struct Share {
    pub pool_id: String,
    pub miner: String,
    pub worker: Option<String>,
    pub user_agent: Option<String>,
    pub ip_address: String,
    /// Difficulty credited to the worker.
    pub difficulty: f64,
    pub network_difficulty: f64,
    pub block_height: u64,
    pub block_reward: Option<u64>,
    pub block_hash: Option<String>,
    pub is_block_candidate: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created: OffsetDateTime,
}
