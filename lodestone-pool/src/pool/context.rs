//! Per-connection protocol state.

use std::sync::OnceLock;

use regex::Regex;

use crate::vardiff::VarDiffState;

/// Running share counters for one connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShareStats {
    pub valid: u64,
    pub invalid: u64,
}

impl ShareStats {
    pub fn total(&self) -> u64 {
        self.valid + self.invalid
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Protocol state accumulated over a connection's lifetime.
///
/// Guarded by the connection's context mutex; everything here is plain
/// data so the lock is never held across an await.
#[derive(Debug, Default)]
pub struct WorkerContext {
    pub user_agent: Option<String>,
    pub miner: Option<String>,
    pub worker: Option<String>,
    pub is_subscribed: bool,
    pub is_authorized: bool,
    pub extranonce1: Option<String>,

    /// Difficulty currently in force.
    pub difficulty: f64,
    /// Difficulty before the last change, honored for straddling shares.
    pub previous_difficulty: Option<f64>,
    /// Difficulty decided but not yet announced to the miner.
    pub pending_difficulty: Option<f64>,
    /// Set when the miner pinned its difficulty via password; disables
    /// vardiff for this connection.
    pub static_difficulty: bool,

    pub vardiff: VarDiffState,
    pub stats: ShareStats,
}

impl WorkerContext {
    /// Stage a difficulty change for the next announcement.
    pub fn enqueue_difficulty(&mut self, difficulty: f64) {
        self.pending_difficulty = Some(difficulty);
    }

    /// Promote the pending difficulty, remembering the old one.
    pub fn apply_pending_difficulty(&mut self) -> Option<f64> {
        let pending = self.pending_difficulty.take()?;
        if pending == self.difficulty {
            return None;
        }
        self.previous_difficulty = Some(self.difficulty);
        self.difficulty = pending;
        Some(pending)
    }
}

/// Extract a `d=<value>` difficulty override from an authorize password.
///
/// Miners pin their difficulty with passwords like `x;d=8192` or `d=0.1`.
pub fn parse_static_difficulty(password: &str) -> Option<f64> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| {
        Regex::new(r";?d=(\d*(\.\d+)?)").expect("static difficulty pattern")
    });
    let captures = pattern.captures(password)?;
    let value: f64 = captures.get(1)?.as_str().parse().ok()?;
    (value > 0.0).then_some(value)
}
