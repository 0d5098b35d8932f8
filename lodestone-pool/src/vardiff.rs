//! Variable-difficulty retargeting.
//!
//! Each connection on a vardiff-enabled endpoint carries a [`VarDiffState`]
//! tracking the recent cadence of its share submissions. On every share
//! (and on a periodic idle tick when no shares arrive) the pool calls
//! [`VarDiffManager::update`]; when the observed average gap drifts outside
//! the tolerance band and the retarget cooldown has elapsed, a new
//! difficulty is returned for the pool to apply.

use std::collections::VecDeque;

use crate::config::VarDiffConfig;

const BUFFER_SIZE: usize = 10;

/// Per-connection retargeting state.
///
/// `last_ts` is the unix time of the last accepted share; `last_retarget`
/// the unix time of the last difficulty change. Both in seconds.
#[derive(Debug, Clone, Default)]
pub struct VarDiffState {
    last_ts: Option<f64>,
    last_retarget: f64,
    time_buffer: VecDeque<f64>,
}

/// Applies one endpoint's vardiff policy to connection states.
#[derive(Debug, Clone)]
pub struct VarDiffManager {
    config: VarDiffConfig,
    t_min: f64,
    t_max: f64,
}

impl VarDiffManager {
    pub fn new(config: VarDiffConfig) -> Self {
        let variance = config.target_time * (config.variance_percent / 100.0);
        let t_min = config.target_time - variance;
        let t_max = config.target_time + variance;
        Self { config, t_min, t_max }
    }

    pub fn config(&self) -> &VarDiffConfig {
        &self.config
    }

    /// Feed one observation at unix time `now` (seconds) and return the new
    /// difficulty if a retarget is due.
    ///
    /// `is_idle_update` marks the periodic tick fired when no share arrived
    /// for a while; idle observations influence the average but are not
    /// recorded in the buffer, so a burst of idle ticks decays difficulty
    /// without polluting the share-gap history.
    pub fn update(
        &self,
        state: &mut VarDiffState,
        difficulty: f64,
        now: f64,
        is_idle_update: bool,
    ) -> Option<f64> {
        // First observation only seeds the clock.
        let Some(last_ts) = state.last_ts else {
            state.last_ts = Some(now);
            state.last_retarget = now;
            state.time_buffer = VecDeque::with_capacity(BUFFER_SIZE);
            return None;
        };

        let min_diff = self.config.min_diff;
        let max_diff = self.config.max_diff.unwrap_or(f64::MAX).max(min_diff);
        let since_last = now - last_ts;

        let time_total: f64 = state.time_buffer.iter().sum();
        let time_count = state.time_buffer.len();
        let avg = (time_total + since_last) / (time_count + 1) as f64;

        if !is_idle_update {
            if state.time_buffer.len() == BUFFER_SIZE {
                state.time_buffer.pop_front();
            }
            state.time_buffer.push_back(since_last);
            state.last_ts = Some(now);
        }

        if now - state.last_retarget < self.config.retarget_time
            || (avg >= self.t_min && avg <= self.t_max)
        {
            return None;
        }

        let mut new_diff = difficulty * self.config.target_time / avg;

        // Delta is an absolute cap, not a ratio.
        if let Some(max_delta) = self.config.max_delta.filter(|d| *d > 0.0) {
            let delta = (new_diff - difficulty).abs();
            if delta > max_delta {
                if new_diff > difficulty {
                    new_diff -= delta - max_delta;
                } else {
                    new_diff += delta - max_delta;
                }
            }
        }

        new_diff = new_diff.clamp(min_diff, max_diff);

        if new_diff != difficulty {
            state.last_retarget = now;
            state.time_buffer = VecDeque::with_capacity(BUFFER_SIZE);
            Some(new_diff)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(min: f64, max: Option<f64>, max_delta: Option<f64>) -> VarDiffManager {
        VarDiffManager::new(VarDiffConfig {
            min_diff: min,
            max_diff: max,
            target_time: 15.0,
            retarget_time: 90.0,
            variance_percent: 30.0,
            max_delta,
        })
    }

    #[test]
    fn first_update_never_retargets() {
        let m = manager(0.01, Some(1000.0), None);
        let mut state = VarDiffState::default();
        assert_eq!(m.update(&mut state, 1.0, 1000.0, false), None);
    }

    #[test]
    fn fast_shares_raise_difficulty() {
        let m = manager(0.01, Some(1000.0), None);
        let mut state = VarDiffState::default();
        let mut now = 0.0;
        let mut diff = 1.0;

        m.update(&mut state, diff, now, false);
        // Shares every second, well below the 15s target.
        let mut retargets = 0;
        for _ in 0..200 {
            now += 1.0;
            if let Some(new_diff) = m.update(&mut state, diff, now, false) {
                assert!(new_diff > diff, "{new_diff} should exceed {diff}");
                diff = new_diff;
                retargets += 1;
            }
        }
        assert!(retargets >= 1);
        assert!(diff > 1.0);
    }

    #[test]
    fn no_retarget_before_cooldown() {
        let m = manager(0.01, Some(1000.0), None);
        let mut state = VarDiffState::default();
        m.update(&mut state, 1.0, 0.0, false);
        // Fast shares, but only 50s have elapsed since the last retarget.
        for i in 1..=50 {
            assert_eq!(m.update(&mut state, 1.0, i as f64, false), None);
        }
    }

    #[test]
    fn idle_updates_decay_difficulty() {
        let m = manager(0.01, Some(1000.0), None);
        let mut state = VarDiffState::default();
        let mut diff = 64.0;

        m.update(&mut state, diff, 0.0, false);
        // No shares at all for 10 minutes, polled every 15s.
        let mut now = 0.0;
        for _ in 0..40 {
            now += 15.0;
            if let Some(new_diff) = m.update(&mut state, diff, now, true) {
                assert!(new_diff < diff);
                diff = new_diff;
            }
        }
        assert!(diff < 64.0);
    }

    #[test]
    fn max_delta_caps_the_step() {
        let m = manager(0.01, Some(1000.0), Some(0.5));
        let mut state = VarDiffState::default();
        m.update(&mut state, 1.0, 0.0, false);
        let mut now = 0.0;
        for _ in 0..120 {
            now += 1.0;
            if let Some(new_diff) = m.update(&mut state, 1.0, now, false) {
                assert!((new_diff - 1.0).abs() <= 0.5 + 1e-9);
                return;
            }
        }
        panic!("expected a retarget");
    }

    #[test]
    fn clamps_to_min_diff() {
        let m = manager(0.5, Some(1000.0), None);
        let mut state = VarDiffState::default();
        let mut diff = 0.6;
        m.update(&mut state, diff, 0.0, false);
        let mut now = 0.0;
        for _ in 0..10 {
            now += 120.0;
            if let Some(new_diff) = m.update(&mut state, diff, now, true) {
                diff = new_diff;
            }
        }
        assert_eq!(diff, 0.5);
    }
}
