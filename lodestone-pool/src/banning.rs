//! In-process IP ban list.
//!
//! Bans are held in memory and expire lazily: a lookup that finds an
//! expired entry removes it. The server consults the list both before the
//! TLS/proxy handshake and again before dispatching each request, so a ban
//! placed mid-session takes effect on the peer's next message.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::tracing::prelude::*;

/// Shared ban list keyed by peer IP.
#[derive(Debug, Default)]
pub struct BanManager {
    bans: Mutex<HashMap<IpAddr, Instant>>,
}

impl BanManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ban `ip` for `duration`, extending any existing ban.
    pub fn ban(&self, ip: IpAddr, duration: Duration) {
        let expires = Instant::now() + duration;
        let mut bans = self.bans.lock();
        let entry = bans.entry(ip).or_insert(expires);
        if *entry < expires {
            *entry = expires;
        }
        info!(%ip, secs = duration.as_secs(), "banned peer");
    }

    /// Whether `ip` is currently banned. Expired entries are dropped.
    pub fn is_banned(&self, ip: IpAddr) -> bool {
        let mut bans = self.bans.lock();
        match bans.get(&ip) {
            Some(expires) if *expires > Instant::now() => true,
            Some(_) => {
                bans.remove(&ip);
                false
            }
            None => false,
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.bans.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ban_and_expire() {
        let bans = BanManager::new();
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        assert!(!bans.is_banned(ip));

        bans.ban(ip, Duration::from_secs(60));
        assert!(bans.is_banned(ip));

        // Zero-duration ban is already expired and gets swept on lookup.
        let other: IpAddr = "10.0.0.2".parse().unwrap();
        bans.ban(other, Duration::from_secs(0));
        assert!(!bans.is_banned(other));
        assert_eq!(bans.len(), 1);
    }

    #[test]
    fn longer_ban_wins() {
        let bans = BanManager::new();
        let ip: IpAddr = "10.0.0.3".parse().unwrap();
        bans.ban(ip, Duration::from_secs(600));
        bans.ban(ip, Duration::from_secs(1));
        assert!(bans.is_banned(ip));
    }
}
