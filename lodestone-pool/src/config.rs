//! Configuration management for lodestone-pool.
//!
//! This module handles loading and validating configuration from a JSON
//! file. A pool instance is described by one [`PoolConfig`]: the stratum
//! endpoints to listen on, the upstream daemon to poll for work, and the
//! vardiff and banning policies.

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Main configuration structure for a pool instance.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PoolConfig {
    /// Pool identifier, attached to every share
    pub id: String,

    /// Stratum endpoints to listen on
    pub ports: Vec<EndpointConfig>,

    /// Upstream daemon to poll for block templates
    pub daemon: DaemonConfig,

    /// Payout address for the coinbase output
    pub address: String,

    /// Banning policy
    #[serde(default)]
    pub banning: BanningConfig,

    /// Maximum concurrent connections, 0 for unlimited
    #[serde(default)]
    pub max_connections: usize,

    /// Block template poll interval in seconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,
}

fn default_poll_interval() -> u64 {
    1
}

/// One stratum listen endpoint.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EndpointConfig {
    /// Listen address
    #[serde(default = "default_listen_address")]
    pub address: IpAddr,

    /// Listen port
    pub port: u16,

    /// Starting difficulty for new connections
    pub difficulty: f64,

    /// TLS settings; plaintext when absent
    pub tls: Option<TlsConfig>,

    /// Proxy-protocol settings; disabled when absent
    pub proxy_protocol: Option<ProxyProtocolConfig>,

    /// Vardiff policy; static difficulty when absent
    pub vardiff: Option<VarDiffConfig>,
}

fn default_listen_address() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}

/// TLS termination settings for an endpoint.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    /// PEM certificate chain
    pub cert_file: PathBuf,

    /// PEM private key
    pub key_file: PathBuf,
}

/// Proxy-protocol v1 settings for an endpoint behind a load balancer.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxyProtocolConfig {
    /// Reject connections whose first line is not a proxy header
    #[serde(default)]
    pub mandatory: bool,

    /// Peers allowed to send proxy headers; loopback when empty
    #[serde(default)]
    pub trusted: Vec<IpAddr>,
}

impl ProxyProtocolConfig {
    /// Whether `peer` may hand us a proxy-protocol header.
    pub fn is_trusted(&self, peer: IpAddr) -> bool {
        if self.trusted.is_empty() {
            peer.is_loopback()
        } else {
            self.trusted.contains(&peer)
        }
    }
}

/// Variable-difficulty retargeting policy.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VarDiffConfig {
    /// Difficulty floor
    pub min_diff: f64,

    /// Difficulty ceiling; unbounded when absent
    pub max_diff: Option<f64>,

    /// Desired seconds between shares
    #[serde(default = "default_target_time")]
    pub target_time: f64,

    /// Minimum seconds between retargets
    #[serde(default = "default_retarget_time")]
    pub retarget_time: f64,

    /// Allowed deviation from target_time, in percent
    #[serde(default = "default_variance_percent")]
    pub variance_percent: f64,

    /// Largest absolute difficulty step per retarget; unbounded when absent
    pub max_delta: Option<f64>,
}

fn default_target_time() -> f64 {
    15.0
}

fn default_retarget_time() -> f64 {
    90.0
}

fn default_variance_percent() -> f64 {
    30.0
}

/// Banning policy for misbehaving peers.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BanningConfig {
    /// Master switch
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Ban peers that send garbage before completing a handshake
    #[serde(default = "default_true")]
    pub ban_on_junk: bool,

    /// Shares to observe before considering a ban
    #[serde(default = "default_check_threshold")]
    pub check_threshold: u64,

    /// Invalid-share percentage that triggers a ban
    #[serde(default = "default_invalid_percent")]
    pub invalid_percent: f64,

    /// Ban duration in seconds
    #[serde(default = "default_ban_time")]
    pub time: u64,
}

fn default_true() -> bool {
    true
}

fn default_check_threshold() -> u64 {
    50
}

fn default_invalid_percent() -> f64 {
    50.0
}

fn default_ban_time() -> u64 {
    600
}

impl Default for BanningConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ban_on_junk: true,
            check_threshold: default_check_threshold(),
            invalid_percent: default_invalid_percent(),
            time: default_ban_time(),
        }
    }
}

/// Upstream daemon RPC settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DaemonConfig {
    /// RPC base URL, e.g. http://127.0.0.1:8332
    pub url: String,

    /// RPC username
    pub user: Option<String>,

    /// RPC password
    pub password: Option<String>,
}

impl PoolConfig {
    /// Load configuration from a JSON file.
    pub fn load_from(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: PoolConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check invariants that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.ports.is_empty() {
            return Err(Error::Config("no listen endpoints configured".into()));
        }
        for endpoint in &self.ports {
            if endpoint.difficulty <= 0.0 {
                return Err(Error::Config(format!(
                    "port {}: difficulty must be positive",
                    endpoint.port
                )));
            }
            if let Some(vardiff) = &endpoint.vardiff {
                if vardiff.min_diff <= 0.0 {
                    return Err(Error::Config(format!(
                        "port {}: vardiff min_diff must be positive",
                        endpoint.port
                    )));
                }
                if let Some(max) = vardiff.max_diff {
                    if max < vardiff.min_diff {
                        return Err(Error::Config(format!(
                            "port {}: vardiff max_diff below min_diff",
                            endpoint.port
                        )));
                    }
                }
                if vardiff.target_time <= 0.0 || vardiff.retarget_time <= 0.0 {
                    return Err(Error::Config(format!(
                        "port {}: vardiff times must be positive",
                        endpoint.port
                    )));
                }
            }
        }
        if self.poll_interval == 0 {
            return Err(Error::Config("poll_interval must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_json() -> &'static str {
        r#"{
            "id": "btc1",
            "address": "bcrt1qxxx",
            "daemon": { "url": "http://127.0.0.1:8332", "user": "u", "password": "p" },
            "ports": [
                { "port": 3333, "difficulty": 0.01,
                  "vardiff": { "min_diff": 0.01, "max_diff": 16.0 } }
            ]
        }"#
    }

    #[test]
    fn parses_minimal_config() {
        let config: PoolConfig = serde_json::from_str(minimal_json()).unwrap();
        config.validate().unwrap();
        assert_eq!(config.id, "btc1");
        assert_eq!(config.poll_interval, 1);
        let vardiff = config.ports[0].vardiff.as_ref().unwrap();
        assert_eq!(vardiff.target_time, 15.0);
        assert_eq!(vardiff.retarget_time, 90.0);
        assert_eq!(vardiff.variance_percent, 30.0);
    }

    #[test]
    fn rejects_empty_ports() {
        let mut config: PoolConfig = serde_json::from_str(minimal_json()).unwrap();
        config.ports.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_inverted_vardiff_bounds() {
        let mut config: PoolConfig = serde_json::from_str(minimal_json()).unwrap();
        config.ports[0].vardiff.as_mut().unwrap().max_diff = Some(0.001);
        assert!(config.validate().is_err());
    }

    #[test]
    fn proxy_trust_defaults_to_loopback() {
        let config = ProxyProtocolConfig {
            mandatory: false,
            trusted: vec![],
        };
        assert!(config.is_trusted("127.0.0.1".parse().unwrap()));
        assert!(!config.is_trusted("10.0.0.1".parse().unwrap()));

        let config = ProxyProtocolConfig {
            mandatory: true,
            trusted: vec!["10.0.0.1".parse().unwrap()],
        };
        assert!(config.is_trusted("10.0.0.1".parse().unwrap()));
        assert!(!config.is_trusted("127.0.0.1".parse().unwrap()));
    }
}
