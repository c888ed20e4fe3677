// src/config.rs

use std::time::Duration;

use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;

use crate::auth::AuthConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value}")]
    Invalid { var: &'static str, value: String },
}

/// Engine configuration, resolved from the environment at startup. Parse
/// failures are fatal (exit code 1).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Ingestion listener address.
    pub bind: String,
    /// Admin HTTP listener address.
    pub admin_bind: String,
    pub auth: AuthConfig,
    /// Worker pool size.
    pub workers: usize,
    /// Mempool capacity.
    pub mempool_max: usize,
    /// Events per block.
    pub block_size: usize,
    /// Max wait before a partial batch is emitted.
    pub batch_timeout: Duration,
    pub network: NetworkConfig,
}

/// Gossip layer configuration. `bind: None` runs the engine standalone with
/// the network layer disabled.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub node_id: String,
    pub bind: Option<String>,
    pub seed_peers: Vec<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            bind: None,
            seed_peers: Vec::new(),
        }
    }
}

fn default_node_id() -> String {
    let mut suffix = [0u8; 4];
    OsRng.fill_bytes(&mut suffix);
    format!("node-{}", hex::encode(suffix))
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:50051".to_string(),
            admin_bind: "127.0.0.1:8081".to_string(),
            auth: AuthConfig::disabled(),
            workers: available_workers(),
            mempool_max: 100_000,
            block_size: 500,
            batch_timeout: Duration::from_millis(2000),
            network: NetworkConfig::default(),
        }
    }
}

fn available_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn env_bool(var: &'static str, default: bool) -> bool {
    match std::env::var(var) {
        Ok(v) => v == "true" || v == "1",
        Err(_) => default,
    }
}

fn env_parse<T: std::str::FromStr>(var: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(var) {
        Ok(v) => v
            .parse::<T>()
            .map_err(|_| ConfigError::Invalid { var, value: v }),
        Err(_) => Ok(default),
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let auth = AuthConfig {
            enabled: env_bool("AUTH_ENABLED", false),
            token: std::env::var("AUTH_TOKEN").unwrap_or_default(),
        };

        let network = NetworkConfig {
            node_id: std::env::var("NODE_ID").unwrap_or_else(|_| default_node_id()),
            bind: std::env::var("GOSSIP_BIND").ok().filter(|s| !s.is_empty()),
            seed_peers: std::env::var("SEED_PEERS")
                .map(|s| {
                    s.split(',')
                        .map(|p| p.trim().to_string())
                        .filter(|p| !p.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
        };

        let workers: usize = env_parse("WORKERS", defaults.workers)?;
        let mempool_max: usize = env_parse("MEMPOOL_MAX", defaults.mempool_max)?;
        let block_size: usize = env_parse("BLOCK_SIZE", defaults.block_size)?;
        let batch_timeout_ms: u64 = env_parse("BATCH_TIMEOUT_MS", 2000)?;

        if block_size == 0 {
            return Err(ConfigError::Invalid { var: "BLOCK_SIZE", value: "0".into() });
        }
        if mempool_max == 0 {
            return Err(ConfigError::Invalid { var: "MEMPOOL_MAX", value: "0".into() });
        }

        Ok(Self {
            bind: std::env::var("ENGINE_BIND").unwrap_or(defaults.bind),
            admin_bind: std::env::var("ADMIN_BIND").unwrap_or(defaults.admin_bind),
            auth,
            workers: workers.max(1),
            mempool_max,
            block_size,
            batch_timeout: Duration::from_millis(batch_timeout_ms),
            network,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.bind, "127.0.0.1:50051");
        assert_eq!(cfg.block_size, 500);
        assert_eq!(cfg.mempool_max, 100_000);
        assert_eq!(cfg.batch_timeout, Duration::from_millis(2000));
        assert!(!cfg.auth.enabled);
        assert!(cfg.workers >= 1);
        assert!(cfg.network.bind.is_none());
    }

    #[test]
    fn node_ids_are_unique_enough() {
        let a = default_node_id();
        let b = default_node_id();
        assert!(a.starts_with("node-"));
        assert_ne!(a, b);
    }
}
