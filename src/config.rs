//! Configuration for a helmsman master process.
//!
//! Everything is plain struct configuration; `from_env` exists so binaries can
//! be pointed at a cluster without a config file, using `HELMSMAN_*` variables
//! with development defaults.

use crate::cluster::{CurrentNode, MasterRole, ReplicaId, ShardId, Topology, WorkerRole};
use crate::{Error, Result};

/// Process-wide distributed-mode flags, fixed at construction.
#[derive(Debug, Clone, Copy)]
pub struct DistributedConfig {
    /// Distributed mode on/off; off makes prepare a no-op and refuses pushes.
    pub enabled: bool,
    /// Async execution mode: the prepare lock is purely in-memory.
    pub async_write: bool,
}

impl Default for DistributedConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            async_write: false,
        }
    }
}

/// Startup description of this node and its cluster.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub cluster_name: String,
    pub current: CurrentNode,
    pub distributed: DistributedConfig,
}

impl ClusterConfig {
    pub fn new(cluster_name: impl Into<String>, current: CurrentNode) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            current,
            distributed: DistributedConfig::default(),
        }
    }

    /// Build from environment variables.
    ///
    /// - `HELMSMAN_CLUSTER`: cluster name (default `dev`)
    /// - `HELMSMAN_HOST`: advertised host (default `127.0.0.1`)
    /// - `HELMSMAN_SHARD` / `HELMSMAN_REPLICA`: this node's ids (default 1/1)
    /// - `HELMSMAN_BA_PORT` / `HELMSMAN_MASTER_PORT` / `HELMSMAN_WORKER_PORT`
    ///   / `HELMSMAN_DATA_PORT`: service ports
    /// - `HELMSMAN_DISTRIBUTED`: `0`/`false` turns distributed mode off
    pub fn from_env() -> Result<Self> {
        let cluster_name = env_or("HELMSMAN_CLUSTER", "dev");
        let host = env_or("HELMSMAN_HOST", "127.0.0.1");
        let shard: ShardId = parse_env("HELMSMAN_SHARD", 1)?;
        let replica: ReplicaId = parse_env("HELMSMAN_REPLICA", 1)?;
        let ba_port: u16 = parse_env("HELMSMAN_BA_PORT", 18080)?;
        let master_port: u16 = parse_env("HELMSMAN_MASTER_PORT", 18131)?;
        let worker_port: u16 = parse_env("HELMSMAN_WORKER_PORT", 18151)?;
        let data_port: u16 = parse_env("HELMSMAN_DATA_PORT", 18121)?;
        let distributed = match std::env::var("HELMSMAN_DISTRIBUTED") {
            Ok(raw) => {
                let raw = raw.trim();
                !(raw == "0" || raw.eq_ignore_ascii_case("false"))
            }
            Err(_) => true,
        };

        Ok(Self {
            cluster_name,
            current: CurrentNode {
                shard,
                replica,
                host,
                ba_port,
                data_port,
                master: MasterRole {
                    enabled: true,
                    name: format!("master-{}", shard),
                    port: master_port,
                },
                worker: WorkerRole {
                    enabled: true,
                    port: worker_port,
                },
            },
            distributed: DistributedConfig {
                enabled: distributed,
                async_write: false,
            },
        })
    }

    /// Seed a topology snapshot from this configuration.
    pub fn into_topology(self) -> Topology {
        Topology::new(self.cluster_name, self.current)
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| Error::Config(format!("invalid value for {}: {:?}", key, raw))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Mutex, OnceLock};

    const TEST_ENV_KEYS: &[&str] = &[
        "HELMSMAN_CLUSTER",
        "HELMSMAN_HOST",
        "HELMSMAN_SHARD",
        "HELMSMAN_REPLICA",
        "HELMSMAN_BA_PORT",
        "HELMSMAN_MASTER_PORT",
        "HELMSMAN_WORKER_PORT",
        "HELMSMAN_DATA_PORT",
        "HELMSMAN_DISTRIBUTED",
    ];

    fn env_lock() -> &'static Mutex<()> {
        static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        LOCK.get_or_init(|| Mutex::new(()))
    }

    fn with_env<F: FnOnce()>(overrides: &[(&str, &str)], f: F) {
        let _guard = env_lock().lock().expect("env lock poisoned");
        let saved: Vec<(&str, Option<String>)> = TEST_ENV_KEYS
            .iter()
            .map(|key| (*key, std::env::var(key).ok()))
            .collect();
        for key in TEST_ENV_KEYS {
            std::env::remove_var(key);
        }
        for (key, value) in overrides {
            std::env::set_var(key, value);
        }

        f();

        for (key, value) in saved {
            match value {
                Some(v) => std::env::set_var(key, v),
                None => std::env::remove_var(key),
            }
        }
    }

    #[test]
    fn from_env_defaults() {
        with_env(&[], || {
            let config = ClusterConfig::from_env().unwrap();
            assert_eq!(config.cluster_name, "dev");
            assert_eq!(config.current.shard, 1);
            assert!(config.distributed.enabled);
        });
    }

    #[test]
    fn from_env_overrides() {
        with_env(
            &[
                ("HELMSMAN_CLUSTER", "prod"),
                ("HELMSMAN_SHARD", "3"),
                ("HELMSMAN_DISTRIBUTED", "false"),
            ],
            || {
                let config = ClusterConfig::from_env().unwrap();
                assert_eq!(config.cluster_name, "prod");
                assert_eq!(config.current.shard, 3);
                assert!(!config.distributed.enabled);
            },
        );
    }

    #[test]
    fn from_env_rejects_bad_numbers() {
        with_env(&[("HELMSMAN_SHARD", "three")], || {
            let err = ClusterConfig::from_env().expect_err("bad shard id should fail");
            assert!(err.to_string().contains("HELMSMAN_SHARD"));
        });
    }
}
