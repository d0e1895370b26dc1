use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

pub const DEFAULT_MAIN_ADDRESS: &str = "127.0.0.1";
pub const DEFAULT_MAIN_PORT: u16 = 12910;

#[derive(Debug, Error)]
pub enum EnvironmentError {
    #[error("elastic environment variable {0} is not set")]
    Missing(&'static str),
    #[error("elastic environment variable {name} has invalid value '{value}'")]
    Invalid { name: &'static str, value: String },
    #[error("rank {rank} is outside world size {world_size}")]
    RankOutOfRange { rank: usize, world_size: usize },
}

/// Where this process sits in a distributed run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClusterTopology {
    pub global_rank: usize,
    pub local_rank: usize,
    pub node_rank: usize,
    pub world_size: usize,
    pub main_address: String,
    pub main_port: u16,
}

impl ClusterTopology {
    pub fn single_process() -> Self {
        Self {
            global_rank: 0,
            local_rank: 0,
            node_rank: 0,
            world_size: 1,
            main_address: DEFAULT_MAIN_ADDRESS.to_string(),
            main_port: DEFAULT_MAIN_PORT,
        }
    }

    pub fn is_global_zero(&self) -> bool {
        self.global_rank == 0
    }

    /// Whether the `index`-th batch of an epoch belongs to this rank.
    pub fn owns_batch(&self, index: usize) -> bool {
        index % self.world_size.max(1) == self.global_rank
    }
}

/// Cluster environment for elastic launchers: rank and world size come from
/// the variables the launcher exports, not from command-line flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ElasticEnvironment;

impl ElasticEnvironment {
    pub fn detect(&self) -> Result<ClusterTopology, EnvironmentError> {
        self.detect_with(|name| std::env::var(name).ok())
    }

    pub fn detect_with<F>(&self, lookup: F) -> Result<ClusterTopology, EnvironmentError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let number = |name: &'static str| -> Result<usize, EnvironmentError> {
            let value = lookup(name).ok_or(EnvironmentError::Missing(name))?;
            value
                .trim()
                .parse()
                .map_err(|_| EnvironmentError::Invalid { name, value })
        };

        let world_size = number("WORLD_SIZE")?;
        let global_rank = number("RANK")?;
        let local_rank = number("LOCAL_RANK")?;
        let node_rank = match lookup("GROUP_RANK") {
            Some(_) => number("GROUP_RANK")?,
            None => 0,
        };
        if world_size == 0 || global_rank >= world_size {
            return Err(EnvironmentError::RankOutOfRange {
                rank: global_rank,
                world_size,
            });
        }

        let main_address = lookup("MASTER_ADDR").unwrap_or_else(|| {
            warn!("MASTER_ADDR is not set, using {}", DEFAULT_MAIN_ADDRESS);
            DEFAULT_MAIN_ADDRESS.to_string()
        });
        let main_port = match lookup("MASTER_PORT") {
            Some(value) => value
                .trim()
                .parse()
                .map_err(|_| EnvironmentError::Invalid {
                    name: "MASTER_PORT",
                    value,
                })?,
            None => DEFAULT_MAIN_PORT,
        };

        let topology = ClusterTopology {
            global_rank,
            local_rank,
            node_rank,
            world_size,
            main_address,
            main_port,
        };
        info!(
            "Elastic environment: rank {}/{} (local {}, node {}), main {}:{}",
            topology.global_rank,
            topology.world_size,
            topology.local_rank,
            topology.node_rank,
            topology.main_address,
            topology.main_port
        );
        Ok(topology)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_detect_reads_launcher_variables() {
        let vars = env(&[
            ("WORLD_SIZE", "8"),
            ("RANK", "5"),
            ("LOCAL_RANK", "1"),
            ("GROUP_RANK", "1"),
            ("MASTER_ADDR", "node-0"),
            ("MASTER_PORT", "29500"),
        ]);
        let topology = ElasticEnvironment
            .detect_with(|k| vars.get(k).cloned())
            .unwrap();
        assert_eq!(topology.global_rank, 5);
        assert_eq!(topology.world_size, 8);
        assert_eq!(topology.node_rank, 1);
        assert_eq!(topology.main_address, "node-0");
        assert_eq!(topology.main_port, 29500);
        assert!(!topology.is_global_zero());
    }

    #[test]
    fn test_missing_rank_is_an_error() {
        let vars = env(&[("WORLD_SIZE", "2"), ("LOCAL_RANK", "0")]);
        let err = ElasticEnvironment
            .detect_with(|k| vars.get(k).cloned())
            .unwrap_err();
        assert!(matches!(err, EnvironmentError::Missing("RANK")));
    }

    #[test]
    fn test_rank_outside_world_is_rejected() {
        let vars = env(&[("WORLD_SIZE", "2"), ("RANK", "2"), ("LOCAL_RANK", "0")]);
        let err = ElasticEnvironment
            .detect_with(|k| vars.get(k).cloned())
            .unwrap_err();
        assert!(matches!(err, EnvironmentError::RankOutOfRange { .. }));
    }

    #[test]
    fn test_batch_ownership_is_round_robin() {
        let topology = ClusterTopology {
            global_rank: 1,
            world_size: 3,
            ..ClusterTopology::single_process()
        };
        let owned: Vec<usize> = (0..9).filter(|i| topology.owns_batch(*i)).collect();
        assert_eq!(owned, vec![1, 4, 7]);
    }
}
