use std::collections::BTreeSet;
use std::path::PathBuf;

use crate::ring::is_prime;
use crate::watcher::MembershipSnapshot;
use crate::Error;

/// Controller configuration, fixed for the process lifetime.
///
/// `total_nodes` is the logical pool size: backend identities exist for ids
/// `1..=total_nodes` whether or not a process for them is currently alive.
/// `table_size` is the Maglev lookup table size, a separate knob that must be
/// prime and strictly larger than the pool.
#[derive(Debug, Clone)]
pub struct Config {
    /// Local node id in `1..=total_nodes`, unique across the cluster.
    pub my_id: u32,
    /// Size of the fixed backend pool.
    pub total_nodes: u32,
    /// Maglev table size (number of ring slots).
    pub table_size: usize,
    /// Key namespace prefix in the coordination service.
    pub chroot: String,
    /// The cluster ip whose membership this node manages.
    pub vip: String,
    /// Directory holding the kernel group control files, one per vip.
    pub sink_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            my_id: 1,
            total_nodes: 5,
            table_size: 13,
            chroot: "maglev0".to_string(),
            vip: "198.51.100.1".to_string(),
            sink_dir: PathBuf::from("/proc/net/ipt_CLUSTERIP"),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), Error> {
        if self.my_id == 0 || self.my_id > self.total_nodes {
            return Err(Error::Config(format!(
                "node id {} is outside the pool 1..={}",
                self.my_id, self.total_nodes
            )));
        }
        if !is_prime(self.table_size) {
            return Err(Error::InvalidRingSize {
                m: self.table_size,
                reason: "table size must be prime",
            });
        }
        if self.table_size <= self.total_nodes as usize {
            return Err(Error::InvalidRingSize {
                m: self.table_size,
                reason: "table size must exceed the backend pool size",
            });
        }
        if self.chroot.is_empty() {
            return Err(Error::Config("chroot prefix must not be empty".into()));
        }
        Ok(())
    }

    /// Backend identifier of the local node.
    pub fn self_backend(&self) -> String {
        format!("backend-{}", self.my_id)
    }

    /// Map a membership snapshot (numeric child names) onto backend
    /// identifiers, restricted to the configured pool. Children outside
    /// `1..=total_nodes` are ignored.
    pub fn live_backends(&self, snapshot: &MembershipSnapshot) -> BTreeSet<String> {
        (1..=self.total_nodes)
            .filter(|id| snapshot.contains(&id.to_string()))
            .map(|id| format!("backend-{id}"))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn test_rejects_node_id_zero() {
        let config = Config {
            my_id: 0,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_rejects_node_id_beyond_pool() {
        let config = Config {
            my_id: 6,
            total_nodes: 5,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_rejects_composite_table_size() {
        let config = Config {
            table_size: 15,
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(Error::InvalidRingSize { m: 15, .. })
        ));
    }

    #[test]
    fn test_rejects_table_size_not_exceeding_pool() {
        let config = Config {
            total_nodes: 13,
            table_size: 13,
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(Error::InvalidRingSize { m: 13, .. })
        ));
    }

    #[test]
    fn test_live_backends_filters_to_pool() {
        let config = Config::default();
        let snapshot: MembershipSnapshot =
            ["1", "3", "9", "junk"].iter().map(|s| s.to_string()).collect();

        let live = config.live_backends(&snapshot);
        let expected: BTreeSet<String> =
            ["backend-1", "backend-3"].iter().map(|s| s.to_string()).collect();
        assert_eq!(live, expected);
    }

    #[test]
    fn test_self_backend_name() {
        let config = Config {
            my_id: 4,
            ..Config::default()
        };
        assert_eq!(config.self_backend(), "backend-4");
    }
}
