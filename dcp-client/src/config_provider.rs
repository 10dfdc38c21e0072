//! Cluster topology collaborator.
//!
//! The bootstrap HTTP config fetcher is out of scope for this core; the
//! Conductor only ever calls `refresh`/`current` against whatever
//! implements `ConfigProvider`. `StaticConfigProvider` exists so tests and
//! the in-memory mock node don't need a real cluster.

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use dcp_core::endpoint::NodeAddress;
use dcp_core::error::Result;

/// Which KV node is the master for each vbucket, as of the last refresh.
#[derive(Debug, Clone, Default)]
pub struct BucketConfig {
    pub rev: u64,
    pub vbucket_map: BTreeMap<u16, NodeAddress>,
}

impl BucketConfig {
    #[must_use]
    pub fn master_for(&self, vbid: u16) -> Option<NodeAddress> {
        self.vbucket_map.get(&vbid).copied()
    }

    /// Distinct master nodes covering `vbuckets` (or every mapped vbucket
    /// when `vbuckets` is `None`), used by the Conductor to decide which
    /// channels must exist.
    #[must_use]
    pub fn distinct_masters(&self, vbuckets: Option<&[u16]>) -> Vec<NodeAddress> {
        let mut seen = Vec::new();
        let iter: Box<dyn Iterator<Item = (&u16, &NodeAddress)>> = match vbuckets {
            Some(subset) => Box::new(
                self.vbucket_map
                    .iter()
                    .filter(move |(vbid, _)| subset.contains(vbid)),
            ),
            None => Box::new(self.vbucket_map.iter()),
        };
        for (_, node) in iter {
            if !seen.contains(node) {
                seen.push(*node);
            }
        }
        seen
    }
}

/// External collaborator producing the current cluster topology.
#[async_trait]
pub trait ConfigProvider: Send + Sync {
    /// Fetch the latest bucket config. Transient failures should be
    /// returned as errors — the Conductor/Fixer own retry policy, this trait
    /// does not retry internally.
    async fn refresh(&self) -> Result<BucketConfig>;

    /// The most recently fetched config without doing any I/O.
    fn current(&self) -> BucketConfig;
}

/// Fixed topology for tests and the in-memory mock node.
pub struct StaticConfigProvider {
    config: RwLock<BucketConfig>,
}

impl StaticConfigProvider {
    #[must_use]
    pub fn new(vbucket_map: BTreeMap<u16, NodeAddress>) -> Self {
        Self {
            config: RwLock::new(BucketConfig { rev: 1, vbucket_map }),
        }
    }

    /// Replace the topology, bumping `rev` — simulates a rebalance in tests.
    pub fn set(&self, vbucket_map: BTreeMap<u16, NodeAddress>) {
        let mut guard = self.config.write();
        guard.rev += 1;
        guard.vbucket_map = vbucket_map;
    }
}

#[async_trait]
impl ConfigProvider for StaticConfigProvider {
    async fn refresh(&self) -> Result<BucketConfig> {
        Ok(self.config.read().clone())
    }

    fn current(&self) -> BucketConfig {
        self.config.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn addr(port: u16) -> NodeAddress {
        NodeAddress::new(SocketAddr::from(([127, 0, 0, 1], port)))
    }

    #[test]
    fn distinct_masters_deduplicates_nodes() {
        let mut map = BTreeMap::new();
        map.insert(0, addr(11210));
        map.insert(1, addr(11210));
        map.insert(2, addr(11211));
        let cfg = BucketConfig { rev: 1, vbucket_map: map };

        let masters = cfg.distinct_masters(None);
        assert_eq!(masters.len(), 2);
    }

    #[test]
    fn distinct_masters_respects_vbucket_subset() {
        let mut map = BTreeMap::new();
        map.insert(0, addr(11210));
        map.insert(1, addr(11211));
        let cfg = BucketConfig { rev: 1, vbucket_map: map };

        let masters = cfg.distinct_masters(Some(&[0]));
        assert_eq!(masters, vec![addr(11210)]);
    }
}
