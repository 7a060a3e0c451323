//! Observed chunk replica locations.
//!
//! The tree records how many copies each file wants; this map records
//! where copies actually are, as reported by data servers. Reports land
//! from connection tasks while the apply loop reads during replication
//! checks, so the map is concurrent.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::types::{ChunkId, ChunkVersion, ServerId};

/// One observed replica of a chunk on one data server.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkReplica {
    /// Server hosting the replica.
    pub server: ServerId,
    /// Chunk version the server last reported.
    pub version: ChunkVersion,
}

/// Concurrent map from chunk id to its known replicas.
#[derive(Debug, Default)]
pub struct ChunkPlacement {
    replicas: DashMap<ChunkId, Vec<ChunkReplica>>,
}

impl ChunkPlacement {
    /// Creates an empty placement map.
    pub fn new() -> Self {
        ChunkPlacement {
            replicas: DashMap::new(),
        }
    }

    /// Records that `server` holds `chunk` at `version`, replacing any
    /// earlier report from the same server.
    pub fn record_replica(&self, chunk: ChunkId, server: ServerId, version: ChunkVersion) {
        let mut entry = self.replicas.entry(chunk).or_default();
        match entry.iter_mut().find(|r| r.server == server) {
            Some(replica) => replica.version = version,
            None => entry.push(ChunkReplica { server, version }),
        }
    }

    /// Forgets one server's replica of `chunk`.
    pub fn drop_replica(&self, chunk: ChunkId, server: ServerId) {
        if let Some(mut entry) = self.replicas.get_mut(&chunk) {
            entry.retain(|r| r.server != server);
            if !entry.is_empty() {
                return;
            }
        }
        self.replicas.remove_if(&chunk, |_, v| v.is_empty());
    }

    /// Forgets every replica hosted by `server`. Called when a data
    /// server drops out of the cluster.
    pub fn drop_server(&self, server: ServerId) {
        self.replicas.retain(|_, replicas| {
            replicas.retain(|r| r.server != server);
            !replicas.is_empty()
        });
    }

    /// Forgets every replica record of `chunk`. Called when the chunk's
    /// metadata is removed from the tree.
    pub fn drop_chunk(&self, chunk: ChunkId) {
        self.replicas.remove(&chunk);
    }

    /// Replicas currently known for `chunk`, empty when none are.
    pub fn replicas(&self, chunk: ChunkId) -> Vec<ChunkReplica> {
        self.replicas
            .get(&chunk)
            .map(|entry| entry.clone())
            .unwrap_or_default()
    }

    /// Number of replicas currently known for `chunk`.
    pub fn replica_count(&self, chunk: ChunkId) -> usize {
        self.replicas.get(&chunk).map(|entry| entry.len()).unwrap_or(0)
    }

    /// Number of chunks with at least one known replica.
    pub fn len(&self) -> usize {
        self.replicas.len()
    }

    /// True when no replica is known at all.
    pub fn is_empty(&self) -> bool {
        self.replicas.is_empty()
    }
}
