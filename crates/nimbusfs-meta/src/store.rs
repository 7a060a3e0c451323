//! Ordered store of metadata nodes.
//!
//! One map holds every entity, keyed by the composite [`Key`]. The map's
//! total order is what the rest of the crate builds on: directory listing
//! and chunk walks are range scans, and the checkpoint writer is one full
//! in-order traversal. The store is owned by the single apply timeline and
//! is never shared across threads.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::ops::Bound;

use crate::node::{Key, MetaNode, NodeKind};
use crate::types::MetaError;

/// Ordered map of every metadata node the authority holds.
#[derive(Debug, Default)]
pub struct MetaStore {
    nodes: BTreeMap<Key, MetaNode>,
}

impl MetaStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a node under its own key.
    ///
    /// Fails with [`MetaError::DuplicateKey`] when a node with the same
    /// key is already present; the existing node is left untouched.
    pub fn insert(&mut self, node: MetaNode) -> Result<(), MetaError> {
        let key = node.key();
        debug_assert_ne!(key.kind, NodeKind::Uninit, "uninit node reached the store");
        debug_assert_ne!(key.secondary, Key::MATCH_ANY, "wildcard key reached the store");
        match self.nodes.entry(key) {
            Entry::Occupied(_) => Err(MetaError::DuplicateKey(key)),
            Entry::Vacant(slot) => {
                slot.insert(node);
                Ok(())
            }
        }
    }

    /// Removes the node under `key` and hands it back to the caller.
    ///
    /// Fails with [`MetaError::NotFound`] when no such node exists.
    pub fn remove(&mut self, key: Key) -> Result<MetaNode, MetaError> {
        self.nodes.remove(&key).ok_or(MetaError::NotFound(key))
    }

    /// Looks up the node under `key`.
    pub fn find(&self, key: Key) -> Option<&MetaNode> {
        self.nodes.get(&key)
    }

    /// Mutable lookup of the node under `key`.
    pub fn find_mut(&mut self, key: Key) -> Option<&mut MetaNode> {
        self.nodes.get_mut(&key)
    }

    /// Ascending scan of one `(kind, primary)` group, starting at
    /// `secondary_from`. Pass [`Key::MATCH_ANY`] to cover the whole group.
    /// The iterator is lazy; nothing is visited until it is driven.
    pub fn range(
        &self,
        kind: NodeKind,
        primary: i64,
        secondary_from: i64,
    ) -> impl Iterator<Item = &MetaNode> {
        let start = Key::new(kind, primary, secondary_from);
        let end = Key::new(kind, primary, i64::MAX);
        self.nodes.range(start..=end).map(|(_, node)| node)
    }

    /// Ascending scan of every node of one kind, across all primaries.
    pub fn iter_kind(&self, kind: NodeKind) -> impl Iterator<Item = &MetaNode> {
        let start = Key::new(kind, i64::MIN, i64::MIN);
        let end = Key::new(kind, i64::MAX, i64::MAX);
        self.nodes
            .range((Bound::Included(start), Bound::Included(end)))
            .map(|(_, node)| node)
    }

    /// Full traversal in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&Key, &MetaNode)> {
        self.nodes.iter()
    }

    /// Full traversal in key order with mutable nodes, for flag rewrites
    /// during checkpointing.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&Key, &mut MetaNode)> {
        self.nodes.iter_mut()
    }

    /// Number of stored nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True when the store holds nothing.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
