// Copyright (c) 2024-present, tundra-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    node::{Node, NodeId},
    UserKey,
};
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, RwLock},
};

/// The set of a database's nodes, partitioned by key range
///
/// Keyed by each node's routing key (its smallest responsible key); the
/// union of node ranges covers the whole key space at all times, node
/// ranges never overlap, and each user key belongs to exactly one node.
/// There is always at least one node, possibly empty; bootstrap creates a
/// single node with the empty routing key.
///
/// Structural changes (insert/remove/replace) happen under the tree lock;
/// readers work on a snapshot of `Arc`s, so a concurrent replacement
/// never invalidates an in-flight scan.
pub struct Tree {
    nodes: RwLock<BTreeMap<UserKey, Arc<Node>>>,

    /// Replaced nodes awaiting file deletion once their last reader
    /// drops
    graveyard: Mutex<Vec<Arc<Node>>>,
}

impl Tree {
    /// Builds the tree from recovered nodes.
    ///
    /// The lowest node is re-anchored at the empty key so that coverage
    /// of the key space is complete.
    #[must_use]
    pub fn new(mut nodes: Vec<Arc<Node>>) -> Self {
        nodes.sort_by(|a, b| a.routing_key.cmp(&b.routing_key));

        let map = nodes
            .into_iter()
            .enumerate()
            .map(|(idx, node)| {
                let key = if idx == 0 {
                    UserKey::empty()
                } else {
                    node.routing_key.clone()
                };
                (key, node)
            })
            .collect::<BTreeMap<_, _>>();

        assert!(!map.is_empty(), "tree must cover the key space");

        Self {
            nodes: RwLock::new(map),
            graveyard: Mutex::new(vec![]),
        }
    }

    /// Routes a key to its owning node: the largest routing key ≤ `key`.
    #[must_use]
    pub fn route(&self, key: &[u8]) -> Arc<Node> {
        #[allow(clippy::expect_used)]
        let nodes = self.nodes.read().expect("lock is poisoned");

        #[allow(clippy::expect_used)]
        nodes
            .range::<[u8], _>((std::ops::Bound::Unbounded, std::ops::Bound::Included(key)))
            .next_back()
            .map(|(_, node)| node.clone())
            .expect("the first node is anchored at the empty key")
    }

    /// A consistent ordered snapshot of all nodes.
    #[must_use]
    pub fn nodes(&self) -> Vec<Arc<Node>> {
        #[allow(clippy::expect_used)]
        self.nodes
            .read()
            .expect("lock is poisoned")
            .values()
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        #[allow(clippy::expect_used)]
        self.nodes.read().expect("lock is poisoned").len()
    }

    /// Looks a node up by id.
    #[must_use]
    pub fn get_node(&self, id: NodeId) -> Option<Arc<Node>> {
        self.nodes().into_iter().find(|node| node.id == id)
    }

    /// Atomically replaces `old` with `new` (a compaction output,
    /// possibly a split into several nodes, possibly a single empty
    /// node).
    ///
    /// The replaced node moves to the graveyard; its file is deleted by
    /// the nodegc task once the last reader drops.
    pub fn replace(&self, old: &Arc<Node>, new: Vec<Arc<Node>>) {
        assert!(!new.is_empty(), "a replacement must cover the old range");

        #[allow(clippy::expect_used)]
        {
            let mut nodes = self.nodes.write().expect("lock is poisoned");

            let anchor = nodes
                .iter()
                .find(|(_, node)| node.id == old.id)
                .map(|(key, _)| key.clone());

            let Some(anchor) = anchor else {
                unreachable!("replaced node must be in the tree");
            };

            nodes.remove(&anchor);

            for (idx, node) in new.into_iter().enumerate() {
                // the first output inherits the old node's anchor so the
                // covered range stays identical
                let key = if idx == 0 {
                    anchor.clone()
                } else {
                    node.routing_key.clone()
                };

                nodes.insert(key, node);
            }

            self.graveyard
                .lock()
                .expect("lock is poisoned")
                .push(old.clone());
        }
    }

    /// Drains graveyard entries nothing refers to anymore.
    ///
    /// A single strong reference means only the graveyard itself still
    /// holds the node: no reader or task can touch the file.
    #[must_use]
    pub fn reap_graveyard(&self) -> Vec<Arc<Node>> {
        #[allow(clippy::expect_used)]
        let mut graveyard = self.graveyard.lock().expect("lock is poisoned");

        let mut reaped = vec![];
        let mut idx = 0;

        while idx < graveyard.len() {
            #[allow(clippy::indexing_slicing)]
            if Arc::strong_count(&graveyard[idx]) == 1 {
                reaped.push(graveyard.swap_remove(idx));
            } else {
                idx += 1;
            }
        }

        reaped
    }

    #[must_use]
    pub fn graveyard_len(&self) -> usize {
        #[allow(clippy::expect_used)]
        self.graveyard.lock().expect("lock is poisoned").len()
    }

    /// Whether any graveyard entry has lost its last reader.
    #[must_use]
    pub fn graveyard_reapable(&self) -> bool {
        #[allow(clippy::expect_used)]
        self.graveyard
            .lock()
            .expect("lock is poisoned")
            .iter()
            .any(|node| Arc::strong_count(node) == 1)
    }

    /// Total bytes buffered in memory indices. Quota waits test this
    /// accumulator (branching is what releases it).
    #[must_use]
    pub fn mem_size(&self) -> u64 {
        self.nodes().iter().map(|node| node.mem_size()).sum()
    }

    /// Total stored branch bytes. The planner's compact and lru ordering
    /// reads this accumulator, never the memory one.
    #[must_use]
    pub fn disk_size(&self) -> u64 {
        self.nodes().iter().map(|node| node.disk_size()).sum()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::Slice;
    use test_log::test;

    fn node(dir: &std::path::Path, id: NodeId, key: &str) -> Arc<Node> {
        Node::create(dir, id, Slice::from(key)).unwrap()
    }

    #[test]
    fn tree_routes_to_owning_node() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;

        let tree = Tree::new(vec![
            node(dir.path(), 1, ""),
            node(dir.path(), 2, "m"),
        ]);

        assert_eq!(1, tree.route(b"a").id);
        assert_eq!(1, tree.route(b"lzz").id);
        assert_eq!(2, tree.route(b"m").id);
        assert_eq!(2, tree.route(b"zzz").id);

        Ok(())
    }

    #[test]
    fn tree_replace_keeps_coverage() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;

        let first = node(dir.path(), 1, "");
        let tree = Tree::new(vec![first.clone()]);

        // split into two
        let left = node(dir.path(), 2, "");
        let right = node(dir.path(), 3, "m");
        tree.replace(&first, vec![left, right]);

        assert_eq!(2, tree.node_count());
        assert_eq!(2, tree.route(b"a").id);
        assert_eq!(3, tree.route(b"z").id);

        assert_eq!(1, tree.graveyard_len());

        Ok(())
    }

    #[test]
    fn tree_graveyard_reaps_only_unreferenced() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;

        let first = node(dir.path(), 1, "");
        let tree = Tree::new(vec![first.clone()]);

        tree.replace(&first, vec![node(dir.path(), 2, "")]);

        // `first` is still held here
        drop(first);

        let reaped = tree.reap_graveyard();
        assert_eq!(1, reaped.len());
        assert_eq!(0, tree.graveyard_len());

        Ok(())
    }
}
