// Neighborhood views for ring maintenance
//
// A neighborhood is a node's ordered local view of the ring: bounded lists
// of predecessors and successors around its own descriptor. Predecessors
// are sorted by increasing counterclockwise distance (immediate
// predecessor first), successors by increasing clockwise distance
// (immediate successor first); truncation drops the farthest entries.
// Entries are unique per list by process address and a newer-version
// descriptor for a known process always replaces the stored one.

use crate::types::{NodeDescriptor, ProcessAddr};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A node's local view of its ring neighbors
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Neighborhood {
    /// This node's own descriptor
    me: NodeDescriptor,

    /// Predecessors, immediate first
    preds: Vec<NodeDescriptor>,

    /// Successors, immediate first
    succs: Vec<NodeDescriptor>,
}

impl Neighborhood {
    /// Initial two-element neighborhood
    pub fn new(
        pred: NodeDescriptor,
        me: NodeDescriptor,
        succ: NodeDescriptor,
        pred_len: usize,
        succ_len: usize,
    ) -> Self {
        Self::from_pool(me, [pred, succ], pred_len, succ_len)
    }

    /// Neighborhood of a node that knows nobody but itself
    pub fn solitary(me: NodeDescriptor) -> Self {
        Self {
            me,
            preds: Vec::new(),
            succs: Vec::new(),
        }
    }

    /// Build a neighborhood around `me` from a pool of candidate
    /// descriptors. Entries equal to `me` by address are skipped;
    /// duplicate addresses keep the newer version.
    pub fn from_pool(
        me: NodeDescriptor,
        pool: impl IntoIterator<Item = NodeDescriptor>,
        pred_len: usize,
        succ_len: usize,
    ) -> Self {
        let mut nbh = Self::solitary(me);
        let nodes: Vec<NodeDescriptor> = pool.into_iter().collect();
        nbh.add_nodes(&nodes, pred_len, succ_len);
        nbh
    }

    /// This node's descriptor
    pub fn me(&self) -> &NodeDescriptor {
        &self.me
    }

    /// Replace this node's own descriptor if the new one supersedes it
    pub fn update_me(&mut self, new_me: NodeDescriptor) {
        if new_me.addr == self.me.addr && new_me.version >= self.me.version {
            self.me = new_me;
        }
    }

    /// The immediate predecessor, or `me` when none is known
    pub fn pred(&self) -> &NodeDescriptor {
        self.preds.first().unwrap_or(&self.me)
    }

    /// The immediate successor, or `me` when none is known
    pub fn succ(&self) -> &NodeDescriptor {
        self.succs.first().unwrap_or(&self.me)
    }

    /// Predecessor list, immediate first
    pub fn preds(&self) -> &[NodeDescriptor] {
        &self.preds
    }

    /// Successor list, immediate first
    pub fn succs(&self) -> &[NodeDescriptor] {
        &self.succs
    }

    /// Whether the first predecessor is a process other than `me`
    pub fn has_real_pred(&self) -> bool {
        self.preds.first().map(|n| n.addr != self.me.addr).unwrap_or(false)
    }

    /// Whether the first successor is a process other than `me`
    pub fn has_real_succ(&self) -> bool {
        self.succs.first().map(|n| n.addr != self.me.addr).unwrap_or(false)
    }

    /// All known neighbors, deduplicated by address
    pub fn entries(&self) -> Vec<&NodeDescriptor> {
        let mut seen: Vec<&ProcessAddr> = Vec::new();
        let mut out = Vec::new();
        for n in self.preds.iter().chain(self.succs.iter()) {
            if !seen.contains(&&n.addr) {
                seen.push(&n.addr);
                out.push(n);
            }
        }
        out
    }

    /// Whether a process is present in either list
    pub fn contains(&self, addr: &ProcessAddr) -> bool {
        self.preds.iter().chain(self.succs.iter()).any(|n| n.addr == *addr)
    }

    /// Insert nodes, keeping the newer version for known processes,
    /// re-sorting by ring distance and truncating each side
    pub fn add_nodes(&mut self, nodes: &[NodeDescriptor], pred_len: usize, succ_len: usize) {
        let mut pool: HashMap<ProcessAddr, NodeDescriptor> = HashMap::new();
        for n in self.entries() {
            pool.insert(n.addr.clone(), n.clone());
        }
        for n in nodes {
            if n.addr == self.me.addr {
                continue;
            }
            match pool.get(&n.addr) {
                Some(existing) if existing.version >= n.version => {}
                _ => {
                    pool.insert(n.addr.clone(), n.clone());
                }
            }
        }
        self.rebuild(pool.into_values().collect(), pred_len, succ_len);
    }

    /// Adopt incoming descriptors for already-known processes when their
    /// version is higher. New processes are ignored.
    pub fn update_ids(&mut self, nodes: &[NodeDescriptor]) {
        for incoming in nodes {
            for slot in self.preds.iter_mut().chain(self.succs.iter_mut()) {
                if incoming.supersedes(slot) {
                    *slot = incoming.clone();
                }
            }
        }
        let me = self.me.clone();
        sort_by_ccw_distance(&mut self.preds, &me);
        sort_by_cw_distance(&mut self.succs, &me);
    }

    /// Drop entries failing the predicate, invoking the callback once per
    /// removed process
    pub fn filter<F>(&mut self, keep: F, mut on_remove: Option<&mut dyn FnMut(&NodeDescriptor)>)
    where
        F: Fn(&NodeDescriptor) -> bool,
    {
        let removed: Vec<NodeDescriptor> = self
            .entries()
            .into_iter()
            .filter(|&n| !keep(n))
            .cloned()
            .collect();
        if removed.is_empty() {
            return;
        }
        if let Some(callback) = on_remove.as_mut() {
            for gone in &removed {
                callback(gone);
            }
        }
        self.preds.retain(|n| keep(n));
        self.succs.retain(|n| keep(n));
    }

    /// Union with another neighborhood (including its `me` descriptor),
    /// keeping newer versions and truncating to the given bounds
    pub fn merge_from(&mut self, other: &Neighborhood, pred_len: usize, succ_len: usize) {
        let mut incoming: Vec<NodeDescriptor> = vec![other.me.clone()];
        incoming.extend(other.entries().into_iter().cloned());
        self.add_nodes(&incoming, pred_len, succ_len);
    }

    fn rebuild(&mut self, pool: Vec<NodeDescriptor>, pred_len: usize, succ_len: usize) {
        let me = self.me.clone();
        let mut preds = pool.clone();
        sort_by_ccw_distance(&mut preds, &me);
        preds.truncate(pred_len);

        let mut succs = pool;
        sort_by_cw_distance(&mut succs, &me);
        succs.truncate(succ_len);

        self.preds = preds;
        self.succs = succs;
    }
}

/// Sort closest-counterclockwise first, ties by address
fn sort_by_ccw_distance(nodes: &mut [NodeDescriptor], me: &NodeDescriptor) {
    nodes.sort_by(|a, b| {
        me.id
            .distance_ccw(a.id)
            .cmp(&me.id.distance_ccw(b.id))
            .then_with(|| a.addr.cmp(&b.addr))
    });
}

/// Sort closest-clockwise first, ties by address
fn sort_by_cw_distance(nodes: &mut [NodeDescriptor], me: &NodeDescriptor) {
    nodes.sort_by(|a, b| {
        me.id
            .distance_cw(a.id)
            .cmp(&me.id.distance_cw(b.id))
            .then_with(|| a.addr.cmp(&b.addr))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyspace::RingKey;
    use crate::types::ProcessAddr;

    fn node(name: &str, id: u128) -> NodeDescriptor {
        NodeDescriptor::new(ProcessAddr::new(name), RingKey::new(id), 1)
    }

    fn node_v(name: &str, id: u128, version: u32) -> NodeDescriptor {
        NodeDescriptor::new(ProcessAddr::new(name), RingKey::new(id), version)
    }

    #[test]
    fn orders_by_ring_distance() {
        let me = node("me", 100);
        let nbh = Neighborhood::from_pool(
            me,
            [node("a", 90), node("b", 110), node("c", 95), node("d", 120)],
            4,
            4,
        );

        // Immediate predecessor is the closest counterclockwise
        let pred_addrs: Vec<&str> = nbh.preds().iter().map(|n| n.addr.as_str()).collect();
        assert_eq!(pred_addrs, vec!["c", "a", "d", "b"]);

        // Immediate successor is the closest clockwise
        let succ_addrs: Vec<&str> = nbh.succs().iter().map(|n| n.addr.as_str()).collect();
        assert_eq!(succ_addrs, vec!["b", "d", "a", "c"]);

        assert_eq!(nbh.pred().addr.as_str(), "c");
        assert_eq!(nbh.succ().addr.as_str(), "b");
    }

    #[test]
    fn truncation_drops_farthest() {
        let me = node("me", 100);
        let nbh = Neighborhood::from_pool(
            me,
            [node("a", 90), node("b", 110), node("c", 95), node("d", 120)],
            1,
            2,
        );

        assert_eq!(nbh.preds().len(), 1);
        assert_eq!(nbh.pred().addr.as_str(), "c");
        assert_eq!(nbh.succs().len(), 2);
        assert_eq!(nbh.succs()[1].addr.as_str(), "d");
    }

    #[test]
    fn same_process_never_appears_twice() {
        let me = node("me", 100);
        let mut nbh = Neighborhood::from_pool(me, [node("a", 90)], 4, 4);
        nbh.add_nodes(&[node_v("a", 90, 2), node("b", 110)], 4, 4);

        let all = nbh.entries();
        assert_eq!(all.len(), 2);
        let a = all.iter().find(|n| n.addr.as_str() == "a").expect("a");
        assert_eq!(a.version, 2);
    }

    #[test]
    fn me_never_appears_in_lists() {
        let me = node("me", 100);
        let mut nbh = Neighborhood::solitary(me.clone());
        nbh.add_nodes(&[me.clone(), node("a", 90)], 4, 4);

        assert!(!nbh.contains(&me.addr));
        assert!(nbh.contains(&ProcessAddr::new("a")));
    }

    #[test]
    fn versions_are_monotonic() {
        let me = node("me", 100);
        let mut nbh = Neighborhood::from_pool(me, [node_v("a", 90, 3)], 4, 4);

        // A stale descriptor must not replace a newer one
        nbh.add_nodes(&[node_v("a", 90, 2)], 4, 4);
        assert_eq!(nbh.pred().version, 3);
        nbh.update_ids(&[node_v("a", 90, 2)]);
        assert_eq!(nbh.pred().version, 3);

        // A newer one supersedes in place
        nbh.update_ids(&[node_v("a", 90, 5)]);
        assert_eq!(nbh.pred().version, 5);
    }

    #[test]
    fn update_ids_ignores_unknown_processes() {
        let me = node("me", 100);
        let mut nbh = Neighborhood::from_pool(me, [node("a", 90)], 4, 4);
        nbh.update_ids(&[node("stranger", 50)]);
        assert!(!nbh.contains(&ProcessAddr::new("stranger")));
    }

    #[test]
    fn filter_reports_each_removed_process_once() {
        let me = node("me", 100);
        // "a" lands in both views of a two-node ring
        let mut nbh = Neighborhood::from_pool(me, [node("a", 90), node("b", 110)], 2, 2);
        assert!(nbh.preds().iter().any(|n| n.addr.as_str() == "a"));
        assert!(nbh.succs().iter().any(|n| n.addr.as_str() == "a"));

        let mut removed = Vec::new();
        let mut on_remove = |n: &NodeDescriptor| removed.push(n.addr.clone());
        nbh.filter(|n| n.addr.as_str() != "a", Some(&mut on_remove));

        assert_eq!(removed, vec![ProcessAddr::new("a")]);
        assert!(!nbh.contains(&ProcessAddr::new("a")));
        assert!(nbh.contains(&ProcessAddr::new("b")));
    }

    #[test]
    fn two_node_ring_shares_pred_and_succ() {
        let me = node("me", 0);
        let nbh = Neighborhood::from_pool(me, [node("peer", 1 << 127)], 4, 4);
        assert_eq!(nbh.pred().addr.as_str(), "peer");
        assert_eq!(nbh.succ().addr.as_str(), "peer");
        assert!(nbh.has_real_pred());
        assert!(nbh.has_real_succ());
    }

    #[test]
    fn solitary_node_has_no_real_neighbors() {
        let nbh = Neighborhood::solitary(node("me", 0));
        assert!(!nbh.has_real_pred());
        assert!(!nbh.has_real_succ());
        assert_eq!(nbh.pred().addr.as_str(), "me");
        assert_eq!(nbh.succ().addr.as_str(), "me");
    }

    #[test]
    fn merge_keeps_newer_versions_and_bounds() {
        let me = node("me", 100);
        let mut left = Neighborhood::from_pool(me, [node_v("a", 90, 1), node("b", 110)], 2, 2);
        let other =
            Neighborhood::from_pool(node("other", 120), [node_v("a", 90, 4), node("c", 130)], 2, 2);

        left.merge_from(&other, 2, 2);

        assert!(left.contains(&ProcessAddr::new("other")));
        let a = left
            .entries()
            .into_iter()
            .find(|n| n.addr.as_str() == "a")
            .expect("a survives");
        assert_eq!(a.version, 4);
        assert!(left.preds().len() <= 2);
        assert!(left.succs().len() <= 2);
    }

    #[test]
    fn distance_ties_break_by_address() {
        let me = node("me", 100);
        // Two distinct processes at the same ring position
        let nbh = Neighborhood::from_pool(me, [node("x", 90), node("w", 90)], 4, 4);
        assert_eq!(nbh.pred().addr.as_str(), "w");
    }
}
