// Routing-table behaviors for the overlay
//
// A routing table maps keys to next hops. The capability set is a trait so
// the node can swap implementations; the constant-successor table here is
// sufficient when replica placement is handled by key derivation.

use crate::keyspace::{self, RingKey};
use crate::overlay::neighborhood::Neighborhood;
use crate::types::{NodeDescriptor, ProcessAddr};
use std::fmt;

/// Number of replica keys derived per key
pub const REPLICATION_FACTOR: usize = 4;

/// Capability set of a routing table implementation
pub trait RoutingTable: Send + fmt::Debug {
    /// A table that knows only the local node
    fn empty(me: &NodeDescriptor) -> Self
    where
        Self: Sized;

    /// Map arbitrary bytes onto the ring
    fn hash_key(&self, data: &[u8]) -> RingKey {
        keyspace::hash_key(data)
    }

    /// The node responsible for forwarding towards `key`
    fn next_hop(&self, key: RingKey) -> Option<&NodeDescriptor>;

    /// Rebuild the table from the current neighborhood
    fn init_stabilize(&mut self, nbh: &Neighborhood);

    /// Remove a dead process from the table
    fn filter_dead(&mut self, dead: &ProcessAddr);

    /// Number of table entries
    fn size(&self) -> usize;

    /// Replica keys for `key`, equally spaced on the ring
    fn replicas(&self, key: RingKey) -> Vec<RingKey> {
        replica_keys(key).to_vec()
    }

    /// Table contents for debugging
    fn dump(&self) -> Vec<(RingKey, ProcessAddr)>;
}

/// Derive the four equally spaced replica keys of `key`
pub fn replica_keys(key: RingKey) -> [RingKey; REPLICATION_FACTOR] {
    let quarter = RingKey::QUARTER;
    [
        key,
        key.add(quarter),
        key.add(quarter).add(quarter),
        key.add(quarter).add(quarter).add(quarter),
    ]
}

/// Constant-successor routing table.
///
/// Every key is forwarded to the immediate successor; correctness follows
/// from ring maintenance, replica placement from key derivation.
#[derive(Debug, Clone)]
pub struct SuccessorRouting {
    me: NodeDescriptor,
    succs: Vec<NodeDescriptor>,
}

impl SuccessorRouting {
    /// The local node this table routes for
    pub fn me(&self) -> &NodeDescriptor {
        &self.me
    }
}

impl RoutingTable for SuccessorRouting {
    fn empty(me: &NodeDescriptor) -> Self {
        Self {
            me: me.clone(),
            succs: Vec::new(),
        }
    }

    fn next_hop(&self, _key: RingKey) -> Option<&NodeDescriptor> {
        self.succs.first()
    }

    fn init_stabilize(&mut self, nbh: &Neighborhood) {
        self.me = nbh.me().clone();
        self.succs = nbh.succs().to_vec();
    }

    fn filter_dead(&mut self, dead: &ProcessAddr) {
        self.succs.retain(|n| n.addr != *dead);
    }

    fn size(&self) -> usize {
        self.succs.len()
    }

    fn dump(&self) -> Vec<(RingKey, ProcessAddr)> {
        self.succs.iter().map(|n| (n.id, n.addr.clone())).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyspace::RingKey;

    fn node(name: &str, id: u128) -> NodeDescriptor {
        NodeDescriptor::new(ProcessAddr::new(name), RingKey::new(id), 1)
    }

    #[test]
    fn replica_keys_are_equally_spaced() {
        let k = RingKey::new(17);
        let reps = replica_keys(k);
        assert_eq!(reps[0], k);
        assert_eq!(reps[1], RingKey::new(17 + (1u128 << 126)));
        assert_eq!(reps[2], RingKey::new(17 + (1u128 << 127)));
        assert_eq!(reps[3], RingKey::new(17 + (1u128 << 126) + (1u128 << 127)));

        // Wrap back to the original key after four quarters
        assert_eq!(reps[3].add(RingKey::QUARTER), k);
    }

    #[test]
    fn replica_keys_wrap_modulo_ring() {
        let near_top = RingKey::new(u128::MAX - 1);
        let reps = replica_keys(near_top);
        assert_eq!(reps[2], RingKey::new((1u128 << 127) - 2));
    }

    #[test]
    fn successor_table_follows_the_neighborhood() {
        let me = node("me", 0);
        let mut table = SuccessorRouting::empty(&me);
        assert!(table.next_hop(RingKey::new(5)).is_none());
        assert_eq!(table.size(), 0);

        let nbh = Neighborhood::from_pool(
            me.clone(),
            [node("a", 100), node("b", 200)],
            2,
            2,
        );
        table.init_stabilize(&nbh);
        assert_eq!(table.size(), 2);
        assert_eq!(
            table.next_hop(RingKey::new(5)).map(|n| n.addr.as_str()),
            Some("a")
        );

        table.filter_dead(&ProcessAddr::new("a"));
        assert_eq!(
            table.next_hop(RingKey::new(5)).map(|n| n.addr.as_str()),
            Some("b")
        );
        assert_eq!(table.dump().len(), 1);
    }

    #[test]
    fn hash_key_lands_on_the_ring_deterministically() {
        let me = node("me", 0);
        let table = SuccessorRouting::empty(&me);
        assert_eq!(table.hash_key(b"key"), table.hash_key(b"key"));
        assert_ne!(table.hash_key(b"key"), table.hash_key(b"other"));
    }
}
