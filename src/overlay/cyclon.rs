// Random peer source for the overlay
//
// Ring maintenance asks this component for uniformly sampled peers and
// consumes the response asynchronously. The cache also keeps the
// dead-node suspicion list: nodes removed on crash notices are parked
// here, and a node that reappears after having been suspected is reported
// back to the owner as a zombie.

use crate::error::Result;
use crate::overlay::rm_tman::RmMessage;
use crate::runtime::{
    spawn_process, Context, Envelope, Payload, ProcessHandler, ProcessOpts, ProcessRef, Registry,
    Transition,
};
use crate::types::{NodeDescriptor, ProcessAddr};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::sync::Arc;
use tracing::{debug, info};

/// Messages understood and emitted by the peer cache
#[derive(Debug, Clone)]
pub enum CacheMessage {
    /// Ask for up to `count` sampled peers
    Request {
        count: usize,
        reply_to: ProcessAddr,
    },

    /// Sampled peers; unordered, may contain the requester itself
    Response { peers: Vec<NodeDescriptor> },

    /// Announce a peer to the cache
    AddPeer { node: NodeDescriptor },

    /// Park a crash-removed node in the suspicion list
    AddZombieCandidate { node: NodeDescriptor },
}

impl CacheMessage {
    /// Coarse message tag
    pub fn tag(&self) -> &'static str {
        match self {
            CacheMessage::Request { .. } => "cache_request",
            CacheMessage::Response { .. } => "cache_response",
            CacheMessage::AddPeer { .. } => "cache_add_peer",
            CacheMessage::AddZombieCandidate { .. } => "cache_add_zombie_candidate",
        }
    }
}

/// Peer cache state
#[derive(Debug, Clone)]
pub struct CacheState {
    /// Known peers
    peers: Vec<NodeDescriptor>,

    /// Dead-node suspicion list
    zombies: Vec<NodeDescriptor>,

    /// Bound on the peer list
    capacity: usize,

    /// Sampling source
    rng: StdRng,
}

impl CacheState {
    /// Create a cache state with the given capacity and initial peers
    pub fn new(capacity: usize, peers: Vec<NodeDescriptor>, seed: u64) -> Self {
        Self {
            peers,
            zombies: Vec::new(),
            capacity,
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

/// The peer cache process handler
pub struct PeerCache {
    /// Ring maintenance process notified about zombies
    owner: ProcessAddr,
}

impl PeerCache {
    /// Create a peer cache reporting zombies to `owner`
    pub fn new(owner: ProcessAddr) -> Self {
        Self { owner }
    }

    fn store_peer(&self, state: &mut CacheState, node: NodeDescriptor) {
        if let Some(existing) = state.peers.iter_mut().find(|p| p.addr == node.addr) {
            if node.version > existing.version {
                *existing = node;
            }
            return;
        }
        if state.peers.len() >= state.capacity {
            state.peers.remove(0);
        }
        state.peers.push(node);
    }
}

impl ProcessHandler<CacheState> for PeerCache {
    fn handle(
        &mut self,
        env: Envelope,
        mut state: CacheState,
        ctx: &Context<'_>,
    ) -> Result<Transition<CacheState>> {
        let Payload::Cache(msg) = env.payload else {
            return Ok(Transition::Unknown(state));
        };

        match msg {
            CacheMessage::Request { count, reply_to } => {
                let sample: Vec<NodeDescriptor> = state
                    .peers
                    .choose_multiple(&mut state.rng, count)
                    .cloned()
                    .collect();
                debug!(
                    "peer cache serving {} of {} requested peers to {}",
                    sample.len(),
                    count,
                    reply_to
                );
                ctx.send(&reply_to, Payload::Cache(CacheMessage::Response { peers: sample }));
            }
            CacheMessage::Response { .. } => {
                // Responses are consumed by the requester, not by the cache
                return Ok(Transition::Unknown(state));
            }
            CacheMessage::AddPeer { node } => {
                if let Some(idx) = state.zombies.iter().position(|z| z.addr == node.addr) {
                    let revived = state.zombies.remove(idx);
                    info!("suspected node {} reappeared, reporting zombie", revived.addr);
                    ctx.send(
                        &self.owner,
                        Payload::Rm(RmMessage::ZombieNode { node: node.clone() }),
                    );
                }
                self.store_peer(&mut state, node);
            }
            CacheMessage::AddZombieCandidate { node } => {
                state.peers.retain(|p| p.addr != node.addr);
                if let Some(existing) = state.zombies.iter_mut().find(|z| z.addr == node.addr) {
                    if node.version > existing.version {
                        *existing = node;
                    }
                } else {
                    debug!("parking {} in the dead-node suspicion list", node.addr);
                    state.zombies.push(node);
                }
            }
        }

        Ok(Transition::Next(state))
    }
}

/// Spawn a peer cache process
pub fn spawn_peer_cache(
    registry: &Arc<Registry>,
    addr: ProcessAddr,
    owner: ProcessAddr,
    capacity: usize,
    initial_peers: Vec<NodeDescriptor>,
    seed: u64,
) -> Result<ProcessRef> {
    spawn_process(
        registry,
        addr,
        Box::new(PeerCache::new(owner)),
        CacheState::new(capacity, initial_peers, seed),
        ProcessOpts::default(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyspace::RingKey;
    use std::time::Duration;

    fn node(name: &str, id: u128) -> NodeDescriptor {
        NodeDescriptor::new(ProcessAddr::new(name), RingKey::new(id), 1)
    }

    #[tokio::test]
    async fn serves_sampled_peers() {
        let registry = Registry::new();
        let mut mb = registry.ephemeral_mailbox().unwrap();
        let cache = spawn_peer_cache(
            &registry,
            ProcessAddr::new("cache"),
            ProcessAddr::new("rm"),
            10,
            vec![node("a", 1), node("b", 2), node("c", 3)],
            7,
        )
        .unwrap();

        registry.deliver(
            Envelope::new(
                mb.addr().clone(),
                cache.addr().clone(),
                Payload::Cache(CacheMessage::Request {
                    count: 2,
                    reply_to: mb.addr().clone(),
                }),
            ),
            None,
        );

        let env = mb.recv_timeout(Duration::from_secs(5)).await.unwrap();
        match env.payload {
            Payload::Cache(CacheMessage::Response { peers }) => assert_eq!(peers.len(), 2),
            other => panic!("expected cache_response, got {}", other.tag()),
        }
    }

    #[tokio::test]
    async fn empty_cache_answers_with_empty_sample() {
        let registry = Registry::new();
        let mut mb = registry.ephemeral_mailbox().unwrap();
        let cache = spawn_peer_cache(
            &registry,
            ProcessAddr::new("cache"),
            ProcessAddr::new("rm"),
            10,
            Vec::new(),
            7,
        )
        .unwrap();

        registry.deliver(
            Envelope::new(
                mb.addr().clone(),
                cache.addr().clone(),
                Payload::Cache(CacheMessage::Request {
                    count: 4,
                    reply_to: mb.addr().clone(),
                }),
            ),
            None,
        );

        let env = mb.recv_timeout(Duration::from_secs(5)).await.unwrap();
        match env.payload {
            Payload::Cache(CacheMessage::Response { peers }) => assert!(peers.is_empty()),
            other => panic!("expected cache_response, got {}", other.tag()),
        }
    }

    #[tokio::test]
    async fn reappearing_suspect_is_reported_as_zombie() {
        let registry = Registry::new();
        // The mailbox plays the ring maintenance owner
        let mut owner = registry.mailbox("rm-owner").unwrap();
        let cache = spawn_peer_cache(
            &registry,
            ProcessAddr::new("cache"),
            owner.addr().clone(),
            10,
            vec![node("a", 1)],
            7,
        )
        .unwrap();

        registry.deliver(
            Envelope::new(
                owner.addr().clone(),
                cache.addr().clone(),
                Payload::Cache(CacheMessage::AddZombieCandidate { node: node("a", 1) }),
            ),
            None,
        );
        registry.deliver(
            Envelope::new(
                owner.addr().clone(),
                cache.addr().clone(),
                Payload::Cache(CacheMessage::AddPeer { node: node("a", 1) }),
            ),
            None,
        );

        let env = owner.recv_timeout(Duration::from_secs(5)).await.unwrap();
        assert!(matches!(
            env.payload,
            Payload::Rm(RmMessage::ZombieNode { ref node }) if node.addr.as_str() == "a"
        ));
    }
}
