// Ring maintenance via T-Man style gossip
//
// Each node runs one ring maintenance process that converges its
// neighborhood to the true ring topology under joins, graceful leaves,
// crashes and zombies. Peers periodically exchange gossip buffers framed
// around each other's position; newly discovered peers are probed before
// admission so a node that is leaving or already gone never enters the
// neighborhood. All repair is eventual: lost messages are compensated by
// the next stabilization round.

use crate::error::Result;
use crate::keyspace::Interval;
use crate::overlay::cyclon::CacheMessage;
use crate::overlay::neighborhood::Neighborhood;
use crate::runtime::{
    spawn_process, Context, Control, Envelope, Payload, ProcessHandler, ProcessOpts, ProcessRef,
    Registry, Transition,
};
use crate::types::{NodeDescriptor, ProcessAddr};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Bound on the graceful predecessor-removal retry loop; beyond this the
/// repair is left to ordinary gossip
const MAX_PRED_REMOVAL_RETRIES: u8 = 3;

/// Ring maintenance protocol messages
#[derive(Debug, Clone)]
pub enum RmMessage {
    /// Periodic stabilization trigger
    Trigger,

    /// A peer requests our best view near it
    Buffer {
        nbh: Neighborhood,
        req_preds_min: usize,
        req_succs_min: usize,
    },

    /// Reply to an earlier buffer of ours
    BufferResponse { nbh: Neighborhood },

    /// Probe a candidate peer before admission
    GetNodeDetails { reply_to: ProcessAddr },

    /// Probe reply
    GetNodeDetailsResponse { details: NodeDetails },

    /// Introspect the current neighborhood
    GetNeighborhood { reply_to: ProcessAddr },

    /// Reply to [`RmMessage::GetNeighborhood`]
    NeighborhoodResponse { nbh: Neighborhood },

    /// A new predecessor announced itself
    NewPred { node: NodeDescriptor },

    /// A new successor announced itself
    NewSucc { node: NodeDescriptor },

    /// Graceful removal of a predecessor, supplying its own predecessor
    RemovePred {
        old: NodeDescriptor,
        pred_of_old: NodeDescriptor,
    },

    /// Graceful removal of a successor, supplying its own successor
    RemoveSucc {
        old: NodeDescriptor,
        succ_of_old: NodeDescriptor,
    },

    /// This node's own descriptor changed
    UpdateNode { new_me: NodeDescriptor },

    /// Crash notice from the failure detector
    CrashedNode { addr: ProcessAddr },

    /// A previously crashed node was observed alive again
    ZombieNode { node: NodeDescriptor },

    /// Leave the ring gracefully
    Leave,
}

impl RmMessage {
    /// Coarse message tag
    pub fn tag(&self) -> &'static str {
        match self {
            RmMessage::Trigger => "rm_trigger",
            RmMessage::Buffer { .. } => "rm_buffer",
            RmMessage::BufferResponse { .. } => "rm_buffer_response",
            RmMessage::GetNodeDetails { .. } => "rm_get_node_details",
            RmMessage::GetNodeDetailsResponse { .. } => "rm_get_node_details_response",
            RmMessage::GetNeighborhood { .. } => "rm_get_neighborhood",
            RmMessage::NeighborhoodResponse { .. } => "rm_neighborhood_response",
            RmMessage::NewPred { .. } => "rm_new_pred",
            RmMessage::NewSucc { .. } => "rm_new_succ",
            RmMessage::RemovePred { .. } => "rm_remove_pred",
            RmMessage::RemoveSucc { .. } => "rm_remove_succ",
            RmMessage::UpdateNode { .. } => "rm_update_node",
            RmMessage::CrashedNode { .. } => "rm_crashed_node",
            RmMessage::ZombieNode { .. } => "rm_zombie_node",
            RmMessage::Leave => "rm_leave",
        }
    }
}

/// Probe reply body
#[derive(Debug, Clone)]
pub struct NodeDetails {
    /// The probed node's current descriptor
    pub node: NodeDescriptor,

    /// Whether the node is about to leave the ring
    pub is_leaving: bool,
}

/// Ring maintenance configuration
#[derive(Debug, Clone)]
pub struct RmConfig {
    /// Bound on the predecessor list
    pub pred_list_length: usize,

    /// Bound on the successor list
    pub succ_list_length: usize,

    /// Upper bound for the adaptive random view size
    pub max_cache_size: usize,

    /// Gossip period
    pub stabilization_interval_base: Duration,

    /// The random peer source
    pub cache_addr: ProcessAddr,
}

/// Outstanding graceful predecessor-removal retry
#[derive(Debug, Clone)]
struct PredRemovalRetry {
    /// The predecessor the leaving node told us to adopt
    expected: NodeDescriptor,

    /// The node we probed because it showed up as predecessor instead
    probed: ProcessAddr,

    /// Retries performed so far
    attempts: u8,
}

/// Ring maintenance state
#[derive(Debug, Clone)]
pub struct RmState {
    /// The neighborhood views
    nbh: Neighborhood,

    /// Adaptive random view size; grows on successful exchanges, reset on
    /// confirmed removals
    rand_view_size: usize,

    /// Last peer sample delivered by the random peer source
    cache: Vec<NodeDescriptor>,

    /// Whether the last neighborhood update changed any entry
    churn: bool,

    /// Whether this node announced a graceful leave
    leaving: bool,

    /// Outstanding predecessor-removal retry, if any
    pending_pred_removal: Option<PredRemovalRetry>,
}

impl RmState {
    /// Create the initial state around `me`, seeded with known peers
    pub fn new(me: NodeDescriptor, seeds: Vec<NodeDescriptor>, cfg: &RmConfig) -> Self {
        let nbh = Neighborhood::from_pool(
            me,
            seeds.iter().cloned(),
            cfg.pred_list_length,
            cfg.succ_list_length,
        );
        Self {
            nbh,
            rand_view_size: 1,
            cache: seeds,
            churn: false,
            leaving: false,
            pending_pred_removal: None,
        }
    }

    /// The current neighborhood
    pub fn neighborhood(&self) -> &Neighborhood {
        &self.nbh
    }

    /// The adaptive random view size
    pub fn rand_view_size(&self) -> usize {
        self.rand_view_size
    }

    /// Whether the last update changed the neighborhood
    pub fn churn(&self) -> bool {
        self.churn
    }
}

/// The ring maintenance process handler
pub struct RingMaintenance {
    cfg: RmConfig,
}

impl RingMaintenance {
    /// Create a handler with the given configuration
    pub fn new(cfg: RmConfig) -> Self {
        Self { cfg }
    }

    /// One stabilization round: request fresh random peers and gossip our
    /// view to the immediate neighbors. A node alone on the ring stays
    /// quiet; a joining peer will contact it.
    fn periodic_action(&self, state: &mut RmState, ctx: &Context<'_>) {
        if !state.nbh.has_real_pred() && !state.nbh.has_real_succ() {
            debug!("alone on the ring, skipping gossip round");
            return;
        }

        ctx.send(
            &self.cfg.cache_addr,
            Payload::Cache(CacheMessage::Request {
                count: state.rand_view_size.max(1),
                reply_to: ctx.self_addr().clone(),
            }),
        );

        let view = self.random_view(state);
        let succ = if state.nbh.has_real_succ() {
            Some(state.nbh.succ().clone())
        } else {
            view.first().cloned()
        };
        let pred = if state.nbh.has_real_pred() {
            Some(state.nbh.pred().clone())
        } else {
            view.first().cloned()
        };

        let Some(succ) = succ.or_else(|| pred.clone()) else {
            return;
        };
        let pred = pred.unwrap_or_else(|| succ.clone());

        let req_preds_min = self
            .cfg
            .pred_list_length
            .saturating_sub(state.nbh.preds().len());
        let req_succs_min = self
            .cfg
            .succ_list_length
            .saturating_sub(state.nbh.succs().len());

        let buffer = RmMessage::Buffer {
            nbh: state.nbh.clone(),
            req_preds_min,
            req_succs_min,
        };
        ctx.send_with_shepherd(&succ.addr, Payload::Rm(buffer.clone()), ctx.self_addr());
        if pred.addr != succ.addr {
            ctx.send_with_shepherd(&pred.addr, Payload::Rm(buffer), ctx.self_addr());
        }
    }

    /// Up to `rand_view_size` distinct peers from the last cache sample
    fn random_view(&self, state: &RmState) -> Vec<NodeDescriptor> {
        let mut out: Vec<NodeDescriptor> = Vec::new();
        for peer in &state.cache {
            if out.len() >= state.rand_view_size {
                break;
            }
            if peer.addr == state.nbh.me().addr {
                continue;
            }
            if out.iter().any(|p| p.addr == peer.addr) {
                continue;
            }
            out.push(peer.clone());
        }
        out
    }

    /// Absorb a foreign view: adopt newer versions for known processes in
    /// place, and probe processes we have not seen before. New peers only
    /// enter the neighborhood once their probe confirms them.
    fn trigger_update(
        &self,
        state: &mut RmState,
        rand_view: &[NodeDescriptor],
        other: Option<&Neighborhood>,
        ctx: &Context<'_>,
    ) {
        let mut foreign: Vec<NodeDescriptor> = rand_view.to_vec();
        if let Some(other) = other {
            foreign.push(other.me().clone());
            foreign.extend(other.entries().into_iter().cloned());
        }
        if foreign.is_empty() {
            return;
        }

        state.nbh.update_ids(&foreign);

        let mut candidate = state.nbh.clone();
        candidate.add_nodes(
            rand_view,
            self.cfg.pred_list_length,
            self.cfg.succ_list_length,
        );
        if let Some(other) = other {
            candidate.merge_from(other, self.cfg.pred_list_length, self.cfg.succ_list_length);
        }

        let me_addr = state.nbh.me().addr.clone();
        for newcomer in candidate.entries() {
            if newcomer.addr != me_addr && !state.nbh.contains(&newcomer.addr) {
                debug!("probing new peer {}", newcomer.addr);
                self.probe(ctx, &newcomer.addr);
            }
        }
    }

    fn probe(&self, ctx: &Context<'_>, target: &ProcessAddr) {
        ctx.send(
            target,
            Payload::Rm(RmMessage::GetNodeDetails {
                reply_to: ctx.self_addr().clone(),
            }),
        );
    }

    /// Apply an add/remove set to the neighborhood. Confirmed removals
    /// reset the adaptive view size; suspected crashes feed the dead-node
    /// suspicion list; a changed immediate neighbor triggers an immediate
    /// gossip round.
    fn update_nodes(
        &self,
        state: &mut RmState,
        ctx: &Context<'_>,
        add: &[NodeDescriptor],
        remove: &[ProcessAddr],
        suspect: bool,
    ) {
        let old = state.nbh.clone();

        if !remove.is_empty() {
            let cache_addr = self.cfg.cache_addr.clone();
            let mut report = |gone: &NodeDescriptor| {
                if suspect {
                    ctx.send(
                        &cache_addr,
                        Payload::Cache(CacheMessage::AddZombieCandidate { node: gone.clone() }),
                    );
                }
            };
            state
                .nbh
                .filter(|n| !remove.contains(&n.addr), Some(&mut report));
            state.cache.retain(|p| !remove.contains(&p.addr));
        }

        if !add.is_empty() {
            state
                .nbh
                .add_nodes(add, self.cfg.pred_list_length, self.cfg.succ_list_length);
        }

        let churn = state.nbh != old;
        state.churn = churn;
        if churn && !remove.is_empty() {
            state.rand_view_size = 0;
        }

        let pred_changed = old.pred().addr != state.nbh.pred().addr;
        let succ_changed = old.succ().addr != state.nbh.succ().addr;
        if churn && (pred_changed || succ_changed) {
            debug!("immediate neighbor changed, gossiping immediately");
            self.periodic_action(state, ctx);
        }
    }

    /// Build the reply to a gossip buffer: our best view framed around the
    /// sender, narrowed to the arcs next to it while honoring the
    /// requested minima on both sides.
    fn build_buffer_reply(
        &self,
        state: &RmState,
        other: &Neighborhood,
        req_preds_min: usize,
        req_succs_min: usize,
    ) -> Neighborhood {
        let mut pool: Vec<NodeDescriptor> = vec![state.nbh.me().clone()];
        pool.extend(state.nbh.entries().into_iter().cloned());
        pool.extend(self.random_view(state));

        let mut reply = Neighborhood::from_pool(
            other.me().clone(),
            pool,
            self.cfg.pred_list_length,
            self.cfg.succ_list_length,
        );

        let pred_edge = other.preds().last().unwrap_or(other.me());
        let succ_edge = other.succs().last().unwrap_or(other.me());
        let near = Interval::open(pred_edge.id, other.me().id)
            .union(&Interval::open(other.me().id, succ_edge.id));

        let keep_preds = keep_near(reply.preds(), &near, req_preds_min);
        let keep_succs = keep_near(reply.succs(), &near, req_succs_min);
        reply.filter(
            |n| keep_preds.contains(&n.addr) || keep_succs.contains(&n.addr),
            None,
        );
        reply
    }

    /// Fresh random peers arrived: a successful exchange grows the view
    /// size, and the sample is absorbed like any foreign view.
    fn on_cache_response(
        &self,
        state: &mut RmState,
        peers: Vec<NodeDescriptor>,
        ctx: &Context<'_>,
    ) {
        let me_addr = state.nbh.me().addr.clone();
        let mut fresh: Vec<NodeDescriptor> = Vec::new();
        for peer in peers {
            if peer.addr != me_addr && !fresh.iter().any(|p| p.addr == peer.addr) {
                fresh.push(peer);
            }
        }
        state.cache = fresh;
        state.rand_view_size = (state.rand_view_size + 1).min(self.cfg.max_cache_size);

        let view = self.random_view(state);
        self.trigger_update(state, &view, None, ctx);
    }

    /// After a graceful predecessor removal, verify that the predecessor
    /// we ended up with is the one the leaving node announced; otherwise
    /// probe the interloper, bounded by a small retry budget.
    fn check_pred_removal(
        &self,
        state: &mut RmState,
        ctx: &Context<'_>,
        expected: NodeDescriptor,
        attempts: u8,
    ) {
        if !state.nbh.has_real_pred() || state.nbh.pred().addr == expected.addr {
            state.pending_pred_removal = None;
            return;
        }
        if attempts >= MAX_PRED_REMOVAL_RETRIES {
            debug!(
                "predecessor removal retries exhausted, leaving repair to gossip (expected {})",
                expected.addr
            );
            state.pending_pred_removal = None;
            return;
        }
        let current = state.nbh.pred().clone();
        state.pending_pred_removal = Some(PredRemovalRetry {
            expected,
            probed: current.addr.clone(),
            attempts,
        });
        self.probe(ctx, &current.addr);
    }

    fn on_probe_response(&self, state: &mut RmState, ctx: &Context<'_>, details: NodeDetails) {
        let pending = state
            .pending_pred_removal
            .as_ref()
            .filter(|p| p.probed == details.node.addr)
            .cloned();

        if details.is_leaving {
            debug!("probe refused, {} is leaving", details.node.addr);
            if let Some(pending) = pending {
                // The interloping predecessor is on its way out as well:
                // drop it and retry the removal.
                state.pending_pred_removal = None;
                self.update_nodes(
                    state,
                    ctx,
                    &[pending.expected.clone()],
                    &[details.node.addr.clone()],
                    false,
                );
                self.check_pred_removal(state, ctx, pending.expected, pending.attempts + 1);
            }
            return;
        }

        if pending.is_some() {
            // Alive and staying: the differing predecessor is legitimate
            state.pending_pred_removal = None;
        }
        self.update_nodes(state, ctx, &[details.node], &[], false);
    }
}

impl ProcessHandler<RmState> for RingMaintenance {
    fn handle(
        &mut self,
        env: Envelope,
        mut state: RmState,
        ctx: &Context<'_>,
    ) -> Result<Transition<RmState>> {
        let msg = match env.payload {
            Payload::Rm(msg) => msg,
            Payload::Cache(CacheMessage::Response { peers }) => {
                self.on_cache_response(&mut state, peers, ctx);
                return Ok(Transition::Next(state));
            }
            Payload::Control(Control::SendError { original, .. }) => {
                // An unreachable peer is handled like a crash
                debug!("send to {} failed, removing from neighborhood", original.dst);
                self.update_nodes(&mut state, ctx, &[], &[original.dst.clone()], true);
                return Ok(Transition::Next(state));
            }
            _ => return Ok(Transition::Unknown(state)),
        };

        match msg {
            RmMessage::Trigger => {
                ctx.send_after(
                    self.cfg.stabilization_interval_base,
                    ctx.self_addr(),
                    Payload::Rm(RmMessage::Trigger),
                );
                self.periodic_action(&mut state, ctx);
            }
            RmMessage::Buffer {
                nbh,
                req_preds_min,
                req_succs_min,
            } => {
                let reply = self.build_buffer_reply(&state, &nbh, req_preds_min, req_succs_min);
                ctx.send_with_shepherd(
                    &nbh.me().addr,
                    Payload::Rm(RmMessage::BufferResponse { nbh: reply }),
                    ctx.self_addr(),
                );
                self.trigger_update(&mut state, &[], Some(&nbh), ctx);
            }
            RmMessage::BufferResponse { nbh } => {
                let view = self.random_view(&state);
                self.trigger_update(&mut state, &view, Some(&nbh), ctx);
            }
            RmMessage::GetNodeDetails { reply_to } => {
                let details = NodeDetails {
                    node: state.nbh.me().clone(),
                    is_leaving: state.leaving,
                };
                ctx.send(
                    &reply_to,
                    Payload::Rm(RmMessage::GetNodeDetailsResponse { details }),
                );
            }
            RmMessage::GetNodeDetailsResponse { details } => {
                self.on_probe_response(&mut state, ctx, details);
            }
            RmMessage::GetNeighborhood { reply_to } => {
                ctx.send(
                    &reply_to,
                    Payload::Rm(RmMessage::NeighborhoodResponse {
                        nbh: state.nbh.clone(),
                    }),
                );
            }
            RmMessage::NeighborhoodResponse { .. } => {
                // Replies are consumed by whoever asked, not by us
                return Ok(Transition::Unknown(state));
            }
            RmMessage::NewPred { node } | RmMessage::NewSucc { node } => {
                self.update_nodes(&mut state, ctx, &[node], &[], false);
            }
            RmMessage::RemovePred { old, pred_of_old } => {
                self.update_nodes(
                    &mut state,
                    ctx,
                    &[pred_of_old.clone()],
                    &[old.addr.clone()],
                    false,
                );
                self.check_pred_removal(&mut state, ctx, pred_of_old, 0);
            }
            RmMessage::RemoveSucc { old, succ_of_old } => {
                self.update_nodes(&mut state, ctx, &[succ_of_old], &[old.addr], false);
            }
            RmMessage::UpdateNode { new_me } => {
                state.nbh.update_me(new_me);
            }
            RmMessage::CrashedNode { addr } => {
                info!("removing crashed node {}", addr);
                self.update_nodes(&mut state, ctx, &[], &[addr], true);
            }
            RmMessage::ZombieNode { node } => {
                info!("re-admitting zombie node {}", node.addr);
                self.update_nodes(&mut state, ctx, &[node], &[], false);
            }
            RmMessage::Leave => {
                state.leaving = true;
                let me = state.nbh.me().clone();
                if state.nbh.has_real_pred() || state.nbh.has_real_succ() {
                    let pred = state.nbh.pred().clone();
                    let succ = state.nbh.succ().clone();
                    ctx.send(
                        &pred.addr,
                        Payload::Rm(RmMessage::RemoveSucc {
                            old: me.clone(),
                            succ_of_old: succ.clone(),
                        }),
                    );
                    ctx.send(
                        &succ.addr,
                        Payload::Rm(RmMessage::RemovePred {
                            old: me,
                            pred_of_old: pred,
                        }),
                    );
                }
                info!("leaving the ring");
                return Ok(Transition::Kill);
            }
        }

        Ok(Transition::Next(state))
    }
}

/// Keep the addresses of entries inside the arcs near the sender, backed
/// up by the closest entries until the requested minimum is met
fn keep_near(
    entries: &[NodeDescriptor],
    near: &Interval,
    min_keep: usize,
) -> HashSet<ProcessAddr> {
    let mut kept: HashSet<ProcessAddr> = entries
        .iter()
        .filter(|n| near.contains(n.id))
        .map(|n| n.addr.clone())
        .collect();
    if kept.len() < min_keep {
        for n in entries {
            if kept.len() >= min_keep {
                break;
            }
            kept.insert(n.addr.clone());
        }
    }
    kept
}

/// Spawn a ring maintenance process. The descriptor's address doubles as
/// the process address; the first stabilization round is kicked off
/// immediately.
pub fn spawn_ring_maintenance(
    registry: &Arc<Registry>,
    me: NodeDescriptor,
    seeds: Vec<NodeDescriptor>,
    cfg: RmConfig,
) -> Result<ProcessRef> {
    let addr = me.addr.clone();
    let state = RmState::new(me, seeds, &cfg);
    let proc = spawn_process(
        registry,
        addr,
        Box::new(RingMaintenance::new(cfg)),
        state,
        ProcessOpts::default(),
    )?;
    registry.deliver(
        Envelope::new(
            proc.addr().clone(),
            proc.addr().clone(),
            Payload::Rm(RmMessage::Trigger),
        ),
        None,
    );
    Ok(proc)
}
