// The scheduler process
//
// The scheduler is itself a runtime process, so all trace state is
// serialized by its message loop. It is capture-exempt: its own sends are
// never rerouted back to it. Delivery releases exactly one captured
// message at a time; the next step only happens once the receiving
// handler (or thread) signals completion, a send error stands in for it,
// or the receiver's death monitor fires.

use crate::error::Result;
use crate::runtime::{
    spawn_process, Context, Control, Envelope, Payload, ProcessHandler, ProcessOpts, ProcessRef,
    Registry, Transition,
};
use crate::sched::{DeliveryCallback, SchedError, SchedMessage, SchedReply, TraceInfos};
use crate::types::{ProcessAddr, TraceId};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Ordered pair of processes; messages within a channel stay FIFO
type ChannelKey = (ProcessAddr, ProcessAddr);

/// Trace status
#[derive(Debug, Clone, PartialEq, Eq)]
enum TraceStatus {
    /// Threads are still registering
    New,

    /// Delivering
    Running,

    /// One message is in flight; waiting for handler completion
    Delivered {
        dst: ProcessAddr,
        monitor: crate::runtime::MonitorRef,
    },

    /// All queues drained
    Stopped,
}

/// Per-trace scheduler state
#[derive(Debug, Clone)]
struct TraceState {
    /// Captured messages per channel; only non-empty queues are kept
    queues: BTreeMap<ChannelKey, VecDeque<Envelope>>,

    status: TraceStatus,

    /// Product of per-step fan-outs
    num_possible_executions: u128,

    /// Fan-out recorded at each delivery step
    nums_chosen_from: Vec<usize>,

    /// Delivered messages, rendered for inspection
    delivered: Vec<String>,

    /// Declared number of participating threads
    thread_count: Option<usize>,

    /// Threads that called thread_begin
    begun: Vec<ProcessAddr>,

    /// On-deliver observer
    callback: Option<DeliveryCallback>,

    /// Clients blocked in wait_for_end
    waiters: Vec<ProcessAddr>,

    /// Deferred cleanup requester
    to_be_cleaned: Option<ProcessAddr>,
}

impl TraceState {
    fn new() -> Self {
        Self {
            queues: BTreeMap::new(),
            status: TraceStatus::New,
            num_possible_executions: 1,
            nums_chosen_from: Vec::new(),
            delivered: Vec::new(),
            thread_count: None,
            begun: Vec::new(),
            callback: None,
            waiters: Vec::new(),
            to_be_cleaned: None,
        }
    }

    fn infos(&self) -> TraceInfos {
        let avg = if self.nums_chosen_from.is_empty() {
            0.0
        } else {
            self.nums_chosen_from.iter().sum::<usize>() as f64
                / self.nums_chosen_from.len() as f64
        };
        TraceInfos {
            delivered_msgs: self.delivered.clone(),
            nums_chosen_from: self.nums_chosen_from.clone(),
            avg_branching_factor: avg,
            num_delivered_msgs: self.delivered.len(),
            num_possible_executions: self.num_possible_executions,
        }
    }
}

/// Scheduler state: all traces plus the exploration stream
#[derive(Debug, Clone)]
pub struct SchedState {
    traces: BTreeMap<TraceId, TraceState>,
    rng: StdRng,
}

impl SchedState {
    /// Create the state with a seeded exploration stream
    pub fn new(seed: u64) -> Self {
        Self {
            traces: BTreeMap::new(),
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

/// The scheduler process handler
pub struct ProtoSched;

impl ProtoSched {
    fn reply(&self, ctx: &Context<'_>, client: &ProcessAddr, reply: SchedReply) {
        ctx.send(client, Payload::Sched(SchedMessage::Reply(reply)));
    }

    fn kick(&self, ctx: &Context<'_>, trace: &TraceId) {
        ctx.send(
            ctx.self_addr(),
            Payload::Sched(SchedMessage::Deliver {
                trace: trace.clone(),
            }),
        );
    }

    /// Release remaining queued messages directly into the substrate,
    /// bypassing ordering, and discard the trace
    fn cleanup_now(
        &self,
        state: &mut SchedState,
        ctx: &Context<'_>,
        trace: &TraceId,
        client: ProcessAddr,
    ) {
        if let Some(mut tr) = state.traces.remove(trace) {
            let mut drained = 0usize;
            for (_, mut queue) in std::mem::take(&mut tr.queues) {
                while let Some(mut env) = queue.pop_front() {
                    env.trace = None;
                    ctx.send_direct(env);
                    drained += 1;
                }
            }
            info!(
                "cleaned up trace {} ({} queued messages released unordered)",
                trace, drained
            );
        }
        self.reply(ctx, &client, SchedReply::CleanupDone);
    }

    /// One delivery step of the scheduling loop
    fn deliver_step(&self, state: &mut SchedState, ctx: &Context<'_>, trace: &TraceId) {
        let Some(tr) = state.traces.get_mut(trace) else {
            return;
        };
        if tr.status != TraceStatus::Running {
            return;
        }

        if tr.queues.is_empty() {
            debug!("trace {} drained, stopping", trace);
            tr.status = TraceStatus::Stopped;
            for waiter in tr.waiters.drain(..) {
                ctx.send(&waiter, Payload::Sched(SchedMessage::Reply(SchedReply::WaitDone)));
            }
            if let Some(client) = tr.to_be_cleaned.take() {
                self.cleanup_now(state, ctx, trace, client);
            }
            return;
        }

        // Fan-out: the number of non-empty channels at this step
        let keys: Vec<ChannelKey> = tr.queues.keys().cloned().collect();
        let fan_out = keys.len();
        let choice = state.rng.gen_range(0..fan_out);
        let key = keys[choice].clone();

        tr.num_possible_executions = tr
            .num_possible_executions
            .saturating_mul(fan_out as u128);
        tr.nums_chosen_from.push(fan_out);

        let mut env = match tr.queues.get_mut(&key).and_then(|q| q.pop_front()) {
            Some(env) => env,
            None => return,
        };
        if tr.queues.get(&key).map(|q| q.is_empty()).unwrap_or(false) {
            tr.queues.remove(&key);
        }

        if let Some(callback) = &tr.callback {
            callback.call(&env);
        }
        tr.delivered
            .push(format!("{} -> {} : {}", env.src, env.dst, env.payload.tag()));

        env.trace = Some(trace.clone());
        let dst = env.dst.clone();
        let monitor = ctx.monitor(&dst);
        tr.status = TraceStatus::Delivered {
            dst: dst.clone(),
            monitor,
        };
        debug!(
            "trace {}: delivering {} message on channel {} -> {} (fan-out {})",
            trace,
            env.payload.tag(),
            env.src,
            dst,
            fan_out
        );
        ctx.send_direct_with_shepherd(env, ctx.self_addr());
    }

    /// The in-flight delivery completed (handler done, thread yielded or
    /// ended, send error, or receiver death)
    fn handler_done(&self, state: &mut SchedState, ctx: &Context<'_>, trace: &TraceId) {
        let Some(tr) = state.traces.get_mut(trace) else {
            return;
        };
        match tr.status.clone() {
            TraceStatus::Delivered { dst, monitor } => {
                ctx.demonitor(&dst, monitor);
                tr.status = TraceStatus::Running;
                if let Some(client) = tr.to_be_cleaned.take() {
                    self.cleanup_now(state, ctx, trace, client);
                } else {
                    self.kick(ctx, trace);
                }
            }
            _ => {
                debug!("spurious completion signal for trace {}", trace);
            }
        }
    }

    fn on_capture(&self, state: &mut SchedState, ctx: &Context<'_>, mut env: Envelope) {
        let Some(trace) = env.trace.clone() else {
            warn!("captured envelope without a trace tag, delivering directly");
            ctx.send_direct(env);
            return;
        };
        let tr = state.traces.entry(trace.clone()).or_insert_with(TraceState::new);
        if tr.status == TraceStatus::Stopped {
            // The trace already drained; late traffic flows unordered
            warn!("late capture for stopped trace {}, delivering directly", trace);
            env.trace = None;
            ctx.send_direct(env);
            return;
        }
        let key = (env.src.clone(), env.dst.clone());
        tr.queues.entry(key).or_default().push_back(env);
        if tr.status == TraceStatus::Running {
            self.kick(ctx, &trace);
        }
    }
}

impl ProcessHandler<SchedState> for ProtoSched {
    fn handle(
        &mut self,
        env: Envelope,
        mut state: SchedState,
        ctx: &Context<'_>,
    ) -> Result<Transition<SchedState>> {
        let msg = match env.payload {
            Payload::Sched(msg) => msg,
            Payload::Control(Control::Down { addr, monitor }) => {
                // A monitored receiver died mid-delivery
                let affected: Vec<TraceId> = state
                    .traces
                    .iter()
                    .filter(|(_, tr)| {
                        matches!(
                            &tr.status,
                            TraceStatus::Delivered { dst, monitor: held }
                                if *dst == addr && *held == monitor
                        )
                    })
                    .map(|(id, _)| id.clone())
                    .collect();
                for trace in affected {
                    debug!("receiver {} died, completing delivery in trace {}", addr, trace);
                    self.handler_done(&mut state, ctx, &trace);
                }
                return Ok(Transition::Next(state));
            }
            Payload::Control(Control::SendError { original, .. }) => {
                // A scheduled delivery could not be handed over
                if let Some(trace) = original.trace.clone() {
                    let delivered_here = state
                        .traces
                        .get(&trace)
                        .map(|tr| {
                            matches!(&tr.status, TraceStatus::Delivered { dst, .. } if *dst == original.dst)
                        })
                        .unwrap_or(false);
                    if delivered_here {
                        debug!(
                            "delivery to {} failed, completing step in trace {}",
                            original.dst, trace
                        );
                        self.handler_done(&mut state, ctx, &trace);
                    }
                }
                return Ok(Transition::Next(state));
            }
            _ => return Ok(Transition::Unknown(state)),
        };

        match msg {
            SchedMessage::ThreadNum { trace, n, client } => {
                let tr = state.traces.entry(trace.clone()).or_insert_with(TraceState::new);
                if tr.thread_count.is_some() {
                    self.reply(ctx, &client, SchedReply::Error(SchedError::ThreadNumAlreadySet));
                } else if !tr.begun.is_empty() {
                    self.reply(ctx, &client, SchedReply::Error(SchedError::ThreadsAlreadyBegun));
                } else {
                    debug!("trace {} expects {} threads", trace, n);
                    tr.thread_count = Some(n);
                    self.reply(ctx, &client, SchedReply::Ok);
                }
            }
            SchedMessage::ThreadBegin { trace, client } => {
                let tr = state.traces.entry(trace.clone()).or_insert_with(TraceState::new);
                if tr.status != TraceStatus::New {
                    self.reply(ctx, &client, SchedReply::Error(SchedError::TraceAlreadyRunning));
                    return Ok(Transition::Next(state));
                }
                // The release message goes through the queues like any
                // other send, so thread start order is explored too.
                let release = Envelope::traced(
                    ctx.self_addr().clone(),
                    client.clone(),
                    trace.clone(),
                    Payload::Sched(SchedMessage::Reply(SchedReply::ThreadReleaseToRun)),
                );
                let key = (ctx.self_addr().clone(), client.clone());
                tr.queues.entry(key).or_default().push_back(release);
                tr.begun.push(client);

                if tr.thread_count == Some(tr.begun.len()) {
                    info!(
                        "all {} threads of trace {} registered, delivery starts",
                        tr.begun.len(),
                        trace
                    );
                    tr.status = TraceStatus::Running;
                    self.kick(ctx, &trace);
                }
            }
            SchedMessage::Capture { env } => {
                self.on_capture(&mut state, ctx, *env);
            }
            SchedMessage::OnHandlerDone { trace } | SchedMessage::ThreadEnd { trace } => {
                self.handler_done(&mut state, ctx, &trace);
            }
            SchedMessage::RegisterCallback {
                trace,
                callback,
                client,
            } => {
                let tr = state.traces.entry(trace).or_insert_with(TraceState::new);
                tr.callback = Some(callback);
                self.reply(ctx, &client, SchedReply::Ok);
            }
            SchedMessage::WaitForEnd { trace, client } => match state.traces.get_mut(&trace) {
                Some(tr) if tr.status == TraceStatus::Stopped => {
                    self.reply(ctx, &client, SchedReply::WaitDone);
                }
                Some(tr) => tr.waiters.push(client),
                None => self.reply(ctx, &client, SchedReply::NotFound),
            },
            SchedMessage::GetInfos { trace, client } => match state.traces.get(&trace) {
                Some(tr) => self.reply(ctx, &client, SchedReply::Infos(tr.infos())),
                None => self.reply(ctx, &client, SchedReply::NotFound),
            },
            SchedMessage::Cleanup { trace, client } => {
                let deferred = match state.traces.get_mut(&trace) {
                    Some(tr) if matches!(tr.status, TraceStatus::Delivered { .. }) => {
                        // Defer until the in-flight delivery completes
                        tr.to_be_cleaned = Some(client.clone());
                        true
                    }
                    Some(_) => false,
                    None => {
                        self.reply(ctx, &client, SchedReply::NotFound);
                        return Ok(Transition::Next(state));
                    }
                };
                if deferred {
                    debug!("deferring cleanup of trace {} until delivery completes", trace);
                } else {
                    self.cleanup_now(&mut state, ctx, &trace, client);
                }
            }
            SchedMessage::Deliver { trace } => {
                self.deliver_step(&mut state, ctx, &trace);
            }
            SchedMessage::Reply(_) => return Ok(Transition::Unknown(state)),
        }

        Ok(Transition::Next(state))
    }
}

/// Spawn the scheduler and install it as the capture target
pub fn spawn_proto_sched(
    registry: &Arc<Registry>,
    addr: ProcessAddr,
    seed: u64,
) -> Result<ProcessRef> {
    let proc = spawn_process(
        registry,
        addr,
        Box::new(ProtoSched),
        SchedState::new(seed),
        ProcessOpts {
            capture_exempt: true,
        },
    )?;
    registry.set_scheduler(Some(proc.addr().clone()));
    Ok(proc)
}
