// Deterministic protocol scheduler
//
// The scheduler imposes an exploratory global delivery order on messages
// exchanged by a set of cooperating threads and processes for a single
// protocol execution. Captured sends are queued per channel (source,
// destination pair), released one at a time driven by a seeded random
// stream, and the product of per-step fan-outs counts the possible
// interleavings. Per-channel FIFO is always preserved.

use crate::runtime::Envelope;
use crate::types::{ProcessAddr, TraceId};
use std::fmt;
use std::sync::Arc;

pub mod client;
pub mod proto_sched;

#[cfg(test)]
mod tests;

pub use client::{SchedThread, SchedulerClient};
pub use proto_sched::{spawn_proto_sched, ProtoSched, SchedState};

/// Observer invoked on every delivery of a trace
#[derive(Clone)]
pub struct DeliveryCallback(Arc<dyn Fn(&Envelope) + Send + Sync>);

impl DeliveryCallback {
    /// Wrap an observer function
    pub fn new(f: impl Fn(&Envelope) + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    /// Invoke the observer
    pub fn call(&self, env: &Envelope) {
        (self.0)(env)
    }
}

impl fmt::Debug for DeliveryCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeliveryCallback")
    }
}

/// Steering and capture messages understood by the scheduler
#[derive(Debug, Clone)]
pub enum SchedMessage {
    /// Declare how many threads will participate in the trace
    ThreadNum {
        trace: TraceId,
        n: usize,
        client: ProcessAddr,
    },

    /// Enqueue the calling thread; it is released by a scheduled
    /// [`SchedReply::ThreadReleaseToRun`] delivery
    ThreadBegin {
        trace: TraceId,
        client: ProcessAddr,
    },

    /// A send captured from an infected sender
    Capture { env: Box<Envelope> },

    /// An infected handler finished processing a delivered message
    OnHandlerDone { trace: TraceId },

    /// An infected thread finished; counts as handler completion
    ThreadEnd { trace: TraceId },

    /// Replace the on-deliver observer
    RegisterCallback {
        trace: TraceId,
        callback: DeliveryCallback,
        client: ProcessAddr,
    },

    /// Block the client until the trace drains
    WaitForEnd {
        trace: TraceId,
        client: ProcessAddr,
    },

    /// Query trace statistics
    GetInfos {
        trace: TraceId,
        client: ProcessAddr,
    },

    /// Release remaining messages unordered and discard the trace
    Cleanup {
        trace: TraceId,
        client: ProcessAddr,
    },

    /// Internal: perform the next delivery step
    Deliver { trace: TraceId },

    /// Reply to a steering request
    Reply(SchedReply),
}

impl SchedMessage {
    /// Coarse message tag
    pub fn tag(&self) -> &'static str {
        match self {
            SchedMessage::ThreadNum { .. } => "sched_thread_num",
            SchedMessage::ThreadBegin { .. } => "sched_thread_begin",
            SchedMessage::Capture { .. } => "sched_capture",
            SchedMessage::OnHandlerDone { .. } => "sched_on_handler_done",
            SchedMessage::ThreadEnd { .. } => "sched_thread_end",
            SchedMessage::RegisterCallback { .. } => "sched_register_callback",
            SchedMessage::WaitForEnd { .. } => "sched_wait_for_end",
            SchedMessage::GetInfos { .. } => "sched_get_infos",
            SchedMessage::Cleanup { .. } => "sched_cleanup",
            SchedMessage::Deliver { .. } => "sched_deliver",
            SchedMessage::Reply(_) => "sched_reply",
        }
    }
}

/// Replies sent to steering clients
#[derive(Debug, Clone)]
pub enum SchedReply {
    /// Generic acknowledgement
    Ok,

    /// Start signal delivered to a begun thread; infects the receiver
    ThreadReleaseToRun,

    /// Trace statistics
    Infos(TraceInfos),

    /// The trace is not (or no longer) known
    NotFound,

    /// Cleanup finished
    CleanupDone,

    /// The trace drained
    WaitDone,

    /// Steering misuse
    Error(SchedError),
}

/// Steering misuse kinds surfaced to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedError {
    /// thread_num was called twice
    ThreadNumAlreadySet,

    /// thread_num was called after a thread had begun
    ThreadsAlreadyBegun,

    /// thread_begin arrived after delivery had started
    TraceAlreadyRunning,
}

/// Statistics of one trace
#[derive(Debug, Clone, Default)]
pub struct TraceInfos {
    /// Delivered messages in order, rendered as "src -> dst : tag"
    pub delivered_msgs: Vec<String>,

    /// Fan-out at each delivery step
    pub nums_chosen_from: Vec<usize>,

    /// Mean fan-out (0 when nothing was delivered)
    pub avg_branching_factor: f64,

    /// Number of delivered messages
    pub num_delivered_msgs: usize,

    /// Product of per-step fan-outs
    pub num_possible_executions: u128,
}
