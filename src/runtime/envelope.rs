// Typed message envelope for the component runtime
//
// Every message travelling between processes is wrapped in an envelope
// carrying source, destination, an optional trace tag (scheduler
// infection) and a typed payload. Control payloads steer the driver
// itself; everything else is handed to the process handler.

use crate::overlay::cyclon::CacheMessage;
use crate::overlay::rm_tman::RmMessage;
use crate::runtime::registry::MonitorRef;
use crate::sched::SchedMessage;
use crate::types::{ProcessAddr, TraceId};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// A message envelope
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Sending process
    pub src: ProcessAddr,

    /// Destination process
    pub dst: ProcessAddr,

    /// Scheduler infection tag; `Some` reroutes protocol payloads to the
    /// scheduler and infects the receiving handler
    pub trace: Option<TraceId>,

    /// Message payload
    pub payload: Payload,
}

impl Envelope {
    /// Create an uninfected envelope
    pub fn new(src: ProcessAddr, dst: ProcessAddr, payload: Payload) -> Self {
        Self {
            src,
            dst,
            trace: None,
            payload,
        }
    }

    /// Create an infected envelope
    pub fn traced(src: ProcessAddr, dst: ProcessAddr, trace: TraceId, payload: Payload) -> Self {
        Self {
            src,
            dst,
            trace: Some(trace),
            payload,
        }
    }
}

/// Message payload variants
#[derive(Debug, Clone)]
pub enum Payload {
    /// Runtime control tags
    Control(Control),

    /// Ring maintenance protocol
    Rm(RmMessage),

    /// Random peer source protocol
    Cache(CacheMessage),

    /// Scheduler steering and capture
    Sched(SchedMessage),

    /// Application-level message with an open payload
    User(UserMessage),
}

impl Payload {
    /// Coarse message tag, used for logging and breakpoint matching
    pub fn tag(&self) -> &str {
        match self {
            Payload::Control(c) => c.tag(),
            Payload::Rm(m) => m.tag(),
            Payload::Cache(m) => m.tag(),
            Payload::Sched(m) => m.tag(),
            Payload::User(u) => &u.tag,
        }
    }

    /// Whether a breakpoint set on `tag` matches this payload
    pub fn matches_tag(&self, tag: &str) -> bool {
        self.tag() == tag
    }

    /// Whether the scheduler may capture this payload. Control tags and
    /// scheduler steering always bypass capture.
    pub(crate) fn capturable(&self) -> bool {
        !matches!(self, Payload::Control(_) | Payload::Sched(_))
    }
}

/// Application-level message: a tag plus an open JSON payload
#[derive(Debug, Clone)]
pub struct UserMessage {
    /// Message tag
    pub tag: String,

    /// Message body
    pub data: serde_json::Value,
}

impl UserMessage {
    /// Create a new user message
    pub fn new(tag: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            tag: tag.into(),
            data,
        }
    }
}

/// Breakpoint predicate over the incoming envelope and the current
/// process state (downcast by the predicate itself)
#[derive(Clone)]
pub struct BpPredicate(pub Arc<dyn Fn(&Envelope, &dyn Any) -> bool + Send + Sync>);

impl BpPredicate {
    /// Wrap a predicate function
    pub fn new(f: impl Fn(&Envelope, &dyn Any) -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    /// Evaluate the predicate
    pub fn matches(&self, env: &Envelope, state: &dyn Any) -> bool {
        (self.0)(env, state)
    }
}

impl fmt::Debug for BpPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BpPredicate")
    }
}

/// Runtime control tags
#[derive(Debug, Clone)]
pub enum Control {
    /// Terminate the process
    Kill,

    /// Suspend the process loop for the given number of milliseconds
    Sleep { ms: u64 },

    /// Request a dump of the last-committed state
    GetState { reply_to: ProcessAddr },

    /// Reply to [`Control::GetState`]
    StateDump { state: String },

    /// Request runtime-level information about the process loop
    GetComponentState { reply_to: ProcessAddr },

    /// Reply to [`Control::GetComponentState`]
    ComponentStateDump { state: String },

    /// Install a breakpoint matching a message tag
    BpSet { tag: String, name: String },

    /// Install a breakpoint matching a predicate
    BpSetCond { cond: BpPredicate, name: String },

    /// Remove a breakpoint by name
    BpDel { name: String },

    /// Release exactly one halted message, then acknowledge
    BpStep { reply_to: ProcessAddr },

    /// Acknowledgement of a completed step
    BpStepDone,

    /// Resume until the next breakpoint match
    BpCont,

    /// Hold further breakpoint control until a breakpoint fires
    BpBarrier,

    /// Delivery failure report sent to a shepherd
    SendError {
        original: Box<Envelope>,
        reason: String,
    },

    /// Monitored process terminated
    Down {
        addr: ProcessAddr,
        monitor: MonitorRef,
    },
}

impl Control {
    /// Coarse control tag
    pub fn tag(&self) -> &'static str {
        match self {
            Control::Kill => "kill",
            Control::Sleep { .. } => "sleep",
            Control::GetState { .. } => "get_state",
            Control::StateDump { .. } => "state_dump",
            Control::GetComponentState { .. } => "get_component_state",
            Control::ComponentStateDump { .. } => "component_state_dump",
            Control::BpSet { .. } => "bp_set",
            Control::BpSetCond { .. } => "bp_set_cond",
            Control::BpDel { .. } => "bp_del",
            Control::BpStep { .. } => "bp_step",
            Control::BpStepDone => "bp_step_done",
            Control::BpCont => "bp_cont",
            Control::BpBarrier => "bp_barrier",
            Control::SendError { .. } => "send_error",
            Control::Down { .. } => "down",
        }
    }
}
