// Breakpoint discipline for process drivers
//
// Each process keeps an independent FIFO of breakpoint control messages
// next to its ordinary message queue. When an active breakpoint matches
// an incoming ordinary message, that message is parked until a step or
// continue releases it. A barrier holds all further breakpoint control
// until a breakpoint actually fires.

use crate::runtime::envelope::{BpPredicate, Envelope};
use crate::types::ProcessAddr;
use std::any::Any;
use std::collections::VecDeque;
use tracing::debug;

/// An installed breakpoint
#[derive(Debug, Clone)]
enum Breakpoint {
    /// Matches envelopes by payload tag
    Tag { tag: String, name: String },

    /// Matches envelopes by predicate over message and state
    Cond { cond: BpPredicate, name: String },
}

impl Breakpoint {
    fn name(&self) -> &str {
        match self {
            Breakpoint::Tag { name, .. } => name,
            Breakpoint::Cond { name, .. } => name,
        }
    }

    fn matches(&self, env: &Envelope, state: &dyn Any) -> bool {
        match self {
            Breakpoint::Tag { tag, .. } => env.payload.matches_tag(tag),
            Breakpoint::Cond { cond, .. } => cond.matches(env, state),
        }
    }
}

/// Breakpoint control operations, in their own FIFO order
#[derive(Debug, Clone)]
pub(crate) enum BpControl {
    Set { tag: String, name: String },
    SetCond { cond: BpPredicate, name: String },
    Del { name: String },
    Step { reply_to: ProcessAddr },
    Cont,
    Barrier,
}

/// What the driver must do after feeding the breakpoint state
#[derive(Debug)]
pub(crate) enum BpAction {
    /// Nothing released
    None,

    /// Execute the released message; acknowledge to `step_reply` if set
    Execute {
        env: Envelope,
        step_reply: Option<ProcessAddr>,
    },
}

/// Per-process breakpoint state
pub(crate) struct BreakpointState {
    bps: Vec<Breakpoint>,
    pending: VecDeque<BpControl>,
    barrier: bool,
    parked: Option<Envelope>,
}

impl BreakpointState {
    pub fn new() -> Self {
        Self {
            bps: Vec::new(),
            pending: VecDeque::new(),
            barrier: false,
            parked: None,
        }
    }

    /// Whether any breakpoint is installed
    pub fn active(&self) -> bool {
        !self.bps.is_empty()
    }

    /// Whether a message is currently parked
    pub fn is_paused(&self) -> bool {
        self.parked.is_some()
    }

    /// Whether an active breakpoint matches the envelope
    pub fn matches(&self, env: &Envelope, state: &dyn Any) -> bool {
        self.bps.iter().any(|bp| bp.matches(env, state))
    }

    /// Park a matched message. Firing a breakpoint releases the barrier,
    /// so queued control is drained immediately and may release the
    /// message right away.
    pub fn park(&mut self, env: Envelope) -> BpAction {
        debug!("breakpoint hit on {} message", env.payload.tag());
        self.parked = Some(env);
        self.barrier = false;
        self.drain_pending()
    }

    /// Feed one breakpoint control message
    pub fn on_control(&mut self, ctl: BpControl) -> BpAction {
        if self.barrier && self.parked.is_none() {
            self.pending.push_back(ctl);
            return BpAction::None;
        }
        self.apply(ctl)
    }

    fn drain_pending(&mut self) -> BpAction {
        let budget = self.pending.len();
        for _ in 0..budget {
            let Some(ctl) = self.pending.pop_front() else {
                break;
            };
            match self.apply(ctl) {
                BpAction::None => continue,
                action => return action,
            }
        }
        BpAction::None
    }

    fn apply(&mut self, ctl: BpControl) -> BpAction {
        match ctl {
            BpControl::Set { tag, name } => {
                self.bps.push(Breakpoint::Tag { tag, name });
                BpAction::None
            }
            BpControl::SetCond { cond, name } => {
                self.bps.push(Breakpoint::Cond { cond, name });
                BpAction::None
            }
            BpControl::Del { name } => {
                self.bps.retain(|bp| bp.name() != name);
                BpAction::None
            }
            BpControl::Step { reply_to } => match self.parked.take() {
                Some(env) => BpAction::Execute {
                    env,
                    step_reply: Some(reply_to),
                },
                None => {
                    // Nothing halted yet; the step waits for the next hit
                    self.pending.push_back(BpControl::Step { reply_to });
                    BpAction::None
                }
            },
            BpControl::Cont => match self.parked.take() {
                Some(env) => BpAction::Execute {
                    env,
                    step_reply: None,
                },
                None => BpAction::None,
            },
            BpControl::Barrier => {
                self.barrier = true;
                BpAction::None
            }
        }
    }
}
