// Component runtime for the ring node
//
// Every logical process is a cooperative message loop owning a
// single-threaded state. A driver task dequeues envelopes and invokes the
// process handler; the handler returns a transition that the driver
// interprets before fetching the next message. Handler failures are
// logged and roll the state back to the last committed value; a single
// message is effectively dropped.

use crate::error::Result;
use crate::sched::SchedMessage;
use crate::types::{ProcessAddr, TraceId};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub mod breakpoint;
pub mod envelope;
pub mod registry;

pub use envelope::{BpPredicate, Control, Envelope, Payload, UserMessage};
pub use registry::{Mailbox, MonitorRef, Registry, TransportMetrics};

use breakpoint::{BpAction, BpControl, BreakpointState};

/// Handler of one logical process.
///
/// The state is passed by value and returned inside the transition; the
/// driver keeps the last committed value for rollback and introspection.
pub trait ProcessHandler<S>: Send + 'static {
    /// Process one message
    fn handle(&mut self, env: Envelope, state: S, ctx: &Context<'_>) -> Result<Transition<S>>;
}

/// Outcome of one handler invocation
pub enum Transition<S> {
    /// Commit the new state and fetch the next message
    Next(S),

    /// The message was not understood; logged, state committed
    Unknown(S),

    /// Re-enter the handler immediately with the given message, before
    /// returning to the queue
    PostOp(Envelope, S),

    /// Swap the handler and commit the new state
    ChangeHandler(Box<dyn ProcessHandler<S>>, S),

    /// Terminate the process
    Kill,
}

/// Spawn options for a process
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessOpts {
    /// Never infect this process and never capture its sends; set for the
    /// scheduler itself
    pub capture_exempt: bool,
}

/// Handle to a spawned process
pub struct ProcessRef {
    addr: ProcessAddr,
    handle: JoinHandle<()>,
}

impl ProcessRef {
    /// The process address
    pub fn addr(&self) -> &ProcessAddr {
        &self.addr
    }

    /// Wait for the process loop to finish
    pub async fn join(self) {
        let _ = self.handle.await;
    }
}

/// Per-invocation handler context
pub struct Context<'a> {
    registry: &'a Arc<Registry>,
    self_addr: &'a ProcessAddr,
    infection: Option<TraceId>,
    capture_exempt: bool,
}

impl<'a> Context<'a> {
    pub(crate) fn new(
        registry: &'a Arc<Registry>,
        self_addr: &'a ProcessAddr,
        infection: Option<TraceId>,
        capture_exempt: bool,
    ) -> Self {
        Self {
            registry,
            self_addr,
            infection,
            capture_exempt,
        }
    }

    /// This process's address
    pub fn self_addr(&self) -> &ProcessAddr {
        self.self_addr
    }

    /// The registry backing this runtime
    pub fn registry(&self) -> &Arc<Registry> {
        self.registry
    }

    /// The trace currently infecting this handler invocation, if any
    pub fn infection(&self) -> Option<&TraceId> {
        self.infection.as_ref()
    }

    /// Send a message. Sends from an infected invocation inherit the
    /// infection and are subject to scheduler capture.
    pub fn send(&self, dst: &ProcessAddr, payload: Payload) {
        self.send_with_shepherd_opt(dst, payload, None);
    }

    /// Send a message with a shepherd notified on delivery failure
    pub fn send_with_shepherd(&self, dst: &ProcessAddr, payload: Payload, shepherd: &ProcessAddr) {
        self.send_with_shepherd_opt(dst, payload, Some(shepherd));
    }

    fn send_with_shepherd_opt(
        &self,
        dst: &ProcessAddr,
        payload: Payload,
        shepherd: Option<&ProcessAddr>,
    ) {
        let trace = if self.capture_exempt {
            None
        } else {
            self.infection.clone()
        };
        let env = Envelope {
            src: self.self_addr.clone(),
            dst: dst.clone(),
            trace,
            payload,
        };
        self.registry.route(env, shepherd);
    }

    /// Deliver an envelope directly, bypassing capture
    pub fn send_direct(&self, env: Envelope) {
        self.registry.deliver(env, None);
    }

    /// Deliver an envelope directly with a shepherd
    pub fn send_direct_with_shepherd(&self, env: Envelope, shepherd: &ProcessAddr) {
        self.registry.deliver(env, Some(shepherd));
    }

    /// Deliver a message after a delay. Delayed sends are never captured.
    pub fn send_after(&self, delay: Duration, dst: &ProcessAddr, payload: Payload) {
        let registry = self.registry.clone();
        let env = Envelope::new(self.self_addr.clone(), dst.clone(), payload);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            registry.deliver(env, None);
        });
    }

    /// Monitor a process for termination
    pub fn monitor(&self, target: &ProcessAddr) -> MonitorRef {
        self.registry.monitor(target, self.self_addr)
    }

    /// Drop a monitor registration
    pub fn demonitor(&self, target: &ProcessAddr, mref: MonitorRef) {
        self.registry.demonitor(target, mref);
    }
}

/// Spawn a process on the runtime
pub fn spawn_process<S>(
    registry: &Arc<Registry>,
    addr: ProcessAddr,
    handler: Box<dyn ProcessHandler<S>>,
    state: S,
    opts: ProcessOpts,
) -> Result<ProcessRef>
where
    S: Clone + fmt::Debug + Send + Sync + 'static,
{
    let rx = registry.register(&addr)?;
    let registry = registry.clone();
    let loop_addr = addr.clone();
    let handle = tokio::spawn(async move {
        drive(registry, loop_addr, rx, handler, state, opts).await;
    });
    Ok(ProcessRef { addr, handle })
}

enum Classified {
    Driver(DriverCmd),
    Bp(BpControl),
    Ordinary(Envelope),
}

enum DriverCmd {
    Kill,
    Sleep(u64),
    GetState(ProcessAddr),
    GetComponentState(ProcessAddr),
}

fn classify(env: Envelope) -> Classified {
    let Envelope {
        src,
        dst,
        trace,
        payload,
    } = env;
    match payload {
        Payload::Control(ctl) => match ctl {
            Control::Kill => Classified::Driver(DriverCmd::Kill),
            Control::Sleep { ms } => Classified::Driver(DriverCmd::Sleep(ms)),
            Control::GetState { reply_to } => Classified::Driver(DriverCmd::GetState(reply_to)),
            Control::GetComponentState { reply_to } => {
                Classified::Driver(DriverCmd::GetComponentState(reply_to))
            }
            Control::BpSet { tag, name } => Classified::Bp(BpControl::Set { tag, name }),
            Control::BpSetCond { cond, name } => Classified::Bp(BpControl::SetCond { cond, name }),
            Control::BpDel { name } => Classified::Bp(BpControl::Del { name }),
            Control::BpStep { reply_to } => Classified::Bp(BpControl::Step { reply_to }),
            Control::BpCont => Classified::Bp(BpControl::Cont),
            Control::BpBarrier => Classified::Bp(BpControl::Barrier),
            other => Classified::Ordinary(Envelope {
                src,
                dst,
                trace,
                payload: Payload::Control(other),
            }),
        },
        payload => Classified::Ordinary(Envelope {
            src,
            dst,
            trace,
            payload,
        }),
    }
}

#[derive(PartialEq)]
enum Flow {
    Continue,
    Exit,
}

async fn drive<S>(
    registry: Arc<Registry>,
    addr: ProcessAddr,
    mut rx: UnboundedReceiver<Envelope>,
    mut handler: Box<dyn ProcessHandler<S>>,
    mut state: S,
    opts: ProcessOpts,
) where
    S: Clone + fmt::Debug + Send + 'static,
{
    let mut bp = BreakpointState::new();
    let mut backlog: VecDeque<Envelope> = VecDeque::new();
    debug!("process {} started", addr);

    'main: loop {
        let env = match backlog.pop_front() {
            Some(env) => env,
            None => match rx.recv().await {
                Some(env) => env,
                None => break,
            },
        };

        match classify(env) {
            Classified::Driver(cmd) => {
                if run_driver_cmd(&registry, &addr, &state, &bp, backlog.len(), cmd).await
                    == Flow::Exit
                {
                    break;
                }
            }
            Classified::Bp(ctl) => {
                let action = bp.on_control(ctl);
                if apply_bp_action(&registry, &addr, &mut handler, &mut state, opts, action)
                    == Flow::Exit
                {
                    break;
                }
            }
            Classified::Ordinary(env) => {
                if bp.active() && bp.matches(&env, &state) {
                    let action = bp.park(env);
                    if apply_bp_action(&registry, &addr, &mut handler, &mut state, opts, action)
                        == Flow::Exit
                    {
                        break;
                    }
                    // Hold ordinary traffic until the parked message is
                    // released; breakpoint control keeps flowing.
                    while bp.is_paused() {
                        let Some(next) = rx.recv().await else {
                            break 'main;
                        };
                        match classify(next) {
                            Classified::Driver(cmd) => {
                                if run_driver_cmd(&registry, &addr, &state, &bp, backlog.len(), cmd)
                                    .await
                                    == Flow::Exit
                                {
                                    break 'main;
                                }
                            }
                            Classified::Bp(ctl) => {
                                let action = bp.on_control(ctl);
                                if apply_bp_action(
                                    &registry, &addr, &mut handler, &mut state, opts, action,
                                ) == Flow::Exit
                                {
                                    break 'main;
                                }
                            }
                            Classified::Ordinary(pending) => backlog.push_back(pending),
                        }
                    }
                } else if execute(&registry, &addr, &mut handler, &mut state, opts, env, None)
                    == Flow::Exit
                {
                    break;
                }
            }
        }
    }

    registry.deregister(&addr);
    debug!("process {} stopped", addr);
}

async fn run_driver_cmd<S: fmt::Debug>(
    registry: &Arc<Registry>,
    addr: &ProcessAddr,
    state: &S,
    bp: &BreakpointState,
    backlog_len: usize,
    cmd: DriverCmd,
) -> Flow {
    match cmd {
        DriverCmd::Kill => Flow::Exit,
        DriverCmd::Sleep(ms) => {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Flow::Continue
        }
        DriverCmd::GetState(reply_to) => {
            registry.deliver(
                Envelope::new(
                    addr.clone(),
                    reply_to,
                    Payload::Control(Control::StateDump {
                        state: format!("{:?}", state),
                    }),
                ),
                None,
            );
            Flow::Continue
        }
        DriverCmd::GetComponentState(reply_to) => {
            registry.deliver(
                Envelope::new(
                    addr.clone(),
                    reply_to,
                    Payload::Control(Control::ComponentStateDump {
                        state: format!(
                            "process {}: breakpoints active: {}, halted: {}, backlog: {}",
                            addr,
                            bp.active(),
                            bp.is_paused(),
                            backlog_len
                        ),
                    }),
                ),
                None,
            );
            Flow::Continue
        }
    }
}

fn apply_bp_action<S>(
    registry: &Arc<Registry>,
    addr: &ProcessAddr,
    handler: &mut Box<dyn ProcessHandler<S>>,
    state: &mut S,
    opts: ProcessOpts,
    action: BpAction,
) -> Flow
where
    S: Clone + fmt::Debug + Send + 'static,
{
    match action {
        BpAction::None => Flow::Continue,
        BpAction::Execute { env, step_reply } => {
            execute(registry, addr, handler, state, opts, env, step_reply)
        }
    }
}

/// Run the handler on one message, interpreting the returned transition.
/// On handler error the state rolls back to the pre-handler value.
fn execute<S>(
    registry: &Arc<Registry>,
    addr: &ProcessAddr,
    handler: &mut Box<dyn ProcessHandler<S>>,
    state: &mut S,
    opts: ProcessOpts,
    env: Envelope,
    step_reply: Option<ProcessAddr>,
) -> Flow
where
    S: Clone + fmt::Debug + Send + 'static,
{
    let trace = env.trace.clone();
    let ctx = Context::new(
        registry,
        addr,
        if opts.capture_exempt {
            None
        } else {
            trace.clone()
        },
        opts.capture_exempt,
    );

    let mut current = env;
    let mut flow = Flow::Continue;
    loop {
        let tag = current.payload.tag().to_string();
        let snapshot = state.clone();
        let input = std::mem::replace(state, snapshot);
        match handler.handle(current, input, &ctx) {
            Ok(Transition::Next(next)) => {
                *state = next;
                break;
            }
            Ok(Transition::Unknown(next)) => {
                debug!("unknown {} message in {}", tag, addr);
                *state = next;
                break;
            }
            Ok(Transition::PostOp(reposted, next)) => {
                *state = next;
                current = reposted;
                continue;
            }
            Ok(Transition::ChangeHandler(next_handler, next)) => {
                *handler = next_handler;
                *state = next;
                break;
            }
            Ok(Transition::Kill) => {
                flow = Flow::Exit;
                break;
            }
            Err(err) => {
                warn!(
                    "handler error in {} on {} message: {}; state preserved",
                    addr, tag, err
                );
                break;
            }
        }
    }

    if let Some(reply_to) = step_reply {
        registry.deliver(
            Envelope::new(
                addr.clone(),
                reply_to,
                Payload::Control(Control::BpStepDone),
            ),
            None,
        );
    }

    // An infected handler invocation reports completion to the scheduler
    if let Some(trace) = trace {
        if !opts.capture_exempt {
            if let Some(sched) = registry.scheduler() {
                if sched != *addr {
                    registry.deliver(
                        Envelope::new(
                            addr.clone(),
                            sched,
                            Payload::Sched(SchedMessage::OnHandlerDone { trace }),
                        ),
                        None,
                    );
                }
            }
        }
    }

    flow
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NodeError;
    use std::time::Duration;

    struct Counter;

    impl ProcessHandler<u32> for Counter {
        fn handle(&mut self, env: Envelope, state: u32, ctx: &Context<'_>) -> Result<Transition<u32>> {
            match &env.payload {
                Payload::User(u) if u.tag == "inc" => Ok(Transition::Next(state + 1)),
                Payload::User(u) if u.tag == "boom" => {
                    Err(NodeError::InvalidState("boom".to_string()))
                }
                Payload::User(u) if u.tag == "inc_twice" => {
                    let repost = Envelope::new(
                        ctx.self_addr().clone(),
                        ctx.self_addr().clone(),
                        Payload::User(UserMessage::new("inc", serde_json::Value::Null)),
                    );
                    Ok(Transition::PostOp(repost, state + 1))
                }
                Payload::User(u) if u.tag == "handoff" => {
                    Ok(Transition::ChangeHandler(Box::new(DoubleCounter), state))
                }
                Payload::User(u) if u.tag == "stop" => Ok(Transition::Kill),
                _ => Ok(Transition::Unknown(state)),
            }
        }
    }

    struct DoubleCounter;

    impl ProcessHandler<u32> for DoubleCounter {
        fn handle(&mut self, env: Envelope, state: u32, _ctx: &Context<'_>) -> Result<Transition<u32>> {
            match &env.payload {
                Payload::User(u) if u.tag == "inc" => Ok(Transition::Next(state + 2)),
                _ => Ok(Transition::Unknown(state)),
            }
        }
    }

    fn user(tag: &str) -> Payload {
        Payload::User(UserMessage::new(tag, serde_json::Value::Null))
    }

    async fn get_state(
        registry: &Arc<Registry>,
        mb: &mut Mailbox,
        target: &ProcessAddr,
    ) -> String {
        registry.deliver(
            Envelope::new(
                mb.addr().clone(),
                target.clone(),
                Payload::Control(Control::GetState {
                    reply_to: mb.addr().clone(),
                }),
            ),
            None,
        );
        loop {
            let env = mb
                .recv_timeout(Duration::from_secs(5))
                .await
                .expect("state dump");
            if let Payload::Control(Control::StateDump { state }) = env.payload {
                return state;
            }
        }
    }

    fn send(registry: &Arc<Registry>, from: &ProcessAddr, to: &ProcessAddr, payload: Payload) {
        registry.deliver(Envelope::new(from.clone(), to.clone(), payload), None);
    }

    #[tokio::test]
    async fn counter_processes_messages_in_order() {
        let registry = Registry::new();
        let proc = spawn_process(
            &registry,
            ProcessAddr::new("counter"),
            Box::new(Counter),
            0u32,
            ProcessOpts::default(),
        )
        .unwrap();
        let mut mb = registry.ephemeral_mailbox().unwrap();

        for _ in 0..3 {
            send(&registry, mb.addr(), proc.addr(), user("inc"));
        }
        assert_eq!(get_state(&registry, &mut mb, proc.addr()).await, "3");
    }

    #[tokio::test]
    async fn handler_error_preserves_state() {
        let registry = Registry::new();
        let proc = spawn_process(
            &registry,
            ProcessAddr::new("fragile"),
            Box::new(Counter),
            0u32,
            ProcessOpts::default(),
        )
        .unwrap();
        let mut mb = registry.ephemeral_mailbox().unwrap();

        send(&registry, mb.addr(), proc.addr(), user("inc"));
        send(&registry, mb.addr(), proc.addr(), user("boom"));
        send(&registry, mb.addr(), proc.addr(), user("inc"));
        assert_eq!(get_state(&registry, &mut mb, proc.addr()).await, "2");
    }

    #[tokio::test]
    async fn unknown_message_is_not_fatal() {
        let registry = Registry::new();
        let proc = spawn_process(
            &registry,
            ProcessAddr::new("tolerant"),
            Box::new(Counter),
            0u32,
            ProcessOpts::default(),
        )
        .unwrap();
        let mut mb = registry.ephemeral_mailbox().unwrap();

        send(&registry, mb.addr(), proc.addr(), user("mystery"));
        send(&registry, mb.addr(), proc.addr(), user("inc"));
        assert_eq!(get_state(&registry, &mut mb, proc.addr()).await, "1");
    }

    #[tokio::test]
    async fn post_op_reenters_before_next_message() {
        let registry = Registry::new();
        let proc = spawn_process(
            &registry,
            ProcessAddr::new("reposter"),
            Box::new(Counter),
            0u32,
            ProcessOpts::default(),
        )
        .unwrap();
        let mut mb = registry.ephemeral_mailbox().unwrap();

        send(&registry, mb.addr(), proc.addr(), user("inc_twice"));
        assert_eq!(get_state(&registry, &mut mb, proc.addr()).await, "2");
    }

    #[tokio::test]
    async fn change_handler_swaps_behavior() {
        let registry = Registry::new();
        let proc = spawn_process(
            &registry,
            ProcessAddr::new("morph"),
            Box::new(Counter),
            0u32,
            ProcessOpts::default(),
        )
        .unwrap();
        let mut mb = registry.ephemeral_mailbox().unwrap();

        send(&registry, mb.addr(), proc.addr(), user("inc"));
        send(&registry, mb.addr(), proc.addr(), user("handoff"));
        send(&registry, mb.addr(), proc.addr(), user("inc"));
        assert_eq!(get_state(&registry, &mut mb, proc.addr()).await, "3");
    }

    #[tokio::test]
    async fn kill_terminates_and_fires_monitors() {
        let registry = Registry::new();
        let proc = spawn_process(
            &registry,
            ProcessAddr::new("mortal"),
            Box::new(Counter),
            0u32,
            ProcessOpts::default(),
        )
        .unwrap();
        let mut watcher = registry.ephemeral_mailbox().unwrap();
        registry.monitor(proc.addr(), watcher.addr());

        send(
            &registry,
            watcher.addr(),
            proc.addr(),
            Payload::Control(Control::Kill),
        );

        let env = watcher
            .recv_timeout(Duration::from_secs(5))
            .await
            .expect("down notice");
        assert!(matches!(
            env.payload,
            Payload::Control(Control::Down { ref addr, .. }) if addr.as_str() == "mortal"
        ));
        assert!(!registry.contains(&ProcessAddr::new("mortal")));
    }

    #[tokio::test]
    async fn component_state_reports_runtime_details() {
        let registry = Registry::new();
        let proc = spawn_process(
            &registry,
            ProcessAddr::new("inspected"),
            Box::new(Counter),
            0u32,
            ProcessOpts::default(),
        )
        .unwrap();
        let mut mb = registry.ephemeral_mailbox().unwrap();

        registry.deliver(
            Envelope::new(
                mb.addr().clone(),
                proc.addr().clone(),
                Payload::Control(Control::GetComponentState {
                    reply_to: mb.addr().clone(),
                }),
            ),
            None,
        );
        let env = mb.recv_timeout(Duration::from_secs(5)).await.unwrap();
        match env.payload {
            Payload::Control(Control::ComponentStateDump { state }) => {
                assert!(state.contains("inspected"));
                assert!(state.contains("breakpoints active: false"));
            }
            other => panic!("expected component_state_dump, got {}", other.tag()),
        }
    }

    #[tokio::test]
    async fn breakpoint_step_and_cont_gate_messages() {
        let registry = Registry::new();
        let proc = spawn_process(
            &registry,
            ProcessAddr::new("debugged"),
            Box::new(Counter),
            0u32,
            ProcessOpts::default(),
        )
        .unwrap();
        let mut mb = registry.ephemeral_mailbox().unwrap();

        send(
            &registry,
            mb.addr(),
            proc.addr(),
            Payload::Control(Control::BpSet {
                tag: "inc".to_string(),
                name: "b1".to_string(),
            }),
        );
        send(&registry, mb.addr(), proc.addr(), user("inc"));

        // The message is halted; committed state is still 0
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(get_state(&registry, &mut mb, proc.addr()).await, "0");

        // Step releases exactly one message and acknowledges
        send(
            &registry,
            mb.addr(),
            proc.addr(),
            Payload::Control(Control::BpStep {
                reply_to: mb.addr().clone(),
            }),
        );
        let env = mb.recv_timeout(Duration::from_secs(5)).await.expect("ack");
        assert!(matches!(env.payload, Payload::Control(Control::BpStepDone)));
        assert_eq!(get_state(&registry, &mut mb, proc.addr()).await, "1");

        // The next matching message halts again; cont releases it
        send(&registry, mb.addr(), proc.addr(), user("inc"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(get_state(&registry, &mut mb, proc.addr()).await, "1");
        send(
            &registry,
            mb.addr(),
            proc.addr(),
            Payload::Control(Control::BpCont),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(get_state(&registry, &mut mb, proc.addr()).await, "2");

        // Removing the breakpoint restores free flow
        send(
            &registry,
            mb.addr(),
            proc.addr(),
            Payload::Control(Control::BpDel {
                name: "b1".to_string(),
            }),
        );
        send(&registry, mb.addr(), proc.addr(), user("inc"));
        assert_eq!(get_state(&registry, &mut mb, proc.addr()).await, "3");
    }
}
