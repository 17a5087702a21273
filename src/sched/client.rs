// Steering client and participating-thread handle for the scheduler
//
// A SchedulerClient issues steering requests from outside the explored
// execution. A SchedThread takes part in it: after thread_begin it is
// infected, its sends are captured, and it must hand control back to the
// scheduler before every blocking receive and once when it ends.

use crate::error::{NodeError, Result};
use crate::runtime::{Envelope, Mailbox, Payload, Registry};
use crate::sched::{DeliveryCallback, SchedError, SchedMessage, SchedReply, TraceInfos};
use crate::types::{ProcessAddr, TraceId};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Default timeout for steering round-trips
const STEERING_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for drain waits; traces under exploration can run long
const WAIT_TIMEOUT: Duration = Duration::from_secs(60);

fn reply_of(env: Envelope) -> Option<SchedReply> {
    match env.payload {
        Payload::Sched(SchedMessage::Reply(reply)) => Some(reply),
        _ => None,
    }
}

fn misuse(err: SchedError, trace: &TraceId) -> NodeError {
    match err {
        SchedError::ThreadNumAlreadySet => NodeError::ThreadNumAlreadySet(trace.to_string()),
        SchedError::ThreadsAlreadyBegun => NodeError::ThreadsAlreadyBegun(trace.to_string()),
        SchedError::TraceAlreadyRunning => NodeError::TraceAlreadyRunning(trace.to_string()),
    }
}

/// Uninfected steering handle
#[derive(Clone)]
pub struct SchedulerClient {
    registry: Arc<Registry>,
    sched: ProcessAddr,
}

impl SchedulerClient {
    /// Create a steering client for the given scheduler
    pub fn new(registry: Arc<Registry>, sched: ProcessAddr) -> Self {
        Self { registry, sched }
    }

    async fn call(
        &self,
        build: impl FnOnce(ProcessAddr) -> SchedMessage,
        timeout: Duration,
    ) -> Result<SchedReply> {
        let mut mailbox = self.registry.ephemeral_mailbox()?;
        let msg = build(mailbox.addr().clone());
        self.registry.deliver(
            Envelope::new(mailbox.addr().clone(), self.sched.clone(), Payload::Sched(msg)),
            None,
        );
        loop {
            let env = mailbox.recv_timeout(timeout).await?;
            if let Some(reply) = reply_of(env) {
                return Ok(reply);
            }
        }
    }

    /// Declare the number of participating threads
    pub async fn thread_num(&self, trace: &TraceId, n: usize) -> Result<()> {
        let trace_c = trace.clone();
        match self
            .call(
                move |client| SchedMessage::ThreadNum {
                    trace: trace_c,
                    n,
                    client,
                },
                STEERING_TIMEOUT,
            )
            .await?
        {
            SchedReply::Ok => Ok(()),
            SchedReply::Error(err) => Err(misuse(err, trace)),
            other => Err(NodeError::InvalidState(format!(
                "unexpected thread_num reply: {:?}",
                other
            ))),
        }
    }

    /// Replace the on-deliver observer of a trace
    pub async fn register_callback(
        &self,
        trace: &TraceId,
        callback: DeliveryCallback,
    ) -> Result<()> {
        let trace_c = trace.clone();
        match self
            .call(
                move |client| SchedMessage::RegisterCallback {
                    trace: trace_c,
                    callback,
                    client,
                },
                STEERING_TIMEOUT,
            )
            .await?
        {
            SchedReply::Ok => Ok(()),
            other => Err(NodeError::InvalidState(format!(
                "unexpected register_callback reply: {:?}",
                other
            ))),
        }
    }

    /// Block until the trace drains
    pub async fn wait_for_end(&self, trace: &TraceId) -> Result<()> {
        let trace_c = trace.clone();
        match self
            .call(
                move |client| SchedMessage::WaitForEnd {
                    trace: trace_c,
                    client,
                },
                WAIT_TIMEOUT,
            )
            .await?
        {
            SchedReply::WaitDone => Ok(()),
            SchedReply::NotFound => Err(NodeError::NotFound(trace.to_string())),
            other => Err(NodeError::InvalidState(format!(
                "unexpected wait_for_end reply: {:?}",
                other
            ))),
        }
    }

    /// Query trace statistics
    pub async fn get_infos(&self, trace: &TraceId) -> Result<TraceInfos> {
        let trace_c = trace.clone();
        match self
            .call(
                move |client| SchedMessage::GetInfos {
                    trace: trace_c,
                    client,
                },
                STEERING_TIMEOUT,
            )
            .await?
        {
            SchedReply::Infos(infos) => Ok(infos),
            SchedReply::NotFound => Err(NodeError::NotFound(trace.to_string())),
            other => Err(NodeError::InvalidState(format!(
                "unexpected get_infos reply: {:?}",
                other
            ))),
        }
    }

    /// Release remaining messages unordered and discard the trace. If a
    /// delivery is in flight the call returns only once its handler
    /// completed.
    pub async fn cleanup(&self, trace: &TraceId) -> Result<()> {
        let trace_c = trace.clone();
        match self
            .call(
                move |client| SchedMessage::Cleanup {
                    trace: trace_c,
                    client,
                },
                WAIT_TIMEOUT,
            )
            .await?
        {
            SchedReply::CleanupDone => Ok(()),
            SchedReply::NotFound => Err(NodeError::NotFound(trace.to_string())),
            other => Err(NodeError::InvalidState(format!(
                "unexpected cleanup reply: {:?}",
                other
            ))),
        }
    }
}

/// A thread participating in an explored execution
pub struct SchedThread {
    registry: Arc<Registry>,
    sched: ProcessAddr,
    trace: TraceId,
    mailbox: Mailbox,
    infected: bool,
    stash: VecDeque<Envelope>,
}

impl SchedThread {
    /// Create a participating thread with its own mailbox
    pub fn new(registry: Arc<Registry>, sched: ProcessAddr, trace: TraceId) -> Result<Self> {
        let mailbox = registry.ephemeral_mailbox()?;
        Ok(Self {
            registry,
            sched,
            trace,
            mailbox,
            infected: false,
            stash: VecDeque::new(),
        })
    }

    /// Create a participating thread under a fixed address, so explored
    /// schedules are reproducible across runs
    pub fn named(
        registry: Arc<Registry>,
        sched: ProcessAddr,
        trace: TraceId,
        name: impl Into<String>,
    ) -> Result<Self> {
        let mailbox = registry.mailbox(name)?;
        Ok(Self {
            registry,
            sched,
            trace,
            mailbox,
            infected: false,
            stash: VecDeque::new(),
        })
    }

    /// This thread's address
    pub fn addr(&self) -> &ProcessAddr {
        self.mailbox.addr()
    }

    /// Whether the thread currently carries the infection
    pub fn is_infected(&self) -> bool {
        self.infected
    }

    fn steer(&self, msg: SchedMessage) {
        self.registry.deliver(
            Envelope::new(self.addr().clone(), self.sched.clone(), Payload::Sched(msg)),
            None,
        );
    }

    /// Enqueue this thread and block until the scheduler releases it.
    /// From then on the thread is infected.
    pub async fn begin(&mut self) -> Result<()> {
        self.steer(SchedMessage::ThreadBegin {
            trace: self.trace.clone(),
            client: self.addr().clone(),
        });
        loop {
            let env = self.mailbox.recv_timeout(WAIT_TIMEOUT).await?;
            match env.payload {
                Payload::Sched(SchedMessage::Reply(SchedReply::ThreadReleaseToRun)) => {
                    debug!("thread {} released to run", self.addr());
                    self.infected = true;
                    return Ok(());
                }
                Payload::Sched(SchedMessage::Reply(SchedReply::Error(err))) => {
                    return Err(misuse(err, &self.trace));
                }
                _ => self.stash.push_back(env),
            }
        }
    }

    /// Send a message; infected sends are captured by the scheduler
    pub fn send_to(&self, dst: &ProcessAddr, payload: Payload) {
        let env = if self.infected {
            Envelope::traced(self.addr().clone(), dst.clone(), self.trace.clone(), payload)
        } else {
            Envelope::new(self.addr().clone(), dst.clone(), payload)
        };
        self.registry.route(env, None);
    }

    /// Receive the next envelope. An infected thread yields control back
    /// to the scheduler before blocking.
    pub async fn recv(&mut self) -> Result<Envelope> {
        if let Some(env) = self.stash.pop_front() {
            return Ok(env);
        }
        if self.infected {
            self.steer(SchedMessage::OnHandlerDone {
                trace: self.trace.clone(),
            });
        }
        self.mailbox.recv_timeout(WAIT_TIMEOUT).await
    }

    /// Signal the end of this thread's participation and clear the
    /// infection
    pub fn end(&mut self) {
        if self.infected {
            self.steer(SchedMessage::ThreadEnd {
                trace: self.trace.clone(),
            });
            self.infected = false;
        }
    }

    /// Drain waits are only legal from uninfected callers
    pub async fn wait_for_end(&self) -> Result<()> {
        if self.infected {
            return Err(NodeError::InfectedThread("wait_for_end".to_string()));
        }
        SchedulerClient::new(self.registry.clone(), self.sched.clone())
            .wait_for_end(&self.trace)
            .await
    }

    /// Cleanup is only legal from uninfected callers
    pub async fn cleanup(&self) -> Result<()> {
        if self.infected {
            return Err(NodeError::InfectedThread("cleanup".to_string()));
        }
        SchedulerClient::new(self.registry.clone(), self.sched.clone())
            .cleanup(&self.trace)
            .await
    }
}
