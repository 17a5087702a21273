// Process registry and messaging substrate
//
// The registry maps process addresses to inbound queues and implements
// point-to-point delivery with an optional shepherd notified on failure,
// process-death monitors, and the scheduler capture rule: an infected
// protocol envelope destined anywhere but the scheduler is rerouted to
// the scheduler instead of being delivered directly.

use crate::error::{NodeError, Result};
use crate::runtime::envelope::{Control, Envelope, Payload};
use crate::sched::SchedMessage;
use crate::types::ProcessAddr;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::debug;

/// Handle identifying one monitor registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MonitorRef(u64);

/// Snapshot of transport counters
#[derive(Debug, Clone, Copy, Default)]
pub struct TransportMetrics {
    /// Envelopes handed to the registry for delivery
    pub sent: u64,

    /// Envelopes enqueued at their destination
    pub delivered: u64,

    /// Envelopes that could not be delivered
    pub failed: u64,
}

/// Process registry
pub struct Registry {
    /// Inbound queues by process address
    procs: DashMap<ProcessAddr, UnboundedSender<Envelope>>,

    /// Death monitors by monitored address
    monitors: DashMap<ProcessAddr, Vec<(MonitorRef, ProcessAddr)>>,

    /// The active scheduler process, if any
    scheduler: RwLock<Option<ProcessAddr>>,

    /// Next monitor handle
    next_monitor: AtomicU64,

    sent: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
}

impl Registry {
    /// Create a new registry
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            procs: DashMap::new(),
            monitors: DashMap::new(),
            scheduler: RwLock::new(None),
            next_monitor: AtomicU64::new(1),
            sent: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        })
    }

    /// Register a process address and return its inbound queue
    pub(crate) fn register(&self, addr: &ProcessAddr) -> Result<UnboundedReceiver<Envelope>> {
        let (tx, rx) = mpsc::unbounded_channel();
        match self.procs.entry(addr.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(NodeError::AddressInUse(addr.to_string()))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(tx);
                Ok(rx)
            }
        }
    }

    /// Register a mailbox for a client task under the given name
    pub fn mailbox(self: &Arc<Self>, name: impl Into<String>) -> Result<Mailbox> {
        let addr = ProcessAddr::new(name);
        let rx = self.register(&addr)?;
        Ok(Mailbox {
            addr,
            rx,
            registry: self.clone(),
        })
    }

    /// Register a mailbox under a fresh unique name
    pub fn ephemeral_mailbox(self: &Arc<Self>) -> Result<Mailbox> {
        self.mailbox(format!("mbox-{}", uuid::Uuid::new_v4()))
    }

    /// Remove a process address, notifying its monitors
    pub fn deregister(&self, addr: &ProcessAddr) {
        self.procs.remove(addr);
        self.notify_down(addr);
    }

    /// Whether an address is currently registered
    pub fn contains(&self, addr: &ProcessAddr) -> bool {
        self.procs.contains_key(addr)
    }

    /// Install or clear the scheduler used for capture
    pub fn set_scheduler(&self, addr: Option<ProcessAddr>) {
        *self.scheduler.write() = addr;
    }

    /// The active scheduler, if any
    pub fn scheduler(&self) -> Option<ProcessAddr> {
        self.scheduler.read().clone()
    }

    /// Route an envelope, applying the scheduler capture rule
    pub fn route(&self, env: Envelope, shepherd: Option<&ProcessAddr>) {
        if env.trace.is_some() && env.payload.capturable() {
            if let Some(sched) = self.scheduler() {
                if env.dst != sched {
                    let capture = Envelope {
                        src: env.src.clone(),
                        dst: sched,
                        trace: env.trace.clone(),
                        payload: Payload::Sched(SchedMessage::Capture { env: Box::new(env) }),
                    };
                    self.deliver(capture, shepherd);
                    return;
                }
            }
        }
        self.deliver(env, shepherd);
    }

    /// Deliver an envelope directly, bypassing capture
    pub fn deliver(&self, env: Envelope, shepherd: Option<&ProcessAddr>) {
        self.sent.fetch_add(1, Ordering::Relaxed);
        let failed = match self.procs.get(&env.dst) {
            Some(tx) => match tx.send(env) {
                Ok(()) => {
                    self.delivered.fetch_add(1, Ordering::Relaxed);
                    None
                }
                Err(err) => Some(err.0),
            },
            None => Some(env),
        };

        if let Some(env) = failed {
            self.failed.fetch_add(1, Ordering::Relaxed);
            match shepherd {
                Some(shepherd) => {
                    debug!(
                        "delivery to {} failed, reporting to shepherd {}",
                        env.dst, shepherd
                    );
                    let report = Envelope::new(
                        env.dst.clone(),
                        shepherd.clone(),
                        Payload::Control(Control::SendError {
                            reason: format!("no process registered at {}", env.dst),
                            original: Box::new(env),
                        }),
                    );
                    self.deliver(report, None);
                }
                None => {
                    debug!("dropping undeliverable {} message to {}", env.payload.tag(), env.dst);
                }
            }
        }
    }

    /// Monitor a process; the watcher receives a `Down` control when the
    /// target terminates. A monitor on an unregistered target fires
    /// immediately.
    pub fn monitor(&self, target: &ProcessAddr, watcher: &ProcessAddr) -> MonitorRef {
        let mref = MonitorRef(self.next_monitor.fetch_add(1, Ordering::Relaxed));
        if !self.procs.contains_key(target) {
            self.deliver(
                Envelope::new(
                    target.clone(),
                    watcher.clone(),
                    Payload::Control(Control::Down {
                        addr: target.clone(),
                        monitor: mref,
                    }),
                ),
                None,
            );
            return mref;
        }
        self.monitors
            .entry(target.clone())
            .or_default()
            .push((mref, watcher.clone()));
        mref
    }

    /// Remove a monitor registration
    pub fn demonitor(&self, target: &ProcessAddr, mref: MonitorRef) {
        if let Some(mut watchers) = self.monitors.get_mut(target) {
            watchers.retain(|(r, _)| *r != mref);
        }
    }

    /// Transport counter snapshot
    pub fn metrics(&self) -> TransportMetrics {
        TransportMetrics {
            sent: self.sent.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    fn notify_down(&self, addr: &ProcessAddr) {
        let Some((_, watchers)) = self.monitors.remove(addr) else {
            return;
        };
        for (mref, watcher) in watchers {
            self.deliver(
                Envelope::new(
                    addr.clone(),
                    watcher,
                    Payload::Control(Control::Down {
                        addr: addr.clone(),
                        monitor: mref,
                    }),
                ),
                None,
            );
        }
    }
}

/// Inbound queue handle for a client task.
///
/// Deregisters itself on drop, which fires any monitors on its address.
pub struct Mailbox {
    addr: ProcessAddr,
    rx: UnboundedReceiver<Envelope>,
    registry: Arc<Registry>,
}

impl Mailbox {
    /// The mailbox address
    pub fn addr(&self) -> &ProcessAddr {
        &self.addr
    }

    /// Receive the next envelope
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }

    /// Receive the next envelope or fail after the timeout
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Result<Envelope> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(env)) => Ok(env),
            Ok(None) => Err(NodeError::ReceiveFailure(format!(
                "mailbox {} closed",
                self.addr
            ))),
            Err(_) => Err(NodeError::Timeout),
        }
    }

    /// Take an envelope if one is already queued
    pub fn try_recv(&mut self) -> Option<Envelope> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Mailbox {
    fn drop(&mut self) {
        self.registry.deregister(&self.addr);
    }
}
