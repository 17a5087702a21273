// RingKV node core library
//
// This library implements the core of a distributed key-value store built
// on a structured peer-to-peer overlay: gossip-driven ring maintenance
// over a 128-bit identifier space, the component runtime the maintenance
// protocol runs on, and a deterministic protocol scheduler for exploring
// message interleavings of any protocol hosted by the runtime.

pub mod config;
pub mod error;
pub mod keyspace;
pub mod overlay;
pub mod runtime;
pub mod sched;
pub mod types;

pub use error::{NodeError, Result};
pub use keyspace::{Interval, RingKey};
pub use types::{NodeDescriptor, ProcessAddr, TraceId};
