//! GateWire sample routing engine.
//! Host-independent: the daemon supplies configuration, signal handling and
//! the I/O node backends; this crate owns the data plane.
//!
//! A deployment declares *nodes* (typed endpoints) and *paths* (pipelines
//! from one source node through a hook chain and a bounded queue to one or
//! more destinations). Samples live in per-path pools and travel by
//! reference; rate-driven paths emit on a periodic timer and keep the line
//! warm by resending the last vector when no new data arrived.
//!
//! ## Engine responsibilities
//!
//! - **Samples**: time-stamped typed value vectors ([`sample`], [`signal`]),
//!   recycled through bounded pools ([`pool`]).
//! - **Queues**: single-writer rings with per-reader cursors ([`queue`]).
//! - **Hooks**: priority-ordered per-path transformations ([`hook`],
//!   built-ins in [`hooks`]).
//! - **Nodes**: the plug-in contract and type registry ([`node`], plus the
//!   I/O-free [`loopback`] type).
//! - **Paths**: the receive/send state machine with rate timers ([`path`],
//!   [`timer`]).
//! - **Codecs**: the raw sample format ([`format`]) and C37.118
//!   synchrophasor frames ([`c37_118`]).

pub mod c37_118;
pub mod format;
pub mod hook;
pub mod hooks;
pub mod loopback;
pub mod node;
pub mod path;
pub mod pool;
pub mod queue;
pub mod sample;
pub mod signal;
pub mod timer;

pub use hook::{Hook, HookAction, HookChain, HookError, HookPoint};
pub use loopback::{LoopbackHandle, LoopbackMessage, LoopbackNode, LoopbackPlugin};
pub use node::{Node, NodeBackend, NodeError, NodeState, NodeTypePlugin, NodeTypeRegistry};
pub use path::{Path, PathCounters, PathError, PathSettings, PathState};
pub use pool::{Pool, PoolError, SampleRef};
pub use queue::{PathQueue, ReaderId};
pub use sample::{SampleData, Timestamp};
pub use signal::{Complex32, Signal, SignalType, SignalValue};
pub use timer::{RateTimer, Tick, TimerError};
