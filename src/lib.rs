#![deny(unsafe_code)]
#![deny(clippy::unwrap_used)]

//! CAN frame queueing and routing.
//!
//! Frames travel along [edges](EdgeHandle): bounded, prioritized FIFOs that
//! lead from one [ends](EndsId) to another. A producer ends hands frames to
//! its outgoing edges, a consumer ends drains its incoming edges in priority
//! order. [`CanQueues`] owns the whole graph.

pub mod lock_helpers;

pub mod config;
pub mod edge;
pub mod ends;
pub mod error;
pub mod fifo;
pub mod filter;
pub mod frame;
pub mod lifecycle;
pub mod notify;
pub mod router;
pub mod stats;

pub use edge::{EdgeHandle, EdgeLifecycle, EdgeParams, Placement};
pub use ends::{EndsId, EndsSnapshot, EndsState, PRIO_NR};
pub use error::{QueueError, Result};
pub use fifo::{FifoAccounting, FifoFlags};
pub use filter::{CanFilter, FilterPolarity};
pub use frame::{CanFrame, CanFrameHeader, FrameFlags};
pub use lifecycle::{Detach, Dispose, SyncWait};
pub use notify::{EndsWaiter, Notify, NotifyEvent};
pub use router::{CanQueues, InSlot, OutSlot, QueueSettings};
pub use stats::{AggregatedStats, EdgeStats, QueueStats, StatsHistory};
