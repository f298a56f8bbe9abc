//! Edges: prioritized, filtered channels between two ends.

use crate::error::{QueueError, Result};
use crate::ends::{EndsId, PRIO_NR};
use crate::fifo::Fifo;
use crate::filter::CanFilter;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::OnceLock;

/// Stable reference to an edge in the queue arena.
///
/// `num` is the edge's creation number; a handle whose slab slot has been
/// reused by a later edge no longer resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EdgeHandle {
    pub(crate) key: usize,
    pub(crate) num: u32,
}

impl EdgeHandle {
    /// Creation order number of the edge.
    pub fn num(&self) -> u32 {
        self.num
    }
}

impl fmt::Display for EdgeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Edge({})", self.num)
    }
}

/// Which list of its output ends the edge currently sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Not linked into any ends
    Unlinked,
    Idle,
    Active(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeLifecycle {
    /// Created, not connected yet
    Unattached,
    Attached,
    /// Disconnected while `pending` users still held it
    Detaching { pending: u32 },
    Dead,
}

#[derive(Debug)]
pub(crate) struct EdgeLink {
    pub placement: Placement,
    pub lifecycle: EdgeLifecycle,
}

/// Parameters of a new edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EdgeParams {
    /// Number of slots; zero selects the configured default.
    pub slot_count: usize,
    /// Per-slot payload limit; zero selects the configured default.
    pub max_data_length: usize,
    pub prio: u8,
    pub filter: CanFilter,
}

impl EdgeParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn slots(mut self, slot_count: usize) -> Self {
        self.slot_count = slot_count;
        self
    }

    pub fn max_data_length(mut self, dlen: usize) -> Self {
        self.max_data_length = dlen;
        self
    }

    pub fn prio(mut self, prio: u8) -> Self {
        self.prio = prio;
        self
    }

    pub fn filter(mut self, filter: CanFilter) -> Self {
        self.filter = filter;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if usize::from(self.prio) >= PRIO_NR {
            return Err(QueueError::invalid_param(format!(
                "priority {} out of range 0..{}",
                self.prio, PRIO_NR
            )));
        }
        Ok(())
    }
}

pub(crate) struct Edge {
    pub handle: EdgeHandle,
    pub prio: u8,
    pub filter: CanFilter,
    pub fifo: Fifo,
    used: AtomicU32,
    ends: OnceLock<(EndsId, EndsId)>,
    pub link: Mutex<EdgeLink>,
    delivered: AtomicU64,
}

impl Edge {
    pub fn new(handle: EdgeHandle, prio: u8, filter: CanFilter, fifo: Fifo) -> Self {
        Self {
            handle,
            prio,
            filter,
            fifo,
            used: AtomicU32::new(0),
            ends: OnceLock::new(),
            link: Mutex::new(EdgeLink {
                placement: Placement::Unlinked,
                lifecycle: EdgeLifecycle::Unattached,
            }),
            delivered: AtomicU64::new(0),
        }
    }

    /// `(input, output)` ends, once connected.
    pub fn ends(&self) -> Option<(EndsId, EndsId)> {
        self.ends.get().copied()
    }

    /// Records the ends pair; fails if the edge was connected before.
    pub fn bind(&self, input: EndsId, output: EndsId) -> Result<()> {
        self.ends
            .set((input, output))
            .map_err(|_| QueueError::AlreadyConnected(self.handle))
    }

    pub fn used(&self) -> u32 {
        self.used.load(Ordering::Acquire)
    }

    pub fn incref(&self) {
        self.used.fetch_add(1, Ordering::AcqRel);
    }

    /// Drops one reference. Returns `true` when this was the last one.
    /// The count never goes below zero.
    pub fn decref(&self) -> bool {
        match self
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        {
            Ok(prev) => prev == 1,
            Err(_) => {
                tracing::warn!("{} reference count underflow", self.handle);
                false
            }
        }
    }

    pub fn record_delivery(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Edge")
            .field("handle", &self.handle)
            .field("prio", &self.prio)
            .field("used", &self.used())
            .field("ends", &self.ends())
            .field("fifo", &self.fifo)
            .finish()
    }
}

#[cfg(test)]
pub(crate) fn test_handle(num: u32) -> EdgeHandle {
    EdgeHandle {
        key: num as usize,
        num,
    }
}
