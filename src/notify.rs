//! Queue state notifications.
//!
//! Queue operations never call listeners while holding an internal lock.
//! Events raised during an operation are collected in a [`Deferred`] batch
//! and dispatched once the operation has released everything, so a listener
//! is free to call back into the queue.

use crate::edge::{Edge, EdgeHandle};
use crate::ends::EndsId;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// State transition reported to an ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotifyEvent {
    /// The edge drained completely
    Empty,
    /// A full edge has room again
    Space,
    /// The edge has frames to process
    Proc,
    /// The last user of a detaching edge let go
    NoUsr,
    /// The edge is dead and reclaimed
    Dead,
    /// Somebody asked for the edge to be killed
    DeadWanted,
    /// The edge was connected
    Attach,
}

/// Listener attached to an ends at [`crate::CanQueues::ends_init`].
pub trait Notify: Send + Sync {
    fn notify(&self, ends: EndsId, edge: EdgeHandle, event: NotifyEvent);
}

impl<F> Notify for F
where
    F: Fn(EndsId, EdgeHandle, NotifyEvent) + Send + Sync,
{
    fn notify(&self, ends: EndsId, edge: EdgeHandle, event: NotifyEvent) {
        self(ends, edge, event)
    }
}

#[derive(Default)]
struct WaiterState {
    readable: bool,
    writable: bool,
    closed: bool,
}

/// Binary "readable" and "writable" signals driven by notifications.
///
/// `Proc` raises readable, `Space`, `Empty` and `Attach` raise writable, and
/// `Dead`/`DeadWanted` wake everybody. Waiting consumes the signal.
#[derive(Default)]
pub struct EndsWaiter {
    state: Mutex<WaiterState>,
    cond: Condvar,
}

impl EndsWaiter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Blocks until frames may be available to read. Returns `false` on
    /// timeout.
    pub fn wait_readable(&self, timeout: Duration) -> bool {
        self.wait_for(timeout, |s| &mut s.readable)
    }

    /// Blocks until a full edge may have room again. Returns `false` on
    /// timeout.
    pub fn wait_writable(&self, timeout: Duration) -> bool {
        self.wait_for(timeout, |s| &mut s.writable)
    }

    /// Wakes all waiters and makes every later wait return immediately.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.cond.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn wait_for<F>(&self, timeout: Duration, signal: F) -> bool
    where
        F: Fn(&mut WaiterState) -> &mut bool,
    {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if state.closed || std::mem::take(signal(&mut *state)) {
                return true;
            }
            if self.cond.wait_until(&mut state, deadline).timed_out() {
                return std::mem::take(signal(&mut *state)) || state.closed;
            }
        }
    }

    fn raise(&self, readable: bool, writable: bool) {
        let mut state = self.state.lock();
        state.readable |= readable;
        state.writable |= writable;
        self.cond.notify_all();
    }
}

impl Notify for EndsWaiter {
    fn notify(&self, _ends: EndsId, _edge: EdgeHandle, event: NotifyEvent) {
        match event {
            NotifyEvent::Proc => self.raise(true, false),
            NotifyEvent::Space | NotifyEvent::Empty | NotifyEvent::Attach => {
                self.raise(false, true)
            }
            NotifyEvent::Dead | NotifyEvent::DeadWanted | NotifyEvent::NoUsr => {
                self.raise(true, true)
            }
        }
    }
}

/// An event waiting for dispatch.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PendingEvent {
    pub ends: EndsId,
    pub edge: EdgeHandle,
    pub event: NotifyEvent,
}

/// Work an operation postpones until it holds no lock.
#[derive(Default)]
pub(crate) struct Deferred {
    pub events: Vec<PendingEvent>,
    /// Dead edges to drop from the arena
    pub reclaim: Vec<EdgeHandle>,
    /// Edges to kill (flush and disconnect)
    pub kill: Vec<EdgeHandle>,
    /// Ends that may have become reclaimable
    pub check_ends: Vec<EndsId>,
}

impl Deferred {
    pub fn push(&mut self, ends: EndsId, edge: EdgeHandle, event: NotifyEvent) {
        self.events.push(PendingEvent { ends, edge, event });
    }

    /// Queue `event` for the producer side of `edge`.
    pub fn notify_input(&mut self, edge: &Edge, event: NotifyEvent) {
        if let Some((input, _)) = edge.ends() {
            self.push(input, edge.handle, event);
        }
    }

    /// Queue `event` for the consumer side of `edge`.
    pub fn notify_output(&mut self, edge: &Edge, event: NotifyEvent) {
        if let Some((_, output)) = edge.ends() {
            self.push(output, edge.handle, event);
        }
    }

    pub fn notify_both(&mut self, edge: &Edge, event: NotifyEvent) {
        if let Some((input, output)) = edge.ends() {
            self.push(input, edge.handle, event);
            if output != input {
                self.push(output, edge.handle, event);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
            && self.reclaim.is_empty()
            && self.kill.is_empty()
            && self.check_ends.is_empty()
    }
}
