//! Edge and ends lifecycle.
//!
//! An edge goes `Unattached -> Attached -> Detaching -> Dead`. Disconnecting
//! always unlinks the edge from both ends at once; if somebody still holds a
//! reference the edge stays `Detaching` and is reclaimed by whoever drops
//! the last reference, which also raises `NoUsr` and `Dead`.
//!
//! Ends are torn down with [`CanQueues::dispose`], which kills every edge
//! attached to them and reclaims the ends as soon as no edge refers to it.

use crate::edge::{Edge, EdgeHandle, EdgeLifecycle, EdgeParams, Placement};
use crate::ends::{Ends, EndsId, EndsState};
use crate::error::{QueueError, Result};
use crate::fifo::{DrainWait, Fifo, FifoFlags};
use crate::lock_helpers::lock_ends_pair;
use crate::notify::{Deferred, Notify, NotifyEvent};
use crate::router::CanQueues;
use crate::{lock_mutex, lock_write};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Result of [`CanQueues::disconnect_edge`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detach {
    /// The edge is dead and unreachable
    Done,
    /// The edge is unlinked but still referenced; `NoUsr` follows once the
    /// last user lets go
    Pending,
}

/// Result of [`CanQueues::dispose`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispose {
    /// The ends was reclaimed
    Done,
    /// Edges still drain; the ends is reclaimed when the last one dies
    Deferred,
}

/// How long [`CanQueues::sync_wait`] may block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncWait {
    NoWait,
    Forever,
    Timeout(Duration),
}

impl CanQueues {
    /// Creates an unconnected edge with preallocated slots.
    ///
    /// Zero slot count or payload limit in `params` select the configured
    /// defaults.
    ///
    /// # Errors
    ///
    /// `InvalidParam` for an out of range priority or payload limit,
    /// `OutOfMemory` if the slots cannot be allocated. Nothing is left in
    /// the arena on failure.
    pub fn new_edge(&self, params: EdgeParams) -> Result<EdgeHandle> {
        params.validate()?;
        let slots = match params.slot_count {
            0 => self.state.settings.default_fifo_size,
            n => n,
        };
        let dlen = match params.max_data_length {
            0 => self.state.settings.default_max_data_length,
            n => n,
        };
        let fifo = Fifo::new(slots, dlen)?;
        let num = self.state.next_edge_num.fetch_add(1, Ordering::Relaxed);

        let mut edges = lock_write!(self.state.edges);
        let entry = edges.vacant_entry();
        let handle = EdgeHandle {
            key: entry.key(),
            num,
        };
        entry.insert(Arc::new(Edge::new(handle, params.prio, params.filter, fifo)));
        debug!(
            "Created {} (prio {}, {} slots, dlen {})",
            handle, params.prio, slots, dlen
        );
        Ok(handle)
    }

    /// Registers a new ends. `notify` receives its state notifications.
    pub fn ends_init(&self, name: impl Into<String>, notify: Option<Arc<dyn Notify>>) -> EndsId {
        let name = name.into();
        let serial = self.state.next_ends_serial.fetch_add(1, Ordering::Relaxed);
        let mut arena = lock_write!(self.state.ends);
        let entry = arena.vacant_entry();
        let id = EndsId {
            key: entry.key(),
            serial,
        };
        debug!("Registered {} '{}'", id, name);
        entry.insert(Arc::new(Ends::new(id, name, notify)));
        id
    }

    /// Links `edge` from `input` (producer) to `output` (consumer).
    ///
    /// The edge starts on the idle list of `output`. Both ends receive
    /// `Attach`.
    ///
    /// # Errors
    ///
    /// `EndsDead` if either ends is being disposed, `AlreadyConnected` if the
    /// edge was connected before.
    pub fn connect_edge(&self, edge: EdgeHandle, input: EndsId, output: EndsId) -> Result<()> {
        let edge = self.edge_ref(edge)?;
        let input_ends = self.ends_ref(input)?;
        let output_ends = self.ends_ref(output)?;

        {
            let mut pair = lock_ends_pair(&input_ends, &output_ends);
            if pair.input().state != EndsState::Open {
                return Err(QueueError::EndsDead(input));
            }
            if pair.output().state != EndsState::Open {
                return Err(QueueError::EndsDead(output));
            }
            let mut link = lock_mutex!(edge.link);
            if link.lifecycle != EdgeLifecycle::Unattached {
                return Err(QueueError::AlreadyConnected(edge.handle));
            }
            edge.bind(input, output)?;

            pair.input().inlist.push(edge.handle);
            pair.output().outlist.push(edge.handle);
            pair.output().idle.push_back(edge.handle);
            link.placement = Placement::Idle;
            link.lifecycle = EdgeLifecycle::Attached;
            edge.fifo.set_flag(FifoFlags::READY);
        }
        debug!("Connected {}: {} -> {}", edge.handle, input, output);

        let mut deferred = Deferred::default();
        deferred.notify_both(&edge, NotifyEvent::Attach);
        self.finish(deferred);
        Ok(())
    }

    /// Marks `edge` dead and unlinks it from both ends.
    ///
    /// Returns `Pending` while a producer or consumer still holds the edge;
    /// the edge is then reclaimed when the last reference is dropped. A
    /// handle that no longer resolves counts as already disconnected.
    pub fn disconnect_edge(&self, edge: EdgeHandle) -> Result<Detach> {
        let Some(edge) = self.lookup_edge(edge) else {
            return Ok(Detach::Done);
        };
        let mut deferred = Deferred::default();
        let status = self.detach(&edge, &mut deferred);
        self.finish(deferred);
        debug!("Disconnect {} -> {:?}", edge.handle, status);
        Ok(status)
    }

    fn detach(&self, edge: &Arc<Edge>, deferred: &mut Deferred) -> Detach {
        let pair_ends = edge
            .ends()
            .and_then(|(i, o)| Some((self.lookup_ends(i)?, self.lookup_ends(o)?)));

        let mut pair = pair_ends
            .as_ref()
            .map(|(input, output)| lock_ends_pair(input, output));
        let mut link = lock_mutex!(edge.link);

        if let Some(pair) = pair.as_mut() {
            if link.lifecycle == EdgeLifecycle::Attached {
                pair.input().unlink(edge.handle, Placement::Unlinked);
                pair.output().unlink(edge.handle, link.placement);
            }
        }
        if let Some((input, output)) = edge.ends() {
            deferred.check_ends.push(input);
            deferred.check_ends.push(output);
        }
        link.placement = Placement::Unlinked;
        edge.fifo.done();

        match link.lifecycle {
            EdgeLifecycle::Dead => Detach::Done,
            _ => {
                let used = edge.used();
                if used == 0 {
                    link.lifecycle = EdgeLifecycle::Dead;
                    deferred.reclaim.push(edge.handle);
                    deferred.notify_both(edge, NotifyEvent::Dead);
                    Detach::Done
                } else {
                    link.lifecycle = EdgeLifecycle::Detaching { pending: used };
                    Detach::Pending
                }
            }
        }
    }

    /// Flushes and disconnects `edge`.
    pub fn edge_do_dead(&self, edge: EdgeHandle) -> Result<Detach> {
        let Some(edge) = self.lookup_edge(edge) else {
            return Ok(Detach::Done);
        };
        let mut deferred = Deferred::default();
        self.flush_edge(&edge, &mut deferred, false);
        let status = self.detach(&edge, &mut deferred);
        self.finish(deferred);
        debug!("Killed {} -> {:?}", edge.handle, status);
        Ok(status)
    }

    /// Takes an external reference on `edge`, keeping it from being
    /// reclaimed until [`CanQueues::do_edge_decref`].
    pub fn edge_incref(&self, edge: EdgeHandle) -> Result<()> {
        self.edge_ref(edge)?.incref();
        Ok(())
    }

    /// Drops a reference taken with [`CanQueues::edge_incref`]. Dropping the
    /// last reference of a detaching edge reclaims it.
    pub fn do_edge_decref(&self, edge: EdgeHandle) -> Result<()> {
        let edge = self.edge_ref(edge)?;
        let mut deferred = Deferred::default();
        self.release_ref(&edge, &mut deferred);
        self.finish(deferred);
        Ok(())
    }

    pub(crate) fn release_ref(&self, edge: &Arc<Edge>, deferred: &mut Deferred) {
        if !edge.decref() {
            return;
        }
        let mut link = lock_mutex!(edge.link);
        if let EdgeLifecycle::Detaching { pending } = link.lifecycle {
            if edge.used() == 0 {
                link.lifecycle = EdgeLifecycle::Dead;
                deferred.reclaim.push(edge.handle);
                deferred.notify_both(edge, NotifyEvent::NoUsr);
                deferred.notify_both(edge, NotifyEvent::Dead);
                debug!("{} released by its last user ({} pending at detach)", edge.handle, pending);
            }
        }
    }

    /// Blocks every edge `ends` produces into.
    pub fn block_inlist(&self, ends: EndsId) -> Result<()> {
        for edge in self.inlist_edges(ends)? {
            edge.fifo.set_flag(FifoFlags::BLOCK);
        }
        Ok(())
    }

    /// Blocks every edge `ends` consumes from.
    pub fn block_outlist(&self, ends: EndsId) -> Result<()> {
        for edge in self.outlist_edges(ends)? {
            edge.fifo.set_flag(FifoFlags::BLOCK);
        }
        Ok(())
    }

    /// Asks for the death of every edge `ends` produces into, sending
    /// `DeadWanted` to both sides.
    ///
    /// With `send_rest` an edge still holding frames dies once its consumer
    /// drains it; otherwise all edges die now. Returns whether edges remain
    /// linked.
    pub fn kill_inlist(&self, ends: EndsId, send_rest: bool) -> Result<bool> {
        let target = self.ends_ref(ends)?;
        self.kill_edges(self.inlist_edges(ends)?, send_rest);
        let remaining = !lock_mutex!(target.lists).inlist.is_empty();
        Ok(remaining)
    }

    /// Kills every edge `ends` consumes from. Returns whether edges remain
    /// linked.
    pub fn kill_outlist(&self, ends: EndsId) -> Result<bool> {
        let target = self.ends_ref(ends)?;
        self.kill_edges(self.outlist_edges(ends)?, false);
        let remaining = !lock_mutex!(target.lists).outlist.is_empty();
        Ok(remaining)
    }

    fn kill_edges(&self, edges: Vec<Arc<Edge>>, send_rest: bool) {
        let mut deferred = Deferred::default();
        for edge in edges {
            deferred.notify_both(&edge, NotifyEvent::DeadWanted);
            if send_rest {
                if edge.fifo.test_and_set_flag(FifoFlags::FREEONEMPTY) {
                    continue;
                }
                // A release that drains the FIFO now consumes the request.
                if !edge.fifo.test_flag(FifoFlags::EMPTY)
                    || !edge.fifo.test_and_clear_flag(FifoFlags::FREEONEMPTY)
                {
                    trace!("{} dies once drained", edge.handle);
                    continue;
                }
            }
            deferred.kill.push(edge.handle);
        }
        self.finish(deferred);
    }

    pub fn flush_inlist(&self, ends: EndsId) -> Result<()> {
        for edge in self.inlist_edges(ends)? {
            self.flush(edge.handle)?;
        }
        Ok(())
    }

    pub fn flush_outlist(&self, ends: EndsId) -> Result<()> {
        for edge in self.outlist_edges(ends)? {
            self.flush(edge.handle)?;
        }
        Ok(())
    }

    /// Waits until no frame of `edge` is ready or being processed.
    ///
    /// Returns `Ok(true)` once drained and `Ok(false)` if it is not drained
    /// and `wait` is `NoWait` or the edge died.
    ///
    /// # Errors
    ///
    /// `Timeout` when the timeout passes first.
    pub fn sync_wait(&self, edge: EdgeHandle, wait: SyncWait) -> Result<bool> {
        let edge = self.edge_ref(edge)?;
        let outcome = match wait {
            SyncWait::NoWait => return Ok(edge.fifo.is_drained()),
            SyncWait::Forever => edge.fifo.wait_drained(None),
            SyncWait::Timeout(timeout) => edge.fifo.wait_drained(Some(Instant::now() + timeout)),
        };
        match outcome {
            DrainWait::Drained => Ok(true),
            DrainWait::Dead => Ok(false),
            DrainWait::TimedOut => Err(QueueError::Timeout),
        }
    }

    /// Waits until every edge `ends` produces into has drained.
    ///
    /// # Errors
    ///
    /// `Timeout` when `deadline` passes first.
    pub fn ends_sync_all(&self, ends: EndsId, deadline: Option<Instant>) -> Result<()> {
        for edge in self.inlist_edges(ends)? {
            if edge.fifo.wait_drained(deadline) == DrainWait::TimedOut {
                return Err(QueueError::Timeout);
            }
        }
        Ok(())
    }

    /// Tears down `ends`.
    ///
    /// Blocks the edges it produces into and, unless `nonblock` is set,
    /// waits up to the configured dispose timeout for them to drain. Then
    /// every edge is killed; with `nonblock` edges still holding frames die
    /// once drained instead. The ends is reclaimed as soon as no edge
    /// refers to it.
    pub fn dispose(&self, ends: EndsId, nonblock: bool) -> Result<Dispose> {
        let target = self.ends_ref(ends)?;
        {
            let mut lists = lock_mutex!(target.lists);
            if lists.state == EndsState::Open {
                lists.state = EndsState::Dying;
            }
        }
        debug!("Disposing {} '{}' (nonblock = {})", ends, target.name, nonblock);

        self.block_inlist(ends)?;
        if !nonblock {
            let deadline = self.state.settings.dispose_timeout.map(|t| Instant::now() + t);
            if let Err(QueueError::Timeout) = self.ends_sync_all(ends, deadline) {
                warn!(
                    "{} '{}' did not drain within {:?}, dropping pending frames",
                    ends, target.name, self.state.settings.dispose_timeout
                );
            }
        }
        // Killing the inlist may already reclaim the ends
        let inlist = self.inlist_edges(ends)?;
        let outlist = self.outlist_edges(ends)?;
        self.kill_edges(inlist, nonblock);
        self.kill_edges(outlist, false);

        self.reclaim_ends_if_detached(ends);
        if self.lookup_ends(ends).is_some() {
            debug!("{} disposal deferred until its edges drain", ends);
            Ok(Dispose::Deferred)
        } else {
            Ok(Dispose::Done)
        }
    }

    fn inlist_edges(&self, ends: EndsId) -> Result<Vec<Arc<Edge>>> {
        let ends = self.ends_ref(ends)?;
        let handles = lock_mutex!(ends.lists).inlist.clone();
        Ok(handles.into_iter().filter_map(|h| self.lookup_edge(h)).collect())
    }

    fn outlist_edges(&self, ends: EndsId) -> Result<Vec<Arc<Edge>>> {
        let ends = self.ends_ref(ends)?;
        let handles = lock_mutex!(ends.lists).outlist.clone();
        Ok(handles.into_iter().filter_map(|h| self.lookup_edge(h)).collect())
    }

    fn reclaim_ends_if_detached(&self, id: EndsId) {
        let Some(ends) = self.lookup_ends(id) else {
            return;
        };
        {
            let mut lists = lock_mutex!(ends.lists);
            if lists.state != EndsState::Dying || !lists.is_detached() {
                return;
            }
            lists.state = EndsState::Dead;
        }
        let mut arena = lock_write!(self.state.ends);
        if arena.get(id.key).is_some_and(|e| e.id == id) {
            arena.remove(id.key);
            debug!("Reclaimed {} '{}'", id, ends.name);
        }
    }

    /// Runs the work an operation postponed: drops reclaimed edges from the
    /// arena, dispatches notifications, reclaims emptied ends and performs
    /// requested kills. Must be called with no lock held.
    pub(crate) fn finish(&self, mut deferred: Deferred) {
        if deferred.is_empty() {
            return;
        }

        if !deferred.reclaim.is_empty() {
            let mut edges = lock_write!(self.state.edges);
            for handle in deferred.reclaim.drain(..) {
                if edges.get(handle.key).is_some_and(|e| e.handle == handle) {
                    edges.remove(handle.key);
                    debug!("Reclaimed {}", handle);
                }
            }
        }

        for pending in std::mem::take(&mut deferred.events) {
            let Some(ends) = self.lookup_ends(pending.ends) else {
                trace!("{:?} for {} dropped, ends gone", pending.event, pending.ends);
                continue;
            };
            if let Some(listener) = ends.listener() {
                listener.notify(pending.ends, pending.edge, pending.event);
            }
        }

        let mut checked = Vec::new();
        for id in std::mem::take(&mut deferred.check_ends) {
            if !checked.contains(&id) {
                checked.push(id);
                self.reclaim_ends_if_detached(id);
            }
        }

        for handle in std::mem::take(&mut deferred.kill) {
            if let Err(e) = self.edge_do_dead(handle) {
                warn!("Failed to kill {}: {}", handle, e);
            }
        }
    }
}
