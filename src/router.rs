//! Queue arena and frame routing.
//!
//! [`CanQueues`] owns every edge and ends. Producers obtain an [`InSlot`]
//! from one of the edges leading away from their ends, fill it and commit it
//! with [`CanQueues::put_inslot`]; consumers drain their ends with
//! [`CanQueues::test_outslot`] and hand the [`OutSlot`] back with
//! [`CanQueues::free_outslot`].
//!
//! Lock order: arena read lock, then ends lists, then edge link, then FIFO.
//! Arena write locks are only taken while no other lock is held.

use crate::edge::{Edge, EdgeHandle, Placement};
use crate::ends::{Ends, EndsId, PRIO_NR};
use crate::error::{QueueError, Result};
use crate::fifo::{FifoFlags, SlotIndex};
use crate::frame::{CanFrame, CanFrameHeader, FrameFlags, CAN_ERR_ID_TAG, CAN_FRAME_FD_DLEN};
use crate::notify::{Deferred, NotifyEvent};
use crate::{lock_mutex, lock_read};
use parking_lot::RwLock;
use slab::Slab;
use std::fmt;
use std::sync::atomic::AtomicU32;
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// Runtime knobs of a [`CanQueues`] instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSettings {
    /// Slot count of edges created without an explicit size.
    pub default_fifo_size: usize,
    /// Payload limit of edges created without an explicit limit.
    pub default_max_data_length: usize,
    /// Upper bound for blocking [`CanQueues::dispose`]; `None` waits forever.
    pub dispose_timeout: Option<Duration>,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            default_fifo_size: 64,
            default_max_data_length: CAN_FRAME_FD_DLEN,
            dispose_timeout: Some(Duration::from_secs(1)),
        }
    }
}

/// Slot taken by a producer. Committed with [`CanQueues::put_inslot`] or
/// returned with [`CanQueues::abort_inslot`]; dropping it aborts it.
#[must_use = "an InSlot keeps its edge referenced until it is put or aborted"]
pub struct InSlot {
    pub(crate) edge: Arc<Edge>,
    pub(crate) index: SlotIndex,
    cmd: u32,
    frame: CanFrame,
    owner: Option<CanQueues>,
}

impl InSlot {
    /// Takes a reference on `edge`; callers hold the edge's input ends lock.
    pub(crate) fn new(queues: &CanQueues, edge: &Arc<Edge>, index: SlotIndex, cmd: u32) -> Self {
        edge.incref();
        Self {
            edge: edge.clone(),
            index,
            cmd,
            frame: CanFrame::default(),
            owner: Some(queues.clone()),
        }
    }

    pub fn edge(&self) -> EdgeHandle {
        self.edge.handle
    }

    pub fn cmd(&self) -> u32 {
        self.cmd
    }

    /// Payload limit of the selected edge.
    pub fn max_data_length(&self) -> usize {
        self.edge.fifo.max_data_length()
    }

    pub fn frame(&self) -> &CanFrame {
        &self.frame
    }

    pub fn frame_mut(&mut self) -> &mut CanFrame {
        &mut self.frame
    }

    pub fn set_frame(&mut self, frame: CanFrame) {
        self.frame = frame;
    }
}

impl Drop for InSlot {
    fn drop(&mut self) {
        if let Some(queues) = self.owner.take() {
            trace!("InSlot on {} dropped, aborting", self.edge.handle);
            queues.abort_slot(&self.edge, self.index);
        }
    }
}

impl fmt::Debug for InSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InSlot")
            .field("edge", &self.edge.handle)
            .field("index", &self.index)
            .field("cmd", &self.cmd)
            .finish()
    }
}

/// Slot handed to a consumer. Returned with [`CanQueues::free_outslot`] or
/// [`CanQueues::push_back_outslot`]; dropping it frees it.
#[must_use = "an OutSlot keeps its edge referenced until it is freed or pushed back"]
pub struct OutSlot {
    pub(crate) edge: Arc<Edge>,
    pub(crate) index: SlotIndex,
    cmd: u32,
    frame: CanFrame,
    owner: Option<CanQueues>,
}

impl OutSlot {
    pub fn edge(&self) -> EdgeHandle {
        self.edge.handle
    }

    /// Priority class of the edge the frame came from.
    pub fn prio(&self) -> u8 {
        self.edge.prio
    }

    pub fn cmd(&self) -> u32 {
        self.cmd
    }

    pub fn frame(&self) -> &CanFrame {
        &self.frame
    }

    fn check_output(&self, ends: EndsId) -> Result<()> {
        match self.edge.ends() {
            Some((_, output)) if output == ends => Ok(()),
            _ => {
                trace!("{} does not lead to {}", self.edge.handle, ends);
                Err(QueueError::UnknownEnds(ends))
            }
        }
    }
}

impl Drop for OutSlot {
    fn drop(&mut self) {
        if let Some(queues) = self.owner.take() {
            trace!("OutSlot on {} dropped, freeing", self.edge.handle);
            queues.release_slot(&self.edge, self.index);
        }
    }
}

impl fmt::Debug for OutSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutSlot")
            .field("edge", &self.edge.handle)
            .field("index", &self.index)
            .field("frame", &self.frame)
            .finish()
    }
}

pub(crate) struct QueueState {
    pub(crate) edges: RwLock<Slab<Arc<Edge>>>,
    pub(crate) ends: RwLock<Slab<Arc<Ends>>>,
    pub(crate) next_edge_num: AtomicU32,
    pub(crate) next_ends_serial: AtomicU32,
    pub(crate) settings: QueueSettings,
}

/// Arena of edges and ends plus the routing operations over them.
///
/// Clones are handles to the same arena.
#[derive(Clone)]
pub struct CanQueues {
    pub(crate) state: Arc<QueueState>,
}

impl Default for CanQueues {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn resolve(edges: &Slab<Arc<Edge>>, handle: EdgeHandle) -> Option<&Arc<Edge>> {
    edges.get(handle.key).filter(|edge| edge.handle == handle)
}

fn readiness_changed(ret: FifoFlags) -> bool {
    ret.intersects(FifoFlags::EMPTY | FifoFlags::INACTIVE)
}

impl CanQueues {
    pub fn new() -> Self {
        Self::with_settings(QueueSettings::default())
    }

    pub fn with_settings(settings: QueueSettings) -> Self {
        Self {
            state: Arc::new(QueueState {
                edges: RwLock::new(Slab::new()),
                ends: RwLock::new(Slab::new()),
                next_edge_num: AtomicU32::new(1),
                next_ends_serial: AtomicU32::new(1),
                settings,
            }),
        }
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.state.settings
    }

    pub(crate) fn lookup_edge(&self, handle: EdgeHandle) -> Option<Arc<Edge>> {
        let edges = lock_read!(self.state.edges);
        resolve(&edges, handle).cloned()
    }

    pub(crate) fn edge_ref(&self, handle: EdgeHandle) -> Result<Arc<Edge>> {
        self.lookup_edge(handle)
            .ok_or(QueueError::UnknownEdge(handle))
    }

    pub(crate) fn lookup_ends(&self, id: EndsId) -> Option<Arc<Ends>> {
        let ends = lock_read!(self.state.ends);
        ends.get(id.key).filter(|ends| ends.id == id).cloned()
    }

    pub(crate) fn ends_ref(&self, id: EndsId) -> Result<Arc<Ends>> {
        self.lookup_ends(id).ok_or(QueueError::UnknownEnds(id))
    }

    /// Takes a free slot from the first usable edge leading away from `ends`.
    ///
    /// Dead and blocked edges are skipped, as are full edges while another
    /// edge still has room. `cmd` is stored in the slot's command byte.
    ///
    /// # Errors
    ///
    /// `Overrun` when every usable edge is full (the overrun is recorded on
    /// the first of them), `Blocked` when only blocked edges exist, and
    /// `NoEdge` when the ends has no edge at all.
    pub fn get_inslot(&self, ends: EndsId, cmd: u32) -> Result<InSlot> {
        let ends = self.ends_ref(ends)?;
        let edges = lock_read!(self.state.edges);
        let lists = lock_mutex!(ends.lists);

        let mut first_full: Option<&Arc<Edge>> = None;
        let mut overrun_recorded = false;
        let mut blocked = None;
        for &handle in &lists.inlist {
            let Some(edge) = resolve(&edges, handle) else {
                continue;
            };
            let flags = edge.fifo.flags();
            if flags.contains(FifoFlags::DEAD) {
                continue;
            }
            if flags.contains(FifoFlags::BLOCK) {
                blocked.get_or_insert(handle);
                continue;
            }
            if !flags.contains(FifoFlags::FULL) {
                if let Some(index) = edge.fifo.acquire(cmd) {
                    trace!("cmd = {} found {}", cmd, handle);
                    return Ok(InSlot::new(self, edge, index, cmd));
                }
                overrun_recorded = true;
            }
            first_full.get_or_insert(edge);
        }

        if let Some(edge) = first_full {
            if !overrun_recorded {
                if let Some(index) = edge.fifo.acquire(cmd) {
                    return Ok(InSlot::new(self, edge, index, cmd));
                }
            }
            trace!("cmd = {} failed, {} is full", cmd, edge.handle);
            return Err(QueueError::Overrun { edge: edge.handle });
        }
        match blocked {
            Some(edge) => Err(QueueError::Blocked { edge }),
            None => Err(QueueError::NoEdge),
        }
    }

    /// Takes a free slot from the edge best matching `header` and `prio`.
    ///
    /// Only edges whose filter accepts the header are considered; when any
    /// of them has an explicit identifier mask, catch-all edges are ignored.
    /// The winner is the edge with the greatest priority not above `prio`,
    /// or the lowest priority edge if all are above it. Ties go to the
    /// oldest edge. With no header every edge is a candidate.
    ///
    /// Only the winning edge is tried; if it is full the call fails with
    /// `Overrun`.
    pub fn get_inslot_for_prio(
        &self,
        ends: EndsId,
        header: Option<&CanFrameHeader>,
        cmd: u32,
        prio: u8,
    ) -> Result<InSlot> {
        let ends = self.ends_ref(ends)?;
        let edges = lock_read!(self.state.edges);
        let lists = lock_mutex!(ends.lists);

        let mut candidates: Vec<&Arc<Edge>> = Vec::with_capacity(lists.inlist.len());
        let mut blocked = None;
        for &handle in &lists.inlist {
            let Some(edge) = resolve(&edges, handle) else {
                continue;
            };
            let flags = edge.fifo.flags();
            if flags.contains(FifoFlags::DEAD) {
                continue;
            }
            if let Some(header) = header {
                if !edge.filter.matches_header(header) {
                    continue;
                }
            }
            if flags.contains(FifoFlags::BLOCK) {
                blocked.get_or_insert(handle);
                continue;
            }
            candidates.push(edge);
        }

        if header.is_some() && candidates.iter().any(|e| !e.filter.is_catch_all()) {
            candidates.retain(|e| !e.filter.is_catch_all());
        }

        let best = candidates
            .iter()
            .filter(|e| e.prio <= prio)
            .max_by(|a, b| a.prio.cmp(&b.prio).then(b.handle.num.cmp(&a.handle.num)))
            .or_else(|| {
                candidates
                    .iter()
                    .min_by(|a, b| a.prio.cmp(&b.prio).then(a.handle.num.cmp(&b.handle.num)))
            });

        let Some(edge) = best else {
            trace!("cmd = {} prio = {} found no edge", cmd, prio);
            return Err(match blocked {
                Some(edge) => QueueError::Blocked { edge },
                None => QueueError::NoEdge,
            });
        };
        match edge.fifo.acquire(cmd) {
            Some(index) => {
                trace!("cmd = {} prio = {} found {}", cmd, prio, edge.handle);
                Ok(InSlot::new(self, edge, index, cmd))
            }
            None => {
                trace!("cmd = {} prio = {} failed, {} is full", cmd, prio, edge.handle);
                Err(QueueError::Overrun { edge: edge.handle })
            }
        }
    }

    /// Reports whether [`CanQueues::get_inslot`] would currently find room,
    /// without taking a slot.
    pub fn test_inslot(&self, ends: EndsId) -> Result<bool> {
        let ends = self.ends_ref(ends)?;
        let edges = lock_read!(self.state.edges);
        let lists = lock_mutex!(ends.lists);
        Ok(lists.inlist.iter().any(|&handle| {
            resolve(&edges, handle).is_some_and(|edge| {
                !edge
                    .fifo
                    .test_flag(FifoFlags::DEAD | FifoFlags::BLOCK | FifoFlags::FULL)
            })
        }))
    }

    /// Commits a filled producer slot.
    ///
    /// Activates the edge on its output ends and sends `Proc` when the FIFO
    /// was empty or idle. A frame longer than the edge's payload limit is
    /// discarded and the slot returned to the free list.
    pub fn put_inslot(&self, mut slot: InSlot) -> Result<()> {
        slot.owner = None;
        let edge = &slot.edge;
        let frame = &slot.frame;
        let mut deferred = Deferred::default();

        let result = if frame.dlen() > edge.fifo.max_data_length() {
            if edge.fifo.abort(slot.index).contains(FifoFlags::FULL) {
                deferred.notify_input(edge, NotifyEvent::Space);
            }
            Err(QueueError::FrameTooLong {
                dlen: frame.dlen(),
                max: edge.fifo.max_data_length(),
            })
        } else {
            let ret = edge.fifo.commit(slot.index, frame);
            edge.record_delivery();
            if readiness_changed(ret) {
                self.activate_edge(edge);
                deferred.notify_output(edge, NotifyEvent::Proc);
            }
            Ok(())
        };
        trace!("put_inslot on {} -> {:?}", edge.handle, result.as_ref().map(|_| ()));

        self.release_ref(edge, &mut deferred);
        self.finish(deferred);
        result
    }

    /// Returns an unfilled producer slot. Sends `Space` to the producer side
    /// when the edge had been full.
    pub fn abort_inslot(&self, mut slot: InSlot) {
        slot.owner = None;
        trace!("abort_inslot on {}", slot.edge.handle);
        self.abort_slot(&slot.edge, slot.index);
    }

    pub(crate) fn abort_slot(&self, edge: &Arc<Edge>, index: SlotIndex) {
        let mut deferred = Deferred::default();
        if edge.fifo.abort(index).contains(FifoFlags::FULL) {
            deferred.notify_input(edge, NotifyEvent::Space);
        }
        self.release_ref(edge, &mut deferred);
        self.finish(deferred);
    }

    /// Delivers a copy of `frame` to every edge leading away from `ends`
    /// whose filter accepts it, with `extra` or-ed into the header flags.
    ///
    /// `src_edge` names the edge the frame arrived on. It is never fed back,
    /// edges leading to its producer see the frame as an `ECHO` and receive
    /// it only if their filter asks for echoes. A `TXERR` frame goes to at
    /// most one edge and, when the producer is known, only to edges leading
    /// back to it. Error frames get [`CAN_ERR_ID_TAG`] in the identifier.
    ///
    /// A full edge records an overrun and is skipped; delivery to the other
    /// edges continues. Returns the number of edges the frame reached.
    pub fn filter_frame_to_edges(
        &self,
        ends: EndsId,
        src_edge: Option<EdgeHandle>,
        frame: &CanFrame,
        extra: FrameFlags,
    ) -> Result<usize> {
        let ends = self.ends_ref(ends)?;
        let src_input = src_edge
            .and_then(|h| self.lookup_edge(h))
            .and_then(|edge| edge.ends())
            .map(|(input, _)| input);
        let is_txerr = extra.contains(FrameFlags::TXERR);
        let base = extra - FrameFlags::ECHO;

        let mut delivered = 0usize;
        let mut activate = Vec::new();
        {
            let edges = lock_read!(self.state.edges);
            let lists = lock_mutex!(ends.lists);
            for &handle in &lists.inlist {
                if Some(handle) == src_edge {
                    continue;
                }
                let Some(edge) = resolve(&edges, handle) else {
                    continue;
                };
                if edge.fifo.test_flag(FifoFlags::DEAD | FifoFlags::BLOCK) {
                    continue;
                }

                let leads_back = match (src_input, edge.ends()) {
                    (Some(src), Some((_, output))) => output == src,
                    _ => false,
                };
                if is_txerr && src_input.is_some() && !leads_back {
                    continue;
                }
                let add = if leads_back && !is_txerr {
                    base | FrameFlags::ECHO
                } else {
                    base
                };
                if !edge.filter.matches(frame.id(), frame.flags() | add) {
                    continue;
                }
                if add.contains(FrameFlags::ECHO) && !edge.filter.wants_echo() {
                    continue;
                }
                if frame.dlen() > edge.fifo.max_data_length() {
                    trace!(
                        "{} skipped, dlen {} over {}",
                        handle,
                        frame.dlen(),
                        edge.fifo.max_data_length()
                    );
                    continue;
                }

                let Some(index) = edge.fifo.acquire(0) else {
                    trace!("{} overrun", handle);
                    continue;
                };
                let mut copy = *frame;
                copy.header.flags |= add;
                if copy.header.flags.contains(FrameFlags::ERR) {
                    copy.header.can_id |= CAN_ERR_ID_TAG;
                }
                let ret = edge.fifo.commit(index, &copy);
                edge.record_delivery();
                delivered += 1;
                if readiness_changed(ret) {
                    activate.push(edge.clone());
                }
                if is_txerr {
                    break;
                }
            }
        }

        let mut deferred = Deferred::default();
        for edge in &activate {
            self.activate_edge(edge);
            deferred.notify_output(edge, NotifyEvent::Proc);
        }
        self.finish(deferred);
        trace!("sent frame {:#x} to {} edges", frame.id(), delivered);
        Ok(delivered)
    }

    /// Takes the oldest ready frame of the highest priority class with
    /// ready edges.
    ///
    /// Edges of one class are served round robin. Dead or drained edges met
    /// on the way are moved to the idle list.
    pub fn test_outslot(&self, ends: EndsId) -> Result<Option<OutSlot>> {
        let ends = self.ends_ref(ends)?;
        let edges = lock_read!(self.state.edges);
        let mut lists = lock_mutex!(ends.lists);

        for prio in (0..PRIO_NR).rev() {
            while let Some(&handle) = lists.active[prio].front() {
                lists.active[prio].pop_front();
                let Some(edge) = resolve(&edges, handle) else {
                    continue;
                };
                let mut link = lock_mutex!(edge.link);
                if edge.fifo.test_flag(FifoFlags::DEAD) {
                    edge.fifo.set_flag(FifoFlags::INACTIVE);
                    lists.idle.push_back(handle);
                    link.placement = Placement::Idle;
                    continue;
                }

                let taken = edge.fifo.retrieve();
                if edge.fifo.mark_inactive_if_drained() {
                    lists.idle.push_back(handle);
                    link.placement = Placement::Idle;
                } else {
                    lists.active[prio].push_back(handle);
                }

                if let Some(taken) = taken {
                    trace!("found {} in class {}", handle, prio);
                    edge.incref();
                    return Ok(Some(OutSlot {
                        edge: edge.clone(),
                        index: taken.index,
                        cmd: taken.cmd,
                        frame: taken.frame,
                        owner: Some(self.clone()),
                    }));
                }
            }
        }
        Ok(None)
    }

    /// Highest priority class `>= min` holding a ready frame, without
    /// taking it.
    pub fn pending_outslot_prio(&self, ends: EndsId, min: u8) -> Result<Option<u8>> {
        let ends = self.ends_ref(ends)?;
        let edges = lock_read!(self.state.edges);
        let lists = lock_mutex!(ends.lists);

        for prio in (usize::from(min)..PRIO_NR).rev() {
            let ready = lists.active[prio].iter().any(|&handle| {
                resolve(&edges, handle).is_some_and(|edge| {
                    !edge.fifo.test_flag(FifoFlags::DEAD) && edge.fifo.is_out_ready()
                })
            });
            if ready {
                return Ok(Some(prio as u8));
            }
        }
        Ok(None)
    }

    /// Returns a processed consumer slot to its edge's free list.
    ///
    /// Sends `Empty` and `Space` to the producer side as the FIFO drains or
    /// regains room, moves a drained edge to the idle list of its output
    /// ends, and kills the edge if it was waiting to drain before dying.
    /// Returns the transitions reported by the FIFO.
    ///
    /// # Errors
    ///
    /// `UnknownEnds` if `ends` is not the output ends of the slot's edge.
    /// The slot is freed all the same.
    pub fn free_outslot(&self, ends: EndsId, mut slot: OutSlot) -> Result<FifoFlags> {
        slot.check_output(ends)?;
        slot.owner = None;
        Ok(self.release_slot(&slot.edge, slot.index))
    }

    pub(crate) fn release_slot(&self, edge: &Arc<Edge>, index: SlotIndex) -> FifoFlags {
        let ret = edge.fifo.release(index);
        let mut deferred = Deferred::default();

        if ret.contains(FifoFlags::EMPTY) {
            deferred.notify_input(edge, NotifyEvent::Empty);
        }
        if ret.contains(FifoFlags::FULL) {
            deferred.notify_input(edge, NotifyEvent::Space);
        }
        if ret.contains(FifoFlags::INACTIVE) {
            if let Some(ends) = edge.ends().and_then(|(_, output)| self.lookup_ends(output)) {
                self.idle_if_drained(&ends, edge);
            }
        }
        if ret.contains(FifoFlags::FREEONEMPTY) {
            deferred.kill.push(edge.handle);
        }
        trace!("free_outslot on {} -> {:?}", edge.handle, ret);

        self.release_ref(edge, &mut deferred);
        self.finish(deferred);
        ret
    }

    /// Hands a consumer slot back so the same frame is retrieved again
    /// first. An idle edge is reactivated at the front of its class. On a
    /// dead edge the frame is dropped instead.
    ///
    /// # Errors
    ///
    /// `UnknownEnds` if `ends` is not the output ends of the slot's edge.
    /// The slot is freed in that case.
    pub fn push_back_outslot(&self, ends: EndsId, mut slot: OutSlot) -> Result<()> {
        slot.check_output(ends)?;
        if slot.edge.fifo.test_flag(FifoFlags::DEAD) {
            self.free_outslot(ends, slot)?;
            return Ok(());
        }

        slot.owner = None;
        let edge = &slot.edge;
        edge.fifo.again(slot.index);
        if let Some(ends) = self.lookup_ends(ends) {
            let mut lists = lock_mutex!(ends.lists);
            let mut link = lock_mutex!(edge.link);
            if link.placement == Placement::Idle {
                lists.unplace(edge.handle, Placement::Idle);
                lists.active[usize::from(edge.prio)].push_front(edge.handle);
                link.placement = Placement::Active(edge.prio);
            }
            edge.fifo.clear_flag(FifoFlags::INACTIVE);
        }

        let mut deferred = Deferred::default();
        self.release_ref(edge, &mut deferred);
        self.finish(deferred);
        Ok(())
    }

    /// Discards every ready frame of `edge`. Returns whether anything
    /// changed.
    pub fn flush(&self, edge: EdgeHandle) -> Result<bool> {
        let edge = self.edge_ref(edge)?;
        let mut deferred = Deferred::default();
        let changed = self.flush_edge(&edge, &mut deferred, true);
        self.finish(deferred);
        Ok(changed)
    }

    pub(crate) fn flush_edge(
        &self,
        edge: &Arc<Edge>,
        deferred: &mut Deferred,
        kill_on_drain: bool,
    ) -> bool {
        let ret = edge.fifo.flush_slots();
        if !ret.is_empty() {
            deferred.notify_input(edge, NotifyEvent::Empty);
            deferred.notify_input(edge, NotifyEvent::Space);
            if let Some((_, output)) = edge.ends() {
                if let Some(ends) = self.lookup_ends(output) {
                    self.idle_if_drained(&ends, edge);
                }
            }
        }
        if kill_on_drain && ret.contains(FifoFlags::FREEONEMPTY) {
            deferred.kill.push(edge.handle);
        }
        trace!("flush {} -> {:?}", edge.handle, ret);
        !ret.is_empty()
    }

    /// Moves an idle edge onto the active list of its priority class.
    pub(crate) fn activate_edge(&self, edge: &Arc<Edge>) {
        let Some((_, output)) = edge.ends() else {
            return;
        };
        let Some(ends) = self.lookup_ends(output) else {
            return;
        };
        let mut lists = lock_mutex!(ends.lists);
        let mut link = lock_mutex!(edge.link);
        if link.placement == Placement::Idle && !edge.fifo.test_flag(FifoFlags::DEAD) {
            let to = Placement::Active(edge.prio);
            lists.move_edge(edge.handle, Placement::Idle, to);
            link.placement = to;
            trace!("{} activated in class {}", edge.handle, edge.prio);
        }
    }

    /// Moves an active edge without ready frames to the idle list.
    pub(crate) fn idle_if_drained(&self, ends: &Ends, edge: &Edge) {
        let mut lists = lock_mutex!(ends.lists);
        let mut link = lock_mutex!(edge.link);
        match link.placement {
            Placement::Active(_) => {
                if edge.fifo.mark_inactive_if_drained() {
                    lists.move_edge(edge.handle, link.placement, Placement::Idle);
                    link.placement = Placement::Idle;
                }
            }
            Placement::Idle => {
                edge.fifo.mark_inactive_if_drained();
            }
            Placement::Unlinked => {}
        }
    }
}
