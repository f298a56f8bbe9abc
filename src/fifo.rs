//! Bounded slot FIFO backing a single edge.
//!
//! A `Fifo` owns a fixed array of slots allocated once at creation time. The
//! slots are threaded through two index-linked lists: the ready list (frames
//! committed by a producer and not yet retrieved, in commit order) and the
//! free list. A slot taken off either list is accounted in `in_taken`
//! (filling producer) or `out_taken` (draining consumer) until it is handed
//! back, so at every instant
//!
//! `in_taken + out_taken + ready + free == allocated_slot_count`.
//!
//! State flags live in an atomic word so that routing code can test them
//! without taking the FIFO lock; every flag change that must be consistent
//! with the lists is done while the lock is held.

use crate::error::{QueueError, Result};
use crate::frame::{CanFrame, CAN_FRAME_MAX_DLEN};
use bitflags::bitflags;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

bitflags! {
    /// FIFO state flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FifoFlags: u32 {
        /// Edge destruction requested
        const DESTROY = 1 << 15;
        /// An error was recorded in `error_code`
        const ERROR = 1 << 14;
        /// Turn errors into `BLOCK`
        const ERR2BLOCK = 1 << 13;
        /// No new slots are handed out
        const BLOCK = 1 << 12;
        /// A producer failed to get a slot
        const OVERRUN = 1 << 11;
        /// The free list is empty
        const FULL = 1 << 10;
        /// No ready slots and no slot held by a consumer
        const EMPTY = 1 << 9;
        /// The edge is disconnected
        const DEAD = 1 << 8;
        /// The edge sits on the idle list of its output ends
        const INACTIVE = 1 << 7;
        /// Kill the edge once it drains
        const FREEONEMPTY = 1 << 6;
        /// The edge has been connected
        const READY = 1 << 5;
        /// A notification is pending
        const NOTIFYPEND = 1 << 4;
    }
}

/// Low byte of the slot flags word, available to producers as a command tag.
pub const SLOT_CMD_MASK: u32 = 0x00ff;

/// `error_code` value recorded on overrun.
pub const FIFO_ERR_OVERRUN: i32 = 1;

/// Position of a slot in the FIFO's slot array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotIndex(u32);

impl SlotIndex {
    pub fn get(self) -> usize {
        self.0 as usize
    }
}

/// A slot removed from the ready list by [`Fifo::retrieve`].
#[derive(Debug, Clone, Copy)]
pub struct Taken {
    pub index: SlotIndex,
    pub cmd: u32,
    pub frame: CanFrame,
}

/// Outcome of [`Fifo::wait_drained`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainWait {
    Drained,
    Dead,
    TimedOut,
}

/// Snapshot of slot accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FifoAccounting {
    pub allocated: usize,
    pub free: usize,
    pub ready: usize,
    pub in_taken: usize,
    pub out_taken: usize,
}

impl FifoAccounting {
    /// Every slot is in exactly one place.
    pub fn is_consistent(&self) -> bool {
        self.in_taken + self.out_taken + self.ready + self.free == self.allocated
    }
}

struct Slot {
    next: Option<u32>,
    flags: u32,
    frame: CanFrame,
}

struct FifoInner {
    slots: Vec<Slot>,
    head: Option<u32>,
    tail: Option<u32>,
    free_head: Option<u32>,
    ready: usize,
    free: usize,
    in_taken: usize,
    out_taken: usize,
    overruns: u64,
    error_code: i32,
}

impl FifoInner {
    fn is_drained(&self) -> bool {
        self.head.is_none() && self.out_taken == 0
    }

    fn push_free(&mut self, idx: u32) {
        let head = self.free_head;
        self.slots[idx as usize].next = head;
        self.free_head = Some(idx);
        self.free += 1;
    }
}

/// Bounded queue of preallocated frame slots.
pub struct Fifo {
    flags: AtomicU32,
    inner: Mutex<FifoInner>,
    drained: Condvar,
    allocated: usize,
    max_data_length: usize,
}

impl Fifo {
    /// Allocates `slot_count` slots able to carry `max_data_length` payload
    /// bytes each.
    ///
    /// # Errors
    ///
    /// `InvalidParam` for a zero slot count or a data length above 64 bytes,
    /// `OutOfMemory` when the slot array cannot be reserved.
    pub fn new(slot_count: usize, max_data_length: usize) -> Result<Self> {
        if slot_count == 0 || slot_count > u32::MAX as usize {
            return Err(QueueError::invalid_param(format!(
                "slot count {} out of range",
                slot_count
            )));
        }
        if max_data_length > CAN_FRAME_MAX_DLEN {
            return Err(QueueError::invalid_param(format!(
                "max data length {} exceeds {}",
                max_data_length, CAN_FRAME_MAX_DLEN
            )));
        }

        let mut slots = Vec::new();
        slots
            .try_reserve_exact(slot_count)
            .map_err(|_| QueueError::OutOfMemory { slots: slot_count })?;
        slots.extend((0..slot_count).map(|_| Slot {
            next: None,
            flags: 0,
            frame: CanFrame::default(),
        }));

        let mut fifo = Self {
            flags: AtomicU32::new(0),
            inner: Mutex::new(FifoInner {
                slots,
                head: None,
                tail: None,
                free_head: None,
                ready: 0,
                free: 0,
                in_taken: 0,
                out_taken: 0,
                overruns: 0,
                error_code: 0,
            }),
            drained: Condvar::new(),
            allocated: slot_count,
            max_data_length,
        };
        fifo.init_slots();
        fifo.set_flag(FifoFlags::INACTIVE);
        Ok(fifo)
    }

    /// Threads every slot onto the free list in array order and marks the
    /// FIFO empty. Requires exclusive access, so no slot can be held.
    pub fn init_slots(&mut self) {
        let inner = self.inner.get_mut();
        let count = inner.slots.len() as u32;
        for i in 0..count {
            inner.slots[i as usize].next = if i + 1 < count { Some(i + 1) } else { None };
            inner.slots[i as usize].flags = 0;
        }
        inner.free_head = if count > 0 { Some(0) } else { None };
        inner.free = count as usize;
        inner.head = None;
        inner.tail = None;
        inner.ready = 0;
        inner.in_taken = 0;
        inner.out_taken = 0;
        self.clear_flag(FifoFlags::FULL);
        self.set_flag(FifoFlags::EMPTY);
    }

    pub fn allocated_slot_count(&self) -> usize {
        self.allocated
    }

    pub fn max_data_length(&self) -> usize {
        self.max_data_length
    }

    pub fn flags(&self) -> FifoFlags {
        FifoFlags::from_bits_retain(self.flags.load(Ordering::Acquire))
    }

    pub fn test_flag(&self, flag: FifoFlags) -> bool {
        self.flags().intersects(flag)
    }

    pub fn set_flag(&self, flag: FifoFlags) {
        self.flags.fetch_or(flag.bits(), Ordering::AcqRel);
    }

    pub fn clear_flag(&self, flag: FifoFlags) {
        self.flags.fetch_and(!flag.bits(), Ordering::AcqRel);
    }

    /// Sets `flag` and returns whether it was already set.
    pub fn test_and_set_flag(&self, flag: FifoFlags) -> bool {
        self.flags.fetch_or(flag.bits(), Ordering::AcqRel) & flag.bits() != 0
    }

    /// Clears `flag` and returns whether it was set.
    pub fn test_and_clear_flag(&self, flag: FifoFlags) -> bool {
        self.flags.fetch_and(!flag.bits(), Ordering::AcqRel) & flag.bits() != 0
    }

    /// Takes a slot off the free list for a producer.
    ///
    /// Never blocks. On an empty free list the FIFO records an overrun
    /// (`OVERRUN|FULL|ERROR`, plus `BLOCK` when `ERR2BLOCK` is set) and
    /// `None` is returned.
    pub fn acquire(&self, cmd: u32) -> Option<SlotIndex> {
        let mut inner = self.inner.lock();
        let Some(idx) = inner.free_head else {
            inner.overruns += 1;
            inner.error_code = FIFO_ERR_OVERRUN;
            let mut flags = FifoFlags::OVERRUN | FifoFlags::FULL | FifoFlags::ERROR;
            if self.test_flag(FifoFlags::ERR2BLOCK) {
                flags |= FifoFlags::BLOCK;
            }
            self.set_flag(flags);
            return None;
        };

        let slot = &mut inner.slots[idx as usize];
        let next = slot.next.take();
        slot.flags = cmd & SLOT_CMD_MASK;
        inner.free_head = next;
        inner.free -= 1;
        inner.in_taken += 1;
        if inner.free_head.is_none() {
            self.set_flag(FifoFlags::FULL);
        }
        Some(SlotIndex(idx))
    }

    /// Appends a filled slot to the ready list tail.
    ///
    /// Returns the subset of `EMPTY | INACTIVE` this commit cleared; a
    /// non-empty result means the edge has to be activated.
    pub fn commit(&self, index: SlotIndex, frame: &CanFrame) -> FifoFlags {
        let mut inner = self.inner.lock();
        let idx = index.0;
        {
            let slot = &mut inner.slots[idx as usize];
            slot.frame = *frame;
            slot.next = None;
        }
        let tail = inner.tail;
        match tail {
            Some(tail) => inner.slots[tail as usize].next = Some(idx),
            None => inner.head = Some(idx),
        }
        inner.tail = Some(idx);
        inner.ready += 1;
        inner.in_taken -= 1;

        let mut ret = FifoFlags::empty();
        if self.test_and_clear_flag(FifoFlags::EMPTY) {
            ret |= FifoFlags::EMPTY;
        }
        if self.test_and_clear_flag(FifoFlags::INACTIVE) {
            ret |= FifoFlags::INACTIVE;
        }
        ret
    }

    /// Returns a producer slot to the free list without committing it.
    ///
    /// Reports `FULL` when the abort made space available again.
    pub fn abort(&self, index: SlotIndex) -> FifoFlags {
        let mut inner = self.inner.lock();
        inner.push_free(index.0);
        inner.in_taken -= 1;
        if self.test_and_clear_flag(FifoFlags::FULL) {
            FifoFlags::FULL
        } else {
            FifoFlags::empty()
        }
    }

    /// Pops the oldest ready slot for a consumer.
    pub fn retrieve(&self) -> Option<Taken> {
        let mut inner = self.inner.lock();
        let idx = inner.head?;
        let (next, cmd, frame) = {
            let slot = &mut inner.slots[idx as usize];
            (slot.next.take(), slot.flags & SLOT_CMD_MASK, slot.frame)
        };
        inner.head = next;
        if next.is_none() {
            inner.tail = None;
        }
        inner.ready -= 1;
        inner.out_taken += 1;
        Some(Taken {
            index: SlotIndex(idx),
            cmd,
            frame,
        })
    }

    /// Returns a consumer slot to the free list.
    ///
    /// The result reports what the release changed:
    /// - `FULL`: the FIFO was full and has space again
    /// - `INACTIVE`: no ready slots remain, the edge may go idle
    /// - `EMPTY`: the FIFO just became empty
    /// - `FREEONEMPTY`: the FIFO drained with a pending kill request, which
    ///   this call consumed
    pub fn release(&self, index: SlotIndex) -> FifoFlags {
        let mut inner = self.inner.lock();
        inner.push_free(index.0);
        inner.out_taken -= 1;

        let mut ret = FifoFlags::empty();
        if self.test_and_clear_flag(FifoFlags::FULL) {
            ret |= FifoFlags::FULL;
        }
        if inner.head.is_none() {
            ret |= FifoFlags::INACTIVE;
            if inner.out_taken == 0 {
                if !self.test_and_set_flag(FifoFlags::EMPTY) {
                    ret |= FifoFlags::EMPTY;
                }
                if self.test_and_clear_flag(FifoFlags::FREEONEMPTY) {
                    ret |= FifoFlags::FREEONEMPTY;
                }
                self.drained.notify_all();
            }
        }
        ret
    }

    /// Puts a consumer slot back at the head of the ready list so it is the
    /// next one retrieved.
    pub fn again(&self, index: SlotIndex) {
        let mut inner = self.inner.lock();
        let idx = index.0;
        let head = inner.head;
        inner.slots[idx as usize].next = head;
        inner.head = Some(idx);
        if inner.tail.is_none() {
            inner.tail = Some(idx);
        }
        inner.ready += 1;
        inner.out_taken -= 1;
        self.clear_flag(FifoFlags::EMPTY);
    }

    /// Moves every ready slot to the free list. Slots held by a producer or
    /// consumer are left alone.
    ///
    /// Returns `INACTIVE` when ready slots were discarded, `EMPTY` when the
    /// FIFO became empty and `FREEONEMPTY` when that consumed a pending kill
    /// request; an empty result means nothing changed.
    pub fn flush_slots(&self) -> FifoFlags {
        let mut inner = self.inner.lock();
        let mut ret = FifoFlags::empty();
        if let (Some(head), Some(tail)) = (inner.head, inner.tail) {
            let free_head = inner.free_head;
            inner.slots[tail as usize].next = free_head;
            inner.free_head = Some(head);
            inner.free += inner.ready;
            inner.ready = 0;
            inner.head = None;
            inner.tail = None;
            ret |= FifoFlags::INACTIVE;
        }
        if inner.free_head.is_some() {
            self.clear_flag(FifoFlags::FULL);
        }
        self.set_flag(FifoFlags::INACTIVE);
        if inner.out_taken == 0 {
            if !self.test_and_set_flag(FifoFlags::EMPTY) {
                ret |= FifoFlags::EMPTY;
            }
            if self.test_and_clear_flag(FifoFlags::FREEONEMPTY) {
                ret |= FifoFlags::FREEONEMPTY;
            }
            self.drained.notify_all();
        }
        ret
    }

    pub fn is_out_ready(&self) -> bool {
        self.inner.lock().head.is_some()
    }

    pub fn is_drained(&self) -> bool {
        self.inner.lock().is_drained()
    }

    /// Sets `INACTIVE` if no ready slot remains, atomically with respect to
    /// [`Fifo::commit`]. Returns whether the flag was set.
    pub fn mark_inactive_if_drained(&self) -> bool {
        let inner = self.inner.lock();
        if inner.head.is_none() {
            self.set_flag(FifoFlags::INACTIVE);
            true
        } else {
            false
        }
    }

    /// Marks the FIFO dead and wakes every waiter.
    pub fn done(&self) {
        let _inner = self.inner.lock();
        self.set_flag(FifoFlags::DEAD | FifoFlags::BLOCK);
        self.drained.notify_all();
    }

    /// Blocks until no slot is ready or held by a consumer, the FIFO dies,
    /// or `deadline` passes. `None` waits without a deadline.
    pub fn wait_drained(&self, deadline: Option<Instant>) -> DrainWait {
        let mut inner = self.inner.lock();
        loop {
            if inner.is_drained() {
                return DrainWait::Drained;
            }
            if self.test_flag(FifoFlags::DEAD) {
                return DrainWait::Dead;
            }
            match deadline {
                Some(deadline) => {
                    if self.drained.wait_until(&mut inner, deadline).timed_out() {
                        return if inner.is_drained() {
                            DrainWait::Drained
                        } else {
                            DrainWait::TimedOut
                        };
                    }
                }
                None => self.drained.wait(&mut inner),
            }
        }
    }

    pub fn overruns(&self) -> u64 {
        self.inner.lock().overruns
    }

    pub fn error_code(&self) -> i32 {
        self.inner.lock().error_code
    }

    /// Clears the recorded error and its flags.
    pub fn clear_error(&self) {
        let mut inner = self.inner.lock();
        inner.error_code = 0;
        self.clear_flag(FifoFlags::ERROR | FifoFlags::OVERRUN);
    }

    pub fn accounting(&self) -> FifoAccounting {
        let inner = self.inner.lock();
        FifoAccounting {
            allocated: self.allocated,
            free: inner.free,
            ready: inner.ready,
            in_taken: inner.in_taken,
            out_taken: inner.out_taken,
        }
    }
}

impl std::fmt::Debug for Fifo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fifo")
            .field("flags", &self.flags())
            .field("accounting", &self.accounting())
            .field("max_data_length", &self.max_data_length)
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    fn frame(id: u32) -> CanFrame {
        CanFrame::new(id, &[id as u8]).expect("valid frame")
    }

    #[test]
    fn test_new_fifo_is_empty_and_inactive() {
        let fifo = Fifo::new(4, 8).expect("fifo");
        assert!(fifo.test_flag(FifoFlags::EMPTY));
        assert!(fifo.test_flag(FifoFlags::INACTIVE));
        assert!(!fifo.test_flag(FifoFlags::FULL));
        let acc = fifo.accounting();
        assert_eq!(acc.free, 4);
        assert!(acc.is_consistent());
    }

    #[test]
    fn test_invalid_parameters() {
        assert!(matches!(Fifo::new(0, 8), Err(QueueError::InvalidParam(_))));
        assert!(matches!(Fifo::new(4, 65), Err(QueueError::InvalidParam(_))));
    }

    #[test]
    fn test_capacity_overrun_and_abort() {
        let fifo = Fifo::new(4, 8).expect("fifo");
        let slots: Vec<_> = (0..4).map(|_| fifo.acquire(0).expect("slot")).collect();
        assert!(fifo.test_flag(FifoFlags::FULL));

        assert!(fifo.acquire(0).is_none());
        assert!(fifo.flags().contains(FifoFlags::OVERRUN | FifoFlags::FULL));
        assert_eq!(fifo.overruns(), 1);
        assert_eq!(fifo.error_code(), FIFO_ERR_OVERRUN);

        let ret = fifo.abort(slots[0]);
        assert_eq!(ret, FifoFlags::FULL);
        assert!(fifo.acquire(0).is_some());
        assert!(fifo.accounting().is_consistent());
    }

    #[test]
    fn test_err2block_blocks_on_overrun() {
        let fifo = Fifo::new(1, 8).expect("fifo");
        fifo.set_flag(FifoFlags::ERR2BLOCK);
        let _slot = fifo.acquire(0).expect("slot");
        assert!(fifo.acquire(0).is_none());
        assert!(fifo.test_flag(FifoFlags::BLOCK));

        fifo.clear_error();
        assert!(!fifo.test_flag(FifoFlags::ERROR));
        assert_eq!(fifo.error_code(), 0);
    }

    #[test]
    fn test_commit_order_is_preserved() {
        let fifo = Fifo::new(8, 8).expect("fifo");
        for id in 1..=5 {
            let idx = fifo.acquire(id).expect("slot");
            fifo.commit(idx, &frame(id));
        }
        for id in 1..=5 {
            let taken = fifo.retrieve().expect("ready slot");
            assert_eq!(taken.frame.id(), id);
            assert_eq!(taken.cmd, id);
            fifo.release(taken.index);
        }
        assert!(fifo.retrieve().is_none());
        assert!(fifo.test_flag(FifoFlags::EMPTY));
    }

    #[test]
    fn test_commit_reports_cleared_flags() {
        let fifo = Fifo::new(2, 8).expect("fifo");
        let idx = fifo.acquire(0).expect("slot");
        let ret = fifo.commit(idx, &frame(1));
        assert_eq!(ret, FifoFlags::EMPTY | FifoFlags::INACTIVE);

        let idx = fifo.acquire(0).expect("slot");
        assert!(fifo.commit(idx, &frame(2)).is_empty());
    }

    #[test]
    fn test_release_reports_transitions() {
        let fifo = Fifo::new(2, 8).expect("fifo");
        for id in 0..2 {
            let idx = fifo.acquire(0).expect("slot");
            fifo.commit(idx, &frame(id));
        }
        assert!(fifo.test_flag(FifoFlags::FULL));

        let first = fifo.retrieve().expect("slot");
        let ret = fifo.release(first.index);
        assert_eq!(ret, FifoFlags::FULL);

        let second = fifo.retrieve().expect("slot");
        let ret = fifo.release(second.index);
        assert_eq!(ret, FifoFlags::INACTIVE | FifoFlags::EMPTY);
    }

    #[test]
    fn test_again_requeues_at_head() {
        let fifo = Fifo::new(4, 8).expect("fifo");
        for id in [10, 20] {
            let idx = fifo.acquire(0).expect("slot");
            fifo.commit(idx, &frame(id));
        }
        let taken = fifo.retrieve().expect("slot");
        assert_eq!(taken.frame.id(), 10);
        fifo.again(taken.index);

        assert_eq!(fifo.retrieve().expect("slot").frame.id(), 10);
        assert!(fifo.accounting().is_consistent());
    }

    #[test]
    fn test_flush_keeps_taken_slots() {
        let fifo = Fifo::new(4, 8).expect("fifo");
        for id in 0..3 {
            let idx = fifo.acquire(0).expect("slot");
            fifo.commit(idx, &frame(id));
        }
        let held = fifo.retrieve().expect("slot");

        let ret = fifo.flush_slots();
        assert!(ret.contains(FifoFlags::INACTIVE));
        assert!(!ret.contains(FifoFlags::EMPTY));
        let acc = fifo.accounting();
        assert_eq!(acc.ready, 0);
        assert_eq!(acc.out_taken, 1);
        assert!(acc.is_consistent());

        // The held frame is still intact.
        assert_eq!(held.frame.id(), 0);
        let ret = fifo.release(held.index);
        assert!(ret.contains(FifoFlags::EMPTY));
    }

    #[test]
    fn test_init_then_drain_and_flush_round_trip() {
        let mut fifo = Fifo::new(6, 64).expect("fifo");
        for id in 0..6 {
            let idx = fifo.acquire(0).expect("slot");
            fifo.commit(idx, &frame(id));
        }
        let taken = fifo.retrieve().expect("slot");
        fifo.release(taken.index);
        fifo.flush_slots();

        let acc = fifo.accounting();
        assert_eq!(acc.free, 6);
        assert!(fifo.test_flag(FifoFlags::EMPTY));

        fifo.init_slots();
        assert_eq!(fifo.accounting().free, 6);
        assert!(fifo.test_flag(FifoFlags::EMPTY));
    }

    #[test]
    fn test_freeonempty_is_consumed_once() {
        let fifo = Fifo::new(2, 8).expect("fifo");
        let idx = fifo.acquire(0).expect("slot");
        fifo.commit(idx, &frame(1));
        fifo.set_flag(FifoFlags::FREEONEMPTY);

        let taken = fifo.retrieve().expect("slot");
        let ret = fifo.release(taken.index);
        assert!(ret.contains(FifoFlags::FREEONEMPTY));
        assert!(!fifo.test_flag(FifoFlags::FREEONEMPTY));
    }

    #[test]
    fn test_wait_drained_times_out_and_wakes() {
        use std::sync::Arc;
        use std::time::Duration;

        let fifo = Arc::new(Fifo::new(2, 8).expect("fifo"));
        let idx = fifo.acquire(0).expect("slot");
        fifo.commit(idx, &frame(1));

        let deadline = Instant::now() + Duration::from_millis(20);
        assert_eq!(fifo.wait_drained(Some(deadline)), DrainWait::TimedOut);

        let consumer = {
            let fifo = fifo.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(10));
                let taken = fifo.retrieve().expect("slot");
                fifo.release(taken.index);
            })
        };
        let deadline = Instant::now() + Duration::from_secs(5);
        assert_eq!(fifo.wait_drained(Some(deadline)), DrainWait::Drained);
        consumer.join().expect("consumer thread");
    }

    #[test]
    fn test_done_wakes_waiters() {
        let fifo = Fifo::new(2, 8).expect("fifo");
        let idx = fifo.acquire(0).expect("slot");
        fifo.commit(idx, &frame(1));
        fifo.done();
        assert_eq!(fifo.wait_drained(None), DrainWait::Dead);
        assert!(fifo.acquire(0).is_some(), "acquire itself ignores BLOCK");
    }
}
