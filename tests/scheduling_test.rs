#![allow(clippy::expect_used)]

//! Consumer side scheduling: priority classes, FIFO order and round robin.

use canqueue_rs::{
    CanFilter, CanFrame, CanQueues, EdgeHandle, EdgeParams, EndsId, FifoFlags, Notify, NotifyEvent,
    Placement, QueueError,
};
use parking_lot::Mutex;
use std::sync::Arc;

fn frame(id: u32) -> CanFrame {
    CanFrame::new(id, &[id as u8]).expect("valid frame")
}

fn edge(queues: &CanQueues, from: EndsId, to: EndsId, params: EdgeParams) -> EdgeHandle {
    let edge = queues.new_edge(params).expect("edge");
    queues.connect_edge(edge, from, to).expect("connect");
    edge
}

/// Commits `frame` into the first edge leading away from `from`.
fn send(queues: &CanQueues, from: EndsId, frame: CanFrame) -> EdgeHandle {
    let mut slot = queues.get_inslot(from, 0).expect("free slot");
    let edge = slot.edge();
    slot.set_frame(frame);
    queues.put_inslot(slot).expect("put");
    edge
}

/// Takes the next frame of `ends` and frees its slot.
fn recv(queues: &CanQueues, ends: EndsId) -> Option<(EdgeHandle, u32)> {
    let slot = queues.test_outslot(ends).expect("ends exists")?;
    let out = (slot.edge(), slot.frame().id());
    queues.free_outslot(ends, slot).expect("free");
    Some(out)
}

#[test]
fn test_higher_priority_edge_served_first() {
    let queues = CanQueues::new();
    let low_tx = queues.ends_init("low", None);
    let high_tx = queues.ends_init("high", None);
    let rx = queues.ends_init("rx", None);
    let e1 = edge(&queues, low_tx, rx, EdgeParams::new().prio(2));
    let e2 = edge(&queues, high_tx, rx, EdgeParams::new().prio(5));

    // The low priority frame is committed first
    send(&queues, low_tx, frame(0x10));
    send(&queues, high_tx, frame(0x20));

    let slot = queues.test_outslot(rx).expect("rx").expect("ready frame");
    assert_eq!(slot.edge(), e2);
    assert_eq!(slot.prio(), 5);
    assert_eq!(slot.frame().id(), 0x20);
    queues.free_outslot(rx, slot).expect("free");

    assert_eq!(recv(&queues, rx), Some((e1, 0x10)));
    assert_eq!(recv(&queues, rx), None);
}

#[test]
fn test_no_priority_inversion() {
    let queues = CanQueues::new();
    let low_tx = queues.ends_init("low", None);
    let high_tx = queues.ends_init("high", None);
    let rx = queues.ends_init("rx", None);
    let low = edge(&queues, low_tx, rx, EdgeParams::new().prio(1));
    let high = edge(&queues, high_tx, rx, EdgeParams::new().prio(6));

    for id in 1..=3 {
        send(&queues, low_tx, frame(id));
    }
    send(&queues, high_tx, frame(0x60));

    assert_eq!(recv(&queues, rx), Some((high, 0x60)));
    assert_eq!(recv(&queues, rx), Some((low, 1)));

    // A late high priority frame overtakes the remaining backlog
    send(&queues, high_tx, frame(0x61));
    assert_eq!(recv(&queues, rx), Some((high, 0x61)));
    assert_eq!(recv(&queues, rx), Some((low, 2)));
    assert_eq!(recv(&queues, rx), Some((low, 3)));
    assert_eq!(recv(&queues, rx), None);
}

#[test]
fn test_single_edge_keeps_fifo_order() {
    let queues = CanQueues::new();
    let tx = queues.ends_init("tx", None);
    let rx = queues.ends_init("rx", None);
    let e = edge(&queues, tx, rx, EdgeParams::new().slots(8));

    for id in 0..8 {
        send(&queues, tx, frame(id));
    }
    for id in 0..8 {
        assert_eq!(recv(&queues, rx), Some((e, id)));
    }
    assert_eq!(recv(&queues, rx), None);
}

#[test]
fn test_same_class_served_round_robin() {
    let queues = CanQueues::new();
    let a_tx = queues.ends_init("a", None);
    let b_tx = queues.ends_init("b", None);
    let rx = queues.ends_init("rx", None);
    let a = edge(&queues, a_tx, rx, EdgeParams::new().prio(3));
    let b = edge(&queues, b_tx, rx, EdgeParams::new().prio(3));

    send(&queues, a_tx, frame(0xa1));
    send(&queues, a_tx, frame(0xa2));
    send(&queues, b_tx, frame(0xb1));
    send(&queues, b_tx, frame(0xb2));

    let order: Vec<_> = std::iter::from_fn(|| recv(&queues, rx)).collect();
    assert_eq!(order, vec![(a, 0xa1), (b, 0xb1), (a, 0xa2), (b, 0xb2)]);
}

#[test]
fn test_pending_outslot_prio() {
    let queues = CanQueues::new();
    let tx = queues.ends_init("tx", None);
    let rx = queues.ends_init("rx", None);
    edge(&queues, tx, rx, EdgeParams::new().prio(2));

    assert_eq!(queues.pending_outslot_prio(rx, 0).expect("rx"), None);
    send(&queues, tx, frame(1));
    assert_eq!(queues.pending_outslot_prio(rx, 0).expect("rx"), Some(2));
    assert_eq!(queues.pending_outslot_prio(rx, 2).expect("rx"), Some(2));
    assert_eq!(queues.pending_outslot_prio(rx, 3).expect("rx"), None);

    // Peeking does not consume
    assert!(recv(&queues, rx).is_some());
    assert_eq!(queues.pending_outslot_prio(rx, 0).expect("rx"), None);
}

#[test]
fn test_push_back_redelivers_first() {
    let queues = CanQueues::new();
    let tx = queues.ends_init("tx", None);
    let rx = queues.ends_init("rx", None);
    let e = edge(&queues, tx, rx, EdgeParams::new());

    send(&queues, tx, frame(1));
    send(&queues, tx, frame(2));

    let slot = queues.test_outslot(rx).expect("rx").expect("frame");
    assert_eq!(slot.frame().id(), 1);
    queues.push_back_outslot(rx, slot).expect("push back");

    assert_eq!(recv(&queues, rx), Some((e, 1)));
    assert_eq!(recv(&queues, rx), Some((e, 2)));

    // The last frame of an edge goes back onto an idle edge
    send(&queues, tx, frame(3));
    let slot = queues.test_outslot(rx).expect("rx").expect("frame");
    assert!(queues.ends_snapshot(rx).expect("rx").idle.contains(&e));
    queues.push_back_outslot(rx, slot).expect("push back");
    assert_eq!(queues.pending_outslot_prio(rx, 0).expect("rx"), Some(0));
    assert_eq!(recv(&queues, rx), Some((e, 3)));
}

#[test]
fn test_outslot_returned_to_foreign_ends_is_rejected() {
    let queues = CanQueues::new();
    let tx = queues.ends_init("tx", None);
    let rx = queues.ends_init("rx", None);
    let other = queues.ends_init("other", None);
    let e = edge(&queues, tx, rx, EdgeParams::new().slots(2).prio(3));

    send(&queues, tx, frame(0x41));
    let slot = queues.test_outslot(rx).expect("rx").expect("frame");
    assert!(matches!(
        queues.push_back_outslot(other, slot),
        Err(QueueError::UnknownEnds(id)) if id == other
    ));

    // The slot went back to its own edge and no foreign list gained the edge
    let snapshot = queues.ends_snapshot(other).expect("other");
    assert!(snapshot.active.iter().all(Vec::is_empty));
    assert!(snapshot.idle.is_empty());
    let stats = queues.edge_stats(e).expect("stats");
    assert_eq!(stats.placement, Placement::Idle);
    assert_eq!(stats.accounting.out_taken, 0);
    assert_eq!(stats.used, 0);
    assert!(queues.ends_snapshot(rx).expect("rx").idle.contains(&e));

    send(&queues, tx, frame(0x42));
    let slot = queues.test_outslot(rx).expect("rx").expect("frame");
    assert!(matches!(
        queues.free_outslot(other, slot),
        Err(QueueError::UnknownEnds(_))
    ));
    assert_eq!(queues.edge_stats(e).expect("stats").accounting.free, 2);

    send(&queues, tx, frame(0x43));
    assert_eq!(recv(&queues, rx), Some((e, 0x43)));
}

#[test]
fn test_inslot_selection_by_priority_and_filter() {
    let queues = CanQueues::new();
    let tx = queues.ends_init("tx", None);
    let rx = queues.ends_init("rx", None);
    let p1 = edge(&queues, tx, rx, EdgeParams::new().prio(1));
    let p4 = edge(&queues, tx, rx, EdgeParams::new().prio(4));
    let p6 = edge(
        &queues,
        tx,
        rx,
        EdgeParams::new().prio(6).filter(CanFilter::with_mask(0x300, 0x700)),
    );

    let pick = |id: Option<u32>, prio: u8| {
        let header = id.map(|id| frame(id).header);
        let slot = queues
            .get_inslot_for_prio(tx, header.as_ref(), 0, prio)
            .expect("slot");
        let edge = slot.edge();
        queues.abort_inslot(slot);
        edge
    };

    // Greatest priority not above the request
    assert_eq!(pick(None, 5), p4);
    assert_eq!(pick(None, 7), p6);
    // Nothing at or below the request: the lowest priority edge
    assert_eq!(pick(None, 0), p1);
    // A non-matching explicit filter leaves the catch-all edges
    assert_eq!(pick(Some(0x123), 7), p4);
    // A matching explicit filter wins over catch-all edges
    assert_eq!(pick(Some(0x345), 7), p6);
    assert_eq!(pick(Some(0x345), 2), p6);
}

#[test]
fn test_overrun_and_space_notification() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let log = events.clone();
    let listener: Arc<dyn Notify> = Arc::new(move |_: EndsId, edge: EdgeHandle, event: NotifyEvent| {
        log.lock().push((edge, event));
    });

    let queues = CanQueues::new();
    let tx = queues.ends_init("tx", Some(listener));
    let rx = queues.ends_init("rx", None);
    let e = edge(&queues, tx, rx, EdgeParams::new().slots(2));
    events.lock().clear();

    let first = queues.get_inslot(tx, 0).expect("slot 1");
    let second = queues.get_inslot(tx, 0).expect("slot 2");
    assert!(matches!(queues.get_inslot(tx, 0), Err(QueueError::Overrun { edge }) if edge == e));
    assert!(!queues.test_inslot(tx).expect("tx"));

    let stats = queues.edge_stats(e).expect("stats");
    assert!(stats.flags.contains(FifoFlags::OVERRUN | FifoFlags::FULL));
    assert_eq!(stats.overruns, 1);

    queues.abort_inslot(first);
    assert_eq!(events.lock().as_slice(), &[(e, NotifyEvent::Space)]);
    assert!(queues.test_inslot(tx).expect("tx"));

    let third = queues.get_inslot(tx, 0).expect("room again");
    queues.abort_inslot(second);
    queues.abort_inslot(third);
    assert_eq!(queues.edge_stats(e).expect("stats").accounting.free, 2);
}

#[test]
fn test_proc_notification_on_first_frame_only() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let log = events.clone();
    let listener: Arc<dyn Notify> = Arc::new(move |_: EndsId, _: EdgeHandle, event: NotifyEvent| {
        log.lock().push(event);
    });

    let queues = CanQueues::new();
    let tx = queues.ends_init("tx", None);
    let rx = queues.ends_init("rx", Some(listener));
    edge(&queues, tx, rx, EdgeParams::new());
    events.lock().clear();

    send(&queues, tx, frame(1));
    send(&queues, tx, frame(2));
    assert_eq!(events.lock().as_slice(), &[NotifyEvent::Proc]);

    // Draining and refilling raises it again
    recv(&queues, rx);
    recv(&queues, rx);
    send(&queues, tx, frame(3));
    assert_eq!(events.lock().as_slice(), &[NotifyEvent::Proc, NotifyEvent::Proc]);
}
