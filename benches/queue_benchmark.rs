//! Performance benchmarks for the queue core
//!
//! Run with: cargo bench

use canqueue_rs::fifo::Fifo;
use canqueue_rs::{CanFrame, CanQueues, EdgeParams};
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

fn benchmark_fifo(c: &mut Criterion) {
    let mut group = c.benchmark_group("fifo");
    group.throughput(Throughput::Elements(1));

    let fifo = Fifo::new(64, 8).expect("fifo");
    let frame = CanFrame::new(0x123, &[1, 2, 3, 4, 5, 6, 7, 8]).expect("frame");

    group.bench_function("acquire_commit_retrieve_release", |b| {
        b.iter(|| {
            let Some(index) = fifo.acquire(0) else {
                return;
            };
            fifo.commit(index, black_box(&frame));
            if let Some(taken) = fifo.retrieve() {
                fifo.release(taken.index);
            }
        });
    });

    group.finish();
}

fn benchmark_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("queues");
    group.throughput(Throughput::Elements(1));

    let queues = CanQueues::new();
    let tx = queues.ends_init("tx", None);
    let rx = queues.ends_init("rx", None);
    for prio in [1u8, 4, 6] {
        let edge = queues
            .new_edge(EdgeParams::new().slots(16).prio(prio))
            .expect("edge");
        queues.connect_edge(edge, tx, rx).expect("connect");
    }
    let frame = CanFrame::new(0x123, &[0xaa; 8]).expect("frame");

    group.bench_function("put_inslot_free_outslot", |b| {
        b.iter(|| {
            let mut slot = queues
                .get_inslot_for_prio(tx, Some(&frame.header), 0, 4)
                .expect("slot");
            slot.set_frame(frame);
            queues.put_inslot(slot).expect("put");
            let out = queues.test_outslot(rx).expect("rx").expect("frame");
            black_box(out.frame().id());
            queues.free_outslot(rx, out).expect("free");
        });
    });

    group.bench_function("pending_outslot_prio_empty", |b| {
        b.iter(|| queues.pending_outslot_prio(rx, black_box(0)).expect("rx"));
    });

    group.finish();
}

criterion_group!(benches, benchmark_fifo, benchmark_round_trip);
criterion_main!(benches);
