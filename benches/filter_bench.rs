use canqueue_rs::{CanFilter, CanFrame, CanQueues, EdgeParams, FrameFlags};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn bench_filter_match(c: &mut Criterion) {
    let filter = CanFilter::with_mask(0x120, 0x7f0);

    c.bench_function("filter_match_hit", |b| {
        b.iter(|| filter.matches(black_box(0x123), black_box(FrameFlags::empty())))
    });

    c.bench_function("filter_match_miss", |b| {
        b.iter(|| filter.matches(black_box(0x323), black_box(FrameFlags::empty())))
    });
}

fn bench_fanout_32_edges(c: &mut Criterion) {
    let queues = CanQueues::new();
    let tx = queues.ends_init("tx", None);
    let rx = queues.ends_init("rx", None);
    // Each edge accepts one block of 64 identifiers
    for i in 0..32u32 {
        let filter = CanFilter::with_mask(i << 6, 0x7c0);
        let edge = queues
            .new_edge(EdgeParams::new().slots(1).filter(filter))
            .expect("edge");
        queues.connect_edge(edge, tx, rx).expect("connect");
    }
    let frame = CanFrame::new(0x345, &[0; 8]).expect("frame");

    c.bench_function("filter_frame_to_edges_32", |b| {
        b.iter(|| {
            let delivered = queues
                .filter_frame_to_edges(tx, None, black_box(&frame), FrameFlags::empty())
                .expect("fanout");
            if let Some(slot) = queues.test_outslot(rx).expect("rx") {
                queues.free_outslot(rx, slot).expect("free");
            }
            delivered
        })
    });
}

criterion_group!(benches, bench_filter_match, bench_fanout_32_edges);
criterion_main!(benches);
