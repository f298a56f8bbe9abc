#![deny(unsafe_code)]
#![deny(clippy::unwrap_used)]

use ahash::AHashMap;
use anyhow::{Context, Result};
use canqueue_rs::config::{Config, ProducerConfig};
use canqueue_rs::{
    CanFrame, CanQueues, Dispose, EndsId, EndsWaiter, FrameFlags, Notify, QueueError, StatsHistory,
};
use clap::Parser;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// How long a worker sleeps on its waiter before re-checking the queues.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "canqueue.toml")]
    config: String,

    /// Override the frame count of every producer
    #[arg(short, long)]
    frames: Option<u64>,
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    info!("Starting canqueue with config: {}", args.config);

    let mut config = match Config::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            error!("Error loading config: {:#}", e);
            return Err(e);
        }
    };
    if let Some(frames) = args.frames {
        for producer in &mut config.producer {
            producer.count = frames;
        }
    }

    info!(
        "Loaded configuration with {} ends, {} edges, {} producers",
        config.ends.len(),
        config.edge.len(),
        config.producer.len()
    );

    let queues = Arc::new(CanQueues::with_settings(config.settings()));
    let mut waiters: AHashMap<String, Arc<EndsWaiter>> = AHashMap::new();
    let ends = config.build(&queues, |name| {
        let waiter = EndsWaiter::new();
        waiters.insert(name.to_string(), waiter.clone());
        Some(waiter as Arc<dyn Notify>)
    })?;

    let stop = Arc::new(AtomicBool::new(false));
    let received = Arc::new(AtomicU64::new(0));

    // Stats Reporting Task
    let stats_handle = if config.general.stats_interval_ms > 0 {
        let queues = queues.clone();
        let stop = stop.clone();
        let interval = Duration::from_millis(config.general.stats_interval_ms);
        Some(spawn_worker("stats".to_string(), move || {
            let mut history = StatsHistory::new(3600);
            while !stop.load(Ordering::Acquire) {
                thread::sleep(interval);
                let stats = queues.stats();
                history.push(stats.clone());
                if let Some(min1) = history.aggregate(60) {
                    info!(
                        "Stats [1min] avg={:.1} ready, max={}, overruns={}, edges={} ({} active)",
                        min1.avg_ready,
                        min1.max_ready,
                        min1.overruns,
                        stats.total_edges,
                        stats.active_edges
                    );
                }
            }
            info!("Stats Reporter shutting down.");
            Ok(())
        })?)
    } else {
        None
    };

    let mut consumers = Vec::new();
    let mut consuming: Vec<&str> = config.edge.iter().map(|e| e.to.as_str()).collect();
    consuming.sort_unstable();
    consuming.dedup();
    for name in consuming {
        let id = lookup(&ends, name)?;
        let waiter = lookup(&waiters, name)?;
        let queues = queues.clone();
        let stop = stop.clone();
        let received = received.clone();
        consumers.push(spawn_worker(format!("consumer {}", name), move || {
            consume(&queues, id, &waiter, &stop, &received)
        })?);
    }

    let mut producers = Vec::new();
    for producer in config.producer.iter().cloned() {
        let id = lookup(&ends, &producer.ends)?;
        let waiter = lookup(&waiters, &producer.ends)?;
        let queues = queues.clone();
        producers.push(spawn_worker(format!("producer {}", producer.ends), move || {
            produce(&queues, id, &waiter, &producer)
        })?);
    }

    if producers.is_empty() {
        info!("No producers configured. Exiting.");
    }
    join_all(producers);

    // Let the consumers drain what the producers left behind
    for producer in &config.producer {
        let id = lookup(&ends, &producer.ends)?;
        match queues.dispose(id, false) {
            Ok(Dispose::Done) => debug!("Disposed producer ends '{}'", producer.ends),
            Ok(Dispose::Deferred) => debug!("Producer ends '{}' disposal deferred", producer.ends),
            Err(QueueError::UnknownEnds(_)) => {}
            Err(e) => warn!("Failed to dispose '{}': {}", producer.ends, e),
        }
    }

    stop.store(true, Ordering::Release);
    for waiter in waiters.values() {
        waiter.close();
    }
    join_all(consumers);
    if let Some(handle) = stats_handle {
        join_all(vec![handle]);
    }

    for (name, id) in &ends {
        match queues.dispose(*id, true) {
            Ok(_) | Err(QueueError::UnknownEnds(_)) => {}
            Err(e) => warn!("Failed to dispose '{}': {}", name, e),
        }
    }

    let stats = queues.stats();
    info!(
        "Shutdown complete. {} frames received, {} overruns, {} edges left",
        received.load(Ordering::Relaxed),
        stats.overruns,
        stats.total_edges
    );

    Ok(())
}

fn lookup<V: Clone>(map: &AHashMap<String, V>, name: &str) -> Result<V> {
    map.get(name)
        .cloned()
        .with_context(|| format!("Unknown ends '{}'", name))
}

fn spawn_worker<F>(name: String, task: F) -> Result<JoinHandle<()>>
where
    F: FnOnce() -> Result<()> + Send + 'static,
{
    let label = name.clone();
    thread::Builder::new()
        .name(name)
        .spawn(move || match task() {
            Ok(()) => debug!("Worker {} finished", label),
            Err(e) => error!("Worker {} failed: {:#}", label, e),
        })
        .context("Failed to spawn worker thread")
}

fn join_all(handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        if handle.join().is_err() {
            error!("Worker thread panicked");
        }
    }
}

fn produce(
    queues: &CanQueues,
    ends: EndsId,
    waiter: &EndsWaiter,
    producer: &ProducerConfig,
) -> Result<()> {
    let mut payload = vec![0u8; producer.dlen];
    let mut sent = 0u64;
    let mut retries = 0u64;
    let mut dropped = 0u64;

    for n in 0..producer.count {
        let can_id = producer.ids[(n % producer.ids.len() as u64) as usize];
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte = n.to_le_bytes()[i % 8];
        }
        let frame = CanFrame::new(can_id, &payload)
            .with_context(|| format!("Invalid frame id {:#x}", can_id))?;

        if producer.broadcast {
            let delivered = queues.filter_frame_to_edges(ends, None, &frame, FrameFlags::empty())?;
            if delivered == 0 {
                dropped += 1;
            }
            sent += 1;
            continue;
        }

        loop {
            match queues.get_inslot_for_prio(ends, Some(&frame.header), 0, producer.prio) {
                Ok(mut slot) => {
                    slot.set_frame(frame);
                    queues.put_inslot(slot)?;
                    sent += 1;
                    break;
                }
                Err(QueueError::NoEdge) => {
                    warn!("{} has no edge for id {:#x}, dropping", ends, can_id);
                    dropped += 1;
                    break;
                }
                Err(e) if e.is_transient() => {
                    retries += 1;
                    waiter.wait_writable(POLL_INTERVAL);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    info!(
        "{} sent {} frames ({} retries, {} dropped)",
        ends, sent, retries, dropped
    );
    Ok(())
}

fn consume(
    queues: &CanQueues,
    ends: EndsId,
    waiter: &EndsWaiter,
    stop: &AtomicBool,
    received: &AtomicU64,
) -> Result<()> {
    let mut count = 0u64;
    loop {
        match queues.test_outslot(ends)? {
            Some(slot) => {
                debug!("{} <- {:?} via {}", ends, slot.frame(), slot.edge());
                queues.free_outslot(ends, slot)?;
                count += 1;
                received.fetch_add(1, Ordering::Relaxed);
            }
            None if stop.load(Ordering::Acquire) => break,
            None => {
                waiter.wait_readable(POLL_INTERVAL);
            }
        }
    }
    info!("{} received {} frames", ends, count);
    Ok(())
}
