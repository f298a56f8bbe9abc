//! Queue statistics and their history.
//!
//! [`CanQueues::stats`] samples the whole graph; [`StatsHistory`] keeps a
//! time window of such samples and aggregates them.

use crate::edge::{EdgeHandle, EdgeLifecycle, Placement};
use crate::ends::{EndsId, EndsSnapshot};
use crate::error::Result;
use crate::fifo::{FifoAccounting, FifoFlags};
use crate::router::CanQueues;
use crate::{lock_mutex, lock_read};
use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

/// Per-edge counters and state.
#[derive(Debug, Clone)]
pub struct EdgeStats {
    pub handle: EdgeHandle,
    pub prio: u8,
    /// `(input, output)` ends once connected
    pub ends: Option<(EndsId, EndsId)>,
    pub flags: FifoFlags,
    pub accounting: FifoAccounting,
    pub max_data_length: usize,
    /// Failed slot requests
    pub overruns: u64,
    /// Frames committed into the edge
    pub delivered: u64,
    /// Outstanding references
    pub used: u32,
    pub placement: Placement,
    pub lifecycle: EdgeLifecycle,
}

/// Totals over the whole queue graph at one point in time.
#[derive(Debug, Clone, Default)]
pub struct QueueStats {
    pub total_ends: usize,
    pub total_edges: usize,
    /// Edges sitting on an active list
    pub active_edges: usize,
    /// Frames committed and not yet retrieved
    pub ready_slots: usize,
    /// Overruns summed over all live edges
    pub overruns: u64,
    /// Seconds since UNIX EPOCH
    pub timestamp: u64,
}

impl CanQueues {
    pub fn contains_edge(&self, edge: EdgeHandle) -> bool {
        self.lookup_edge(edge).is_some()
    }

    pub fn edge_stats(&self, edge: EdgeHandle) -> Result<EdgeStats> {
        let edge = self.edge_ref(edge)?;
        let (placement, lifecycle) = {
            let link = lock_mutex!(edge.link);
            (link.placement, link.lifecycle)
        };
        Ok(EdgeStats {
            handle: edge.handle,
            prio: edge.prio,
            ends: edge.ends(),
            flags: edge.fifo.flags(),
            accounting: edge.fifo.accounting(),
            max_data_length: edge.fifo.max_data_length(),
            overruns: edge.fifo.overruns(),
            delivered: edge.delivered(),
            used: edge.used(),
            placement,
            lifecycle,
        })
    }

    pub fn ends_snapshot(&self, ends: EndsId) -> Result<EndsSnapshot> {
        let ends = self.ends_ref(ends)?;
        Ok(EndsSnapshot::capture(&ends))
    }

    /// Samples totals over every live edge and ends.
    pub fn stats(&self) -> QueueStats {
        let mut stats = QueueStats::default();
        {
            let arena = lock_read!(self.state.ends);
            stats.total_ends = arena.len();
            for (_, ends) in arena.iter() {
                stats.active_edges += lock_mutex!(ends.lists).active_count();
            }
        }
        let edges = lock_read!(self.state.edges);
        stats.total_edges = edges.len();
        for (_, edge) in edges.iter() {
            stats.ready_slots += edge.fifo.accounting().ready;
            stats.overruns += edge.fifo.overruns();
        }
        stats.timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        stats
    }
}

/// Simple Stats buffer history
pub struct StatsHistory {
    /// Recent N seconds samples
    pub samples: VecDeque<QueueStats>,
    /// Max retention time in seconds
    pub max_age_secs: u64,
}

impl StatsHistory {
    /// Creates a new `StatsHistory` with the specified maximum retention time.
    pub fn new(max_age_secs: u64) -> Self {
        Self {
            samples: VecDeque::with_capacity(max_age_secs.min(4096) as usize),
            max_age_secs,
        }
    }

    /// Add sample and drop samples older than the retention window.
    pub fn push(&mut self, stats: QueueStats) {
        self.samples.push_back(stats);

        if let Some(latest) = self.samples.back() {
            let cutoff = latest.timestamp.saturating_sub(self.max_age_secs);
            while let Some(oldest) = self.samples.front() {
                if oldest.timestamp < cutoff {
                    self.samples.pop_front();
                } else {
                    break;
                }
            }
        }
    }

    /// Aggregates the samples of the last `window_secs` seconds.
    pub fn aggregate(&self, window_secs: u64) -> Option<AggregatedStats> {
        let latest = self.samples.back()?;
        let cutoff = latest.timestamp.saturating_sub(window_secs);

        // Timestamps are monotonic, so the window start can be bisected.
        let start_idx = self.samples.partition_point(|s| s.timestamp < cutoff);
        let window_len = self.samples.len() - start_idx;
        if window_len == 0 {
            return None;
        }
        let window = self.samples.range(start_idx..);

        let sum_ready: usize = window.clone().map(|s| s.ready_slots).sum();
        let first = window.clone().next()?;

        Some(AggregatedStats {
            avg_ready: sum_ready as f64 / window_len as f64,
            max_ready: window.clone().map(|s| s.ready_slots).max()?,
            min_ready: window.clone().map(|s| s.ready_slots).min()?,
            overruns: latest.overruns.saturating_sub(first.overruns),
            max_edges: window.map(|s| s.total_edges).max()?,
            sample_count: window_len,
        })
    }
}

/// Aggregated queue statistics over a time window
#[derive(Debug)]
pub struct AggregatedStats {
    /// Average number of ready slots
    pub avg_ready: f64,
    pub max_ready: usize,
    pub min_ready: usize,
    /// Overruns that happened within the window
    pub overruns: u64,
    pub max_edges: usize,
    /// Number of samples in the window
    pub sample_count: usize,
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    fn sample(ready: usize, overruns: u64, timestamp: u64) -> QueueStats {
        QueueStats {
            total_ends: 2,
            total_edges: 1,
            active_edges: usize::from(ready > 0),
            ready_slots: ready,
            overruns,
            timestamp,
        }
    }

    #[test]
    fn test_stats_history_retention() {
        let mut history = StatsHistory::new(60);

        for i in 0..70 {
            history.push(sample(i, 0, i as u64));
        }
        // Samples 9..=69 are within 60s of the newest one
        assert_eq!(history.samples.len(), 61);
        assert_eq!(
            history.samples.front().expect("History should not be empty").timestamp,
            9
        );

        let mut zero = StatsHistory::new(0);
        zero.push(sample(1, 0, 1));
        zero.push(sample(2, 0, 2));
        assert_eq!(zero.samples.len(), 1, "0 retention keeps only the latest sample");
    }

    #[test]
    fn test_aggregate_window() {
        let mut history = StatsHistory::new(100);
        // ready: 10, 20, 30, 40, 50; overruns grow by 2 per second
        for i in 0..5u64 {
            history.push(sample(((i + 1) * 10) as usize, i * 2, i));
        }

        let agg = history.aggregate(3).expect("Aggregation should not be None");
        assert_eq!(agg.sample_count, 4);
        assert_eq!(agg.avg_ready, 35.0);
        assert_eq!(agg.min_ready, 20);
        assert_eq!(agg.max_ready, 50);
        assert_eq!(agg.overruns, 6);

        let last = history.aggregate(0).expect("Aggregation should not be None");
        assert_eq!(last.sample_count, 1);
        assert_eq!(last.overruns, 0);
    }

    #[test]
    fn test_empty_history_aggregation() {
        assert!(StatsHistory::new(60).aggregate(60).is_none());
    }

    #[test]
    fn test_queue_stats_sampling() {
        use crate::edge::EdgeParams;
        use crate::frame::CanFrame;

        let queues = CanQueues::new();
        let tx = queues.ends_init("tx", None);
        let rx = queues.ends_init("rx", None);
        let edge = queues.new_edge(EdgeParams::new().slots(1)).expect("edge");
        queues.connect_edge(edge, tx, rx).expect("connect");

        let mut slot = queues.get_inslot(tx, 0).expect("slot");
        slot.set_frame(CanFrame::new(0x1, &[]).expect("frame"));
        queues.put_inslot(slot).expect("put");
        assert!(queues.get_inslot(tx, 0).is_err());

        let stats = queues.stats();
        assert_eq!(stats.total_ends, 2);
        assert_eq!(stats.total_edges, 1);
        assert_eq!(stats.active_edges, 1);
        assert_eq!(stats.ready_slots, 1);
        assert_eq!(stats.overruns, 1);

        let edge_stats = queues.edge_stats(edge).expect("edge stats");
        assert_eq!(edge_stats.delivered, 1);
        assert_eq!(edge_stats.placement, Placement::Active(0));
        assert!(edge_stats.flags.contains(FifoFlags::OVERRUN));
    }
}
