//! Acquisition statistics
//!
//! [`NodeStats`] is kept per node inside its live cache entry and updated
//! by the node's acquisition task. [`EngineCounters`] aggregates across all
//! nodes with atomics so tasks never contend on a shared lock.

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Size of the rolling window for cycle-time jitter
const RECENT_WINDOW_SIZE: usize = 32;

/// Per-node cycle statistics
#[derive(Debug, Clone, Serialize)]
pub struct NodeStats {
    /// Total number of successful cycles
    pub successful_reads: u64,
    /// Total number of failed cycles
    pub failed_reads: u64,
    /// Failures since the last success
    pub consecutive_failures: u64,
    /// Total cycle time of successful reads in microseconds
    pub total_read_time_us: u64,
    /// Last cycle time in microseconds
    pub last_read_time_us: u64,
    /// Minimum cycle time observed (microseconds)
    pub min_read_time_us: u64,
    /// Maximum cycle time observed (microseconds)
    pub max_read_time_us: u64,
    /// Rolling window of recent cycle times
    #[serde(skip)]
    recent_read_times: VecDeque<u64>,
}

impl Default for NodeStats {
    fn default() -> Self {
        Self {
            successful_reads: 0,
            failed_reads: 0,
            consecutive_failures: 0,
            total_read_time_us: 0,
            last_read_time_us: 0,
            min_read_time_us: u64::MAX,
            max_read_time_us: 0,
            recent_read_times: VecDeque::with_capacity(RECENT_WINDOW_SIZE),
        }
    }
}

impl NodeStats {
    /// Calculate average cycle time in microseconds
    pub fn avg_read_time_us(&self) -> f64 {
        if self.successful_reads == 0 {
            0.0
        } else {
            self.total_read_time_us as f64 / self.successful_reads as f64
        }
    }

    /// Calculate success rate as percentage
    pub fn success_rate(&self) -> f64 {
        let total = self.successful_reads + self.failed_reads;
        if total == 0 {
            100.0
        } else {
            (self.successful_reads as f64 / total as f64) * 100.0
        }
    }

    /// Record a successful cycle
    pub fn record_success(&mut self, time_us: u64) {
        self.successful_reads += 1;
        self.consecutive_failures = 0;
        self.total_read_time_us += time_us;
        self.last_read_time_us = time_us;
        self.min_read_time_us = self.min_read_time_us.min(time_us);
        self.max_read_time_us = self.max_read_time_us.max(time_us);

        self.recent_read_times.push_back(time_us);
        if self.recent_read_times.len() > RECENT_WINDOW_SIZE {
            self.recent_read_times.pop_front();
        }
    }

    /// Record a failed cycle
    pub fn record_failure(&mut self, time_us: u64) {
        self.failed_reads += 1;
        self.consecutive_failures += 1;
        self.last_read_time_us = time_us;
    }

    /// Calculate jitter (max - min) over the recent window in microseconds
    pub fn jitter_us(&self) -> u64 {
        let min = self.recent_read_times.iter().min().copied().unwrap_or(0);
        let max = self.recent_read_times.iter().max().copied().unwrap_or(0);
        max.saturating_sub(min)
    }
}

/// Engine-wide counters shared by all acquisition tasks
#[derive(Debug)]
pub struct EngineCounters {
    started: Instant,
    cycles: AtomicU64,
    failed_cycles: AtomicU64,
    discarded_cycles: AtomicU64,
    writes: AtomicU64,
    events_dropped: AtomicU64,
}

impl Default for EngineCounters {
    fn default() -> Self {
        Self {
            started: Instant::now(),
            cycles: AtomicU64::new(0),
            failed_cycles: AtomicU64::new(0),
            discarded_cycles: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            events_dropped: AtomicU64::new(0),
        }
    }
}

impl EngineCounters {
    pub fn record_cycle(&self, ok: bool) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.failed_cycles.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// A cycle finished after its node was removed or rebuilt
    pub fn record_discarded(&self) {
        self.discarded_cycles.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_event_dropped(&self) -> u64 {
        self.events_dropped.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            uptime_seconds: self.started.elapsed().as_secs(),
            cycles: self.cycles.load(Ordering::Relaxed),
            failed_cycles: self.failed_cycles.load(Ordering::Relaxed),
            discarded_cycles: self.discarded_cycles.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`EngineCounters`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub uptime_seconds: u64,
    pub cycles: u64,
    pub failed_cycles: u64,
    pub discarded_cycles: u64,
    pub writes: u64,
    pub events_dropped: u64,
}

/// Summary returned by `Engine::stats`
#[derive(Debug, Clone, Default, Serialize)]
pub struct EngineStats {
    /// Registered nodes
    pub nodes_total: usize,
    /// Nodes with a running acquisition task
    pub nodes_scheduled: usize,
    /// Nodes whose last cycle succeeded
    pub nodes_ok: usize,
    /// Nodes whose last cycle failed
    pub nodes_errored: usize,
    /// Device keys with at least one reservation
    pub device_keys: usize,
    #[serde(flatten)]
    pub counters: CounterSnapshot,
}
