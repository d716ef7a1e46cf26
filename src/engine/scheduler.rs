//! Per-node acquisition scheduling
//!
//! Every enabled node runs its own tokio task. The task owns the node's
//! [`SourceDriver`] and receives configuration through a `watch` channel, so
//! an update replaces the whole node definition in one step; a cycle always
//! works on the definition it started with.
//!
//! # Node states
//!
//! ```text
//! Disabled <-> Idle -> Acquiring -> Ok | Errored -> Idle
//! ```
//!
//! # Timing
//!
//! - The first cycle fires as soon as the task starts.
//! - Afterwards the task fires every `update_interval_ms`. A cycle that
//!   overruns skips the missed fires instead of replaying them.
//! - An interval change takes effect at once: the next fire is the last
//!   fire plus the new interval, or immediately if that moment has passed.
//!
//! # Removal
//!
//! Dropping a node's control sender ends its task after the current cycle.
//! A cycle in flight at that moment completes, but its result is discarded.

use super::cache::{CacheSlot, LiveValueCache};
use super::events::{EngineMessage, EventSink};
use super::scaling::engineering_value;
use super::stats::EngineCounters;
use crate::source::{DriverContext, ManualValue, SourceDriver, SourceSpec};
use crate::types::{Node, NodeState, Reading};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Everything an acquisition task needs to know about its node
#[derive(Debug)]
pub struct ScheduledNode {
    pub node: Node,
    pub source: SourceSpec,
    /// Value cell for manual sources
    pub manual: Arc<ManualValue>,
}

impl ScheduledNode {
    fn interval(&self) -> Duration {
        Duration::from_millis(self.node.update_interval_ms.max(1))
    }

    /// Whether switching from `self` to `other` requires a new driver
    fn needs_rebuild(&self, other: &ScheduledNode) -> bool {
        self.source != other.source || !Arc::ptr_eq(&self.manual, &other.manual)
    }
}

struct NodeTask {
    control: watch::Sender<Arc<ScheduledNode>>,
    handle: JoinHandle<()>,
}

struct Entry {
    current: Arc<ScheduledNode>,
    task: Option<NodeTask>,
}

/// Starts, reconfigures and stops acquisition tasks
pub struct Scheduler {
    ctx: DriverContext,
    cache: Arc<LiveValueCache>,
    events: EventSink,
    counters: Arc<EngineCounters>,
    entries: Mutex<HashMap<u32, Entry>>,
}

impl Scheduler {
    pub fn new(
        ctx: DriverContext,
        cache: Arc<LiveValueCache>,
        events: EventSink,
        counters: Arc<EngineCounters>,
    ) -> Self {
        Self {
            ctx,
            cache,
            events,
            counters,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<u32, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a node: create its cache entry and start it if enabled
    ///
    /// Must be called from within a tokio runtime.
    pub fn add(&self, node: Node, source: SourceSpec) {
        let id = node.id;
        let slot = self.cache.insert(&node);
        let manual = Arc::new(ManualValue::new(manual_seed(&source)));
        let current = Arc::new(ScheduledNode {
            node,
            source,
            manual,
        });

        let task = current.node.enabled.then(|| self.start(current.clone(), slot));
        tracing::info!(
            node = id,
            name = %current.node.display_name,
            source = %current.node.source_type,
            scheduled = task.is_some(),
            "Node added"
        );
        self.entries().insert(id, Entry { current, task });
    }

    /// Replace a node's definition
    ///
    /// Returns true if the node's driver had to be rebuilt.
    pub fn update(&self, node: Node, source: SourceSpec) -> bool {
        let id = node.id;
        let mut entries = self.entries();
        let Some(entry) = entries.get_mut(&id) else {
            drop(entries);
            self.add(node, source);
            return true;
        };

        let old = entry.current.clone();
        let source_changed = old.source != source;
        let manual = if source_changed {
            Arc::new(ManualValue::new(manual_seed(&source)))
        } else {
            old.manual.clone()
        };
        let next = Arc::new(ScheduledNode {
            node,
            source,
            manual,
        });

        let reset_reading = source_changed
            || old.node.scaling != next.node.scaling
            || old.node.data_type != next.node.data_type;
        self.cache.update_metadata(&next.node, reset_reading);

        let rebuilt = old.needs_rebuild(&next);
        match (entry.task.take(), next.node.enabled) {
            (Some(task), true) => {
                if rebuilt {
                    self.swap_reservation(&old, &next);
                }
                // Receiver only gone if the task already ended
                if task.handle.is_finished() || task.control.send(next.clone()).is_err() {
                    tracing::warn!(node = id, "Acquisition task had stopped, restarting");
                    entry.task = self
                        .cache
                        .slot(id)
                        .map(|slot| self.start(next.clone(), slot));
                } else {
                    entry.task = Some(task);
                }
            }
            (Some(task), false) => {
                release_reservation(&self.ctx, &old);
                drop(task.control);
                tracing::info!(node = id, "Node disabled");
            }
            (None, true) => {
                if let Some(slot) = self.cache.slot(id) {
                    entry.task = Some(self.start(next.clone(), slot));
                    tracing::info!(node = id, "Node enabled");
                }
            }
            (None, false) => {}
        }

        tracing::debug!(
            node = id,
            rebuilt,
            interval_ms = next.node.update_interval_ms,
            "Node updated"
        );
        entry.current = next;
        rebuilt
    }

    /// Stop a node and evict its cache entry
    pub fn remove(&self, id: u32) -> bool {
        // Retire the slot first so an in-flight cycle cannot write to it
        let evicted = self.cache.remove(id);
        let Some(entry) = self.entries().remove(&id) else {
            return evicted;
        };
        if let Some(task) = entry.task {
            release_reservation(&self.ctx, &entry.current);
            drop(task.control);
        }
        tracing::info!(node = id, name = %entry.current.node.display_name, "Node removed");
        true
    }

    /// Value cell of a manual node
    pub fn manual_value(&self, id: u32) -> Option<Arc<ManualValue>> {
        self.entries().get(&id).and_then(|e| match e.current.source {
            SourceSpec::Manual { .. } => Some(e.current.manual.clone()),
            _ => None,
        })
    }

    /// Number of nodes with a running task
    pub fn scheduled_count(&self) -> usize {
        self.entries().values().filter(|e| e.task.is_some()).count()
    }

    /// Stop every task and wait up to `grace` for in-flight cycles
    pub async fn shutdown(&self, grace: Duration) {
        let tasks: Vec<(u32, NodeTask, Arc<ScheduledNode>)> = self
            .entries()
            .iter_mut()
            .filter_map(|(id, e)| e.task.take().map(|t| (*id, t, e.current.clone())))
            .collect();

        let mut handles = Vec::with_capacity(tasks.len());
        for (id, task, current) in tasks {
            release_reservation(&self.ctx, &current);
            drop(task.control);
            handles.push((id, task.handle));
        }

        let deadline = Instant::now() + grace;
        for (id, handle) in handles {
            if tokio::time::timeout_at(deadline, handle).await.is_err() {
                tracing::warn!(node = id, "Acquisition task still busy at shutdown");
            }
        }
    }

    fn start(&self, current: Arc<ScheduledNode>, slot: Arc<CacheSlot>) -> NodeTask {
        if let Some(key) = current.source.device_key() {
            self.ctx.arbiter.reserve(key, current.node.id);
        }
        let generation = slot.claim();
        let id = current.node.id;

        let (control, rx) = watch::channel(current);
        let watched = slot.clone();
        let inner = tokio::spawn(run_node(
            rx,
            slot,
            generation,
            self.ctx.clone(),
            self.events.clone(),
            self.counters.clone(),
        ));
        // A panicking driver must still leave an error on the node
        let handle = tokio::spawn(async move {
            if let Err(e) = inner.await {
                if e.is_panic() && watched.is_owned_by(generation) {
                    tracing::error!(node = id, "Acquisition task panicked");
                    watched.record(&Reading::failure("acquisition task panicked"), None, 0);
                }
            }
        });
        NodeTask { control, handle }
    }

    fn swap_reservation(&self, old: &ScheduledNode, new: &ScheduledNode) {
        let (old_key, new_key) = (old.source.device_key(), new.source.device_key());
        if old_key == new_key {
            return;
        }
        release_reservation(&self.ctx, old);
        if let Some(key) = new_key {
            self.ctx.arbiter.reserve(key, new.node.id);
        }
    }
}

fn release_reservation(ctx: &DriverContext, node: &ScheduledNode) {
    if let Some(key) = node.source.device_key() {
        ctx.arbiter.release(key, node.node.id);
    }
}

fn manual_seed(source: &SourceSpec) -> f64 {
    match source {
        SourceSpec::Manual { initial_value } => *initial_value,
        _ => 0.0,
    }
}

/// Next fire time on a fixed cadence, skipping fires already missed
pub fn next_deadline(last_fire: Instant, interval: Duration, now: Instant) -> Instant {
    let next = last_fire + interval;
    if next > now {
        return next;
    }
    let behind = now.duration_since(last_fire).as_nanos();
    let periods = behind / interval.as_nanos().max(1) + 1;
    last_fire + interval * u32::try_from(periods).unwrap_or(u32::MAX)
}

/// Acquisition loop of one node
async fn run_node(
    mut control: watch::Receiver<Arc<ScheduledNode>>,
    slot: Arc<CacheSlot>,
    generation: u64,
    ctx: DriverContext,
    events: EventSink,
    counters: Arc<EngineCounters>,
) {
    let mut current = control.borrow_and_update().clone();
    let id = current.node.id;
    let mut driver = SourceDriver::build(id, &current.source, current.manual.clone(), &ctx);
    let mut health: Option<NodeState> = None;
    let mut last_fire: Option<Instant> = None;
    let mut next_fire = Instant::now();

    tracing::debug!(node = id, "Acquisition task started");

    loop {
        tokio::select! {
            biased;
            changed = control.changed() => {
                if changed.is_err() {
                    break;
                }
                let next = control.borrow_and_update().clone();
                if current.needs_rebuild(&next) {
                    driver = SourceDriver::build(id, &next.source, next.manual.clone(), &ctx);
                    health = None;
                    tracing::debug!(node = id, "Driver rebuilt");
                }
                current = next;
                let now = Instant::now();
                next_fire = match last_fire {
                    Some(last) => (last + current.interval()).max(now),
                    None => now,
                };
                continue;
            }
            _ = tokio::time::sleep_until(next_fire) => {}
        }

        let cycle = current.clone();
        let fired_at = Instant::now();
        last_fire = Some(fired_at);
        slot.set_state(NodeState::Acquiring);

        let result = driver.read(&ctx, cycle.interval()).await;
        let elapsed_us = fired_at.elapsed().as_micros() as u64;

        // Drop results for nodes removed, disabled or re-sourced mid-cycle
        let superseded = match control.has_changed() {
            Err(_) => true,
            Ok(false) => false,
            Ok(true) => cycle.needs_rebuild(&control.borrow()),
        };
        if superseded || slot.is_retired() {
            counters.record_discarded();
            tracing::trace!(node = id, "Discarding result of superseded cycle");
            if slot.is_retired() || control.has_changed().is_err() {
                break;
            }
            next_fire = Instant::now();
            continue;
        }

        // Scaling edits that arrived mid-cycle apply to this result
        let latest = control.borrow().clone();
        let (reading, typed) = match result {
            Ok(raw) => {
                let (value, typed) =
                    engineering_value(latest.node.scaling.as_ref(), latest.node.data_type, raw);
                (Reading::success(raw, value), Some(typed))
            }
            Err(e) => (Reading::failure(e.to_string()), None),
        };
        let ok = reading.is_ok();

        if !slot.record(&reading, typed, elapsed_us) {
            counters.record_discarded();
            break;
        }
        counters.record_cycle(ok);

        let state = if ok { NodeState::Ok } else { NodeState::Errored };
        if health != Some(state) {
            match (health, ok) {
                (_, false) => tracing::warn!(
                    node = id,
                    name = %cycle.node.display_name,
                    error = reading.error.as_deref().unwrap_or(""),
                    "Node acquisition failing"
                ),
                (Some(NodeState::Errored), true) => {
                    tracing::info!(node = id, name = %cycle.node.display_name, "Node recovered")
                }
                _ => {}
            }
            if let Some(from) = health {
                events.send(EngineMessage::HealthChanged { id, from, to: state });
            }
            health = Some(state);
        }
        if let Some(error) = reading.error {
            tracing::trace!(node = id, %error, "Cycle failed");
            events.send(EngineMessage::ReadError { id, error });
        } else {
            tracing::trace!(node = id, raw = ?reading.raw_value, value = ?reading.value, "Cycle ok");
        }

        slot.set_state(NodeState::Idle);
        next_fire = next_deadline(fired_at, current.interval(), Instant::now());
    }

    // No-op once the slot is retired or owned by a newer task
    slot.release(generation);
    tracing::debug!(node = id, "Acquisition task stopped");
}
