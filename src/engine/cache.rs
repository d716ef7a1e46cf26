//! Live value cache
//!
//! One entry per registered node, in registry order. Each entry sits behind
//! its own lock; the list lock is only held long enough to clone entry
//! handles, so a reader walking the table never blocks the writer of an
//! unrelated node.
//!
//! An entry's acquisition task is its only writer. When a node is removed
//! its slot is marked retired before it leaves the list, and writes to a
//! retired slot are ignored; a cycle that was in flight during removal can
//! therefore never resurrect the entry.

use super::stats::NodeStats;
use crate::types::{DataType, Node, NodeState, NodeValue, Reading, SourceType};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// Snapshot of one node's latest reading plus display metadata
#[derive(Debug, Clone, Serialize)]
pub struct LiveValue {
    pub id: u32,
    pub node_id: String,
    pub display_name: String,
    pub unit: String,
    pub data_type: DataType,
    pub source_type: SourceType,
    pub state: NodeState,
    /// Engineering value of the last cycle (None after a failure)
    pub value: Option<f64>,
    /// Engineering value coerced to `data_type`
    pub typed_value: Option<NodeValue>,
    /// Last successful raw reading, kept across failures
    pub raw_value: Option<f64>,
    /// Failure message of the last cycle
    pub error: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
    pub stats: NodeStats,
}

impl LiveValue {
    fn new(node: &Node, state: NodeState) -> Self {
        Self {
            id: node.id,
            node_id: node.node_id.clone(),
            display_name: node.display_name.clone(),
            unit: node.unit().to_string(),
            data_type: node.data_type,
            source_type: node.source_type,
            state,
            value: None,
            typed_value: None,
            raw_value: None,
            error: None,
            updated_at: None,
            stats: NodeStats::default(),
        }
    }

    fn clear_reading(&mut self) {
        self.value = None;
        self.typed_value = None;
        self.raw_value = None;
        self.error = None;
        self.updated_at = None;
        self.stats = NodeStats::default();
    }
}

/// Lock-protected entry for one node
pub struct CacheSlot {
    entry: RwLock<LiveValue>,
    retired: AtomicBool,
    /// Generation of the acquisition task that owns the slot; only changed
    /// with `entry` write-locked
    owner: AtomicU64,
}

impl CacheSlot {
    fn new(entry: LiveValue) -> Self {
        Self {
            entry: RwLock::new(entry),
            retired: AtomicBool::new(false),
            owner: AtomicU64::new(0),
        }
    }

    /// Hand the slot to a new acquisition task and mark it Idle
    ///
    /// Returns the task's generation.
    pub fn claim(&self) -> u64 {
        self.write(|e| {
            e.state = NodeState::Idle;
            self.owner.fetch_add(1, Ordering::AcqRel) + 1
        })
        .unwrap_or(0)
    }

    /// Whether `generation` is still the slot's owner
    pub fn is_owned_by(&self, generation: u64) -> bool {
        self.owner.load(Ordering::Acquire) == generation
    }

    /// Mark the node Disabled on behalf of a stopping task
    ///
    /// Ignored if another task has claimed the slot since.
    pub fn release(&self, generation: u64) {
        self.write(|e| {
            if self.is_owned_by(generation) {
                e.state = NodeState::Disabled;
            }
        });
    }

    /// Whether the node has been removed
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    fn retire(&self) {
        self.retired.store(true, Ordering::Release);
    }

    fn write<R>(&self, f: impl FnOnce(&mut LiveValue) -> R) -> Option<R> {
        if self.is_retired() {
            return None;
        }
        let mut entry = self.entry.write().unwrap_or_else(PoisonError::into_inner);
        Some(f(&mut entry))
    }

    /// Copy of the entry
    pub fn read(&self) -> LiveValue {
        self.entry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Scheduler state of the node
    pub fn state(&self) -> NodeState {
        self.entry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .state
    }

    /// Move the node to `state`
    pub fn set_state(&self, state: NodeState) {
        self.write(|e| e.state = state);
    }

    /// Store the result of one cycle
    ///
    /// On failure the last good `raw_value` is kept and `value` cleared.
    /// Returns false if the slot was retired and the reading dropped.
    pub fn record(&self, reading: &Reading, typed: Option<NodeValue>, cycle_time_us: u64) -> bool {
        self.write(|e| {
            if reading.is_ok() {
                e.raw_value = reading.raw_value;
                e.value = reading.value;
                e.typed_value = typed;
                e.error = None;
                e.state = NodeState::Ok;
                e.stats.record_success(cycle_time_us);
            } else {
                e.value = None;
                e.typed_value = None;
                e.error = reading.error.clone();
                e.state = NodeState::Errored;
                e.stats.record_failure(cycle_time_us);
            }
            e.updated_at = Some(reading.timestamp);
        })
        .is_some()
    }
}

/// Latest reading of every registered node
#[derive(Default)]
pub struct LiveValueCache {
    slots: RwLock<Vec<(u32, Arc<CacheSlot>)>>,
}

impl LiveValueCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn handles(&self) -> Vec<Arc<CacheSlot>> {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, slot)| slot.clone())
            .collect()
    }

    /// Append an entry for a newly registered node
    pub fn insert(&self, node: &Node) -> Arc<CacheSlot> {
        let state = if node.enabled {
            NodeState::Idle
        } else {
            NodeState::Disabled
        };
        let slot = Arc::new(CacheSlot::new(LiveValue::new(node, state)));
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = slots.iter_mut().find(|(id, _)| *id == node.id) {
            existing.1.retire();
            existing.1 = slot.clone();
        } else {
            slots.push((node.id, slot.clone()));
        }
        slot
    }

    /// Refresh display metadata after an update
    ///
    /// The previous reading is dropped when `reset_reading` is set (the
    /// source, scaling or data type changed).
    pub fn update_metadata(&self, node: &Node, reset_reading: bool) {
        if let Some(slot) = self.slot(node.id) {
            slot.write(|e| {
                e.node_id = node.node_id.clone();
                e.display_name = node.display_name.clone();
                e.unit = node.unit().to_string();
                e.data_type = node.data_type;
                e.source_type = node.source_type;
                if reset_reading {
                    e.clear_reading();
                }
                if !node.enabled {
                    e.state = NodeState::Disabled;
                } else if e.state == NodeState::Disabled {
                    e.state = NodeState::Idle;
                }
            });
        }
    }

    /// Evict a node's entry; later writes through held handles are ignored
    pub fn remove(&self, id: u32) -> bool {
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        match slots.iter().position(|(slot_id, _)| *slot_id == id) {
            Some(index) => {
                let (_, slot) = slots.remove(index);
                slot.retire();
                true
            }
            None => false,
        }
    }

    /// Handle to a node's entry
    pub fn slot(&self, id: u32) -> Option<Arc<CacheSlot>> {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|(slot_id, _)| *slot_id == id)
            .map(|(_, slot)| slot.clone())
    }

    /// Copy of one node's entry
    pub fn get(&self, id: u32) -> Option<LiveValue> {
        self.slot(id).map(|slot| slot.read())
    }

    /// Copy of every entry in registry order
    pub fn snapshot(&self) -> Vec<LiveValue> {
        self.handles().iter().map(|slot| slot.read()).collect()
    }

    pub fn len(&self) -> usize {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
