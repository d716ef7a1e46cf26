//! Acquisition engine
//!
//! The [`Engine`] owns the node registry, the per-node scheduler, the live
//! value cache and the bus arbiter, and is the only entry point for
//! changing any of them.
//!
//! # Architecture
//!
//! ```text
//! apply_config ──► Registry::plan ──► NodeStore ──► Registry + Scheduler
//!                                                        │
//!                        ┌───────────────────────────────┘
//!                        ▼
//!        one task per node: timer ─► SourceDriver::read ─► scaling ─► LiveValueCache
//!                                          │
//!                                   BusArbiter (per DeviceKey)
//! ```
//!
//! # Components
//!
//! - [`Registry`] - Authoritative node table and config diffing
//! - [`Scheduler`] - Starts, retimes and stops per-node acquisition tasks
//! - [`BusArbiter`] - Serializes transactions per shared bus device
//! - [`LiveValueCache`] - Latest reading per node, read by consumers
//! - [`EngineEvents`] - Feed of lifecycle and health messages
//!
//! # Example
//!
//! ```ignore
//! use nodeacq_rs::engine::Engine;
//! use nodeacq_rs::config::EngineConfig;
//! use nodeacq_rs::hardware::MockHardware;
//! use nodeacq_rs::store::MemoryNodeStore;
//!
//! let config = EngineConfig::sample();
//! let (engine, events) = Engine::new(
//!     &config.acquisition,
//!     Arc::new(MockHardware::new()),
//!     Arc::new(MemoryNodeStore::new()),
//! );
//! engine.apply_config(config.nodes).await?;
//!
//! for value in engine.get_live_values() {
//!     println!("{} = {:?} {}", value.display_name, value.value, value.unit);
//! }
//! ```

pub mod arbiter;
pub mod cache;
pub mod events;
pub mod registry;
pub mod scaling;
pub mod scheduler;
pub mod stats;

pub use arbiter::BusArbiter;
pub use cache::{CacheSlot, LiveValue, LiveValueCache};
pub use events::{EngineEvents, EngineMessage, EventSink};
pub use registry::{ApplySummary, NodeOp, Registry, ValidatedSpec};
pub use scaling::{apply_scaling, validate_scaling};
pub use scheduler::{ScheduledNode, Scheduler};
pub use stats::{EngineCounters, EngineStats, NodeStats};

use crate::config::AcquisitionConfig;
use crate::error::{EngineError, Result};
use crate::hardware::{HardwareAccess, PinMode};
use crate::source::{run_blocking, DriverContext, SourceSpec};
use crate::store::NodeStore;
use crate::types::{Node, NodeSpec, NodeState, SourceType};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

/// A store operation that succeeded and must now reach the registry
enum Committed {
    Removed(Node),
    Updated { node: Node, source: SourceSpec },
    Added { node: Node, source: SourceSpec },
}

/// Run a node store call on the blocking thread pool
async fn store_call<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| EngineError::Store(format!("node store call aborted: {}", e)))?
}

/// Node acquisition and scaling engine
pub struct Engine {
    settings: AcquisitionConfig,
    registry: RwLock<Registry>,
    scheduler: Scheduler,
    cache: Arc<LiveValueCache>,
    arbiter: Arc<BusArbiter>,
    hardware: Arc<dyn HardwareAccess>,
    store: Arc<dyn NodeStore>,
    events: EventSink,
    counters: Arc<EngineCounters>,
    /// Serializes registry writers
    apply_lock: tokio::sync::Mutex<()>,
}

impl Engine {
    /// Create an engine and the receiver for its event feed
    pub fn new(
        settings: &AcquisitionConfig,
        hardware: Arc<dyn HardwareAccess>,
        store: Arc<dyn NodeStore>,
    ) -> (Self, EngineEvents) {
        let (tx, rx) = crossbeam_channel::bounded(settings.event_buffer_size.max(1));
        let counters = Arc::new(EngineCounters::default());
        let events = EventSink::new(tx, counters.clone());
        let cache = Arc::new(LiveValueCache::new());
        let arbiter = Arc::new(BusArbiter::new());

        let ctx = DriverContext {
            hardware: hardware.clone(),
            arbiter: arbiter.clone(),
            bus_timeout: Duration::from_millis(settings.bus_timeout_ms),
            simulation_seed: settings.simulation_seed,
        };
        let scheduler = Scheduler::new(ctx, cache.clone(), events.clone(), counters.clone());

        tracing::info!(
            hardware = hardware.name(),
            bus_timeout_ms = settings.bus_timeout_ms,
            "Engine created"
        );

        let engine = Self {
            settings: settings.clone(),
            registry: RwLock::new(Registry::new()),
            scheduler,
            cache,
            arbiter,
            hardware,
            store,
            events,
            counters,
            apply_lock: tokio::sync::Mutex::new(()),
        };
        (engine, EngineEvents::new(rx))
    }

    fn registry(&self) -> RwLockReadGuard<'_, Registry> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn registry_mut(&self) -> RwLockWriteGuard<'_, Registry> {
        self.registry.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Populate an empty registry from the node store
    ///
    /// Stored nodes that no longer validate are skipped with a warning.
    /// Returns the number of nodes loaded.
    pub async fn load_from_store(&self) -> Result<usize> {
        let _guard = self.apply_lock.lock().await;
        if !self.registry().is_empty() {
            return Err(EngineError::Config(
                "registry already populated; use apply_config to change it".to_string(),
            ));
        }

        let store = self.store.clone();
        let stored = store_call(move || store.list()).await?;
        let mut registry = self.registry_mut();
        let mut loaded = 0;
        for node in stored {
            match registry::validate_spec(&node.to_spec(), self.settings.min_interval_ms) {
                Ok(source) => {
                    registry.insert(node.clone());
                    self.scheduler.add(node, source);
                    loaded += 1;
                }
                Err(e) => {
                    tracing::warn!(node = node.id, name = %node.display_name, error = %e, "Skipping invalid stored node");
                }
            }
        }
        tracing::info!(loaded, "Loaded nodes from store");
        Ok(loaded)
    }

    /// Reconcile the registry with a desired node list
    ///
    /// The whole list is validated first; any problem rejects the batch and
    /// leaves everything untouched. Nodes not in the list are removed.
    pub async fn apply_config(&self, desired: Vec<NodeSpec>) -> Result<ApplySummary> {
        let _guard = self.apply_lock.lock().await;
        self.apply_locked(&desired).await
    }

    async fn apply_locked(&self, desired: &[NodeSpec]) -> Result<ApplySummary> {
        let (ops, summary) = match self.registry().plan(desired, self.settings.min_interval_ms) {
            Ok(plan) => plan,
            Err(e) => {
                tracing::warn!(error = %e, "Configuration rejected");
                return Err(e);
            }
        };
        if ops.is_empty() {
            tracing::debug!("Configuration unchanged");
            return Ok(summary);
        }

        let mut committed = Vec::with_capacity(ops.len());
        let mut failure = None;
        for op in ops {
            let store = self.store.clone();
            let stored = store_call(move || match op {
                NodeOp::Remove(node) => store.delete(node.id).map(|()| Committed::Removed(node)),
                NodeOp::Update { old, new } => {
                    store
                        .update(old.id, &new.spec)
                        .map(|node| Committed::Updated {
                            node,
                            source: new.source,
                        })
                }
                NodeOp::Add(new) => store.create(&new.spec).map(|node| Committed::Added {
                    node,
                    source: new.source,
                }),
            })
            .await;
            match stored {
                Ok(c) => committed.push(c),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        let applied = committed.len();
        self.commit(committed);

        match failure {
            Some(e) => {
                tracing::error!(applied, error = %e, "Node store failed mid-apply");
                Err(e.with_context(format!(
                    "node store failed after {} stored change(s); registry matches the store",
                    applied
                )))
            }
            None => {
                tracing::info!(%summary, "Configuration applied");
                self.events.send(EngineMessage::ConfigApplied(summary));
                Ok(summary)
            }
        }
    }

    /// Push stored changes into the registry and scheduler in one step
    fn commit(&self, committed: Vec<Committed>) {
        let mut registry = self.registry_mut();
        for change in committed {
            match change {
                Committed::Removed(node) => {
                    registry.remove(node.id);
                    self.scheduler.remove(node.id);
                    self.events.send(EngineMessage::NodeRemoved {
                        id: node.id,
                        name: node.display_name,
                    });
                }
                Committed::Updated { node, source } => {
                    let (id, name) = (node.id, node.display_name.clone());
                    registry.replace(node.clone());
                    let rebuilt = self.scheduler.update(node, source);
                    self.events.send(EngineMessage::NodeUpdated { id, name, rebuilt });
                }
                Committed::Added { node, source } => {
                    let (id, name) = (node.id, node.display_name.clone());
                    registry.insert(node.clone());
                    self.scheduler.add(node, source);
                    self.events.send(EngineMessage::NodeAdded { id, name });
                }
            }
        }
    }

    /// Register one new node
    pub async fn create_node(&self, mut spec: NodeSpec) -> Result<Node> {
        let _guard = self.apply_lock.lock().await;
        spec.id = None;
        let node_id = spec.node_id.clone();
        let mut desired = self.registry().specs();
        desired.push(spec);
        self.apply_locked(&desired).await?;
        self.registry()
            .get_by_node_id(&node_id)
            .cloned()
            .ok_or_else(|| EngineError::Store(format!("created node '{}' not registered", node_id)))
    }

    /// Replace the definition of node `id`
    pub async fn update_node(&self, id: u32, spec: NodeSpec) -> Result<Node> {
        let _guard = self.apply_lock.lock().await;
        let mut desired = self.registry().specs();
        let slot = desired
            .iter_mut()
            .find(|s| s.id == Some(id))
            .ok_or(EngineError::UnknownNode(id))?;
        *slot = spec.with_id(id);
        self.apply_locked(&desired).await?;
        self.registry().get(id).cloned().ok_or(EngineError::UnknownNode(id))
    }

    /// Remove node `id`
    pub async fn delete_node(&self, id: u32) -> Result<()> {
        let _guard = self.apply_lock.lock().await;
        let mut desired = self.registry().specs();
        let before = desired.len();
        desired.retain(|s| s.id != Some(id));
        if desired.len() == before {
            return Err(EngineError::UnknownNode(id));
        }
        self.apply_locked(&desired).await.map(|_| ())
    }

    /// Registered nodes in registry order
    pub fn list_nodes(&self) -> Vec<Node> {
        self.registry().nodes().to_vec()
    }

    pub fn get_node(&self, id: u32) -> Option<Node> {
        self.registry().get(id).cloned()
    }

    /// Latest reading of every registered node, in registry order
    pub fn get_live_values(&self) -> Vec<LiveValue> {
        self.cache.snapshot()
    }

    /// Latest reading of one node
    pub fn get_live_value(&self, id: u32) -> Option<LiveValue> {
        self.cache.get(id)
    }

    /// Set the value a manual node reports from its next cycle on
    pub fn set_manual_value(&self, id: u32, value: f64) -> Result<()> {
        let node = self.get_node(id).ok_or(EngineError::UnknownNode(id))?;
        if node.source_type != SourceType::Manual {
            return Err(EngineError::Config(format!(
                "node '{}' is a {} source, not manual",
                node.display_name, node.source_type
            )));
        }
        if !value.is_finite() {
            return Err(EngineError::Config(format!("manual value must be finite, got {}", value)));
        }
        let cell = self
            .scheduler
            .manual_value(id)
            .ok_or(EngineError::UnknownNode(id))?;
        cell.set(value);
        self.counters.record_write();
        tracing::debug!(node = id, value, "Manual value set");
        Ok(())
    }

    /// Client write to a node
    ///
    /// Requires a writable access level. Manual nodes store the value;
    /// output pins are driven high for any non-zero value. Every other
    /// source is read-only.
    pub async fn write_value(&self, id: u32, value: f64) -> Result<()> {
        let node = self.get_node(id).ok_or(EngineError::UnknownNode(id))?;
        if !node.access_level.is_writable() {
            return Err(EngineError::Config(format!(
                "node '{}' is read-only",
                node.display_name
            )));
        }

        let source = SourceSpec::parse(node.source_type, &node.source_config, node.initial_value)?;
        match source {
            SourceSpec::Manual { .. } => self.set_manual_value(id, value)?,
            SourceSpec::DigitalIo {
                pin,
                mode: PinMode::Output,
            } => {
                let hw = self.hardware.clone();
                let high = value != 0.0;
                run_blocking(move || {
                    hw.setup_pin(pin, PinMode::Output)?;
                    hw.write_pin(pin, high)
                })
                .await?;
                self.counters.record_write();
                tracing::info!(node = id, pin, high, "Output pin written");
            }
            _ => {
                return Err(EngineError::Config(format!(
                    "node '{}' ({}) does not accept writes",
                    node.display_name, node.source_type
                )))
            }
        }

        self.events.send(EngineMessage::WriteSuccess { id, value });
        Ok(())
    }

    /// Snapshot of engine-wide statistics
    pub fn stats(&self) -> EngineStats {
        let values = self.cache.snapshot();
        EngineStats {
            nodes_total: self.registry().len(),
            nodes_scheduled: self.scheduler.scheduled_count(),
            nodes_ok: values
                .iter()
                .filter(|v| v.updated_at.is_some() && v.error.is_none())
                .count(),
            nodes_errored: values.iter().filter(|v| v.error.is_some()).count(),
            device_keys: self.arbiter.key_count(),
            counters: self.counters.snapshot(),
        }
    }

    /// Hardware backend in use
    pub fn hardware(&self) -> &Arc<dyn HardwareAccess> {
        &self.hardware
    }

    /// Stop every acquisition task
    ///
    /// Registered nodes stay in the registry with state Disabled.
    pub async fn shutdown(&self) {
        let _guard = self.apply_lock.lock().await;
        tracing::info!("Engine shutting down");
        self.scheduler
            .shutdown(Duration::from_millis(self.settings.shutdown_grace_ms))
            .await;
        for value in self.cache.snapshot() {
            if let Some(slot) = self.cache.slot(value.id) {
                slot.set_state(NodeState::Disabled);
            }
        }
        self.events.send(EngineMessage::Shutdown);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::MockHardware;
    use crate::store::{MemoryNodeStore, MockNodeStore};
    use crate::types::AccessLevel;

    fn engine_with_store(store: Arc<dyn NodeStore>) -> (Engine, EngineEvents) {
        Engine::new(&AcquisitionConfig::default(), Arc::new(MockHardware::new()), store)
    }

    fn manual(name: &str) -> NodeSpec {
        NodeSpec::new(name, format!("ns=2;s={}", name), SourceType::Manual).with_interval(20)
    }

    #[tokio::test]
    async fn test_apply_and_list() {
        let (engine, events) = engine_with_store(Arc::new(MemoryNodeStore::new()));
        let summary = engine
            .apply_config(vec![manual("a"), manual("b")])
            .await
            .unwrap();
        assert_eq!(summary.added, 2);

        let nodes = engine.list_nodes();
        assert_eq!(nodes.iter().map(|n| n.id).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(engine.get_live_values().len(), 2);

        let messages = events.drain();
        assert!(messages.contains(&EngineMessage::NodeAdded {
            id: 1,
            name: "a".into()
        }));
        assert!(messages
            .iter()
            .any(|m| matches!(m, EngineMessage::ConfigApplied(s) if s.added == 2)));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_rejected_config_leaves_registry_untouched() {
        let (engine, _events) = engine_with_store(Arc::new(MemoryNodeStore::new()));
        engine.apply_config(vec![manual("a")]).await.unwrap();

        let bad = NodeSpec::new("adc", "ns=2;s=Adc", SourceType::AnalogChannel)
            .with_config("device", "ads1115");
        let err = engine
            .apply_config(vec![manual("b"), bad])
            .await
            .unwrap_err();
        assert!(err.is_config_error());

        let names: Vec<String> = engine.list_nodes().into_iter().map(|n| n.display_name).collect();
        assert_eq!(names, vec!["a"]);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_apply_persists_to_file_store() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("nodes.json");
        let store = Arc::new(crate::store::FileNodeStore::open(&path).unwrap());
        let (engine, _events) = engine_with_store(store);

        engine
            .apply_config(vec![manual("a"), manual("b")])
            .await
            .unwrap();
        engine.delete_node(1).await.unwrap();
        engine.shutdown().await;

        let reopened = crate::store::FileNodeStore::open(&path).unwrap();
        let names: Vec<String> = reopened
            .list()
            .unwrap()
            .into_iter()
            .map(|n| n.display_name)
            .collect();
        assert_eq!(names, vec!["b"]);

        let (engine, _events) = engine_with_store(Arc::new(reopened));
        assert_eq!(engine.load_from_store().await.unwrap(), 1);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_store_calls_leave_runtime_thread() {
        let runtime_thread = std::thread::current().id();
        let mut store = MockNodeStore::new();
        store.expect_list().returning(move || {
            assert_ne!(std::thread::current().id(), runtime_thread);
            Ok(Vec::new())
        });
        store.expect_create().returning(move |spec| {
            assert_ne!(std::thread::current().id(), runtime_thread);
            Ok(spec.clone().into_node(1))
        });

        let (engine, _events) = engine_with_store(Arc::new(store));
        assert_eq!(engine.load_from_store().await.unwrap(), 0);
        engine.apply_config(vec![manual("a")]).await.unwrap();
        assert_eq!(engine.list_nodes().len(), 1);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_store_failure_stops_apply() {
        let mut store = MockNodeStore::new();
        let mut next_id = 0;
        store.expect_create().returning(move |spec| {
            next_id += 1;
            if next_id > 1 {
                Err(EngineError::Store("disk full".into()))
            } else {
                Ok(spec.clone().into_node(next_id))
            }
        });

        let (engine, _events) = engine_with_store(Arc::new(store));
        let err = engine
            .apply_config(vec![manual("a"), manual("b")])
            .await
            .unwrap_err();
        assert!(matches!(err.root_cause(), EngineError::Store(_)));

        // Only the stored node reached the registry
        let nodes = engine.list_nodes();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].display_name, "a");
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_crud_round() {
        let (engine, _events) = engine_with_store(Arc::new(MemoryNodeStore::new()));
        let a = engine.create_node(manual("a")).await.unwrap();
        assert_eq!(a.id, 1);

        let dup = engine.create_node(manual("a")).await.unwrap_err();
        assert!(dup.is_config_error());

        let updated = engine
            .update_node(a.id, manual("a").with_interval(500))
            .await
            .unwrap();
        assert_eq!(updated.update_interval_ms, 500);

        assert!(matches!(
            engine.update_node(99, manual("x")).await,
            Err(EngineError::UnknownNode(99))
        ));

        engine.delete_node(a.id).await.unwrap();
        assert!(engine.get_node(a.id).is_none());
        assert!(engine.get_live_value(a.id).is_none());
        assert!(matches!(
            engine.delete_node(a.id).await,
            Err(EngineError::UnknownNode(_))
        ));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_manual_value_rules() {
        let (engine, _events) = engine_with_store(Arc::new(MemoryNodeStore::new()));
        let sim = NodeSpec::new("sim", "ns=2;s=Sim", SourceType::Simulation)
            .with_config("sim_type", "random");
        engine.apply_config(vec![manual("m"), sim]).await.unwrap();

        engine.set_manual_value(1, 12.5).unwrap();
        assert!(engine.set_manual_value(2, 1.0).unwrap_err().is_config_error());
        assert!(engine.set_manual_value(1, f64::NAN).is_err());
        assert!(matches!(
            engine.set_manual_value(7, 1.0),
            Err(EngineError::UnknownNode(7))
        ));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_write_access_checks() {
        let (engine, _events) = engine_with_store(Arc::new(MemoryNodeStore::new()));
        let read_only = manual("ro");
        let writable = manual("rw").with_access(AccessLevel::ReadWrite);
        let sim = NodeSpec::new("sim", "ns=2;s=Sim", SourceType::Simulation)
            .with_access(AccessLevel::ReadWrite)
            .with_config("sim_type", "sine");
        engine
            .apply_config(vec![read_only, writable, sim])
            .await
            .unwrap();

        assert!(engine.write_value(1, 1.0).await.unwrap_err().is_config_error());
        engine.write_value(2, 3.0).await.unwrap();
        assert!(engine.write_value(3, 1.0).await.unwrap_err().is_config_error());
        assert_eq!(engine.stats().counters.writes, 1);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_load_from_store() {
        let store = Arc::new(MemoryNodeStore::new());
        store.create(&manual("a")).unwrap();
        // Invalid record: digital source without a pin
        store
            .create(&NodeSpec::new("bad", "ns=2;s=Bad", SourceType::DigitalIo))
            .unwrap();

        let (engine, _events) = engine_with_store(store);
        assert_eq!(engine.load_from_store().await.unwrap(), 1);
        assert!(engine.load_from_store().await.is_err());
        assert_eq!(engine.list_nodes().len(), 1);
        engine.shutdown().await;
    }
}
