//! # nodeacq-rs: Node Acquisition & Scaling Engine
//!
//! Continuously samples a heterogeneous set of signal sources (GPIO pins,
//! channels on I2C/SPI analog-to-digital converters, software simulators and
//! manually set values), converts each raw reading to an engineering value
//! and keeps a live-value table for a monitoring surface.
//!
//! ## Architecture
//!
//! - **Registry**: Authoritative table of node definitions, reconciled
//!   against desired configuration without disturbing unaffected nodes
//! - **Scheduler**: One tokio task per enabled node, each on its own cadence
//! - **Source drivers**: Tagged variant per source type with one `read()`
//! - **Bus arbiter**: Serializes transactions against shared bus devices
//! - **Scaling**: Linear raw to engineering-unit transform
//! - **Live value cache**: Per-entry locked table read by consumers
//! - **Communication**: Crossbeam channel carrying engine events
//!
//! ## Configuration
//!
//! Node definitions are persisted through a [`store::NodeStore`]; the file
//! store defaults to the platform data directory under
//! `dev.hxyulin.nodeacq-rs`:
//!
//! - **Linux**: `~/.local/share/dev.hxyulin.nodeacq-rs/`
//! - **macOS**: `~/Library/Application Support/dev.hxyulin.nodeacq-rs/`
//! - **Windows**: `%APPDATA%\dev.hxyulin.nodeacq-rs\`
//!
//! ## Example
//!
//! ```ignore
//! use nodeacq_rs::{config::EngineConfig, engine::Engine};
//! use nodeacq_rs::hardware::MockHardware;
//! use nodeacq_rs::store::MemoryNodeStore;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> nodeacq_rs::Result<()> {
//!     let config = EngineConfig::sample();
//!     let (engine, events) = Engine::new(
//!         &config.acquisition,
//!         Arc::new(MockHardware::new()),
//!         Arc::new(MemoryNodeStore::new()),
//!     );
//!     engine.apply_config(config.nodes).await?;
//!
//!     tokio::time::sleep(std::time::Duration::from_secs(1)).await;
//!     for value in engine.get_live_values() {
//!         println!("{}: {:?} {}", value.display_name, value.value, value.unit);
//!     }
//!     engine.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod hardware;
pub mod source;
pub mod store;
pub mod types;

// Re-export commonly used types
pub use config::EngineConfig;
pub use engine::{ApplySummary, Engine, EngineEvents, EngineMessage, LiveValue};
pub use error::{EngineError, Result};
pub use hardware::{HardwareAccess, MockHardware};
pub use store::{FileNodeStore, MemoryNodeStore, NodeStore};
pub use types::{DeviceKey, Node, NodeSpec, NodeState, Scaling, SourceType};
