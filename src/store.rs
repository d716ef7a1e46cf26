//! Node persistence
//!
//! The engine keeps its registry in memory and mirrors every change to a
//! [`NodeStore`]. The store owns id assignment: `create` returns the
//! canonical record with its new id.
//!
//! # Implementations
//!
//! - [`MemoryNodeStore`] - Process-local, ids from a counter
//! - [`FileNodeStore`] - JSON document on disk, rewritten on every mutation

use crate::error::{EngineError, Result};
use crate::types::{Node, NodeSpec};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Persistence collaborator for node definitions
#[cfg_attr(test, mockall::automock)]
pub trait NodeStore: Send + Sync {
    /// All stored nodes in creation order
    fn list(&self) -> Result<Vec<Node>>;

    /// Persist a new node and return it with its assigned id
    fn create(&self, spec: &NodeSpec) -> Result<Node>;

    /// Replace the stored node `id`
    fn update(&self, id: u32, spec: &NodeSpec) -> Result<Node>;

    /// Delete the stored node `id`
    fn delete(&self, id: u32) -> Result<()>;
}

/// On-disk and in-memory document layout
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoreDocument {
    next_id: u32,
    nodes: Vec<Node>,
}

impl Default for StoreDocument {
    fn default() -> Self {
        Self {
            next_id: 1,
            nodes: Vec::new(),
        }
    }
}

impl StoreDocument {
    fn create(&mut self, spec: &NodeSpec) -> Node {
        let node = spec.clone().into_node(self.next_id);
        self.next_id += 1;
        self.nodes.push(node.clone());
        node
    }

    fn update(&mut self, id: u32, spec: &NodeSpec) -> Result<Node> {
        let slot = self
            .nodes
            .iter_mut()
            .find(|n| n.id == id)
            .ok_or(EngineError::UnknownNode(id))?;
        *slot = spec.clone().into_node(id);
        Ok(slot.clone())
    }

    fn delete(&mut self, id: u32) -> Result<()> {
        let index = self
            .nodes
            .iter()
            .position(|n| n.id == id)
            .ok_or(EngineError::UnknownNode(id))?;
        self.nodes.remove(index);
        Ok(())
    }
}

/// Store that lives only as long as the process
#[derive(Debug, Default)]
pub struct MemoryNodeStore {
    doc: Mutex<StoreDocument>,
}

impl MemoryNodeStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn doc(&self) -> MutexGuard<'_, StoreDocument> {
        self.doc.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl NodeStore for MemoryNodeStore {
    fn list(&self) -> Result<Vec<Node>> {
        Ok(self.doc().nodes.clone())
    }

    fn create(&self, spec: &NodeSpec) -> Result<Node> {
        Ok(self.doc().create(spec))
    }

    fn update(&self, id: u32, spec: &NodeSpec) -> Result<Node> {
        self.doc().update(id, spec)
    }

    fn delete(&self, id: u32) -> Result<()> {
        self.doc().delete(id)
    }
}

/// Store backed by a JSON file
#[derive(Debug)]
pub struct FileNodeStore {
    path: PathBuf,
    doc: Mutex<StoreDocument>,
}

impl FileNodeStore {
    /// Open the store at `path`, starting empty if the file does not exist
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let doc = if path.exists() {
            let content = std::fs::read_to_string(&path).map_err(|e| {
                EngineError::Store(format!("Failed to read node store {:?}: {}", path, e))
            })?;
            serde_json::from_str(&content).map_err(|e| {
                EngineError::Store(format!("Failed to parse node store {:?}: {}", path, e))
            })?
        } else {
            StoreDocument::default()
        };

        tracing::info!(path = ?path, "Opened node store");
        Ok(Self {
            path,
            doc: Mutex::new(doc),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Apply `f` to the document and write the result; memory is left
    /// untouched if the write fails
    fn mutate<T>(&self, f: impl FnOnce(&mut StoreDocument) -> Result<T>) -> Result<T> {
        let mut doc = self.doc.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next = doc.clone();
        let out = f(&mut next)?;
        self.write(&next)?;
        *doc = next;
        Ok(out)
    }

    fn write(&self, doc: &StoreDocument) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                EngineError::Store(format!("Failed to create store directory: {}", e))
            })?;
        }
        let content = serde_json::to_string_pretty(doc)
            .map_err(|e| EngineError::Store(format!("Failed to serialize node store: {}", e)))?;
        std::fs::write(&self.path, content).map_err(|e| {
            EngineError::Store(format!("Failed to write node store {:?}: {}", self.path, e))
        })
    }
}

impl NodeStore for FileNodeStore {
    fn list(&self) -> Result<Vec<Node>> {
        Ok(self
            .doc
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .nodes
            .clone())
    }

    fn create(&self, spec: &NodeSpec) -> Result<Node> {
        self.mutate(|doc| Ok(doc.create(spec)))
    }

    fn update(&self, id: u32, spec: &NodeSpec) -> Result<Node> {
        self.mutate(|doc| doc.update(id, spec))
    }

    fn delete(&self, id: u32) -> Result<()> {
        self.mutate(|doc| doc.delete(id))
    }
}
