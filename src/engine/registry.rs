//! Node registry and configuration diffing
//!
//! The [`Registry`] is the authoritative table of registered nodes. Changes
//! arrive as a full desired node list; [`Registry::plan`] validates the list
//! and turns it into an ordered set of [`NodeOp`]s without touching any
//! state. Only a plan that validated completely is ever applied.
//!
//! # Identity matching
//!
//! - A desired spec carrying an `id` targets that registry node; an unknown
//!   id rejects the batch.
//! - A spec without `id` targets the registry node with the same `node_id`.
//! - Unmatched specs become [`NodeOp::Add`]; registry nodes no spec targets
//!   become [`NodeOp::Remove`]; identical matches produce nothing.
//!
//! Ops are ordered removes, then updates, then adds, so a `node_id` or bus
//! reservation freed in a batch can be reused by the same batch.

use super::scaling::validate_scaling;
use crate::error::{ConfigIssue, EngineError, Result};
use crate::source::SourceSpec;
use crate::types::{Node, NodeSpec};
use std::collections::{HashMap, HashSet};

/// A desired node that passed validation
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedSpec {
    pub spec: NodeSpec,
    pub source: SourceSpec,
}

/// One step of a reconciliation plan
#[derive(Debug, Clone, PartialEq)]
pub enum NodeOp {
    Remove(Node),
    Update { old: Node, new: ValidatedSpec },
    Add(ValidatedSpec),
}

impl NodeOp {
    pub fn label(&self) -> &str {
        match self {
            NodeOp::Remove(node) => &node.display_name,
            NodeOp::Update { new, .. } | NodeOp::Add(new) => new.spec.label(),
        }
    }
}

/// Counts of the operations an apply performed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct ApplySummary {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
    /// Desired nodes identical to their registry entry
    pub unchanged: usize,
}

impl ApplySummary {
    pub fn is_noop(&self) -> bool {
        self.added + self.updated + self.removed == 0
    }
}

impl std::fmt::Display for ApplySummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} added, {} updated, {} removed, {} unchanged",
            self.added, self.updated, self.removed, self.unchanged
        )
    }
}

/// Validate a single node definition in isolation
pub fn validate_spec(spec: &NodeSpec, min_interval_ms: u64) -> Result<SourceSpec> {
    if spec.display_name.trim().is_empty() {
        return Err(EngineError::Config("display_name must not be empty".into()));
    }
    if spec.node_id.trim().is_empty() {
        return Err(EngineError::Config("node_id must not be empty".into()));
    }
    if spec.update_interval_ms == 0 || spec.update_interval_ms < min_interval_ms {
        return Err(EngineError::Config(format!(
            "update_interval_ms must be at least {} ms, got {}",
            min_interval_ms.max(1),
            spec.update_interval_ms
        )));
    }
    if let Some(scaling) = &spec.scaling {
        validate_scaling(scaling)?;
    }
    if let Some(initial) = spec.initial_value {
        if !initial.is_finite() {
            return Err(EngineError::Config("initial_value must be finite".into()));
        }
    }
    SourceSpec::parse(spec.source_type, &spec.source_config, spec.initial_value)
}

/// Authoritative table of registered nodes, in registration order
#[derive(Debug, Default)]
pub struct Registry {
    nodes: Vec<Node>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, id: u32) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn get_by_node_id(&self, node_id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.node_id == node_id)
    }

    /// Desired-list form of the current registry
    pub fn specs(&self) -> Vec<NodeSpec> {
        self.nodes.iter().map(Node::to_spec).collect()
    }

    /// Register a node at the end of the table
    pub fn insert(&mut self, node: Node) {
        match self.nodes.iter_mut().find(|n| n.id == node.id) {
            Some(existing) => *existing = node,
            None => self.nodes.push(node),
        }
    }

    /// Replace a node in place, keeping its position
    pub fn replace(&mut self, node: Node) -> Option<Node> {
        self.nodes
            .iter_mut()
            .find(|n| n.id == node.id)
            .map(|existing| std::mem::replace(existing, node))
    }

    pub fn remove(&mut self, id: u32) -> Option<Node> {
        let index = self.nodes.iter().position(|n| n.id == id)?;
        Some(self.nodes.remove(index))
    }

    /// Validate a desired node list and compute the ops that realize it
    ///
    /// Every problem in the batch is reported; a single problem is returned
    /// as its own error with the node name as context, several as
    /// [`EngineError::ConfigRejected`].
    pub fn plan(&self, desired: &[NodeSpec], min_interval_ms: u64) -> Result<(Vec<NodeOp>, ApplySummary)> {
        let mut failures: Vec<(String, EngineError)> = Vec::new();
        let mut validated = Vec::with_capacity(desired.len());

        let mut seen_ids = HashSet::new();
        let mut seen_node_ids = HashSet::new();
        let mut seen_names = HashSet::new();
        for spec in desired {
            let label = spec.label().to_string();
            if let Some(id) = spec.id {
                if self.get(id).is_none() {
                    failures.push((label.clone(), EngineError::UnknownNode(id)));
                } else if !seen_ids.insert(id) {
                    failures.push((label.clone(), EngineError::Config(format!("id {} listed twice", id))));
                }
            }
            if !seen_node_ids.insert(spec.node_id.as_str()) {
                failures.push((
                    label.clone(),
                    EngineError::Config(format!("duplicate node_id '{}'", spec.node_id)),
                ));
            }
            if !seen_names.insert(spec.display_name.as_str()) {
                failures.push((
                    label.clone(),
                    EngineError::Config(format!("duplicate display_name '{}'", spec.display_name)),
                ));
            }
            match validate_spec(spec, min_interval_ms) {
                Ok(source) => validated.push(ValidatedSpec {
                    spec: spec.clone(),
                    source,
                }),
                Err(e) => failures.push((label, e)),
            }
        }

        if !failures.is_empty() {
            return Err(collect_failures(failures));
        }

        // Identity matching
        let by_node_id: HashMap<&str, u32> = self
            .nodes
            .iter()
            .map(|n| (n.node_id.as_str(), n.id))
            .collect();
        let claimed_ids: HashSet<u32> = validated.iter().filter_map(|v| v.spec.id).collect();

        let mut matched = HashSet::new();
        let mut updates = Vec::new();
        let mut adds = Vec::new();
        let mut summary = ApplySummary::default();

        for mut v in validated {
            let target = v.spec.id.or_else(|| {
                by_node_id
                    .get(v.spec.node_id.as_str())
                    .copied()
                    .filter(|id| !claimed_ids.contains(id))
            });

            match target.and_then(|id| self.get(id)) {
                Some(old) => {
                    matched.insert(old.id);
                    v.spec.id = Some(old.id);
                    if old.to_spec() == v.spec {
                        summary.unchanged += 1;
                    } else {
                        updates.push(NodeOp::Update {
                            old: old.clone(),
                            new: v,
                        });
                    }
                }
                None => adds.push(NodeOp::Add(v)),
            }
        }

        let mut ops: Vec<NodeOp> = self
            .nodes
            .iter()
            .filter(|n| !matched.contains(&n.id))
            .cloned()
            .map(NodeOp::Remove)
            .collect();
        summary.removed = ops.len();
        summary.updated = updates.len();
        summary.added = adds.len();
        ops.extend(updates);
        ops.extend(adds);

        Ok((ops, summary))
    }
}

fn collect_failures(mut failures: Vec<(String, EngineError)>) -> EngineError {
    if failures.len() == 1 {
        if let Some((label, err)) = failures.pop() {
            return err.with_context(format!("node '{}'", label));
        }
    }
    EngineError::ConfigRejected {
        issues: failures
            .into_iter()
            .map(|(label, err)| ConfigIssue::new(label, err.to_string()))
            .collect(),
    }
}
