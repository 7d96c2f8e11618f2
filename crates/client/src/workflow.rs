//! Workflow graph snapshot, structural hashing, and seed handling.
//!
//! The graph itself is opaque to this crate: a JSON mapping from node id to
//! `{class_type, inputs}`. The helpers here are the only places the core
//! inspects it: canonical hashing for affinity/failure bookkeeping, `-1`
//! seed auto-randomization, and input rewrites for uploaded attachments.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use rand::Rng as _;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest as _, Sha256};
use thiserror::Error;

/// Identifier of one node inside a workflow graph.
pub type NodeId = String;

/// Largest auto-generated seed value, exclusive (a non-negative 31-bit int).
pub const SEED_RANGE: i64 = 1 << 31;

/// Problems turning caller input into a workflow snapshot.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WorkflowError {
    /// The top-level JSON value was not an object.
    #[error("workflow must be a JSON object keyed by node id")]
    NotAnObject,
}

/// An immutable-by-convention snapshot of a workflow graph.
///
/// The pool clones the snapshot per attempt; mutating helpers exist for the
/// per-attempt copy only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Workflow {
    nodes: Map<String, Value>,
}

impl Workflow {
    /// Wrap a JSON object as a workflow graph.
    pub fn from_value(value: Value) -> Result<Self, WorkflowError> {
        match value {
            Value::Object(nodes) => Ok(Self { nodes }),
            _ => Err(WorkflowError::NotAnObject),
        }
    }

    /// The graph as a JSON value, as it would be submitted.
    pub fn to_value(&self) -> Value {
        Value::Object(self.nodes.clone())
    }

    /// Look up a node descriptor.
    pub fn node(&self, node_id: &str) -> Option<&Value> {
        self.nodes.get(node_id)
    }

    /// Whether the graph contains `node_id`.
    pub fn contains(&self, node_id: &str) -> bool {
        self.nodes.contains_key(node_id)
    }

    /// Iterate node ids in graph order.
    pub fn node_ids(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    /// `class_type` of a node, when present.
    pub fn class_type(&self, node_id: &str) -> Option<&str> {
        self.nodes.get(node_id)?.get("class_type")?.as_str()
    }

    /// Stable structural hash of the graph.
    ///
    /// The hash is the lowercase hex SHA-256 of the canonical serialization
    /// (object keys sorted recursively), so two graphs with the same semantic
    /// content hash identically regardless of key insertion order.
    pub fn structural_hash(&self) -> String {
        let mut canonical = String::new();
        write_canonical(&Value::Object(self.nodes.clone()), &mut canonical);
        let digest = Sha256::digest(canonical.as_bytes());
        let mut out = String::with_capacity(64);
        for byte in digest {
            let _ = write!(out, "{byte:02x}");
        }
        out
    }

    /// Replace every input named `seed` whose value is `-1` with a fresh
    /// random integer in `[0, 2^31)`.
    ///
    /// Returns the chosen value per node so it can be reported back in the
    /// completed result.
    pub fn randomize_seeds(&mut self) -> BTreeMap<NodeId, i64> {
        let mut rng = rand::rng();
        let mut chosen = BTreeMap::new();
        for (node_id, node) in self.nodes.iter_mut() {
            let Some(inputs) = node.get_mut("inputs").and_then(Value::as_object_mut) else {
                continue;
            };
            let Some(seed) = inputs.get_mut("seed") else {
                continue;
            };
            if seed.as_i64() == Some(-1) {
                let value = rng.random_range(0..SEED_RANGE);
                *seed = Value::from(value);
                chosen.insert(node_id.clone(), value);
            }
        }
        chosen
    }

    /// Overwrite one input of one node, e.g. with an uploaded filename.
    ///
    /// Returns `false` when the node does not exist or has no input map.
    pub fn set_input(&mut self, node_id: &str, input: &str, value: Value) -> bool {
        let Some(inputs) = self
            .nodes
            .get_mut(node_id)
            .and_then(|node| node.get_mut("inputs"))
            .and_then(Value::as_object_mut)
        else {
            return false;
        };
        inputs.insert(input.to_string(), value);
        true
    }

    /// Remove a node from the per-attempt copy (bypass rewiring).
    pub fn remove_node(&mut self, node_id: &str) -> Option<Value> {
        self.nodes.remove(node_id)
    }

    /// Mutable access for rewiring passes.
    pub fn nodes_mut(&mut self) -> &mut Map<String, Value> {
        &mut self.nodes
    }
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // serde_json string rendering is deterministic.
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

/// Which nodes a job collects outputs from, and under which names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputMap {
    /// Output node ids, in the order the caller declared them.
    pub node_ids: Vec<NodeId>,
    /// Optional user-visible alias per node id.
    pub aliases: BTreeMap<NodeId, String>,
}

impl OutputMap {
    /// Collect outputs from `node_ids`, each keyed by its own id.
    pub fn nodes<I, S>(node_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            node_ids: node_ids.into_iter().map(Into::into).collect(),
            aliases: BTreeMap::new(),
        }
    }

    /// Add an alias for one output node, registering the node if needed.
    pub fn alias(mut self, node_id: impl Into<String>, alias: impl Into<String>) -> Self {
        let node_id = node_id.into();
        if !self.node_ids.contains(&node_id) {
            self.node_ids.push(node_id.clone());
        }
        self.aliases.insert(node_id, alias.into());
        self
    }

    /// The user-visible key for a node: its alias, or the node id itself.
    pub fn key_for<'a>(&'a self, node_id: &'a str) -> &'a str {
        self.aliases.get(node_id).map(String::as_str).unwrap_or(node_id)
    }
}
