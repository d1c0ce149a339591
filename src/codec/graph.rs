// src/codec/graph.rs
//! Arena representation of an argument value graph
//!
//! Task arguments are not trees: tenant data may share sub-objects and may
//! contain cycles. `ValueGraph` stores every value as a node in an arena and
//! expresses structure through `NodeId` edges, so sharing is a matter of two
//! edges pointing at the same node and a cycle is an edge back to an
//! ancestor. Identity comparisons are `NodeId` comparisons.

use crate::utils::errors::{Result, RunnerError};
use serde_json::Value;

/// Key carrying the type tag of a typed object on the wire
pub const CLASS_KEY: &str = "___class";

/// Handle to a node in a [`ValueGraph`] arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

impl NodeId {
    pub(crate) fn index(self) -> usize {
        self.0
    }
}

/// One value in the graph.
///
/// `Object` keeps its fields as an ordered list so encoding is stable, and
/// never stores the type tag among them; the tag lives in `class`.
#[derive(Debug, Clone, PartialEq)]
pub enum GraphNode {
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    Array(Vec<NodeId>),
    Object {
        class: Option<String>,
        fields: Vec<(String, NodeId)>,
    },
}

impl GraphNode {
    /// Whether this node is a container (carries identity on the wire)
    pub fn is_container(&self) -> bool {
        matches!(self, GraphNode::Array(_) | GraphNode::Object { .. })
    }
}

/// Arena of graph nodes with a designated root
#[derive(Debug, Clone)]
pub struct ValueGraph {
    nodes: Vec<GraphNode>,
    root: NodeId,
}

impl Default for ValueGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl ValueGraph {
    /// Create a graph whose root is `null`
    pub fn new() -> Self {
        Self {
            nodes: vec![GraphNode::Null],
            root: NodeId(0),
        }
    }

    /// Add a node to the arena
    pub fn insert(&mut self, node: GraphNode) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(node);
        id
    }

    pub fn set_root(&mut self, id: NodeId) {
        self.root = id;
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn node(&self, id: NodeId) -> &GraphNode {
        &self.nodes[id.index()]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut GraphNode {
        &mut self.nodes[id.index()]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Look up a field on an object node
    pub fn object_field(&self, id: NodeId, key: &str) -> Option<NodeId> {
        match self.node(id) {
            GraphNode::Object { fields, .. } => fields
                .iter()
                .find(|(name, _)| name == key)
                .map(|(_, value)| *value),
            _ => None,
        }
    }

    /// Set a field on an object node, replacing it if present.
    ///
    /// Silently ignored on non-object nodes.
    pub fn set_object_field(&mut self, id: NodeId, key: &str, value: NodeId) {
        if let GraphNode::Object { fields, .. } = self.node_mut(id) {
            if let Some(slot) = fields.iter_mut().find(|(name, _)| name == key) {
                slot.1 = value;
            } else {
                fields.push((key.to_string(), value));
            }
        }
    }

    /// Items of an array node, empty for anything else
    pub fn array_items(&self, id: NodeId) -> &[NodeId] {
        match self.node(id) {
            GraphNode::Array(items) => items,
            _ => &[],
        }
    }

    /// Replace one item of an array node.
    ///
    /// Out-of-range indexes and non-array nodes are ignored.
    pub fn set_array_item(&mut self, id: NodeId, index: usize, value: NodeId) {
        if let GraphNode::Array(items) = self.node_mut(id) {
            if let Some(slot) = items.get_mut(index) {
                *slot = value;
            }
        }
    }

    /// Build a graph from a plain JSON value (no sharing, no references)
    pub fn from_value(value: &Value) -> Self {
        let mut graph = Self::new();
        let root = graph.insert_value(value);
        graph.set_root(root);
        graph
    }

    /// Insert a plain JSON value as a fresh subtree, returning its root.
    ///
    /// A `___class` member of an object becomes the node's class tag.
    pub fn insert_value(&mut self, value: &Value) -> NodeId {
        match value {
            Value::Null => self.insert(GraphNode::Null),
            Value::Bool(b) => self.insert(GraphNode::Bool(*b)),
            Value::Number(n) => self.insert(GraphNode::Number(n.clone())),
            Value::String(s) => self.insert(GraphNode::String(s.clone())),
            Value::Array(items) => {
                let ids: Vec<NodeId> = items.iter().map(|item| self.insert_value(item)).collect();
                self.insert(GraphNode::Array(ids))
            }
            Value::Object(map) => {
                let mut class = None;
                let mut fields = Vec::with_capacity(map.len());
                for (key, field_value) in map {
                    if key == CLASS_KEY {
                        class = field_value.as_str().map(str::to_string);
                        continue;
                    }
                    let field_id = self.insert_value(field_value);
                    fields.push((key.clone(), field_id));
                }
                self.insert(GraphNode::Object { class, fields })
            }
        }
    }

    /// Expand the whole graph into a plain JSON value
    pub fn to_value(&self) -> Result<Value> {
        self.value_of(self.root)
    }

    /// Expand the subtree under `id` into a plain JSON value.
    ///
    /// Shared subtrees are duplicated; a cycle cannot be expanded and is
    /// reported as a codec error.
    pub fn value_of(&self, id: NodeId) -> Result<Value> {
        let mut in_progress = Vec::new();
        self.expand(id, &mut in_progress)
    }

    fn expand(&self, id: NodeId, in_progress: &mut Vec<NodeId>) -> Result<Value> {
        if in_progress.contains(&id) {
            return Err(RunnerError::Codec(
                "cannot expand a cyclic value graph into a plain value".into(),
            ));
        }
        match self.node(id) {
            GraphNode::Null => Ok(Value::Null),
            GraphNode::Bool(b) => Ok(Value::Bool(*b)),
            GraphNode::Number(n) => Ok(Value::Number(n.clone())),
            GraphNode::String(s) => Ok(Value::String(s.clone())),
            GraphNode::Array(items) => {
                in_progress.push(id);
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.expand(*item, in_progress)?);
                }
                in_progress.pop();
                Ok(Value::Array(out))
            }
            GraphNode::Object { class, fields } => {
                in_progress.push(id);
                let mut map = serde_json::Map::with_capacity(fields.len() + 1);
                if let Some(class) = class {
                    map.insert(CLASS_KEY.to_string(), Value::String(class.clone()));
                }
                for (key, field_id) in fields {
                    map.insert(key.clone(), self.expand(*field_id, in_progress)?);
                }
                in_progress.pop();
                Ok(Value::Object(map))
            }
        }
    }
}
