// src/codec/mod.rs
//! Argument graph codec
//!
//! Task arguments cross the worker boundary as JSON text, but the values
//! tenants hand us are graphs: sub-objects may be shared and may form
//! cycles, and plain JSON cannot carry either. The codec flattens a
//! [`ValueGraph`] into reference-safe JSON and rebuilds it with identity
//! intact:
//!
//! - Every container (object or array) is numbered in the order it is first
//!   visited during encoding, starting from 0.
//! - A revisit emits `{"__ref": n}` instead of re-emitting the container.
//! - Decoding rebuilds containers in the same order, so a marker always
//!   points at an already-decoded node and resolution is a single pass.
//! - A literal field named `__ref` (or `__ref$`, `__ref$$`, ...) gains one
//!   `$` on the wire and loses it on decode, so genuine data can never be
//!   mistaken for a marker.
//!
//! ```text
//! {"item": {"name": "Foo"}, "again": {"__ref": 1}}
//! ```
//!
//! Objects tagged with `___class` are promoted against a registered type
//! template during decoding: template defaults are laid down first, decoded
//! fields overwrite them, and the tag itself is preserved.

pub mod graph;

pub use graph::{GraphNode, NodeId, ValueGraph, CLASS_KEY};

use crate::utils::errors::{Result, RunnerError};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Key of the wire-level reference marker
pub const REF_KEY: &str = "__ref";

/// Quoted form used for the fast-path probe
const REF_PROBE: &str = "\"__ref\"";

/// Type templates consulted when promoting `___class`-tagged objects.
///
/// A template is the ordered list of a type's declared fields with their
/// default values.
#[derive(Debug, Clone, Default)]
pub struct ClassMappings {
    templates: HashMap<String, Vec<(String, Value)>>,
}

impl ClassMappings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a type template under its class name
    pub fn insert(&mut self, name: impl Into<String>, defaults: Vec<(String, Value)>) {
        self.templates.insert(name.into(), defaults);
    }

    pub fn get(&self, name: &str) -> Option<&[(String, Value)]> {
        self.templates.get(name).map(Vec::as_slice)
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }
}

/// Encoder/decoder for task argument graphs
#[derive(Debug, Clone, Default)]
pub struct ArgumentCodec {
    mappings: ClassMappings,
}

impl ArgumentCodec {
    /// Codec without type promotion
    pub fn new() -> Self {
        Self::default()
    }

    /// Codec that promotes tagged objects against `mappings`
    pub fn with_mappings(mappings: ClassMappings) -> Self {
        Self { mappings }
    }

    /// Encode a graph into reference-safe JSON text
    pub fn encode(&self, graph: &ValueGraph) -> Result<String> {
        let mut ordinals: HashMap<NodeId, usize> = HashMap::new();
        let value = emit(graph, graph.root(), &mut ordinals);
        serde_json::to_string(&value).map_err(RunnerError::from)
    }

    /// Encode a graph into the byte form carried by task frames
    pub fn encode_bytes(&self, graph: &ValueGraph) -> Result<Vec<u8>> {
        self.encode(graph).map(String::into_bytes)
    }

    /// Decode JSON text into a graph, resolving reference markers and
    /// promoting tagged objects
    pub fn decode(&self, text: &str) -> Result<ValueGraph> {
        let value: Value = serde_json::from_str(text)?;
        let mut graph = ValueGraph::new();
        let root = if text.contains(REF_PROBE) {
            let mut table: Vec<NodeId> = Vec::new();
            self.build_tracked(&value, &mut graph, &mut table)?
        } else {
            // No markers anywhere in the text, skip ordinal tracking
            self.build_plain(&value, &mut graph)
        };
        graph.set_root(root);
        Ok(graph)
    }

    /// Decode the byte form carried by task frames
    pub fn decode_bytes(&self, bytes: &[u8]) -> Result<ValueGraph> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| RunnerError::Codec(format!("argument bytes are not valid utf-8: {}", e)))?;
        self.decode(text)
    }

    fn build_plain(&self, value: &Value, graph: &mut ValueGraph) -> NodeId {
        match value {
            Value::Null => graph.insert(GraphNode::Null),
            Value::Bool(b) => graph.insert(GraphNode::Bool(*b)),
            Value::Number(n) => graph.insert(GraphNode::Number(n.clone())),
            Value::String(s) => graph.insert(GraphNode::String(s.clone())),
            Value::Array(items) => {
                let ids = items
                    .iter()
                    .map(|item| self.build_plain(item, graph))
                    .collect();
                graph.insert(GraphNode::Array(ids))
            }
            Value::Object(map) => {
                let mut class = None;
                let mut fields = Vec::with_capacity(map.len());
                for (key, field_value) in map {
                    if key == CLASS_KEY {
                        class = field_value.as_str().map(str::to_string);
                        continue;
                    }
                    fields.push((unescape_key(key), self.build_plain(field_value, graph)));
                }
                if let Some(name) = class.clone() {
                    fields = self.promote(&name, fields, graph);
                }
                graph.insert(GraphNode::Object { class, fields })
            }
        }
    }

    fn build_tracked(
        &self,
        value: &Value,
        graph: &mut ValueGraph,
        table: &mut Vec<NodeId>,
    ) -> Result<NodeId> {
        match value {
            Value::Null => Ok(graph.insert(GraphNode::Null)),
            Value::Bool(b) => Ok(graph.insert(GraphNode::Bool(*b))),
            Value::Number(n) => Ok(graph.insert(GraphNode::Number(n.clone()))),
            Value::String(s) => Ok(graph.insert(GraphNode::String(s.clone()))),
            Value::Array(items) => {
                // Reserve the node before the children so a marker inside
                // the subtree can point back at it
                let id = graph.insert(GraphNode::Null);
                table.push(id);
                let ids = items
                    .iter()
                    .map(|item| self.build_tracked(item, graph, table))
                    .collect::<Result<Vec<_>>>()?;
                *graph.node_mut(id) = GraphNode::Array(ids);
                Ok(id)
            }
            Value::Object(map) => {
                if let Some(ordinal) = ref_marker(map)? {
                    return table.get(ordinal).copied().ok_or_else(|| {
                        RunnerError::Codec(format!("unresolved reference marker: {}", ordinal))
                    });
                }
                let id = graph.insert(GraphNode::Null);
                table.push(id);
                let mut class = None;
                let mut fields = Vec::with_capacity(map.len());
                for (key, field_value) in map {
                    if key == CLASS_KEY {
                        class = field_value.as_str().map(str::to_string);
                        continue;
                    }
                    fields.push((unescape_key(key), self.build_tracked(field_value, graph, table)?));
                }
                if let Some(name) = class.clone() {
                    fields = self.promote(&name, fields, graph);
                }
                *graph.node_mut(id) = GraphNode::Object { class, fields };
                Ok(id)
            }
        }
    }

    /// Merge decoded fields over a registered type template.
    ///
    /// Decoded values always win, even explicit nulls; template fields the
    /// wire did not mention keep their defaults.
    fn promote(
        &self,
        class: &str,
        fields: Vec<(String, NodeId)>,
        graph: &mut ValueGraph,
    ) -> Vec<(String, NodeId)> {
        let Some(template) = self.mappings.get(class) else {
            return fields;
        };
        let mut merged: Vec<(String, NodeId)> = template
            .iter()
            .map(|(name, default)| (name.clone(), graph.insert_value(default)))
            .collect();
        for (name, id) in fields {
            if let Some(slot) = merged.iter_mut().find(|(slot_name, _)| *slot_name == name) {
                slot.1 = id;
            } else {
                merged.push((name, id));
            }
        }
        merged
    }
}

/// Whether a literal field name would read as (or unescape into) the
/// reference marker key
fn is_reserved_key(key: &str) -> bool {
    key.strip_prefix(REF_KEY)
        .map(|rest| rest.bytes().all(|b| b == b'$'))
        .unwrap_or(false)
}

fn escape_key(key: &str) -> String {
    if is_reserved_key(key) {
        format!("{}$", key)
    } else {
        key.to_string()
    }
}

fn unescape_key(key: &str) -> String {
    match key.strip_prefix(REF_KEY) {
        Some(rest) if !rest.is_empty() && rest.bytes().all(|b| b == b'$') => {
            key[..key.len() - 1].to_string()
        }
        _ => key.to_string(),
    }
}

/// Interpret an object as a reference marker if its sole member is `__ref`
fn ref_marker(map: &Map<String, Value>) -> Result<Option<usize>> {
    if map.len() != 1 {
        return Ok(None);
    }
    let Some(value) = map.get(REF_KEY) else {
        return Ok(None);
    };
    let ordinal = value.as_u64().ok_or_else(|| {
        RunnerError::Codec(format!(
            "reference marker must be a non-negative integer, got {}",
            value
        ))
    })?;
    Ok(Some(ordinal as usize))
}

fn marker(ordinal: usize) -> Value {
    let mut map = Map::with_capacity(1);
    map.insert(REF_KEY.to_string(), Value::from(ordinal));
    Value::Object(map)
}

fn emit(graph: &ValueGraph, id: NodeId, ordinals: &mut HashMap<NodeId, usize>) -> Value {
    match graph.node(id) {
        GraphNode::Null => Value::Null,
        GraphNode::Bool(b) => Value::Bool(*b),
        GraphNode::Number(n) => Value::Number(n.clone()),
        GraphNode::String(s) => Value::String(s.clone()),
        GraphNode::Array(items) => {
            if let Some(&ordinal) = ordinals.get(&id) {
                return marker(ordinal);
            }
            let next = ordinals.len();
            ordinals.insert(id, next);
            Value::Array(items.iter().map(|item| emit(graph, *item, ordinals)).collect())
        }
        GraphNode::Object { class, fields } => {
            if let Some(&ordinal) = ordinals.get(&id) {
                return marker(ordinal);
            }
            let next = ordinals.len();
            ordinals.insert(id, next);
            let mut map = Map::with_capacity(fields.len() + 1);
            if let Some(class) = class {
                map.insert(CLASS_KEY.to_string(), Value::String(class.clone()));
            }
            for (key, field_id) in fields {
                map.insert(escape_key(key), emit(graph, *field_id, ordinals));
            }
            Value::Object(map)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_flat_round_trip() {
        let codec = ArgumentCodec::new();
        let graph = ValueGraph::from_value(&json!([{"name": "Foo", "count": 3}, null, true]));
        let wire = codec.encode(&graph).unwrap();
        assert!(!wire.contains(REF_KEY));
        let decoded = codec.decode(&wire).unwrap();
        assert_eq!(decoded.to_value().unwrap(), graph.to_value().unwrap());
    }

    #[test]
    fn test_marker_wire_format() {
        let mut graph = ValueGraph::new();
        let item = graph.insert_value(&json!({"id": 1}));
        let root = graph.insert(GraphNode::Object {
            class: None,
            fields: vec![("a".into(), item), ("b".into(), item)],
        });
        graph.set_root(root);

        let wire = ArgumentCodec::new().encode(&graph).unwrap();
        assert_eq!(wire, r#"{"a":{"id":1},"b":{"__ref":1}}"#);
    }

    #[test]
    fn test_shared_reference_identity() {
        let codec = ArgumentCodec::new();
        let mut graph = ValueGraph::new();
        let shared = graph.insert_value(&json!({"name": "Foo"}));
        let root = graph.insert(GraphNode::Object {
            class: None,
            fields: vec![("first".into(), shared), ("second".into(), shared)],
        });
        graph.set_root(root);

        let decoded = codec.decode(&codec.encode(&graph).unwrap()).unwrap();
        let first = decoded.object_field(decoded.root(), "first").unwrap();
        let second = decoded.object_field(decoded.root(), "second").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_cycle_round_trip() {
        let codec = ArgumentCodec::new();
        let mut graph = ValueGraph::new();
        let root = graph.insert(GraphNode::Object {
            class: None,
            fields: Vec::new(),
        });
        let child = graph.insert(GraphNode::Object {
            class: None,
            fields: vec![("parent".into(), root)],
        });
        graph.set_object_field(root, "child", child);
        graph.set_root(root);

        let wire = codec.encode(&graph).unwrap();
        assert!(wire.contains(REF_KEY));

        let decoded = codec.decode(&wire).unwrap();
        let decoded_child = decoded.object_field(decoded.root(), "child").unwrap();
        let back = decoded.object_field(decoded_child, "parent").unwrap();
        assert_eq!(back, decoded.root());
    }

    #[test]
    fn test_literal_ref_key_is_data_not_marker() {
        let codec = ArgumentCodec::new();
        let graph = ValueGraph::from_value(&json!({"__ref": 7}));

        let wire = codec.encode(&graph).unwrap();
        assert_eq!(wire, r#"{"__ref$":7}"#);

        let decoded = codec.decode(&wire).unwrap();
        assert_eq!(decoded.to_value().unwrap(), json!({"__ref": 7}));
    }

    #[test]
    fn test_escaped_key_layers_round_trip() {
        let codec = ArgumentCodec::new();
        let original = json!({"__ref$": "a", "__ref$$": "b"});
        let graph = ValueGraph::from_value(&original);
        let decoded = codec.decode(&codec.encode(&graph).unwrap()).unwrap();
        assert_eq!(decoded.to_value().unwrap(), original);
    }

    #[test]
    fn test_literal_ref_key_coexists_with_markers() {
        let codec = ArgumentCodec::new();
        let mut graph = ValueGraph::new();
        let shared = graph.insert_value(&json!({"__ref": 3}));
        let root = graph.insert(GraphNode::Object {
            class: None,
            fields: vec![("first".into(), shared), ("second".into(), shared)],
        });
        graph.set_root(root);

        let decoded = codec.decode(&codec.encode(&graph).unwrap()).unwrap();
        let first = decoded.object_field(decoded.root(), "first").unwrap();
        let second = decoded.object_field(decoded.root(), "second").unwrap();
        assert_eq!(first, second);
        assert_eq!(decoded.value_of(first).unwrap(), json!({"__ref": 3}));
    }

    #[test]
    fn test_unresolved_marker_rejected() {
        let codec = ArgumentCodec::new();
        let err = codec.decode(r#"{"later":{"__ref":5}}"#).unwrap_err();
        assert!(err.to_string().contains("unresolved reference marker"));
    }

    #[test]
    fn test_scalars_are_not_tracked() {
        let codec = ArgumentCodec::new();
        let decoded = codec.decode("[1,1]").unwrap();
        let items = decoded.array_items(decoded.root()).to_vec();
        assert_eq!(items.len(), 2);
        // Equal values, distinct nodes
        assert_ne!(items[0], items[1]);
    }

    #[test]
    fn test_class_promotion_merges_template() {
        let mut mappings = ClassMappings::new();
        mappings.insert(
            "Order",
            vec![
                ("status".to_string(), json!("new")),
                ("name".to_string(), Value::Null),
            ],
        );
        let codec = ArgumentCodec::with_mappings(mappings);

        let decoded = codec
            .decode(r#"{"___class":"Order","name":"Foo"}"#)
            .unwrap();
        assert_eq!(
            decoded.to_value().unwrap(),
            json!({"___class": "Order", "status": "new", "name": "Foo"})
        );
    }

    #[test]
    fn test_promotion_preserves_identity_under_sharing() {
        let mut mappings = ClassMappings::new();
        mappings.insert("Order", vec![("status".to_string(), json!("new"))]);
        let codec = ArgumentCodec::with_mappings(mappings);

        let decoded = codec
            .decode(r#"{"a":{"___class":"Order","name":"Foo"},"b":{"__ref":1}}"#)
            .unwrap();
        let a = decoded.object_field(decoded.root(), "a").unwrap();
        let b = decoded.object_field(decoded.root(), "b").unwrap();
        assert_eq!(a, b);
        assert!(decoded.object_field(a, "status").is_some());
    }

    #[test]
    fn test_explicit_null_beats_default() {
        let mut mappings = ClassMappings::new();
        mappings.insert("Order", vec![("status".to_string(), json!("new"))]);
        let codec = ArgumentCodec::with_mappings(mappings);

        let decoded = codec
            .decode(r#"{"___class":"Order","status":null}"#)
            .unwrap();
        assert_eq!(
            decoded.to_value().unwrap(),
            json!({"___class": "Order", "status": null})
        );
    }

    /// Build a graph with heavy sharing and one cycle from a seed list.
    ///
    /// Every node ends up in a root array, so each one is reachable and most
    /// containers are referenced more than once.
    fn seeded_graph(seeds: &[u32]) -> ValueGraph {
        let mut graph = ValueGraph::new();
        let mut ids: Vec<NodeId> = Vec::new();
        for (i, seed) in seeds.iter().enumerate() {
            let node = match seed % 5 {
                0 => GraphNode::Null,
                1 => GraphNode::Bool(seed % 2 == 0),
                2 => GraphNode::Number(serde_json::Number::from(*seed as i64)),
                3 => GraphNode::String(format!("s{}", seed)),
                _ => {
                    let mut children = Vec::new();
                    if i > 0 {
                        for k in 0..(seed % 4) as usize {
                            let pick =
                                ((*seed as usize).wrapping_mul(31).wrapping_add(k)) % i;
                            children.push(ids[pick]);
                        }
                    }
                    if seed % 2 == 0 {
                        GraphNode::Array(children)
                    } else {
                        GraphNode::Object {
                            class: None,
                            fields: children
                                .into_iter()
                                .enumerate()
                                .map(|(n, child)| (format!("f{}", n), child))
                                .collect(),
                        }
                    }
                }
            };
            ids.push(graph.insert(node));
        }
        let root = graph.insert(GraphNode::Array(ids.clone()));
        if let Some(obj) = ids
            .iter()
            .copied()
            .find(|id| matches!(graph.node(*id), GraphNode::Object { .. }))
        {
            graph.set_object_field(obj, "back", root);
        }
        graph.set_root(root);
        graph
    }

    proptest! {
        // Decoding rebuilds the exact sharing topology: if it duplicated or
        // conflated any node the second encoding would differ.
        #[test]
        fn prop_double_encode_is_stable(seeds in proptest::collection::vec(any::<u32>(), 1..40)) {
            let codec = ArgumentCodec::new();
            let graph = seeded_graph(&seeds);
            let wire = codec.encode(&graph).unwrap();
            let decoded = codec.decode(&wire).unwrap();
            prop_assert_eq!(codec.encode(&decoded).unwrap(), wire);
        }
    }
}
