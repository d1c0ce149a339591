// src/model/handler.rs
//! Handler entries and the invocation context they run against

use crate::codec::{GraphNode, NodeId, ValueGraph};
use crate::model::events::{EventDescriptor, EventProvider};
use crate::model::timer::TimerSpec;
use crate::utils::errors::{Result, RunnerError};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Target used when an event does not distinguish registrations
pub const ANY_TARGET: &str = "*";

/// Key a handler registration is stored and looked up under
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HandlerKey {
    pub event_id: u16,
    pub target: String,
}

impl HandlerKey {
    pub fn new(event_id: u16, target: impl Into<String>) -> Self {
        Self {
            event_id,
            target: target.into(),
        }
    }

    /// Derive the lookup key for a registration.
    ///
    /// Untargeted events always key under [`ANY_TARGET`]. Timer targets may
    /// arrive as a JSON timer descriptor, in which case the timer is
    /// identified by the descriptor's `name` alone.
    pub fn derive(event: &EventDescriptor, raw_target: Option<&str>) -> Result<Self> {
        let target = match raw_target {
            _ if !event.targeted() => ANY_TARGET.to_string(),
            None => ANY_TARGET.to_string(),
            Some(raw) => normalize_target(event, raw)?,
        };
        Ok(Self::new(event.id, target))
    }
}

impl fmt::Display for HandlerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.event_id, self.target)
    }
}

fn normalize_target(event: &EventDescriptor, raw: &str) -> Result<String> {
    if event.provider == EventProvider::Timer && raw.trim_start().starts_with('{') {
        let descriptor: Value = serde_json::from_str(raw).map_err(|e| {
            RunnerError::InvalidRegistration(format!("timer target is not a valid descriptor: {}", e))
        })?;
        return descriptor
            .get("name")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                RunnerError::InvalidRegistration("timer descriptor has no name".into())
            });
    }
    Ok(raw.to_string())
}

/// What a handler body produces: `None` leaves normal event flow alone, a
/// value short-circuits it
pub type HandlerOutcome = anyhow::Result<Option<Value>>;

/// A registered handler body
pub type HandlerFn = Arc<dyn Fn(&mut EventContext) -> HandlerOutcome + Send + Sync>;

/// One registered handler
#[derive(Clone)]
pub struct HandlerEntry {
    pub key: HandlerKey,

    /// Fire-and-forget: the caller gets no arguments back
    pub fire_and_forget: bool,

    /// Present when this entry was registered as a timer
    pub timer: Option<TimerSpec>,

    /// Tenant file the registration came from
    pub source_file: String,

    pub invoke: HandlerFn,
}

impl fmt::Debug for HandlerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerEntry")
            .field("key", &self.key)
            .field("fire_and_forget", &self.fire_and_forget)
            .field("timer", &self.timer)
            .field("source_file", &self.source_file)
            .finish()
    }
}

/// Mutable view of a method invocation's argument array.
///
/// The decoded argument graph is owned here so the whole context can move
/// onto the invocation thread; the executor takes the graph back afterwards
/// to re-encode whatever the handler changed. Named access goes through the
/// event's declared argument names, `context` first.
pub struct EventContext {
    graph: ValueGraph,
    args: NodeId,
    names: &'static [&'static str],
}

impl EventContext {
    /// Wrap a decoded argument graph.
    ///
    /// A non-array root is wrapped into a single-element array and missing
    /// trailing slots are padded with nulls so every declared name resolves.
    pub fn new(mut graph: ValueGraph, names: &'static [&'static str]) -> Self {
        let root = graph.root();
        let args = match graph.node(root) {
            GraphNode::Array(_) => root,
            _ => {
                let wrapped = graph.insert(GraphNode::Array(vec![root]));
                graph.set_root(wrapped);
                wrapped
            }
        };
        while graph.array_items(args).len() < names.len() {
            let null = graph.insert(GraphNode::Null);
            if let GraphNode::Array(items) = graph.node_mut(args) {
                items.push(null);
            }
        }
        Self { graph, args, names }
    }

    pub fn graph(&self) -> &ValueGraph {
        &self.graph
    }

    pub fn graph_mut(&mut self) -> &mut ValueGraph {
        &mut self.graph
    }

    /// Node of the argument array itself
    pub fn args_node(&self) -> NodeId {
        self.args
    }

    /// Node of a named argument slot
    pub fn arg(&self, name: &str) -> Option<NodeId> {
        let position = self.names.iter().position(|n| *n == name)?;
        self.graph.array_items(self.args).get(position).copied()
    }

    /// Expand a named argument into a plain value
    pub fn read(&self, name: &str) -> Result<Value> {
        let id = self
            .arg(name)
            .ok_or_else(|| RunnerError::Codec(format!("no such argument: {}", name)))?;
        self.graph.value_of(id)
    }

    /// Expand one field of a named object argument
    pub fn read_field(&self, name: &str, key: &str) -> Result<Option<Value>> {
        let id = self
            .arg(name)
            .ok_or_else(|| RunnerError::Codec(format!("no such argument: {}", name)))?;
        match self.graph.object_field(id, key) {
            Some(field) => self.graph.value_of(field).map(Some),
            None => Ok(None),
        }
    }

    /// Replace a named argument wholesale
    pub fn write(&mut self, name: &str, value: &Value) -> Result<()> {
        let position = self
            .names
            .iter()
            .position(|n| *n == name)
            .ok_or_else(|| RunnerError::Codec(format!("no such argument: {}", name)))?;
        let id = self.graph.insert_value(value);
        self.graph.set_array_item(self.args, position, id);
        Ok(())
    }

    /// Set one field of a named object argument
    pub fn write_field(&mut self, name: &str, key: &str, value: &Value) -> Result<()> {
        let id = self
            .arg(name)
            .ok_or_else(|| RunnerError::Codec(format!("no such argument: {}", name)))?;
        if !matches!(self.graph.node(id), GraphNode::Object { .. }) {
            return Err(RunnerError::Codec(format!(
                "argument {} is not an object",
                name
            )));
        }
        let field = self.graph.insert_value(value);
        self.graph.set_object_field(id, key, field);
        Ok(())
    }

    /// Attach a short-circuit result to the context argument.
    ///
    /// A null context slot is replaced with an empty object first.
    pub fn set_premature_result(&mut self, value: &Value) -> Result<()> {
        let context = self
            .arg("context")
            .ok_or_else(|| RunnerError::Codec("event has no context argument".into()))?;
        let target = if matches!(self.graph.node(context), GraphNode::Object { .. }) {
            context
        } else {
            let fresh = self.graph.insert(GraphNode::Object {
                class: None,
                fields: Vec::new(),
            });
            self.graph.set_array_item(self.args, 0, fresh);
            fresh
        };
        let result = self.graph.insert_value(value);
        self.graph.set_object_field(target, "prematureResult", result);
        Ok(())
    }

    /// Hand the (possibly mutated) graph back for re-encoding
    pub fn into_graph(self) -> ValueGraph {
        self.graph
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::events::event_by_name;
    use serde_json::json;

    #[test]
    fn test_untargeted_event_keys_under_any() {
        let event = event_by_name("beforeLogin").unwrap();
        let key = HandlerKey::derive(event, Some("ignored")).unwrap();
        assert_eq!(key.target, ANY_TARGET);
    }

    #[test]
    fn test_timer_descriptor_normalizes_to_name() {
        let event = event_by_name("execute").unwrap();
        let key = HandlerKey::derive(
            event,
            Some(r#"{"name":"nightly","schedule":"once","startDate":123}"#),
        )
        .unwrap();
        assert_eq!(key.target, "nightly");

        let plain = HandlerKey::derive(event, Some("nightly")).unwrap();
        assert_eq!(plain, key);
    }

    #[test]
    fn test_timer_descriptor_without_name_rejected() {
        let event = event_by_name("execute").unwrap();
        assert!(HandlerKey::derive(event, Some(r#"{"schedule":"once"}"#)).is_err());
    }

    #[test]
    fn test_context_read_write() {
        let event = event_by_name("beforeCreate").unwrap();
        let graph = ValueGraph::from_value(&json!([{"appId": "a"}, {"name": "Foo"}]));
        let mut ctx = EventContext::new(graph, event.args);

        assert_eq!(
            ctx.read_field("item", "name").unwrap(),
            Some(json!("Foo"))
        );
        ctx.write_field("item", "name", &json!("Foo Bar")).unwrap();
        assert_eq!(ctx.read("item").unwrap(), json!({"name": "Foo Bar"}));
    }

    #[test]
    fn test_missing_slots_are_padded() {
        let event = event_by_name("afterCreate").unwrap();
        let graph = ValueGraph::from_value(&json!([{"appId": "a"}]));
        let ctx = EventContext::new(graph, event.args);
        assert_eq!(ctx.read("item").unwrap(), json!(null));
        assert_eq!(ctx.read("result").unwrap(), json!(null));
    }

    #[test]
    fn test_premature_result_lands_in_context() {
        let event = event_by_name("beforeCreate").unwrap();
        let graph = ValueGraph::from_value(&json!([{"appId": "a"}, {"name": "Foo"}]));
        let mut ctx = EventContext::new(graph, event.args);
        ctx.set_premature_result(&json!({"foo": "bar"})).unwrap();
        assert_eq!(
            ctx.read_field("context", "prematureResult").unwrap(),
            Some(json!({"foo": "bar"}))
        );
    }
}
