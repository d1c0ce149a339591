// src/executor/task.rs
//! Task wire schema
//!
//! Tasks cross two boundaries in the same shape: queue to dispatcher and
//! broker to worker. The `kind` discriminator selects the executor path;
//! the argument payload is a byte-encoded JSON document in the codec's
//! reference-safe form.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// A unit of work addressed at one tenant deployment
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,

    pub application_id: String,

    /// Code location under the tenant's repository root
    #[serde(default)]
    pub relative_path: String,

    /// Per-task timeout in milliseconds
    #[serde(rename = "timeout", default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    /// Whether the worker may be retained for this tenant afterwards
    #[serde(default)]
    pub cacheable: bool,

    /// Byte-encoded JSON argument document
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arguments: Vec<u8>,

    #[serde(flatten)]
    pub kind: TaskKind,
}

/// The three task kinds routed by the executor
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind")]
pub enum TaskKind {
    #[serde(rename = "METHOD_INVOCATION", rename_all = "camelCase")]
    MethodInvocation {
        event_id: u16,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
    },

    #[serde(rename = "ACTION_INVOCATION", rename_all = "camelCase")]
    ActionInvocation { action_type: String },

    #[serde(rename = "SERVICE_INVOCATION", rename_all = "camelCase")]
    ServiceInvocation {
        service_id: String,
        method: String,
        #[serde(default)]
        invocation_context: Value,
    },
}

impl Task {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    pub fn from_slice(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_method_invocation_wire_shape() {
        let wire = json!({
            "id": "t-1",
            "applicationId": "app",
            "relativePath": "v1",
            "timeout": 5000,
            "cacheable": true,
            "arguments": [91, 93],
            "kind": "METHOD_INVOCATION",
            "eventId": 1,
            "target": "Order"
        });
        let task: Task = serde_json::from_value(wire).unwrap();
        assert_eq!(task.timeout(), Some(Duration::from_millis(5000)));
        assert_eq!(task.arguments, b"[]");
        match &task.kind {
            TaskKind::MethodInvocation { event_id, target } => {
                assert_eq!(*event_id, 1);
                assert_eq!(target.as_deref(), Some("Order"));
            }
            other => panic!("wrong kind: {:?}", other),
        }
    }

    #[test]
    fn test_service_invocation_round_trip() {
        let task = Task {
            id: "t-2".into(),
            application_id: "app".into(),
            relative_path: String::new(),
            timeout_ms: None,
            cacheable: false,
            arguments: b"[1]".to_vec(),
            kind: TaskKind::ServiceInvocation {
                service_id: "OrderService".into(),
                method: "place".into(),
                invocation_context: json!({"userId": "u-1"}),
            },
        };
        let text = task.to_json().unwrap();
        assert!(text.contains("\"kind\":\"SERVICE_INVOCATION\""));
        let back = Task::from_slice(text.as_bytes()).unwrap();
        assert_eq!(back, task);
    }

    #[test]
    fn test_missing_optional_fields_default() {
        let wire = json!({
            "id": "t-3",
            "applicationId": "app",
            "kind": "ACTION_INVOCATION",
            "actionType": "SHUTDOWN"
        });
        let task: Task = serde_json::from_value(wire).unwrap();
        assert!(task.timeout().is_none());
        assert!(!task.cacheable);
        assert!(task.arguments.is_empty());
    }
}
