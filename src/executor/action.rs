// src/executor/action.rs
//! Action invocation: the fixed set of control actions
//!
//! Actions are engine directives, not tenant code. They are dispatched by
//! action type and each has its own argument contract.

use crate::codec::{ArgumentCodec, ValueGraph};
use crate::executor::result::{ExceptionInfo, TaskResult};
use crate::model::ServerCodeModel;
use serde_json::{json, Value};
use std::sync::Arc;

/// Known control actions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Orderly worker shutdown after the result is reported
    Shutdown,
    /// Build the deployment's model and report its catalog
    AnalyseCode,
}

impl Action {
    pub fn parse(action_type: &str) -> Option<Self> {
        match action_type {
            "SHUTDOWN" => Some(Action::Shutdown),
            "ANALYSE_CODE" => Some(Action::AnalyseCode),
            _ => None,
        }
    }
}

/// Result payload of the ANALYSE_CODE action: the model catalog with its
/// per-file load errors, wrapped as a single-element array
pub(crate) fn analyse(model: &Arc<ServerCodeModel>) -> TaskResult {
    let summary = model.summary();
    let load_errors: Vec<Value> = model
        .load_errors()
        .iter()
        .map(|error| json!({"file": error.file, "message": error.message}))
        .collect();
    let report = json!([{
        "applicationId": summary.app_id,
        "handlers": summary.handlers,
        "timers": summary.timers,
        "types": summary.types,
        "services": summary.services,
        "loadErrors": load_errors,
    }]);

    let graph = ValueGraph::from_value(&report);
    match ArgumentCodec::new().encode_bytes(&graph) {
        Ok(bytes) => TaskResult::success(bytes),
        Err(error) => TaskResult::failure(ExceptionInfo::new(error.to_string())),
    }
}
