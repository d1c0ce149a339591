// src/executor/method.rs
//! Method invocation: event handler dispatch
//!
//! The task's event id and target select a handler entry; the decoded
//! argument array is mapped onto the event's declared names and handed to
//! the handler as a mutable context. A non-`None` return short-circuits the
//! event: it lands in the context as `prematureResult` and tells the caller
//! to skip the paired after-handler.

use crate::codec::{ArgumentCodec, GraphNode, ValueGraph};
use crate::executor::isolation::{run_isolated, Isolated};
use crate::executor::result::{ExceptionInfo, TaskResult};
use crate::model::handler::{EventContext, HandlerKey};
use crate::model::{event_by_id, ServerCodeModel};
use crate::utils::errors::RunnerError;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

fn integrity(message: String) -> TaskResult {
    TaskResult::failure(ExceptionInfo::new(
        RunnerError::Integrity(message).to_string(),
    ))
}

pub(crate) async fn execute_method(
    model: &Arc<ServerCodeModel>,
    arguments: &[u8],
    event_id: u16,
    target: Option<&str>,
    timeout: Duration,
) -> TaskResult {
    let Some(event) = event_by_id(event_id) else {
        return integrity(format!("unknown event id {}", event_id));
    };

    let key = match HandlerKey::derive(event, target) {
        Ok(key) => key,
        Err(error) => return TaskResult::failure(ExceptionInfo::new(error.to_string())),
    };

    let Some(entry) = model.handler(event.id, &key.target) else {
        return integrity(format!(
            "no handler registered for event {} and target {}",
            event.name, key.target
        ));
    };

    let codec = ArgumentCodec::with_mappings(model.class_mappings());
    let graph = if arguments.is_empty() {
        let mut graph = ValueGraph::new();
        let root = graph.insert(GraphNode::Array(Vec::new()));
        graph.set_root(root);
        graph
    } else {
        match codec.decode_bytes(arguments) {
            Ok(graph) => graph,
            Err(error) => return TaskResult::failure(ExceptionInfo::new(error.to_string())),
        }
    };

    debug!(event = %event.name, target = %key.target, "invoking handler");

    let context = EventContext::new(graph, event.args);
    let invoke = entry.invoke.clone();
    let outcome = run_isolated(timeout, move || {
        let mut context = context;
        let returned = (invoke)(&mut context);
        (context, returned)
    })
    .await;

    match outcome {
        Isolated::Completed((mut context, Ok(returned))) => {
            if let Some(value) = returned {
                if let Err(error) = context.set_premature_result(&value) {
                    return TaskResult::failure(ExceptionInfo::new(error.to_string()));
                }
            }
            if entry.fire_and_forget {
                return TaskResult::empty();
            }
            match codec.encode_bytes(&context.into_graph()) {
                Ok(bytes) => TaskResult::success(bytes),
                Err(error) => TaskResult::failure(ExceptionInfo::new(error.to_string())),
            }
        }
        Isolated::Completed((_, Err(error))) => {
            TaskResult::failure(ExceptionInfo::from_tenant_error(&error))
        }
        Isolated::Panicked(message) => TaskResult::failure(ExceptionInfo::new(message)),
        Isolated::TimedOut => TaskResult::failure(ExceptionInfo::timeout()),
    }
}
