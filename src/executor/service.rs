// src/executor/service.rs
//! Service invocation: named method dispatch
//!
//! Services are instantiated fresh per call. Before the method runs its
//! declared configuration items are resolved against the invocation
//! context, and arguments whose declared parameter type names a registered
//! custom type are merged into a fresh instance of that type so downstream
//! type dispatch keeps working.

use crate::codec::{ArgumentCodec, CLASS_KEY};
use crate::executor::isolation::{run_isolated, Isolated};
use crate::executor::result::{ExceptionInfo, TaskResult};
use crate::model::service::ServiceContext;
use crate::model::{CustomTypeEntry, ServerCodeModel};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub(crate) async fn execute_service(
    model: &Arc<ServerCodeModel>,
    arguments: &[u8],
    service_id: &str,
    method: &str,
    invocation_context: &Value,
    timeout: Duration,
) -> TaskResult {
    let Some(entry) = model.service(service_id) else {
        return TaskResult::failure(ExceptionInfo::new(format!(
            "[{}] service does not exist",
            service_id
        )));
    };

    let instance = entry.instantiate();
    let Some(body) = instance.method(method) else {
        return TaskResult::failure(ExceptionInfo::new(format!(
            "[{}.{}] is not a function",
            service_id, method
        )));
    };

    let codec = ArgumentCodec::with_mappings(model.class_mappings());
    let mut args = match decode_args(&codec, arguments) {
        Ok(args) => args,
        Err(error) => return TaskResult::failure(error),
    };

    if let Some(param_types) = entry.param_types.get(method) {
        for (position, type_name) in param_types.iter().enumerate() {
            if type_name.is_empty() {
                continue;
            }
            let (Some(custom), Some(arg)) =
                (model.custom_type(type_name), args.get_mut(position))
            else {
                continue;
            };
            *arg = retype(std::mem::take(arg), custom);
        }
    }

    debug!(service = %service_id, method = %method, "invoking service method");

    let context = ServiceContext {
        invocation_context: invocation_context.clone(),
        config: entry.resolve_config(invocation_context),
        args,
    };
    let outcome = run_isolated(timeout, move || {
        let mut context = context;
        (body)(&mut context)
    })
    .await;

    match outcome {
        Isolated::Completed(Ok(value)) => {
            // Service results travel as a single-element array
            let graph = crate::codec::ValueGraph::from_value(&Value::Array(vec![value]));
            match codec.encode_bytes(&graph) {
                Ok(bytes) => TaskResult::success(bytes),
                Err(error) => TaskResult::failure(ExceptionInfo::new(error.to_string())),
            }
        }
        Isolated::Completed(Err(error)) => {
            TaskResult::failure(ExceptionInfo::from_tenant_error(&error))
        }
        Isolated::Panicked(message) => TaskResult::failure(ExceptionInfo::new(message)),
        Isolated::TimedOut => TaskResult::failure(ExceptionInfo::timeout()),
    }
}

fn decode_args(codec: &ArgumentCodec, arguments: &[u8]) -> Result<Vec<Value>, ExceptionInfo> {
    if arguments.is_empty() {
        return Ok(Vec::new());
    }
    let graph = codec
        .decode_bytes(arguments)
        .map_err(|e| ExceptionInfo::new(e.to_string()))?;
    let value = graph
        .to_value()
        .map_err(|e| ExceptionInfo::new(e.to_string()))?;
    Ok(match value {
        Value::Array(items) => items,
        other => vec![other],
    })
}

/// Merge a raw object argument into a fresh instance of its declared type
fn retype(arg: Value, custom: &CustomTypeEntry) -> Value {
    let Value::Object(raw) = arg else {
        return arg;
    };
    let mut typed = Map::with_capacity(custom.fields.len() + raw.len() + 1);
    typed.insert(CLASS_KEY.to_string(), Value::String(custom.name.clone()));
    for (field, default) in &custom.fields {
        typed.insert(field.clone(), default.clone());
    }
    for (key, value) in raw {
        if key != CLASS_KEY {
            typed.insert(key, value);
        }
    }
    Value::Object(typed)
}
