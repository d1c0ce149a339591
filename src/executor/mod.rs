// src/executor/mod.rs
//! In-worker task execution
//!
//! One executor runs inside each worker process and handles one task at a
//! time:
//!
//! - **task**: the task wire schema crossing queue and worker boundaries
//! - **result**: the result envelope (arguments xor exception)
//! - **method**: event handler dispatch
//! - **service**: named service method dispatch
//! - **action**: engine control actions
//! - **isolation**: panic containment and the inner timeout race
//!
//! Models are built lazily per deployment and cached for the lifetime of
//! the executor, which in the worker means the lifetime of the process.

pub mod action;
pub mod isolation;
pub mod method;
pub mod result;
pub mod service;
pub mod task;

// Re-export commonly used types
pub use action::Action;
pub use result::{ExceptionInfo, ServiceException, TaskResult, DEFAULT_EXCEPTION_CLASS};
pub use task::{Task, TaskKind};

use crate::model::{CodeRepository, ServerCodeModel};
use crate::utils::errors::Result;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// What the worker loop should do after reporting the result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Continue,
    Shutdown,
}

/// Result of executing one task
#[derive(Debug)]
pub struct ExecutionOutput {
    pub result: TaskResult,
    pub control: Control,
}

impl ExecutionOutput {
    fn completed(result: TaskResult) -> Self {
        Self {
            result,
            control: Control::Continue,
        }
    }
}

/// Executes tasks against lazily built tenant models
pub struct TaskExecutor {
    repository: Arc<dyn CodeRepository>,
    models: DashMap<(String, String), Arc<ServerCodeModel>>,
    default_timeout: Duration,
}

impl TaskExecutor {
    pub fn new(repository: Arc<dyn CodeRepository>, default_timeout: Duration) -> Self {
        Self {
            repository,
            models: DashMap::new(),
            default_timeout,
        }
    }

    /// The model for one deployment, built on first use
    pub fn model_for(&self, app_id: &str, relative_path: &str) -> Result<Arc<ServerCodeModel>> {
        let key = (app_id.to_string(), relative_path.to_string());
        if let Some(model) = self.models.get(&key) {
            return Ok(model.clone());
        }

        let modules = self.repository.modules(app_id, relative_path);
        let model = Arc::new(ServerCodeModel::build(app_id, &modules)?);
        for error in model.load_errors() {
            warn!(app_id, file = %error.file, message = %error.message, "model load error");
        }
        info!(app_id, "{}", model.summary());

        self.models.insert(key, model.clone());
        Ok(model)
    }

    /// Execute one task, producing a result envelope for every failure mode
    pub async fn execute(&self, task: &Task) -> ExecutionOutput {
        let timeout = task.timeout().unwrap_or(self.default_timeout);

        match &task.kind {
            TaskKind::MethodInvocation { event_id, target } => {
                let model = match self.model_for(&task.application_id, &task.relative_path) {
                    Ok(model) => model,
                    Err(error) => {
                        return ExecutionOutput::completed(TaskResult::failure(
                            ExceptionInfo::new(error.to_string()),
                        ))
                    }
                };
                let result = method::execute_method(
                    &model,
                    &task.arguments,
                    *event_id,
                    target.as_deref(),
                    timeout,
                )
                .await;
                ExecutionOutput::completed(result)
            }

            TaskKind::ServiceInvocation {
                service_id,
                method,
                invocation_context,
            } => {
                let model = match self.model_for(&task.application_id, &task.relative_path) {
                    Ok(model) => model,
                    Err(error) => {
                        return ExecutionOutput::completed(TaskResult::failure(
                            ExceptionInfo::new(error.to_string()),
                        ))
                    }
                };
                let result = service::execute_service(
                    &model,
                    &task.arguments,
                    service_id,
                    method,
                    invocation_context,
                    timeout,
                )
                .await;
                ExecutionOutput::completed(result)
            }

            TaskKind::ActionInvocation { action_type } => match Action::parse(action_type) {
                Some(Action::Shutdown) => {
                    info!("shutdown action received");
                    ExecutionOutput {
                        result: TaskResult::empty(),
                        control: Control::Shutdown,
                    }
                }
                Some(Action::AnalyseCode) => {
                    let result = match self.model_for(&task.application_id, &task.relative_path)
                    {
                        Ok(model) => action::analyse(&model),
                        Err(error) => TaskResult::failure(ExceptionInfo::new(error.to_string())),
                    };
                    ExecutionOutput::completed(result)
                }
                None => ExecutionOutput::completed(TaskResult::failure(ExceptionInfo::new(
                    format!("unknown action type: {}", action_type),
                ))),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ArgumentCodec;
    use crate::model::{
        ConfigItem, ConfigItemType, CustomType, ServiceBuilder, SourceModule,
        StaticCodeRepository, TimerSpec,
    };
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const APP: &str = "app";

    fn executor_with(modules: Vec<SourceModule>) -> TaskExecutor {
        let repo = StaticCodeRepository::new();
        repo.register_app(APP, modules);
        TaskExecutor::new(Arc::new(repo), Duration::from_secs(5))
    }

    fn method_task(event_id: u16, target: &str, args: Value) -> Task {
        Task {
            id: "t-1".into(),
            application_id: APP.into(),
            relative_path: String::new(),
            timeout_ms: None,
            cacheable: false,
            arguments: serde_json::to_vec(&args).unwrap(),
            kind: TaskKind::MethodInvocation {
                event_id,
                target: Some(target.into()),
            },
        }
    }

    fn service_task(service: &str, method: &str, args: Value, context: Value) -> Task {
        Task {
            id: "t-2".into(),
            application_id: APP.into(),
            relative_path: String::new(),
            timeout_ms: None,
            cacheable: false,
            arguments: serde_json::to_vec(&args).unwrap(),
            kind: TaskKind::ServiceInvocation {
                service_id: service.into(),
                method: method.into(),
                invocation_context: context,
            },
        }
    }

    fn decode(result: &TaskResult) -> Value {
        ArgumentCodec::new()
            .decode_bytes(&result.arguments)
            .unwrap()
            .to_value()
            .unwrap()
    }

    #[tokio::test]
    async fn test_before_create_mutation_is_returned() {
        let modules = vec![SourceModule::new("handlers/order.rs", |code| {
            code.add_handler("beforeCreate", Some("Order"), |ctx| {
                let name = ctx.read_field("item", "name")?.unwrap_or(Value::Null);
                let name = name.as_str().unwrap_or_default().to_string();
                ctx.write_field("item", "name", &json!(format!("{} Bar", name)))?;
                Ok(None)
            })?;
            Ok(())
        })];
        let executor = executor_with(modules);

        let task = method_task(1, "Order", json!([{"appId": APP}, {"name": "Foo"}]));
        let output = executor.execute(&task).await;

        assert_eq!(output.control, Control::Continue);
        assert!(!output.result.is_exception());
        let decoded = decode(&output.result);
        assert_eq!(decoded[1]["name"], json!("Foo Bar"));
    }

    #[tokio::test]
    async fn test_short_circuit_suppresses_after_handler() {
        static AFTER_CALLS: AtomicUsize = AtomicUsize::new(0);
        let modules = vec![SourceModule::new("handlers/order.rs", |code| {
            code.add_handler("beforeCreate", Some("Order"), |_ctx| {
                Ok(Some(json!({"foo": "bar"})))
            })?;
            code.add_handler("afterCreate", Some("Order"), |_ctx| {
                AFTER_CALLS.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            })?;
            Ok(())
        })];
        let executor = executor_with(modules);

        let task = method_task(1, "Order", json!([{"appId": APP}, {"name": "Foo"}]));
        let output = executor.execute(&task).await;

        let decoded = decode(&output.result);
        assert_eq!(decoded[0]["prematureResult"], json!({"foo": "bar"}));
        assert_eq!(AFTER_CALLS.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_handler_error_becomes_exception_envelope() {
        let modules = vec![SourceModule::new("handlers/order.rs", |code| {
            code.add_handler("beforeCreate", Some("Order"), |_ctx| {
                Err(anyhow::anyhow!("You shall not pass"))
            })?;
            Ok(())
        })];
        let executor = executor_with(modules);

        let task = method_task(1, "Order", json!([{}, {}]));
        let exception = executor.execute(&task).await.result.exception.unwrap();

        assert_eq!(exception.code, 0);
        assert_eq!(exception.exception_class, DEFAULT_EXCEPTION_CLASS);
        assert_eq!(exception.exception_message, "You shall not pass");
    }

    #[tokio::test]
    async fn test_missing_service_message() {
        let executor = executor_with(Vec::new());
        let task = service_task("NoSuchService", "run", json!([]), json!({}));
        let exception = executor.execute(&task).await.result.exception.unwrap();
        assert_eq!(
            exception.exception_message,
            "[NoSuchService] service does not exist"
        );
    }

    #[tokio::test]
    async fn test_missing_method_message() {
        let modules = vec![SourceModule::new("services.rs", |code| {
            code.add_service(
                ServiceBuilder::new("OrderService").method("place", |_ctx| Ok(json!(1))),
            )?;
            Ok(())
        })];
        let executor = executor_with(modules);
        let task = service_task("OrderService", "cancel", json!([]), json!({}));
        let exception = executor.execute(&task).await.result.exception.unwrap();
        assert_eq!(
            exception.exception_message,
            "[OrderService.cancel] is not a function"
        );
    }

    #[tokio::test]
    async fn test_slow_handler_times_out() {
        let modules = vec![SourceModule::new("handlers/slow.rs", |code| {
            code.add_handler("beforeCreate", Some("Order"), |_ctx| {
                std::thread::sleep(Duration::from_millis(20));
                Ok(None)
            })?;
            Ok(())
        })];
        let executor = executor_with(modules);

        let mut task = method_task(1, "Order", json!([{}, {}]));
        task.timeout_ms = Some(1);
        let exception = executor.execute(&task).await.result.exception.unwrap();
        assert_eq!(
            exception.exception_message,
            "task execution aborted due to timeout"
        );
    }

    #[tokio::test]
    async fn test_panicking_handler_is_contained() {
        let modules = vec![SourceModule::new("handlers/bad.rs", |code| {
            code.add_handler("beforeCreate", Some("Order"), |_ctx| panic!("tenant bug"))?;
            Ok(())
        })];
        let executor = executor_with(modules);

        let task = method_task(1, "Order", json!([{}, {}]));
        let exception = executor.execute(&task).await.result.exception.unwrap();
        assert_eq!(exception.exception_message, "tenant bug");
    }

    #[tokio::test]
    async fn test_missing_handler_is_an_integrity_error() {
        let executor = executor_with(Vec::new());
        let task = method_task(1, "Order", json!([{}, {}]));
        let exception = executor.execute(&task).await.result.exception.unwrap();
        assert_eq!(
            exception.exception_message,
            "integrity violation: no handler registered for event beforeCreate and target Order"
        );
    }

    #[tokio::test]
    async fn test_fire_and_forget_returns_no_arguments() {
        let modules = vec![SourceModule::new("handlers/audit.rs", |code| {
            code.add_async_handler("afterCreate", Some("Order"), |_ctx| Ok(None))?;
            Ok(())
        })];
        let executor = executor_with(modules);

        let task = method_task(2, "Order", json!([{}, {}, {}]));
        let result = executor.execute(&task).await.result;
        assert!(!result.is_exception());
        assert!(result.arguments.is_empty());
    }

    #[tokio::test]
    async fn test_service_result_is_a_single_element_array() {
        let modules = vec![SourceModule::new("services.rs", |code| {
            code.add_service(
                ServiceBuilder::new("OrderService")
                    .method("place", |_ctx| Ok(json!({"orderId": 7}))),
            )?;
            Ok(())
        })];
        let executor = executor_with(modules);

        let task = service_task("OrderService", "place", json!([]), json!({}));
        let result = executor.execute(&task).await.result;
        assert_eq!(decode(&result), json!([{"orderId": 7}]));
    }

    #[tokio::test]
    async fn test_service_arguments_are_retyped() {
        let modules = vec![SourceModule::new("services.rs", |code| {
            code.add_type(
                CustomType::new("Order")
                    .field("status", json!("new"))
                    .field("name", Value::Null),
            )?;
            code.add_service(
                ServiceBuilder::new("OrderService")
                    .param_types("place", vec!["Order".into()])
                    .method("place", |ctx| Ok(ctx.args[0].clone())),
            )?;
            Ok(())
        })];
        let executor = executor_with(modules);

        let task = service_task("OrderService", "place", json!([{"name": "Foo"}]), json!({}));
        let decoded = decode(&executor.execute(&task).await.result);
        assert_eq!(
            decoded[0],
            json!({"___class": "Order", "status": "new", "name": "Foo"})
        );
    }

    #[tokio::test]
    async fn test_service_config_resolution() {
        let modules = vec![SourceModule::new("services.rs", |code| {
            code.add_service(
                ServiceBuilder::new("MailService")
                    .config_item(
                        ConfigItem::new("sender", ConfigItemType::String)
                            .with_default(json!("noreply@example.com")),
                    )
                    .config_item(
                        ConfigItem::new("subject", ConfigItemType::String)
                            .with_default(json!("hello")),
                    )
                    .method("send", |ctx| Ok(Value::Object(ctx.config.clone()))),
            )?;
            Ok(())
        })];
        let executor = executor_with(modules);

        // The live empty subject must not be replaced by the default
        let context = json!({"configurationItems": {"subject": ""}});
        let task = service_task("MailService", "send", json!([]), context);
        let decoded = decode(&executor.execute(&task).await.result);
        assert_eq!(
            decoded[0],
            json!({"sender": "noreply@example.com", "subject": ""})
        );
    }

    #[tokio::test]
    async fn test_timer_dispatch_by_name_and_descriptor() {
        static TICKS: AtomicUsize = AtomicUsize::new(0);
        let modules = vec![SourceModule::new("timers.rs", |code| {
            code.add_timer(TimerSpec::every("sync", 300), |_ctx| {
                TICKS.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            })?;
            Ok(())
        })];
        let executor = executor_with(modules);

        let by_name = method_task(crate::model::TIMER_EVENT_ID, "sync", json!([{}]));
        assert!(!executor.execute(&by_name).await.result.is_exception());

        let by_descriptor = method_task(
            crate::model::TIMER_EVENT_ID,
            r#"{"name":"sync","schedule":"recurring","everySeconds":300}"#,
            json!([{}]),
        );
        assert!(!executor.execute(&by_descriptor).await.result.is_exception());
        assert_eq!(TICKS.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_shutdown_action() {
        let executor = executor_with(Vec::new());
        let task = Task {
            id: "t-3".into(),
            application_id: APP.into(),
            relative_path: String::new(),
            timeout_ms: None,
            cacheable: false,
            arguments: Vec::new(),
            kind: TaskKind::ActionInvocation {
                action_type: "SHUTDOWN".into(),
            },
        };
        let output = executor.execute(&task).await;
        assert_eq!(output.control, Control::Shutdown);
        assert!(!output.result.is_exception());
    }

    #[tokio::test]
    async fn test_analyse_action_reports_the_catalog() {
        let modules = vec![SourceModule::new("handlers/order.rs", |code| {
            code.add_handler("beforeCreate", Some("Order"), |_ctx| Ok(None))?;
            code.add_timer(TimerSpec::every("sync", 300), |_ctx| Ok(None))?;
            Ok(())
        })];
        let executor = executor_with(modules);

        let task = Task {
            id: "t-4".into(),
            application_id: APP.into(),
            relative_path: String::new(),
            timeout_ms: None,
            cacheable: false,
            arguments: Vec::new(),
            kind: TaskKind::ActionInvocation {
                action_type: "ANALYSE_CODE".into(),
            },
        };
        let decoded = decode(&executor.execute(&task).await.result);
        assert_eq!(decoded[0]["handlers"], json!(1));
        assert_eq!(decoded[0]["timers"], json!(1));
    }

    #[tokio::test]
    async fn test_unknown_action_is_rejected() {
        let executor = executor_with(Vec::new());
        let task = Task {
            id: "t-5".into(),
            application_id: APP.into(),
            relative_path: String::new(),
            timeout_ms: None,
            cacheable: false,
            arguments: Vec::new(),
            kind: TaskKind::ActionInvocation {
                action_type: "REBOOT".into(),
            },
        };
        let exception = executor.execute(&task).await.result.exception.unwrap();
        assert!(exception.exception_message.contains("unknown action type"));
    }

    #[tokio::test]
    async fn test_model_is_built_once_per_deployment() {
        static BUILDS: AtomicUsize = AtomicUsize::new(0);
        let modules = vec![SourceModule::new("handlers/order.rs", |code| {
            BUILDS.fetch_add(1, Ordering::SeqCst);
            code.add_handler("beforeCreate", Some("Order"), |_ctx| Ok(None))?;
            Ok(())
        })];
        let executor = executor_with(modules);

        let task = method_task(1, "Order", json!([{}, {}]));
        executor.execute(&task).await;
        executor.execute(&task).await;
        assert_eq!(BUILDS.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_duplicate_registration_surfaces_as_exception() {
        let modules = vec![
            SourceModule::new("one.rs", |code| {
                code.add_handler("beforeCreate", Some("Order"), |_ctx| Ok(None))?;
                Ok(())
            }),
            SourceModule::new("two.rs", |code| {
                code.add_handler("beforeCreate", Some("Order"), |_ctx| Ok(None))?;
                Ok(())
            }),
        ];
        let executor = executor_with(modules);

        let task = method_task(1, "Order", json!([{}, {}]));
        let exception = executor.execute(&task).await.result.exception.unwrap();
        assert!(exception.exception_message.contains("already registered"));
    }
}
