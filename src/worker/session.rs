// src/worker/session.rs
//! Per-process task handling
//!
//! A session owns the executor for the life of one worker process. The
//! sandbox engages right before the first task's tenant code would run and
//! stays in force for every later task; models build lazily inside the
//! executor and are cached per deployment.

use crate::executor::{Control, Task, TaskExecutor};
use crate::model::CodeRepository;
use crate::pool::protocol::WorkerFrame;
use crate::sandbox;
use crate::utils::config::WorkerSettings;
use std::sync::Arc;
use std::time::Duration;
use tracing::error;

pub struct WorkerSession {
    executor: TaskExecutor,
    settings: WorkerSettings,
}

impl WorkerSession {
    pub fn new(repository: Arc<dyn CodeRepository>, settings: WorkerSettings) -> Self {
        let default_timeout = Duration::from_millis(settings.default_timeout_ms);
        Self {
            executor: TaskExecutor::new(repository, default_timeout),
            settings,
        }
    }

    /// Execute one task and produce the frame to report, plus whether the
    /// worker should keep running
    pub async fn handle_task(&self, task: Task) -> (WorkerFrame, Control) {
        if let Err(e) = sandbox::engage(&self.settings.sandbox, &task.application_id) {
            // Running tenant code half-confined is not an option.
            error!(task = %task.id, "sandbox engage failed: {}", e);
            return (
                WorkerFrame::CriticalError {
                    message: e.to_string(),
                },
                Control::Shutdown,
            );
        }

        let output = self.executor.execute(&task).await;
        (
            WorkerFrame::Processed {
                task_id: task.id,
                task_result: output.result,
            },
            output.control,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::TaskKind;
    use crate::model::{SourceModule, StaticCodeRepository};
    use serde_json::json;

    fn session(modules: Vec<SourceModule>) -> WorkerSession {
        let repo = StaticCodeRepository::new();
        repo.register_app("app", modules);
        WorkerSession::new(Arc::new(repo), WorkerSettings::default())
    }

    #[tokio::test]
    async fn test_task_produces_processed_frame() {
        let session = session(vec![SourceModule::new("handlers.rs", |code| {
            code.add_handler("beforeCreate", Some("Order"), |_ctx| Ok(None))?;
            Ok(())
        })]);
        let task = Task {
            id: "t-1".into(),
            application_id: "app".into(),
            relative_path: String::new(),
            timeout_ms: None,
            cacheable: true,
            arguments: serde_json::to_vec(&json!([{}, {}])).unwrap(),
            kind: TaskKind::MethodInvocation {
                event_id: 1,
                target: Some("Order".into()),
            },
        };

        let (frame, control) = session.handle_task(task).await;
        assert_eq!(control, Control::Continue);
        match frame {
            WorkerFrame::Processed {
                task_id,
                task_result,
            } => {
                assert_eq!(task_id, "t-1");
                assert!(!task_result.is_exception());
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_shutdown_action_ends_the_session() {
        let session = session(Vec::new());
        let task = Task {
            id: "t-2".into(),
            application_id: "app".into(),
            relative_path: String::new(),
            timeout_ms: None,
            cacheable: false,
            arguments: Vec::new(),
            kind: TaskKind::ActionInvocation {
                action_type: "SHUTDOWN".into(),
            },
        };

        let (_, control) = session.handle_task(task).await;
        assert_eq!(control, Control::Shutdown);
    }
}
