// src/executor/result.rs
//! Result envelope returned for every executed task
//!
//! Success and exception are mutually exclusive on the wire. Arguments
//! carry the re-encoded argument document, empty for fire-and-forget events
//! and for every failure.

use crate::utils::errors::RunnerError;
use serde::{Deserialize, Serialize};

/// Exception class reported when tenant code gives no more specific one
pub const DEFAULT_EXCEPTION_CLASS: &str = "ServerCodeException";

/// Wire result of one task
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    /// Byte-encoded JSON argument document, empty when there is nothing to
    /// return
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arguments: Vec<u8>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception: Option<ExceptionInfo>,
}

impl TaskResult {
    pub fn success(arguments: Vec<u8>) -> Self {
        Self {
            arguments,
            exception: None,
        }
    }

    /// A result with nothing to return
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn failure(exception: ExceptionInfo) -> Self {
        Self {
            arguments: Vec::new(),
            exception: Some(exception),
        }
    }

    pub fn is_exception(&self) -> bool {
        self.exception.is_some()
    }
}

/// The exception member of a task result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExceptionInfo {
    #[serde(default)]
    pub code: i64,

    #[serde(default = "default_class")]
    pub exception_class: String,

    pub exception_message: String,
}

fn default_class() -> String {
    DEFAULT_EXCEPTION_CLASS.to_string()
}

impl ExceptionInfo {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: 0,
            exception_class: default_class(),
            exception_message: message.into(),
        }
    }

    pub fn with_code(mut self, code: i64) -> Self {
        self.code = code;
        self
    }

    pub fn with_class(mut self, class: impl Into<String>) -> Self {
        self.exception_class = class.into();
        self
    }

    /// The canonical inner-timeout exception
    pub fn timeout() -> Self {
        Self::new(RunnerError::ExecutionTimeout.to_string())
    }

    /// Convert a tenant error, honoring an explicit code/class when the
    /// error is a [`ServiceException`]
    pub fn from_tenant_error(error: &anyhow::Error) -> Self {
        match error.downcast_ref::<ServiceException>() {
            Some(exception) => Self {
                code: exception.code,
                exception_class: exception.class.clone(),
                exception_message: exception.message.clone(),
            },
            None => Self::new(error.to_string()),
        }
    }
}

/// Error type tenant code can raise to control the reported code and class
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct ServiceException {
    pub code: i64,
    pub class: String,
    pub message: String,
}

impl ServiceException {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: 0,
            class: DEFAULT_EXCEPTION_CLASS.to_string(),
            message: message.into(),
        }
    }

    pub fn with_code(mut self, code: i64) -> Self {
        self.code = code;
        self
    }

    pub fn with_class(mut self, class: impl Into<String>) -> Self {
        self.class = class.into();
        self
    }
}
