// src/model/builder.rs
//! Model construction from tenant source modules
//!
//! Tenant code registers its handlers, types, and services through a
//! [`ServerCode`] facade handed to each module's entry point. The facade is
//! only open while the loader is iterating modules; a stored handle used
//! later gets a "registration must happen at load time" error. A module
//! whose entry point fails (or panics) is recorded as a per-file load error
//! and loading continues, but a duplicate registration aborts the whole
//! build even if the module swallows the returned error.

use crate::model::events::{event_by_name, TIMER_EVENT_ID};
use crate::model::handler::{EventContext, HandlerEntry, HandlerKey, HandlerOutcome};
use crate::model::service::{ServiceBuilder, ServiceEntry};
use crate::model::timer::TimerSpec;
use crate::model::types::{CustomType, CustomTypeEntry};
use crate::model::{LoadError, ServerCodeModel};
use crate::utils::errors::{Result, RunnerError};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, warn};

/// Registration entry point of one tenant source file
pub type RegisterFn = Arc<dyn Fn(&ServerCode) -> anyhow::Result<()> + Send + Sync>;

/// One tenant source file: a path and the registrations it makes
#[derive(Clone)]
pub struct SourceModule {
    pub path: String,
    register: RegisterFn,
}

impl SourceModule {
    pub fn new<F>(path: impl Into<String>, register: F) -> Self
    where
        F: Fn(&ServerCode) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self {
            path: path.into(),
            register: Arc::new(register),
        }
    }
}

impl fmt::Debug for SourceModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceModule").field("path", &self.path).finish()
    }
}

#[derive(Default)]
struct BuildState {
    open: bool,
    current_file: String,
    handlers: HashMap<HandlerKey, HandlerEntry>,
    types: HashMap<String, CustomTypeEntry>,
    services: HashMap<String, ServiceEntry>,
    fatal: Option<String>,
}

/// Registration facade handed to tenant entry points
#[derive(Clone)]
pub struct ServerCode {
    state: Arc<Mutex<BuildState>>,
}

impl ServerCode {
    fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BuildState {
                open: true,
                ..BuildState::default()
            })),
        }
    }

    /// Register an event handler
    pub fn add_handler<F>(&self, event_name: &str, target: Option<&str>, handler: F) -> Result<()>
    where
        F: Fn(&mut EventContext) -> HandlerOutcome + Send + Sync + 'static,
    {
        self.insert_handler(event_name, target, false, None, Arc::new(handler))
    }

    /// Register a fire-and-forget event handler: the caller gets no
    /// arguments back
    pub fn add_async_handler<F>(
        &self,
        event_name: &str,
        target: Option<&str>,
        handler: F,
    ) -> Result<()>
    where
        F: Fn(&mut EventContext) -> HandlerOutcome + Send + Sync + 'static,
    {
        self.insert_handler(event_name, target, true, None, Arc::new(handler))
    }

    /// Register a timer; the descriptor is validated against the current clock
    pub fn add_timer<F>(&self, timer: TimerSpec, handler: F) -> Result<()>
    where
        F: Fn(&mut EventContext) -> HandlerOutcome + Send + Sync + 'static,
    {
        let timer = timer.validated(Utc::now())?;
        let mut state = self.state.lock();
        ensure_open(&state)?;

        let key = HandlerKey::new(TIMER_EVENT_ID, timer.name.clone());
        if state.handlers.contains_key(&key) {
            let message = format!("timer {} is already registered", timer.name);
            state.fatal = Some(message.clone());
            return Err(RunnerError::DuplicateRegistration(message));
        }

        let source_file = state.current_file.clone();
        debug!(file = %source_file, timer = %timer.name, "timer registered");
        state.handlers.insert(
            key.clone(),
            HandlerEntry {
                key,
                fire_and_forget: false,
                timer: Some(timer),
                source_file,
                invoke: Arc::new(handler),
            },
        );
        Ok(())
    }

    /// Register a custom type
    pub fn add_type(&self, custom: CustomType) -> Result<()> {
        custom.validate()?;
        let mut state = self.state.lock();
        ensure_open(&state)?;

        if state.types.contains_key(&custom.name) {
            let message = format!("type {} is already registered", custom.name);
            state.fatal = Some(message.clone());
            return Err(RunnerError::DuplicateRegistration(message));
        }

        let source_file = state.current_file.clone();
        debug!(file = %source_file, name = %custom.name, "custom type registered");
        state.types.insert(
            custom.name.clone(),
            CustomTypeEntry {
                name: custom.name,
                source_file,
                fields: custom.fields,
            },
        );
        Ok(())
    }

    /// Register a service
    pub fn add_service(&self, builder: ServiceBuilder) -> Result<()> {
        let mut state = self.state.lock();
        ensure_open(&state)?;

        let entry = builder.into_entry(state.current_file.clone())?;
        if state.services.contains_key(&entry.name) {
            let message = format!("service {} is already registered", entry.name);
            state.fatal = Some(message.clone());
            return Err(RunnerError::DuplicateRegistration(message));
        }

        debug!(file = %state.current_file, name = %entry.name, "service registered");
        state.services.insert(entry.name.clone(), entry);
        Ok(())
    }

    fn insert_handler(
        &self,
        event_name: &str,
        target: Option<&str>,
        fire_and_forget: bool,
        timer: Option<TimerSpec>,
        invoke: crate::model::handler::HandlerFn,
    ) -> Result<()> {
        let event = event_by_name(event_name).ok_or_else(|| {
            RunnerError::InvalidRegistration(format!("unknown event: {}", event_name))
        })?;
        let key = HandlerKey::derive(event, target)?;

        let mut state = self.state.lock();
        ensure_open(&state)?;

        if state.handlers.contains_key(&key) {
            let message = format!(
                "handler already registered for event {} and target {}",
                event.name, key.target
            );
            state.fatal = Some(message.clone());
            return Err(RunnerError::DuplicateRegistration(message));
        }

        let source_file = state.current_file.clone();
        debug!(file = %source_file, event = %event.name, target = %key.target, "handler registered");
        state.handlers.insert(
            key.clone(),
            HandlerEntry {
                key,
                fire_and_forget,
                timer,
                source_file,
                invoke,
            },
        );
        Ok(())
    }

    fn open_file(&self, path: &str) {
        self.state.lock().current_file = path.to_string();
    }

    fn take_fatal(&self) -> Option<RunnerError> {
        self.state
            .lock()
            .fatal
            .take()
            .map(RunnerError::DuplicateRegistration)
    }

    fn seal(&self) -> BuildState {
        let mut state = self.state.lock();
        state.open = false;
        std::mem::take(&mut state)
    }
}

fn ensure_open(state: &BuildState) -> Result<()> {
    if state.open {
        Ok(())
    } else {
        Err(RunnerError::InvalidRegistration(
            "registration must happen at load time".into(),
        ))
    }
}

/// Builds a [`ServerCodeModel`] from a tenant's source modules
pub struct ModelBuilder {
    app_id: String,
}

impl ModelBuilder {
    pub fn new(app_id: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
        }
    }

    pub fn build(self, modules: &[SourceModule]) -> Result<ServerCodeModel> {
        let facade = ServerCode::new();
        let mut load_errors = Vec::new();

        for module in modules {
            facade.open_file(&module.path);
            let outcome = catch_unwind(AssertUnwindSafe(|| (module.register)(&facade)));

            if let Some(fatal) = facade.take_fatal() {
                return Err(fatal);
            }

            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    warn!(app_id = %self.app_id, file = %module.path, %error, "tenant module failed to load");
                    load_errors.push(LoadError {
                        file: module.path.clone(),
                        message: error.to_string(),
                    });
                }
                Err(panic) => {
                    let message = panic_message(panic);
                    warn!(app_id = %self.app_id, file = %module.path, error = %message, "tenant module panicked during load");
                    load_errors.push(LoadError {
                        file: module.path.clone(),
                        message,
                    });
                }
            }
        }

        let state = facade.seal();

        // Service parameter types must resolve against registered types;
        // a miss is diagnosed but does not unload the service
        for service in state.services.values() {
            for (method, types) in &service.param_types {
                for type_name in types.iter().filter(|t| !t.is_empty()) {
                    if !state.types.contains_key(type_name) {
                        load_errors.push(LoadError {
                            file: service.source_file.clone(),
                            message: format!(
                                "service {}.{} references unregistered type {}",
                                service.name, method, type_name
                            ),
                        });
                    }
                }
            }
        }

        Ok(ServerCodeModel::from_parts(
            self.app_id,
            state.handlers,
            state.types,
            state.services,
            load_errors,
        ))
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "module panicked during load".to_string()
    }
}
