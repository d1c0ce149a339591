// src/model/mod.rs
//! Tenant code model
//!
//! The queryable catalog a worker builds from one tenant's source modules:
//!
//! - **events**: the static table of dispatchable events
//! - **handler**: handler entries, lookup keys, and the invocation context
//! - **timer**: timer descriptors and scheduling validation
//! - **service**: service entries, method tables, configuration items
//! - **types**: custom type declarations backing codec promotion
//! - **builder**: the registration facade and model construction
//! - **repository**: where a deployment's source modules come from
//!
//! Construction isolates per-file failures: one broken module leaves the
//! rest of the tenant's code loadable, with the failure reported in the
//! model's load errors.

pub mod builder;
pub mod events;
pub mod handler;
pub mod repository;
pub mod service;
pub mod timer;
pub mod types;

// Re-export commonly used types
pub use builder::{ModelBuilder, RegisterFn, ServerCode, SourceModule};
pub use events::{
    event_by_id, event_by_name, EventDescriptor, EventProvider, CUSTOM_EVENT_ID, EVENTS,
    TIMER_EVENT_ID,
};
pub use handler::{EventContext, HandlerEntry, HandlerFn, HandlerKey, HandlerOutcome, ANY_TARGET};
pub use repository::{CodeRepository, StaticCodeRepository};
pub use service::{
    ConfigItem, ConfigItemType, ServiceBuilder, ServiceContext, ServiceEntry, ServiceInstance,
    ServiceMethodFn,
};
pub use timer::{Schedule, TimerSpec};
pub use types::{CustomType, CustomTypeEntry};

use crate::codec::ClassMappings;
use std::collections::HashMap;
use std::fmt;

/// A per-file load failure captured during model construction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadError {
    pub file: String,
    pub message: String,
}

/// The built catalog of one tenant deployment
#[derive(Debug)]
pub struct ServerCodeModel {
    app_id: String,
    handlers: HashMap<HandlerKey, HandlerEntry>,
    types: HashMap<String, CustomTypeEntry>,
    services: HashMap<String, ServiceEntry>,
    load_errors: Vec<LoadError>,
}

impl ServerCodeModel {
    /// Build the model for one tenant from its source modules
    pub fn build(app_id: impl Into<String>, modules: &[SourceModule]) -> crate::utils::errors::Result<Self> {
        ModelBuilder::new(app_id).build(modules)
    }

    pub(crate) fn from_parts(
        app_id: String,
        handlers: HashMap<HandlerKey, HandlerEntry>,
        types: HashMap<String, CustomTypeEntry>,
        services: HashMap<String, ServiceEntry>,
        load_errors: Vec<LoadError>,
    ) -> Self {
        Self {
            app_id,
            handlers,
            types,
            services,
            load_errors,
        }
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    /// Look up a handler, falling back to a catch-all registration
    pub fn handler(&self, event_id: u16, target: &str) -> Option<&HandlerEntry> {
        self.handlers
            .get(&HandlerKey::new(event_id, target))
            .or_else(|| self.handlers.get(&HandlerKey::new(event_id, ANY_TARGET)))
    }

    pub fn service(&self, name: &str) -> Option<&ServiceEntry> {
        self.services.get(name)
    }

    pub fn custom_type(&self, name: &str) -> Option<&CustomTypeEntry> {
        self.types.get(name)
    }

    pub fn handlers(&self) -> impl Iterator<Item = &HandlerEntry> {
        self.handlers.values()
    }

    pub fn load_errors(&self) -> &[LoadError] {
        &self.load_errors
    }

    /// Whether the model carries nothing invokable
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty() && self.services.is_empty()
    }

    /// Type templates for codec promotion, one per registered custom type
    pub fn class_mappings(&self) -> ClassMappings {
        let mut mappings = ClassMappings::new();
        for entry in self.types.values() {
            mappings.insert(entry.name.clone(), entry.fields.clone());
        }
        mappings
    }

    pub fn summary(&self) -> ModelSummary {
        let timers = self
            .handlers
            .values()
            .filter(|entry| entry.timer.is_some())
            .count();
        ModelSummary {
            app_id: self.app_id.clone(),
            handlers: self.handlers.len() - timers,
            timers,
            types: self.types.len(),
            services: self.services.len(),
            load_errors: self.load_errors.len(),
        }
    }
}

/// Counts reported when a model is built or published
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSummary {
    pub app_id: String,
    pub handlers: usize,
    pub timers: usize,
    pub types: usize,
    pub services: usize,
    pub load_errors: usize,
}

impl fmt::Display for ModelSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "model {}: {} handlers, {} timers, {} types, {} services, {} load errors",
            self.app_id, self.handlers, self.timers, self.types, self.services, self.load_errors
        )
    }
}
