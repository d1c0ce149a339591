// src/model/service.rs
//! Service entries: named method collections invoked by service tasks
//!
//! A service is instantiated fresh for every invocation. Its declared
//! configuration items are resolved against the live invocation context
//! before the method runs: a live value always wins, even an explicitly
//! empty or zero one; the static default only fills a genuinely absent key.

use crate::utils::errors::{Result, RunnerError};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Allowed configuration item types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigItemType {
    String,
    Bool,
    Date,
    Choice,
    Text,
}

impl ConfigItemType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigItemType::String => "string",
            ConfigItemType::Bool => "bool",
            ConfigItemType::Date => "date",
            ConfigItemType::Choice => "choice",
            ConfigItemType::Text => "text",
        }
    }
}

/// One declared configuration item of a service
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfigItem {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    #[serde(rename = "type")]
    pub item_type: ConfigItemType,

    pub required: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,

    /// Allowed values, meaningful for choice items only
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

impl ConfigItem {
    pub fn new(name: impl Into<String>, item_type: ConfigItemType) -> Self {
        Self {
            name: name.into(),
            display_name: None,
            item_type,
            required: false,
            default_value: None,
            hint: None,
            options: Vec::new(),
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = Some(display_name.into());
        self
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default_value = Some(default);
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn with_options(mut self, options: Vec<String>) -> Self {
        self.options = options;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(RunnerError::InvalidRegistration(
                "config item has an empty name".into(),
            ));
        }
        match self.item_type {
            ConfigItemType::Choice if self.options.is_empty() => {
                Err(RunnerError::InvalidRegistration(format!(
                    "config item {}: a choice item needs options",
                    self.name
                )))
            }
            ConfigItemType::Choice => Ok(()),
            _ if !self.options.is_empty() => Err(RunnerError::InvalidRegistration(format!(
                "config item {}: options are only valid on choice items",
                self.name
            ))),
            _ => Ok(()),
        }
    }
}

/// Per-invocation state a service method runs against
#[derive(Debug, Clone)]
pub struct ServiceContext {
    /// The task's invocation context as received on the wire
    pub invocation_context: Value,

    /// Resolved configuration items, declaration order preserved
    pub config: Map<String, Value>,

    /// Decoded (and possibly re-typed) method arguments
    pub args: Vec<Value>,
}

/// A service method body
pub type ServiceMethodFn = Arc<dyn Fn(&mut ServiceContext) -> anyhow::Result<Value> + Send + Sync>;

/// Builds one service instance; called once per invocation
pub type ServiceFactory = Arc<dyn Fn() -> ServiceInstance + Send + Sync>;

/// A live service instance: the method table one invocation dispatches into
#[derive(Default)]
pub struct ServiceInstance {
    methods: HashMap<String, ServiceMethodFn>,
}

impl ServiceInstance {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_method<F>(mut self, name: impl Into<String>, body: F) -> Self
    where
        F: Fn(&mut ServiceContext) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.methods.insert(name.into(), Arc::new(body));
        self
    }

    pub fn method(&self, name: &str) -> Option<ServiceMethodFn> {
        self.methods.get(name).cloned()
    }

    pub fn method_names(&self) -> Vec<&str> {
        self.methods.keys().map(String::as_str).collect()
    }
}

impl fmt::Debug for ServiceInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceInstance")
            .field("methods", &self.method_names())
            .finish()
    }
}

/// One registered service
#[derive(Clone)]
pub struct ServiceEntry {
    pub name: String,
    pub version: String,
    pub description: Option<String>,

    /// Tenant file the registration came from
    pub source_file: String,

    /// Declared parameter type per method, consulted for argument re-typing
    pub param_types: HashMap<String, Vec<String>>,

    pub config_items: Vec<ConfigItem>,

    factory: ServiceFactory,
}

impl ServiceEntry {
    /// Build a fresh instance for one invocation
    pub fn instantiate(&self) -> ServiceInstance {
        (self.factory)()
    }

    /// Resolve declared configuration items against the live context.
    ///
    /// Live values come from the context's `configurationItems` member,
    /// either a plain object or a list of `{name, value}` pairs.
    pub fn resolve_config(&self, invocation_context: &Value) -> Map<String, Value> {
        let live = live_config(invocation_context);
        let mut resolved = Map::with_capacity(self.config_items.len());
        for item in &self.config_items {
            if let Some(value) = live.get(&item.name) {
                resolved.insert(item.name.clone(), value.clone());
            } else if let Some(default) = &item.default_value {
                resolved.insert(item.name.clone(), default.clone());
            }
        }
        resolved
    }
}

impl fmt::Debug for ServiceEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceEntry")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("config_items", &self.config_items.len())
            .field("source_file", &self.source_file)
            .finish()
    }
}

fn live_config(invocation_context: &Value) -> HashMap<String, Value> {
    let mut live = HashMap::new();
    match invocation_context.get("configurationItems") {
        Some(Value::Object(map)) => {
            for (key, value) in map {
                live.insert(key.clone(), value.clone());
            }
        }
        Some(Value::Array(items)) => {
            for item in items {
                if let (Some(name), Some(value)) =
                    (item.get("name").and_then(Value::as_str), item.get("value"))
                {
                    live.insert(name.to_string(), value.clone());
                }
            }
        }
        _ => {}
    }
    live
}

/// Declares a service during registration
pub struct ServiceBuilder {
    name: String,
    version: String,
    description: Option<String>,
    config_items: Vec<ConfigItem>,
    param_types: HashMap<String, Vec<String>>,
    methods: Vec<(String, ServiceMethodFn)>,
    factory: Option<ServiceFactory>,
}

impl ServiceBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: "1.0.0".to_string(),
            description: None,
            config_items: Vec::new(),
            param_types: HashMap::new(),
            methods: Vec::new(),
            factory: None,
        }
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn config_item(mut self, item: ConfigItem) -> Self {
        self.config_items.push(item);
        self
    }

    /// Declare the parameter types of a method, by registered type name.
    ///
    /// Positions with an empty name are left untyped.
    pub fn param_types(mut self, method: impl Into<String>, types: Vec<String>) -> Self {
        self.param_types.insert(method.into(), types);
        self
    }

    pub fn method<F>(mut self, name: impl Into<String>, body: F) -> Self
    where
        F: Fn(&mut ServiceContext) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.methods.push((name.into(), Arc::new(body)));
        self
    }

    /// Replace the default factory, for services that need per-instance
    /// construction logic
    pub fn factory(mut self, factory: ServiceFactory) -> Self {
        self.factory = Some(factory);
        self
    }

    pub(crate) fn into_entry(self, source_file: String) -> Result<ServiceEntry> {
        if self.name.is_empty() {
            return Err(RunnerError::InvalidRegistration(
                "service has an empty name".into(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for item in &self.config_items {
            item.validate()?;
            if !seen.insert(item.name.clone()) {
                return Err(RunnerError::InvalidRegistration(format!(
                    "service {}: duplicate config item {}",
                    self.name, item.name
                )));
            }
        }
        if self.factory.is_none() && self.methods.is_empty() {
            return Err(RunnerError::InvalidRegistration(format!(
                "service {} declares no methods",
                self.name
            )));
        }

        let factory = match self.factory {
            Some(factory) => factory,
            None => {
                let methods = self.methods;
                Arc::new(move || {
                    let mut instance = ServiceInstance::new();
                    for (name, body) in &methods {
                        instance.methods.insert(name.clone(), body.clone());
                    }
                    instance
                }) as ServiceFactory
            }
        };

        Ok(ServiceEntry {
            name: self.name,
            version: self.version,
            description: self.description,
            source_file,
            param_types: self.param_types,
            config_items: self.config_items,
            factory,
        })
    }
}
