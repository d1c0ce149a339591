// src/model/types.rs
//! Custom type declarations
//!
//! A custom type names a class-like construct with ordered, defaulted
//! fields. The codec uses registered types to promote `___class`-tagged
//! wire objects, and services use them to re-type declared parameters.

use crate::utils::errors::{Result, RunnerError};
use serde_json::Value;

/// A custom type as declared during registration
#[derive(Debug, Clone, PartialEq)]
pub struct CustomType {
    pub name: String,
    pub fields: Vec<(String, Value)>,
}

impl CustomType {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    /// Declare a field with its default value
    pub fn field(mut self, name: impl Into<String>, default: Value) -> Self {
        self.fields.push((name.into(), default));
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(RunnerError::InvalidRegistration(
                "custom type has an empty name".into(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for (field, _) in &self.fields {
            if !seen.insert(field.as_str()) {
                return Err(RunnerError::InvalidRegistration(format!(
                    "custom type {}: duplicate field {}",
                    self.name, field
                )));
            }
        }
        Ok(())
    }
}

/// A registered custom type
#[derive(Debug, Clone)]
pub struct CustomTypeEntry {
    pub name: String,
    pub source_file: String,
    pub fields: Vec<(String, Value)>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_duplicate_field_rejected() {
        let custom = CustomType::new("Order")
            .field("name", Value::Null)
            .field("name", json!("x"));
        assert!(custom.validate().is_err());
    }

    #[test]
    fn test_empty_name_rejected() {
        assert!(CustomType::new("").validate().is_err());
    }
}
