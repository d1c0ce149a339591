// src/model/repository.rs
//! Tenant code repositories
//!
//! A repository answers "which source modules make up this deployment".
//! Tasks address code by application id plus a relative path under that
//! tenant's repository root, so both are part of the lookup.

use crate::model::builder::SourceModule;
use dashmap::DashMap;

/// Source of tenant code for model construction
pub trait CodeRepository: Send + Sync {
    /// Source modules of one deployment, load order preserved.
    ///
    /// Empty when the deployment is unknown; the resulting model is simply
    /// empty and every lookup against it misses.
    fn modules(&self, app_id: &str, relative_path: &str) -> Vec<SourceModule>;
}

/// In-process repository populated by the embedding application at startup
#[derive(Default)]
pub struct StaticCodeRepository {
    deployments: DashMap<(String, String), Vec<SourceModule>>,
}

impl StaticCodeRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the modules of a tenant's root deployment
    pub fn register_app(&self, app_id: impl Into<String>, modules: Vec<SourceModule>) {
        self.register_deployment(app_id, "", modules);
    }

    /// Register the modules of a specific deployment path
    pub fn register_deployment(
        &self,
        app_id: impl Into<String>,
        relative_path: impl Into<String>,
        modules: Vec<SourceModule>,
    ) {
        self.deployments
            .insert((app_id.into(), relative_path.into()), modules);
    }
}

impl CodeRepository for StaticCodeRepository {
    fn modules(&self, app_id: &str, relative_path: &str) -> Vec<SourceModule> {
        let exact = (app_id.to_string(), relative_path.to_string());
        if let Some(modules) = self.deployments.get(&exact) {
            return modules.clone();
        }
        // Fall back to the tenant's root deployment
        let root = (app_id.to_string(), String::new());
        self.deployments
            .get(&root)
            .map(|modules| modules.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module(path: &str) -> SourceModule {
        SourceModule::new(path, |_code| Ok(()))
    }

    #[test]
    fn test_exact_deployment_wins() {
        let repo = StaticCodeRepository::new();
        repo.register_app("app", vec![module("root.rs")]);
        repo.register_deployment("app", "v2", vec![module("v2.rs")]);

        assert_eq!(repo.modules("app", "v2")[0].path, "v2.rs");
        assert_eq!(repo.modules("app", "v1")[0].path, "root.rs");
    }

    #[test]
    fn test_unknown_app_is_empty() {
        let repo = StaticCodeRepository::new();
        assert!(repo.modules("nope", "").is_empty());
    }
}
