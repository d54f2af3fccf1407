//! Plugin registry
//!
//! Maps opaque plugin ids to factories, one table per stage kind. Lookups
//! are frequent and registrations rare, so each table sits behind its own
//! `RwLock`. Instantiation wires the plugin to a session-scoped child logger
//! and binds validated settings before the instance is handed to the runner.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::logging::PluginLogger;

use super::settings::bind_settings;
use super::{GradePlugin, PluginMetadata, TranscriptionPlugin, ValidationPlugin};

/// Factory for transcription plugin instances
pub trait TranscriberFactory: Send + Sync {
    /// Metadata of the plugin this factory builds
    fn metadata(&self) -> PluginMetadata;

    /// Construct a fresh instance bound to the given logger
    fn create(&self, logger: PluginLogger) -> Result<Box<dyn TranscriptionPlugin>>;
}

/// Factory for grading plugin instances
pub trait GraderFactory: Send + Sync {
    /// Metadata of the plugin this factory builds
    fn metadata(&self) -> PluginMetadata;

    /// Construct a fresh instance bound to the given logger
    fn create(&self, logger: PluginLogger) -> Result<Box<dyn GradePlugin>>;
}

/// Factory for validation plugin instances
pub trait ValidatorFactory: Send + Sync {
    /// Metadata of the plugin this factory builds
    fn metadata(&self) -> PluginMetadata;

    /// Construct a fresh instance bound to the given logger
    fn create(&self, logger: PluginLogger) -> Result<Box<dyn ValidationPlugin>>;
}

/// Registry resolving plugin ids to factories
pub struct PluginRegistry {
    transcribers: RwLock<HashMap<String, Arc<dyn TranscriberFactory>>>,
    graders: RwLock<HashMap<String, Arc<dyn GraderFactory>>>,
    validators: RwLock<HashMap<String, Arc<dyn ValidatorFactory>>>,
}

impl PluginRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            transcribers: RwLock::new(HashMap::new()),
            graders: RwLock::new(HashMap::new()),
            validators: RwLock::new(HashMap::new()),
        }
    }

    /// Register a transcriber factory; duplicate ids are an error
    pub fn register_transcriber(&self, factory: Arc<dyn TranscriberFactory>) -> Result<()> {
        let id = factory.metadata().id;
        let mut table = self.transcribers.write();
        if table.contains_key(&id) {
            return Err(Error::Config(format!("plugin '{id}' already registered")));
        }
        table.insert(id, factory);
        Ok(())
    }

    /// Register a grader factory; duplicate ids are an error
    pub fn register_grader(&self, factory: Arc<dyn GraderFactory>) -> Result<()> {
        let id = factory.metadata().id;
        let mut table = self.graders.write();
        if table.contains_key(&id) {
            return Err(Error::Config(format!("plugin '{id}' already registered")));
        }
        table.insert(id, factory);
        Ok(())
    }

    /// Register a validator factory; duplicate ids are an error
    pub fn register_validator(&self, factory: Arc<dyn ValidatorFactory>) -> Result<()> {
        let id = factory.metadata().id;
        let mut table = self.validators.write();
        if table.contains_key(&id) {
            return Err(Error::Config(format!("plugin '{id}' already registered")));
        }
        table.insert(id, factory);
        Ok(())
    }

    /// Look up a transcriber factory
    pub fn resolve_transcriber(&self, id: &str) -> Option<Arc<dyn TranscriberFactory>> {
        self.transcribers.read().get(id).cloned()
    }

    /// Look up a grader factory
    pub fn resolve_grader(&self, id: &str) -> Option<Arc<dyn GraderFactory>> {
        self.graders.read().get(id).cloned()
    }

    /// Look up a validator factory
    pub fn resolve_validator(&self, id: &str) -> Option<Arc<dyn ValidatorFactory>> {
        self.validators.read().get(id).cloned()
    }

    /// Instantiate and configure a transcriber
    ///
    /// Resolution, construction, settings binding, and configuration each
    /// fail with their own error kind so the runner can report precise
    /// failure reasons.
    pub fn instantiate_transcriber(
        &self,
        id: &str,
        logger: PluginLogger,
        settings: &Map<String, Value>,
    ) -> Result<Box<dyn TranscriptionPlugin>> {
        let factory = self
            .resolve_transcriber(id)
            .ok_or_else(|| Error::PluginNotFound(id.to_string()))?;
        let mut plugin = factory.create(logger).map_err(|e| Error::PluginInit {
            plugin_id: id.to_string(),
            message: e.to_string(),
        })?;
        let bound = bind_settings(&plugin.settings_schema(), settings)?;
        plugin
            .configure(&bound)
            .map_err(|e| Error::Settings(format!("{id}: {e}")))?;
        Ok(plugin)
    }

    /// Instantiate and configure a grader
    pub fn instantiate_grader(
        &self,
        id: &str,
        logger: PluginLogger,
        settings: &Map<String, Value>,
    ) -> Result<Box<dyn GradePlugin>> {
        let factory = self
            .resolve_grader(id)
            .ok_or_else(|| Error::PluginNotFound(id.to_string()))?;
        let mut plugin = factory.create(logger).map_err(|e| Error::PluginInit {
            plugin_id: id.to_string(),
            message: e.to_string(),
        })?;
        let bound = bind_settings(&plugin.settings_schema(), settings)?;
        plugin
            .configure(&bound)
            .map_err(|e| Error::Settings(format!("{id}: {e}")))?;
        Ok(plugin)
    }

    /// Instantiate and configure a validator
    pub fn instantiate_validator(
        &self,
        id: &str,
        logger: PluginLogger,
        settings: &Map<String, Value>,
    ) -> Result<Box<dyn ValidationPlugin>> {
        let factory = self
            .resolve_validator(id)
            .ok_or_else(|| Error::PluginNotFound(id.to_string()))?;
        let mut plugin = factory.create(logger).map_err(|e| Error::PluginInit {
            plugin_id: id.to_string(),
            message: e.to_string(),
        })?;
        let bound = bind_settings(&plugin.settings_schema(), settings)?;
        plugin
            .configure(&bound)
            .map_err(|e| Error::Settings(format!("{id}: {e}")))?;
        Ok(plugin)
    }

    /// Metadata of a plugin, searching all kinds
    pub fn metadata(&self, id: &str) -> Option<PluginMetadata> {
        if let Some(factory) = self.transcribers.read().get(id) {
            return Some(factory.metadata());
        }
        if let Some(factory) = self.graders.read().get(id) {
            return Some(factory.metadata());
        }
        if let Some(factory) = self.validators.read().get(id) {
            return Some(factory.metadata());
        }
        None
    }

    /// Metadata of every registered plugin, unordered
    pub fn list(&self) -> Vec<PluginMetadata> {
        let mut all: Vec<PluginMetadata> = Vec::new();
        all.extend(self.transcribers.read().values().map(|f| f.metadata()));
        all.extend(self.graders.read().values().map(|f| f.metadata()));
        all.extend(self.validators.read().values().map(|f| f.metadata()));
        all
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::IndexedEventBus;
    use crate::logging::{LogQueue, SessionLogger};
    use crate::plugin::builtin;
    use uuid::Uuid;

    fn test_logger() -> PluginLogger {
        let bus = Arc::new(IndexedEventBus::new());
        let queue = Arc::new(LogQueue::new(bus));
        SessionLogger::new(Uuid::new_v4(), queue).get_child("test")
    }

    #[tokio::test]
    async fn test_register_and_resolve_builtins() {
        let registry = PluginRegistry::new();
        builtin::register_builtins(&registry).unwrap();

        assert!(registry
            .resolve_transcriber("gradekit.builtin.plain-text-transcriber")
            .is_some());
        assert!(registry
            .resolve_grader("gradekit.builtin.keyword-grader")
            .is_some());
        assert!(registry
            .resolve_validator("gradekit.builtin.score-range-validator")
            .is_some());
        assert!(registry.resolve_transcriber("nope").is_none());
        assert_eq!(registry.list().len(), 3);
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let registry = PluginRegistry::new();
        builtin::register_builtins(&registry).unwrap();
        let err = builtin::register_builtins(&registry).unwrap_err();
        assert!(err.to_string().contains("already registered"));
    }

    #[tokio::test]
    async fn test_instantiate_unknown_plugin() {
        let registry = PluginRegistry::new();
        let err = registry
            .instantiate_transcriber("ghost", test_logger(), &Map::new())
            .unwrap_err();
        assert!(matches!(err, Error::PluginNotFound(_)));
    }

    #[tokio::test]
    async fn test_instantiate_rejects_bad_settings() {
        let registry = PluginRegistry::new();
        builtin::register_builtins(&registry).unwrap();

        let mut settings = Map::new();
        settings.insert("no_such_field".to_string(), serde_json::json!(1));
        let err = registry
            .instantiate_grader("gradekit.builtin.keyword-grader", test_logger(), &settings)
            .unwrap_err();
        assert!(matches!(err, Error::Settings(_)));
    }
}
