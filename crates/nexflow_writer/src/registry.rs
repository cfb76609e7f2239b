//! Registry mapping writer-module names to factories.

use crate::module::WriterModule;
use nexflow_protocol::types::SchemaTag;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WriterRegistryError {
    #[error("writer module '{0}' is already registered")]
    DuplicateRegistration(String),
    #[error("writer module name must not be empty")]
    EmptyName,
}

type Factory = Arc<dyn Fn() -> Box<dyn WriterModule> + Send + Sync>;

/// Module-name → factory table, read-only after construction.
///
/// Each entry also records the schema tag the module consumes, so the
/// writer task can derive source keys without decoding a message.
#[derive(Clone, Default)]
pub struct WriterRegistry {
    factories: HashMap<String, (SchemaTag, Factory)>,
}

impl WriterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(
        &mut self,
        name: &str,
        schema_tag: SchemaTag,
        factory: F,
    ) -> Result<(), WriterRegistryError>
    where
        F: Fn() -> Box<dyn WriterModule> + Send + Sync + 'static,
    {
        if name.is_empty() {
            return Err(WriterRegistryError::EmptyName);
        }
        if self.factories.contains_key(name) {
            return Err(WriterRegistryError::DuplicateRegistration(name.to_string()));
        }
        self.factories
            .insert(name.to_string(), (schema_tag, Arc::new(factory)));
        Ok(())
    }

    /// Instantiate a module by name; `None` for unknown modules.
    pub fn instantiate(&self, name: &str) -> Option<(SchemaTag, Box<dyn WriterModule>)> {
        self.factories
            .get(name)
            .map(|(tag, factory)| (*tag, factory()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl std::fmt::Debug for WriterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&String> = self.factories.keys().collect();
        f.debug_struct("WriterRegistry")
            .field("modules", &names)
            .finish()
    }
}

/// The registry with every built-in module registered.
pub fn default_registry() -> WriterRegistry {
    let mut registry = WriterRegistry::new();
    // Registration of built-ins cannot collide.
    registry
        .register("f144", nexflow_schema::f144::SCHEMA_TAG, || {
            Box::new(crate::f144_log::LogWriter::new())
        })
        .unwrap_or_else(|e| unreachable!("builtin registration: {e}"));
    registry
}
