//! Registry mapping schema tags to readers.
//!
//! An explicitly constructed value passed into the handler; tests build
//! their own instead of sharing process-wide state.

use crate::message::FlatbufferMessage;
use crate::reader::FlatbufferReader;
use nexflow_protocol::types::SchemaTag;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("schema tag '{0}' is already registered")]
    DuplicateRegistration(String),
    #[error("registry key must be exactly 4 bytes, got {0} bytes")]
    InvalidKey(usize),
}

/// Tag → reader table, read-only after construction.
#[derive(Default, Clone)]
pub struct ReaderRegistry {
    readers: HashMap<SchemaTag, Arc<dyn FlatbufferReader>>,
}

impl ReaderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a reader under a 4-byte key.
    pub fn register(
        &mut self,
        key: &str,
        reader: Arc<dyn FlatbufferReader>,
    ) -> Result<(), RegistryError> {
        let tag = SchemaTag::parse(key.as_bytes())
            .map_err(|_| RegistryError::InvalidKey(key.len()))?;
        if self.readers.contains_key(&tag) {
            return Err(RegistryError::DuplicateRegistration(key.to_string()));
        }
        self.readers.insert(tag, reader);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.readers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readers.is_empty()
    }

    /// Look up by tag. Unknown tags are a drop-with-counter at the call
    /// site, never fatal.
    pub fn find(&self, tag: SchemaTag) -> Option<&Arc<dyn FlatbufferReader>> {
        self.readers.get(&tag)
    }

    /// Look up by message; `None` for messages too short to carry a tag.
    pub fn find_for_message(
        &self,
        msg: &FlatbufferMessage,
    ) -> Option<&Arc<dyn FlatbufferReader>> {
        self.find(msg.schema_tag()?)
    }
}

impl std::fmt::Debug for ReaderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tags: Vec<String> = self.readers.keys().map(|t| t.to_string()).collect();
        f.debug_struct("ReaderRegistry").field("tags", &tags).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct DummyReader;

    impl FlatbufferReader for DummyReader {
        fn verify(&self, _msg: &FlatbufferMessage) -> bool {
            true
        }
        fn source_name(&self, _msg: &FlatbufferMessage) -> String {
            String::new()
        }
        fn timestamp_ns(&self, _msg: &FlatbufferMessage) -> u64 {
            0
        }
    }

    #[test]
    fn simple_registration() {
        let mut registry = ReaderRegistry::new();
        assert_eq!(registry.len(), 0);
        registry.register("temp", Arc::new(DummyReader)).unwrap();
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn same_key_registration_fails() {
        let mut registry = ReaderRegistry::new();
        registry.register("temp", Arc::new(DummyReader)).unwrap();
        assert_eq!(
            registry.register("temp", Arc::new(DummyReader)),
            Err(RegistryError::DuplicateRegistration("temp".to_string()))
        );
    }

    #[test]
    fn key_too_short_fails() {
        let mut registry = ReaderRegistry::new();
        assert_eq!(
            registry.register("tem", Arc::new(DummyReader)),
            Err(RegistryError::InvalidKey(3))
        );
    }

    #[test]
    fn key_too_long_fails() {
        let mut registry = ReaderRegistry::new();
        assert_eq!(
            registry.register("tempp", Arc::new(DummyReader)),
            Err(RegistryError::InvalidKey(5))
        );
    }

    #[test]
    fn str_key_found() {
        let mut registry = ReaderRegistry::new();
        registry.register("t3mp", Arc::new(DummyReader)).unwrap();
        let tag = SchemaTag::from_bytes(*b"t3mp");
        assert!(registry.find(tag).is_some());
    }

    #[test]
    fn str_key_not_found() {
        let mut registry = ReaderRegistry::new();
        registry.register("t3mp", Arc::new(DummyReader)).unwrap();
        let tag = SchemaTag::from_bytes(*b"fail");
        assert!(registry.find(tag).is_none());
    }

    #[test]
    fn msg_key_found() {
        let mut registry = ReaderRegistry::new();
        registry.register("t3mp", Arc::new(DummyReader)).unwrap();
        let msg = FlatbufferMessage::from_bytes(b"dumyt3mpdata".to_vec());
        assert!(registry.find_for_message(&msg).is_some());
    }

    #[test]
    fn msg_key_not_found() {
        let mut registry = ReaderRegistry::new();
        registry.register("t3mp", Arc::new(DummyReader)).unwrap();
        let msg = FlatbufferMessage::from_bytes(b"dumyfaildata".to_vec());
        assert!(registry.find_for_message(&msg).is_none());
    }

    #[test]
    fn short_msg_not_found() {
        let mut registry = ReaderRegistry::new();
        registry.register("t3mp", Arc::new(DummyReader)).unwrap();
        let msg = FlatbufferMessage::from_bytes(b"dumy".to_vec());
        assert!(registry.find_for_message(&msg).is_none());
    }
}
