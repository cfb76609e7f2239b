//! Owned message bytes plus the broker metadata the partition loop needs.

use nexflow_protocol::types::{SchemaTag, TimeStampMs};

/// Broker-side metadata attached to a polled message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MessageMetaData {
    /// Broker timestamp in milliseconds.
    pub timestamp: TimeStampMs,
    pub partition: i32,
    pub offset: i64,
}

/// One message as handed from the consumer to the partition.
///
/// The buffer is owned from poll until the filter accepts or rejects it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlatbufferMessage {
    data: Vec<u8>,
    meta: MessageMetaData,
}

impl FlatbufferMessage {
    pub fn new(data: Vec<u8>, meta: MessageMetaData) -> Self {
        Self { data, meta }
    }

    /// A message without broker metadata, for tests and tools.
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self {
            data,
            meta: MessageMetaData::default(),
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn meta(&self) -> &MessageMetaData {
        &self.meta
    }

    /// The schema tag at bytes 4..8; `None` when the buffer is too short
    /// to carry one.
    pub fn schema_tag(&self) -> Option<SchemaTag> {
        if self.data.len() < 8 {
            return None;
        }
        SchemaTag::parse(&self.data[4..8]).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_is_read_at_offset_four() {
        let msg = FlatbufferMessage::from_bytes(b"dumyt3mpdata".to_vec());
        assert_eq!(msg.schema_tag(), Some(SchemaTag::from_bytes(*b"t3mp")));
    }

    #[test]
    fn short_message_has_no_tag() {
        let msg = FlatbufferMessage::from_bytes(b"dumy".to_vec());
        assert_eq!(msg.schema_tag(), None);
    }
}
