//! Message schemas for the nexflow streaming engine.
//!
//! A message is a blob of bytes with a 4-byte schema identifier at offset
//! 4 (the flatbuffer file-identifier position). The [`ReaderRegistry`]
//! maps that identifier to a [`FlatbufferReader`] that can verify the
//! payload and pull out the source name and data timestamp without a full
//! decode. The `f144` module carries the reference log-frame codec.

pub mod f144;
pub mod message;
pub mod reader;
pub mod registry;

pub use f144::{
    ArrayValue, ElementType, F144Reader, LogFrame, LogFrameBuilder, LogValue, ScalarValue,
};
pub use message::{FlatbufferMessage, MessageMetaData};
pub use reader::FlatbufferReader;
pub use registry::{ReaderRegistry, RegistryError};
