//! The writer-module contract: one instance per stream, owning a small set
//! of datasets under its group.

use crate::hdf::{GroupRef, HdfError};
use nexflow_schema::message::FlatbufferMessage;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModuleConfigError {
    #[error("stream configuration is malformed: {0}")]
    Malformed(String),
}

#[derive(Debug, Error)]
pub enum ModuleInitError {
    #[error("dataset setup failed: {0}")]
    Hdf(#[from] HdfError),
    #[error("{0}")]
    Other(String),
}

/// Outcome of `init_hdf`/`reopen` for one stream. An error marks that
/// stream uninitialised; the job decides whether that is fatal.
pub type InitResult = Result<(), ModuleInitError>;

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("message does not decode: {0}")]
    BadMessage(String),
    #[error("message shape does not match the configured dataset: {0}")]
    ShapeMismatch(String),
    #[error("dataset append failed: {0}")]
    Hdf(#[from] HdfError),
    #[error("writer instance was not initialised")]
    NotInitialised,
    #[error("no writer instance for source key")]
    UnknownSource,
}

/// One writer instance, produced by a registry factory per stream.
///
/// Lifecycle: `parse_config` → `init_hdf` (or `reopen`) → any number of
/// `write` calls on the writer loop thread → `flush`/`close`. An instance
/// never reopens a dataset it did not create.
pub trait WriterModule: Send {
    /// Apply per-stream options from the `stream` node.
    fn parse_config(&mut self, config: &Value) -> Result<(), ModuleConfigError>;

    /// Create this stream's datasets under `group`.
    fn init_hdf(&mut self, group: &GroupRef) -> InitResult;

    /// Attach to datasets created by a prior `init_hdf` in the same file.
    fn reopen(&mut self, group: &GroupRef) -> InitResult;

    /// Append one decoded message.
    fn write(&mut self, msg: &FlatbufferMessage) -> Result<(), WriteError>;

    /// Append one message with its timestamp overridden; used for the
    /// pre-start candidate, which lands re-stamped to the window start.
    fn write_restamped(
        &mut self,
        msg: &FlatbufferMessage,
        timestamp_ns: u64,
    ) -> Result<(), WriteError>;

    fn flush(&mut self) -> Result<(), WriteError>;

    fn close(&mut self) -> Result<(), WriteError>;
}
