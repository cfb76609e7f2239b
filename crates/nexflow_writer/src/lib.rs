//! Writer side of the nexflow service: the dataset-append contract, the
//! writer-module framework, the reference log writer and the per-job
//! writer task.
//!
//! The HDF5 library itself stays behind the narrow contract in [`hdf`]:
//! hierarchical groups, attributes and typed append-only datasets. The
//! in-memory implementation serialises a NeXus-shaped snapshot on flush
//! and close, which is all the engine and its tests require.

pub mod f144_log;
pub mod hdf;
pub mod module;
pub mod registry;
pub mod task;

pub use f144_log::LogWriter;
pub use hdf::{DatasetRef, DatasetValues, GroupRef, HdfError, NexusFile};
pub use module::{InitResult, ModuleConfigError, ModuleInitError, WriteError, WriterModule};
pub use registry::{WriterRegistry, WriterRegistryError};
pub use task::{StreamInfo, TaskError, WriterTask};
