//! Shared protocol types for the nexflow file-writer service.
//!
//! Commands arrive as JSON envelopes on the command topic, are parsed once
//! at ingress into the tagged [`Command`] enum, and everything downstream
//! works with typed values. This crate also carries the canonical
//! identifier/time newtypes, the NeXus structure tree, status payloads,
//! metric keys and compile-time defaults.

pub mod commands;
pub mod defaults;
pub mod metrics;
pub mod nexus;
pub mod status;
pub mod types;

// Re-export types for convenience
pub use commands::{Command, CommandError, StartRequest, StopRequest};
pub use nexus::{DatasetSpec, NexusAttribute, NexusNode, NexusStructure, StreamSettings};
pub use status::{JobOutcome, JobReport, JobResult, PartitionCounters};
pub use types::{BrokerAddr, JobId, SchemaTag, ServiceId, SourceKey, TimeStampMs};
