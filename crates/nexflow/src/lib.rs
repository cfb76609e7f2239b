//! The nexflow file-writer service: command ingress, job ownership and
//! status reporting around the streaming engine.

pub mod command_source;
pub mod config;
pub mod handler;
pub mod status;

pub use command_source::{CommandQueue, CommandSource, ConsumerCommandSource};
pub use config::Cli;
pub use handler::{Handler, HandlerConfig};
pub use status::{CollectingReporter, LogReporter, StatusEvent, StatusReporter};
