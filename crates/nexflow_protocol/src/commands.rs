//! Command envelopes for the job control channel.
//!
//! The wire format is JSON with a `cmd` discriminator. Parsing happens once
//! at ingress; everything past the handler works with the tagged
//! [`Command`] value.

use crate::nexus::NexusStructure;
use crate::types::{BrokerAddr, JobId, TimeStampMs};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("command is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown command '{0}'")]
    UnknownCommand(String),
    #[error("start command is missing a job id")]
    MissingJobId,
    #[error("start command is missing a file name")]
    MissingFilename,
    #[error("start command has an empty nexus structure")]
    MissingNexusStructure,
    #[error("start command broker is invalid: {0}")]
    BadBroker(#[from] crate::types::BrokerAddrError),
}

/// File-level attributes from the start command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct FileAttributes {
    #[serde(default)]
    pub file_name: String,
}

/// A validated start command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartRequest {
    pub job_id: JobId,
    #[serde(default)]
    pub service_id: Option<String>,
    pub broker: BrokerAddr,
    pub filename: String,
    pub start_time: TimeStampMs,
    /// `TimeStampMs::MAX` when the command leaves the stop time open.
    pub stop_time: TimeStampMs,
    #[serde(default)]
    pub use_hdf_swmr: bool,
    #[serde(default)]
    pub abort_on_uninitialised_stream: bool,
    pub nexus_structure: NexusStructure,
}

/// A validated stop command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopRequest {
    pub job_id: JobId,
    #[serde(default)]
    pub service_id: Option<String>,
    /// `None` means stop now.
    pub stop_time: Option<TimeStampMs>,
}

/// Every command the handler understands, parsed once at ingress.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Start(StartRequest),
    Stop(StopRequest),
    StopAll { service_id: Option<String> },
    Exit { service_id: Option<String> },
}

impl Command {
    pub fn service_id(&self) -> Option<&str> {
        match self {
            Command::Start(start) => start.service_id.as_deref(),
            Command::Stop(stop) => stop.service_id.as_deref(),
            Command::StopAll { service_id } | Command::Exit { service_id } => {
                service_id.as_deref()
            }
        }
    }

    /// Parse and validate a raw command payload.
    ///
    /// `current_time` substitutes for an absent or zero start time, so the
    /// caller controls the clock (the tests pass a fixed instant).
    pub fn parse(payload: &[u8], current_time: TimeStampMs) -> Result<Self, CommandError> {
        let envelope: Envelope = serde_json::from_slice(payload)?;
        match envelope.cmd.as_str() {
            "FileWriter_new" => {
                let raw: RawStart = serde_json::from_slice(payload)?;
                Ok(Command::Start(raw.validate(current_time)?))
            }
            "FileWriter_stop" => {
                let raw: RawStop = serde_json::from_slice(payload)?;
                Ok(Command::Stop(raw.validate()?))
            }
            "FileWriter_stop_all" => Ok(Command::StopAll {
                service_id: envelope.service_id,
            }),
            "FileWriter_exit" => Ok(Command::Exit {
                service_id: envelope.service_id,
            }),
            other => Err(CommandError::UnknownCommand(other.to_string())),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    cmd: String,
    #[serde(default)]
    service_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawStart {
    #[serde(default)]
    service_id: Option<String>,
    #[serde(default)]
    job_id: String,
    #[serde(default)]
    broker: String,
    #[serde(default)]
    file_attributes: FileAttributes,
    #[serde(default)]
    start_time: u64,
    #[serde(default)]
    stop_time: u64,
    #[serde(default)]
    use_hdf_swmr: bool,
    #[serde(default)]
    abort_on_uninitialised_stream: bool,
    #[serde(default)]
    nexus_structure: NexusStructure,
}

impl RawStart {
    fn validate(self, current_time: TimeStampMs) -> Result<StartRequest, CommandError> {
        if self.job_id.is_empty() {
            return Err(CommandError::MissingJobId);
        }
        if self.file_attributes.file_name.is_empty() {
            return Err(CommandError::MissingFilename);
        }
        if self.nexus_structure.is_empty() {
            return Err(CommandError::MissingNexusStructure);
        }
        let broker = BrokerAddr::parse(&self.broker)?;
        let start_time = if self.start_time == 0 {
            current_time
        } else {
            TimeStampMs::new(self.start_time)
        };
        let stop_time = if self.stop_time == 0 {
            TimeStampMs::MAX
        } else {
            TimeStampMs::new(self.stop_time)
        };
        Ok(StartRequest {
            job_id: JobId::new(self.job_id),
            service_id: self.service_id,
            broker,
            filename: self.file_attributes.file_name,
            start_time,
            stop_time,
            use_hdf_swmr: self.use_hdf_swmr,
            abort_on_uninitialised_stream: self.abort_on_uninitialised_stream,
            nexus_structure: self.nexus_structure,
        })
    }
}

#[derive(Debug, Deserialize)]
struct RawStop {
    #[serde(default)]
    service_id: Option<String>,
    #[serde(default)]
    job_id: String,
    #[serde(default)]
    stop_time: Option<u64>,
}

impl RawStop {
    fn validate(self) -> Result<StopRequest, CommandError> {
        if self.job_id.is_empty() {
            return Err(CommandError::MissingJobId);
        }
        Ok(StopRequest {
            job_id: JobId::new(self.job_id),
            service_id: self.service_id,
            stop_time: self.stop_time.map(TimeStampMs::new),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: TimeStampMs = TimeStampMs::new(987_654_321);

    fn start_json() -> serde_json::Value {
        serde_json::json!({
            "cmd": "FileWriter_new",
            "service_id": "filewriter1",
            "job_id": "qw3rty",
            "broker": "//somehost:1234",
            "file_attributes": {"file_name": "a-dummy-name-01.h5"},
            "start_time": 123_456_789_000u64,
            "stop_time": 123_456_790_000u64,
            "nexus_structure": {"children": [
                {"type": "group", "name": "entry", "children": []}
            ]}
        })
    }

    fn parse(value: serde_json::Value) -> Result<Command, CommandError> {
        Command::parse(&serde_json::to_vec(&value).unwrap(), NOW)
    }

    #[test]
    fn start_fields_extracted() {
        let cmd = parse(start_json()).unwrap();
        let Command::Start(start) = cmd else {
            panic!("expected start");
        };
        assert_eq!(start.job_id.as_str(), "qw3rty");
        assert_eq!(start.filename, "a-dummy-name-01.h5");
        assert_eq!(start.broker.host_port(), "somehost:1234");
        assert_eq!(start.broker.port, 1234);
        assert_eq!(start.start_time, TimeStampMs::new(123_456_789_000));
        assert_eq!(start.stop_time, TimeStampMs::new(123_456_790_000));
        assert!(!start.use_hdf_swmr);
    }

    #[test]
    fn start_without_job_id_rejected() {
        let mut value = start_json();
        value["job_id"] = serde_json::json!("");
        assert!(matches!(parse(value), Err(CommandError::MissingJobId)));
    }

    #[test]
    fn start_without_filename_rejected() {
        let mut value = start_json();
        value["file_attributes"]["file_name"] = serde_json::json!("");
        assert!(matches!(parse(value), Err(CommandError::MissingFilename)));
    }

    #[test]
    fn start_without_structure_rejected() {
        let mut value = start_json();
        value["nexus_structure"] = serde_json::json!({"children": []});
        assert!(matches!(
            parse(value),
            Err(CommandError::MissingNexusStructure)
        ));
    }

    #[test]
    fn start_with_bad_broker_rejected() {
        let mut value = start_json();
        value["broker"] = serde_json::json!("1234:somehost");
        assert!(matches!(parse(value), Err(CommandError::BadBroker(_))));
    }

    #[test]
    fn zero_start_time_uses_current_time() {
        let mut value = start_json();
        value["start_time"] = serde_json::json!(0);
        let Command::Start(start) = parse(value).unwrap() else {
            panic!("expected start");
        };
        assert_eq!(start.start_time, NOW);
    }

    #[test]
    fn zero_stop_time_means_open_ended() {
        let mut value = start_json();
        value["stop_time"] = serde_json::json!(0);
        let Command::Start(start) = parse(value).unwrap() else {
            panic!("expected start");
        };
        assert_eq!(start.stop_time, TimeStampMs::MAX);
    }

    #[test]
    fn stop_fields_extracted() {
        let cmd = parse(serde_json::json!({
            "cmd": "FileWriter_stop",
            "job_id": "qw3rty",
            "stop_time": 123_456_790_000u64
        }))
        .unwrap();
        let Command::Stop(stop) = cmd else {
            panic!("expected stop");
        };
        assert_eq!(stop.job_id.as_str(), "qw3rty");
        assert_eq!(stop.stop_time, Some(TimeStampMs::new(123_456_790_000)));
        assert_eq!(stop.service_id, None);
    }

    #[test]
    fn stop_without_job_id_rejected() {
        let result = parse(serde_json::json!({
            "cmd": "FileWriter_stop",
            "job_id": ""
        }));
        assert!(matches!(result, Err(CommandError::MissingJobId)));
    }

    #[test]
    fn stop_all_and_exit_parse() {
        assert!(matches!(
            parse(serde_json::json!({"cmd": "FileWriter_stop_all"})),
            Ok(Command::StopAll { .. })
        ));
        assert!(matches!(
            parse(serde_json::json!({"cmd": "FileWriter_exit", "service_id": "fw2"})),
            Ok(Command::Exit { service_id: Some(id) }) if id == "fw2"
        ));
    }

    #[test]
    fn unknown_command_rejected() {
        assert!(matches!(
            parse(serde_json::json!({"cmd": "FileWriter_launch"})),
            Err(CommandError::UnknownCommand(_))
        ));
    }
}
