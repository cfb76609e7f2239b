//! Command-line options for the nexflow service binary.

use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[clap(author, version, about = "Streaming NeXus file-writer service")]
pub struct Cli {
    /// Broker carrying the command topic, as //host:port or host:port
    #[clap(long, env = "NEXFLOW_BROKER", default_value = "//localhost:9092")]
    pub command_broker: String,

    /// Topic the service polls for start/stop commands
    #[clap(long, env = "NEXFLOW_COMMAND_TOPIC", default_value = "nexflow_commands")]
    pub command_topic: String,

    /// Identity of this process; commands carrying a different service id
    /// are ignored
    #[clap(long, env = "NEXFLOW_SERVICE_ID", default_value = "")]
    pub service_id: String,

    /// Directory for output files named with relative paths
    #[clap(long, env = "NEXFLOW_OUTPUT_DIR")]
    pub output_dir: Option<PathBuf>,

    /// Seconds between periodic job status reports
    #[clap(long, default_value = "2")]
    pub status_interval_secs: u64,

    /// Grace seconds after the stop time during which late in-window
    /// messages are still accepted
    #[clap(long, default_value = "5")]
    pub stop_leeway_secs: u64,

    /// Log verbosely to the console as well as the log file
    #[clap(long, short)]
    pub verbose: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse() {
        let cli = Cli::parse_from(["nexflow"]);
        assert_eq!(cli.command_topic, "nexflow_commands");
        assert_eq!(cli.status_interval_secs, 2);
        assert_eq!(cli.stop_leeway_secs, 5);
        assert!(!cli.verbose);
    }

    #[test]
    fn options_override_defaults() {
        let cli = Cli::parse_from([
            "nexflow",
            "--command-broker",
            "//broker:9092",
            "--service-id",
            "fw-42",
            "--verbose",
        ]);
        assert_eq!(cli.command_broker, "//broker:9092");
        assert_eq!(cli.service_id, "fw-42");
        assert!(cli.verbose);
    }
}
