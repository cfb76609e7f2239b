//! Manual-testing tool: build f144 frames and start/stop commands, write
//! them to a file or produce them straight to a broker topic.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use nexflow_schema::f144::{LogFrameBuilder, ScalarValue};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[clap(author, version, about = "Build and send nexflow test messages")]
struct Cli {
    /// Broker to produce to, as //host:port; omit to write to --out
    #[clap(long)]
    broker: Option<String>,

    /// Topic to produce to
    #[clap(long)]
    topic: Option<String>,

    /// File to write the raw payload to when no broker is given
    #[clap(long)]
    out: Option<PathBuf>,

    #[clap(subcommand)]
    command: ToolCommand,
}

#[derive(Debug, Subcommand)]
enum ToolCommand {
    /// Encode one f144 scalar sample
    Frame {
        #[clap(long)]
        source: String,
        #[clap(long)]
        timestamp_ns: u64,
        #[clap(long)]
        value: f64,
    },
    /// Build a FileWriter_new command envelope
    Start {
        /// Job id; a random one is generated when omitted
        #[clap(long)]
        job_id: Option<String>,
        #[clap(long)]
        filename: String,
        #[clap(long, default_value = "//localhost:9092")]
        data_broker: String,
        #[clap(long)]
        topic: String,
        #[clap(long)]
        source: String,
        #[clap(long, default_value = "0")]
        start_time: u64,
        #[clap(long, default_value = "0")]
        stop_time: u64,
    },
    /// Build a FileWriter_stop command envelope
    Stop {
        #[clap(long)]
        job_id: String,
        #[clap(long)]
        stop_time: Option<u64>,
    },
}

fn main() -> Result<()> {
    let args = Cli::parse();
    let payload = match &args.command {
        ToolCommand::Frame {
            source,
            timestamp_ns,
            value,
        } => LogFrameBuilder::new(source.clone())
            .timestamp_ns(*timestamp_ns)
            .scalar(ScalarValue::F64(*value))
            .encode(),
        ToolCommand::Start {
            job_id,
            filename,
            data_broker,
            topic,
            source,
            start_time,
            stop_time,
        } => serde_json::to_vec_pretty(&serde_json::json!({
            "cmd": "FileWriter_new",
            "job_id": job_id
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            "broker": data_broker,
            "file_attributes": {"file_name": filename},
            "start_time": start_time,
            "stop_time": stop_time,
            "nexus_structure": {"children": [{
                "type": "group",
                "name": "entry",
                "attributes": [{"name": "NX_class", "values": "NXentry"}],
                "children": [{
                    "type": "group",
                    "name": source,
                    "children": [{
                        "type": "stream",
                        "stream": {
                            "topic": topic,
                            "source": source,
                            "writer_module": "f144",
                            "type": "float64"
                        }
                    }]
                }]
            }]}
        }))?,
        ToolCommand::Stop { job_id, stop_time } => {
            let mut value = serde_json::json!({
                "cmd": "FileWriter_stop",
                "job_id": job_id
            });
            if let Some(stop) = stop_time {
                value["stop_time"] = serde_json::json!(stop);
            }
            serde_json::to_vec_pretty(&value)?
        }
    };

    match (&args.broker, &args.topic) {
        (Some(broker), Some(topic)) => produce(broker, topic, &payload),
        _ => {
            let out = args
                .out
                .clone()
                .unwrap_or_else(|| PathBuf::from("payload.bin"));
            std::fs::write(&out, &payload)
                .with_context(|| format!("Failed to write {}", out.display()))?;
            eprintln!("wrote {} bytes to {}", payload.len(), out.display());
            Ok(())
        }
    }
}

#[cfg(feature = "kafka")]
fn produce(broker: &str, topic: &str, payload: &[u8]) -> Result<()> {
    use rdkafka::config::ClientConfig;
    use rdkafka::producer::{BaseProducer, BaseRecord, Producer};
    use std::time::Duration;

    let addr = nexflow_protocol::types::BrokerAddr::parse(broker)
        .map_err(|e| anyhow::anyhow!("broker: {e}"))?;
    let producer: BaseProducer = ClientConfig::new()
        .set("bootstrap.servers", addr.host_port())
        .create()
        .context("Failed to create producer")?;
    producer
        .send(BaseRecord::<(), [u8]>::to(topic).payload(payload))
        .map_err(|(e, _)| anyhow::anyhow!("produce: {e}"))?;
    producer.flush(Duration::from_secs(5))?;
    eprintln!("sent {} bytes to {}/{}", payload.len(), broker, topic);
    Ok(())
}

#[cfg(not(feature = "kafka"))]
fn produce(_broker: &str, _topic: &str, _payload: &[u8]) -> Result<()> {
    anyhow::bail!("this build has no broker client; rebuild with the 'kafka' feature")
}
