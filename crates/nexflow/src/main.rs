//! nexflow service entrypoint.

use anyhow::{Context, Result};
use clap::Parser;
use nexflow::command_source::CommandSource;
use nexflow::config::Cli;
use nexflow::handler::{Handler, HandlerConfig};
use nexflow::status::LogReporter;
use nexflow_protocol::types::{BrokerAddr, ServiceId};
use nexflow_schema::f144::F144Reader;
use nexflow_schema::registry::ReaderRegistry;
use nexflow_stream::cancel::CancellationToken;
use nexflow_stream::master::MasterConfig;
use nexflow_writer::registry::default_registry;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    nexflow_logging::init_logging(nexflow_logging::LogConfig {
        app_name: "nexflow",
        verbose: args.verbose,
    })?;
    info!("nexflow starting");

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, shutting down");
            signal_token.cancel();
        }
    });

    let loop_token = shutdown.clone();
    let service = tokio::task::spawn_blocking(move || service_loop(args, loop_token));
    match service.await {
        Ok(result) => result,
        Err(e) => {
            error!("Service loop panicked: {e}");
            Err(anyhow::anyhow!("service loop panicked"))
        }
    }
}

/// The blocking service loop: poll commands, tick reports, prune finished
/// jobs, exit on request or interrupt.
fn service_loop(args: Cli, shutdown: CancellationToken) -> Result<()> {
    let broker =
        BrokerAddr::parse(&args.command_broker).context("Invalid command broker address")?;

    let mut reader_registry = ReaderRegistry::new();
    reader_registry
        .register("f144", Arc::new(F144Reader))
        .map_err(|e| anyhow::anyhow!("reader registration: {e}"))?;

    let output_dir = args
        .output_dir
        .clone()
        .unwrap_or_else(|| nexflow_logging::nexflow_home().join("output"));
    std::fs::create_dir_all(&output_dir)
        .with_context(|| format!("Failed to create output directory {}", output_dir.display()))?;

    let reporter = Arc::new(LogReporter);
    let mut handler = Handler::new(HandlerConfig {
        service_id: ServiceId::new(args.service_id.clone()),
        reader_registry: Arc::new(reader_registry),
        writer_registry: default_registry(),
        consumer_factory: build_consumer_factory()?,
        reporter: reporter.clone(),
        master_config: MasterConfig {
            stop_leeway: Duration::from_secs(args.stop_leeway_secs),
            ..MasterConfig::default()
        },
        output_dir,
    });

    let mut command_source = build_command_source(&broker, &args.command_topic)?;
    let status_interval = Duration::from_secs(args.status_interval_secs.max(1));
    let mut next_report = Instant::now() + status_interval;

    info!(
        broker = %broker,
        topic = %args.command_topic,
        service_id = %args.service_id,
        "Listening for commands"
    );

    loop {
        if shutdown.is_cancelled() || handler.should_exit() {
            break;
        }
        match command_source.poll() {
            Ok(Some(payload)) => handler.handle_payload(&payload),
            Ok(None) => {}
            Err(e) => error!("Command channel error: {e}"),
        }
        if Instant::now() >= next_report {
            for report in handler.reports() {
                use nexflow::status::StatusReporter as _;
                reporter.job_report(&report);
            }
            handler.prune_removable();
            next_report = Instant::now() + status_interval;
        }
    }

    info!("Shutting down, stopping every job");
    handler.shutdown(Duration::from_secs(30));
    info!("nexflow stopped");
    Ok(())
}

#[cfg(feature = "kafka")]
fn build_consumer_factory() -> Result<Box<dyn nexflow_stream::consumer::ConsumerFactory>> {
    Ok(Box::new(nexflow_stream::kafka::KafkaConsumerFactory::default()))
}

#[cfg(not(feature = "kafka"))]
fn build_consumer_factory() -> Result<Box<dyn nexflow_stream::consumer::ConsumerFactory>> {
    anyhow::bail!("this build has no broker client; rebuild with the 'kafka' feature")
}

#[cfg(feature = "kafka")]
fn build_command_source(broker: &BrokerAddr, topic: &str) -> Result<Box<dyn CommandSource>> {
    let consumer = nexflow_stream::kafka::KafkaConsumer::new(
        broker,
        topic,
        0,
        nexflow_protocol::defaults::POLL_TIMEOUT,
    )
    .map_err(|e| anyhow::anyhow!("command consumer: {e}"))?;
    Ok(Box::new(nexflow::command_source::ConsumerCommandSource::new(
        Box::new(consumer),
    )))
}

#[cfg(not(feature = "kafka"))]
fn build_command_source(_broker: &BrokerAddr, _topic: &str) -> Result<Box<dyn CommandSource>> {
    anyhow::bail!("this build has no broker client; rebuild with the 'kafka' feature")
}
