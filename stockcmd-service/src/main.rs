//! Inventory command consumer.
//!
//! ```text
//! stockcmd-service [run]                  consume every family until SIGINT/SIGTERM
//! stockcmd-service dead-letters <family>  list dead letters as JSON lines
//! stockcmd-service import <file.json>     publish a catalogue export
//! ```
//!
//! Exits 0 after a graceful drain and 1 on configuration errors or an
//! unrecoverable startup failure. Without `STOCKCMD_FAIL_FAST` the service
//! waits for an unreachable database instead of exiting.

mod consumers;
mod errors;
mod operator;
mod settings;
mod startup;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use stockcmd::logging::init_logging;
use stockcmd::{shutdown_channel, CommandPublisher, ConfigSource, ShutdownSignal, ShutdownTrigger};
use stockcmd_inventory::Reconciler;
use stockcmd_postgres::{PostgresBroker, PostgresError, PostgresReadStore, PostgresWriteStore};
use tracing::{error, info};

use crate::errors::{ServiceError, ServiceResult};
use crate::settings::ServiceSettings;

#[derive(Parser)]
#[command(name = "stockcmd-service", about = "Inventory command consumer")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Consume every command family until interrupted
    Run,
    /// List the dead letters of a command family
    DeadLetters {
        /// Command family, e.g. composent
        family: String,
    },
    /// Publish the assets of a catalogue export
    Import {
        /// JSON array of catalogue rows
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let source = ConfigSource::env();

    let format = settings::log_format(&source);
    if let Err(error) = init_logging(format.as_ref().copied().unwrap_or_default()) {
        eprintln!("failed to install the log subscriber: {error}");
        return ExitCode::FAILURE;
    }

    let result = match format.and_then(|_| ServiceSettings::from_source(&source)) {
        Ok(settings) => execute(cli.command.unwrap_or(Command::Run), &settings).await,
        Err(config_error) => Err(config_error.into()),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(service_error) => {
            error!(error = %error_chain(&service_error), "stockcmd-service failed");
            ExitCode::FAILURE
        }
    }
}

fn error_chain(error: &dyn std::error::Error) -> String {
    let mut chain = error.to_string();
    let mut cause = error.source();
    while let Some(inner) = cause {
        chain.push_str(": ");
        chain.push_str(&inner.to_string());
        cause = inner.source();
    }
    chain
}

async fn execute(command: Command, settings: &ServiceSettings) -> ServiceResult<()> {
    let (trigger, mut signal) = shutdown_channel();
    tokio::spawn(trigger_on_termination(trigger));

    let opened = startup::open_with_retry(
        &settings.consumer,
        "open database",
        |error: &PostgresError| matches!(error, PostgresError::ConnectionFailed(_)),
        || async move {
            let broker = PostgresBroker::open(settings.postgres.clone()).await?;
            broker.migrate().await?;
            Ok::<_, PostgresError>(broker)
        },
        &mut signal,
    )
    .await?;
    let Some(broker) = opened else {
        return Ok(());
    };

    match command {
        Command::Run => run(&broker, settings, signal).await,
        Command::DeadLetters { family } => {
            let naming = &settings.publisher.naming;
            let report = tokio::select! {
                report = operator::dead_letter_report(&broker, naming, &family) => report?,
                () = signal.triggered() => return Err(ServiceError::Interrupted),
            };
            for line in report {
                println!("{line}");
            }
            Ok(())
        }
        Command::Import { file } => {
            let publisher = CommandPublisher::new(broker, settings.publisher.clone());
            let result = tokio::select! {
                result = operator::import_catalogue(&publisher, &file) => result.map(|_| ()),
                () = signal.triggered() => Err(ServiceError::Interrupted),
            };
            publisher.close().await;
            result
        }
    }
}

async fn run(
    broker: &PostgresBroker,
    settings: &ServiceSettings,
    signal: ShutdownSignal,
) -> ServiceResult<()> {
    let reconciler = Reconciler::new(
        Arc::new(PostgresWriteStore::new(broker.pool().clone())),
        Arc::new(PostgresReadStore::new(broker.pool().clone())),
    );

    info!(system = settings.publisher.naming.system(), "starting consumers");
    consumers::consume_families(
        broker,
        &reconciler,
        &settings.publisher.naming,
        &settings.consumer,
        signal,
    )
    .await?;
    info!("all consumers drained");
    Ok(())
}

async fn trigger_on_termination(trigger: ShutdownTrigger) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
                    _ = terminate.recv() => info!("received SIGTERM"),
                }
            }
            Err(error) => {
                error!(error = %error, "cannot listen for SIGTERM, only SIGINT stops the service");
                wait_for_ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    wait_for_ctrl_c().await;

    trigger.trigger();
}

async fn wait_for_ctrl_c() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        error!(error = %error, "cannot listen for SIGINT, the service must be killed");
        std::future::pending::<()>().await;
    }
    info!("received SIGINT");
}
