use clap::{Parser, Subcommand};
use smile_consumer::{ConsumerError, ConsumerRuntime, NatsTransport};
use std::future::Future;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

pub mod settings;

/// How long exit waits on blocking work that outlived the drain timeout.
const RUNTIME_SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// SMILE Client
///
/// Consumes SMILE events from a NATS JetStream durable consumer and hands each message
/// to the configured handler.
#[derive(Parser, Debug)]
#[command(name = "smile-client")]
#[command(about = "Durable NATS JetStream listener for SMILE events")]
#[command(version)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start consuming messages until interrupted
    StartListener(ListenerArgs),
}

#[derive(clap::Args, Debug, Clone)]
pub struct ListenerArgs {
    /// Configuration file path (JSON object of settings)
    #[arg(long)]
    pub config: PathBuf,

    /// NATS subject to consume from
    #[arg(long)]
    pub subject: String,

    /// Replay messages published on or after this date (YYYY-MM-DD, UTC)
    #[arg(long)]
    pub start_date: Option<String>,

    /// Set logging level to DEBUG
    #[arg(long)]
    pub debug: bool,
}

/// Failures that end the process, each with its exit code.
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("{0:#}")]
    ConfigFile(anyhow::Error),

    #[error(transparent)]
    Consumer(#[from] ConsumerError),
}

impl CliError {
    pub fn exit_code(&self) -> u8 {
        match self {
            CliError::ConfigFile(_) => 2,
            CliError::Consumer(e) => u8::try_from(e.exit_code()).unwrap_or(1),
        }
    }
}

/// Initialize tracing. `RUST_LOG` wins unless `--debug` is given.
fn init_tracing(debug: bool) {
    let filter = if debug {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn start_listener(args: ListenerArgs) -> Result<(), CliError> {
    let settings = settings::load_settings(&args.config).map_err(CliError::ConfigFile)?;
    let config = settings::client_config(&settings, &args.subject, args.start_date.as_deref())
        .map_err(ConsumerError::from)?;

    info!(?config, "Starting listener on subject '{}'", args.subject);
    if let Some(start) = config.start_time() {
        info!("Start date: {}", start);
    }

    let summary = ConsumerRuntime::new(config, Arc::new(NatsTransport::new()))
        .run()
        .await?;

    match serde_json::to_string(&summary) {
        Ok(json) => info!(summary = %json, "Listener stopped"),
        Err(_) => info!(?summary, "Listener stopped"),
    }
    Ok(())
}

/// Drive `future` on a fresh multi-threaded runtime.
///
/// A handler still running on a blocking thread after `future` finishes is abandoned once
/// `grace` has passed, so a hung handler cannot keep the process alive.
fn block_on_with_grace<F: Future>(future: F, grace: Duration) -> std::io::Result<F::Output> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let output = runtime.block_on(future);
    runtime.shutdown_timeout(grace);
    Ok(output)
}

fn main() -> ExitCode {
    let args = Args::parse();

    let result = match args.command {
        Command::StartListener(listener) => {
            init_tracing(listener.debug);
            match block_on_with_grace(start_listener(listener), RUNTIME_SHUTDOWN_GRACE) {
                Ok(result) => result,
                Err(e) => {
                    error!("Failed to start the async runtime: {}", e);
                    return ExitCode::FAILURE;
                }
            }
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::from(e.exit_code())
        }
    }
}
