//! Queue Consumer - Main Entry Point
//!
//! Loads configuration, connects to the broker, consumes the configured durable
//! queue until SIGINT/SIGTERM, then runs the ordered shutdown.

use clap::{Parser, Subcommand};
use queue_consumer::broker::mqtt::MqttSessionFactory;
use queue_consumer::config::ConsumerConfig;
use queue_consumer::consumer::{ConsumerRuntime, ExitReason, LoggingHandler, ShutdownCoordinator};
use queue_consumer::error::ConsumerResult;
use queue_consumer::lifecycle_span;
use queue_consumer::observability::{init_logging_with_override, level_for_verbosity};
use std::path::{Path, PathBuf};
use std::process;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tracing::{error, info, Instrument};

/// Durable-queue consumer
#[derive(Parser)]
#[command(name = "queue-consumer")]
#[command(about = "Consume and acknowledge messages from a durable broker queue")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and consume until a termination signal
    Run {
        /// Queue to consume, overriding the configuration
        #[arg(long, value_name = "NAME")]
        queue: Option<String>,
    },
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize observability system
    init_logging_with_override(level_for_verbosity(cli.verbose));

    info!("Starting queue consumer v{}", env!("CARGO_PKG_VERSION"));

    // Configuration errors are fatal before any connection attempt
    let config = match load_configuration(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let exit_code = match cli.command {
        Commands::Run { queue } => match run_consumer(config, queue).await {
            Ok(reason) => reason.exit_code(),
            Err(e) => {
                error!("Command failed: {}", e);
                1
            }
        },
        Commands::Config { show } => match handle_config_command(&config, show) {
            Ok(()) => 0,
            Err(e) => {
                error!("Command failed: {}", e);
                1
            }
        },
    };

    info!("Application shutdown complete");
    process::exit(exit_code);
}

fn load_configuration(path: Option<&Path>) -> ConsumerResult<ConsumerConfig> {
    let (config, loaded_from) = ConsumerConfig::load(path)?;
    info!("Loaded configuration from: {}", loaded_from.display());
    Ok(config)
}

async fn run_consumer(
    mut config: ConsumerConfig,
    queue: Option<String>,
) -> ConsumerResult<ExitReason> {
    if let Some(queue) = queue {
        config.queue.name = queue;
        config.validate()?;
    }

    let params = config.connection_params()?;
    let factory = MqttSessionFactory::new(config.session_settings());
    let mut runtime = ConsumerRuntime::new(
        factory,
        config.queue.name.clone(),
        LoggingHandler,
        ShutdownCoordinator::new(config.grace_period()),
    );

    // Set up signal handling before connecting so no signal is missed
    let sigint = signal(SignalKind::interrupt())?;
    let sigterm = signal(SignalKind::terminate())?;

    // A synchronous failure is reported; the process stays up until signalled.
    if let Err(e) = runtime.start(&params) {
        error!("Connection attempt failed: {}", e);
    }

    info!(queue = %config.queue.name, "Consumer running, waiting for messages...");

    let span = lifecycle_span!(queue = %config.queue.name, url = %params.url);
    let reason = runtime
        .run(wait_for_signal(sigint, sigterm))
        .instrument(span)
        .await;

    info!(
        ?reason,
        deliveries = runtime.consumer().deliveries(),
        "Consumer stopped"
    );
    Ok(reason)
}

async fn wait_for_signal(mut sigint: Signal, mut sigterm: Signal) {
    tokio::select! {
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down gracefully...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down gracefully...");
        }
    }
}

fn handle_config_command(
    config: &ConsumerConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(&config.redacted())?);
    }

    info!("Configuration validation complete");
    Ok(())
}
