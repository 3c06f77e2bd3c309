//! topicmux command line
//!
//! Listens on or publishes to broker topics through the shared messaging
//! service, mostly for inspecting live traffic.

use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;
use std::process;
use tokio::signal;
use topicmux::codec::PayloadDecoder;
use topicmux::config::BusConfig;
use topicmux::observability::{init_default_logging, metrics};
use topicmux::protocol::user_messages_topic;
use topicmux::service::MessagingService;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "topicmux")]
#[command(about = "Shared pub/sub client over a single MQTT session")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "TOPICMUX_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print every message received on a topic until interrupted
    Listen {
        /// Listen on `user-<ID>-messages`
        #[arg(
            long,
            value_name = "ID",
            conflicts_with = "topic",
            required_unless_present = "topic"
        )]
        user: Option<String>,
        /// Exact topic to listen on
        #[arg(long)]
        topic: Option<String>,
        /// Client identifier (generated when omitted)
        #[arg(long)]
        client_id: Option<String>,
    },
    /// Publish one payload
    Publish {
        #[arg(long)]
        topic: String,
        /// Payload text; JSON when `--base64` is set
        #[arg(long)]
        payload: String,
        /// Send the JSON payload base64-encoded
        #[arg(long)]
        base64: bool,
    },
    /// Validate configuration
    Config {
        /// Show the effective configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_default_logging();

    info!("Starting topicmux v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Listen {
            user,
            topic,
            client_id,
        } => {
            let topic = topic.or_else(|| user.as_deref().map(user_messages_topic));
            match topic {
                Some(topic) => listen(config, topic, client_id).await,
                None => Err("either --user or --topic is required".into()),
            }
        }
        Commands::Publish {
            topic,
            payload,
            base64,
        } => publish(config, topic, payload, base64).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<BusConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(BusConfig::load_from_file(path)?);
    }

    for path_str in ["topicmux.toml", "config/topicmux.toml"] {
        let path = PathBuf::from(path_str);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(BusConfig::load_from_file(&path)?);
        }
    }

    warn!("No configuration file found, using defaults (mqtt://localhost:1883)");
    Ok(BusConfig::default())
}

async fn listen(
    config: BusConfig,
    topic: String,
    client_id: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let service = MessagingService::from_config(&config)?;

    let _state_listener = service.add_connection_listener(|state| {
        info!(state = %state, "Connection state changed");
    });
    if !service.start(client_id).await {
        warn!("Initial connection failed; listening anyway");
    }

    let _listener = service.add_message_listener(&topic, |payload| {
        println!("{payload}");
    })?;
    info!(topic = %topic, "Listening, press Ctrl-C to stop");

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    tokio::select! {
        _ = sigint.recv() => info!("Received SIGINT, shutting down"),
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
    }

    service.shutdown().await;

    let snapshot = metrics().snapshot();
    info!(
        received = snapshot.delivery.received,
        delivered = snapshot.delivery.delivered,
        "Listener stopped"
    );
    Ok(())
}

async fn publish(
    config: BusConfig,
    topic: String,
    payload: String,
    base64: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let body = if base64 {
        let value: Value = serde_json::from_str(&payload)?;
        PayloadDecoder::encode_json(&value)
    } else {
        payload
    };

    let service = MessagingService::from_config(&config)?;
    if !service.start(None).await {
        return Err("could not connect to the broker".into());
    }

    let published = service.publish_message(&topic, body).await;
    let last_error = service.last_publish_error();
    service.shutdown().await;

    if published {
        info!(topic = %topic, "Message published");
        Ok(())
    } else {
        Err(last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "publish failed".to_string())
            .into())
    }
}

fn handle_config_command(
    config: &BusConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    config.validate()?;
    if show {
        println!("{}", toml::to_string_pretty(config)?);
    }
    info!("Configuration validation complete");
    Ok(())
}
