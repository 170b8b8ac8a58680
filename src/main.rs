//! MQTT Bridge - forwards messages between two MQTT brokers
//!
//! Usage:
//!   mqtt-bridge [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>    Configuration file path
//!   -w, --workers <N>      Workers per direction (default: 5)
//!   -d, --debug            Also announce startup on the secondary broker
//!   -l, --log-level        Log level (error, warn, info, debug, trace)
//!   --primary-* / --secondary-*  Credential overrides
//!   -h, --help             Print help

use std::path::PathBuf;

use clap::{Args as ClapArgs, Parser, ValueEnum};
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use mqtt_bridge::bridge::{Bridge, BridgeSettings};
use mqtt_bridge::config::{Config, EndpointConfig};

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    Warn,
    /// Informational messages
    #[default]
    Info,
    /// Debug messages, including every forwarded message
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }

    fn from_config(level: &str) -> Self {
        match level.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Info,
        }
    }
}

/// Credential overrides for one endpoint
#[derive(ClapArgs, Debug, Default)]
struct PrimaryCredentials {
    /// Primary system key
    #[arg(long)]
    primary_system_key: Option<String>,
    /// Primary system secret
    #[arg(long)]
    primary_system_secret: Option<String>,
    /// Primary platform URL
    #[arg(long)]
    primary_platform_url: Option<String>,
    /// Primary messaging URL (host:port)
    #[arg(long)]
    primary_messaging_url: Option<String>,
    /// Primary user email
    #[arg(long)]
    primary_email: Option<String>,
    /// Primary user password
    #[arg(long)]
    primary_password: Option<String>,
}

/// Credential overrides for the secondary endpoint
#[derive(ClapArgs, Debug, Default)]
struct SecondaryCredentials {
    /// Secondary system key
    #[arg(long)]
    secondary_system_key: Option<String>,
    /// Secondary system secret
    #[arg(long)]
    secondary_system_secret: Option<String>,
    /// Secondary platform URL
    #[arg(long)]
    secondary_platform_url: Option<String>,
    /// Secondary messaging URL (host:port)
    #[arg(long)]
    secondary_messaging_url: Option<String>,
    /// Secondary user email
    #[arg(long)]
    secondary_email: Option<String>,
    /// Secondary user password
    #[arg(long)]
    secondary_password: Option<String>,
}

/// MQTT Bridge - bidirectional forwarding between two MQTT brokers
#[derive(Parser, Debug)]
#[command(name = "mqtt-bridge")]
#[command(version = "0.1.0")]
#[command(about = "Bidirectional message bridge between two MQTT brokers")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Workers per direction
    #[arg(short, long)]
    workers: Option<usize>,

    /// Also publish the online message on the secondary broker
    #[arg(short, long)]
    debug: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,

    #[command(flatten)]
    primary: PrimaryCredentials,

    #[command(flatten)]
    secondary: SecondaryCredentials,
}

fn apply_overrides(endpoint: &mut EndpointConfig, overrides: [Option<String>; 6]) {
    let fields = [
        &mut endpoint.system_key,
        &mut endpoint.system_secret,
        &mut endpoint.platform_url,
        &mut endpoint.messaging_url,
        &mut endpoint.email,
        &mut endpoint.password,
    ];
    for (field, value) in fields.into_iter().zip(overrides) {
        if let Some(value) = value {
            *field = value;
        }
    }
}

impl PrimaryCredentials {
    fn apply(self, endpoint: &mut EndpointConfig) {
        apply_overrides(
            endpoint,
            [
                self.primary_system_key,
                self.primary_system_secret,
                self.primary_platform_url,
                self.primary_messaging_url,
                self.primary_email,
                self.primary_password,
            ],
        );
    }
}

impl SecondaryCredentials {
    fn apply(self, endpoint: &mut EndpointConfig) {
        apply_overrides(
            endpoint,
            [
                self.secondary_system_key,
                self.secondary_system_secret,
                self.secondary_platform_url,
                self.secondary_messaging_url,
                self.secondary_email,
                self.secondary_password,
            ],
        );
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // File (if any) plus MQTT_BRIDGE__* env overrides
    let loaded = match &args.config {
        Some(path) => Config::read(path),
        None => Config::read(""),
    };
    let mut config = match loaded {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading configuration: {}", e);
            std::process::exit(1);
        }
    };

    // CLI overrides file and environment
    if let Some(workers) = args.workers {
        config.primary_to_secondary.workers = workers;
        config.secondary_to_primary.workers = workers;
    }
    if args.debug {
        config.service.debug = true;
    }
    args.primary.apply(&mut config.primary);
    args.secondary.apply(&mut config.secondary);

    if let Err(e) = config.validate() {
        eprintln!("Invalid configuration: {}", e);
        std::process::exit(1);
    }

    let log_level = args
        .log_level
        .unwrap_or_else(|| LogLevel::from_config(&config.log.level));

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level.to_tracing_level())
        .with_target(false)
        .with_thread_ids(true)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(path) = &args.config {
        info!("Loaded configuration from {:?}", path);
    }

    info!("Starting MQTT Bridge '{}'", config.service.name);
    info!(
        "  Primary: {} at {} ({} auth)",
        config.primary.name, config.primary.messaging_url, config.primary.auth
    );
    info!(
        "  Secondary: {} at {} ({} auth)",
        config.secondary.name, config.secondary.messaging_url, config.secondary.auth
    );
    info!(
        "  {} -> {}: {} topic(s), {} workers",
        config.primary.name,
        config.secondary.name,
        config.primary_to_secondary.topics.len(),
        config.primary_to_secondary.workers
    );
    info!(
        "  {} -> {}: {} topic(s), {} workers",
        config.secondary.name,
        config.primary.name,
        config.secondary_to_primary.topics.len(),
        config.secondary_to_primary.workers
    );
    info!(
        "  QoS: subscribe={}, publish={}",
        config.qos.subscribe, config.qos.publish
    );

    let endpoints = match Bridge::connect(&config).await {
        Ok(endpoints) => endpoints,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    let bridge = Bridge::new(
        BridgeSettings::from_config(&config),
        endpoints.primary.clone(),
        endpoints.secondary.clone(),
    );
    let running = match bridge.start().await {
        Ok(running) => running,
        Err(e) => {
            error!("{}", e);
            endpoints.disconnect().await;
            std::process::exit(1);
        }
    };

    let shutdown = running.shutdown_handle();
    let wait = running.wait();
    tokio::pin!(wait);

    let signalled = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
            shutdown.shutdown();
            true
        }
        _ = &mut wait => false,
    };

    if signalled {
        wait.await;
    } else {
        warn!("Every subscription has ended; bridge stopped");
    }

    endpoints.disconnect().await;

    if !signalled {
        std::process::exit(1);
    }
    Ok(())
}
