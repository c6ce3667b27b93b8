//! HTTP Tunnel agent
//!
//! Runs either side of the tunnel:
//! - `--type server`: accepts tunnel exchanges and dials destinations
//! - `--type client --dest host:port`: accepts local TCP clients and tunnels
//!   them to `host:port` through the server agent

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use http_tunnel::client::{BridgeServer, BridgeSettings};
use http_tunnel::config::{Config, LogFormat, LoggingConfig};
use http_tunnel::server::{self, ConnectionRegistry, RegistrySettings};
use http_tunnel::transport::TcpDialer;
use http_tunnel::{daemon, debug};
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

/// HTTP Tunnel - TCP over plain HTTP exchanges
#[derive(Parser, Debug)]
#[command(name = "http-tunnel")]
#[command(about = "Tunnel TCP connections through HTTP request/response exchanges")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(long, default_value = "./etc/http-tunnel.toml")]
    config: String,

    /// Logging configuration file overriding the [logging] section
    #[arg(long)]
    logconf: Option<String>,

    /// Detach and run in the background
    #[arg(long, conflicts_with = "fg")]
    daemon: bool,

    /// Stay in the foreground (default)
    #[arg(long)]
    fg: bool,

    /// Which agent to run
    #[arg(long = "type", value_enum)]
    agent: AgentType,

    /// Destination address tunneled to (client agent only)
    #[arg(long, required_if_eq("agent", "client"))]
    dest: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum AgentType {
    Server,
    Client,
}

/// Fully resolved agent, built before the process detaches
enum Agent {
    Server(RegistrySettings),
    Client(BridgeSettings),
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = Config::load(&args.config)
        .with_context(|| format!("Failed to load configuration from {}", args.config))?;
    config.validate().context("Invalid configuration")?;

    let logging = match &args.logconf {
        Some(path) => LoggingConfig::load(path)
            .with_context(|| format!("Failed to load logging configuration from {}", path))?,
        None => config.logging.clone(),
    };

    // Key files are read here, while relative paths still resolve
    let agent = match args.agent {
        AgentType::Server => Agent::Server(
            config
                .registry_settings()
                .context("Invalid server configuration")?,
        ),
        AgentType::Client => Agent::Client(
            config
                .bridge_settings(args.dest.as_deref().unwrap_or_default())
                .context("Invalid client configuration")?,
        ),
    };

    init_logging(&logging)?;

    let detach = args.daemon && !args.fg;
    if detach && logging.file.is_none() {
        warn!("No logging.file set, background logs are discarded");
    }
    if detach && !daemon::daemonize().context("Failed to daemonize")? {
        info!("Background mode not supported here, staying in the foreground");
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build runtime")?;

    runtime.block_on(run(config, agent))
}

/// Install the global tracing subscriber
fn init_logging(logging: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_new(&logging.level)
        .with_context(|| format!("Invalid logging.level '{}'", logging.level))?;

    let writer = match &logging.file {
        Some(path) => {
            if let Some(parent) = Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("Failed to create log directory for {}", path))?;
                }
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path))?;
            BoxMakeWriter::new(Mutex::new(file))
        }
        None => BoxMakeWriter::new(std::io::stdout),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(logging.file.is_none())
        .with_writer(writer);

    match logging.log_format()? {
        LogFormat::Pretty => builder.pretty().init(),
        LogFormat::Compact => builder.compact().init(),
        LogFormat::Json => builder.json().init(),
    }

    Ok(())
}

async fn run(config: Config, agent: Agent) -> Result<()> {
    info!("HTTP Tunnel v{}", http_tunnel::VERSION);
    for line in config.to_string().lines() {
        info!("{}", line);
    }

    let task = match agent {
        Agent::Server(settings) => {
            info!("Server agent, filter={}", settings.filter.name());
            let registry = ConnectionRegistry::new(Arc::new(TcpDialer::default()), settings);

            if let Some(debug_addr) = &config.basic.debug_bind_address {
                let listener = TcpListener::bind(debug_addr)
                    .await
                    .with_context(|| format!("Failed to bind status endpoint to {}", debug_addr))?;
                let registry = registry.clone();
                tokio::spawn(async move {
                    if let Err(e) = debug::serve(listener, registry).await {
                        error!("Status endpoint stopped: {}", e);
                    }
                });
            }

            let listener = TcpListener::bind(&config.basic.server_bind_address)
                .await
                .with_context(|| {
                    format!("Failed to bind to {}", config.basic.server_bind_address)
                })?;
            tokio::spawn(server::serve(listener, registry))
        }
        Agent::Client(settings) => {
            info!(
                "Client agent, dest={} filter={}",
                settings.destination,
                settings.filter.name()
            );
            let listener = TcpListener::bind(&settings.bind_address)
                .await
                .with_context(|| format!("Failed to bind to {}", settings.bind_address))?;
            let bridge = BridgeServer::new(settings);
            tokio::spawn(async move { bridge.serve(listener).await })
        }
    };

    // Wait for shutdown signal
    tokio::select! {
        result = task => {
            result
                .context("Agent task panicked")?
                .context("Agent stopped")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
        }
    }

    Ok(())
}
