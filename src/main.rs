//! Hopwire CLI - inspect and exercise hopwire server clusters
//!
//! `probe` checks the handshake of every endpoint in a connection URL;
//! `ping` logs on and keeps probing liveness, failing over as servers go away.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hopwire_client::{
    Connection, ConnectionConfig, InstanceConfig, InstanceFactory, ServerInstance, UrlDiscovery,
};
use hopwire_proto::properties::{AUTO_FAILOVER, PASSWORD, USER};
use hopwire_proto::Properties;
use hopwire_transport::{TcpChannelConfig, TcpChannelFactory};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Hopwire - resilient client for hopwire server clusters
#[derive(Parser, Debug)]
#[command(name = "hopwire")]
#[command(about = "Hopwire - resilient client for hopwire server clusters")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// JSON file with `tcp`, `instance` and `connection` settings
    #[arg(long, global = true, env = "HOPWIRE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Open a channel to every endpoint and report its handshake
    #[command(long_about = r#"
Open a channel to every endpoint listed in the connection URL, wait for the
server handshake and report the negotiated protocol details. No logon is
performed.

EXAMPLES:
  hopwire probe --url hopwire://db1:31000,db2:31000

ENVIRONMENT VARIABLES:
  HOPWIRE_URL       Connection URL
    "#)]
    Probe {
        /// Connection URL (e.g., hopwire://db1:31000,db2:31000)
        #[arg(long, env = "HOPWIRE_URL")]
        url: String,
    },

    /// Log on and periodically ping the current server
    #[command(long_about = r#"
Log on to the first reachable endpoint and ping it periodically. With
failover enabled a dead server is replaced by the next endpoint in the URL.

EXAMPLES:
  hopwire ping --url hopwire://db1,db2 --user alice --failover --count 10

ENVIRONMENT VARIABLES:
  HOPWIRE_URL       Connection URL
  HOPWIRE_USER      Logon user
  HOPWIRE_PASSWORD  Logon password
    "#)]
    Ping {
        /// Connection URL (e.g., hopwire://db1:31000,db2:31000)
        #[arg(long, env = "HOPWIRE_URL")]
        url: String,

        /// Logon user
        #[arg(long, env = "HOPWIRE_USER")]
        user: String,

        /// Logon password
        #[arg(long, env = "HOPWIRE_PASSWORD", hide_env_values = true)]
        password: Option<String>,

        /// Fail over to the next endpoint when the current one dies
        #[arg(long)]
        failover: bool,

        /// Number of pings (0 = until Ctrl+C)
        #[arg(long, default_value = "0")]
        count: u64,

        /// Delay between pings in milliseconds
        #[arg(long, default_value = "1000")]
        interval: u64,
    },
}

/// Settings file layout
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Settings {
    tcp: TcpChannelConfig,
    instance: InstanceConfig,
    connection: ConnectionConfig,
}

impl Settings {
    fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    fn instance_factory(&self) -> Arc<InstanceFactory> {
        Arc::new(InstanceFactory::new(
            Arc::new(TcpChannelFactory::new(self.tcp.clone())),
            self.instance.clone(),
        ))
    }
}

/// Setup logging with the specified log level
fn setup_logging(verbose: bool) {
    let log_level = if verbose {
        "hopwire=debug,hopwire_client=debug,hopwire_transport=debug"
    } else {
        "info"
    };

    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

async fn probe(settings: &Settings, url: &str) -> Result<()> {
    let endpoints = UrlDiscovery::resolve(url).context("Invalid connection URL")?;
    let channels = TcpChannelFactory::new(settings.tcp.clone());

    let mut reachable = 0;
    for endpoint in &endpoints {
        match ServerInstance::connect(endpoint.clone(), &channels, settings.instance.clone()).await
        {
            Ok(instance) => {
                reachable += 1;
                let handshake = instance.handshake();
                println!(
                    "{:<30} ok    server {} auth {} protocol {}",
                    endpoint.to_string(),
                    handshake.server_version,
                    handshake.auth_type,
                    handshake.protocol_version
                );
                instance.close().await;
            }
            Err(e) => {
                println!("{:<30} FAIL  {}", endpoint.to_string(), e);
            }
        }
    }

    info!("{} of {} endpoints reachable", reachable, endpoints.len());
    if reachable == 0 {
        anyhow::bail!("No endpoint in {} is reachable", url);
    }
    Ok(())
}

async fn ping(
    settings: &Settings,
    url: &str,
    mut properties: Properties,
    count: u64,
    interval: Duration,
) -> Result<()> {
    let factory = settings.instance_factory();
    let connection = Connection::connect(
        url,
        &mut properties,
        factory.clone(),
        settings.connection.clone(),
    )
    .await
    .context("Failed to connect")?;

    if let Some(logon) = connection.logon_result().await {
        info!(
            "Logged on as {} (session {})",
            logon.user_name, logon.session_id
        );
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut sent = 0;
    let mut result = Ok(());
    while count == 0 || sent < count {
        sent += 1;
        let started = tokio::time::Instant::now();
        match connection.ping().await {
            Ok(()) => {
                let endpoint = connection
                    .current_endpoint()
                    .await
                    .map(|e| e.to_string())
                    .unwrap_or_default();
                println!("ping {} from {}: {:?}", sent, endpoint, started.elapsed());
            }
            Err(e) if e.is_connection_class() => {
                warn!("Ping {} failed: {}", sent, e);
            }
            Err(e) => {
                error!("Ping {} failed: {}", sent, e);
                result = Err(e).context("Ping failed");
                break;
            }
        }

        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Received Ctrl+C, shutting down...");
                break;
            }
            _ = tokio::time::sleep(interval) => {}
        }
    }

    connection.close().await;
    factory.shutdown().await;
    result
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    setup_logging(cli.verbose);

    let settings = Settings::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Probe { url } => probe(&settings, &url).await,
        Commands::Ping {
            url,
            user,
            password,
            failover,
            count,
            interval,
        } => {
            let mut properties = Properties::new().with(USER, user);
            if let Some(password) = password {
                properties.set(PASSWORD, password);
            }
            if failover {
                properties.set(AUTO_FAILOVER, "true");
            }
            ping(
                &settings,
                &url,
                properties,
                count,
                Duration::from_millis(interval),
            )
            .await
        }
    }
}
