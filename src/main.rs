//! ClawGate - multi-front-end agent gateway
//!
//! Runs the gateway, or talks to a running one over the framed WebSocket
//! protocol.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use clawgate::{
    agent::EchoBackend,
    client::{watch, ClientOptions, GatewayClient, WatchUpdate},
    config::{AuthMode, ClawGateConfig},
    gateway::GatewayBuilder,
};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "clawgate")]
#[command(author = "A3S Lab Team")]
#[command(version)]
#[command(about = "Multi-front-end agent gateway")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "CLAWGATE_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log (and print) JSON lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway
    Gateway {
        /// Host to bind to
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on
        #[arg(long)]
        port: Option<u16>,

        /// Require this token from connecting clients
        #[arg(long, env = "CLAWGATE_GATEWAY_TOKEN", hide_env_values = true)]
        token: Option<String>,
    },

    /// Show configuration
    Config {
        /// Show default configuration
        #[arg(long)]
        default: bool,
    },

    /// Call a gateway method and print the result
    Call {
        /// Method name, e.g. `status` or `chat.send`
        method: String,

        /// Params as a JSON object
        #[arg(long)]
        params: Option<String>,

        #[command(flatten)]
        connect: ConnectArgs,
    },

    /// Follow gateway broadcasts
    Watch {
        #[command(flatten)]
        connect: ConnectArgs,
    },
}

#[derive(Args)]
struct ConnectArgs {
    /// Gateway WebSocket URL (defaults to the configured host and port)
    #[arg(long)]
    url: Option<String>,

    /// Gateway token
    #[arg(long, env = "CLAWGATE_GATEWAY_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Gateway password
    #[arg(long, env = "CLAWGATE_GATEWAY_PASSWORD", hide_env_values = true)]
    password: Option<String>,
}

impl ConnectArgs {
    fn options(self, config: &ClawGateConfig) -> ClientOptions {
        let url = self.url.unwrap_or_else(|| {
            format!("ws://{}:{}/ws", config.gateway.host, config.gateway.port)
        });
        let mut options = ClientOptions::new(url);
        options.token = self.token.or_else(|| config.auth.token.clone());
        options.password = self.password.or_else(|| config.auth.password.clone());
        options
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("clawgate={},tower_http={}", log_level, log_level).into());
    tracing_subscriber::registry()
        .with(filter)
        .with(cli.json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!cli.json).then(tracing_subscriber::fmt::layer))
        .init();

    // Load configuration
    let config = match &cli.config {
        Some(path) => ClawGateConfig::load(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => ClawGateConfig::default(),
    };

    match cli.command {
        Commands::Gateway { host, port, token } => {
            run_gateway(config, host, port, token).await?;
        }
        Commands::Config { default } => {
            show_config(if default { None } else { Some(&config) })?;
        }
        Commands::Call {
            method,
            params,
            connect,
        } => {
            call(connect.options(&config), &method, params.as_deref(), cli.json).await?;
        }
        Commands::Watch { connect } => {
            run_watch(connect.options(&config), cli.json).await?;
        }
    }

    Ok(())
}

async fn run_gateway(
    mut config: ClawGateConfig,
    host: Option<String>,
    port: Option<u16>,
    token: Option<String>,
) -> Result<()> {
    if let Some(host) = host {
        config.gateway.host = host;
    }
    if let Some(port) = port {
        config.gateway.port = port;
    }
    if let Some(token) = token {
        config.auth.mode = AuthMode::Token;
        config.auth.token = Some(token);
    }

    let gateway = GatewayBuilder::new()
        .config(config)
        .backend(Arc::new(EchoBackend::new()))
        .build()?;

    gateway.start().await?;

    tracing::info!("ClawGate gateway is running. Press Ctrl+C to stop.");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down...");
    gateway.stop().await?;

    Ok(())
}

fn show_config(config: Option<&ClawGateConfig>) -> Result<()> {
    let config = config.cloned().unwrap_or_default();
    println!("{}", config.to_toml()?);
    Ok(())
}

async fn call(options: ClientOptions, method: &str, params: Option<&str>, json: bool) -> Result<()> {
    let params: Value = match params {
        Some(raw) => serde_json::from_str(raw).context("--params must be JSON")?,
        None => Value::Null,
    };

    let mut client = GatewayClient::connect(&options).await?;
    let result = client.call(method, params).await?;
    client.close().await?;

    if json {
        println!("{}", serde_json::to_string(&result)?);
    } else {
        println!("{}", serde_json::to_string_pretty(&result)?);
    }
    Ok(())
}

async fn run_watch(options: ClientOptions, json: bool) -> Result<()> {
    let mut client = GatewayClient::connect(&options).await?;
    let conn_id = client.hello()["server"]["connId"]
        .as_str()
        .unwrap_or_default()
        .to_string();
    tracing::info!(conn_id = %conn_id, "Watching gateway broadcasts");

    watch(&mut client, |update| match update {
        WatchUpdate::Event(event) if json => {
            if let Ok(line) = serde_json::to_string(event) {
                println!("{}", line);
            }
        }
        WatchUpdate::Event(event) => {
            let seq = event.seq.map(|s| s.to_string()).unwrap_or_else(|| "-".into());
            println!("[{}] {} {}", seq, event.event, event.data);
        }
        WatchUpdate::Resynced(snapshot) if json => {
            println!("{}", serde_json::json!({ "resync": snapshot }));
        }
        WatchUpdate::Resynced(snapshot) => {
            println!("[resync] {}", snapshot);
        }
    })
    .await
}
