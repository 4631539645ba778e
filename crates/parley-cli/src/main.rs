use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use parley_core::config::Config;
use parley_gateway::GatewayState;

#[derive(Parser)]
#[command(
    name = "parley",
    about = "Voice agent that joins live meetings: speech-to-text, reasoning, text-to-speech",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the control gateway
    Serve {
        /// Port to listen on (default: 8788)
        #[arg(long)]
        port: Option<u16>,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Show configuration summary and whether a gateway is answering
    Status,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Get a specific config value by dotted path (e.g. "gateway.port")
    Get { key: String },
    /// Check the configuration for problems
    Validate,
    /// Write a default config file if none exists
    Init,
}

/// Install the global subscriber from the `logging` section.
///
/// `--verbose` forces debug; otherwise `RUST_LOG` wins over the config.
fn init_logging(config: &Config, verbose: bool) {
    let logging = config.logging.clone().unwrap_or_default();

    let level = if verbose {
        "debug".to_string()
    } else {
        logging.level.clone().unwrap_or_else(|| "info".to_string())
    };
    let mut directives = level;
    for filter in &logging.filters {
        directives.push(',');
        directives.push_str(filter);
    }

    let env_filter = if verbose {
        EnvFilter::new(&directives)
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&directives))
    };

    let json = logging.format == "json";
    let stdout = logging.output == "stdout";
    let fmt_layer = match (json, stdout) {
        (true, true) => tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stdout)
            .boxed(),
        (true, false) => tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .boxed(),
        (false, true) => tracing_subscriber::fmt::layer()
            .with_writer(std::io::stdout)
            .boxed(),
        (false, false) => tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

async fn serve(config: Config, port: Option<u16>) -> anyhow::Result<()> {
    let port = port.unwrap_or_else(|| config.gateway_port());
    let (warnings, errors) = config.validate();
    for warning in &warnings {
        tracing::warn!("{warning}");
    }
    if !errors.is_empty() {
        for error in &errors {
            tracing::error!("{error}");
        }
        anyhow::bail!("refusing to start with {} configuration error(s)", errors.len());
    }

    let state = GatewayState::with_voice_pipeline(Arc::new(config));
    #[cfg(feature = "metrics")]
    let state = state.with_metrics(parley_gateway::metrics::install_prometheus_recorder()?);

    tracing::info!("Starting Parley gateway on port {port}");
    parley_gateway::start_gateway(Arc::new(state), port).await
}

/// Probe `/health` on the configured gateway address.
async fn probe_gateway(config: &Config) -> Option<serde_json::Value> {
    let bind = config.gateway_bind();
    let host = if bind == "0.0.0.0" { "127.0.0.1".to_string() } else { bind };
    let url = format!("http://{host}:{}/health", config.gateway_port());
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(2))
        .build()
        .ok()?;
    let resp = client.get(url).send().await.ok()?;
    if !resp.status().is_success() {
        return None;
    }
    resp.json().await.ok()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(Config::config_dir);

    let config = Config::load(&config_path)?;
    init_logging(&config, cli.verbose);
    tracing::debug!(path = %config_path.display(), "Configuration loaded");

    match cli.command {
        Commands::Serve { port } => serve(config, port).await?,
        Commands::Status => {
            println!("Parley v{}", env!("CARGO_PKG_VERSION"));
            println!("Config: {}", config_path.display());
            println!("Gateway: {}:{}", config.gateway_bind(), config.gateway_port());
            println!("Chat model: {}", config.agent_model());
            match probe_gateway(&config).await {
                Some(health) => println!(
                    "Status: running ({} session(s))",
                    health["sessions"].as_u64().unwrap_or(0)
                ),
                None => println!("Status: not running"),
            }
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let json = serde_json::to_string_pretty(&config)?;
                println!("{json}");
            }
            ConfigAction::Get { key } => match config.get_path(&key) {
                Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
                None => anyhow::bail!("no config value at '{key}'"),
            },
            ConfigAction::Validate => {
                let (warnings, errors) = config.validate();
                for warning in &warnings {
                    println!("warning: {warning}");
                }
                for error in &errors {
                    println!("error: {error}");
                }
                if !errors.is_empty() {
                    anyhow::bail!("{} configuration error(s)", errors.len());
                }
                println!("Configuration OK ({} warning(s))", warnings.len());
            }
            ConfigAction::Init => {
                if config_path.exists() {
                    anyhow::bail!("{} already exists", config_path.display());
                }
                if let Some(parent) = config_path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                Config::default().save(&config_path)?;
                println!("Wrote {}", config_path.display());
            }
        },
    }

    Ok(())
}
