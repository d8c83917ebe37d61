use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use stratum_proxy::{LogStateSink, PolicyServer, ProxyConfig, ProxyHandlers, ProxyServer, TemplateBoard};

#[derive(Parser)]
#[command(name = "stratum-proxy")]
#[command(about = "Stratum mining proxy - serves work to miners over line-delimited JSON-RPC")]
#[command(version = "0.1.0")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long, global = true, default_value = "proxy.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Deployment environment used when a default configuration is created
    #[arg(short, long, global = true, default_value = "development")]
    environment: Environment,
}

#[derive(clap::ValueEnum, Clone, Debug)]
enum Environment {
    Development,
    Production,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the stratum endpoints and the job distribution loop.
    ///
    /// No upstream node poller is bundled: jobs are broadcast and `eth_getWork`
    /// succeeds only once a template is published to the board.
    Start,

    /// Write a default configuration file
    CreateConfig {
        /// Output file path
        #[arg(short, long, default_value = "proxy.toml")]
        output: PathBuf,

        /// Environment preset
        #[arg(long, default_value = "development")]
        env: Environment,
    },

    /// Load and validate a configuration file
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        std::env::set_var("RUST_LOG", "debug");
    } else if std::env::var_os("RUST_LOG").is_none() {
        std::env::set_var("RUST_LOG", "info");
    }
    env_logger::init();

    match cli.command {
        Commands::Start => {
            let config = load_or_create_config(&cli)?;
            start_proxy(config).await?;
        }
        Commands::CreateConfig { ref output, ref env } => {
            create_config_command(output, env)?;
        }
        Commands::CheckConfig => {
            check_config_command(&cli)?;
        }
    }

    Ok(())
}

/// Load configuration from file or create default
fn load_or_create_config(cli: &Cli) -> Result<ProxyConfig> {
    if cli.config.exists() {
        log::info!("📄 Loading configuration from {:?}", cli.config);
        let config = ProxyConfig::load_from_file(&cli.config)
            .with_context(|| format!("failed to load configuration from {:?}", cli.config))?;
        return Ok(config);
    }

    log::info!("🔧 Configuration file not found, creating default...");
    let config = default_config(&cli.environment);
    if let Err(e) = config.save_to_file(&cli.config) {
        log::warn!("⚠️ Failed to save default configuration: {}", e);
    } else {
        log::info!("💾 Default configuration saved to {:?}", cli.config);
    }
    Ok(config)
}

fn default_config(env: &Environment) -> ProxyConfig {
    match env {
        Environment::Development => ProxyConfig::development(),
        Environment::Production => ProxyConfig::production(),
    }
}

async fn start_proxy(config: ProxyConfig) -> Result<()> {
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Configuration validation failed: {}", e))?;

    log::info!("🚀 Stratum proxy {} starting...", config.name);

    let policy = Arc::new(PolicyServer::new(config.policy.clone()));
    // Empty until an upstream poller publishes; miners get "Work not ready" meanwhile
    let templates = Arc::new(TemplateBoard::new());
    let handlers = Arc::new(ProxyHandlers::new(&config, templates.clone(), policy.clone()));
    let sink = Arc::new(LogStateSink::new());

    let cleanup_every = Duration::from_secs(config.policy.limit_reset_secs.max(1));
    let server = Arc::new(ProxyServer::new(config, policy.clone(), handlers, templates, sink)?);

    // Periodic cleanup of expired bans and stale connection windows
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(cleanup_every);
        loop {
            ticker.tick().await;
            policy.cleanup();
        }
    });

    tokio::select! {
        result = server.start() => result?,
        _ = tokio::signal::ctrl_c() => {
            log::info!("🛑 Received shutdown signal");
        }
    }

    log::info!("✅ Stratum proxy stopped");
    Ok(())
}

fn create_config_command(output: &Path, env: &Environment) -> Result<()> {
    println!("🔧 Creating default configuration file...");

    let config = default_config(env);
    config
        .save_to_file(output)
        .with_context(|| format!("failed to save configuration to {:?}", output))?;

    println!("✅ Configuration file created at {:?}", output);
    Ok(())
}

fn check_config_command(cli: &Cli) -> Result<()> {
    let config = ProxyConfig::load_from_file(&cli.config)
        .with_context(|| format!("failed to load configuration from {:?}", cli.config))?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Configuration validation failed: {}", e))?;

    println!("✅ Configuration OK: {}", config.name);
    for endpoint in &config.stratum {
        println!(
            "⛏️ {} on {} (max_conn {}, timeout {}s, difficulty {})",
            endpoint.name, endpoint.listen, endpoint.max_conn, endpoint.timeout_secs, endpoint.difficulty
        );
    }
    Ok(())
}
