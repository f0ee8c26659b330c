//! Mesh server operator CLI.

mod config;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};

use config::Config;
use mesh_core::acceptor::{self, AcceptorConfig};
use mesh_core::dispatcher::Dispatcher;
use mesh_core::handler::SharedState;
use mesh_core::metrics::CountingMetrics;
use mesh_core::rate_limiter::{RateLimitConfig, RateLimiter};
use mesh_crypto::KeyPair;
use mesh_store::{InMemoryMessageStore, InMemoryUserStore};

/// Mesh server - end-to-end-encrypted group chat relay
#[derive(Parser)]
#[command(name = "mesh-server")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long, default_value = "~/.config/mesh-server/config.toml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the mesh server until Ctrl-C
    Serve,

    /// Generate a fresh RSA-4096 identity keypair
    Keygen {
        /// Output file for the Base64 PKCS8 private key (public key written alongside as `<output>.pub`)
        #[arg(short, long)]
        output: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(if cli.verbose { "debug" } else { "info" })
        .init();

    let config_path = PathBuf::from(&cli.config);
    let config = if config_path.exists() {
        Config::load(&config_path)?
    } else if config_path == Config::default_path() {
        Config::load_or_default()?
    } else {
        Config::load(&config_path)?
    };

    config.validate()?;

    match cli.command {
        Commands::Serve => serve(&config).await?,
        Commands::Keygen { output } => generate_keypair(output).await?,
    }

    Ok(())
}

/// Construct the dispatch engine's collaborators and run the acceptor until Ctrl-C.
async fn serve(config: &Config) -> anyhow::Result<()> {
    tracing::info!(host = %config.host, port = config.port, "starting mesh server");

    let server_keys = Arc::new(KeyPair::generate()?);
    let dispatcher = Arc::new(Dispatcher::new());
    let user_store = InMemoryUserStore::new();
    let message_store = InMemoryMessageStore::new();
    let metrics = Arc::new(CountingMetrics::default());
    let rate_limiter = Arc::new(RateLimiter::new(RateLimitConfig {
        max_requests: config.rate_limit_per_minute,
        window: Duration::from_secs(60),
    }));

    let shared = Arc::new(SharedState {
        dispatcher: dispatcher.clone(),
        user_store,
        message_store,
        rate_limiter: rate_limiter.clone(),
        metrics,
        server_keys,
        server_version: env!("CARGO_PKG_VERSION").to_string(),
        heartbeat_interval: Duration::from_secs(config.heartbeat_interval_secs),
        connection_timeout: Duration::from_secs(config.connection_timeout_secs),
    });

    let acceptor_config = AcceptorConfig {
        host: config.host.clone(),
        port: config.port,
        max_connections: config.max_connections,
        // Fixed 60s cadence (§4.6) — the staleness threshold itself comes
        // from `shared.connection_timeout`, not this interval.
        idle_sweep_interval: Duration::from_secs(60),
        stats_tick_interval: Duration::from_secs(30),
    };

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let run_shared = shared.clone();
    let run_rate_limiter = rate_limiter.clone();
    let acceptor_task = tokio::spawn(async move {
        acceptor::run(acceptor_config, run_shared, run_rate_limiter, shutdown_rx).await
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("ctrl-c received, shutting down");
    acceptor::graceful_shutdown(&shutdown_tx, &dispatcher, Duration::from_secs(10)).await;

    match acceptor_task.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => tracing::error!(error = %err, "acceptor exited with error"),
        Err(err) => tracing::error!(error = %err, "acceptor task panicked"),
    }

    Ok(())
}

/// Generate and print (or save) a fresh RSA-4096 identity keypair.
async fn generate_keypair(output: Option<String>) -> anyhow::Result<()> {
    println!("Generating new RSA-4096 identity keypair...");

    let keys = KeyPair::generate()?;

    match output {
        Some(path) => {
            let private_path = PathBuf::from(&path);
            let public_path = {
                let mut p = path.clone();
                p.push_str(".pub");
                PathBuf::from(p)
            };

            if let Some(parent) = private_path.parent() {
                std::fs::create_dir_all(parent)?;
            }

            std::fs::write(&private_path, keys.private_key_base64()?)?;
            std::fs::write(&public_path, keys.public_key_base64()?)?;

            println!("Private key saved to: {}", private_path.display());
            println!("Public key saved to: {}", public_path.display());
            println!("\nKeep the private key file secure.");
        }
        None => {
            println!("Public key (Base64 SubjectPublicKeyInfo):");
            println!("{}", keys.public_key_base64()?);
            println!("\nPrivate key not saved (use --output to save both keys to disk)");
        }
    }

    Ok(())
}
