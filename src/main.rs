use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tollgate::config::{StoreBackend, TollgateConfig};
use tollgate::ratelimit::{Identity, LimiterFactory, LimiterOptions, Token};
use tollgate::store::{CounterStore, MemoryStore};

/// Fixed-window rate limiter over a shared counter store.
#[derive(Debug, Parser)]
#[command(name = "tollgate", version, about)]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run checks against a limiter and print each decision as JSON
    Check {
        /// Limiter name
        limiter: String,

        /// Identity parts; several parts form a composite key
        #[arg(required = true)]
        key: Vec<String>,

        /// Number of checks to run
        #[arg(short = 'n', long, default_value_t = 1)]
        times: u32,

        /// Pause between checks in milliseconds
        #[arg(long, default_value_t = 0)]
        interval_ms: u64,
    },
    /// Print the resolved configuration
    ShowConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = TollgateConfig::load(cli.config.as_deref()).context("loading configuration")?;
    info!(backend = ?config.store.backend, "Configuration loaded");

    match cli.command {
        Command::ShowConfig => {
            println!("{}", serde_yaml::to_string(&config)?);
        }
        Command::Check {
            limiter,
            key,
            times,
            interval_ms,
        } => {
            let store = build_store(&config).await?;
            let factory = LimiterFactory::with_store(&config.defaults, store);
            let options = config
                .limiter(&limiter)
                .map(|settings| settings.to_options())
                .unwrap_or_else(LimiterOptions::new);
            let limiter = factory.create(&limiter, options)?;
            let identity = identity_from_args(key);

            tokio::select! {
                result = run_checks(&limiter, &identity, times, Duration::from_millis(interval_ms)) => result?,
                _ = shutdown_signal() => {}
            }
        }
    }

    Ok(())
}

async fn run_checks(
    limiter: &tollgate::Limiter,
    identity: &Identity,
    times: u32,
    interval: Duration,
) -> anyhow::Result<()> {
    for i in 0..times {
        if i > 0 && !interval.is_zero() {
            tokio::time::sleep(interval).await;
        }
        let decision = limiter.check(identity.clone()).await?;
        println!("{}", serde_json::to_string(&decision)?);
    }
    Ok(())
}

/// Numeric arguments become numeric tokens, everything else text.
fn identity_from_args(parts: Vec<String>) -> Identity {
    let mut tokens: Vec<Token> = parts
        .into_iter()
        .map(|part| match part.parse::<i64>() {
            Ok(n) => Token::Integer(n),
            Err(_) => Token::Text(part),
        })
        .collect();
    if tokens.len() == 1 {
        Identity::Single(tokens.remove(0))
    } else {
        Identity::Composite(tokens)
    }
}

async fn build_store(config: &TollgateConfig) -> anyhow::Result<Arc<dyn CounterStore>> {
    match config.store.backend {
        StoreBackend::Memory => {
            warn!("Using the in-memory store; limits are not shared between processes");
            let store = Arc::new(MemoryStore::new());
            store.spawn_cleanup(config.store.cleanup_interval());
            Ok(store)
        }
        StoreBackend::Redis => connect_redis(config.store.url.as_deref()).await,
    }
}

#[cfg(feature = "redis")]
async fn connect_redis(url: Option<&str>) -> anyhow::Result<Arc<dyn CounterStore>> {
    let url = url.unwrap_or("redis://127.0.0.1:6379");
    let store = tollgate::store::RedisStore::connect(url).await?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "redis"))]
async fn connect_redis(_url: Option<&str>) -> anyhow::Result<Arc<dyn CounterStore>> {
    anyhow::bail!("the redis store backend requires building with the `redis` feature")
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, stopping");
        }
        _ = terminate => {
            info!("Received SIGTERM, stopping");
        }
    }
}
