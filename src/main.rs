//! SafeTrace API server CLI.

use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use safetrace::cache::{MemoryStateCache, StateCache};
use safetrace::clock::{SharedClock, SystemClock};
use safetrace::config::Config;
use safetrace::notify::{Notifier, TwilioNotifier};
use safetrace::server::{self, AppState};
use safetrace::store::{MemoryStore, Store};
use safetrace::VERSION;

/// Drain deadline for in-flight requests on shutdown.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "safetrace")]
#[command(version = VERSION)]
#[command(about = "Personal-safety monitoring service", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the API server
    Serve {
        /// Override the configured port
        #[arg(long)]
        port: Option<u16>,
    },

    /// Show the resolved configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("safetrace=info,tower_http=info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Serve { port }) => serve(port).await,
        Some(Commands::Config) => show_config(),
        None => serve(None).await,
    }
}

async fn serve(port_override: Option<u16>) -> anyhow::Result<()> {
    let config = Config::from_env()?;
    let port = port_override.unwrap_or(config.port);

    let clock: SharedClock = Arc::new(SystemClock);
    // Reference backends; production deployments swap in the relational
    // and Redis adapters behind the same traits.
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let cache: Arc<dyn StateCache> = Arc::new(MemoryStateCache::new(clock.clone()));
    tracing::warn!("using in-memory Store and StateCache backends");

    let notifier: Arc<dyn Notifier> = Arc::new(TwilioNotifier::new(
        config.twilio_account_sid.clone(),
        config.twilio_auth_token.clone(),
        config.twilio_phone_number.clone(),
    ));

    let state = Arc::new(AppState::new(&config, store, cache, notifier, clock));
    let (addr, shutdown_tx, server_task) = server::run(port, state).await?;
    tracing::info!("SafeTrace v{VERSION} serving on {addr}");

    wait_for_signal().await;

    tracing::info!("Shutting down, draining in-flight requests...");
    let _ = shutdown_tx.send(());
    if tokio::time::timeout(SHUTDOWN_DEADLINE, server_task).await.is_err() {
        tracing::warn!("drain deadline exceeded, exiting anyway");
    }

    tracing::info!("Server stopped gracefully");
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn show_config() -> anyhow::Result<()> {
    let config = Config::from_env()?;

    println!("SafeTrace Configuration");
    println!("=======================");
    println!();
    println!("Port:                 {}", config.port);
    println!("Database URL:         {}", config.database_url);
    println!("Redis URL:            {}", config.redis_url);
    println!("Twilio from number:   {}", config.twilio_phone_number);
    println!(
        "Mapbox token:         {}",
        if config.mapbox_token.is_empty() {
            "(not set, using maps fallback)"
        } else {
            "(set)"
        }
    );
    println!();
    println!("Heartbeat interval:   {}s", config.heartbeat_interval.as_secs());
    println!("Heartbeat window:     {}s", config.heartbeat_window.as_secs());
    println!("LastGasp timeout:     {}s", config.lastgasp_timeout.as_secs());
    println!("Silent prompt:        {}s", config.silent_prompt.as_secs());
    println!(
        "Blackbox retention:   {}h",
        config.blackbox_retention.as_secs() / 3600
    );

    Ok(())
}
