use poolstream::config::Config;
use poolstream::events::{CanonicalEvent, EventType};
use poolstream::StreamEngine;
use std::path::Path;
use tracing::{info, warn};

const CONFIG_PATH: &str = "poolstream.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage.
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    // Load .env if present
    let _ = dotenvy::dotenv();

    let config = if Path::new(CONFIG_PATH).exists() {
        Config::load(Path::new(CONFIG_PATH))?
    } else {
        let config = Config::from_env();
        config.validate()?;
        config
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));

    if config.logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .init();
    }

    info!("poolstream v{} starting", env!("CARGO_PKG_VERSION"));
    if !Path::new(CONFIG_PATH).exists() {
        info!("no {CONFIG_PATH} found, using env-only config");
    }
    if !config.primary.enabled() && !config.secondary.enabled() && config.polling.endpoints.is_empty() {
        warn!("no transport configured; set POOLSTREAM_PRIMARY_WS_URL or POOLSTREAM_SECONDARY_WS_URL");
    }

    let engine = StreamEngine::builder(&config).build()?;

    let subscriptions: Vec<_> = EventType::ALL
        .into_iter()
        .map(|event_type| engine.subscribe(event_type, log_event))
        .collect();
    info!(feeds = subscriptions.len(), "subscribed to all feeds");

    let mut status = engine.status();
    loop {
        tokio::select! {
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = status.borrow_and_update().clone();
                if current.is_degraded() {
                    warn!(
                        primary = ?current.primary,
                        secondary = ?current.secondary,
                        error = ?current.last_error,
                        "transports degraded"
                    );
                } else {
                    info!(primary = ?current.primary, secondary = ?current.secondary, "transport status");
                }
            }

            _ = tokio::signal::ctrl_c() => {
                info!("shutting down...");
                break;
            }
        }
    }

    drop(subscriptions);
    engine.shutdown();
    Ok(())
}

fn log_event(event: &CanonicalEvent) {
    info!(
        event_type = %event.event_type,
        entity = %event.entity_id,
        actor = %event.actor_address,
        timestamp = event.timestamp,
        amount = ?event.amount_tokens(),
        currency = ?event.currency(),
        "event"
    );
}
