//! tokenbus-producer - publishes sample events on an interval

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokenbus::auth::Authority;
use tokenbus::pipeline::{CredentialedProducer, NewEvent, ReconnectSupervisor, Topology};
use tokenbus_client::{ClientConfig, HttpAuthority, WsConnector};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "tokenbus-producer")]
#[command(about = "Publish token-stamped events to a tokenbus queue")]
#[command(version)]
struct Args {
    /// Authority base URL
    #[arg(long, default_value = "http://localhost:3000", env = "TOKENBUS_AUTHORITY_URL")]
    authority_url: String,

    /// Broker WebSocket URL
    #[arg(long, default_value = "ws://localhost:3000/ws", env = "TOKENBUS_BROKER_URL")]
    broker_url: String,

    /// Queue to publish to
    #[arg(long, default_value = "event_queue", env = "TOKENBUS_QUEUE")]
    queue: String,

    /// Subject to log in as
    #[arg(long, default_value = "service1", env = "TOKENBUS_SUBJECT")]
    subject: String,

    /// Seconds between events
    #[arg(long, default_value_t = 5, env = "TOKENBUS_INTERVAL_SECS")]
    interval_secs: u64,

    /// Stop after this many events (runs until Ctrl+C if unset)
    #[arg(long)]
    count: Option<u64>,

    /// Seconds to wait before reconnecting to the broker
    #[arg(long, default_value_t = 5, env = "TOKENBUS_RECONNECT_DELAY_SECS")]
    reconnect_delay_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let config = ClientConfig::new(args.authority_url, args.broker_url)
        .queue(args.queue)
        .reconnect_delay(Duration::from_secs(args.reconnect_delay_secs));

    let authority = Arc::new(
        HttpAuthority::new(&config.authority_url, config.request_timeout)
            .context("Invalid authority URL")?,
    );
    let connector = WsConnector::new(&config.broker_url, config.request_timeout)
        .context("Invalid broker URL")?;

    let supervisor = ReconnectSupervisor::new(
        Arc::new(connector),
        Topology::producer(config.queue_name()?),
    )
    .with_backoff(config.backoff());

    let mut producer =
        CredentialedProducer::new(args.subject.clone(), authority as Arc<dyn Authority>, supervisor);

    // Fail fast when the authority is not there at all
    producer
        .ensure_credential()
        .await
        .with_context(|| format!("Could not log in as {}", args.subject))?;

    info!(subject = %args.subject, queue = %config.queue, "Publishing events");

    let mut ticker = tokio::time::interval(Duration::from_secs(args.interval_secs.max(1)));
    let mut sent = 0u64;
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        if args.count.is_some_and(|count| sent >= count) {
            break;
        }

        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown signal received");
                break;
            }
            _ = ticker.tick() => {
                sent += 1;
                let event = NewEvent::new("USER_ACTION", format!("Event #{} from {}", sent, args.subject))
                    .with_data(json!({ "eventId": sent, "action": "click" }));

                match producer.publish(event).await {
                    Ok(()) => info!(event_id = sent, "Event published"),
                    Err(e) => error!(event_id = sent, error = %e, "Failed to publish event"),
                }
            }
        }
    }

    if let Err(e) = producer.logout().await {
        warn!(error = %e, "Logout failed");
    }
    producer.close().await;

    let stats = producer.stats();
    info!(
        published = stats.published,
        failed = stats.failed,
        logins = stats.logins,
        refreshes = stats.refreshes,
        "Producer stopped"
    );
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
}
