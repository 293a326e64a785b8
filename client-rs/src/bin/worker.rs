//! tokenbus-worker - consumes events, verifying each token before handling it

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokenbus::error::ProcessingError;
use tokenbus::pipeline::{
    shutdown_channel, DeliveryContext, Event, EventHandler, GatedConsumer, ReconnectSupervisor,
    Topology,
};
use tokenbus_client::{ClientConfig, HttpAuthority, WsConnector};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "tokenbus-worker")]
#[command(about = "Consume token-gated events from a tokenbus queue")]
#[command(version)]
struct Args {
    /// Worker identifier, for logs
    #[arg(long, default_value = "1", env = "WORKER_ID")]
    worker_id: String,

    /// Authority base URL
    #[arg(long, default_value = "http://localhost:3000", env = "TOKENBUS_AUTHORITY_URL")]
    authority_url: String,

    /// Broker WebSocket URL
    #[arg(long, default_value = "ws://localhost:3000/ws", env = "TOKENBUS_BROKER_URL")]
    broker_url: String,

    /// Queue to consume from
    #[arg(long, default_value = "event_queue", env = "TOKENBUS_QUEUE")]
    queue: String,

    /// Unacked deliveries held at once
    #[arg(long, default_value_t = 1, env = "TOKENBUS_PREFETCH")]
    prefetch: u16,

    /// Simulated processing time per event, in milliseconds
    #[arg(long, default_value_t = 0, env = "TOKENBUS_PROCESS_MS")]
    process_ms: u64,

    /// Seconds to wait before reconnecting to the broker
    #[arg(long, default_value_t = 5, env = "TOKENBUS_RECONNECT_DELAY_SECS")]
    reconnect_delay_secs: u64,
}

/// Logs each verified event
struct LoggingHandler {
    process_time: Duration,
}

#[async_trait]
impl EventHandler for LoggingHandler {
    async fn handle(&self, event: &Event, ctx: &DeliveryContext) -> Result<(), ProcessingError> {
        info!(
            worker_id = %ctx.worker_id,
            subject = %ctx.subject,
            kind = %event.kind,
            redelivered = ctx.redelivered,
            timestamp = %event.timestamp,
            data = %event.data,
            "{}",
            event.message
        );

        if !self.process_time.is_zero() {
            tokio::time::sleep(self.process_time).await;
        }
        Ok(())
    }
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
        .prefetch(args.prefetch)
        .reconnect_delay(Duration::from_secs(args.reconnect_delay_secs));

    let authority = HttpAuthority::new(&config.authority_url, config.request_timeout)
        .context("Invalid authority URL")?;
    let connector = WsConnector::new(&config.broker_url, config.request_timeout)
        .context("Invalid broker URL")?;

    let supervisor = ReconnectSupervisor::new(
        Arc::new(connector),
        Topology::consumer(config.queue_name()?, config.prefetch),
    )
    .with_backoff(config.backoff());

    let consumer = GatedConsumer::new(
        args.worker_id.clone(),
        Arc::new(authority),
        supervisor,
        Arc::new(LoggingHandler {
            process_time: Duration::from_millis(args.process_ms),
        }),
    );

    let (trigger, shutdown) = shutdown_channel();
    tokio::spawn(async move {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            // Dropping the trigger would count as shutdown
            std::future::pending::<()>().await;
        }
        info!("Shutdown signal received");
        trigger.trigger();
    });

    info!(worker_id = %args.worker_id, queue = %config.queue, "Worker starting");
    let stats = consumer.run(shutdown).await;

    info!(
        worker_id = %args.worker_id,
        processed = stats.processed,
        dropped = stats.dropped,
        requeued = stats.requeued,
        reconnects = stats.reconnects,
        "Worker stopped"
    );
    Ok(())
}
