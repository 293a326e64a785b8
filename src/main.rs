//! tokenbus CLI entry point

mod cli;

use crate::cli::{Cli, Commands, ServeArgs};
use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokenbus::auth::{self, AuthorityConfig, SigningKey, TokenAuthority, TokenKeys};
use tokenbus::broker::{Broker, QueueName, QueueOptions};
use tokenbus::pipeline::shutdown_channel;
use tokenbus::server::{self, AppState};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve(args) => serve(args).await,
        Commands::Inspect { token } => inspect(&token),
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    let keys = TokenKeys::new(
        signing_key(args.access_secret, "TOKENBUS_ACCESS_SECRET"),
        signing_key(args.refresh_secret, "TOKENBUS_REFRESH_SECRET"),
    );

    let config = AuthorityConfig::new()
        .access_ttl(ttl(args.access_ttl_secs, "access")?)
        .refresh_ttl(ttl(args.refresh_ttl_secs, "refresh")?);
    let authority = Arc::new(TokenAuthority::new(keys, config));

    let broker = Broker::new();
    let queue = QueueName::parse(&args.queue)
        .with_context(|| format!("Invalid queue name: {}", args.queue))?;
    broker
        .declare(&queue, QueueOptions::durable())
        .context("Failed to declare queue")?;

    let listener = tokio::net::TcpListener::bind(&args.bind)
        .await
        .with_context(|| format!("Failed to bind {}", args.bind))?;

    let (trigger, shutdown) = shutdown_channel();

    let purge = tokio::spawn(server::purge_expired_loop(
        authority.clone(),
        Duration::from_secs(args.purge_interval_secs.max(1)),
        trigger.subscribe(),
    ));

    info!(addr = %args.bind, queue = %queue, "tokenbus starting");

    let state = AppState::new(authority, broker.clone());
    let server = tokio::spawn(server::serve(listener, state, shutdown));

    shutdown_signal().await;
    info!("Shutdown signal received, stopping server");

    trigger.trigger();
    // Close broker sockets so graceful shutdown is not held open by them
    broker.drop_connections();

    server.await.context("Server task panicked")??;
    let _ = purge.await;

    info!("tokenbus stopped");
    Ok(())
}

fn signing_key(secret: Option<String>, env_name: &str) -> SigningKey {
    match secret.filter(|s| !s.is_empty()) {
        Some(secret) => SigningKey::new(secret.into_bytes()),
        None => {
            warn!(
                "{} not set, using a random key; tokens will not survive a restart",
                env_name
            );
            SigningKey::generate()
        }
    }
}

fn ttl(secs: u64, which: &str) -> Result<chrono::Duration> {
    anyhow::ensure!(secs > 0, "{} TTL must be positive", which);
    i64::try_from(secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .with_context(|| format!("{} TTL out of range", which))
}

fn inspect(token: &str) -> Result<()> {
    let (kind, claims) = auth::inspect(token).context("Not a tokenbus token")?;

    println!("Kind:       {}", kind);
    println!("Subject:    {}", claims.sub);
    println!("Issued at:  {}", claims.issued_at());
    println!("Expires at: {}", claims.expires_at());
    println!("Token id:   {}", claims.jti);
    println!();
    println!("Signature not checked.");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
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
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
