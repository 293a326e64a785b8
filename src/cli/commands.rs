//! CLI command definitions

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "tokenbus")]
#[command(about = "Token-gated durable event pipeline", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the token authority (HTTP) and the durable broker (WebSocket)
    Serve(ServeArgs),

    /// Decode a token and print its claims (the signature is NOT checked)
    ///
    /// Examples:
    ///   tokenbus inspect at-eyJzdWIiOi...
    Inspect {
        /// Access (at-) or refresh (rt-) token
        token: String,
    },
}

#[derive(Args)]
pub struct ServeArgs {
    /// Address to bind to
    #[arg(short, long, default_value = "0.0.0.0:3000", env = "TOKENBUS_BIND")]
    pub bind: String,

    /// Access token signing secret (random per process if unset)
    #[arg(long, env = "TOKENBUS_ACCESS_SECRET", hide_env_values = true)]
    pub access_secret: Option<String>,

    /// Refresh token signing secret (random per process if unset)
    #[arg(long, env = "TOKENBUS_REFRESH_SECRET", hide_env_values = true)]
    pub refresh_secret: Option<String>,

    /// Access token lifetime in seconds
    #[arg(
        long,
        default_value_t = 900,
        env = "TOKENBUS_ACCESS_TTL_SECS",
        value_parser = parse_ttl_secs
    )]
    pub access_ttl_secs: u64,

    /// Refresh token lifetime in seconds
    #[arg(
        long,
        default_value_t = 604_800,
        env = "TOKENBUS_REFRESH_TTL_SECS",
        value_parser = parse_ttl_secs
    )]
    pub refresh_ttl_secs: u64,

    /// Queue to declare at startup
    #[arg(long, default_value = "event_queue", env = "TOKENBUS_QUEUE")]
    pub queue: String,

    /// How often expired refresh tokens are purged, in seconds
    #[arg(long, default_value_t = 300, env = "TOKENBUS_PURGE_INTERVAL_SECS")]
    pub purge_interval_secs: u64,
}

/// Longest accepted token lifetime: ten years
const MAX_TTL_SECS: u64 = 10 * 365 * 24 * 60 * 60;

fn parse_ttl_secs(s: &str) -> Result<u64, String> {
    let secs: u64 = s
        .parse()
        .map_err(|_| format!("Invalid TTL: {}. Must be a whole number of seconds", s))?;
    if secs == 0 || secs > MAX_TTL_SECS {
        return Err(format!("Invalid TTL: {}. Must be between 1 and {} seconds", s, MAX_TTL_SECS));
    }
    Ok(secs)
}
