use crate::services::{
    auth_service::DEFAULT_TOKEN_TTL_SECS,
    chunk_store::{DEFAULT_CHUNK_SIZE, DEFAULT_SUPERSEDED_GRACE},
    streaming::DEFAULT_RELAY_BUFFER,
};
use anyhow::{Context, Result};
use clap::Parser;
use std::{env, fmt, str::FromStr};

const ENV_PREFIX: &str = "SONG_STORE_";

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub chunk_size: usize,
    pub relay_buffer_chunks: usize,
    pub max_upload_bytes: usize,
    pub allow_empty_uploads: bool,
    pub superseded_grace_secs: u64,
    pub jwt_secret: String,
    pub token_ttl_secs: u64,
    pub bcrypt_cost: u32,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 3000,
            database_url: "sqlite://./data/song_store.db".into(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            relay_buffer_chunks: DEFAULT_RELAY_BUFFER,
            max_upload_bytes: 1024 * 1024 * 1024,
            allow_empty_uploads: false,
            superseded_grace_secs: DEFAULT_SUPERSEDED_GRACE.as_secs(),
            jwt_secret: String::new(),
            token_ttl_secs: DEFAULT_TOKEN_TTL_SECS,
            bcrypt_cost: bcrypt::DEFAULT_COST,
        }
    }
}

// The secret stays out of startup logs.
impl fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database_url", &self.database_url)
            .field("chunk_size", &self.chunk_size)
            .field("relay_buffer_chunks", &self.relay_buffer_chunks)
            .field("max_upload_bytes", &self.max_upload_bytes)
            .field("allow_empty_uploads", &self.allow_empty_uploads)
            .field("superseded_grace_secs", &self.superseded_grace_secs)
            .field("jwt_secret", &"<redacted>")
            .field("token_ttl_secs", &self.token_ttl_secs)
            .field("bcrypt_cost", &self.bcrypt_cost)
            .finish()
    }
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Song upload and streaming service")]
pub struct Args {
    /// Host to bind to (overrides SONG_STORE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides SONG_STORE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Database URL (overrides SONG_STORE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Chunk size in bytes for stored payloads (overrides SONG_STORE_CHUNK_SIZE)
    #[arg(long)]
    pub chunk_size: Option<usize>,

    /// Chunks buffered between store and client per stream (overrides SONG_STORE_RELAY_BUFFER_CHUNKS)
    #[arg(long)]
    pub relay_buffer_chunks: Option<usize>,

    /// Maximum upload request size in bytes (overrides SONG_STORE_MAX_UPLOAD_BYTES)
    #[arg(long)]
    pub max_upload_bytes: Option<usize>,

    /// Store 0-byte files instead of rejecting them (overrides SONG_STORE_ALLOW_EMPTY_UPLOADS)
    #[arg(long)]
    pub allow_empty_uploads: Option<bool>,

    /// Seconds a replaced object stays readable (overrides SONG_STORE_SUPERSEDED_GRACE_SECS)
    #[arg(long)]
    pub superseded_grace_secs: Option<u64>,

    /// HMAC secret for access tokens (overrides SONG_STORE_JWT_SECRET)
    #[arg(long)]
    pub jwt_secret: Option<String>,

    /// Access token lifetime in seconds (overrides SONG_STORE_TOKEN_TTL_SECS)
    #[arg(long)]
    pub token_ttl_secs: Option<u64>,

    /// bcrypt work factor for stored passwords (overrides SONG_STORE_BCRYPT_COST)
    #[arg(long)]
    pub bcrypt_cost: Option<u32>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        // Parse CLI once
        let args = Args::parse();
        let defaults = Self::default();

        // --- Environment fallback ---
        let env_host = env_or("HOST", defaults.host)?;
        let env_port = env_or("PORT", defaults.port)?;
        let env_db = env_or("DATABASE_URL", defaults.database_url)?;
        let env_chunk = env_or("CHUNK_SIZE", defaults.chunk_size)?;
        let env_relay = env_or("RELAY_BUFFER_CHUNKS", defaults.relay_buffer_chunks)?;
        let env_max_upload = env_or("MAX_UPLOAD_BYTES", defaults.max_upload_bytes)?;
        let env_allow_empty = env_or("ALLOW_EMPTY_UPLOADS", defaults.allow_empty_uploads)?;
        let env_grace = env_or("SUPERSEDED_GRACE_SECS", defaults.superseded_grace_secs)?;
        let env_secret = env_or("JWT_SECRET", defaults.jwt_secret)?;
        let env_ttl = env_or("TOKEN_TTL_SECS", defaults.token_ttl_secs)?;
        let env_cost = env_or("BCRYPT_COST", defaults.bcrypt_cost)?;

        // --- Merge ---
        let mut cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            database_url: args.database_url.unwrap_or(env_db),
            chunk_size: args.chunk_size.unwrap_or(env_chunk),
            relay_buffer_chunks: args.relay_buffer_chunks.unwrap_or(env_relay),
            max_upload_bytes: args.max_upload_bytes.unwrap_or(env_max_upload),
            allow_empty_uploads: args.allow_empty_uploads.unwrap_or(env_allow_empty),
            superseded_grace_secs: args.superseded_grace_secs.unwrap_or(env_grace),
            jwt_secret: args.jwt_secret.unwrap_or(env_secret),
            token_ttl_secs: args.token_ttl_secs.unwrap_or(env_ttl),
            bcrypt_cost: args.bcrypt_cost.unwrap_or(env_cost),
        };

        if cfg.chunk_size == 0 {
            anyhow::bail!("chunk size must be greater than zero");
        }
        if cfg.jwt_secret.is_empty() {
            tracing::warn!(
                "no {}JWT_SECRET configured; using a random secret, tokens will not survive a restart",
                ENV_PREFIX
            );
            cfg.jwt_secret = uuid::Uuid::new_v4().simple().to_string();
        }

        Ok((cfg, args.migrate))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Read `SONG_STORE_{key}`, falling back to `default` when unset.
fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let name = format!("{ENV_PREFIX}{key}");
    match env::var(&name) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}
