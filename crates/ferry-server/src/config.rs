//! Server configuration loaded from environment variables.
//!
//! All settings have defaults so the relay can start with zero configuration
//! for local development. Ingestion stays disabled until `SOURCE_URL` is set.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Env: `HTTP_ADDR`, default `0.0.0.0:8080`.
    pub http_addr: SocketAddr,

    /// Env: `DATABASE_PATH`, default `./ferry.db`.
    pub database_path: PathBuf,

    /// Env: `INSTANCE_NAME`, default `"Ferry Relay"`.
    pub instance_name: String,

    /// Bearer token for `/internal/*`. Unset disables those routes.
    /// Env: `ADMIN_TOKEN`
    pub admin_token: Option<String>,

    /// Maximum concurrent push connections (0 = unlimited).
    /// Env: `MAX_CONNECTIONS`
    pub max_connections: usize,

    // -- Upstream source --

    /// Env: `SOURCE_URL`. Unset disables ingestion.
    pub source_url: Option<String>,

    /// Env: `SOURCE_AUTH_HEADER`, default `Authorization`.
    pub source_auth_header: String,

    /// Env: `SOURCE_AUTH_VALUE`
    pub source_auth_value: Option<String>,

    // -- Admission --

    /// Env: `RATE_LIMIT_PER_SEC`, default `10`.
    pub rate_limit_per_sec: f64,

    /// Env: `RATE_LIMIT_BURST`, default `30`.
    pub rate_limit_burst: f64,

    pub hub: HubConfig,
    pub ingest: IngestConfig,
}

/// Tuning for the connection hub: retry policy, backpressure band,
/// presence grace and the three periodic ticks.
#[derive(Debug, Clone)]
pub struct HubConfig {
    pub retry_base_ms: i64,
    pub retry_max_backoff_ms: i64,
    pub retry_max_attempts: u32,
    /// Absolute age after which an unacknowledged message is dropped.
    pub retry_window_ms: i64,
    pub high_watermark: usize,
    pub low_watermark: usize,
    pub presence_grace_ms: i64,
    pub pending_ttl_ms: i64,
    pub retry_tick: Duration,
    pub liveness_tick: Duration,
    pub presence_tick: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            retry_base_ms: 3_000,
            retry_max_backoff_ms: 30_000,
            retry_max_attempts: 8,
            retry_window_ms: 120_000,
            high_watermark: 1024 * 1024,
            low_watermark: 256 * 1024,
            presence_grace_ms: 300_000,
            pending_ttl_ms: 60_000,
            retry_tick: Duration::from_millis(1_000),
            liveness_tick: Duration::from_millis(30_000),
            presence_tick: Duration::from_millis(10_000),
        }
    }
}

/// Tuning for the ingestion poller and its safety sweep.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Delay between the end of one cycle and the start of the next.
    pub poll_interval: Duration,
    /// Per-attempt bound on one upstream request.
    pub fetch_timeout: Duration,
    pub fetch_attempts: u32,
    /// Shortest backoff between fetch attempts. Retries back off
    /// exponentially up to eight times this.
    pub fetch_backoff: Duration,
    pub cursor_overlap_secs: i64,
    /// Every Nth normal cycle is followed by a sweep (0 disables sweeps).
    pub sweep_every: u64,
    pub sweep_window_secs: i64,
    /// Authors whose future timestamps are clamped to the receive time.
    pub system_authors: HashSet<String>,
    pub future_tolerance_secs: i64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1_500),
            fetch_timeout: Duration::from_millis(8_000),
            fetch_attempts: 3,
            fetch_backoff: Duration::from_millis(500),
            cursor_overlap_secs: 2,
            sweep_every: 20,
            sweep_window_secs: 300,
            system_authors: parse_author_list("0,system"),
            future_tolerance_secs: 5,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], 8080).into(),
            database_path: PathBuf::from("./ferry.db"),
            instance_name: "Ferry Relay".to_string(),
            admin_token: None,
            max_connections: 0,
            source_url: None,
            source_auth_header: "Authorization".to_string(),
            source_auth_value: None,
            rate_limit_per_sec: 10.0,
            rate_limit_burst: 30.0,
            hub: HubConfig::default(),
            ingest: IngestConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        env_parse("HTTP_ADDR", &mut config.http_addr);

        if let Ok(path) = std::env::var("DATABASE_PATH") {
            config.database_path = PathBuf::from(path);
        }

        if let Ok(name) = std::env::var("INSTANCE_NAME") {
            config.instance_name = name;
        }

        if let Ok(token) = std::env::var("ADMIN_TOKEN") {
            if !token.is_empty() {
                config.admin_token = Some(token);
            }
        }

        env_parse("MAX_CONNECTIONS", &mut config.max_connections);

        // -- Upstream source --

        if let Ok(url) = std::env::var("SOURCE_URL") {
            if !url.is_empty() {
                config.source_url = Some(url);
            }
        }

        if let Ok(header) = std::env::var("SOURCE_AUTH_HEADER") {
            config.source_auth_header = header;
        }

        if let Ok(value) = std::env::var("SOURCE_AUTH_VALUE") {
            if !value.is_empty() {
                config.source_auth_value = Some(value);
            }
        }

        env_parse("RATE_LIMIT_PER_SEC", &mut config.rate_limit_per_sec);
        env_parse("RATE_LIMIT_BURST", &mut config.rate_limit_burst);

        // -- Ingestion --

        let ingest = &mut config.ingest;
        env_millis("POLL_INTERVAL_MS", &mut ingest.poll_interval);
        env_millis("FETCH_TIMEOUT_MS", &mut ingest.fetch_timeout);
        env_parse("FETCH_ATTEMPTS", &mut ingest.fetch_attempts);
        env_millis("FETCH_BACKOFF_MS", &mut ingest.fetch_backoff);
        env_parse("CURSOR_OVERLAP_SECS", &mut ingest.cursor_overlap_secs);
        env_parse("SWEEP_EVERY", &mut ingest.sweep_every);
        env_parse("SWEEP_WINDOW_SECS", &mut ingest.sweep_window_secs);
        env_parse("FUTURE_TOLERANCE_SECS", &mut ingest.future_tolerance_secs);
        if let Ok(list) = std::env::var("SYSTEM_AUTHORS") {
            ingest.system_authors = parse_author_list(&list);
        }
        ingest.fetch_attempts = ingest.fetch_attempts.max(1);

        // -- Hub --

        let hub = &mut config.hub;
        env_parse("RETRY_BASE_MS", &mut hub.retry_base_ms);
        env_parse("RETRY_MAX_BACKOFF_MS", &mut hub.retry_max_backoff_ms);
        env_parse("RETRY_MAX_ATTEMPTS", &mut hub.retry_max_attempts);
        env_parse("RETRY_WINDOW_MS", &mut hub.retry_window_ms);
        env_parse("HIGH_WATERMARK", &mut hub.high_watermark);
        env_parse("LOW_WATERMARK", &mut hub.low_watermark);
        env_millis("RETRY_TICK_MS", &mut hub.retry_tick);
        env_millis("LIVENESS_TICK_MS", &mut hub.liveness_tick);
        env_millis("PRESENCE_TICK_MS", &mut hub.presence_tick);

        let mut grace_secs = hub.presence_grace_ms / 1000;
        env_parse("PRESENCE_GRACE_SECS", &mut grace_secs);
        hub.presence_grace_ms = grace_secs * 1000;

        let mut ttl_secs = hub.pending_ttl_ms / 1000;
        env_parse("PENDING_TTL_SECS", &mut ttl_secs);
        hub.pending_ttl_ms = ttl_secs * 1000;

        if hub.low_watermark > hub.high_watermark {
            tracing::warn!(
                low = hub.low_watermark,
                high = hub.high_watermark,
                "LOW_WATERMARK above HIGH_WATERMARK, clamping"
            );
            hub.low_watermark = hub.high_watermark;
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }
}

/// Overwrite `target` with the parsed value of `name` when it is set and valid.
fn env_parse<T: FromStr>(name: &str, target: &mut T) {
    let Ok(raw) = std::env::var(name) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(value) => *target = value,
        Err(_) => tracing::warn!(var = name, value = %raw, "Invalid value, using default"),
    }
}

fn env_millis(name: &str, target: &mut Duration) {
    let mut millis = target.as_millis() as u64;
    env_parse(name, &mut millis);
    // A zero period would make tokio intervals panic.
    *target = Duration::from_millis(millis.max(1));
}

fn parse_author_list(raw: &str) -> HashSet<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
