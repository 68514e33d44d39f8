use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// Production configuration — loaded from environment variables
// ---------------------------------------------------------------------------

/// Complete server configuration loaded at startup.
///
/// Every field can be set via an environment variable prefixed with
/// `ROOMCAST_`.  Defaults are suitable for local development; production
/// deployments MUST override at least `jwt_secret`.
#[derive(Debug, Clone)]
pub struct Config {
    // ── Network ─────────────────────────────────────────────────────────
    /// Address to bind the HTTP listener to.
    pub bind_addr: String,
    /// Public base URL used to build room share links.
    pub public_url: String,

    // ── Auth ────────────────────────────────────────────────────────────
    pub jwt_secret: String,
    /// Lifetime of issued participant tokens.
    pub token_ttl: Duration,
    /// Optional admin code gating room creation.
    pub admin_code: Option<String>,

    // ── Storage ─────────────────────────────────────────────────────────
    pub redis_url: String,

    // ── Rooms ───────────────────────────────────────────────────────────
    /// How long a room record lives in the store.
    pub room_ttl: Duration,
    /// Maximum participants per room.
    pub room_capacity: usize,
    /// Allowed room name length after sanitization.
    pub name_min_len: usize,
    pub name_max_len: usize,
    /// Minimum credential length accepted at room creation.
    pub credential_min_len: usize,
    /// Bounded attempts for the optimistic roster update before giving up.
    pub roster_retry_limit: u32,

    // ── Real-time channel ───────────────────────────────────────────────
    /// Number of chat frames replayed to a newly joined connection.
    pub chat_backlog_len: usize,
    /// Per-connection outbound queue capacity; overflow drops frames.
    pub outbound_queue_capacity: usize,
    /// Read-side idle budget; a silent connection is torn down after this.
    pub heartbeat_timeout: Duration,
    /// Budget for a single outbound socket write.
    pub write_timeout: Duration,
    /// Maximum inbound frame size in bytes.
    pub max_frame_bytes: usize,

    // ── Rate limiting ───────────────────────────────────────────────────
    /// Room creations per IP per hour.
    pub create_limit_per_hour: u64,
    /// Join attempts per room+IP per minute.
    pub join_limit_per_minute: u64,

    // ── WebRTC ──────────────────────────────────────────────────────────
    /// Static ICE server list handed to clients.
    pub ice_servers: Vec<IceServer>,
    /// Optional managed TURN credential endpoint + key (e.g. Metered).
    pub turn_credentials_url: Option<String>,
    pub turn_api_key: Option<String>,

    // ── CORS / logging ──────────────────────────────────────────────────
    pub allowed_origins: String,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Automatically loads a `.env` file if present (via `dotenvy`).
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        let jwt_secret = match std::env::var("ROOMCAST_JWT_SECRET") {
            Ok(s) if !s.is_empty() => s,
            _ => {
                let secret = uuid::Uuid::new_v4().to_string();
                warn!("ROOMCAST_JWT_SECRET not set — using random value (not suitable for production)");
                secret
            }
        };

        let config = Config {
            bind_addr: env_or("ROOMCAST_BIND_ADDR", "0.0.0.0:8080"),
            public_url: env_or("ROOMCAST_PUBLIC_URL", "http://localhost:5173"),

            jwt_secret,
            token_ttl: env_secs("ROOMCAST_TOKEN_TTL_SECS", 3600),
            admin_code: std::env::var("ROOMCAST_ADMIN_CODE").ok().filter(|s| !s.is_empty()),

            redis_url: env_or("ROOMCAST_REDIS_URL", "redis://127.0.0.1:6379"),

            room_ttl: env_secs("ROOMCAST_ROOM_TTL_SECS", 24 * 3600),
            room_capacity: env_usize("ROOMCAST_ROOM_CAPACITY", 10),
            name_min_len: env_usize("ROOMCAST_NAME_MIN_LEN", 3),
            name_max_len: env_usize("ROOMCAST_NAME_MAX_LEN", 50),
            credential_min_len: env_usize("ROOMCAST_CREDENTIAL_MIN_LEN", 6),
            roster_retry_limit: env_usize("ROOMCAST_ROSTER_RETRY_LIMIT", 4) as u32,

            chat_backlog_len: env_usize("ROOMCAST_CHAT_BACKLOG_LEN", 50),
            outbound_queue_capacity: env_usize("ROOMCAST_OUTBOUND_QUEUE_CAPACITY", 256),
            heartbeat_timeout: env_secs("ROOMCAST_HEARTBEAT_TIMEOUT_SECS", 60),
            write_timeout: env_secs("ROOMCAST_WRITE_TIMEOUT_SECS", 10),
            max_frame_bytes: env_usize("ROOMCAST_MAX_FRAME_BYTES", 64 * 1024),

            create_limit_per_hour: env_usize("ROOMCAST_CREATE_LIMIT_PER_HOUR", 5) as u64,
            join_limit_per_minute: env_usize("ROOMCAST_JOIN_LIMIT_PER_MINUTE", 10) as u64,

            ice_servers: ice_servers_from_env(),
            turn_credentials_url: std::env::var("ROOMCAST_TURN_CREDENTIALS_URL")
                .ok()
                .filter(|s| !s.is_empty()),
            turn_api_key: std::env::var("ROOMCAST_TURN_API_KEY").ok().filter(|s| !s.is_empty()),

            allowed_origins: env_or("ROOMCAST_ALLOWED_ORIGINS", "*"),
            log_level: env_or("ROOMCAST_LOG_LEVEL", "info"),
        };

        config.log_summary();
        config
    }

    /// Interval between heartbeat probes, derived from the read-side budget
    /// so a probe always lands before the peer's idle timer fires.
    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_timeout.mul_f64(0.9)
    }

    fn log_summary(&self) {
        info!("──── Roomcast Configuration ────");
        info!("  bind_addr          : {}", self.bind_addr);
        info!("  public_url         : {}", self.public_url);
        info!("  redis_url          : {}", self.redis_url);
        info!("  room_ttl           : {}s", self.room_ttl.as_secs());
        info!("  room_capacity      : {}", self.room_capacity);
        info!("  chat_backlog_len   : {}", self.chat_backlog_len);
        info!("  queue_capacity     : {}", self.outbound_queue_capacity);
        info!("  heartbeat_timeout  : {}s", self.heartbeat_timeout.as_secs());
        info!("  admin_gated        : {}", self.admin_code.is_some());
        info!("  managed_turn       : {}", self.turn_api_key.is_some());
        info!(
            "  cors_origins       : {}",
            if self.allowed_origins == "*" {
                "* (permissive)"
            } else {
                &self.allowed_origins
            }
        );
        info!("  log_level          : {}", self.log_level);
        info!("────────────────────────────────");
    }
}

// ---------------------------------------------------------------------------
// ICE server configuration
// ---------------------------------------------------------------------------

/// JSON-serialisable ICE server entry sent to clients.
///
/// Matches the W3C `RTCIceServer` dictionary shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: &str) -> Self {
        Self {
            urls: vec![url.to_string()],
            username: None,
            credential: None,
        }
    }
}

fn default_ice_servers() -> Vec<IceServer> {
    vec![
        IceServer::stun("stun:stun.l.google.com:19302"),
        IceServer::stun("stun:stun1.l.google.com:19302"),
    ]
}

/// Parse `ROOMCAST_ICE_SERVERS` as a JSON array of `RTCIceServer` objects;
/// fall back to the public STUN defaults on absence or parse failure.
fn ice_servers_from_env() -> Vec<IceServer> {
    let raw = match std::env::var("ROOMCAST_ICE_SERVERS") {
        Ok(v) if !v.is_empty() => v,
        _ => return default_ice_servers(),
    };

    match serde_json::from_str::<Vec<IceServer>>(&raw) {
        Ok(servers) if !servers.is_empty() => servers,
        Ok(_) => default_ice_servers(),
        Err(e) => {
            warn!("invalid ROOMCAST_ICE_SERVERS JSON: {e} — using defaults");
            default_ice_servers()
        }
    }
}

// ---------------------------------------------------------------------------
// Environment helpers
// ---------------------------------------------------------------------------

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}

fn env_secs(key: &str, default: u64) -> Duration {
    let secs = std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default);
    Duration::from_secs(secs)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

/// A fully populated configuration for unit tests across the crate.
#[cfg(test)]
pub fn test_config() -> Config {
    Config {
        bind_addr: "127.0.0.1:0".into(),
        public_url: "http://localhost:5173".into(),
        jwt_secret: "test-secret".into(),
        token_ttl: Duration::from_secs(3600),
        admin_code: None,
        redis_url: "redis://127.0.0.1:6379".into(),
        room_ttl: Duration::from_secs(24 * 3600),
        room_capacity: 10,
        name_min_len: 3,
        name_max_len: 50,
        credential_min_len: 6,
        roster_retry_limit: 4,
        chat_backlog_len: 50,
        outbound_queue_capacity: 256,
        heartbeat_timeout: Duration::from_secs(60),
        write_timeout: Duration::from_secs(10),
        max_frame_bytes: 64 * 1024,
        create_limit_per_hour: 5,
        join_limit_per_minute: 10,
        ice_servers: default_ice_servers(),
        turn_credentials_url: None,
        turn_api_key: None,
        allowed_origins: "*".into(),
        log_level: "info".into(),
    }
}
