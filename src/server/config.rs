use std::env;
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub ws_port: u16,
    pub database_url: String,
    pub session_expiry_days: u32,
    pub argon2_salt_length: u32,
    pub max_message_length: usize,
    /// Number of most recent messages returned by the history endpoint.
    pub message_page_size: usize,
    pub platform_fee_percent: f64,
    pub cors_origin: Option<String>,
    /// When set, socket events are relayed across server instances through Redis pub/sub.
    pub redis_url: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5000,
            ws_port: 5001,
            database_url: "sqlite:data/bidhub.db".to_string(),
            session_expiry_days: 7,
            argon2_salt_length: 16,
            max_message_length: 2048,
            message_page_size: 50,
            platform_fee_percent: 5.0,
            cors_origin: None,
            redis_url: None,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let defaults = Self::default();

        let port = parse_or("SERVER_PORT", defaults.port);
        Self {
            host: env::var("SERVER_HOST").unwrap_or(defaults.host),
            port,
            // socket server listens one port above the HTTP API unless told otherwise
            ws_port: parse_or("WS_PORT", port.saturating_add(1)),
            database_url: env::var("DATABASE_URL").unwrap_or(defaults.database_url),
            session_expiry_days: parse_or("SESSION_EXPIRY_DAYS", defaults.session_expiry_days),
            argon2_salt_length: parse_or("ARGON2_SALT_LENGTH", defaults.argon2_salt_length),
            max_message_length: parse_or("MAX_MESSAGE_LENGTH", defaults.max_message_length),
            message_page_size: parse_or("MESSAGE_PAGE_SIZE", defaults.message_page_size),
            platform_fee_percent: parse_or("PLATFORM_FEE_PERCENT", defaults.platform_fee_percent),
            cors_origin: env::var("CORS_ORIGIN").ok().filter(|v| !v.is_empty()),
            redis_url: env::var("REDIS_URL").ok().filter(|v| !v.is_empty()),
        }
    }

    pub fn http_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn ws_addr(&self) -> String {
        format!("{}:{}", self.host, self.ws_port)
    }

    pub fn session_ttl_secs(&self) -> i64 {
        60 * 60 * 24 * self.session_expiry_days as i64
    }
}

/// Installs env_logger filtered by `LOG_LEVEL` (default `info`).
/// Must run before [`ServerConfig::from_env`], which logs invalid values.
pub fn init_logging() {
    dotenvy::dotenv().ok();
    let env = env_logger::Env::default().filter_or("LOG_LEVEL", "info");
    if env_logger::Builder::from_env(env).try_init().is_err() {
        log::debug!("[CONFIG] Logger already installed");
    }
}

fn parse_or<T: FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            log::warn!("[CONFIG] Invalid value for {}: {:?}, using default", key, raw);
            default
        }),
        Err(_) => default,
    }
}
