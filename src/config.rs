use std::time::Duration;

/// Process configuration, read once from the environment at startup.
///
/// Nothing outside [`Config::from_env`] calls [`std::env::var`] directly;
/// the full set of recognized variables is discoverable by reading this
/// file.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub database_replica_url: Option<String>,
    pub redis_url: String,
    pub jwt_secret: String,
    pub jwt_refresh_secret: String,
    pub frontend_url: String,
    pub node_env: NodeEnv,
    pub server_port: u16,
    pub enable_metrics: bool,
    pub replica_lag_threshold: Duration,
    pub access_token_ttl: Duration,
    pub refresh_token_ttl: Duration,
    pub max_connections_per_user: usize,
    pub ws_max_frame_bytes: usize,
    pub delivery: DeliveryPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeEnv {
    Development,
    Test,
    Production,
}

impl NodeEnv {
    fn parse(raw: &str) -> Self {
        match raw {
            "production" => NodeEnv::Production,
            "test" => NodeEnv::Test,
            _ => NodeEnv::Development,
        }
    }

    pub fn requires_tls(self) -> bool {
        matches!(self, NodeEnv::Production)
    }
}

/// Delivery Worker policy defaults (spec §4.4), overridable via env.
#[derive(Debug, Clone, Copy)]
pub struct DeliveryPolicy {
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub batch_size: usize,
    pub poll_interval: Duration,
    pub error_backoff: Duration,
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            retry_delay: Duration::from_secs(60),
            batch_size: 10,
            poll_interval: Duration::from_secs(1),
            error_backoff: Duration::from_secs(5),
        }
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_secs(key: &str, default_secs: u64) -> Duration {
    Duration::from_secs(env_parsed(key, default_secs))
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
        let redis_url =
            std::env::var("REDIS_URL").map_err(|_| anyhow::anyhow!("REDIS_URL must be set"))?;
        let jwt_secret =
            std::env::var("JWT_SECRET").map_err(|_| anyhow::anyhow!("JWT_SECRET must be set"))?;
        let jwt_refresh_secret = std::env::var("JWT_REFRESH_SECRET")
            .map_err(|_| anyhow::anyhow!("JWT_REFRESH_SECRET must be set"))?;

        Ok(Self {
            database_url,
            database_replica_url: std::env::var("DATABASE_REPLICA_URL").ok(),
            redis_url,
            jwt_secret,
            jwt_refresh_secret,
            frontend_url: env_string("FRONTEND_URL", "http://localhost:3000"),
            node_env: NodeEnv::parse(&env_string("NODE_ENV", "development")),
            server_port: env_parsed("SERVER_PORT", 8080),
            enable_metrics: env_parsed("ENABLE_METRICS", false),
            replica_lag_threshold: env_secs("REPLICA_LAG_THRESHOLD_SECS", 10),
            access_token_ttl: env_secs("ACCESS_TOKEN_TTL_SECS", 900),
            refresh_token_ttl: env_secs("REFRESH_TOKEN_TTL_SECS", 604_800),
            max_connections_per_user: env_parsed("MAX_CONNECTIONS_PER_USER", 5),
            ws_max_frame_bytes: env_parsed("WS_MAX_FRAME_BYTES", 1_048_576),
            delivery: DeliveryPolicy {
                max_retries: env_parsed("DELIVERY_MAX_RETRIES", 5),
                retry_delay: env_secs("DELIVERY_RETRY_DELAY_SECS", 60),
                batch_size: env_parsed("DELIVERY_BATCH_SIZE", 10),
                poll_interval: env_secs("DELIVERY_POLL_INTERVAL_SECS", 1),
                error_backoff: env_secs("DELIVERY_ERROR_BACKOFF_SECS", 5),
            },
        })
    }

    pub fn log_level(&self) -> String {
        std::env::var("RUST_LOG").unwrap_or_else(|_| {
            #[cfg(debug_assertions)]
            {
                "debug".to_string()
            }
            #[cfg(not(debug_assertions))]
            {
                "warn".to_string()
            }
        })
    }
}
