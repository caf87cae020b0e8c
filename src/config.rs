use anyhow::{Context, Result, anyhow};
use std::{
    env,
    net::SocketAddr,
    str::FromStr,
    time::Duration,
};

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub bind_addr: SocketAddr,
    pub upstream: UpstreamConfig,
    pub max_body_bytes: usize,
    pub log_format: LogFormat,
    pub store: StoreConfig,
    pub trust_proxy: bool,
    pub limiters: Vec<LimiterConfig>,
}

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AppEnv {
    Production,
    #[default]
    Development,
    Test,
}

impl AppEnv {
    /// The test environment never talks to a remote counter store.
    pub fn uses_remote_store(self) -> bool {
        !matches!(self, Self::Test)
    }
}

impl FromStr for AppEnv {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "production" | "prod" => Ok(Self::Production),
            "development" | "dev" => Ok(Self::Development),
            "test" => Ok(Self::Test),
            other => Err(anyhow!("unsupported APP_ENV: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub app_env: AppEnv,
    pub redis: Option<RedisConfig>,
    pub key_prefix: String,
    pub cleanup_interval: Duration,
    /// `None` keeps the store on the in-process fallback for the rest of the
    /// process lifetime once the remote backend fails.
    pub reconnect_interval: Option<Duration>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            app_env: AppEnv::Development,
            redis: None,
            key_prefix: "church:".to_string(),
            cleanup_interval: Duration::from_secs(60),
            reconnect_interval: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub db: i64,
    pub tls: bool,
    pub max_retries: usize,
    pub retry_delay: Duration,
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
}

impl RedisConfig {
    /// Connection URL without credentials; the password is attached to the
    /// parsed connection info so it never needs URL escaping.
    pub fn connection_url(&self) -> String {
        let scheme = if self.tls { "rediss" } else { "redis" };
        format!("{scheme}://{}:{}/{}", self.host, self.port, self.db)
    }
}

#[derive(Debug, Clone)]
pub struct LimiterConfig {
    pub name: String,
    pub window: Duration,
    pub max: u64,
    pub path_prefixes: Vec<String>,
    pub message: String,
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_source(|key| env::var(key).ok())
    }

    pub fn from_source<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let src = Source(&lookup);

        let bind_addr = src
            .string("BIND_ADDR", "0.0.0.0:8080")
            .parse::<SocketAddr>()
            .context("invalid BIND_ADDR")?;

        let base_url = src
            .string("UPSTREAM_URL", "http://127.0.0.1:3066")
            .trim()
            .trim_end_matches('/')
            .to_string();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(anyhow!("invalid UPSTREAM_URL: {base_url}"));
        }
        let upstream = UpstreamConfig {
            base_url,
            timeout: Duration::from_millis(src.parse("UPSTREAM_TIMEOUT_MS", 10_000u64).max(100)),
        };

        let log_format = match src.string("LOG_FORMAT", "compact").to_ascii_lowercase().as_str() {
            "compact" | "text" => LogFormat::Compact,
            "json" => LogFormat::Json,
            other => return Err(anyhow!("unsupported LOG_FORMAT: {other}")),
        };

        let app_env = src.string("APP_ENV", "development").parse::<AppEnv>()?;

        let redis = src
            .optional("REDIS_HOST")
            .map(|host| RedisConfig {
                host,
                port: src.parse("REDIS_PORT", 6379u16),
                password: src.optional("REDIS_PASSWORD"),
                db: src.parse("REDIS_DB", 0i64),
                tls: src.parse("REDIS_TLS", false),
                max_retries: src.parse("REDIS_MAX_RETRIES", 3usize),
                retry_delay: Duration::from_millis(src.parse("REDIS_RETRY_DELAY_MS", 100u64)),
                connect_timeout: Duration::from_millis(
                    src.parse("REDIS_CONNECT_TIMEOUT_MS", 5_000u64).max(1),
                ),
                command_timeout: Duration::from_millis(
                    src.parse("REDIS_COMMAND_TIMEOUT_MS", 1_000u64).max(1),
                ),
            });

        let reconnect_secs = src.parse("RATE_LIMIT_RECONNECT_INTERVAL_SECS", 0u64);
        let store = StoreConfig {
            app_env,
            redis,
            key_prefix: src.string("REDIS_KEY_PREFIX", "church:"),
            cleanup_interval: Duration::from_secs(
                src.parse("RATE_LIMIT_CLEANUP_INTERVAL_SECS", 60u64).max(1),
            ),
            reconnect_interval: (reconnect_secs > 0).then(|| Duration::from_secs(reconnect_secs)),
        };

        let limiters = vec![
            LimiterConfig {
                name: "login".to_string(),
                window: Duration::from_millis(src.parse("RATE_LIMIT_LOGIN_WINDOW_MS", 900_000u64)),
                max: src.parse("RATE_LIMIT_LOGIN_MAX", 10u64),
                path_prefixes: src.csv("RATE_LIMIT_LOGIN_PATHS", "/api/auth/login"),
                message: "Too many login attempts, please try again later.".to_string(),
            },
            LimiterConfig {
                name: "api".to_string(),
                window: Duration::from_millis(src.parse("RATE_LIMIT_API_WINDOW_MS", 60_000u64)),
                max: src.parse("RATE_LIMIT_API_MAX", 300u64),
                path_prefixes: src.csv("RATE_LIMIT_API_PATHS", "/api"),
                message: "Too many requests, please try again later.".to_string(),
            },
        ];

        Ok(Self {
            bind_addr,
            upstream,
            max_body_bytes: src.parse("MAX_BODY_BYTES", 1_048_576usize),
            log_format,
            store,
            trust_proxy: src.parse("RATE_LIMIT_TRUST_PROXY", false),
            limiters,
        })
    }
}

struct Source<'a, F>(&'a F);

impl<F> Source<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn optional(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.optional(key).unwrap_or_else(|| default.to_string())
    }

    fn csv(&self, key: &str, default: &str) -> Vec<String> {
        self.string(key, default)
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToString::to_string)
            .collect()
    }

    fn parse<T>(&self, key: &str, default: T) -> T
    where
        T: FromStr,
    {
        self.optional(key)
            .and_then(|s| s.parse::<T>().ok())
            .unwrap_or(default)
    }
}
