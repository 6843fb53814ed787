//! Runtime configuration read from environment variables (after `.env` is
//! loaded). Empty values count as unset.

use std::{str::FromStr, time::Duration};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{key} has invalid value {value:?}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    /// `None` runs on the in-memory store.
    pub database: Option<DatabaseConfig>,
    pub provider: ProviderConfig,
    /// `None` logs confirmation emails instead of sending them.
    pub mailer: Option<MailerConfig>,
    /// `None` disables the admin routes.
    pub admin_token: Option<String>,
    pub reconcile: ReconcileConfig,
    pub sweeper: SweeperConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub body_limit_bytes: usize,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub base_url: String,
    pub access_token: String,
    pub timeout: Duration,
    pub notification_url: Option<String>,
    pub success_url: Option<String>,
    pub failure_url: Option<String>,
    pub pending_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MailerConfig {
    pub base_url: String,
    pub api_key: String,
    pub from: String,
}

#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    pub dispatch_timeout: Duration,
    pub lock_timeout: Duration,
    pub status_cache_ttl: Duration,
}

#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// Zero disables the sweeper.
    pub interval: Duration,
    pub pending_min_age: Duration,
    pub pending_max_age: Duration,
    /// Records of each class examined per sweep. Never zero.
    pub batch_size: u32,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env(&lookup);

        let body_limit_kb: usize = env.parse_or("SERVER_BODY_LIMIT_KB", 64)?;
        let server = ServerConfig {
            port: env.parse_or("SERVER_PORT", 3000)?,
            body_limit_bytes: body_limit_kb
                .checked_mul(1024)
                .ok_or_else(|| ConfigError::Invalid {
                    key: "SERVER_BODY_LIMIT_KB",
                    value: body_limit_kb.to_string(),
                })?,
            request_timeout: env.secs_or("SERVER_TIMEOUT_SECS", 15)?,
        };

        let database = match env.get("DATABASE_URL") {
            Some(url) => Some(DatabaseConfig {
                url,
                max_connections: env.parse_or("DATABASE_MAX_CONNECTIONS", 20)?,
            }),
            None => None,
        };

        let provider = ProviderConfig {
            base_url: env
                .get("PROVIDER_BASE_URL")
                .unwrap_or_else(|| "https://api.mercadopago.com".to_string()),
            access_token: env.require("PROVIDER_ACCESS_TOKEN")?,
            timeout: env.secs_or("PROVIDER_TIMEOUT_SECS", 10)?,
            notification_url: env.get("PROVIDER_NOTIFICATION_URL"),
            success_url: env.get("CHECKOUT_SUCCESS_URL"),
            failure_url: env.get("CHECKOUT_FAILURE_URL"),
            pending_url: env.get("CHECKOUT_PENDING_URL"),
        };

        let mailer = match env.get("MAILER_BASE_URL") {
            Some(base_url) => Some(MailerConfig {
                base_url,
                api_key: env.require("MAILER_API_KEY")?,
                from: env.require("MAILER_FROM")?,
            }),
            None => None,
        };

        let reconcile = ReconcileConfig {
            dispatch_timeout: env.secs_or("DISPATCH_TIMEOUT_SECS", 10)?,
            lock_timeout: env.secs_or("LOCK_TIMEOUT_SECS", 5)?,
            status_cache_ttl: env.secs_or("STATUS_CACHE_TTL_SECS", 3)?,
        };

        let sweeper = SweeperConfig {
            interval: env.secs_or("SWEEP_INTERVAL_SECS", 60)?,
            pending_min_age: env.secs_or("SWEEP_PENDING_MIN_AGE_SECS", 300)?,
            pending_max_age: env.secs_or("SWEEP_PENDING_MAX_AGE_SECS", 172_800)?,
            batch_size: env.parse_or("SWEEP_BATCH_SIZE", 50)?,
        };
        if sweeper.batch_size == 0 {
            return Err(ConfigError::Invalid {
                key: "SWEEP_BATCH_SIZE",
                value: "0".to_string(),
            });
        }
        if sweeper.pending_min_age > sweeper.pending_max_age {
            return Err(ConfigError::Invalid {
                key: "SWEEP_PENDING_MIN_AGE_SECS",
                value: sweeper.pending_min_age.as_secs().to_string(),
            });
        }

        Ok(Self {
            server,
            database,
            provider,
            mailer,
            admin_token: env.get("ADMIN_TOKEN"),
            reconcile,
            sweeper,
        })
    }
}

struct Env<'a, F>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn require(&self, key: &'static str) -> Result<String, ConfigError> {
        self.get(key).ok_or(ConfigError::Missing(key))
    }

    fn parse_or<T: FromStr>(&self, key: &'static str, default: T) -> Result<T, ConfigError> {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => raw
                .parse()
                .map_err(|_| ConfigError::Invalid { key, value: raw }),
        }
    }

    fn secs_or(&self, key: &'static str, default: u64) -> Result<Duration, ConfigError> {
        self.parse_or(key, default).map(Duration::from_secs)
    }
}
