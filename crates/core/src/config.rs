use std::collections::HashMap;
use std::env;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

/// Profiled variable lookup: tries `{PROFILE}_{KEY}` first, falls back to `{KEY}`.
/// Empty values count as unset.
struct Profiled<'a> {
    profile: &'a str,
    lookup: &'a dyn Fn(&str) -> Option<String>,
}

impl Profiled<'_> {
    fn opt(&self, key: &str) -> Option<String> {
        if !self.profile.is_empty() {
            let prefixed = format!("{}_{}", self.profile, key);
            if let Some(v) = (self.lookup)(&prefixed).filter(|s| !s.is_empty()) {
                return Some(v);
            }
        }
        (self.lookup)(key).filter(|s| !s.is_empty())
    }

    fn or(&self, key: &str, default: &str) -> String {
        self.opt(key).unwrap_or_else(|| default.to_string())
    }

    fn parse<T: FromStr>(&self, key: &'static str, default: T) -> Result<T, ConfigError> {
        match self.opt(key) {
            Some(v) => v
                .trim()
                .parse()
                .map_err(|_| ConfigError::Invalid { key, value: v }),
            None => Ok(default),
        }
    }
}

/// Defines a string-backed config enum with `FromStr`/`Display`.
macro_rules! config_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $token:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $token),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ();

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.to_ascii_lowercase().as_str() {
                    $($token => Ok($name::$variant),)+
                    _ => Err(()),
                }
            }
        }
    };
}

config_enum!(
    /// Where the ingress publishes and the consumer pool subscribes.
    BrokerBackend { Memory => "memory", Amqp => "amqp" }
);

config_enum!(
    /// Which `UserStore` implementation backs reads and writes.
    StoreBackend { Memory => "memory", Partitioned => "partitioned", DynamoDb => "dynamodb" }
);

config_enum!(
    MetricsSinkKind { Log => "log", Axiom => "axiom" }
);

config_enum!(
    /// What the consumer does with a delivery whose store update failed.
    DurabilityMode { AckAlways => "ack-always", RetryThenDeadLetter => "retry-dead-letter" }
);

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Active profile name (empty = default).
    pub profile: String,
    pub server: ServerConfig,
    pub broker: BrokerConfig,
    pub store: StoreConfig,
    pub metrics: MetricsConfig,
}

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `TWINDER_PROFILE`. When set (e.g. `PROD`), every
    /// key is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let profile = env::var("TWINDER_PROFILE").unwrap_or_default();
        Self::for_profile(&profile)
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Result<Self, ConfigError> {
        Self::from_lookup(profile, &|key: &str| env::var(key).ok())
    }

    /// Build config from an explicit variable map instead of the process env.
    pub fn from_vars(profile: &str, vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        Self::from_lookup(profile, &|key: &str| vars.get(key).cloned())
    }

    fn from_lookup(
        profile: &str,
        lookup: &dyn Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let p = profile.to_uppercase();
        let vars = Profiled { profile: &p, lookup };
        Ok(Self {
            profile: p.clone(),
            server: ServerConfig::from_profiled(&vars)?,
            broker: BrokerConfig::from_profiled(&vars)?,
            store: StoreConfig::from_profiled(&vars)?,
            metrics: MetricsConfig::from_profiled(&vars)?,
        })
    }

    /// Fail fast on settings that would only break at first use.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.backend == BrokerBackend::Amqp && self.broker.host.is_none() {
            return Err(ConfigError::Missing("RABBITMQ_HOST"));
        }
        if self.broker.prefetch == 0 {
            return Err(ConfigError::Invalid {
                key: "CONSUMER_PREFETCH",
                value: "0".into(),
            });
        }
        if self.broker.concurrency == 0 {
            return Err(ConfigError::Invalid {
                key: "CONSUMER_CONCURRENCY",
                value: "0".into(),
            });
        }
        if self.broker.apply_max_attempts == 0 {
            return Err(ConfigError::Invalid {
                key: "APPLY_MAX_ATTEMPTS",
                value: "0".into(),
            });
        }
        if self.store.shard_count == 0 {
            return Err(ConfigError::Invalid {
                key: "STORE_SHARD_COUNT",
                value: "0".into(),
            });
        }
        if self.store.shard_width <= 0 {
            return Err(ConfigError::Invalid {
                key: "STORE_SHARD_WIDTH",
                value: self.store.shard_width.to_string(),
            });
        }
        if self.metrics.sink == MetricsSinkKind::Axiom {
            if self.metrics.axiom_dataset.is_none() {
                return Err(ConfigError::Missing("AXIOM_DATASET"));
            }
            if self.metrics.axiom_api_token.is_none() {
                return Err(ConfigError::Missing("AXIOM_API_TOKEN"));
            }
        }
        Ok(())
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Print a redacted summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!("  server:   {}:{}", self.server.host, self.server.port);
        tracing::info!(
            "  broker:   backend={}, exchange={}, group={}, prefetch={}, concurrency={}, durability={}",
            self.broker.backend,
            self.broker.exchange,
            self.broker.consumer_group,
            self.broker.prefetch,
            self.broker.concurrency,
            self.broker.durability
        );
        tracing::info!(
            "  store:    backend={}, shards={}x{}, prefix={}, timeout={}ms",
            self.store.backend,
            self.store.shard_count,
            self.store.shard_width,
            self.store.table_prefix,
            self.store.timeout_ms
        );
        tracing::info!(
            "  metrics:  sink={}, flush={}s, instance={}",
            self.metrics.sink,
            self.metrics.flush_secs,
            self.metrics.instance_id
        );
    }
}

// ── Server ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub cors_origin: String,
}

impl ServerConfig {
    fn from_profiled(p: &Profiled<'_>) -> Result<Self, ConfigError> {
        Ok(Self {
            host: p.or("HOST", "0.0.0.0"),
            port: p.parse("PORT", 8080)?,
            cors_origin: p.or("CORS_ORIGIN", "*"),
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

// ── Broker / consumer ─────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub backend: BrokerBackend,
    pub host: Option<String>,
    pub port: u16,
    pub username: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub exchange: String,
    /// Consumer group (queue) name. Empty = server-named, auto-delete.
    pub consumer_group: String,
    pub prefetch: u16,
    pub concurrency: usize,
    pub durability: DurabilityMode,
    pub dead_letter_exchange: String,
    pub apply_max_attempts: u32,
    pub apply_backoff_ms: u64,
}

impl BrokerConfig {
    fn from_profiled(p: &Profiled<'_>) -> Result<Self, ConfigError> {
        Ok(Self {
            backend: parse_enum(p, "BROKER_BACKEND", BrokerBackend::Memory)?,
            host: p.opt("RABBITMQ_HOST"),
            port: p.parse("RABBITMQ_PORT", 5672)?,
            username: p.or("RABBITMQ_USER", "guest"),
            password: p.or("RABBITMQ_PASSWORD", "guest"),
            exchange: p.or("BROKER_EXCHANGE", "swipes"),
            consumer_group: p.or("CONSUMER_GROUP", "swipe-aggregator"),
            prefetch: p.parse("CONSUMER_PREFETCH", 128)?,
            concurrency: p.parse("CONSUMER_CONCURRENCY", 4)?,
            durability: parse_enum(p, "DURABILITY_MODE", DurabilityMode::AckAlways)?,
            dead_letter_exchange: p.or("DEAD_LETTER_EXCHANGE", "swipes.dead"),
            apply_max_attempts: p.parse("APPLY_MAX_ATTEMPTS", 3)?,
            apply_backoff_ms: p.parse("APPLY_BACKOFF_MS", 100)?,
        })
    }

    /// AMQP connection URI on the default vhost. `None` when no host is set.
    pub fn amqp_uri(&self) -> Option<String> {
        self.host.as_ref().map(|host| {
            format!(
                "amqp://{}:{}@{}:{}/%2f",
                self.username, self.password, host, self.port
            )
        })
    }
}

// ── Store ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub region: String,
    pub access_key_id: Option<String>,
    #[serde(skip_serializing)]
    pub secret_access_key: Option<String>,
    #[serde(skip_serializing)]
    pub session_token: Option<String>,
    pub endpoint_url: Option<String>,
    pub table_prefix: String,
    pub shard_count: usize,
    pub shard_width: i64,
    pub timeout_ms: u64,
}

impl StoreConfig {
    fn from_profiled(p: &Profiled<'_>) -> Result<Self, ConfigError> {
        Ok(Self {
            backend: parse_enum(p, "STORE_BACKEND", StoreBackend::Partitioned)?,
            region: p.or("AWS_REGION", "us-east-2"),
            access_key_id: p.opt("AWS_ACCESS_KEY_ID"),
            secret_access_key: p.opt("AWS_SECRET_ACCESS_KEY"),
            session_token: p.opt("AWS_SESSION_TOKEN"),
            endpoint_url: p.opt("AWS_ENDPOINT_URL"),
            table_prefix: p.or("STORE_TABLE_PREFIX", "SwipeData"),
            shard_count: p.parse("STORE_SHARD_COUNT", 5)?,
            shard_width: p.parse("STORE_SHARD_WIDTH", 1000)?,
            timeout_ms: p.parse("STORE_TIMEOUT_MS", 2000)?,
        })
    }
}

// ── Metrics ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    pub sink: MetricsSinkKind,
    pub axiom_url: String,
    pub axiom_dataset: Option<String>,
    #[serde(skip_serializing)]
    pub axiom_api_token: Option<String>,
    pub flush_secs: u64,
    /// Identifies this process in throughput points.
    pub instance_id: String,
}

impl MetricsConfig {
    fn from_profiled(p: &Profiled<'_>) -> Result<Self, ConfigError> {
        let instance_id = p
            .opt("INSTANCE_ID")
            .or_else(|| p.opt("HOSTNAME"))
            .unwrap_or_else(|| "local".to_string());
        Ok(Self {
            sink: parse_enum(p, "METRICS_SINK", MetricsSinkKind::Log)?,
            axiom_url: p.or("AXIOM_URL", "https://api.axiom.co"),
            axiom_dataset: p.opt("AXIOM_DATASET"),
            axiom_api_token: p.opt("AXIOM_API_TOKEN"),
            flush_secs: p.parse("METRICS_FLUSH_SECS", 5)?,
            instance_id,
        })
    }
}

fn parse_enum<T: FromStr>(p: &Profiled<'_>, key: &'static str, default: T) -> Result<T, ConfigError> {
    match p.opt(key) {
        Some(v) => v.parse().map_err(|_| ConfigError::Invalid { key, value: v }),
        None => Ok(default),
    }
}
