use anyhow::{anyhow, bail, Context, Result};
use dotenvy::dotenv;
use sqlx::postgres::PgSslMode;
use std::env;
use std::str::FromStr;
use std::time::Duration;

const MAX_RETRIES_CEILING: u32 = 16;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Text,
}

#[derive(Clone, Debug)]
pub struct KafkaTls {
    pub key_location: String,
    pub certificate_location: String,
    pub ca_location: String,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub broker_list: String,
    pub topic: String,
    pub group_id: String,
    pub auto_offset_reset: String,
    pub client_id: String,
    pub kafka_tls: Option<KafkaTls>,

    pub pg_host: String,
    pub pg_port: u16,
    pub pg_user: String,
    pub pg_password: String,
    pub pg_database: String,
    pub pg_table: String,
    pub pg_ssl_mode: PgSslMode,
    pub pg_connect_timeout: Duration,
    pub pg_command_timeout: Duration,

    pub queue_capacity: usize,
    pub poll_timeout_ms: u64,
    pub backoff_base_ms: u64,
    pub max_retries: u32,
    pub shutdown_grace_ms: u64,

    pub log_format: LogFormat,
    pub otlp_endpoint: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds and validates the configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars { lookup };

        let broker_list = vars.string("KAPG_BROKER_LIST", "localhost:9092")?;
        let broker_list = broker_list
            .split(',')
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .collect::<Vec<_>>()
            .join(",");
        if broker_list.is_empty() {
            bail!("KAPG_BROKER_LIST must name at least one broker");
        }

        let topic = vars.string("KAPG_KAFKA_TOPIC", "pagemonitor_metrics")?;
        if topic.is_empty() {
            bail!("KAPG_KAFKA_TOPIC must not be empty");
        }
        let group_id = vars.string("KAPG_GROUP_ID", "42")?;
        if group_id.is_empty() {
            bail!("KAPG_GROUP_ID must not be empty");
        }
        let auto_offset_reset = vars.string("KAPG_AUTOOFFSETRESET", "earliest")?.to_ascii_lowercase();
        if !matches!(auto_offset_reset.as_str(), "earliest" | "latest" | "error") {
            bail!("invalid KAPG_AUTOOFFSETRESET {auto_offset_reset:?}; expected earliest, latest or error");
        }
        let client_id = vars.string(
            "KAPG_KAFKA_CLIENT_ID",
            &format!("kafka-pg-relay-{}", std::process::id()),
        )?;

        let kafka_tls = if vars.flag("KAPG_KAFKA_ENABLE_CERT_AUTH", false)? {
            Some(KafkaTls {
                key_location: vars.required("KAPG_KAFKA_SSL_KEY")?,
                certificate_location: vars.required("KAPG_KAFKA_SSL_CERT")?,
                ca_location: vars.required("KAPG_KAFKA_SSL_CA")?,
            })
        } else {
            None
        };

        let pg_host = vars.string("KAPG_PG_HOST", "localhost")?;
        let pg_port = vars.parsed::<u16>("KAPG_PG_PORT", 5432)?;
        if pg_port == 0 {
            bail!("KAPG_PG_PORT must not be 0");
        }
        let pg_user = vars.string("KAPG_PG_USER", "postgres")?;
        let pg_password = vars.string("KAPG_PG_PWD", "foopwd")?;
        let pg_database = vars.string("KAPG_PG_DB_NAME", "metrics")?;
        let pg_table = vars.string("KAPG_PG_TABLE_NAME", "pagemonitor")?;
        if !is_plain_identifier(&pg_table) {
            bail!("KAPG_PG_TABLE_NAME {pg_table:?} is not a plain SQL identifier");
        }
        let pg_ssl_mode = vars
            .string("KAPG_PG_SSLMODE", "prefer")
            .and_then(|raw| {
                PgSslMode::from_str(&raw).map_err(|err| anyhow!("invalid KAPG_PG_SSLMODE: {err}"))
            })?;
        let pg_connect_timeout = vars.seconds("KAPG_PG_CONN_TIMEOUT", 10.0)?;
        let pg_command_timeout = vars.seconds("KAPG_PG_COMMAND_TIMEOUT", 10.0)?;

        let queue_capacity = vars.parsed::<usize>("KAPG_QUEUE_CAPACITY", 100)?;
        if queue_capacity == 0 {
            bail!("KAPG_QUEUE_CAPACITY must be at least 1");
        }
        let poll_timeout_ms = vars.parsed::<u64>("KAPG_POLL_TIMEOUT_MS", 1000)?;
        if poll_timeout_ms == 0 {
            bail!("KAPG_POLL_TIMEOUT_MS must be greater than 0");
        }
        let backoff_base_ms = vars.parsed::<u64>("KAPG_BACKOFF_BASE_MS", 500)?;
        if backoff_base_ms == 0 {
            bail!("KAPG_BACKOFF_BASE_MS must be greater than 0");
        }
        let max_retries = vars.parsed::<u32>("KAPG_MAX_RETRIES", 5)?;
        if max_retries == 0 || max_retries > MAX_RETRIES_CEILING {
            bail!("KAPG_MAX_RETRIES must be between 1 and {MAX_RETRIES_CEILING}");
        }
        let shutdown_grace_ms = vars.parsed::<u64>("KAPG_SHUTDOWN_GRACE_MS", 10_000)?;

        let log_format = match vars.string("KAPG_LOG_FORMAT", "json")?.to_ascii_lowercase().as_str() {
            "json" => LogFormat::Json,
            "text" | "pretty" => LogFormat::Text,
            other => bail!("invalid KAPG_LOG_FORMAT {other:?}; expected json or text"),
        };
        let otlp_endpoint = vars.optional("OTEL_EXPORTER_OTLP_ENDPOINT");

        Ok(Self {
            broker_list,
            topic,
            group_id,
            auto_offset_reset,
            client_id,
            kafka_tls,
            pg_host,
            pg_port,
            pg_user,
            pg_password,
            pg_database,
            pg_table,
            pg_ssl_mode,
            pg_connect_timeout,
            pg_command_timeout,
            queue_capacity,
            poll_timeout_ms,
            backoff_base_ms,
            max_retries,
            shutdown_grace_ms,
            log_format,
            otlp_endpoint,
        })
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Emits the effective configuration as a single event, password redacted.
    pub fn log_summary(&self) {
        tracing::info!(
            bin = %env::args().next().unwrap_or_default(),
            version = env!("CARGO_PKG_VERSION"),
            brokers = %self.broker_list,
            topic = %self.topic,
            group_id = %self.group_id,
            auto_offset_reset = %self.auto_offset_reset,
            client_id = %self.client_id,
            kafka_cert_auth = self.kafka_tls.is_some(),
            pg_host = %self.pg_host,
            pg_port = self.pg_port,
            pg_user = %self.pg_user,
            pg_password = "<redacted>",
            pg_database = %self.pg_database,
            pg_table = %self.pg_table,
            pg_ssl_mode = ?self.pg_ssl_mode,
            pg_connect_timeout_ms = self.pg_connect_timeout.as_millis() as u64,
            pg_command_timeout_ms = self.pg_command_timeout.as_millis() as u64,
            queue_capacity = self.queue_capacity,
            poll_timeout_ms = self.poll_timeout_ms,
            backoff_base_ms = self.backoff_base_ms,
            max_retries = self.max_retries,
            shutdown_grace_ms = self.shutdown_grace_ms,
            "kafka-pg-relay configuration loaded"
        );
    }
}

struct Vars<F> {
    lookup: F,
}

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn optional(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn string(&self, key: &str, default: &str) -> Result<String> {
        Ok(self.optional(key).unwrap_or_else(|| default.to_string()))
    }

    fn required(&self, key: &str) -> Result<String> {
        self.optional(key)
            .ok_or_else(|| anyhow!("missing env var {key}"))
    }

    fn parsed<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: std::error::Error + Send + Sync + 'static,
    {
        match self.optional(key) {
            Some(raw) => raw.parse::<T>().with_context(|| format!("invalid {key}: {raw:?}")),
            None => Ok(default),
        }
    }

    fn flag(&self, key: &str, default: bool) -> Result<bool> {
        match self.optional(key) {
            Some(raw) => match raw.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => bail!("invalid {key}: {raw:?}"),
            },
            None => Ok(default),
        }
    }

    fn seconds(&self, key: &str, default: f64) -> Result<Duration> {
        let secs = self.parsed::<f64>(key, default)?;
        if !secs.is_finite() || secs <= 0.0 {
            bail!("{key} must be a positive number of seconds");
        }
        Ok(Duration::from_secs_f64(secs))
    }
}

fn is_plain_identifier(value: &str) -> bool {
    let mut chars = value.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    value.len() <= 63 && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
