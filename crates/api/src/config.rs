//! Service configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use common::GoodsId;
use saga::{PublishMode, Topics};
use thiserror::Error;

use crate::telemetry::LogFormat;

/// A variable was set to a value that cannot be used.
#[derive(Debug, Error)]
#[error("invalid value '{value}' for {name}: {reason}")]
pub struct ConfigError {
    pub name: &'static str,
    pub value: String,
    pub reason: String,
}

/// Configuration shared by the order and goods services.
///
/// Reads from environment variables:
/// - `HOST` (default: `"0.0.0.0"`), `HTTP_BIND` (port, default: `3000`)
/// - `METRICS_PORT`: optional second listener serving `/metrics`
/// - `DATABASE_URL`: Postgres; unset means in-memory stores
/// - `DATABASE_MAX_CONNECTIONS` (default: `10`)
/// - `KAFKA_BROKERS`: unset means the in-memory broker
/// - `CONSUMER_GROUP`: overrides the service's default group
/// - `ORDER_CREATED_TOPIC`, `GOODS_CREATED_TOPIC`, `GOODS_REJECTED_TOPIC`, `DEAD_LETTER_TOPIC`
/// - `PUBLISH_TIMEOUT_MS` (default: `5000`), `REDELIVERY_DELAY_MS` (default: `500`)
/// - `PUBLISH_MODE`: `direct` (default) or `outbox`
/// - `OUTBOX_POLL_MS` (default: `200`)
/// - `STUCK_ORDER_THRESHOLD_SECS` (default: `300`), `STUCK_ORDER_SWEEP_SECS` (default: `60`)
/// - `STUCK_ORDER_REPUBLISH` (default: `false`)
/// - `GOODS_SEED`: initial stock as `id:qty,id:qty`
/// - `LOG_FORMAT`: `pretty` (default) or `json`
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub http_port: u16,
    pub metrics_port: Option<u16>,
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub kafka_brokers: Option<String>,
    pub consumer_group: Option<String>,
    pub topics: Topics,
    pub publish_timeout: Duration,
    pub redelivery_delay: Duration,
    pub publish_mode: PublishMode,
    pub outbox_poll_interval: Duration,
    pub stuck_order_threshold: Duration,
    pub stuck_order_sweep_interval: Duration,
    pub stuck_order_republish: bool,
    pub goods_seed: Vec<(GoodsId, i64)>,
    pub log_format: LogFormat,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Loads configuration through `lookup`. Blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();
        let topics = Topics::from_lookup(&lookup);
        topics.validate().map_err(|clash| ConfigError {
            name: clash.second,
            value: clash.topic.clone(),
            reason: format!("topic is already used by {}", clash.first),
        })?;

        Ok(Self {
            host: get("HOST").unwrap_or(defaults.host),
            http_port: parse(&get, "HTTP_BIND")?.unwrap_or(defaults.http_port),
            metrics_port: parse(&get, "METRICS_PORT")?,
            database_url: get("DATABASE_URL"),
            database_max_connections: parse(&get, "DATABASE_MAX_CONNECTIONS")?
                .unwrap_or(defaults.database_max_connections),
            kafka_brokers: get("KAFKA_BROKERS"),
            consumer_group: get("CONSUMER_GROUP"),
            topics,
            publish_timeout: millis(&get, "PUBLISH_TIMEOUT_MS")?
                .unwrap_or(defaults.publish_timeout),
            redelivery_delay: millis(&get, "REDELIVERY_DELAY_MS")?
                .unwrap_or(defaults.redelivery_delay),
            publish_mode: parse(&get, "PUBLISH_MODE")?.unwrap_or(defaults.publish_mode),
            outbox_poll_interval: millis(&get, "OUTBOX_POLL_MS")?
                .unwrap_or(defaults.outbox_poll_interval),
            stuck_order_threshold: secs(&get, "STUCK_ORDER_THRESHOLD_SECS")?
                .unwrap_or(defaults.stuck_order_threshold),
            stuck_order_sweep_interval: secs(&get, "STUCK_ORDER_SWEEP_SECS")?
                .unwrap_or(defaults.stuck_order_sweep_interval),
            stuck_order_republish: parse(&get, "STUCK_ORDER_REPUBLISH")?
                .unwrap_or(defaults.stuck_order_republish),
            goods_seed: match get("GOODS_SEED") {
                Some(raw) => parse_goods_seed(&raw)?,
                None => defaults.goods_seed,
            },
            log_format: parse(&get, "LOG_FORMAT")?.unwrap_or(defaults.log_format),
        })
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.http_port)
    }

    /// Returns the metrics listener address, if one is configured.
    pub fn metrics_addr(&self) -> Option<String> {
        self.metrics_port.map(|port| format!("{}:{port}", self.host))
    }

    /// The consumer group to join, or `default` when none is configured.
    pub fn consumer_group_or(&self, default: &str) -> String {
        self.consumer_group
            .clone()
            .unwrap_or_else(|| default.to_string())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            http_port: 3000,
            metrics_port: None,
            database_url: None,
            database_max_connections: 10,
            kafka_brokers: None,
            consumer_group: None,
            topics: Topics::default(),
            publish_timeout: broker::DEFAULT_PUBLISH_TIMEOUT,
            redelivery_delay: Duration::from_millis(500),
            publish_mode: PublishMode::Direct,
            outbox_poll_interval: saga::relay::DEFAULT_POLL_INTERVAL,
            stuck_order_threshold: Duration::from_secs(300),
            stuck_order_sweep_interval: Duration::from_secs(60),
            stuck_order_republish: false,
            goods_seed: Vec::new(),
            log_format: LogFormat::Pretty,
        }
    }
}

fn parse<T>(
    get: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    get(name)
        .map(|raw| {
            raw.trim().parse::<T>().map_err(|e| ConfigError {
                name,
                value: raw.clone(),
                reason: e.to_string(),
            })
        })
        .transpose()
}

fn millis(
    get: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<Duration>, ConfigError> {
    Ok(parse::<u64>(get, name)?.map(Duration::from_millis))
}

fn secs(
    get: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<Duration>, ConfigError> {
    Ok(parse::<u64>(get, name)?.map(Duration::from_secs))
}

/// Parses `"1:10,2:5"` into stock levels.
pub fn parse_goods_seed(raw: &str) -> Result<Vec<(GoodsId, i64)>, ConfigError> {
    let invalid = |reason: &str| ConfigError {
        name: "GOODS_SEED",
        value: raw.to_string(),
        reason: reason.to_string(),
    };

    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (id, quantity) = entry
                .split_once(':')
                .ok_or_else(|| invalid("entries must look like id:quantity"))?;
            let id: i64 = id
                .trim()
                .parse()
                .map_err(|_| invalid("goods id is not an integer"))?;
            let quantity: i64 = quantity
                .trim()
                .parse()
                .map_err(|_| invalid("quantity is not an integer"))?;
            if quantity < 0 {
                return Err(invalid("quantity must not be negative"));
            }
            Ok((GoodsId::new(id), quantity))
        })
        .collect()
}
