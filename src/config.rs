use std::env;
use std::time::Duration;

use crate::error::AppError;
use crate::models::order::Amount;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Compact,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.to_ascii_lowercase().as_str() {
            "compact" => Ok(LogFormat::Compact),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("expected compact or json, got {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub http_port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    /// Capacity of each per-order event channel.
    pub event_buffer_size: usize,
    pub dispatch_buffer_size: usize,
    /// How long an order may sit unclaimed in the pool before it is flagged.
    pub stale_ready_after: Duration,
    pub stale_sweep_interval: Duration,
    pub min_delivery_order: Amount,
    pub delivery_fee: Amount,
    pub delivery_enabled: bool,
    pub tracking_interval: Duration,
    pub tracking_jitter: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_port: 3000,
            log_level: "info".to_string(),
            log_format: LogFormat::Compact,
            event_buffer_size: 256,
            dispatch_buffer_size: 1024,
            stale_ready_after: Duration::from_secs(900),
            stale_sweep_interval: Duration::from_secs(30),
            min_delivery_order: 10_000,
            delivery_fee: 0,
            delivery_enabled: true,
            tracking_interval: Duration::from_secs(10),
            tracking_jitter: Duration::from_millis(1_500),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        let _ = dotenvy::dotenv();
        let defaults = Config::default();

        Ok(Self {
            http_port: parse_or_default("HTTP_PORT", defaults.http_port)?,
            log_level: env::var("LOG_LEVEL").unwrap_or(defaults.log_level),
            log_format: parse_or_default("LOG_FORMAT", defaults.log_format)?,
            event_buffer_size: parse_or_default("EVENT_BUFFER_SIZE", defaults.event_buffer_size)?,
            dispatch_buffer_size: parse_or_default(
                "DISPATCH_BUFFER_SIZE",
                defaults.dispatch_buffer_size,
            )?,
            stale_ready_after: Duration::from_secs(parse_or_default(
                "STALE_READY_SECS",
                defaults.stale_ready_after.as_secs(),
            )?),
            stale_sweep_interval: Duration::from_secs(parse_or_default(
                "STALE_SWEEP_INTERVAL_SECS",
                defaults.stale_sweep_interval.as_secs(),
            )?),
            min_delivery_order: parse_or_default("MIN_DELIVERY_ORDER", defaults.min_delivery_order)?,
            delivery_fee: parse_or_default("DELIVERY_FEE", defaults.delivery_fee)?,
            delivery_enabled: parse_or_default("DELIVERY_ENABLED", defaults.delivery_enabled)?,
            tracking_interval: Duration::from_secs(parse_or_default(
                "TRACKING_INTERVAL_SECS",
                defaults.tracking_interval.as_secs(),
            )?),
            tracking_jitter: Duration::from_millis(parse_or_default(
                "TRACKING_JITTER_MS",
                defaults.tracking_jitter.as_millis() as u64,
            )?),
        }
        .validated()?)
    }

    fn validated(self) -> Result<Self, AppError> {
        if self.event_buffer_size == 0 || self.dispatch_buffer_size == 0 {
            return Err(AppError::Internal(
                "event buffer sizes must be > 0".to_string(),
            ));
        }
        if self.stale_sweep_interval.is_zero() || self.tracking_interval.is_zero() {
            return Err(AppError::Internal("intervals must be > 0".to_string()));
        }
        if self.min_delivery_order < 0 || self.delivery_fee < 0 {
            return Err(AppError::Internal(
                "delivery amounts must not be negative".to_string(),
            ));
        }
        Ok(self)
    }
}

fn parse_or_default<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|err| AppError::Internal(format!("invalid {key}: {err}"))),
        Err(_) => Ok(default),
    }
}
