//! Command-line and environment configuration.
//!
//! Every setting can be given as a flag or through the environment variable
//! named next to it; `main` loads a `.env` file first so the usual deployment
//! only needs that file. [`Settings`] is the validated form handed to the
//! scheduler.

use crate::broker::mqtt::{DEFAULT_PORT, MqttSettings};
use crate::identity::canonicalize;
use crate::key::{DeviceBinding, ParseKeyError, PresharedKey};
use crate::scanner::Backend;
use clap::Parser;
use std::time::Duration;
use thiserror::Error;

/// Raw options as parsed by clap.
#[derive(Parser, Debug, Clone)]
#[command(author, about, version)]
pub struct Options {
    /// Bluetooth address of the charge controller, any separator style.
    /// Format: AA:BB:CC:DD:EE:FF or aabbccddeeff
    #[arg(long, env = "DEVICE_IDENTITY")]
    pub device_identity: String,

    /// Advertisement encryption key from the VictronConnect app (32 hex characters)
    #[arg(long, env = "PRESHARED_KEY", hide_env_values = true)]
    pub preshared_key: String,

    /// MQTT broker host name or address
    #[arg(long, env = "BROKER_HOST")]
    pub broker_host: String,

    /// MQTT broker port
    #[arg(long, env = "BROKER_PORT", default_value_t = DEFAULT_PORT)]
    pub broker_port: u16,

    /// MQTT user name
    #[arg(long, env = "BROKER_USER")]
    pub broker_user: String,

    /// MQTT password
    #[arg(long, env = "BROKER_PASSWORD", hide_env_values = true)]
    pub broker_password: String,

    /// Time between publish cycles.
    /// Accepts duration with suffix: 3s, 1m, 500ms, 2h.
    /// Without suffix, value is interpreted as seconds.
    #[arg(long, default_value = "30s", value_parser = parse_duration)]
    pub interval: Duration,

    /// How long the startup scan listens for the device
    #[arg(long, default_value = "5s", value_parser = parse_duration)]
    pub scan_window: Duration,

    /// Upper bound on each MQTT publish call
    #[arg(long, default_value = "5s", value_parser = parse_duration)]
    pub publish_timeout: Duration,

    /// Scan this long before every cycle to pick up a fresh advertisement.
    /// Off by default: the payload found at startup is reused.
    #[arg(long, value_parser = parse_duration)]
    pub refresh_window: Option<Duration>,

    /// Re-run discovery after this many consecutive decode failures
    #[arg(long)]
    pub rediscover_after: Option<u32>,

    /// Bluetooth scanner backend to use
    #[arg(long, default_value_t, value_enum)]
    pub backend: Backend,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

/// Invalid or missing configuration.
#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),
    #[error("invalid PRESHARED_KEY: {0}")]
    InvalidKey(#[from] ParseKeyError),
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
    #[error("--rediscover-after must be at least 1")]
    ZeroRediscover,
}

/// Validated configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub binding: DeviceBinding,
    pub mqtt: MqttSettings,
    pub interval: Duration,
    pub scan_window: Duration,
    pub publish_timeout: Duration,
    pub refresh_window: Option<Duration>,
    pub rediscover_after: Option<u32>,
    pub backend: Backend,
}

fn required(value: String, name: &'static str) -> Result<String, ConfigError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ConfigError::Missing(name));
    }
    Ok(trimmed.to_string())
}

fn non_zero(value: Duration, name: &'static str) -> Result<Duration, ConfigError> {
    if value.is_zero() {
        return Err(ConfigError::ZeroDuration(name));
    }
    Ok(value)
}

impl TryFrom<Options> for Settings {
    type Error = ConfigError;

    fn try_from(options: Options) -> Result<Self, Self::Error> {
        let identity = canonicalize(&required(options.device_identity, "DEVICE_IDENTITY")?);
        let key: PresharedKey = required(options.preshared_key, "PRESHARED_KEY")?.parse()?;
        let host = required(options.broker_host, "BROKER_HOST")?;
        let username = required(options.broker_user, "BROKER_USER")?;
        let password = required(options.broker_password, "BROKER_PASSWORD")?;

        if options.rediscover_after == Some(0) {
            return Err(ConfigError::ZeroRediscover);
        }

        Ok(Settings {
            binding: DeviceBinding { identity, key },
            mqtt: MqttSettings {
                host,
                port: options.broker_port,
                username,
                password,
                client_id: format!("victron-ble-mqtt-{}", std::process::id()),
            },
            interval: non_zero(options.interval, "--interval")?,
            scan_window: non_zero(options.scan_window, "--scan-window")?,
            publish_timeout: non_zero(options.publish_timeout, "--publish-timeout")?,
            refresh_window: options
                .refresh_window
                .map(|w| non_zero(w, "--refresh-window"))
                .transpose()?,
            rediscover_after: options.rediscover_after,
            backend: options.backend,
        })
    }
}

/// Parse a duration from a human-readable string.
///
/// Supports the following suffixes:
/// - `s` or no suffix: seconds
/// - `m`: minutes
/// - `h`: hours
/// - `ms`: milliseconds
///
/// # Examples
/// ```
/// use victron_ble_mqtt::config::parse_duration;
/// use std::time::Duration;
///
/// assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
/// assert_eq!(parse_duration("1m").unwrap(), Duration::from_secs(60));
/// assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
/// ```
pub fn parse_duration(src: &str) -> Result<Duration, String> {
    let src = src.trim();

    if src.is_empty() {
        return Err("empty duration string".to_string());
    }

    let (num, unit_secs, label) = if let Some(num) = src.strip_suffix("ms") {
        let millis: u64 = num
            .trim()
            .parse()
            .map_err(|_| format!("invalid milliseconds: {}", num))?;
        return Ok(Duration::from_millis(millis));
    } else if let Some(num) = src.strip_suffix('h') {
        (num, 3600, "hours")
    } else if let Some(num) = src.strip_suffix('m') {
        (num, 60, "minutes")
    } else if let Some(num) = src.strip_suffix('s') {
        (num, 1, "seconds")
    } else {
        (src, 1, "duration")
    };

    let value: u64 = num
        .trim()
        .parse()
        .map_err(|_| format!("invalid {}: {}", label, num))?;
    let secs = value
        .checked_mul(unit_secs)
        .ok_or_else(|| format!("duration too large: {}", src))?;
    Ok(Duration::from_secs(secs))
}
