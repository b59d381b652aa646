//! Runtime configuration from environment variables.
//! Defaults match a USB RS-485 adapter on a stock Infinity bus.

use std::str::FromStr;
use std::time::Duration;

use crate::bus::{DEFAULT_BAUD_RATE, TransportSettings};
use crate::engine::PersistencePolicy;
use crate::status::DEFAULT_CACHE_AGE;

pub const DEFAULT_STATUS_SECS: u64 = 60;

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Serial device; `None` picks the first USB adapter found.
    pub serial_port: Option<String>,
    pub baud_rate: u32,
    pub transport: TransportSettings,
    pub persistence: PersistencePolicy,
    /// Status polling cadence.
    pub status_interval: Duration,
    /// How long a cached table may stand in for a failed read.
    pub status_cache_age: Duration,
    /// Let the schedule runner drive setpoints.
    pub schedule_enabled: bool,
    /// Talk to the in-process simulator instead of a serial port.
    pub simulate: bool,
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, String> {
        let get = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let defaults = TransportSettings::default();
        let read_timeout_ms = parse(&get, "READ_TIMEOUT_MS", defaults.read_timeout.as_millis() as u64)?;
        let max_attempts = parse(&get, "MAX_ATTEMPTS", defaults.max_attempts)?;
        if read_timeout_ms == 0 || max_attempts == 0 {
            return Err("READ_TIMEOUT_MS and MAX_ATTEMPTS must be at least 1".to_string());
        }

        let policy = PersistencePolicy::default();
        let rounds = parse(&get, "WRITE_ROUNDS", policy.rounds)?;
        if rounds == 0 {
            return Err("WRITE_ROUNDS must be at least 1".to_string());
        }
        let interval_secs = parse(&get, "WRITE_INTERVAL_SECS", policy.interval.as_secs())?;

        let status_secs = parse(&get, "STATUS_INTERVAL_SECS", DEFAULT_STATUS_SECS)?;
        if status_secs == 0 {
            return Err("STATUS_INTERVAL_SECS must be at least 1".to_string());
        }

        Ok(Config {
            serial_port: get("SERIAL_PORT"),
            baud_rate: parse(&get, "BAUD_RATE", DEFAULT_BAUD_RATE)?,
            transport: TransportSettings {
                read_timeout: Duration::from_millis(read_timeout_ms),
                max_attempts,
            },
            persistence: PersistencePolicy {
                rounds,
                interval: Duration::from_secs(interval_secs),
            },
            status_interval: Duration::from_secs(status_secs),
            status_cache_age: Duration::from_secs(parse(&get, "STATUS_CACHE_SECS", DEFAULT_CACHE_AGE.as_secs())?),
            schedule_enabled: flag(&get, "SCHEDULE_ENABLED", true)?,
            simulate: flag(&get, "BUS_SIMULATE", false)?,
        })
    }
}

fn parse<T: FromStr>(get: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T, String> {
    match get(name) {
        Some(raw) => raw
            .parse::<T>()
            .map_err(|_| format!("{} must be a non-negative integer, got {:?}", name, raw)),
        None => Ok(default),
    }
}

fn flag(get: &impl Fn(&str) -> Option<String>, name: &str, default: bool) -> Result<bool, String> {
    match get(name).as_deref() {
        Some("1" | "true" | "TRUE" | "yes") => Ok(true),
        Some("0" | "false" | "FALSE" | "no") => Ok(false),
        Some(other) => Err(format!("{} must be true or false, got {:?}", name, other)),
        None => Ok(default),
    }
}
