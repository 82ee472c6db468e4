//! Process configuration read from the environment

use std::str::FromStr;

use chrono_tz::Tz;

use crate::schedule::BusinessHours;

pub const DEFAULT_CRM_BASE_URL: &str = "https://rest.gohighlevel.com/v1";
pub const DEFAULT_CONSUMER_GROUP: &str = "drip-workers";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{name} is not a valid number: {value}")]
    InvalidNumber { name: &'static str, value: String },

    #[error("invalid business hours: start {start}, end {end}")]
    InvalidWindow { start: u32, end: u32 },

    #[error("unknown timezone: {0}")]
    InvalidTimezone(String),
}

/// Settings shared by the scheduler and worker binaries
#[derive(Debug, Clone)]
pub struct DripConfig {
    pub database_url: String,
    pub database_max_connections: u32,
    pub redis_url: String,
    pub worker_id: Option<String>,
    pub consumer_group: String,
    pub crm_base_url: String,
    pub alert_webhook_url: Option<String>,
    hours: BusinessHours,
    default_timezone: Tz,
}

impl DripConfig {
    /// Read configuration from the process environment
    ///
    /// Environment variables:
    /// - `DATABASE_URL` (required)
    /// - `DATABASE_MAX_CONNECTIONS` (default: 10)
    /// - `REDIS_URL` (required)
    /// - `WORKER_ID` (default: generated per process)
    /// - `CONSUMER_GROUP` (default: "drip-workers")
    /// - `CRM_BASE_URL` (default: "https://rest.gohighlevel.com/v1")
    /// - `ALERT_WEBHOOK_URL` (optional)
    /// - `BUSINESS_START_HOUR` / `BUSINESS_END_HOUR` (default: 8 / 20)
    /// - `DEFAULT_TIMEZONE` (default: "America/New_York")
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let database_url = var("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;
        let redis_url = var("REDIS_URL").ok_or(ConfigError::Missing("REDIS_URL"))?;
        let database_max_connections =
            parse_number("DATABASE_MAX_CONNECTIONS", var("DATABASE_MAX_CONNECTIONS"), 10)?;

        let start = parse_number("BUSINESS_START_HOUR", var("BUSINESS_START_HOUR"), 8)?;
        let end = parse_number("BUSINESS_END_HOUR", var("BUSINESS_END_HOUR"), 20)?;
        let hours =
            BusinessHours::new(start, end).map_err(|e| ConfigError::InvalidWindow {
                start: e.start,
                end: e.end,
            })?;

        let timezone = var("DEFAULT_TIMEZONE").unwrap_or_else(|| "America/New_York".to_string());
        let default_timezone =
            Tz::from_str(timezone.trim()).map_err(|_| ConfigError::InvalidTimezone(timezone))?;

        Ok(Self {
            database_url,
            database_max_connections,
            redis_url,
            worker_id: var("WORKER_ID"),
            consumer_group: var("CONSUMER_GROUP")
                .unwrap_or_else(|| DEFAULT_CONSUMER_GROUP.to_string()),
            crm_base_url: var("CRM_BASE_URL").unwrap_or_else(|| DEFAULT_CRM_BASE_URL.to_string()),
            alert_webhook_url: var("ALERT_WEBHOOK_URL"),
            hours,
            default_timezone,
        })
    }

    pub fn business_hours(&self) -> BusinessHours {
        self.hours
    }

    pub fn default_timezone(&self) -> Tz {
        self.default_timezone
    }
}

fn parse_number<T: FromStr>(
    name: &'static str,
    value: Option<String>,
    default: T,
) -> Result<T, ConfigError> {
    match value {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidNumber { name, value: raw }),
    }
}
