//! Delay ranges of the form `"<min> to <max>"`

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Inclusive range of whole seconds a delay is drawn from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DelayRange {
    min_secs: u64,
    max_secs: u64,
}

/// Why a delay range string was rejected
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DelayRangeError {
    #[error("expected \"<min> to <max>\", e.g. \"60 to 300\"")]
    Malformed,

    #[error("minimum {min} is greater than maximum {max}")]
    Inverted { min: u64, max: u64 },

    #[error("bound {value} exceeds the {limit}s limit")]
    TooLong { value: u64, limit: u64 },
}

/// Longest accepted delay bound: one year
pub const MAX_DELAY_SECS: u64 = 365 * 24 * 3600;

fn pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)(\d+(?:\.\d+)?)\s*to\s*(\d+(?:\.\d+)?)").expect("delay range regex")
    })
}

impl DelayRange {
    /// One to five hours, used to re-space a repaired backlog
    pub const REPAIR_DEFAULT: DelayRange = DelayRange {
        min_secs: 3600,
        max_secs: 18_000,
    };

    /// Create a range of whole seconds
    pub fn new(min_secs: u64, max_secs: u64) -> Result<Self, DelayRangeError> {
        if let Some(value) = [min_secs, max_secs].into_iter().find(|v| *v > MAX_DELAY_SECS) {
            return Err(DelayRangeError::TooLong {
                value,
                limit: MAX_DELAY_SECS,
            });
        }
        if min_secs > max_secs {
            return Err(DelayRangeError::Inverted {
                min: min_secs,
                max: max_secs,
            });
        }
        Ok(Self { min_secs, max_secs })
    }

    /// Parse `"<min> to <max>"`, case-insensitive, fractional bounds floored
    pub fn parse(input: &str) -> Result<Self, DelayRangeError> {
        let captures = pattern()
            .captures(input)
            .ok_or(DelayRangeError::Malformed)?;

        let bound = |i: usize| -> Result<u64, DelayRangeError> {
            let value: f64 = captures[i].parse().map_err(|_| DelayRangeError::Malformed)?;
            if !value.is_finite() || value > u64::MAX as f64 {
                return Err(DelayRangeError::Malformed);
            }
            Ok(value.floor() as u64)
        };

        Self::new(bound(1)?, bound(2)?)
    }

    pub fn min_secs(&self) -> u64 {
        self.min_secs
    }

    pub fn max_secs(&self) -> u64 {
        self.max_secs
    }

    /// Draw a delay uniformly from `[min, max]` inclusive
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> u64 {
        rng.gen_range(self.min_secs..=self.max_secs)
    }
}

impl FromStr for DelayRange {
    type Err = DelayRangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for DelayRange {
    type Error = DelayRangeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<DelayRange> for String {
    fn from(value: DelayRange) -> Self {
        value.to_string()
    }
}

impl fmt::Display for DelayRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} to {}", self.min_secs, self.max_secs)
    }
}
