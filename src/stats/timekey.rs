//! Canonical Time Keys
//! Mission: Bijective mapping between a period start and its string key
//!
//! Formats per granularity: `YYYYMMDDThh`, `YYYYMMDD`, `YYYYMM`, `YYYY`.
//! All windows are half-open `[start, end)` in UTC.

use crate::errors::CoreError;
use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Granularity {
    #[serde(rename = "HOUR")]
    Hour,
    #[serde(rename = "DAY")]
    Day,
    #[serde(rename = "MONTH")]
    Month,
    #[serde(rename = "YEAR")]
    Year,
}

impl Granularity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Hour => "HOUR",
            Granularity::Day => "DAY",
            Granularity::Month => "MONTH",
            Granularity::Year => "YEAR",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s.to_uppercase().as_str() {
            "HOUR" => Ok(Granularity::Hour),
            "DAY" => Ok(Granularity::Day),
            "MONTH" => Ok(Granularity::Month),
            "YEAR" => Ok(Granularity::Year),
            other => Err(CoreError::validation(format!("unknown granularity: {}", other))),
        }
    }

    /// The coarser granularity this one rolls up into.
    pub fn parent(&self) -> Option<Granularity> {
        match self {
            Granularity::Hour => Some(Granularity::Day),
            Granularity::Day => Some(Granularity::Month),
            Granularity::Month => Some(Granularity::Year),
            Granularity::Year => None,
        }
    }

    /// The finer granularity this one is derived from.
    pub fn child(&self) -> Option<Granularity> {
        match self {
            Granularity::Hour => None,
            Granularity::Day => Some(Granularity::Hour),
            Granularity::Month => Some(Granularity::Day),
            Granularity::Year => Some(Granularity::Month),
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A period identified by granularity and canonical key string.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TimeKey {
    pub granularity: Granularity,
    pub key: String,
    pub period_start: DateTime<Utc>,
}

impl TimeKey {
    /// Truncate `t` to the enclosing period of `granularity` and derive the key.
    pub fn new(granularity: Granularity, t: DateTime<Utc>) -> Self {
        let period_start = truncate(granularity, t);
        let key = match granularity {
            Granularity::Hour => period_start.format("%Y%m%dT%H").to_string(),
            Granularity::Day => period_start.format("%Y%m%d").to_string(),
            Granularity::Month => period_start.format("%Y%m").to_string(),
            Granularity::Year => period_start.format("%Y").to_string(),
        };
        Self {
            granularity,
            key,
            period_start,
        }
    }

    /// Parse a canonical key back into its period start.
    pub fn parse(granularity: Granularity, key: &str) -> Result<Self, CoreError> {
        let bad = |k: &str| CoreError::validation(format!("malformed time key: {}", k));
        if !key.is_ascii() {
            return Err(bad(key));
        }
        let digits = |s: &str| -> Result<i64, CoreError> {
            s.parse::<i64>().map_err(|_| bad(key))
        };

        let (y, m, d, h) = match granularity {
            Granularity::Hour => {
                if key.len() != 11 || key.as_bytes()[8] != b'T' {
                    return Err(bad(key));
                }
                (
                    digits(&key[0..4])?,
                    digits(&key[4..6])?,
                    digits(&key[6..8])?,
                    digits(&key[9..11])?,
                )
            }
            Granularity::Day => {
                if key.len() != 8 {
                    return Err(bad(key));
                }
                (digits(&key[0..4])?, digits(&key[4..6])?, digits(&key[6..8])?, 0)
            }
            Granularity::Month => {
                if key.len() != 6 {
                    return Err(bad(key));
                }
                (digits(&key[0..4])?, digits(&key[4..6])?, 1, 0)
            }
            Granularity::Year => {
                if key.len() != 4 {
                    return Err(bad(key));
                }
                (digits(key)?, 1, 1, 0)
            }
        };

        let period_start = Utc
            .with_ymd_and_hms(y as i32, m as u32, d as u32, h as u32, 0, 0)
            .single()
            .ok_or_else(|| bad(key))?;

        let round_trip = TimeKey::new(granularity, period_start);
        if round_trip.key != key {
            return Err(bad(key));
        }
        Ok(round_trip)
    }

    /// Exclusive end of this period.
    pub fn period_end(&self) -> DateTime<Utc> {
        let s = self.period_start;
        match self.granularity {
            Granularity::Hour => s + chrono::Duration::hours(1),
            Granularity::Day => s + chrono::Duration::days(1),
            Granularity::Month => {
                let (y, m) = if s.month() == 12 {
                    (s.year() + 1, 1)
                } else {
                    (s.year(), s.month() + 1)
                };
                utc_start(y, m, 1, 0)
            }
            Granularity::Year => utc_start(s.year() + 1, 1, 1, 0),
        }
    }

    /// Number of child periods that must exist before this period is complete.
    /// HOUR has no children.
    pub fn expected_children(&self) -> u32 {
        match self.granularity {
            Granularity::Hour => 0,
            Granularity::Day => 24,
            Granularity::Month => {
                let days = (self.period_end() - self.period_start).num_days();
                days as u32
            }
            Granularity::Year => 12,
        }
    }
}

/// Truncate `t` down to the start of its enclosing period.
pub fn truncate(granularity: Granularity, t: DateTime<Utc>) -> DateTime<Utc> {
    match granularity {
        Granularity::Hour => utc_start(t.year(), t.month(), t.day(), t.hour()),
        Granularity::Day => utc_start(t.year(), t.month(), t.day(), 0),
        Granularity::Month => utc_start(t.year(), t.month(), 1, 0),
        Granularity::Year => utc_start(t.year(), 1, 1, 0),
    }
}

fn utc_start(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
    // Components come from an existing DateTime, so this cannot fail.
    Utc.with_ymd_and_hms(y, m, d, h, 0, 0)
        .single()
        .expect("valid calendar components")
}
