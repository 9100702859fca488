//! Runtime Configuration
//! Mission: Collect every tunable from the environment in one place

use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub db_path: String,
    pub jwt_secret: String,

    /// Shared secret for the telemetry webhook HMAC. Unsigned ingest is
    /// accepted when unset.
    pub ingest_hmac_secret: Option<String>,
    /// Allowed clock skew for signed ingest, seconds.
    pub ingest_skew_secs: i64,

    pub dispatch_interval_ms: u64,
    pub dispatch_batch: usize,
    /// Handler failures tolerated before an outbox row goes to the DLQ.
    pub dispatch_max_attempts: u32,

    pub command_ttl_secs: i64,
    pub command_timeout_secs: i64,
    pub device_gateway_url: String,

    pub strategy_interval_secs: u64,
    pub timeout_sweep_interval_secs: u64,

    /// Hours expected in a day rollup. Production value is 24; tests shrink it.
    pub expected_hours: u32,
    pub default_currency: String,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            bind_addr: env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            db_path: env::var("DB_PATH").unwrap_or_else(|_| "gridcell.db".to_string()),
            jwt_secret: env::var("JWT_SECRET")
                .unwrap_or_else(|_| "dev-secret-change-in-production".to_string()),
            ingest_hmac_secret: env::var("INGEST_HMAC_SECRET").ok().filter(|s| !s.is_empty()),
            ingest_skew_secs: parse_env("INGEST_SKEW_SECS", 300),
            dispatch_interval_ms: parse_env("DISPATCH_INTERVAL_MS", 1_000),
            dispatch_batch: parse_env("DISPATCH_BATCH", 100),
            dispatch_max_attempts: parse_env("DISPATCH_MAX_ATTEMPTS", 5),
            command_ttl_secs: parse_env("COMMAND_TTL_SECS", 600),
            command_timeout_secs: parse_env("COMMAND_TIMEOUT_SECS", 60),
            device_gateway_url: env::var("DEVICE_GATEWAY_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:9090".to_string()),
            strategy_interval_secs: parse_env("STRATEGY_INTERVAL_SECS", 60),
            timeout_sweep_interval_secs: parse_env("TIMEOUT_SWEEP_INTERVAL_SECS", 60),
            expected_hours: parse_env("ROLLUP_EXPECTED_HOURS", 24),
            default_currency: env::var("DEFAULT_CURRENCY").unwrap_or_else(|_| "CNY".to_string()),
        }
    }
}

fn parse_env<T: std::str::FromStr + Copy>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}
