use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::retry::RetryPolicy;

/// Server settings, read once at startup from `SEATLINE_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    /// WAL frames appended before the background compactor rewrites the log.
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub retry: RetryPolicy,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unparseable values fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        fn parsed<T: FromStr>(raw: Option<String>) -> Option<T> {
            raw.and_then(|v| v.trim().parse().ok())
        }
        let ms = |key: &str| parsed(lookup(key)).map(Duration::from_millis);

        let defaults = RetryPolicy::default();
        let retry = RetryPolicy {
            max_retries: parsed(lookup("SEATLINE_RETRY_MAX")).unwrap_or(defaults.max_retries),
            initial_delay: ms("SEATLINE_RETRY_INITIAL_MS").unwrap_or(defaults.initial_delay),
            max_delay: ms("SEATLINE_RETRY_MAX_DELAY_MS").unwrap_or(defaults.max_delay),
            multiplier: defaults.multiplier,
        };

        Self {
            port: parsed(lookup("SEATLINE_PORT")).unwrap_or(5433),
            bind: lookup("SEATLINE_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            data_dir: PathBuf::from(lookup("SEATLINE_DATA_DIR").unwrap_or_else(|| "./data".into())),
            password: lookup("SEATLINE_PASSWORD").unwrap_or_else(|| "seatline".into()),
            max_connections: parsed(lookup("SEATLINE_MAX_CONNECTIONS")).unwrap_or(256),
            compact_threshold: parsed(lookup("SEATLINE_COMPACT_THRESHOLD")).unwrap_or(1000),
            metrics_port: parsed(lookup("SEATLINE_METRICS_PORT")),
            tls_cert: lookup("SEATLINE_TLS_CERT"),
            tls_key: lookup("SEATLINE_TLS_KEY"),
            retry,
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}
