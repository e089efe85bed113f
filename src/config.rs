//! Agent configuration
//!
//! Built once per process from a comma-separated `key=value` argument
//! string (the form the injection bootstrap hands over), with optional
//! `KUBEDB_MONITOR_*` environment overrides applied on top. Parsing
//! never fails: an unrecognized or invalid value falls back to its
//! default and is logged once.

use std::str::FromStr;
use tracing::warn;

/// Emitter selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectorKind {
    Stdout,
    Http,
    Composite,
}

impl Default for CollectorKind {
    fn default() -> Self {
        Self::Composite
    }
}

impl CollectorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Http => "http",
            Self::Composite => "composite",
        }
    }
}

impl std::fmt::Display for CollectorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for CollectorKind {
    type Err = &'static str;

    fn from_str(raw: &str) -> std::result::Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "stdout" => Ok(Self::Stdout),
            "http" => Ok(Self::Http),
            "composite" => Ok(Self::Composite),
            _ => Err("invalid collector kind; expected stdout|http|composite"),
        }
    }
}

/// Immutable agent configuration
#[derive(Debug, Clone, PartialEq)]
pub struct AgentConfig {
    /// Master switch; when off the interceptor is a no-op
    pub enabled: bool,
    /// Probability that a non-erroring QueryExecuted is emitted, in [0, 1]
    pub sampling_rate: f64,
    /// URL schemes whose connections are observed
    pub db_types: Vec<String>,
    /// Replace literals with `?` in emitted SQL
    pub mask_sql_params: bool,
    /// Duration above which a query is also emitted as SlowQuery
    pub slow_query_threshold_ms: u64,
    /// Age beyond which an ACTIVE transaction yields LongRunningTransaction
    pub long_tx_threshold_ms: u64,
    /// Emitter selection
    pub collector_kind: CollectorKind,
    /// Remote sink URL
    pub collector_endpoint: Option<String>,
    /// Restrict interception to lifecycle events
    pub safe_mode: bool,
    /// Bounded emission queue size
    pub queue_capacity: usize,
    /// Periodic deadlock cycle-check tick
    pub deadlock_check_interval_ms: u64,
    /// Long-tx / TPS sweep tick
    pub sweep_interval_ms: u64,
    /// Maximum transactions visited per sweep tick
    pub sweep_budget: usize,
    /// Maximum events drained per batch
    pub batch_size: usize,
    /// Maximum wait for a partial batch
    pub batch_timeout_ms: u64,
    /// HttpSink request deadline
    pub http_timeout_ms: u64,
    /// Drain deadline on shutdown
    pub shutdown_drain_ms: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sampling_rate: 1.0,
            db_types: default_db_types(),
            mask_sql_params: true,
            slow_query_threshold_ms: 1000,
            long_tx_threshold_ms: 5000,
            collector_kind: CollectorKind::Composite,
            collector_endpoint: None,
            safe_mode: false,
            queue_capacity: 10_000,
            deadlock_check_interval_ms: 1000,
            sweep_interval_ms: 1000,
            sweep_budget: 1000,
            batch_size: 200,
            batch_timeout_ms: 100,
            http_timeout_ms: 2000,
            shutdown_drain_ms: 3000,
        }
    }
}

fn default_db_types() -> Vec<String> {
    vec![
        "mysql".to_string(),
        "postgresql".to_string(),
        "h2".to_string(),
    ]
}

impl AgentConfig {
    /// Parse a comma-separated `key=value` argument string.
    ///
    /// Unknown keys and invalid values are logged and ignored; the
    /// result is always usable.
    pub fn parse(args: &str) -> Self {
        let mut cfg = Self::default();
        for pair in args.split(',') {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }
            match pair.split_once('=') {
                Some((key, value)) => cfg.apply(key.trim(), value.trim(), pair),
                None => warn!("Ignoring malformed config entry \"{pair}\" (expected key=value)"),
            }
        }
        cfg.apply_env_overrides();
        cfg
    }

    /// Whether a driver URL scheme is observed under this configuration.
    pub fn observes_scheme(&self, scheme: &str) -> bool {
        let scheme = scheme.to_ascii_lowercase();
        self.enabled && self.db_types.iter().any(|t| *t == scheme)
    }

    fn apply(&mut self, key: &str, value: &str, raw: &str) {
        match key {
            "enabled" => set_bool(&mut self.enabled, key, value),
            "sampling-rate" => {
                match value.parse::<f64>() {
                    Ok(rate) if (0.0..=1.0).contains(&rate) => self.sampling_rate = rate,
                    _ => warn_fallback(key, value, &self.sampling_rate.to_string()),
                };
            }
            "db-types" => {
                let types = parse_scheme_list(value);
                if types.is_empty() {
                    warn_fallback(key, value, &self.db_types.join(","));
                } else {
                    self.db_types = types;
                }
            }
            "mask-sql-params" => set_bool(&mut self.mask_sql_params, key, value),
            "slow-query-threshold-ms" => set_u64(&mut self.slow_query_threshold_ms, key, value),
            "long-tx-threshold-ms" => set_u64(&mut self.long_tx_threshold_ms, key, value),
            "collector-kind" => match value.parse::<CollectorKind>() {
                Ok(kind) => self.collector_kind = kind,
                Err(_) => warn_fallback(key, value, self.collector_kind.as_str()),
            },
            "collector-endpoint" => {
                if value.is_empty() {
                    self.collector_endpoint = None;
                } else {
                    self.collector_endpoint = Some(value.to_string());
                }
            }
            "safe-mode" => set_bool(&mut self.safe_mode, key, value),
            "queue-capacity" => set_nonzero_usize(&mut self.queue_capacity, key, value),
            "deadlock-check-interval-ms" => {
                set_nonzero_u64(&mut self.deadlock_check_interval_ms, key, value)
            }
            "sweep-interval-ms" => set_nonzero_u64(&mut self.sweep_interval_ms, key, value),
            "sweep-budget" => set_nonzero_usize(&mut self.sweep_budget, key, value),
            "batch-size" => set_nonzero_usize(&mut self.batch_size, key, value),
            "batch-timeout-ms" => set_nonzero_u64(&mut self.batch_timeout_ms, key, value),
            "http-timeout-ms" => set_nonzero_u64(&mut self.http_timeout_ms, key, value),
            "shutdown-drain-ms" => set_u64(&mut self.shutdown_drain_ms, key, value),
            _ => warn!("Ignoring unknown config entry \"{raw}\""),
        }
    }

    fn apply_env_overrides(&mut self) {
        const KEYS: &[&str] = &[
            "enabled",
            "sampling-rate",
            "db-types",
            "mask-sql-params",
            "slow-query-threshold-ms",
            "long-tx-threshold-ms",
            "collector-kind",
            "collector-endpoint",
            "safe-mode",
            "queue-capacity",
            "deadlock-check-interval-ms",
            "sweep-interval-ms",
            "sweep-budget",
            "batch-size",
            "batch-timeout-ms",
            "http-timeout-ms",
            "shutdown-drain-ms",
        ];
        for key in KEYS {
            let env_key = format!(
                "KUBEDB_MONITOR_{}",
                key.replace('-', "_").to_ascii_uppercase()
            );
            if let Ok(value) = std::env::var(&env_key) {
                self.apply(key, value.trim(), &env_key);
            }
        }
    }
}

fn warn_fallback(key: &str, value: &str, default: &str) {
    warn!("Invalid value \"{value}\" for config key \"{key}\", using {default}");
}

fn set_bool(slot: &mut bool, key: &str, value: &str) {
    match parse_bool_like(value) {
        Some(v) => *slot = v,
        None => warn_fallback(key, value, &slot.to_string()),
    }
}

fn set_u64(slot: &mut u64, key: &str, value: &str) {
    match value.parse::<u64>() {
        Ok(v) => *slot = v,
        Err(_) => warn_fallback(key, value, &slot.to_string()),
    }
}

fn set_nonzero_u64(slot: &mut u64, key: &str, value: &str) {
    match value.parse::<u64>() {
        Ok(v) if v > 0 => *slot = v,
        _ => warn_fallback(key, value, &slot.to_string()),
    }
}

fn set_nonzero_usize(slot: &mut usize, key: &str, value: &str) {
    match value.parse::<usize>() {
        Ok(v) if v > 0 => *slot = v,
        _ => warn_fallback(key, value, &slot.to_string()),
    }
}

fn parse_scheme_list(raw: &str) -> Vec<String> {
    raw.split(&[';', ' '][..])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.to_ascii_lowercase())
        .collect()
}

fn parse_bool_like(v: &str) -> Option<bool> {
    match v.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
