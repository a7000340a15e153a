//! Router configuration.
//!
//! Loaded from a YAML file, with environment-variable overrides for the
//! deployment-sensitive options (DATABASE_URL, BIND_ADDR, USE_MOCK_EXCHANGE).

use serde::Deserialize;

/// Top-level application configuration
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub rebalance: RebalanceConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Swap every adapter for the deterministic mock (testing).
    #[serde(default)]
    pub use_mock_exchange: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            use_mock_exchange: false,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Empty disables the file sink (stdout only).
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_log_file")]
    pub log_file: String,
    /// "hourly" | "daily" | "never"
    #[serde(default = "default_rotation")]
    pub rotation: String,
    #[serde(default)]
    pub use_json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_dir: default_log_dir(),
            log_file: default_log_file(),
            rotation: default_rotation(),
            use_json: false,
        }
    }
}

/// Trading pipeline timing knobs. All durations are seconds.
#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    /// Reconciler REST poller period (L2).
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Cancel-queue drainer period (L3).
    #[serde(default = "default_cancel_queue_interval")]
    pub cancel_queue_interval_secs: u64,
    /// Upper bound for cancel retries before FailedOrder(CANCEL).
    #[serde(default = "default_max_cancel_retries")]
    pub max_cancel_retries: i32,
    /// PENDING rows older than this are swept to FAILED (L4).
    #[serde(default = "default_orphan_timeout")]
    pub orphan_timeout_secs: u64,
    /// Sweeper period (L4).
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    /// Price cache entry TTL.
    #[serde(default = "default_price_ttl")]
    pub price_ttl_secs: u64,
    /// Sizing rejects prices older than this.
    #[serde(default = "default_price_stale")]
    pub price_stale_secs: u64,
    /// Fast-path (MARKET/CANCEL) per-call deadline.
    #[serde(default = "default_market_order_timeout")]
    pub market_order_timeout_secs: u64,
    /// Slow-path per-call deadline.
    #[serde(default = "default_rest_timeout")]
    pub rest_timeout_secs: u64,
    /// Max concurrent account-dispatches per webhook.
    #[serde(default = "default_dispatch_fanout")]
    pub dispatch_fanout: usize,
    /// Instrument metadata refresh period.
    #[serde(default = "default_registry_refresh")]
    pub registry_refresh_secs: u64,
    /// UTC hour at which the daily report event fires.
    #[serde(default)]
    pub daily_report_hour: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        // serde_yaml with an empty mapping takes the same path
        serde_yaml::from_str("{}").expect("default pipeline config")
    }
}

/// Capital auto-rebalance (L4b) tuning.
#[derive(Debug, Deserialize, Clone)]
pub struct RebalanceConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Trigger when |allocated/target - 1| exceeds this.
    #[serde(default = "default_rebalance_epsilon")]
    pub epsilon: f64,
    /// Fraction of account equity distributed across subscriptions.
    #[serde(default = "default_rebalance_target")]
    pub target_utilization: f64,
}

impl Default for RebalanceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            epsilon: default_rebalance_epsilon(),
            target_utilization: default_rebalance_target(),
        }
    }
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_pool_size() -> u32 {
    10
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_dir() -> String {
    "./logs".to_string()
}
fn default_log_file() -> String {
    "trade_router.log".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}
fn default_poll_interval() -> u64 {
    5
}
fn default_cancel_queue_interval() -> u64 {
    10
}
fn default_max_cancel_retries() -> i32 {
    5
}
fn default_orphan_timeout() -> u64 {
    120
}
fn default_sweep_interval() -> u64 {
    60
}
fn default_price_ttl() -> u64 {
    30
}
fn default_price_stale() -> u64 {
    60
}
fn default_market_order_timeout() -> u64 {
    10
}
fn default_rest_timeout() -> u64 {
    30
}
fn default_dispatch_fanout() -> usize {
    32
}
fn default_registry_refresh() -> u64 {
    21_600
}
fn default_rebalance_epsilon() -> f64 {
    0.10
}
fn default_rebalance_target() -> f64 {
    1.0
}

impl AppConfig {
    /// Load configuration from a YAML file, then apply env overrides.
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: AppConfig = serde_yaml::from_str(&content)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Environment variables win over the file for deployment knobs.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("DATABASE_URL") {
            self.database.url = url;
        }
        if let Ok(addr) = std::env::var("BIND_ADDR") {
            self.server.bind_addr = addr;
        }
        if let Ok(v) = std::env::var("USE_MOCK_EXCHANGE") {
            self.server.use_mock_exchange = matches!(v.as_str(), "1" | "true" | "TRUE");
        }
        fn env_u64(name: &str, slot: &mut u64) {
            if let Ok(v) = std::env::var(name) {
                if let Ok(parsed) = v.parse() {
                    *slot = parsed;
                }
            }
        }
        env_u64("POLL_INTERVAL", &mut self.pipeline.poll_interval_secs);
        env_u64(
            "CANCEL_QUEUE_INTERVAL",
            &mut self.pipeline.cancel_queue_interval_secs,
        );
        env_u64("ORPHAN_TIMEOUT", &mut self.pipeline.orphan_timeout_secs);
        env_u64("PRICE_TTL", &mut self.pipeline.price_ttl_secs);
        env_u64("PRICE_STALE", &mut self.pipeline.price_stale_secs);
        env_u64(
            "MARKET_ORDER_TIMEOUT",
            &mut self.pipeline.market_order_timeout_secs,
        );
        if let Ok(v) = std::env::var("MAX_CANCEL_RETRIES") {
            if let Ok(n) = v.parse() {
                self.pipeline.max_cancel_retries = n;
            }
        }
        if let Ok(v) = std::env::var("DISPATCH_FANOUT") {
            if let Ok(n) = v.parse() {
                self.pipeline.dispatch_fanout = n;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_deserialize() {
        let yaml = r#"
database:
  url: "postgres://localhost/router_test"
"#;
        let config: AppConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.database.url, "postgres://localhost/router_test");
        assert_eq!(config.server.bind_addr, "0.0.0.0:8080");
        assert_eq!(config.pipeline.poll_interval_secs, 5);
        assert_eq!(config.pipeline.cancel_queue_interval_secs, 10);
        assert_eq!(config.pipeline.max_cancel_retries, 5);
        assert_eq!(config.pipeline.orphan_timeout_secs, 120);
        assert_eq!(config.pipeline.price_ttl_secs, 30);
        assert_eq!(config.pipeline.price_stale_secs, 60);
        assert_eq!(config.pipeline.market_order_timeout_secs, 10);
        assert_eq!(config.pipeline.dispatch_fanout, 32);
        assert!(!config.server.use_mock_exchange);
    }

    #[test]
    fn test_full_config_deserialize() {
        let yaml = r#"
server:
  bind_addr: "127.0.0.1:9000"
  use_mock_exchange: true
database:
  url: "postgres://router:pw@db/router"
  pool_size: 20
logging:
  log_level: "debug"
  rotation: "hourly"
  use_json: true
pipeline:
  poll_interval_secs: 2
  dispatch_fanout: 8
rebalance:
  enabled: true
  epsilon: 0.05
"#;
        let config: AppConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.server.bind_addr, "127.0.0.1:9000");
        assert!(config.server.use_mock_exchange);
        assert_eq!(config.database.pool_size, 20);
        assert_eq!(config.logging.rotation, "hourly");
        assert_eq!(config.pipeline.poll_interval_secs, 2);
        assert_eq!(config.pipeline.dispatch_fanout, 8);
        assert!(config.rebalance.enabled);
        assert!((config.rebalance.epsilon - 0.05).abs() < f64::EPSILON);
        // untouched defaults survive partial pipeline section
        assert_eq!(config.pipeline.orphan_timeout_secs, 120);
    }
}
