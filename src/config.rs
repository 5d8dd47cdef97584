use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::candles::{AggregatorSettings, TimeframeOrder};
use crate::execution::{Precision, TrackerSettings};
use crate::gateway::{Backoff, Product, RetryPolicy};
use crate::models::{ChaseSettings, Timeframe};

/// Environment prefix, e.g. `TRADECORE__EXCHANGE__SYMBOL=ETHUSDT`
pub const ENV_PREFIX: &str = "TRADECORE";

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub exchange: ExchangeConfig,
    #[serde(default)]
    pub candles: CandleConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    pub product: Product,
    pub symbol: String,
    /// Trade against the venue's demo environment
    pub demo: bool,
    /// Decimal places for prices
    pub price_precision: u32,
    /// Decimal places for quantities
    pub qty_precision: u32,
    /// Fee rate per side (e.g., 0.00075 = 0.075%)
    pub commission: f64,
    /// Force quantity counted in quote currency; inverse products always are
    pub qty_in_quote: bool,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            product: Product::default(),
            symbol: "BTCUSDT".to_string(),
            demo: true,
            price_precision: 2,
            qty_precision: 3,
            commission: 0.00075,
            qty_in_quote: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CandleConfig {
    pub timeframes: Vec<Timeframe>,
    /// Closed bars retained per timeframe
    pub lookback: usize,
    pub call_on_start: bool,
    pub timeframe_order: TimeframeOrder,
    pub minute_granularity: bool,
}

impl Default for CandleConfig {
    fn default() -> Self {
        Self {
            timeframes: vec![Timeframe::M1],
            lookback: 100,
            call_on_start: true,
            timeframe_order: TimeframeOrder::Descending,
            minute_granularity: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Sleep between best-price checks while chasing
    pub chase_update_rate_ms: u64,
    /// Pause after each chase amend (0 = none)
    pub chase_interval_ms: u64,
    pub chase_init_delay_ms: u64,
    pub order_update_log: bool,
    pub trade_log: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            chase_update_rate_ms: 50,
            chase_interval_ms: 0,
            chase_init_delay_ms: 0,
            order_update_log: true,
            trade_log: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff: Backoff,
    pub requests_per_second: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 200,
            max_delay_ms: 5000,
            backoff: Backoff::Exponential,
            requests_per_second: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct NotifyConfig {
    /// Webhook receiving notifications; logged only when unset
    pub webhook_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

fn default_log_filter() -> String {
    "tradecore=info".to_string()
}

impl AppConfig {
    /// Load configuration from an optional file and the environment
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::load_with_prefix(path, ENV_PREFIX)
    }

    /// Same as [`AppConfig::load`] with a custom environment prefix, and no `.env`
    pub fn load_with_prefix(path: Option<&Path>, prefix: &str) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }

        // Override with environment variables (TRADECORE__RETRY__MAX_ATTEMPTS, etc.)
        let builder = builder.add_source(
            Environment::with_prefix(prefix)
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("candles.timeframes")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    pub fn precision(&self) -> Precision {
        Precision::new(self.exchange.price_precision, self.exchange.qty_precision)
    }

    /// Whether position size is in quote currency, from the product or the override
    pub fn qty_in_quote(&self) -> bool {
        self.exchange.qty_in_quote || self.exchange.product.rules().qty_in_quote()
    }

    pub fn aggregator_settings(&self) -> AggregatorSettings {
        AggregatorSettings {
            lookback: self.candles.lookback,
            call_on_start: self.candles.call_on_start,
            order: self.candles.timeframe_order,
            minute_granularity: self.candles.minute_granularity,
        }
    }

    pub fn tracker_settings(&self) -> TrackerSettings {
        TrackerSettings {
            precision: self.precision(),
            order_update_log: self.execution.order_update_log,
            trade_log: self.execution.trade_log,
        }
    }

    pub fn chase_settings(&self) -> ChaseSettings {
        ChaseSettings {
            init_delay: Duration::from_millis(self.execution.chase_init_delay_ms),
            update_rate: Duration::from_millis(self.execution.chase_update_rate_ms),
            interval: Duration::from_millis(self.execution.chase_interval_ms),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
            backoff: self.retry.backoff,
            requests_per_second: self.retry.requests_per_second,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tokio_test::assert_ok;

    fn write_config(name: &str, body: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("{}-{}.toml", name, std::process::id()));
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(body.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_defaults_without_sources() {
        let config = assert_ok!(AppConfig::load_with_prefix(None, "TRADECORE_TEST_EMPTY"));

        assert_eq!(config.exchange.product, Product::Linear);
        assert_eq!(config.exchange.commission, 0.00075);
        assert!(!config.exchange.qty_in_quote);
        assert_eq!(config.candles.lookback, 100);
        assert!(config.candles.call_on_start);
        assert_eq!(config.candles.timeframe_order, TimeframeOrder::Descending);
        assert_eq!(config.execution.chase_update_rate_ms, 50);
        assert_eq!(config.retry.max_attempts, 3);
        assert!(config.notify.webhook_url.is_none());
        assert_eq!(config.logging.filter, "tradecore=info");
    }

    #[test]
    fn test_load_from_file() {
        let path = write_config(
            "tradecore-config",
            r#"
[exchange]
product = "spot"
symbol = "ETHUSDT"
price_precision = 1
qty_precision = 4

[candles]
timeframes = ["1m", "5m", "1h"]
lookback = 50
timeframe_order = "ascending"
minute_granularity = true

[execution]
chase_update_rate_ms = 250
trade_log = false

[retry]
backoff = "fixed"
"#,
        );

        let config = assert_ok!(AppConfig::load_with_prefix(Some(&path), "TRADECORE_TEST_FILE"));
        std::fs::remove_file(&path).ok();

        assert_eq!(config.exchange.product, Product::Spot);
        assert_eq!(config.exchange.symbol, "ETHUSDT");
        assert_eq!(
            config.candles.timeframes,
            vec![Timeframe::M1, Timeframe::M5, Timeframe::H1]
        );
        // untouched keys in a present section keep their defaults
        assert_eq!(config.exchange.commission, 0.00075);
        assert!(config.execution.order_update_log);

        let settings = config.aggregator_settings();
        assert_eq!(settings.lookback, 50);
        assert_eq!(settings.order, TimeframeOrder::Ascending);
        assert!(settings.minute_granularity);

        assert_eq!(config.chase_settings().update_rate, Duration::from_millis(250));
        assert!(!config.tracker_settings().trade_log);
        assert_eq!(config.precision(), Precision::new(1, 4));
        assert_eq!(config.retry_policy().backoff, Backoff::Fixed);
    }

    #[test]
    fn test_qty_in_quote_follows_product() {
        let mut config = AppConfig::default();
        assert!(!config.qty_in_quote());

        config.exchange.product = Product::Inverse;
        assert!(!config.exchange.qty_in_quote);
        assert!(config.qty_in_quote());

        config.exchange.product = Product::Linear;
        config.exchange.qty_in_quote = true;
        assert!(config.qty_in_quote());
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let path = std::env::temp_dir().join("tradecore-does-not-exist.toml");
        assert!(AppConfig::load_with_prefix(Some(&path), "TRADECORE_TEST_MISSING").is_err());
    }

    #[test]
    fn test_environment_overrides() {
        std::env::set_var("TRADECORE_TEST_ENV__EXCHANGE__SYMBOL", "SOLUSDT");
        std::env::set_var("TRADECORE_TEST_ENV__RETRY__MAX_ATTEMPTS", "7");
        std::env::set_var("TRADECORE_TEST_ENV__CANDLES__TIMEFRAMES", "5m,1h");

        let config = assert_ok!(AppConfig::load_with_prefix(None, "TRADECORE_TEST_ENV"));

        assert_eq!(config.exchange.symbol, "SOLUSDT");
        assert_eq!(config.retry.max_attempts, 7);
        assert_eq!(config.candles.timeframes, vec![Timeframe::M5, Timeframe::H1]);
    }
}
