use crate::store::{Settings, TradingParams};
use crate::types::{Exchange, ExecutionMode};
use crate::utils::RetryPolicy;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

// ── Engine ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Deadline for one leg order, from submission to final state.
    #[serde(default = "default_order_timeout_ms")]
    pub order_timeout_ms: u64,
    #[serde(default = "default_order_poll_interval_ms")]
    pub order_poll_interval_ms: u64,
    /// Closing orders are retried this many times before the pair errors out.
    #[serde(default = "default_3")]
    pub max_close_attempts: u32,
    #[serde(default = "default_max_pairs")]
    pub max_pairs: usize,
    #[serde(default = "default_64")]
    pub mailbox_capacity: usize,
    #[serde(default = "default_1024")]
    pub market_broadcast_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            order_timeout_ms: default_order_timeout_ms(),
            order_poll_interval_ms: default_order_poll_interval_ms(),
            max_close_attempts: 3,
            max_pairs: default_max_pairs(),
            mailbox_capacity: 64,
            market_broadcast_capacity: 1024,
        }
    }
}

impl EngineConfig {
    pub fn order_timeout(&self) -> Duration {
        Duration::from_millis(self.order_timeout_ms)
    }

    pub fn order_poll_interval(&self) -> Duration {
        Duration::from_millis(self.order_poll_interval_ms)
    }
}

// ── Persistence retry ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default = "default_3")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl PersistenceConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }
}

// ── Paper gateways ────────────────────────────────────────────────────────────

/// One `[[exchanges]]` entry: a paper account on `name`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeSetting {
    pub name: Exchange,
    #[serde(default)]
    pub symbols: Vec<String>,
    #[serde(default = "default_quote_balance")]
    pub quote_balance: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperConfig {
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Peak deviation of each exchange's price from the base, in percent.
    #[serde(default = "default_amplitude_pct")]
    pub amplitude_pct: Decimal,
    /// Ticks per full oscillation.
    #[serde(default = "default_period_ticks")]
    pub period_ticks: u32,
    #[serde(default = "default_base_price")]
    pub base_price: Decimal,
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            amplitude_pct: default_amplitude_pct(),
            period_ticks: default_period_ticks(),
            base_price: default_base_price(),
        }
    }
}

impl PaperConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

// ── Seed pairs ────────────────────────────────────────────────────────────────

/// A pair created at startup when no pair with the symbol exists yet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairSeed {
    pub symbol: String,
    pub base: String,
    pub quote: String,
    #[serde(flatten)]
    pub params: TradingParams,
    /// Start monitoring right after creation.
    #[serde(default)]
    pub start: bool,
}

// ── Root ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub execution_mode: ExecutionMode,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    /// Initial global settings; persisted settings win once written.
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub exchanges: Vec<ExchangeSetting>,
    #[serde(default)]
    pub pairs: Vec<PairSeed>,
    #[serde(default)]
    pub paper: PaperConfig,
}

impl AppConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.execution_mode == ExecutionMode::Live {
            errors.push("execution_mode = live is not supported by this build".to_string());
        }

        if self.engine.order_timeout_ms == 0 {
            errors.push("engine.order_timeout_ms must be > 0".to_string());
        }
        if self.engine.order_poll_interval_ms == 0 {
            errors.push("engine.order_poll_interval_ms must be > 0".to_string());
        }
        if self.engine.order_poll_interval_ms > self.engine.order_timeout_ms {
            errors.push("engine.order_poll_interval_ms must be <= order_timeout_ms".to_string());
        }
        if self.engine.max_close_attempts == 0 {
            errors.push("engine.max_close_attempts must be > 0".to_string());
        }
        if self.engine.max_pairs == 0 {
            errors.push("engine.max_pairs must be > 0".to_string());
        }
        if self.engine.mailbox_capacity == 0 || self.engine.market_broadcast_capacity == 0 {
            errors.push("engine channel capacities must be > 0".to_string());
        }

        if self.persistence.max_attempts == 0 {
            errors.push("persistence.max_attempts must be > 0".to_string());
        }
        if self.persistence.base_delay_ms > self.persistence.max_delay_ms {
            errors.push("persistence.base_delay_ms must be <= max_delay_ms".to_string());
        }

        if self.settings.max_concurrent_trades == Some(0) {
            errors.push("settings.max_concurrent_trades must be > 0 when set".to_string());
        }

        let mut seen = HashSet::new();
        for ex in &self.exchanges {
            if !seen.insert(ex.name) {
                errors.push(format!("exchange '{}' configured more than once", ex.name));
            }
            if ex.quote_balance < Decimal::ZERO {
                errors.push(format!("exchanges.{}.quote_balance must be >= 0", ex.name));
            }
        }

        if self.paper.tick_interval_ms == 0 {
            errors.push("paper.tick_interval_ms must be > 0".to_string());
        }
        if self.paper.period_ticks == 0 {
            errors.push("paper.period_ticks must be > 0".to_string());
        }
        if self.paper.base_price <= Decimal::ZERO {
            errors.push("paper.base_price must be > 0".to_string());
        }

        if self.pairs.len() > self.engine.max_pairs {
            errors.push(format!(
                "{} seed pairs exceed engine.max_pairs ({})",
                self.pairs.len(),
                self.engine.max_pairs
            ));
        }
        for seed in &self.pairs {
            if seed.symbol.trim().is_empty() {
                errors.push("pairs: symbol must not be empty".to_string());
            }
            let listed = self
                .exchanges
                .iter()
                .filter(|ex| ex.symbols.iter().any(|s| s == &seed.symbol))
                .count();
            if listed < 2 {
                errors.push(format!(
                    "pairs.{}: symbol must be listed on at least two exchanges",
                    seed.symbol
                ));
            }
        }

        errors
    }

    /// Symbols listed by at least one configured exchange.
    pub fn tracked_symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self
            .exchanges
            .iter()
            .flat_map(|ex| ex.symbols.iter().cloned())
            .collect();
        symbols.sort();
        symbols.dedup();
        symbols
    }
}

fn default_order_timeout_ms() -> u64 {
    5_000
}
fn default_order_poll_interval_ms() -> u64 {
    200
}
fn default_max_pairs() -> usize {
    30
}
fn default_3() -> u32 {
    3
}
fn default_64() -> usize {
    64
}
fn default_1024() -> usize {
    1024
}
fn default_base_delay_ms() -> u64 {
    100
}
fn default_max_delay_ms() -> u64 {
    2_000
}
fn default_quote_balance() -> Decimal {
    Decimal::from(10_000)
}
fn default_tick_interval_ms() -> u64 {
    500
}
fn default_amplitude_pct() -> Decimal {
    Decimal::new(15, 1)
}
fn default_period_ticks() -> u32 {
    120
}
fn default_base_price() -> Decimal {
    Decimal::from(50_000)
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::{
        Figment,
        providers::{Format, Toml},
    };
    use rust_decimal_macros::dec;

    const SAMPLE: &str = r#"
        execution_mode = "paper"

        [engine]
        order_timeout_ms = 2000

        [settings]
        max_concurrent_trades = 2
        disabled_notifications = ["OPEN"]

        [[exchanges]]
        name = "binance"
        symbols = ["BTCUSDT"]

        [[exchanges]]
        name = "bybit"
        symbols = ["BTCUSDT", "ETHUSDT"]
        quote_balance = "500"

        [[pairs]]
        symbol = "BTCUSDT"
        base = "BTC"
        quote = "USDT"
        entry_spread_pct = "1.0"
        exit_spread_pct = "0.2"
        volume = "0.5"
        n_orders = 1
        stop_loss = "100"
        start = true
    "#;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_empty(), "{:?}", config.validate());
        assert_eq!(config.engine.max_pairs, 30);
    }

    #[test]
    fn test_parse_sample() {
        let config: AppConfig = Figment::new().merge(Toml::string(SAMPLE)).extract().unwrap();
        assert_eq!(config.engine.order_timeout_ms, 2000);
        assert_eq!(config.engine.order_poll_interval_ms, 200);
        assert_eq!(config.settings.max_concurrent_trades, Some(2));
        assert_eq!(config.exchanges[1].quote_balance, dec!(500));
        assert_eq!(config.exchanges[0].quote_balance, dec!(10000));
        assert_eq!(config.pairs[0].params.volume, dec!(0.5));
        assert!(config.pairs[0].start);
        assert_eq!(config.tracked_symbols(), vec!["BTCUSDT", "ETHUSDT"]);
        assert!(config.validate().is_empty(), "{:?}", config.validate());
    }

    #[test]
    fn test_validate_collects_every_problem() {
        let mut config: AppConfig =
            Figment::new().merge(Toml::string(SAMPLE)).extract().unwrap();
        config.execution_mode = ExecutionMode::Live;
        config.engine.max_close_attempts = 0;
        config.exchanges[0].symbols.clear();

        let errors = config.validate();
        assert_eq!(errors.len(), 3, "{errors:?}");
        assert!(errors.iter().any(|e| e.contains("live")));
        assert!(errors.iter().any(|e| e.contains("max_close_attempts")));
        assert!(errors.iter().any(|e| e.contains("at least two exchanges")));
    }
}
