use rust_decimal::Decimal;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use spreadarb_core::config::types::PaperConfig;
use std::f64::consts::TAU;
use std::sync::Arc;
use tracing::{debug, info};

use crate::mock::MockExchange;

/// Half of the bid/ask gap as a fraction of mid.
const HALF_SPREAD: Decimal = Decimal::from_parts(1, 0, 0, false, 4);

/// Drives synthetic prices into a set of paper accounts.
///
/// Each exchange oscillates around `base_price` with a phase offset, so the
/// cross-exchange spread periodically opens and closes.
pub struct PaperPriceDriver {
    venues: Vec<Arc<MockExchange>>,
    symbols: Vec<String>,
    config: PaperConfig,
}

impl PaperPriceDriver {
    pub fn new(venues: Vec<Arc<MockExchange>>, symbols: Vec<String>, config: PaperConfig) -> Self {
        Self {
            venues,
            symbols,
            config,
        }
    }

    /// Mid price of venue `index` at `tick`.
    pub fn mid_at(&self, index: usize, tick: u64) -> Decimal {
        let period = f64::from(self.config.period_ticks.max(1));
        let venues = self.venues.len().max(1) as f64;
        let phase = TAU * (tick as f64 / period + index as f64 / venues);
        let amplitude = self.config.amplitude_pct.to_f64().unwrap_or_default() / 100.0;
        let factor = Decimal::from_f64(1.0 + amplitude * phase.sin()).unwrap_or(Decimal::ONE);
        (self.config.base_price * factor).round_dp(2)
    }

    /// Runs until the task is aborted.
    pub async fn run(self) {
        info!(
            venues = self.venues.len(),
            symbols = ?self.symbols,
            interval_ms = self.config.tick_interval_ms,
            "Paper price driver started"
        );
        let mut interval = tokio::time::interval(self.config.tick_interval());
        let mut tick: u64 = 0;
        loop {
            interval.tick().await;
            for (index, venue) in self.venues.iter().enumerate() {
                let mid = self.mid_at(index, tick);
                let half = (mid * HALF_SPREAD).round_dp(2);
                for symbol in &self.symbols {
                    venue.push_price(symbol, mid - half, mid + half).await;
                }
            }
            debug!(tick, "Paper prices pushed");
            tick = tick.wrapping_add(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use spreadarb_core::types::Exchange;

    fn driver() -> PaperPriceDriver {
        let venues = vec![
            Arc::new(MockExchange::new(Exchange::Binance)),
            Arc::new(MockExchange::new(Exchange::Bybit)),
        ];
        let config = PaperConfig {
            tick_interval_ms: 10,
            amplitude_pct: dec!(2),
            period_ticks: 4,
            base_price: dec!(100),
        };
        PaperPriceDriver::new(venues, vec!["BTCUSDT".into()], config)
    }

    #[test]
    fn test_venues_oscillate_out_of_phase() {
        let d = driver();
        // quarter period: venue 0 at its peak, venue 1 (half a period behind) at its trough
        assert_eq!(d.mid_at(0, 1), dec!(102));
        assert_eq!(d.mid_at(1, 1), dec!(98));
        assert_eq!(d.mid_at(0, 0), dec!(100));
    }

    #[test]
    fn test_half_spread_constant() {
        assert_eq!(HALF_SPREAD, dec!(0.0001));
    }
}
