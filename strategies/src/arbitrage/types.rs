use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use spreadarb_core::store::{OrderRecordStatus, PairConfig, PairId, TradingParams};
use spreadarb_core::types::{Exchange, OrderSide, PositionSide};
use strum::Display;

use crate::arbitrage::oracle::SpreadOracle;

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum PairStatus {
    /// No monitoring, no position.
    Paused,
    /// Flat and watching the spread for an entry.
    Ready,
    /// Leg orders for one part are in flight.
    Entering,
    /// At least one part filled on both legs.
    Holding,
    /// Closing orders in flight for every open leg.
    Exiting,
    /// A leg failed irrecoverably. Waits for `ReconcilePair`.
    Error,
}

impl PairStatus {
    /// No open legs.
    pub fn is_flat(&self) -> bool {
        matches!(self, PairStatus::Ready | PairStatus::Paused)
    }
}

// ---------------------------------------------------------------------------
// Order outcome of one leg
// ---------------------------------------------------------------------------

/// What one leg order actually did, after acknowledgment, polling and
/// (if needed) cancellation.
#[derive(Debug, Clone, PartialEq)]
pub struct LegFill {
    pub exchange: Exchange,
    pub leg_side: PositionSide,
    pub order_side: OrderSide,
    pub requested: Decimal,
    pub filled: Decimal,
    pub avg_price: Option<Decimal>,
    pub order_id: Option<String>,
    pub status: OrderRecordStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub filled_at: Option<DateTime<Utc>>,
}

impl LegFill {
    /// An order that never reached the book.
    pub fn unfilled(
        exchange: Exchange,
        leg_side: PositionSide,
        order_side: OrderSide,
        requested: Decimal,
        status: OrderRecordStatus,
        error: impl Into<String>,
    ) -> Self {
        Self {
            exchange,
            leg_side,
            order_side,
            requested,
            filled: Decimal::ZERO,
            avg_price: None,
            order_id: None,
            status,
            error: Some(error.into()),
            created_at: Utc::now(),
            filled_at: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.filled >= self.requested && self.avg_price.is_some()
    }

    pub fn has_fill(&self) -> bool {
        self.filled > Decimal::ZERO && self.avg_price.is_some()
    }
}

// ---------------------------------------------------------------------------
// Legs and runtime
// ---------------------------------------------------------------------------

/// One side of an open position, aggregated across all filled parts.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Leg {
    pub exchange: Exchange,
    pub side: PositionSide,
    /// Size-weighted average fill price.
    pub entry_price: Decimal,
    /// Price this leg would close at right now.
    pub last_price: Decimal,
    pub quantity: Decimal,
}

impl Leg {
    pub fn new(exchange: Exchange, side: PositionSide, quantity: Decimal, price: Decimal) -> Self {
        Self {
            exchange,
            side,
            entry_price: price,
            last_price: price,
            quantity,
        }
    }

    pub fn unrealized_pnl(&self) -> Decimal {
        match self.side {
            PositionSide::Long => (self.last_price - self.entry_price) * self.quantity,
            PositionSide::Short => (self.entry_price - self.last_price) * self.quantity,
        }
    }

    /// PnL of closing `quantity` of this leg at `price`.
    pub fn pnl_at(&self, quantity: Decimal, price: Decimal) -> Decimal {
        match self.side {
            PositionSide::Long => (price - self.entry_price) * quantity,
            PositionSide::Short => (self.entry_price - price) * quantity,
        }
    }

    pub fn add(&mut self, quantity: Decimal, price: Decimal) {
        let total = self.quantity + quantity;
        if total > Decimal::ZERO {
            self.entry_price = (self.entry_price * self.quantity + price * quantity) / total;
        }
        self.quantity = total;
    }
}

/// Transient execution state of one pair. Never persisted directly.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PairRuntime {
    pub pair_id: PairId,
    pub status: PairStatus,
    pub legs: Vec<Leg>,
    pub filled_parts: u32,
    pub current_spread: Option<Decimal>,
    pub unrealized_pnl: Decimal,
    /// Realized within the current position (unwinds, partial closes).
    pub realized_pnl: Decimal,
    /// Size-weighted entry spread across filled parts.
    pub entry_spread: Option<Decimal>,
    pub opened_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl PairRuntime {
    pub fn new(pair_id: PairId) -> Self {
        Self {
            pair_id,
            status: PairStatus::Paused,
            legs: Vec::new(),
            filled_parts: 0,
            current_spread: None,
            unrealized_pnl: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
            entry_spread: None,
            opened_at: None,
            updated_at: Utc::now(),
        }
    }

    pub fn set_status(&mut self, status: PairStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }

    pub fn leg(&self, side: PositionSide) -> Option<&Leg> {
        self.legs.iter().find(|l| l.side == side)
    }

    /// Exchanges of the open position as (long, short).
    pub fn held_exchanges(&self) -> Option<(Exchange, Exchange)> {
        Some((
            self.leg(PositionSide::Long)?.exchange,
            self.leg(PositionSide::Short)?.exchange,
        ))
    }

    pub fn has_open_legs(&self) -> bool {
        self.legs.iter().any(|l| l.quantity > Decimal::ZERO)
    }

    /// Add filled quantity to the leg on `exchange`/`side`, creating it if needed.
    pub fn absorb(&mut self, exchange: Exchange, side: PositionSide, qty: Decimal, price: Decimal) {
        if qty <= Decimal::ZERO {
            return;
        }
        match self
            .legs
            .iter_mut()
            .find(|l| l.side == side && l.exchange == exchange)
        {
            Some(leg) => leg.add(qty, price),
            None => self.legs.push(Leg::new(exchange, side, qty, price)),
        }
        self.opened_at.get_or_insert_with(Utc::now);
        self.updated_at = Utc::now();
    }

    /// Record both legs of part `part_index` as filled.
    ///
    /// Parts fill strictly in order, so only `part_index == filled_parts` is
    /// accepted. Replays of an already confirmed part return `false` and
    /// leave the runtime untouched.
    pub fn confirm_part(
        &mut self,
        part_index: u32,
        n_orders: u32,
        long: &LegFill,
        short: &LegFill,
        spread: Decimal,
    ) -> bool {
        if part_index != self.filled_parts || self.filled_parts >= n_orders {
            return false;
        }
        let (Some(long_px), Some(short_px)) = (long.avg_price, short.avg_price) else {
            return false;
        };
        let held_before = self.leg(PositionSide::Long).map(|l| l.quantity).unwrap_or_default();
        self.absorb(long.exchange, PositionSide::Long, long.filled, long_px);
        self.absorb(short.exchange, PositionSide::Short, short.filled, short_px);

        let total = held_before + long.filled;
        self.entry_spread = Some(match self.entry_spread {
            Some(prev) if total > Decimal::ZERO => {
                (prev * held_before + spread * long.filled) / total
            }
            _ => spread,
        });
        self.filled_parts += 1;
        true
    }

    /// Refresh leg prices, spread and unrealized PnL from the oracle.
    pub fn mark_to_market(&mut self, oracle: &SpreadOracle) {
        for leg in &mut self.legs {
            if let Some(price) = oracle.close_price(leg.exchange, leg.side) {
                leg.last_price = price;
            }
        }
        self.unrealized_pnl = self.legs.iter().map(Leg::unrealized_pnl).sum();
        self.current_spread = match self.held_exchanges() {
            Some((long, short)) => oracle.exit_spread(long, short),
            None => oracle.best_entry().map(|o| o.spread),
        };
    }

    /// Back to flat: drop legs and per-position counters.
    pub fn reset(&mut self) {
        self.legs.clear();
        self.filled_parts = 0;
        self.unrealized_pnl = Decimal::ZERO;
        self.realized_pnl = Decimal::ZERO;
        self.entry_spread = None;
        self.opened_at = None;
        self.updated_at = Utc::now();
    }
}

// ---------------------------------------------------------------------------
// Deferred configuration and read models
// ---------------------------------------------------------------------------

/// Parameters queued while the pair holds a position.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingConfig {
    pub params: TradingParams,
    pub queued_at: DateTime<Utc>,
}

/// `GetPairWithRuntime` result. `runtime` is `None` while the pair is paused.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PairSnapshot {
    pub config: PairConfig,
    pub runtime: Option<PairRuntime>,
    pub pending: Option<PendingConfig>,
}

/// `UpdatePair` result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpdateOutcome {
    pub config: PairConfig,
    /// `false` when the change was queued as a `PendingConfig`.
    pub applied_now: bool,
    pub pending: Option<PendingConfig>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn fill(exchange: Exchange, side: PositionSide, qty: Decimal, px: Decimal) -> LegFill {
        LegFill {
            exchange,
            leg_side: side,
            order_side: side.open_side(),
            requested: qty,
            filled: qty,
            avg_price: Some(px),
            order_id: Some("o".into()),
            status: OrderRecordStatus::Filled,
            error: None,
            created_at: Utc::now(),
            filled_at: Some(Utc::now()),
        }
    }

    #[test]
    fn test_leg_pnl_by_side() {
        let mut long = Leg::new(Exchange::Binance, PositionSide::Long, dec!(0.5), dec!(100));
        let mut short = Leg::new(Exchange::Bybit, PositionSide::Short, dec!(0.5), dec!(100));
        long.last_price = dec!(110);
        short.last_price = dec!(110);
        assert_eq!(long.unrealized_pnl(), dec!(5));
        assert_eq!(short.unrealized_pnl(), dec!(-5));
    }

    #[test]
    fn test_confirm_part_is_idempotent() {
        let mut rt = PairRuntime::new(1);
        let l = fill(Exchange::Binance, PositionSide::Long, dec!(0.25), dec!(100));
        let s = fill(Exchange::Bybit, PositionSide::Short, dec!(0.25), dec!(101));

        assert!(rt.confirm_part(0, 2, &l, &s, dec!(1.0)));
        assert!(!rt.confirm_part(0, 2, &l, &s, dec!(1.0)));
        assert_eq!(rt.filled_parts, 1);
        assert_eq!(rt.leg(PositionSide::Long).unwrap().quantity, dec!(0.25));

        assert!(rt.confirm_part(1, 2, &l, &s, dec!(2.0)));
        assert_eq!(rt.filled_parts, 2);
        assert_eq!(rt.legs.len(), 2);
        assert_eq!(rt.leg(PositionSide::Short).unwrap().quantity, dec!(0.5));
        assert_eq!(rt.entry_spread, Some(dec!(1.5)));

        // never more parts than n_orders
        assert!(!rt.confirm_part(2, 2, &l, &s, dec!(1.0)));
        assert_eq!(rt.filled_parts, 2);
    }

    #[test]
    fn test_leg_add_weights_entry() {
        let mut leg = Leg::new(Exchange::Okx, PositionSide::Long, dec!(1), dec!(100));
        leg.add(dec!(1), dec!(110));
        assert_eq!(leg.entry_price, dec!(105));
        assert_eq!(leg.quantity, dec!(2));
    }

    #[test]
    fn test_status_groups() {
        assert!(PairStatus::Ready.is_flat());
        assert!(PairStatus::Paused.is_flat());
        assert!(!PairStatus::Error.is_flat());
        assert_eq!(PairStatus::Holding.to_string(), "HOLDING");
    }
}
