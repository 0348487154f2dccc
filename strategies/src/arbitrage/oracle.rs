use rust_decimal::Decimal;
use spreadarb_core::types::{Exchange, PositionSide, PriceTick};
use std::collections::HashMap;
use tracing::debug;

const HUNDRED: Decimal = Decimal::ONE_HUNDRED;

/// Percentage spread captured by buying on the long venue at its ask and
/// selling on the short venue at its bid.
pub fn entry_spread_pct(long_ask: Decimal, short_bid: Decimal) -> Option<Decimal> {
    if long_ask <= Decimal::ZERO {
        return None;
    }
    Some((short_bid - long_ask) / long_ask * HUNDRED)
}

/// Percentage spread still open on a held position: what closing would cost,
/// selling the long at its bid and buying back the short at its ask.
pub fn exit_spread_pct(long_bid: Decimal, short_ask: Decimal) -> Option<Decimal> {
    if long_bid <= Decimal::ZERO {
        return None;
    }
    Some((short_ask - long_bid) / long_bid * HUNDRED)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Opportunity {
    pub long: Exchange,
    pub short: Exchange,
    pub spread: Decimal,
}

/// Latest top-of-book per venue for a single symbol.
#[derive(Debug, Default)]
pub struct SpreadOracle {
    ticks: HashMap<Exchange, PriceTick>,
    /// When non-empty, ticks from other venues are ignored.
    venues: Vec<Exchange>,
}

impl SpreadOracle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict the oracle to `venues`, dropping cached ticks from others.
    pub fn set_venues(&mut self, venues: Vec<Exchange>) {
        self.ticks.retain(|ex, _| venues.contains(ex));
        self.venues = venues;
    }

    /// Returns `false` if the tick was ignored.
    pub fn update(&mut self, tick: PriceTick) -> bool {
        if !tick.is_valid() {
            debug!(exchange = %tick.exchange, symbol = %tick.symbol, "Ignoring invalid tick");
            return false;
        }
        if !self.venues.is_empty() && !self.venues.contains(&tick.exchange) {
            return false;
        }
        self.ticks.insert(tick.exchange, tick);
        true
    }

    /// Price a new order opening a leg on `exchange` would execute at.
    pub fn open_price(&self, exchange: Exchange, side: PositionSide) -> Option<Decimal> {
        let tick = self.ticks.get(&exchange)?;
        Some(match side {
            PositionSide::Long => tick.ask,
            PositionSide::Short => tick.bid,
        })
    }

    /// Price a closing order on `exchange` would execute at.
    pub fn close_price(&self, exchange: Exchange, side: PositionSide) -> Option<Decimal> {
        let tick = self.ticks.get(&exchange)?;
        Some(match side {
            PositionSide::Long => tick.bid,
            PositionSide::Short => tick.ask,
        })
    }

    pub fn entry_spread(&self, long: Exchange, short: Exchange) -> Option<Decimal> {
        entry_spread_pct(
            self.open_price(long, PositionSide::Long)?,
            self.open_price(short, PositionSide::Short)?,
        )
    }

    pub fn exit_spread(&self, long: Exchange, short: Exchange) -> Option<Decimal> {
        exit_spread_pct(
            self.close_price(long, PositionSide::Long)?,
            self.close_price(short, PositionSide::Short)?,
        )
    }

    /// Highest entry spread over every ordered pair of distinct venues.
    /// Ties keep the first pair in exchange order so the choice is stable.
    pub fn best_entry(&self) -> Option<Opportunity> {
        let mut venues: Vec<Exchange> = self.ticks.keys().copied().collect();
        venues.sort();

        let mut best: Option<Opportunity> = None;
        for &long in &venues {
            for &short in &venues {
                if long == short {
                    continue;
                }
                let Some(spread) = self.entry_spread(long, short) else {
                    continue;
                };
                if best.is_none_or(|b| spread > b.spread) {
                    best = Some(Opportunity {
                        long,
                        short,
                        spread,
                    });
                }
            }
        }
        best
    }
}
