//! Compensation for a part whose legs did not both fill.
//!
//! A part is only kept when both legs filled completely. Anything else is
//! classified and every filled quantity is market-closed again:
//!
//! | Outcome        | Legs                                   | Pair goes to           |
//! |----------------|----------------------------------------|------------------------|
//! | Filled         | both complete                          | HOLDING                |
//! | NothingFilled  | neither leg has a fill                 | previous state         |
//! | Broken         | anything in between                    | unwind, then see below |
//!
//! A broken part that unwinds flat returns to the previous state. Quantity
//! the unwind could not close is left stranded and the pair goes to ERROR.

use rust_decimal::Decimal;
use spreadarb_core::types::{Exchange, PositionSide};
use tracing::{error, info};

use crate::arbitrage::execution::{CloseOutcome, LegExecutor};
use crate::arbitrage::types::{Leg, LegFill};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryOutcome {
    Filled,
    NothingFilled,
    Broken,
}

/// Pure classification of a part's two leg outcomes.
pub fn classify_entry(long: &LegFill, short: &LegFill) -> EntryOutcome {
    if long.is_complete() && short.is_complete() {
        EntryOutcome::Filled
    } else if !long.has_fill() && !short.has_fill() {
        EntryOutcome::NothingFilled
    } else {
        EntryOutcome::Broken
    }
}

/// Quantity an unwind could not flatten.
#[derive(Debug, Clone, PartialEq)]
pub struct StrandedLeg {
    pub exchange: Exchange,
    pub side: PositionSide,
    pub quantity: Decimal,
    pub entry_price: Decimal,
}

#[derive(Debug, Clone)]
pub struct UnwindReport {
    pub closes: Vec<CloseOutcome>,
    /// PnL of the quantity that was closed again.
    pub realized_pnl: Decimal,
    pub stranded: Vec<StrandedLeg>,
}

impl UnwindReport {
    pub fn is_flat(&self) -> bool {
        self.stranded.is_empty()
    }

    /// Every order the unwind placed, for the audit trail.
    pub fn orders(&self) -> impl Iterator<Item = &LegFill> {
        self.closes.iter().flat_map(|c| c.orders.iter())
    }
}

/// Market-close whatever each leg filled. Legs without a fill are skipped.
pub async fn unwind_fills(
    executor: &LegExecutor,
    symbol: &str,
    fills: [&LegFill; 2],
    max_attempts: u32,
    tag: &str,
) -> UnwindReport {
    let mut report = UnwindReport {
        closes: Vec::new(),
        realized_pnl: Decimal::ZERO,
        stranded: Vec::new(),
    };

    for fill in fills {
        let Some(entry_price) = fill.avg_price.filter(|_| fill.filled > Decimal::ZERO) else {
            continue;
        };
        let leg = Leg::new(fill.exchange, fill.leg_side, fill.filled, entry_price);
        info!(
            exchange = %leg.exchange,
            side = %leg.side,
            quantity = %leg.quantity,
            "Unwinding filled leg"
        );
        let close = executor
            .close_leg(
                symbol,
                leg.exchange,
                leg.side,
                leg.quantity,
                max_attempts,
                &format!("{tag}-{}", leg.side),
            )
            .await;

        if let Some(px) = close.avg_price {
            report.realized_pnl += leg.pnl_at(close.closed, px);
        }
        if !close.is_complete() {
            error!(
                exchange = %leg.exchange,
                side = %leg.side,
                remaining = %close.remaining(),
                "Unwind left quantity open"
            );
            report.stranded.push(StrandedLeg {
                exchange: leg.exchange,
                side: leg.side,
                quantity: close.remaining(),
                entry_price,
            });
        }
        report.closes.push(close);
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arbitrage::execution::GatewayMap;
    use chrono::Utc;
    use exchanges::{FillScript, MockExchange};
    use rust_decimal_macros::dec;
    use spreadarb_core::store::OrderRecordStatus;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;

    fn fill(ex: Exchange, side: PositionSide, requested: Decimal, filled: Decimal, px: Decimal) -> LegFill {
        LegFill {
            exchange: ex,
            leg_side: side,
            order_side: side.open_side(),
            requested,
            filled,
            avg_price: (filled > Decimal::ZERO).then_some(px),
            order_id: None,
            status: if filled >= requested {
                OrderRecordStatus::Filled
            } else {
                OrderRecordStatus::Rejected
            },
            error: None,
            created_at: Utc::now(),
            filled_at: None,
        }
    }

    #[test]
    fn test_classification() {
        let full_long = fill(Exchange::Binance, PositionSide::Long, dec!(1), dec!(1), dec!(100));
        let full_short = fill(Exchange::Bybit, PositionSide::Short, dec!(1), dec!(1), dec!(101));
        let none_short = fill(Exchange::Bybit, PositionSide::Short, dec!(1), dec!(0), dec!(0));
        let none_long = fill(Exchange::Binance, PositionSide::Long, dec!(1), dec!(0), dec!(0));
        let half_short = fill(Exchange::Bybit, PositionSide::Short, dec!(1), dec!(0.5), dec!(101));

        assert_eq!(classify_entry(&full_long, &full_short), EntryOutcome::Filled);
        assert_eq!(classify_entry(&none_long, &none_short), EntryOutcome::NothingFilled);
        assert_eq!(classify_entry(&full_long, &none_short), EntryOutcome::Broken);
        assert_eq!(classify_entry(&full_long, &half_short), EntryOutcome::Broken);
    }

    async fn executor() -> (Arc<MockExchange>, LegExecutor) {
        let mock = Arc::new(MockExchange::with_symbols(Exchange::Binance, ["BTCUSDT"]));
        mock.push_price("BTCUSDT", dec!(99), dec!(100)).await;
        let mut gateways: GatewayMap = HashMap::new();
        gateways.insert(Exchange::Binance, mock.clone());
        (
            mock,
            LegExecutor::new(gateways, Duration::from_millis(50), Duration::from_millis(5)),
        )
    }

    #[tokio::test]
    async fn test_unwind_closes_filled_leg_and_books_pnl() {
        let (mock, exec) = executor().await;
        let long = fill(Exchange::Binance, PositionSide::Long, dec!(0.5), dec!(0.5), dec!(100));
        let short = fill(Exchange::Bybit, PositionSide::Short, dec!(0.5), dec!(0), dec!(0));

        let report = unwind_fills(&exec, "BTCUSDT", [&long, &short], 3, "unwind").await;
        assert!(report.is_flat());
        assert_eq!(report.closes.len(), 1);
        // bought at 100, sold back at the 99 bid
        assert_eq!(report.realized_pnl, dec!(-0.5));
        assert_eq!(mock.get_state().await.submitted.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_unwind_reports_stranded_quantity() {
        let (mock, exec) = executor().await;
        mock.set_fallback(FillScript::Reject("reduce-only rejected".into())).await;
        let long = fill(Exchange::Binance, PositionSide::Long, dec!(0.5), dec!(0.5), dec!(100));
        let short = fill(Exchange::Bybit, PositionSide::Short, dec!(0.5), dec!(0), dec!(0));

        let report = unwind_fills(&exec, "BTCUSDT", [&long, &short], 2, "unwind").await;
        assert!(!report.is_flat());
        assert_eq!(
            report.stranded,
            vec![StrandedLeg {
                exchange: Exchange::Binance,
                side: PositionSide::Long,
                quantity: dec!(0.5),
                entry_price: dec!(100),
            }]
        );
        assert_eq!(report.orders().count(), 2);
        assert_eq!(report.realized_pnl, Decimal::ZERO);
    }
}
