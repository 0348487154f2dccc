use rust_decimal::Decimal;
use spreadarb_core::store::TradingParams;

use crate::arbitrage::oracle::SpreadOracle;
use crate::arbitrage::policy::{Decision, DecisionPolicy, ExitReason};
use crate::arbitrage::types::{PairRuntime, PairStatus};

/// Threshold decider for cross-exchange spread capture.
///
/// Flat: enter part 0 on the best venue pair once its spread reaches
/// `entry_spread_pct`. Holding: stop-loss on the aggregate position first,
/// then further parts on the same venues. The exit threshold only applies
/// once all `n_orders` parts are filled.
///
/// `consider_funding` is reserved and has no effect here.
#[derive(Debug, Default, Clone)]
pub struct SpreadDecider;

impl SpreadDecider {
    pub fn new() -> Self {
        Self
    }
}

impl DecisionPolicy for SpreadDecider {
    fn name(&self) -> &'static str {
        "spread_decider"
    }

    fn evaluate_inner(
        &self,
        runtime: &PairRuntime,
        params: &TradingParams,
        oracle: &SpreadOracle,
    ) -> Decision {
        match runtime.status {
            PairStatus::Ready => match oracle.best_entry() {
                Some(opp) if opp.spread >= params.entry_spread_pct => Decision::Enter {
                    part_index: 0,
                    long: opp.long,
                    short: opp.short,
                    spread: opp.spread,
                },
                _ => Decision::Wait,
            },
            PairStatus::Holding => {
                let Some((long, short)) = runtime.held_exchanges() else {
                    return Decision::Wait;
                };

                if params.stop_loss > Decimal::ZERO && runtime.unrealized_pnl <= -params.stop_loss
                {
                    return Decision::Exit {
                        reason: ExitReason::StopLoss,
                        spread: oracle.exit_spread(long, short),
                    };
                }

                if runtime.filled_parts >= params.n_orders
                    && let Some(spread) = oracle.exit_spread(long, short)
                    && spread <= params.exit_spread_pct
                {
                    return Decision::Exit {
                        reason: ExitReason::Spread,
                        spread: Some(spread),
                    };
                }

                if runtime.filled_parts < params.n_orders
                    && let Some(spread) = oracle.entry_spread(long, short)
                    && spread >= params.entry_spread_pct
                {
                    return Decision::Enter {
                        part_index: runtime.filled_parts,
                        long,
                        short,
                        spread,
                    };
                }

                Decision::Wait
            }
            _ => Decision::Wait,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arbitrage::types::LegFill;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use spreadarb_core::store::OrderRecordStatus;
    use spreadarb_core::types::{Exchange, PositionSide, PriceTick};

    fn params(n_orders: u32) -> TradingParams {
        TradingParams {
            entry_spread_pct: dec!(1.0),
            exit_spread_pct: dec!(0.2),
            volume: dec!(0.5),
            n_orders,
            stop_loss: dec!(100),
        }
    }

    fn quote(oracle: &mut SpreadOracle, ex: Exchange, bid: Decimal, ask: Decimal) {
        oracle.update(PriceTick::new(ex, "BTCUSDT", bid, ask));
    }

    fn filled(ex: Exchange, side: PositionSide, qty: Decimal, px: Decimal) -> LegFill {
        LegFill {
            exchange: ex,
            leg_side: side,
            order_side: side.open_side(),
            requested: qty,
            filled: qty,
            avg_price: Some(px),
            order_id: None,
            status: OrderRecordStatus::Filled,
            error: None,
            created_at: Utc::now(),
            filled_at: Some(Utc::now()),
        }
    }

    fn holding(n_orders: u32, qty: Decimal) -> PairRuntime {
        let mut rt = PairRuntime::new(1);
        rt.confirm_part(
            0,
            n_orders,
            &filled(Exchange::Binance, PositionSide::Long, qty, dec!(50000)),
            &filled(Exchange::Bybit, PositionSide::Short, qty, dec!(50600)),
            dec!(1.2),
        );
        rt.set_status(PairStatus::Holding);
        rt
    }

    #[test]
    fn test_ready_enters_at_threshold() {
        let mut oracle = SpreadOracle::new();
        let mut rt = PairRuntime::new(1);
        rt.set_status(PairStatus::Ready);

        quote(&mut oracle, Exchange::Binance, dec!(49990), dec!(50000));
        quote(&mut oracle, Exchange::Bybit, dec!(50400), dec!(50410));
        assert_eq!(SpreadDecider.evaluate(&rt, &params(1), &oracle), Decision::Wait);

        quote(&mut oracle, Exchange::Bybit, dec!(50500), dec!(50510));
        assert_eq!(
            SpreadDecider.evaluate(&rt, &params(1), &oracle),
            Decision::Enter {
                part_index: 0,
                long: Exchange::Binance,
                short: Exchange::Bybit,
                spread: dec!(1.0),
            }
        );
    }

    #[test]
    fn test_holding_exits_when_spread_collapses() {
        let mut oracle = SpreadOracle::new();
        let mut rt = holding(1, dec!(0.5));
        quote(&mut oracle, Exchange::Binance, dec!(50000), dec!(50010));
        quote(&mut oracle, Exchange::Bybit, dec!(50065), dec!(50075));
        rt.mark_to_market(&oracle);

        assert_eq!(
            SpreadDecider.evaluate(&rt, &params(1), &oracle),
            Decision::Exit {
                reason: ExitReason::Spread,
                spread: Some(dec!(0.15)),
            }
        );
    }

    #[test]
    fn test_partial_position_waits_for_all_parts_before_spread_exit() {
        let mut oracle = SpreadOracle::new();
        let mut rt = holding(2, dec!(0.25));
        quote(&mut oracle, Exchange::Binance, dec!(50000), dec!(50010));
        quote(&mut oracle, Exchange::Bybit, dec!(50065), dec!(50075));
        rt.mark_to_market(&oracle);

        assert_eq!(SpreadDecider.evaluate(&rt, &params(2), &oracle), Decision::Wait);
    }

    #[test]
    fn test_partial_position_still_stops_out() {
        let mut oracle = SpreadOracle::new();
        let mut rt = holding(2, dec!(0.5));
        quote(&mut oracle, Exchange::Binance, dec!(49800), dec!(49810));
        quote(&mut oracle, Exchange::Bybit, dec!(50600), dec!(50610));
        rt.mark_to_market(&oracle);

        assert!(matches!(
            SpreadDecider.evaluate(&rt, &params(2), &oracle),
            Decision::Exit {
                reason: ExitReason::StopLoss,
                ..
            }
        ));
    }

    #[test]
    fn test_stop_loss_overrides_spread() {
        let mut oracle = SpreadOracle::new();
        let mut rt = holding(1, dec!(0.5));
        quote(&mut oracle, Exchange::Binance, dec!(49800), dec!(49810));
        quote(&mut oracle, Exchange::Bybit, dec!(50600), dec!(50610));
        rt.mark_to_market(&oracle);
        assert_eq!(rt.unrealized_pnl, dec!(-105));

        let decision = SpreadDecider.evaluate(&rt, &params(1), &oracle);
        assert!(matches!(
            decision,
            Decision::Exit {
                reason: ExitReason::StopLoss,
                ..
            }
        ));
    }

    #[test]
    fn test_zero_stop_loss_disables_it() {
        let mut oracle = SpreadOracle::new();
        let mut rt = holding(1, dec!(0.5));
        quote(&mut oracle, Exchange::Binance, dec!(40000), dec!(40010));
        quote(&mut oracle, Exchange::Bybit, dec!(50600), dec!(50610));
        rt.mark_to_market(&oracle);

        let mut p = params(1);
        p.stop_loss = Decimal::ZERO;
        assert_eq!(SpreadDecider.evaluate(&rt, &p, &oracle), Decision::Wait);
    }

    #[test]
    fn test_next_part_on_same_venues() {
        let mut oracle = SpreadOracle::new();
        let mut rt = holding(2, dec!(0.25));
        quote(&mut oracle, Exchange::Binance, dec!(49990), dec!(50000));
        quote(&mut oracle, Exchange::Bybit, dec!(50600), dec!(50610));
        // A third venue with a wider spread must not pull the position apart.
        quote(&mut oracle, Exchange::Okx, dec!(48000), dec!(48000));
        rt.mark_to_market(&oracle);

        assert_eq!(
            SpreadDecider.evaluate(&rt, &params(2), &oracle),
            Decision::Enter {
                part_index: 1,
                long: Exchange::Binance,
                short: Exchange::Bybit,
                spread: dec!(1.2),
            }
        );
    }

    #[test]
    fn test_paused_and_error_never_act() {
        let mut oracle = SpreadOracle::new();
        quote(&mut oracle, Exchange::Binance, dec!(49990), dec!(50000));
        quote(&mut oracle, Exchange::Bybit, dec!(51000), dec!(51010));
        let mut rt = PairRuntime::new(1);
        for status in [PairStatus::Paused, PairStatus::Error, PairStatus::Exiting] {
            rt.set_status(status);
            assert_eq!(SpreadDecider.evaluate(&rt, &params(1), &oracle), Decision::Wait);
        }
    }
}
