use rust_decimal::Decimal;
use spreadarb_core::store::{PairId, TradingParams};
use spreadarb_core::types::Exchange;
use thiserror::Error;

use crate::arbitrage::oracle::SpreadOracle;
use crate::arbitrage::types::PairRuntime;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Error, PartialEq)]
pub enum MarginViolation {
    #[error("free balance {available} on {exchange} below required {required}")]
    InsufficientFree {
        exchange: Exchange,
        required: Decimal,
        available: Decimal,
    },

    #[error("balance on {exchange} unavailable: {reason}")]
    BalanceUnavailable { exchange: Exchange, reason: String },
}

// ---------------------------------------------------------------------------
// Decisions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Held spread collapsed to the exit threshold.
    Spread,
    /// Unrealized loss reached the stop-loss amount.
    StopLoss,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Wait,
    Enter {
        part_index: u32,
        long: Exchange,
        short: Exchange,
        spread: Decimal,
    },
    Exit {
        reason: ExitReason,
        spread: Option<Decimal>,
    },
}

// ---------------------------------------------------------------------------
// DecisionPolicy
// ---------------------------------------------------------------------------

/// Evaluates a pair against live prices and returns the next action.
/// Implementors provide `evaluate_inner`; the default `evaluate` wrapper adds
/// structured tracing.
pub trait DecisionPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Core decision logic.
    fn evaluate_inner(
        &self,
        runtime: &PairRuntime,
        params: &TradingParams,
        oracle: &SpreadOracle,
    ) -> Decision;

    /// Template method: calls `evaluate_inner` and emits a trace event.
    /// Do NOT override this unless you need to replace the logging contract.
    fn evaluate(
        &self,
        runtime: &PairRuntime,
        params: &TradingParams,
        oracle: &SpreadOracle,
    ) -> Decision {
        let decision = self.evaluate_inner(runtime, params, oracle);
        if decision == Decision::Wait {
            tracing::trace!(
                policy = self.name(),
                pair_id = runtime.pair_id,
                status = %runtime.status,
                spread = ?runtime.current_spread,
                "Decision evaluated"
            );
        } else {
            tracing::info!(
                policy = self.name(),
                pair_id = runtime.pair_id,
                decision = ?decision,
                status = %runtime.status,
                spread = ?runtime.current_spread,
                unrealized_pnl = %runtime.unrealized_pnl,
                filled_parts = runtime.filled_parts,
                "Decision evaluated"
            );
        }
        decision
    }
}

// ---------------------------------------------------------------------------
// MarginPolicy
// ---------------------------------------------------------------------------

/// Collateral one leg of the next part needs, next to what the account has.
#[derive(Debug, Clone, PartialEq)]
pub struct LegExposure {
    pub exchange: Exchange,
    pub notional: Decimal,
    /// Free quote balance, or why it could not be read.
    pub free: Result<Decimal, String>,
}

/// Guards entry by checking that each account can carry its leg.
/// Implementors provide `check_inner`; the default `check` wrapper adds
/// structured tracing.
pub trait MarginPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    fn check_inner(&self, legs: &[LegExposure]) -> Result<(), MarginViolation>;

    /// Template method: wraps `check_inner` with tracing.
    fn check(&self, pair_id: PairId, legs: &[LegExposure]) -> Result<(), MarginViolation> {
        let result = self.check_inner(legs);
        match &result {
            Ok(()) => {
                tracing::debug!(policy = self.name(), pair_id, "Margin check passed");
            }
            Err(v) => {
                tracing::warn!(
                    policy = self.name(),
                    pair_id,
                    violation = %v,
                    "Margin violation"
                );
            }
        }
        result
    }
}
