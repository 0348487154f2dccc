use spreadarb_core::store::{PairId, StoreError};
use thiserror::Error;

use crate::arbitrage::params::ParamError;

/// Command-boundary failures. Every variant carries a stable code so a
/// caller can map it to a status and a field.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EngineError {
    #[error("pair {0} not found")]
    PairNotFound(PairId),
    #[error("a pair for {0} already exists")]
    PairAlreadyExists(String),
    #[error("maximum of {0} pairs reached")]
    MaxPairsReached(usize),
    #[error("{0} is not tradable on at least two exchanges")]
    SymbolNotAvailable(String),
    #[error("need at least two connected exchanges, have {connected}")]
    NotEnoughExchanges { connected: usize },
    #[error("pair {0} is already active")]
    PairAlreadyActive(PairId),
    #[error("pair {0} is already paused")]
    PairAlreadyPaused(PairId),
    #[error("pair {0} has an open position")]
    PairHasOpenPosition(PairId),
    #[error("pair {0} must be paused first")]
    PairNotPaused(PairId),
    #[error("pair {0} is not in ERROR")]
    PairNotInError(PairId),
    #[error("pair {0} is in ERROR and needs reconciliation")]
    PairInError(PairId),
    #[error(transparent)]
    InvalidParams(#[from] ParamError),
    #[error("invalid settings: {0}")]
    InvalidSettings(String),
    #[error("closing the position failed: {0}")]
    CloseFailed(String),
    #[error("persistence error: {0}")]
    Store(#[from] StoreError),
    #[error("engine unavailable")]
    EngineUnavailable,
}

impl EngineError {
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::PairNotFound(_) => "PAIR_NOT_FOUND",
            EngineError::PairAlreadyExists(_) => "PAIR_ALREADY_EXISTS",
            EngineError::MaxPairsReached(_) => "MAX_PAIRS_REACHED",
            EngineError::SymbolNotAvailable(_) => "SYMBOL_NOT_AVAILABLE",
            EngineError::NotEnoughExchanges { .. } => "NOT_ENOUGH_EXCHANGES",
            EngineError::PairAlreadyActive(_) => "PAIR_ALREADY_ACTIVE",
            EngineError::PairAlreadyPaused(_) => "PAIR_ALREADY_PAUSED",
            EngineError::PairHasOpenPosition(_) => "PAIR_HAS_OPEN_POSITION",
            EngineError::PairNotPaused(_) => "PAIR_NOT_PAUSED",
            EngineError::PairNotInError(_) => "PAIR_NOT_IN_ERROR",
            EngineError::PairInError(_) => "PAIR_IN_ERROR",
            EngineError::InvalidParams(e) => e.code(),
            EngineError::InvalidSettings(_) => "INVALID_SETTINGS",
            EngineError::CloseFailed(_) => "CLOSE_FAILED",
            EngineError::Store(_) => "API_ERROR",
            EngineError::EngineUnavailable => "ENGINE_UNAVAILABLE",
        }
    }

    /// Offending parameter for validation failures.
    pub fn field(&self) -> Option<&'static str> {
        match self {
            EngineError::InvalidParams(e) => Some(e.field()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_param_codes_pass_through() {
        let e: EngineError = ParamError::ExitSpreadTooHigh {
            entry: dec!(1.0),
            exit: dec!(1.0),
        }
        .into();
        assert_eq!(e.code(), "EXIT_SPREAD_TOO_HIGH");
        assert_eq!(e.field(), Some("exit_spread_pct"));
        assert_eq!(EngineError::PairNotFound(1).field(), None);
        assert_eq!(EngineError::MaxPairsReached(30).code(), "MAX_PAIRS_REACHED");
        assert_eq!(
            EngineError::MaxPairsReached(30).to_string(),
            "maximum of 30 pairs reached"
        );
    }
}
