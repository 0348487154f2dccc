//! Parameter validation and partial updates for pair configuration.
//!
//! Every rule has its own error variant and machine-readable code so a
//! caller can attach the failure to the offending field. Nothing here
//! clamps or corrects a value.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use spreadarb_core::store::TradingParams;
use thiserror::Error;

const MAX_SYMBOL_LEN: usize = 32;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ParamError {
    #[error("entry spread must be > 0, got {0}")]
    InvalidEntrySpread(Decimal),
    #[error("exit spread must be >= 0, got {0}")]
    InvalidExitSpread(Decimal),
    #[error("exit spread {exit} must be below entry spread {entry}")]
    ExitSpreadTooHigh { entry: Decimal, exit: Decimal },
    #[error("volume must be > 0, got {0}")]
    InvalidVolume(Decimal),
    #[error("n_orders must be >= 1, got {0}")]
    InvalidNOrders(u32),
    #[error("stop loss must be >= 0, got {0}")]
    InvalidStopLoss(Decimal),
    #[error("invalid symbol: {0:?}")]
    InvalidSymbol(String),
}

impl ParamError {
    pub fn code(&self) -> &'static str {
        match self {
            ParamError::InvalidEntrySpread(_) => "INVALID_ENTRY_SPREAD",
            ParamError::InvalidExitSpread(_) => "INVALID_EXIT_SPREAD",
            ParamError::ExitSpreadTooHigh { .. } => "EXIT_SPREAD_TOO_HIGH",
            ParamError::InvalidVolume(_) => "INVALID_VOLUME",
            ParamError::InvalidNOrders(_) => "INVALID_N_ORDERS",
            ParamError::InvalidStopLoss(_) => "INVALID_STOP_LOSS",
            ParamError::InvalidSymbol(_) => "INVALID_SYMBOL",
        }
    }

    /// Field the error refers to.
    pub fn field(&self) -> &'static str {
        match self {
            ParamError::InvalidEntrySpread(_) => "entry_spread_pct",
            ParamError::InvalidExitSpread(_) | ParamError::ExitSpreadTooHigh { .. } => {
                "exit_spread_pct"
            }
            ParamError::InvalidVolume(_) => "volume",
            ParamError::InvalidNOrders(_) => "n_orders",
            ParamError::InvalidStopLoss(_) => "stop_loss",
            ParamError::InvalidSymbol(_) => "symbol",
        }
    }
}

pub fn validate_params(p: &TradingParams) -> Result<(), ParamError> {
    if p.entry_spread_pct <= Decimal::ZERO {
        return Err(ParamError::InvalidEntrySpread(p.entry_spread_pct));
    }
    if p.exit_spread_pct < Decimal::ZERO {
        return Err(ParamError::InvalidExitSpread(p.exit_spread_pct));
    }
    if p.exit_spread_pct >= p.entry_spread_pct {
        return Err(ParamError::ExitSpreadTooHigh {
            entry: p.entry_spread_pct,
            exit: p.exit_spread_pct,
        });
    }
    if p.volume <= Decimal::ZERO {
        return Err(ParamError::InvalidVolume(p.volume));
    }
    if p.n_orders < 1 {
        return Err(ParamError::InvalidNOrders(p.n_orders));
    }
    if p.stop_loss < Decimal::ZERO {
        return Err(ParamError::InvalidStopLoss(p.stop_loss));
    }
    Ok(())
}

/// Symbols are upper-case alphanumeric, e.g. `BTCUSDT`, and must be
/// `base` followed by `quote`.
pub fn validate_symbol(symbol: &str, base: &str, quote: &str) -> Result<(), ParamError> {
    let well_formed = !symbol.is_empty()
        && symbol.len() <= MAX_SYMBOL_LEN
        && symbol
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit());
    let composed = !base.is_empty() && !quote.is_empty() && symbol == format!("{base}{quote}");
    if well_formed && composed {
        Ok(())
    } else {
        Err(ParamError::InvalidSymbol(symbol.to_string()))
    }
}

/// `UpdatePair` payload. Absent fields keep their current value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParamsPatch {
    pub entry_spread_pct: Option<Decimal>,
    pub exit_spread_pct: Option<Decimal>,
    pub volume: Option<Decimal>,
    pub n_orders: Option<u32>,
    pub stop_loss: Option<Decimal>,
}

impl ParamsPatch {
    pub fn apply_to(&self, base: &TradingParams) -> TradingParams {
        TradingParams {
            entry_spread_pct: self.entry_spread_pct.unwrap_or(base.entry_spread_pct),
            exit_spread_pct: self.exit_spread_pct.unwrap_or(base.exit_spread_pct),
            volume: self.volume.unwrap_or(base.volume),
            n_orders: self.n_orders.unwrap_or(base.n_orders),
            stop_loss: self.stop_loss.unwrap_or(base.stop_loss),
        }
    }
}
