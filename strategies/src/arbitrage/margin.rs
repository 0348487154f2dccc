use rust_decimal::Decimal;
use spreadarb_core::types::Exchange;
use tracing::debug;

use crate::arbitrage::execution::GatewayMap;
use crate::arbitrage::policy::{LegExposure, MarginPolicy, MarginViolation};

/// Requires each account's free quote balance to cover the notional of its
/// leg for the next part. No leverage is assumed.
#[derive(Debug, Default, Clone)]
pub struct FreeBalancePolicy;

impl MarginPolicy for FreeBalancePolicy {
    fn name(&self) -> &'static str {
        "free_balance_policy"
    }

    fn check_inner(&self, legs: &[LegExposure]) -> Result<(), MarginViolation> {
        for leg in legs {
            match &leg.free {
                Err(reason) => {
                    return Err(MarginViolation::BalanceUnavailable {
                        exchange: leg.exchange,
                        reason: reason.clone(),
                    });
                }
                Ok(free) if *free < leg.notional => {
                    return Err(MarginViolation::InsufficientFree {
                        exchange: leg.exchange,
                        required: leg.notional,
                        available: *free,
                    });
                }
                Ok(_) => {}
            }
        }
        Ok(())
    }
}

/// Read the free `quote` balance for every `(exchange, notional)` leg.
pub async fn gather_exposures(
    gateways: &GatewayMap,
    quote: &str,
    legs: &[(Exchange, Decimal)],
) -> Vec<LegExposure> {
    let mut out = Vec::with_capacity(legs.len());
    for &(exchange, notional) in legs {
        let free = match gateways.get(&exchange) {
            None => Err(format!("no gateway for {exchange}")),
            Some(gw) => gw
                .get_balance(quote)
                .await
                .map(|b| b.free)
                .map_err(|e| e.to_string()),
        };
        debug!(%exchange, %notional, ?free, "Leg exposure");
        out.push(LegExposure {
            exchange,
            notional,
            free,
        });
    }
    out
}
