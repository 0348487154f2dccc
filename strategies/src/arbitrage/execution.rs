use chrono::Utc;
use rust_decimal::Decimal;
use spreadarb_core::store::OrderRecordStatus;
use spreadarb_core::traits::{ExchangeGateway, TradingError};
use spreadarb_core::types::{Exchange, Order, OrderRequest, OrderStatus, PositionSide};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::arbitrage::types::LegFill;

pub type GatewayMap = HashMap<Exchange, Arc<dyn ExchangeGateway>>;

/// Pause between close retries.
const CLOSE_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Result of closing one leg, possibly over several orders.
#[derive(Debug, Clone)]
pub struct CloseOutcome {
    pub exchange: Exchange,
    pub side: PositionSide,
    pub requested: Decimal,
    pub closed: Decimal,
    /// Size-weighted close price over every fill.
    pub avg_price: Option<Decimal>,
    pub orders: Vec<LegFill>,
}

impl CloseOutcome {
    pub fn remaining(&self) -> Decimal {
        (self.requested - self.closed).max(Decimal::ZERO)
    }

    pub fn is_complete(&self) -> bool {
        self.remaining().is_zero()
    }
}

/// Places leg orders against the gateways with a hard deadline per order.
///
/// Market orders are acknowledged under the deadline, then polled until
/// final. Whatever is still working at the deadline (or when the caller
/// cancels) is cancelled and its final fill read once.
pub struct LegExecutor {
    gateways: GatewayMap,
    order_timeout: Duration,
    poll_interval: Duration,
}

impl LegExecutor {
    pub fn new(gateways: GatewayMap, order_timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            gateways,
            order_timeout,
            poll_interval,
        }
    }

    pub fn gateway(&self, exchange: Exchange) -> Option<&Arc<dyn ExchangeGateway>> {
        self.gateways.get(&exchange)
    }

    pub fn gateways(&self) -> &GatewayMap {
        &self.gateways
    }

    /// Open a part: both legs at once.
    pub async fn open_pair(
        &self,
        long: OrderRequest,
        short: OrderRequest,
        cancel: &CancellationToken,
    ) -> (LegFill, LegFill) {
        tokio::join!(
            self.execute(long, PositionSide::Long, cancel),
            self.execute(short, PositionSide::Short, cancel),
        )
    }

    /// Run one order to a final state. Never returns an error: failures are
    /// folded into a `LegFill` with zero fill and a reason.
    pub async fn execute(
        &self,
        request: OrderRequest,
        leg_side: PositionSide,
        cancel: &CancellationToken,
    ) -> LegFill {
        let exchange = request.exchange;
        let order_side = request.side;
        let size = request.size;
        let created_at = Utc::now();

        let Some(gateway) = self.gateways.get(&exchange) else {
            return LegFill::unfilled(
                exchange,
                leg_side,
                order_side,
                size,
                OrderRecordStatus::Rejected,
                format!("no gateway for {exchange}"),
            );
        };

        let deadline = Instant::now() + self.order_timeout;
        let symbol = request.symbol.clone();

        let ack = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return LegFill::unfilled(exchange, leg_side, order_side, size, OrderRecordStatus::Cancelled, "cancelled before acknowledgment");
            }
            res = tokio::time::timeout_at(deadline, gateway.place_order(request)) => res,
        };

        let mut order = match ack {
            Err(_) => {
                warn!(%exchange, %symbol, "Order not acknowledged before deadline");
                return LegFill::unfilled(
                    exchange,
                    leg_side,
                    order_side,
                    size,
                    OrderRecordStatus::Rejected,
                    TradingError::Timeout.to_string(),
                );
            }
            Ok(Err(e)) => {
                warn!(%exchange, %symbol, error = %e, "Order rejected");
                return LegFill::unfilled(
                    exchange,
                    leg_side,
                    order_side,
                    size,
                    OrderRecordStatus::Rejected,
                    e.to_string(),
                );
            }
            Ok(Ok(order)) => order,
        };

        let mut interrupted = None;
        while !order.is_final_state() {
            if Instant::now() >= deadline {
                interrupted = Some("order timed out");
                break;
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    interrupted = Some("entry cancelled");
                    break;
                }
                _ = tokio::time::sleep_until((Instant::now() + self.poll_interval).min(deadline)) => {}
            }
            match gateway.get_order_status(&symbol, &order.order_id).await {
                Ok(latest) => order = latest,
                Err(e) => debug!(%exchange, order_id = %order.order_id, error = %e, "Status poll failed"),
            }
        }

        if let Some(reason) = interrupted {
            info!(%exchange, order_id = %order.order_id, reason, "Cancelling working order");
            order = match gateway.cancel_order(&symbol, &order.order_id).await {
                Ok(cancelled) => cancelled,
                Err(e) => {
                    warn!(%exchange, order_id = %order.order_id, error = %e, "Cancel failed, reading last status");
                    gateway
                        .get_order_status(&symbol, &order.order_id)
                        .await
                        .unwrap_or(order)
                }
            };
        }

        Self::to_fill(order, leg_side, created_at, interrupted)
    }

    fn to_fill(
        order: Order,
        leg_side: PositionSide,
        created_at: chrono::DateTime<Utc>,
        interrupted: Option<&str>,
    ) -> LegFill {
        let filled = order.filled_size;
        let status = if order.is_fully_filled() {
            OrderRecordStatus::Filled
        } else if order.status == OrderStatus::Rejected {
            OrderRecordStatus::Rejected
        } else {
            OrderRecordStatus::Cancelled
        };
        let error = match status {
            OrderRecordStatus::Filled => None,
            _ => Some(
                interrupted
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("order ended {:?}", order.status)),
            ),
        };
        LegFill {
            exchange: order.request.exchange,
            leg_side,
            order_side: order.request.side,
            requested: order.request.size,
            filled,
            avg_price: order.avg_fill_price,
            filled_at: (filled > Decimal::ZERO).then_some(order.updated_at),
            order_id: Some(order.order_id),
            status,
            error,
            created_at,
        }
    }

    /// Flatten `quantity` of a leg with reduce-only market orders, retrying
    /// up to `max_attempts` times on whatever is left.
    pub async fn close_leg(
        &self,
        symbol: &str,
        exchange: Exchange,
        side: PositionSide,
        quantity: Decimal,
        max_attempts: u32,
        tag: &str,
    ) -> CloseOutcome {
        let mut outcome = CloseOutcome {
            exchange,
            side,
            requested: quantity,
            closed: Decimal::ZERO,
            avg_price: None,
            orders: Vec::new(),
        };
        // Closing is never interrupted by a pause.
        let never = CancellationToken::new();

        for attempt in 1..=max_attempts.max(1) {
            let remaining = outcome.remaining();
            if remaining.is_zero() {
                break;
            }
            let request = OrderRequest::market(
                exchange,
                symbol,
                side.close_side(),
                remaining,
                true,
                format!("{tag}-a{attempt}"),
            );
            let fill = self.execute(request, side, &never).await;
            if let Some(px) = fill.avg_price
                && fill.filled > Decimal::ZERO
            {
                let prev = outcome.avg_price.unwrap_or_default() * outcome.closed;
                outcome.closed += fill.filled;
                outcome.avg_price = Some((prev + px * fill.filled) / outcome.closed);
            }
            let done = outcome.remaining().is_zero();
            if !done {
                warn!(%exchange, %symbol, attempt, remaining = %outcome.remaining(), error = ?fill.error, "Close attempt incomplete");
            }
            outcome.orders.push(fill);
            if done {
                break;
            }
            if attempt < max_attempts {
                tokio::time::sleep(CLOSE_RETRY_DELAY).await;
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use exchanges::{FillScript, MockExchange};
    use rust_decimal_macros::dec;
    use spreadarb_core::types::OrderSide;

    async fn setup() -> (Arc<MockExchange>, LegExecutor) {
        let mock = Arc::new(MockExchange::with_symbols(Exchange::Binance, ["BTCUSDT"]));
        mock.push_price("BTCUSDT", dec!(100), dec!(101)).await;
        let mut gateways: GatewayMap = HashMap::new();
        gateways.insert(Exchange::Binance, mock.clone());
        let exec = LegExecutor::new(
            gateways,
            Duration::from_millis(100),
            Duration::from_millis(10),
        );
        (mock, exec)
    }

    fn buy(size: Decimal) -> OrderRequest {
        OrderRequest::market(Exchange::Binance, "BTCUSDT", OrderSide::Buy, size, false, "t")
    }

    #[tokio::test]
    async fn test_immediate_fill() {
        let (_mock, exec) = setup().await;
        let fill = exec.execute(buy(dec!(1)), PositionSide::Long, &CancellationToken::new()).await;
        assert!(fill.is_complete());
        assert_eq!(fill.status, OrderRecordStatus::Filled);
        assert_eq!(fill.avg_price, Some(dec!(101)));
    }

    #[tokio::test]
    async fn test_fill_found_by_polling() {
        let (mock, exec) = setup().await;
        mock.push_script(FillScript::FillOnPoll).await;
        let fill = exec.execute(buy(dec!(1)), PositionSide::Long, &CancellationToken::new()).await;
        assert!(fill.is_complete());
    }

    #[tokio::test]
    async fn test_no_ack_times_out_as_rejection() {
        let (mock, exec) = setup().await;
        mock.push_script(FillScript::NoAck).await;
        let fill = exec.execute(buy(dec!(1)), PositionSide::Long, &CancellationToken::new()).await;
        assert_eq!(fill.status, OrderRecordStatus::Rejected);
        assert_eq!(fill.filled, Decimal::ZERO);
        assert_eq!(fill.error.as_deref(), Some("request timed out"));
    }

    #[tokio::test]
    async fn test_partial_fill_is_cancelled_at_deadline() {
        let (mock, exec) = setup().await;
        mock.push_script(FillScript::Partial(dec!(0.4))).await;
        let fill = exec.execute(buy(dec!(1)), PositionSide::Long, &CancellationToken::new()).await;
        assert_eq!(fill.status, OrderRecordStatus::Cancelled);
        assert_eq!(fill.filled, dec!(0.4));
        assert!(!fill.is_complete());
        assert!(fill.has_fill());
    }

    #[tokio::test]
    async fn test_cancel_token_interrupts_working_order() {
        let (mock, exec) = setup().await;
        mock.push_script(FillScript::Hang).await;
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(15)).await;
            canceller.cancel();
        });
        let started = Instant::now();
        let fill = exec.execute(buy(dec!(1)), PositionSide::Long, &token).await;
        assert!(started.elapsed() < Duration::from_millis(90));
        assert_eq!(fill.status, OrderRecordStatus::Cancelled);
        assert_eq!(fill.error.as_deref(), Some("entry cancelled"));
    }

    #[tokio::test]
    async fn test_close_retries_remaining_quantity() {
        let (mock, exec) = setup().await;
        mock.push_script(FillScript::Partial(dec!(0.5))).await;
        mock.push_script(FillScript::Reject("busy".into())).await;

        let outcome = exec
            .close_leg("BTCUSDT", Exchange::Binance, PositionSide::Long, dec!(2), 3, "close")
            .await;
        assert!(outcome.is_complete());
        assert_eq!(outcome.orders.len(), 3);
        // every close fill sells at the bid
        assert_eq!(outcome.avg_price, Some(dec!(100)));
        assert!(mock.get_state().await.submitted.iter().all(|r| r.reduce_only));
    }

    #[tokio::test]
    async fn test_close_gives_up_after_max_attempts() {
        let (mock, exec) = setup().await;
        mock.set_fallback(FillScript::Reject("halted".into())).await;
        let outcome = exec
            .close_leg("BTCUSDT", Exchange::Binance, PositionSide::Short, dec!(1), 2, "close")
            .await;
        assert!(!outcome.is_complete());
        assert_eq!(outcome.remaining(), dec!(1));
        assert_eq!(outcome.orders.len(), 2);
    }
}
