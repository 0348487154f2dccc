use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use spreadarb_core::traits::{ExchangeGateway, TradingError};
use spreadarb_core::types::{
    Balance, Exchange, MarketEvent, Order, OrderRequest, OrderSide, OrderStatus, PositionSide,
    PriceTick,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{RwLock, broadcast, mpsc};
use tracing::debug;
use uuid::Uuid;

/// How the next submitted order behaves.
#[derive(Debug, Clone, PartialEq)]
pub enum FillScript {
    /// Fills completely at the executable price on submission.
    Fill,
    /// Acknowledged as `New`; fills on the first status poll.
    FillOnPoll,
    /// `place_order` fails with `TradingError::Rejected`.
    Reject(String),
    /// `place_order` fails with the given error.
    Fail(TradingError),
    /// Fills this fraction of the size and stays working until cancelled.
    Partial(Decimal),
    /// Acknowledged as `New` and never fills.
    Hang,
    /// `place_order` never returns.
    NoAck,
}

#[derive(Debug, Clone)]
pub struct MockState {
    pub prices: HashMap<String, PriceTick>,
    pub tradable: HashSet<String>,
    pub connected: bool,
    pub scripts: VecDeque<FillScript>,
    /// Used once `scripts` is drained.
    pub fallback: FillScript,
    pub orders: HashMap<String, Order>,
    /// Ids of `Hang` orders, which status polls must never fill.
    pub hanging: HashSet<String>,
    /// Net signed position per symbol.
    pub positions: HashMap<String, Decimal>,
    pub quote_asset: String,
    pub quote_balance: Decimal,
    /// Every request `place_order` received, in order.
    pub submitted: Vec<OrderRequest>,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            prices: HashMap::new(),
            tradable: HashSet::new(),
            connected: true,
            scripts: VecDeque::new(),
            fallback: FillScript::Fill,
            orders: HashMap::new(),
            hanging: HashSet::new(),
            positions: HashMap::new(),
            quote_asset: "USDT".to_string(),
            quote_balance: Decimal::from(100_000),
            submitted: Vec::new(),
        }
    }
}

/// Paper exchange account. Prices are pushed in by the caller and order
/// outcomes follow a script, so every failure mode the engine handles can be
/// reproduced deterministically.
pub struct MockExchange {
    exchange: Exchange,
    state: Arc<RwLock<MockState>>,
    events: broadcast::Sender<MarketEvent>,
}

impl MockExchange {
    pub fn new(exchange: Exchange) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            exchange,
            state: Arc::new(RwLock::new(MockState::default())),
            events,
        }
    }

    /// Convenience for tests: a connected account listing `symbols`.
    pub fn with_symbols<I, S>(exchange: Exchange, symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mock = Self::new(exchange);
        if let Ok(mut state) = mock.state.try_write() {
            state.tradable = symbols.into_iter().map(Into::into).collect();
        }
        mock
    }

    pub async fn get_state(&self) -> MockState {
        self.state.read().await.clone()
    }

    pub async fn list_symbol(&self, symbol: &str) {
        self.state.write().await.tradable.insert(symbol.to_string());
    }

    pub async fn set_connected(&self, connected: bool) {
        self.state.write().await.connected = connected;
    }

    pub async fn set_quote_balance(&self, free: Decimal) {
        self.state.write().await.quote_balance = free;
    }

    pub async fn push_script(&self, script: FillScript) {
        self.state.write().await.scripts.push_back(script);
    }

    pub async fn set_fallback(&self, script: FillScript) {
        self.state.write().await.fallback = script;
    }

    pub async fn position(&self, symbol: &str) -> Decimal {
        self.state
            .read()
            .await
            .positions
            .get(symbol)
            .copied()
            .unwrap_or_default()
    }

    /// Update the quote for `symbol` and publish it to subscribers.
    pub async fn push_price(&self, symbol: &str, bid: Decimal, ask: Decimal) {
        let tick = PriceTick::new(self.exchange, symbol, bid, ask);
        self.state
            .write()
            .await
            .prices
            .insert(symbol.to_string(), tick.clone());
        // No subscribers yet is fine; the latest price is still cached.
        let _ = self.events.send(MarketEvent::Price(tick));
    }

    /// Simulate the exchange force-closing our position on `symbol`.
    pub async fn liquidate(&self, symbol: &str, side: PositionSide) {
        self.state.write().await.positions.remove(symbol);
        let _ = self.events.send(MarketEvent::Liquidation {
            exchange: self.exchange,
            symbol: symbol.to_string(),
            side,
            timestamp: Utc::now(),
        });
    }

    fn executable_price(tick: &PriceTick, side: OrderSide) -> Decimal {
        match side {
            OrderSide::Buy => tick.ask,
            OrderSide::Sell => tick.bid,
        }
    }

    fn book_fill(state: &mut MockState, order: &mut Order, size: Decimal, price: Decimal) {
        order.apply_fill(size, price);
        let signed = match order.request.side {
            OrderSide::Buy => size,
            OrderSide::Sell => -size,
        };
        *state
            .positions
            .entry(order.request.symbol.clone())
            .or_default() += signed;
    }

    fn not_found(&self, order_id: &str) -> TradingError {
        TradingError::OrderNotFound {
            exchange: self.exchange.to_string(),
            order_id: order_id.to_string(),
        }
    }
}

#[async_trait]
impl ExchangeGateway for MockExchange {
    fn exchange(&self) -> Exchange {
        self.exchange
    }

    async fn health_check(&self) -> Result<(), TradingError> {
        if self.state.read().await.connected {
            Ok(())
        } else {
            Err(TradingError::Disconnected)
        }
    }

    async fn is_tradable(&self, symbol: &str) -> Result<bool, TradingError> {
        let state = self.state.read().await;
        if !state.connected {
            return Err(TradingError::Disconnected);
        }
        Ok(state.tradable.contains(symbol))
    }

    async fn get_price(&self, symbol: &str) -> Result<PriceTick, TradingError> {
        let state = self.state.read().await;
        state
            .prices
            .get(symbol)
            .cloned()
            .ok_or_else(|| TradingError::PriceNotReady(symbol.to_string()))
    }

    async fn place_order(&self, request: OrderRequest) -> Result<Order, TradingError> {
        let script = {
            let mut state = self.state.write().await;
            if !state.connected {
                return Err(TradingError::Disconnected);
            }
            if !state.tradable.contains(&request.symbol) {
                return Err(TradingError::UnsupportedSymbol(request.symbol.clone()));
            }
            state.submitted.push(request.clone());
            let fallback = state.fallback.clone();
            state.scripts.pop_front().unwrap_or(fallback)
        };
        debug!(exchange = %self.exchange, symbol = %request.symbol, side = %request.side, size = %request.size, ?script, "Mock order");

        match script {
            FillScript::Reject(reason) => return Err(TradingError::Rejected(reason)),
            FillScript::Fail(e) => return Err(e),
            FillScript::NoAck => std::future::pending::<()>().await,
            _ => {}
        }

        let mut state = self.state.write().await;
        let price = state
            .prices
            .get(&request.symbol)
            .map(|t| Self::executable_price(t, request.side))
            .ok_or_else(|| TradingError::PriceNotReady(request.symbol.clone()))?;

        let mut order = Order::new(Uuid::new_v4().to_string(), request);
        match script {
            FillScript::Fill => {
                let size = order.request.size;
                Self::book_fill(&mut state, &mut order, size, price);
            }
            FillScript::Partial(fraction) => {
                let size = order.request.size * fraction;
                Self::book_fill(&mut state, &mut order, size, price);
            }
            FillScript::Hang => {
                state.hanging.insert(order.order_id.clone());
            }
            _ => {}
        }
        state.orders.insert(order.order_id.clone(), order.clone());
        Ok(order)
    }

    async fn cancel_order(&self, _symbol: &str, order_id: &str) -> Result<Order, TradingError> {
        let mut state = self.state.write().await;
        let order = state
            .orders
            .get_mut(order_id)
            .ok_or_else(|| self.not_found(order_id))?;
        if !order.is_final_state() {
            order.mark_canceled();
        }
        Ok(order.clone())
    }

    async fn get_order_status(&self, _symbol: &str, order_id: &str) -> Result<Order, TradingError> {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        let mut order = state
            .orders
            .get(order_id)
            .cloned()
            .ok_or_else(|| self.not_found(order_id))?;

        // FillOnPoll orders complete on their first poll.
        if order.status == OrderStatus::New && !state.hanging.contains(order_id) {
            let price = state
                .prices
                .get(&order.request.symbol)
                .map(|t| Self::executable_price(t, order.request.side))
                .ok_or_else(|| TradingError::PriceNotReady(order.request.symbol.clone()))?;
            let size = order.request.size;
            Self::book_fill(state, &mut order, size, price);
            state.orders.insert(order_id.to_string(), order.clone());
        }
        Ok(order)
    }

    async fn get_balance(&self, asset: &str) -> Result<Balance, TradingError> {
        let state = self.state.read().await;
        if !state.connected {
            return Err(TradingError::Disconnected);
        }
        let free = if asset == state.quote_asset {
            state.quote_balance
        } else {
            Decimal::ZERO
        };
        Ok(Balance {
            exchange: self.exchange,
            asset: asset.to_string(),
            total: free,
            free,
            as_of: Utc::now(),
        })
    }

    async fn stream_events(
        &self,
        symbols: Vec<String>,
        tx: mpsc::Sender<MarketEvent>,
    ) -> anyhow::Result<()> {
        let mut rx = self.events.subscribe();
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if symbols.iter().any(|s| s == event.symbol()) && tx.send(event).await.is_err()
                    {
                        return Ok(());
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!(exchange = %self.exchange, skipped = n, "Mock event stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    async fn btc_mock() -> MockExchange {
        let mock = MockExchange::with_symbols(Exchange::Binance, ["BTCUSDT"]);
        mock.push_price("BTCUSDT", dec!(100), dec!(101)).await;
        mock
    }

    fn buy(size: Decimal) -> OrderRequest {
        OrderRequest::market(Exchange::Binance, "BTCUSDT", OrderSide::Buy, size, false, "t")
    }

    #[tokio::test]
    async fn test_market_buy_fills_at_ask() {
        let mock = btc_mock().await;
        let order = mock.place_order(buy(dec!(2))).await.unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.avg_fill_price, Some(dec!(101)));
        assert_eq!(mock.position("BTCUSDT").await, dec!(2));
    }

    #[tokio::test]
    async fn test_scripts_are_consumed_in_order() {
        let mock = btc_mock().await;
        mock.push_script(FillScript::Reject("no margin".into())).await;
        mock.push_script(FillScript::Partial(dec!(0.5))).await;

        let first = mock.place_order(buy(dec!(1))).await;
        assert!(matches!(first, Err(TradingError::Rejected(_))));

        let second = mock.place_order(buy(dec!(1))).await.unwrap();
        assert_eq!(second.status, OrderStatus::PartiallyFilled);
        assert_eq!(second.filled_size, dec!(0.5));

        let cancelled = mock.cancel_order("BTCUSDT", &second.order_id).await.unwrap();
        assert_eq!(cancelled.status, OrderStatus::Canceled);
        assert_eq!(cancelled.filled_size, dec!(0.5));

        let third = mock.place_order(buy(dec!(1))).await.unwrap();
        assert_eq!(third.status, OrderStatus::Filled);
    }

    #[tokio::test]
    async fn test_fill_on_poll_and_hang() {
        let mock = btc_mock().await;
        mock.push_script(FillScript::FillOnPoll).await;
        mock.push_script(FillScript::Hang).await;

        let lazy = mock.place_order(buy(dec!(1))).await.unwrap();
        assert_eq!(lazy.status, OrderStatus::New);
        let polled = mock.get_order_status("BTCUSDT", &lazy.order_id).await.unwrap();
        assert_eq!(polled.status, OrderStatus::Filled);

        let stuck = mock.place_order(buy(dec!(1))).await.unwrap();
        let polled = mock.get_order_status("BTCUSDT", &stuck.order_id).await.unwrap();
        assert_eq!(polled.status, OrderStatus::New);
    }

    #[tokio::test]
    async fn test_disconnected_account_refuses_orders() {
        let mock = btc_mock().await;
        mock.set_connected(false).await;
        assert_eq!(mock.health_check().await, Err(TradingError::Disconnected));
        assert_eq!(
            mock.place_order(buy(dec!(1))).await.unwrap_err(),
            TradingError::Disconnected
        );
    }

    #[tokio::test]
    async fn test_stream_forwards_only_requested_symbols() {
        let mock = Arc::new(btc_mock().await);
        let (tx, mut rx) = mpsc::channel(8);
        let streamer = mock.clone();
        tokio::spawn(async move { streamer.stream_events(vec!["BTCUSDT".into()], tx).await });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        mock.push_price("ETHUSDT", dec!(1), dec!(2)).await;
        mock.push_price("BTCUSDT", dec!(102), dec!(103)).await;

        match rx.recv().await {
            Some(MarketEvent::Price(tick)) => {
                assert_eq!(tick.symbol, "BTCUSDT");
                assert_eq!(tick.bid, dec!(102));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
