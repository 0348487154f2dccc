use async_trait::async_trait;
use rust_decimal::Decimal;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::types::{Balance, Exchange, MarketEvent, Order, OrderRequest, PriceTick};

// ──────────────────────────────────────────────────────────────────
// Trading / Execution errors and traits
// ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Error, PartialEq)]
pub enum TradingError {
    #[error("insufficient balance: required {required}, available {available}")]
    InsufficientBalance {
        required: Decimal,
        available: Decimal,
    },
    #[error("order not found: {order_id} on {exchange}")]
    OrderNotFound { exchange: String, order_id: String },
    #[error("order rejected: {0}")]
    Rejected(String),
    #[error("symbol not tradable: {0}")]
    UnsupportedSymbol(String),
    #[error("no price available for {0}")]
    PriceNotReady(String),
    #[error("request timed out")]
    Timeout,
    #[error("exchange disconnected")]
    Disconnected,
    #[error("rate limited")]
    RateLimited,
    #[error("network error: {0}")]
    Network(String),
    #[error("other: {0}")]
    Other(String),
}

/// One connected exchange account.
///
/// Every call may fail, time out, or (for orders) partially fill; the engine
/// treats the gateway as unreliable and owns all recovery.
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    fn exchange(&self) -> Exchange;

    /// `Ok` while the account connection is usable.
    async fn health_check(&self) -> Result<(), TradingError>;

    async fn is_tradable(&self, symbol: &str) -> Result<bool, TradingError>;

    async fn get_price(&self, symbol: &str) -> Result<PriceTick, TradingError>;

    /// Submit an order. The returned order may already be final (market
    /// orders usually are) or still working.
    async fn place_order(&self, request: OrderRequest) -> Result<Order, TradingError>;

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<Order, TradingError>;

    async fn get_order_status(&self, symbol: &str, order_id: &str) -> Result<Order, TradingError>;

    async fn get_balance(&self, asset: &str) -> Result<Balance, TradingError>;

    /// Push price ticks and liquidation notices for `symbols` into `tx`.
    /// Blocks until the stream closes, so callers should `tokio::spawn` it.
    async fn stream_events(
        &self,
        symbols: Vec<String>,
        tx: mpsc::Sender<MarketEvent>,
    ) -> anyhow::Result<()>;
}

// Blanket impl: Arc<T> automatically satisfies ExchangeGateway when T does.
// This lets the runner share a single Arc<Client> across multiple tasks.
#[async_trait]
impl<T: ExchangeGateway + ?Sized> ExchangeGateway for std::sync::Arc<T> {
    fn exchange(&self) -> Exchange {
        self.as_ref().exchange()
    }

    async fn health_check(&self) -> Result<(), TradingError> {
        self.as_ref().health_check().await
    }

    async fn is_tradable(&self, symbol: &str) -> Result<bool, TradingError> {
        self.as_ref().is_tradable(symbol).await
    }

    async fn get_price(&self, symbol: &str) -> Result<PriceTick, TradingError> {
        self.as_ref().get_price(symbol).await
    }

    async fn place_order(&self, request: OrderRequest) -> Result<Order, TradingError> {
        self.as_ref().place_order(request).await
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<Order, TradingError> {
        self.as_ref().cancel_order(symbol, order_id).await
    }

    async fn get_order_status(&self, symbol: &str, order_id: &str) -> Result<Order, TradingError> {
        self.as_ref().get_order_status(symbol, order_id).await
    }

    async fn get_balance(&self, asset: &str) -> Result<Balance, TradingError> {
        self.as_ref().get_balance(asset).await
    }

    async fn stream_events(
        &self,
        symbols: Vec<String>,
        tx: mpsc::Sender<MarketEvent>,
    ) -> anyhow::Result<()> {
        self.as_ref().stream_events(symbols, tx).await
    }
}
