use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumProperty, EnumString};

// exchange accounts we can connect to
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    EnumString,
    Display,
    EnumProperty,
    Serialize,
    Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Exchange {
    #[strum(to_string = "binance", serialize = "BN", props(short_code = "BN"))]
    Binance,
    #[strum(to_string = "bybit", serialize = "BY", props(short_code = "BY"))]
    Bybit,
    #[strum(to_string = "gateio", serialize = "GT", props(short_code = "GT"))]
    Gateio,
    #[strum(to_string = "aster", serialize = "AS", props(short_code = "AS"))]
    Aster,
    #[strum(to_string = "okx", serialize = "OK", props(short_code = "OK"))]
    Okx,
}

impl Exchange {
    pub fn short_code(&self) -> &'static str {
        self.get_str("short_code").unwrap_or("UNKNOWN")
    }
}

/// Direction of an open leg.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, Display, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    /// Order side that opens a leg in this direction.
    pub fn open_side(&self) -> OrderSide {
        match self {
            PositionSide::Long => OrderSide::Buy,
            PositionSide::Short => OrderSide::Sell,
        }
    }

    /// Order side that flattens a leg in this direction.
    pub fn close_side(&self) -> OrderSide {
        match self {
            PositionSide::Long => OrderSide::Sell,
            PositionSide::Short => OrderSide::Buy,
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, Display, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, Display, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum OrderType {
    Market,
    Limit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
}

impl OrderStatus {
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Canceled | OrderStatus::Rejected
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub exchange: Exchange,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub price: Option<Decimal>,
    pub size: Decimal,
    /// Closing orders must never flip a leg into the opposite direction.
    pub reduce_only: bool,
    /// Free-form tag, e.g. `"pair-7-p0-long"`, echoed back by the exchange.
    pub client_tag: String,
}

impl OrderRequest {
    pub fn market(
        exchange: Exchange,
        symbol: impl Into<String>,
        side: OrderSide,
        size: Decimal,
        reduce_only: bool,
        client_tag: impl Into<String>,
    ) -> Self {
        Self {
            exchange,
            symbol: symbol.into(),
            side,
            order_type: OrderType::Market,
            price: None,
            size,
            reduce_only,
            client_tag: client_tag.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    pub request: OrderRequest,
    pub status: OrderStatus,
    pub filled_size: Decimal,
    pub avg_fill_price: Option<Decimal>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn new(order_id: impl Into<String>, request: OrderRequest) -> Self {
        let now = Utc::now();
        Self {
            order_id: order_id.into(),
            request,
            status: OrderStatus::New,
            filled_size: Decimal::ZERO,
            avg_fill_price: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_final_state(&self) -> bool {
        self.status.is_final()
    }

    pub fn is_fully_filled(&self) -> bool {
        self.status == OrderStatus::Filled && self.filled_size >= self.request.size
    }

    /// Record an execution against this order, keeping a size-weighted average price.
    pub fn apply_fill(&mut self, fill_size: Decimal, fill_price: Decimal) {
        if fill_size.is_zero() {
            return;
        }
        let prev_notional = self.avg_fill_price.unwrap_or(Decimal::ZERO) * self.filled_size;
        let new_filled = self.filled_size + fill_size;
        self.avg_fill_price = Some((prev_notional + fill_size * fill_price) / new_filled);
        self.filled_size = new_filled;
        self.status = if self.filled_size >= self.request.size {
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        };
        self.updated_at = Utc::now();
    }

    pub fn mark_canceled(&mut self) {
        self.status = OrderStatus::Canceled;
        self.updated_at = Utc::now();
    }

    pub fn mark_rejected(&mut self) {
        self.status = OrderStatus::Rejected;
        self.updated_at = Utc::now();
    }
}

/// Top-of-book quote for one symbol on one exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceTick {
    pub exchange: Exchange,
    pub symbol: String,
    pub bid: Decimal,
    pub ask: Decimal,
    pub timestamp: DateTime<Utc>,
}

impl PriceTick {
    pub fn new(exchange: Exchange, symbol: impl Into<String>, bid: Decimal, ask: Decimal) -> Self {
        Self {
            exchange,
            symbol: symbol.into(),
            bid,
            ask,
            timestamp: Utc::now(),
        }
    }

    /// Single-price feed: bid and ask collapse to the same level.
    pub fn flat(exchange: Exchange, symbol: impl Into<String>, price: Decimal) -> Self {
        Self::new(exchange, symbol, price, price)
    }

    pub fn mid(&self) -> Decimal {
        (self.bid + self.ask) / Decimal::TWO
    }

    pub fn is_valid(&self) -> bool {
        self.bid > Decimal::ZERO && self.ask > Decimal::ZERO
    }
}

/// Everything an exchange pushes at the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum MarketEvent {
    Price(PriceTick),
    /// The exchange force-closed a position on `symbol`.
    Liquidation {
        exchange: Exchange,
        symbol: String,
        side: PositionSide,
        timestamp: DateTime<Utc>,
    },
}

impl MarketEvent {
    pub fn symbol(&self) -> &str {
        match self {
            MarketEvent::Price(tick) => &tick.symbol,
            MarketEvent::Liquidation { symbol, .. } => symbol,
        }
    }

    pub fn exchange(&self) -> Exchange {
        match self {
            MarketEvent::Price(tick) => tick.exchange,
            MarketEvent::Liquidation { exchange, .. } => *exchange,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    pub exchange: Exchange,
    pub asset: String,
    pub total: Decimal,
    pub free: Decimal,
    pub as_of: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    Live,
    #[default]
    Paper,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::str::FromStr;

    #[test]
    fn test_exchange_strum_properties() {
        assert_eq!(Exchange::Binance.short_code(), "BN");
        assert_eq!(Exchange::Binance.to_string(), "binance");
        assert_eq!(Exchange::from_str("BN").unwrap(), Exchange::Binance);
        assert_eq!(Exchange::from_str("bybit").unwrap(), Exchange::Bybit);
        assert!(Exchange::from_str("kraken").is_err());
    }

    #[test]
    fn test_position_side_order_sides() {
        assert_eq!(PositionSide::Long.open_side(), OrderSide::Buy);
        assert_eq!(PositionSide::Long.close_side(), OrderSide::Sell);
        assert_eq!(PositionSide::Short.open_side(), OrderSide::Sell);
        assert_eq!(PositionSide::Short.close_side(), OrderSide::Buy);
    }

    #[test]
    fn test_apply_fill_weights_average_price() {
        let req = OrderRequest::market(
            Exchange::Binance,
            "BTCUSDT",
            OrderSide::Buy,
            dec!(1.0),
            false,
            "t",
        );
        let mut order = Order::new("o-1", req);
        order.apply_fill(dec!(0.5), dec!(100));
        assert_eq!(order.status, OrderStatus::PartiallyFilled);
        order.apply_fill(dec!(0.5), dec!(110));
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.avg_fill_price, Some(dec!(105)));
        assert!(order.is_fully_filled());
    }

    #[test]
    fn test_flat_tick_mid() {
        let tick = PriceTick::new(Exchange::Okx, "ETHUSDT", dec!(99), dec!(101));
        assert_eq!(tick.mid(), dec!(100));
        assert!(tick.is_valid());
        assert!(!PriceTick::flat(Exchange::Okx, "ETHUSDT", Decimal::ZERO).is_valid());
    }
}
