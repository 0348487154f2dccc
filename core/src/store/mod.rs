//! Persistence port: durable storage the engine writes its audit trail to.
//!
//! Simple keyed CRUD for pair configuration, append-only logs for orders,
//! trades, risk events and notifications, plus the single global settings
//! record. `MemoryStore` is the in-process implementation used by the
//! paper runner and by tests.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use strum::Display;
use thiserror::Error;
use uuid::Uuid;

use crate::notify::{Notification, NotificationKind};
use crate::types::{Exchange, OrderSide, OrderType, PositionSide};

pub use memory::MemoryStore;

pub type PairId = u64;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("duplicate record: {0}")]
    Duplicate(String),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

// ── Pair configuration ────────────────────────────────────────────

/// User-facing run flag persisted with the pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PairActivity {
    Paused,
    Active,
}

/// The mutable trading parameters of a pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradingParams {
    /// Spread (percent of price) at or above which a part is entered.
    pub entry_spread_pct: Decimal,
    /// Spread (percent of price) at or below which the position is closed.
    pub exit_spread_pct: Decimal,
    /// Total position size in base asset, split evenly across `n_orders`.
    pub volume: Decimal,
    pub n_orders: u32,
    /// Quote-currency loss that forces an exit. Zero disables it.
    pub stop_loss: Decimal,
}

impl TradingParams {
    /// Base-asset quantity of a single part.
    pub fn part_volume(&self) -> Decimal {
        self.volume / Decimal::from(self.n_orders.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairConfig {
    pub id: PairId,
    pub symbol: String,
    pub base: String,
    pub quote: String,
    #[serde(flatten)]
    pub params: TradingParams,
    pub trade_count: u64,
    pub total_pnl: Decimal,
    pub status: PairActivity,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewPair {
    pub symbol: String,
    pub base: String,
    pub quote: String,
    #[serde(flatten)]
    pub params: TradingParams,
}

// ── Order audit trail ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum OrderRecordStatus {
    Filled,
    Cancelled,
    Rejected,
}

/// Why an order was sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum OrderPurpose {
    Entry,
    Unwind,
    Close,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRecord {
    pub id: Uuid,
    pub pair_id: PairId,
    pub exchange: Exchange,
    pub side: OrderSide,
    pub leg_side: PositionSide,
    pub order_type: OrderType,
    pub purpose: OrderPurpose,
    /// Which of the `n_orders` splits this order belongs to.
    pub part_index: u32,
    pub quantity: Decimal,
    pub filled_quantity: Decimal,
    pub avg_fill_price: Option<Decimal>,
    pub status: OrderRecordStatus,
    pub exchange_order_id: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub filled_at: Option<DateTime<Utc>>,
}

// ── Trades and risk events ────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CloseReason {
    SpreadExit,
    StopLoss,
    ForcePause,
    Reconcile,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub id: Uuid,
    pub pair_id: PairId,
    pub symbol: String,
    pub long_exchange: Exchange,
    pub short_exchange: Exchange,
    /// Base-asset quantity per leg at the time of closing.
    pub quantity: Decimal,
    pub parts: u32,
    pub entry_spread_pct: Decimal,
    pub exit_spread_pct: Decimal,
    pub realized_pnl: Decimal,
    pub reason: CloseReason,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopLossEvent {
    pub pair_id: PairId,
    pub symbol: String,
    pub long_exchange: Exchange,
    pub short_exchange: Exchange,
    pub unrealized_pnl: Decimal,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiquidationEvent {
    pub pair_id: PairId,
    pub symbol: String,
    pub exchange: Exchange,
    pub side: PositionSide,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PeriodStats {
    pub trades: u64,
    pub pnl: Decimal,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TradeStats {
    pub today: PeriodStats,
    pub week: PeriodStats,
    pub month: PeriodStats,
    pub lifetime: PeriodStats,
    pub stop_losses: Vec<StopLossEvent>,
    pub liquidations: Vec<LiquidationEvent>,
}

// ── Settings ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Reserved; funding rates do not influence decisions yet.
    #[serde(default)]
    pub consider_funding: bool,
    /// `None` means unbounded.
    #[serde(default)]
    pub max_concurrent_trades: Option<u32>,
    #[serde(default)]
    pub disabled_notifications: Vec<NotificationKind>,
}

impl Settings {
    pub fn notification_enabled(&self, kind: NotificationKind) -> bool {
        !self.disabled_notifications.contains(&kind)
    }
}

// ── Port ──────────────────────────────────────────────────────────

#[async_trait]
pub trait PersistencePort: Send + Sync {
    async fn insert_pair(&self, pair: NewPair) -> Result<PairConfig, StoreError>;

    async fn get_pair(&self, id: PairId) -> Result<Option<PairConfig>, StoreError>;

    async fn find_pair_by_symbol(&self, symbol: &str) -> Result<Option<PairConfig>, StoreError>;

    async fn list_pairs(&self) -> Result<Vec<PairConfig>, StoreError>;

    async fn update_pair(&self, pair: &PairConfig) -> Result<(), StoreError>;

    /// Returns `false` if no pair had this id.
    async fn delete_pair(&self, id: PairId) -> Result<bool, StoreError>;

    /// Append an order record. Appending the same record id twice is a no-op,
    /// so callers may retry after an ambiguous failure.
    async fn append_order(&self, record: &OrderRecord) -> Result<(), StoreError>;

    async fn list_orders(&self, pair_id: PairId) -> Result<Vec<OrderRecord>, StoreError>;

    async fn append_trade(&self, trade: &TradeRecord) -> Result<(), StoreError>;

    async fn list_trades(&self, pair_id: Option<PairId>) -> Result<Vec<TradeRecord>, StoreError>;

    async fn append_stop_loss(&self, event: &StopLossEvent) -> Result<(), StoreError>;

    async fn append_liquidation(&self, event: &LiquidationEvent) -> Result<(), StoreError>;

    async fn append_notification(&self, notification: &Notification) -> Result<(), StoreError>;

    /// Most recent first.
    async fn list_notifications(&self, limit: usize) -> Result<Vec<Notification>, StoreError>;

    async fn get_settings(&self) -> Result<Settings, StoreError>;

    async fn put_settings(&self, settings: &Settings) -> Result<(), StoreError>;

    /// Aggregate trade counts and PnL relative to `now`.
    async fn trade_stats(&self, now: DateTime<Utc>) -> Result<TradeStats, StoreError>;
}

#[async_trait]
impl<T: PersistencePort + ?Sized> PersistencePort for std::sync::Arc<T> {
    async fn insert_pair(&self, pair: NewPair) -> Result<PairConfig, StoreError> {
        self.as_ref().insert_pair(pair).await
    }

    async fn get_pair(&self, id: PairId) -> Result<Option<PairConfig>, StoreError> {
        self.as_ref().get_pair(id).await
    }

    async fn find_pair_by_symbol(&self, symbol: &str) -> Result<Option<PairConfig>, StoreError> {
        self.as_ref().find_pair_by_symbol(symbol).await
    }

    async fn list_pairs(&self) -> Result<Vec<PairConfig>, StoreError> {
        self.as_ref().list_pairs().await
    }

    async fn update_pair(&self, pair: &PairConfig) -> Result<(), StoreError> {
        self.as_ref().update_pair(pair).await
    }

    async fn delete_pair(&self, id: PairId) -> Result<bool, StoreError> {
        self.as_ref().delete_pair(id).await
    }

    async fn append_order(&self, record: &OrderRecord) -> Result<(), StoreError> {
        self.as_ref().append_order(record).await
    }

    async fn list_orders(&self, pair_id: PairId) -> Result<Vec<OrderRecord>, StoreError> {
        self.as_ref().list_orders(pair_id).await
    }

    async fn append_trade(&self, trade: &TradeRecord) -> Result<(), StoreError> {
        self.as_ref().append_trade(trade).await
    }

    async fn list_trades(&self, pair_id: Option<PairId>) -> Result<Vec<TradeRecord>, StoreError> {
        self.as_ref().list_trades(pair_id).await
    }

    async fn append_stop_loss(&self, event: &StopLossEvent) -> Result<(), StoreError> {
        self.as_ref().append_stop_loss(event).await
    }

    async fn append_liquidation(&self, event: &LiquidationEvent) -> Result<(), StoreError> {
        self.as_ref().append_liquidation(event).await
    }

    async fn append_notification(&self, notification: &Notification) -> Result<(), StoreError> {
        self.as_ref().append_notification(notification).await
    }

    async fn list_notifications(&self, limit: usize) -> Result<Vec<Notification>, StoreError> {
        self.as_ref().list_notifications(limit).await
    }

    async fn get_settings(&self) -> Result<Settings, StoreError> {
        self.as_ref().get_settings().await
    }

    async fn put_settings(&self, settings: &Settings) -> Result<(), StoreError> {
        self.as_ref().put_settings(settings).await
    }

    async fn trade_stats(&self, now: DateTime<Utc>) -> Result<TradeStats, StoreError> {
        self.as_ref().trade_stats(now).await
    }
}
