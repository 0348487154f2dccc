use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration, NaiveTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    LiquidationEvent, NewPair, OrderRecord, PairActivity, PairConfig, PairId, PeriodStats,
    PersistencePort, Settings, StopLossEvent, StoreError, TradeRecord, TradeStats,
};
use crate::notify::Notification;

#[derive(Default)]
struct MemoryState {
    next_pair_id: PairId,
    pairs: BTreeMap<PairId, PairConfig>,
    orders: Vec<OrderRecord>,
    order_ids: HashSet<Uuid>,
    trades: Vec<TradeRecord>,
    stop_losses: Vec<StopLossEvent>,
    liquidations: Vec<LiquidationEvent>,
    notifications: Vec<Notification>,
    settings: Settings,
}

/// In-process persistence. Data lives as long as the process.
///
/// `fail_next_writes` makes the next `n` write calls return
/// `StoreError::Unavailable`, which lets tests exercise retry paths.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
    failing_writes: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_settings(settings: Settings) -> Self {
        Self {
            state: RwLock::new(MemoryState {
                settings,
                ..Default::default()
            }),
            failing_writes: AtomicU32::new(0),
        }
    }

    pub fn fail_next_writes(&self, n: u32) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }

    fn check_write(&self) -> Result<(), StoreError> {
        let tripped = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if tripped {
            Err(StoreError::Unavailable("injected write failure".into()))
        } else {
            Ok(())
        }
    }
}

/// Start of the current UTC day, ISO week (Monday) and calendar month.
fn period_starts(now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>, DateTime<Utc>) {
    let date = now.date_naive();
    let today = date.and_time(NaiveTime::MIN).and_utc();
    let week = today - Duration::days(i64::from(date.weekday().num_days_from_monday()));
    let month = date
        .with_day(1)
        .unwrap_or(date)
        .and_time(NaiveTime::MIN)
        .and_utc();
    (today, week, month)
}

fn accumulate(stats: &mut PeriodStats, trade: &TradeRecord) {
    stats.trades += 1;
    stats.pnl += trade.realized_pnl;
}

#[async_trait]
impl PersistencePort for MemoryStore {
    async fn insert_pair(&self, pair: NewPair) -> Result<PairConfig, StoreError> {
        self.check_write()?;
        let mut state = self.state.write().await;
        if state.pairs.values().any(|p| p.symbol == pair.symbol) {
            return Err(StoreError::Duplicate(pair.symbol));
        }
        state.next_pair_id += 1;
        let now = Utc::now();
        let config = PairConfig {
            id: state.next_pair_id,
            symbol: pair.symbol,
            base: pair.base,
            quote: pair.quote,
            params: pair.params,
            trade_count: 0,
            total_pnl: Default::default(),
            status: PairActivity::Paused,
            created_at: now,
            updated_at: now,
        };
        state.pairs.insert(config.id, config.clone());
        Ok(config)
    }

    async fn get_pair(&self, id: PairId) -> Result<Option<PairConfig>, StoreError> {
        Ok(self.state.read().await.pairs.get(&id).cloned())
    }

    async fn find_pair_by_symbol(&self, symbol: &str) -> Result<Option<PairConfig>, StoreError> {
        let state = self.state.read().await;
        Ok(state.pairs.values().find(|p| p.symbol == symbol).cloned())
    }

    async fn list_pairs(&self) -> Result<Vec<PairConfig>, StoreError> {
        Ok(self.state.read().await.pairs.values().cloned().collect())
    }

    async fn update_pair(&self, pair: &PairConfig) -> Result<(), StoreError> {
        self.check_write()?;
        let mut state = self.state.write().await;
        match state.pairs.get_mut(&pair.id) {
            Some(slot) => {
                *slot = pair.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("pair {}", pair.id))),
        }
    }

    async fn delete_pair(&self, id: PairId) -> Result<bool, StoreError> {
        self.check_write()?;
        Ok(self.state.write().await.pairs.remove(&id).is_some())
    }

    async fn append_order(&self, record: &OrderRecord) -> Result<(), StoreError> {
        self.check_write()?;
        let mut state = self.state.write().await;
        if state.order_ids.insert(record.id) {
            state.orders.push(record.clone());
        }
        Ok(())
    }

    async fn list_orders(&self, pair_id: PairId) -> Result<Vec<OrderRecord>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .orders
            .iter()
            .filter(|o| o.pair_id == pair_id)
            .cloned()
            .collect())
    }

    async fn append_trade(&self, trade: &TradeRecord) -> Result<(), StoreError> {
        self.check_write()?;
        let mut state = self.state.write().await;
        if !state.trades.iter().any(|t| t.id == trade.id) {
            state.trades.push(trade.clone());
        }
        Ok(())
    }

    async fn list_trades(&self, pair_id: Option<PairId>) -> Result<Vec<TradeRecord>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .trades
            .iter()
            .filter(|t| pair_id.is_none_or(|id| t.pair_id == id))
            .cloned()
            .collect())
    }

    async fn append_stop_loss(&self, event: &StopLossEvent) -> Result<(), StoreError> {
        self.check_write()?;
        self.state.write().await.stop_losses.push(event.clone());
        Ok(())
    }

    async fn append_liquidation(&self, event: &LiquidationEvent) -> Result<(), StoreError> {
        self.check_write()?;
        self.state.write().await.liquidations.push(event.clone());
        Ok(())
    }

    async fn append_notification(&self, notification: &Notification) -> Result<(), StoreError> {
        self.check_write()?;
        self.state
            .write()
            .await
            .notifications
            .push(notification.clone());
        Ok(())
    }

    async fn list_notifications(&self, limit: usize) -> Result<Vec<Notification>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .notifications
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect())
    }

    async fn get_settings(&self) -> Result<Settings, StoreError> {
        Ok(self.state.read().await.settings.clone())
    }

    async fn put_settings(&self, settings: &Settings) -> Result<(), StoreError> {
        self.check_write()?;
        self.state.write().await.settings = settings.clone();
        Ok(())
    }

    async fn trade_stats(&self, now: DateTime<Utc>) -> Result<TradeStats, StoreError> {
        let state = self.state.read().await;
        let (today, week, month) = period_starts(now);
        let mut stats = TradeStats::default();

        for trade in &state.trades {
            accumulate(&mut stats.lifetime, trade);
            if trade.closed_at >= month {
                accumulate(&mut stats.month, trade);
            }
            if trade.closed_at >= week {
                accumulate(&mut stats.week, trade);
            }
            if trade.closed_at >= today {
                accumulate(&mut stats.today, trade);
            }
        }
        stats.stop_losses = state.stop_losses.clone();
        stats.liquidations = state.liquidations.clone();
        Ok(stats)
    }
}
