use serde_json::json;
use spreadarb_core::notify::{Notification, NotificationKind, NotificationSink, Severity};
use spreadarb_core::store::{
    LiquidationEvent, NewPair, OrderPurpose, OrderRecord, PairConfig, PairId, PersistencePort,
    Settings, StopLossEvent, StoreError, TradeRecord,
};
use spreadarb_core::types::OrderType;
use spreadarb_core::utils::{RetryPolicy, retry_with_backoff};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::arbitrage::types::LegFill;

/// Audit trail and notification outlet shared by every pair actor.
///
/// Writes are retried with backoff; once retries are exhausted an `ERROR`
/// notification carrying the store error is emitted and the error returned.
/// Notifications are filtered by the user's preferences, except that
/// error-severity events always go out.
#[derive(Clone)]
pub struct Journal {
    store: Arc<dyn PersistencePort>,
    sink: Arc<dyn NotificationSink>,
    retry: RetryPolicy,
    settings: Arc<RwLock<Settings>>,
}

impl Journal {
    pub fn new(
        store: Arc<dyn PersistencePort>,
        sink: Arc<dyn NotificationSink>,
        retry: RetryPolicy,
        settings: Arc<RwLock<Settings>>,
    ) -> Self {
        Self {
            store,
            sink,
            retry,
            settings,
        }
    }

    pub fn store(&self) -> &Arc<dyn PersistencePort> {
        &self.store
    }

    pub fn settings(&self) -> &Arc<RwLock<Settings>> {
        &self.settings
    }

    async fn persist<T, F, Fut>(
        &self,
        op_name: &str,
        pair_id: Option<PairId>,
        op: F,
    ) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        match retry_with_backoff(&self.retry, op_name, op).await {
            Ok(v) => Ok(v),
            Err(e) => {
                error!(op = op_name, ?pair_id, error = %e, "Persistence failed after retries");
                let mut n = Notification::new(
                    NotificationKind::Error,
                    Severity::Error,
                    format!("{op_name} failed: {e}"),
                )
                .with_metadata(json!({ "api_error": e.to_string(), "op": op_name }));
                if let Some(id) = pair_id {
                    n = n.for_pair(id);
                }
                self.notify(n).await;
                Err(e)
            }
        }
    }

    pub async fn notify(&self, notification: Notification) {
        if notification.severity < Severity::Error
            && !self
                .settings
                .read()
                .await
                .notification_enabled(notification.kind)
        {
            debug!(kind = %notification.kind, pair_id = ?notification.pair_id, "Notification suppressed by preferences");
            return;
        }
        if let Err(e) = self.sink.emit(&notification).await {
            warn!(kind = %notification.kind, error = %e, "Notification sink failed");
        }
    }

    pub async fn insert_pair(&self, pair: NewPair) -> Result<PairConfig, StoreError> {
        self.persist("insert_pair", None, || self.store.insert_pair(pair.clone()))
            .await
    }

    pub async fn save_pair(&self, pair: &PairConfig) -> Result<(), StoreError> {
        self.persist("update_pair", Some(pair.id), || self.store.update_pair(pair))
            .await
    }

    pub async fn delete_pair(&self, id: PairId) -> Result<bool, StoreError> {
        self.persist("delete_pair", Some(id), || self.store.delete_pair(id))
            .await
    }

    pub async fn record_fill(
        &self,
        pair_id: PairId,
        part_index: u32,
        purpose: OrderPurpose,
        fill: &LegFill,
    ) -> Result<(), StoreError> {
        let record = OrderRecord {
            id: Uuid::new_v4(),
            pair_id,
            exchange: fill.exchange,
            side: fill.order_side,
            leg_side: fill.leg_side,
            order_type: OrderType::Market,
            purpose,
            part_index,
            quantity: fill.requested,
            filled_quantity: fill.filled,
            avg_fill_price: fill.avg_price,
            status: fill.status,
            exchange_order_id: fill.order_id.clone(),
            error: fill.error.clone(),
            created_at: fill.created_at,
            filled_at: fill.filled_at,
        };
        // Same id on every attempt, so a retried append lands once.
        self.persist("append_order", Some(pair_id), || {
            self.store.append_order(&record)
        })
        .await
    }

    /// Record a batch of fills; keeps going past failures and returns the first.
    pub async fn record_fills<'a>(
        &self,
        pair_id: PairId,
        part_index: u32,
        purpose: OrderPurpose,
        fills: impl IntoIterator<Item = &'a LegFill>,
    ) -> Result<(), StoreError> {
        let mut first_err = None;
        for fill in fills {
            if let Err(e) = self.record_fill(pair_id, part_index, purpose, fill).await {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    pub async fn record_trade(&self, trade: &TradeRecord) -> Result<(), StoreError> {
        self.persist("append_trade", Some(trade.pair_id), || {
            self.store.append_trade(trade)
        })
        .await
    }

    pub async fn record_stop_loss(&self, event: &StopLossEvent) -> Result<(), StoreError> {
        self.persist("append_stop_loss", Some(event.pair_id), || {
            self.store.append_stop_loss(event)
        })
        .await
    }

    pub async fn record_liquidation(&self, event: &LiquidationEvent) -> Result<(), StoreError> {
        self.persist("append_liquidation", Some(event.pair_id), || {
            self.store.append_liquidation(event)
        })
        .await
    }

    /// Persist and publish new settings.
    pub async fn put_settings(&self, settings: Settings) -> Result<(), StoreError> {
        self.persist("put_settings", None, || self.store.put_settings(&settings))
            .await?;
        *self.settings.write().await = settings;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use spreadarb_core::store::{MemoryStore, OrderRecordStatus};
    use spreadarb_core::notify::StoreSink;
    use spreadarb_core::types::{Exchange, PositionSide};
    use std::time::Duration;

    fn journal(store: Arc<MemoryStore>, settings: Settings) -> Journal {
        let sink = Arc::new(StoreSink::new(store.clone()));
        Journal::new(
            store,
            sink,
            RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
            },
            Arc::new(RwLock::new(settings)),
        )
    }

    fn fill() -> LegFill {
        LegFill {
            exchange: Exchange::Binance,
            leg_side: PositionSide::Long,
            order_side: PositionSide::Long.open_side(),
            requested: dec!(0.5),
            filled: dec!(0.5),
            avg_price: Some(dec!(50000)),
            order_id: Some("x-1".into()),
            status: OrderRecordStatus::Filled,
            error: None,
            created_at: Utc::now(),
            filled_at: Some(Utc::now()),
        }
    }

    #[tokio::test]
    async fn test_transient_write_failure_is_retried() {
        let store = Arc::new(MemoryStore::new());
        let j = journal(store.clone(), Settings::default());
        store.fail_next_writes(2);

        j.record_fill(7, 0, OrderPurpose::Entry, &fill()).await.unwrap();
        let orders = store.list_orders(7).await.unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].exchange_order_id.as_deref(), Some("x-1"));
        assert!(store.list_notifications(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_exhausted_retries_raise_api_error() {
        let store = Arc::new(MemoryStore::new());
        let j = journal(store.clone(), Settings::default());
        store.fail_next_writes(3);

        assert!(j.record_fill(7, 0, OrderPurpose::Entry, &fill()).await.is_err());
        let notes = store.list_notifications(10).await.unwrap();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].kind, NotificationKind::Error);
        assert_eq!(notes[0].severity, Severity::Error);
        assert_eq!(notes[0].pair_id, Some(7));
        let meta = notes[0].metadata.as_ref().unwrap();
        assert!(meta["api_error"].as_str().unwrap().contains("injected"));
    }

    #[tokio::test]
    async fn test_preferences_never_mute_errors() {
        let store = Arc::new(MemoryStore::new());
        let settings = Settings {
            disabled_notifications: vec![NotificationKind::Open, NotificationKind::Error],
            ..Default::default()
        };
        let j = journal(store.clone(), settings);

        j.notify(Notification::new(NotificationKind::Open, Severity::Info, "opened")).await;
        j.notify(Notification::new(NotificationKind::Error, Severity::Warn, "nothing filled")).await;
        j.notify(Notification::new(NotificationKind::Error, Severity::Error, "stuck")).await;
        j.notify(Notification::new(NotificationKind::Close, Severity::Info, "closed")).await;

        let kinds: Vec<_> = store
            .list_notifications(10)
            .await
            .unwrap()
            .into_iter()
            .map(|n| (n.kind, n.severity))
            .collect();
        assert_eq!(
            kinds,
            vec![
                (NotificationKind::Close, Severity::Info),
                (NotificationKind::Error, Severity::Error),
            ]
        );
    }
}
