use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::store::{PairId, PersistencePort, StoreError};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, Display, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationKind {
    Open,
    Close,
    Sl,
    Liquidation,
    Error,
    Margin,
    Pause,
    SecondLegFail,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Severity {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub pair_id: Option<PairId>,
    pub kind: NotificationKind,
    pub severity: Severity,
    pub message: String,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(kind: NotificationKind, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            pair_id: None,
            kind,
            severity,
            message: message.into(),
            metadata: None,
            created_at: Utc::now(),
        }
    }

    pub fn for_pair(mut self, pair_id: PairId) -> Self {
        self.pair_id = Some(pair_id);
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Receives human-readable events. Never feeds back into trading decisions.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn emit(&self, notification: &Notification) -> Result<(), StoreError>;
}

#[async_trait]
impl<T: NotificationSink + ?Sized> NotificationSink for Arc<T> {
    async fn emit(&self, notification: &Notification) -> Result<(), StoreError> {
        self.as_ref().emit(notification).await
    }
}

/// Logs every notification and appends it to the persistence port.
pub struct StoreSink {
    store: Arc<dyn PersistencePort>,
}

impl StoreSink {
    pub fn new(store: Arc<dyn PersistencePort>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl NotificationSink for StoreSink {
    async fn emit(&self, n: &Notification) -> Result<(), StoreError> {
        match n.severity {
            Severity::Info => info!(kind = %n.kind, pair_id = ?n.pair_id, "{}", n.message),
            Severity::Warn => warn!(kind = %n.kind, pair_id = ?n.pair_id, "{}", n.message),
            Severity::Error => error!(kind = %n.kind, pair_id = ?n.pair_id, "{}", n.message),
        }
        self.store.append_notification(n).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::str::FromStr;

    #[test]
    fn test_kind_wire_names() {
        assert_eq!(NotificationKind::SecondLegFail.to_string(), "SECOND_LEG_FAIL");
        assert_eq!(NotificationKind::from_str("SL").unwrap(), NotificationKind::Sl);
        let json = serde_json::to_string(&NotificationKind::Liquidation).unwrap();
        assert_eq!(json, "\"LIQUIDATION\"");
    }

    #[tokio::test]
    async fn test_store_sink_appends() {
        let store = Arc::new(MemoryStore::new());
        let sink = StoreSink::new(store.clone());
        let n = Notification::new(NotificationKind::Open, Severity::Info, "opened").for_pair(3);
        sink.emit(&n).await.unwrap();

        let listed = store.list_notifications(10).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].pair_id, Some(3));
    }
}
