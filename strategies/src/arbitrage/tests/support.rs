use std::sync::Arc;
use std::time::Duration;

use exchanges::MockExchange;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use spreadarb_core::config::types::EngineConfig;
use spreadarb_core::notify::{Notification, NotificationKind, StoreSink};
use spreadarb_core::store::{MemoryStore, NewPair, PairId, PersistencePort, Settings, TradingParams};
use spreadarb_core::types::Exchange;
use spreadarb_core::utils::RetryPolicy;
use std::collections::HashMap;

use crate::arbitrage::execution::GatewayMap;
use crate::arbitrage::manager::EngineManager;
use crate::arbitrage::types::{PairSnapshot, PairStatus};

pub const BTC: &str = "BTCUSDT";
pub const ETH: &str = "ETHUSDT";

/// Two paper venues listing BTCUSDT and ETHUSDT, an in-memory store and a
/// running engine with short order deadlines.
pub struct Harness {
    pub binance: Arc<MockExchange>,
    pub bybit: Arc<MockExchange>,
    pub store: Arc<MemoryStore>,
    pub manager: EngineManager,
}

pub fn engine_config(max_pairs: usize) -> EngineConfig {
    EngineConfig {
        order_timeout_ms: 200,
        order_poll_interval_ms: 10,
        max_close_attempts: 3,
        max_pairs,
        mailbox_capacity: 64,
        market_broadcast_capacity: 1024,
    }
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(4),
    }
}

pub fn gateways(binance: &Arc<MockExchange>, bybit: &Arc<MockExchange>) -> GatewayMap {
    let mut map: GatewayMap = HashMap::new();
    map.insert(Exchange::Binance, binance.clone());
    map.insert(Exchange::Bybit, bybit.clone());
    map
}

impl Harness {
    pub async fn new() -> Self {
        Self::build(Settings::default(), 30).await
    }

    pub async fn with_settings(settings: Settings) -> Self {
        Self::build(settings, 30).await
    }

    pub async fn build(settings: Settings, max_pairs: usize) -> Self {
        let binance = Arc::new(MockExchange::with_symbols(Exchange::Binance, [BTC, ETH, "SOLUSDT"]));
        let bybit = Arc::new(MockExchange::with_symbols(Exchange::Bybit, [BTC, ETH]));
        binance.push_price(BTC, dec!(49990), dec!(50000)).await;
        bybit.push_price(BTC, dec!(50000), dec!(50010)).await;
        binance.push_price(ETH, dec!(2999), dec!(3000)).await;
        bybit.push_price(ETH, dec!(3000), dec!(3001)).await;

        let store = Arc::new(MemoryStore::with_settings(settings));
        let manager = Self::engine(&binance, &bybit, &store, max_pairs).await;
        Self {
            binance,
            bybit,
            store,
            manager,
        }
    }

    /// A fresh engine over the same venues and store, as after a restart.
    pub async fn engine(
        binance: &Arc<MockExchange>,
        bybit: &Arc<MockExchange>,
        store: &Arc<MemoryStore>,
        max_pairs: usize,
    ) -> EngineManager {
        let sink = Arc::new(StoreSink::new(store.clone()));
        EngineManager::start(
            engine_config(max_pairs),
            fast_retry(),
            gateways(binance, bybit),
            store.clone(),
            sink,
        )
        .await
        .unwrap()
    }

    pub async fn create_and_start(&self, pair: NewPair) -> PairId {
        let config = self.manager.create_pair(pair).await.unwrap();
        settle().await;
        self.manager.start_pair(config.id).await.unwrap();
        assert!(self.wait_status(config.id, PairStatus::Ready).await);
        config.id
    }

    pub async fn wait_status(&self, id: PairId, status: PairStatus) -> bool {
        let Some(handle) = self.manager.pair_handle(id).await else {
            return false;
        };
        let mut rx = handle.status_watch();
        matches!(
            tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| *s == status)).await,
            Ok(Ok(_))
        )
    }

    /// Round-trip through the pair's mailbox: everything the actor was
    /// doing before this call has completed when it returns.
    pub async fn sync(&self, id: PairId) -> PairSnapshot {
        self.manager.get_pair_with_runtime(id).await.unwrap()
    }

    pub async fn quote_bybit(&self, symbol: &str, bid: Decimal, ask: Decimal) {
        self.bybit.push_price(symbol, bid, ask).await;
    }

    pub async fn quote_binance(&self, symbol: &str, bid: Decimal, ask: Decimal) {
        self.binance.push_price(symbol, bid, ask).await;
    }

    /// BTC pair entered at 1.2%: long Binance @ 50000, short Bybit @ 50600.
    pub async fn btc_holding(&self, pair: NewPair) -> PairId {
        let id = self.create_and_start(pair).await;
        self.quote_bybit(BTC, dec!(50600), dec!(50610)).await;
        assert!(self.wait_status(id, PairStatus::Holding).await);
        id
    }

    pub async fn notifications(&self) -> Vec<Notification> {
        self.store.list_notifications(usize::MAX).await.unwrap()
    }

    pub async fn count(&self, kind: NotificationKind) -> usize {
        self.notifications()
            .await
            .iter()
            .filter(|n| n.kind == kind)
            .count()
    }
}

pub fn params() -> TradingParams {
    TradingParams {
        entry_spread_pct: dec!(1.0),
        exit_spread_pct: dec!(0.2),
        volume: dec!(0.5),
        n_orders: 1,
        stop_loss: dec!(100),
    }
}

pub fn new_pair(symbol: &str, base: &str) -> NewPair {
    NewPair {
        symbol: symbol.to_string(),
        base: base.to_string(),
        quote: "USDT".to_string(),
        params: params(),
    }
}

pub fn btc_pair() -> NewPair {
    new_pair(BTC, "BTC")
}

/// Let queued messages and stream subscriptions catch up.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(30)).await;
}
