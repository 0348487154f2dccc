use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use spreadarb_core::config::types::EngineConfig;
use spreadarb_core::notify::{Notification, NotificationSink};
use spreadarb_core::store::{
    NewPair, OrderRecord, PairActivity, PairConfig, PairId, PersistencePort, Settings, StoreError,
    TradeStats,
};
use spreadarb_core::types::MarketEvent;
use spreadarb_core::utils::RetryPolicy;
use tokio::sync::{Mutex, RwLock, broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::arbitrage::admission::AdmissionController;
use crate::arbitrage::decider::SpreadDecider;
use crate::arbitrage::engine::{EngineContext, PairEngine, PairHandle};
use crate::arbitrage::errors::EngineError;
use crate::arbitrage::execution::{GatewayMap, LegExecutor};
use crate::arbitrage::journal::Journal;
use crate::arbitrage::margin::FreeBalancePolicy;
use crate::arbitrage::params::{ParamsPatch, validate_params, validate_symbol};
use crate::arbitrage::types::{PairSnapshot, UpdateOutcome};

/// Command surface of the engine. One actor per pair, one market feed per
/// symbol fanned out from every gateway.
pub struct EngineManager {
    ctx: Arc<EngineContext>,
    pairs: RwLock<HashMap<PairId, PairHandle>>,
    feeds: Mutex<HashMap<String, broadcast::Sender<MarketEvent>>>,
    feed_tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Serializes the check-then-insert of `create_pair`.
    create_lock: Mutex<()>,
}

impl EngineManager {
    /// Build the engine and restore every persisted pair. Pairs that were
    /// active when last persisted are started again.
    pub async fn start(
        engine_cfg: EngineConfig,
        retry: RetryPolicy,
        gateways: GatewayMap,
        store: Arc<dyn PersistencePort>,
        sink: Arc<dyn NotificationSink>,
    ) -> Result<Self, EngineError> {
        let settings = store.get_settings().await?;
        let admission = Arc::new(AdmissionController::new(settings.max_concurrent_trades));
        let journal = Journal::new(store.clone(), sink, retry, Arc::new(RwLock::new(settings)));
        let executor = LegExecutor::new(
            gateways,
            engine_cfg.order_timeout(),
            engine_cfg.order_poll_interval(),
        );
        let ctx = Arc::new(EngineContext {
            executor,
            admission,
            journal,
            margin: Box::new(FreeBalancePolicy),
            engine_cfg,
        });
        let manager = Self {
            ctx,
            pairs: RwLock::new(HashMap::new()),
            feeds: Mutex::new(HashMap::new()),
            feed_tasks: Mutex::new(Vec::new()),
            create_lock: Mutex::new(()),
        };

        let persisted = store.list_pairs().await?;
        info!(count = persisted.len(), "Restoring pairs");
        for config in persisted {
            let resume = config.status == PairActivity::Active;
            let id = config.id;
            let handle = manager.spawn_pair(config).await;
            if resume && let Err(e) = handle.start().await {
                warn!(pair_id = id, error = %e, "Restored pair could not be started");
            }
        }
        Ok(manager)
    }

    async fn spawn_pair(&self, config: PairConfig) -> PairHandle {
        let market = self.ensure_feed(&config.symbol).await;
        let id = config.id;
        let handle = PairEngine::new(config, SpreadDecider::new(), self.ctx.clone()).spawn(market);
        self.pairs.write().await.insert(id, handle.clone());
        handle
    }

    /// Subscribe to the market feed of `symbol`, starting it on first use.
    async fn ensure_feed(&self, symbol: &str) -> broadcast::Receiver<MarketEvent> {
        let mut feeds = self.feeds.lock().await;
        if let Some(tx) = feeds.get(symbol) {
            return tx.subscribe();
        }

        let capacity = self.ctx.engine_cfg.market_broadcast_capacity.max(1);
        let (fan_out, rx) = broadcast::channel(capacity);
        let (merged_tx, mut merged_rx) = mpsc::channel::<MarketEvent>(capacity);
        let mut tasks = self.feed_tasks.lock().await;

        for (exchange, gw) in self.ctx.executor.gateways() {
            let gw = gw.clone();
            let tx = merged_tx.clone();
            let exchange = *exchange;
            let symbols = vec![symbol.to_string()];
            tasks.push(tokio::spawn(async move {
                if let Err(e) = gw.stream_events(symbols, tx).await {
                    warn!(%exchange, error = %e, "Market stream ended with error");
                }
            }));
        }
        drop(merged_tx);

        let forward = fan_out.clone();
        let feed_symbol = symbol.to_string();
        tasks.push(tokio::spawn(async move {
            while let Some(event) = merged_rx.recv().await {
                // No subscriber means every pair on this symbol is gone.
                let _ = forward.send(event);
            }
            debug!(symbol = %feed_symbol, "Market feed drained");
        }));

        info!(%symbol, "Market feed started");
        feeds.insert(symbol.to_string(), fan_out);
        rx
    }

    async fn handle(&self, id: PairId) -> Result<PairHandle, EngineError> {
        self.pairs
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(EngineError::PairNotFound(id))
    }

    // -----------------------------------------------------------------------
    // Pair commands
    // -----------------------------------------------------------------------

    pub async fn create_pair(&self, new: NewPair) -> Result<PairConfig, EngineError> {
        let _guard = self.create_lock.lock().await;

        validate_symbol(&new.symbol, &new.base, &new.quote)?;
        validate_params(&new.params)?;

        let max_pairs = self.ctx.engine_cfg.max_pairs;
        if self.pairs.read().await.len() >= max_pairs {
            return Err(EngineError::MaxPairsReached(max_pairs));
        }
        let store = self.ctx.journal.store();
        if store.find_pair_by_symbol(&new.symbol).await?.is_some() {
            return Err(EngineError::PairAlreadyExists(new.symbol));
        }

        let mut listed = 0;
        for (exchange, gw) in self.ctx.executor.gateways() {
            match gw.is_tradable(&new.symbol).await {
                Ok(true) => listed += 1,
                Ok(false) => {}
                Err(e) => debug!(%exchange, error = %e, "Tradability check failed"),
            }
        }
        if listed < 2 {
            return Err(EngineError::SymbolNotAvailable(new.symbol));
        }

        let symbol = new.symbol.clone();
        let config = self
            .ctx
            .journal
            .insert_pair(new)
            .await
            .map_err(|e| match e {
                StoreError::Duplicate(_) => EngineError::PairAlreadyExists(symbol.clone()),
                other => EngineError::Store(other),
            })?;
        info!(pair_id = config.id, %symbol, params = ?config.params, "Pair created");
        self.spawn_pair(config.clone()).await;
        Ok(config)
    }

    pub async fn get_all_pairs(&self) -> Result<Vec<PairConfig>, EngineError> {
        Ok(self.ctx.journal.store().list_pairs().await?)
    }

    pub async fn get_pair_with_runtime(&self, id: PairId) -> Result<PairSnapshot, EngineError> {
        self.handle(id).await?.snapshot().await
    }

    pub async fn update_pair(
        &self,
        id: PairId,
        patch: ParamsPatch,
    ) -> Result<UpdateOutcome, EngineError> {
        self.handle(id).await?.update(patch).await
    }

    pub async fn delete_pair(&self, id: PairId) -> Result<(), EngineError> {
        self.handle(id).await?.delete().await?;
        self.pairs.write().await.remove(&id);
        Ok(())
    }

    pub async fn start_pair(&self, id: PairId) -> Result<(), EngineError> {
        self.handle(id).await?.start().await
    }

    pub async fn pause_pair(&self, id: PairId, force: bool) -> Result<(), EngineError> {
        self.handle(id).await?.pause(force).await
    }

    /// Flatten a pair stuck in ERROR and return it to READY (`resume`) or
    /// PAUSED.
    pub async fn reconcile_pair(&self, id: PairId, resume: bool) -> Result<(), EngineError> {
        self.handle(id).await?.reconcile(resume).await
    }

    // -----------------------------------------------------------------------
    // Settings and read models
    // -----------------------------------------------------------------------

    pub async fn get_settings(&self) -> Settings {
        self.ctx.journal.settings().read().await.clone()
    }

    pub async fn update_settings(&self, settings: Settings) -> Result<Settings, EngineError> {
        if settings.max_concurrent_trades == Some(0) {
            return Err(EngineError::InvalidSettings(
                "max_concurrent_trades must be at least 1".into(),
            ));
        }
        self.ctx.journal.put_settings(settings.clone()).await?;
        self.ctx
            .admission
            .set_limit(settings.max_concurrent_trades);
        Ok(settings)
    }

    pub async fn get_stats(&self) -> Result<TradeStats, EngineError> {
        Ok(self.ctx.journal.store().trade_stats(Utc::now()).await?)
    }

    pub async fn list_orders(&self, id: PairId) -> Result<Vec<OrderRecord>, EngineError> {
        self.handle(id).await?;
        Ok(self.ctx.journal.store().list_orders(id).await?)
    }

    pub async fn list_notifications(&self, limit: usize) -> Result<Vec<Notification>, EngineError> {
        Ok(self.ctx.journal.store().list_notifications(limit).await?)
    }

    /// Pairs currently holding a trade slot.
    pub fn active_trades(&self) -> usize {
        self.ctx.admission.active()
    }

    pub async fn pair_handle(&self, id: PairId) -> Option<PairHandle> {
        self.pairs.read().await.get(&id).cloned()
    }

    /// Stop every pair actor and market feed. Open positions are left as
    /// they are.
    pub async fn shutdown(&self) {
        let handles: Vec<PairHandle> = self.pairs.write().await.drain().map(|(_, h)| h).collect();
        for handle in handles {
            if let Err(e) = handle.shutdown().await {
                debug!(pair_id = handle.pair_id(), error = %e, "Pair actor already gone");
            }
        }
        for task in self.feed_tasks.lock().await.drain(..) {
            task.abort();
        }
        self.feeds.lock().await.clear();
        info!("Engine stopped");
    }
}
