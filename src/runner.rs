//! Engine runner: builds the paper exchanges, the in-memory store and the
//! engine from `AppConfig`, seeds configured pairs, then drives synthetic
//! prices until Ctrl-C.

use std::sync::Arc;

use exchanges::{MockExchange, PaperPriceDriver};
use spreadarb_core::config::types::{AppConfig, PairSeed};
use spreadarb_core::notify::StoreSink;
use spreadarb_core::store::{MemoryStore, NewPair, PersistencePort};
use strategies::EngineManager;
use strategies::arbitrage::errors::EngineError;
use strategies::arbitrage::execution::GatewayMap;
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("need at least two exchanges, {0} configured")]
    TooFewExchanges(usize),

    #[error("engine failed to start: {0}")]
    Engine(#[from] EngineError),

    #[error("signal handler failed: {0}")]
    Signal(#[from] std::io::Error),
}

pub struct EngineRunner {
    config: AppConfig,
}

impl EngineRunner {
    pub fn new(config: AppConfig) -> Self {
        Self { config }
    }

    /// Run until Ctrl-C. Open positions are left as they are on exit.
    pub async fn run(self) -> Result<(), RunnerError> {
        let config = self.config;
        info!(mode = ?config.execution_mode, exchanges = config.exchanges.len(), "Starting engine runner");
        if config.exchanges.len() < 2 {
            return Err(RunnerError::TooFewExchanges(config.exchanges.len()));
        }

        let mut gateways: GatewayMap = GatewayMap::new();
        let mut venues = Vec::new();
        for setting in &config.exchanges {
            let mock = Arc::new(MockExchange::with_symbols(
                setting.name,
                setting.symbols.iter().cloned(),
            ));
            mock.set_quote_balance(setting.quote_balance).await;
            info!(exchange = %setting.name, symbols = ?setting.symbols, balance = %setting.quote_balance, "Paper exchange ready");
            gateways.insert(setting.name, mock.clone());
            venues.push(mock);
        }

        let store = Arc::new(MemoryStore::with_settings(config.settings.clone()));
        let sink = Arc::new(StoreSink::new(store.clone()));
        let manager = EngineManager::start(
            config.engine.clone(),
            config.persistence.retry_policy(),
            gateways,
            store.clone(),
            sink,
        )
        .await?;

        for seed in &config.pairs {
            seed_pair(&manager, store.as_ref(), seed).await;
        }

        let driver = PaperPriceDriver::new(venues, config.tracked_symbols(), config.paper.clone());
        let driver_task = tokio::spawn(driver.run());

        info!("Engine running, press Ctrl-C to stop");
        let signal = tokio::signal::ctrl_c().await;

        driver_task.abort();
        manager.shutdown().await;
        signal?;
        info!("Engine runner stopped");
        Ok(())
    }
}

/// Create `seed` unless its symbol already has a pair, and start it when asked.
async fn seed_pair(manager: &EngineManager, store: &MemoryStore, seed: &PairSeed) {
    match store.find_pair_by_symbol(&seed.symbol).await {
        Ok(Some(existing)) => {
            info!(pair_id = existing.id, symbol = %seed.symbol, "Seed pair already exists");
            return;
        }
        Ok(None) => {}
        Err(e) => {
            error!(symbol = %seed.symbol, error = %e, "Seed lookup failed");
            return;
        }
    }

    let new = NewPair {
        symbol: seed.symbol.clone(),
        base: seed.base.clone(),
        quote: seed.quote.clone(),
        params: seed.params.clone(),
    };
    let config = match manager.create_pair(new).await {
        Ok(config) => config,
        Err(e) => {
            warn!(symbol = %seed.symbol, code = e.code(), field = e.field(), error = %e, "Seed pair rejected");
            return;
        }
    };
    if seed.start
        && let Err(e) = manager.start_pair(config.id).await
    {
        warn!(pair_id = config.id, code = e.code(), error = %e, "Seed pair not started");
    }
}
