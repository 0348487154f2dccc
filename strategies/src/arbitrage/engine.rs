use std::ops::ControlFlow;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::json;
use spreadarb_core::config::types::EngineConfig;
use spreadarb_core::notify::{Notification, NotificationKind, Severity};
use spreadarb_core::store::{
    CloseReason, LiquidationEvent, OrderPurpose, PairActivity, PairConfig, PairId, StopLossEvent,
    TradeRecord,
};
use spreadarb_core::types::{Exchange, MarketEvent, OrderRequest, PositionSide};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::arbitrage::admission::AdmissionController;
use crate::arbitrage::errors::EngineError;
use crate::arbitrage::execution::{CloseOutcome, LegExecutor};
use crate::arbitrage::journal::Journal;
use crate::arbitrage::margin::gather_exposures;
use crate::arbitrage::oracle::SpreadOracle;
use crate::arbitrage::params::{ParamsPatch, validate_params};
use crate::arbitrage::policy::{Decision, DecisionPolicy, ExitReason, MarginPolicy};
use crate::arbitrage::recovery::{EntryOutcome, classify_entry, unwind_fills};
use crate::arbitrage::types::{
    Leg, PairRuntime, PairSnapshot, PairStatus, PendingConfig, UpdateOutcome,
};

/// Collaborators shared by every pair actor.
pub struct EngineContext {
    pub executor: LegExecutor,
    pub admission: Arc<AdmissionController>,
    pub journal: Journal,
    pub margin: Box<dyn MarginPolicy>,
    pub engine_cfg: EngineConfig,
}

type Reply<T> = oneshot::Sender<Result<T, EngineError>>;

#[derive(Debug)]
pub enum PairCommand {
    Start { reply_to: Reply<()> },
    Pause { force: bool, reply_to: Reply<()> },
    Update { patch: ParamsPatch, reply_to: Reply<UpdateOutcome> },
    Reconcile { resume: bool, reply_to: Reply<()> },
    Snapshot { reply_to: oneshot::Sender<PairSnapshot> },
    /// Stop the actor. With `delete`, the pair must be paused and is removed
    /// from the store first.
    Shutdown { delete: bool, reply_to: Reply<()> },
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Cheap, cloneable front door to one pair actor.
#[derive(Clone)]
pub struct PairHandle {
    pair_id: PairId,
    tx: mpsc::Sender<PairCommand>,
    entry_cancel: Arc<Mutex<CancellationToken>>,
    status_rx: watch::Receiver<PairStatus>,
}

impl PairHandle {
    pub fn pair_id(&self) -> PairId {
        self.pair_id
    }

    pub fn status(&self) -> PairStatus {
        *self.status_rx.borrow()
    }

    pub fn status_watch(&self) -> watch::Receiver<PairStatus> {
        self.status_rx.clone()
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> PairCommand,
    ) -> Result<T, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(make(tx))
            .await
            .map_err(|_| EngineError::EngineUnavailable)?;
        rx.await.map_err(|_| EngineError::EngineUnavailable)
    }

    pub async fn start(&self) -> Result<(), EngineError> {
        self.request(|reply_to| PairCommand::Start { reply_to }).await?
    }

    /// With `force`, an entry in flight is cancelled before the command is
    /// even queued.
    pub async fn pause(&self, force: bool) -> Result<(), EngineError> {
        if force {
            self.cancel_entry();
        }
        self.request(|reply_to| PairCommand::Pause { force, reply_to })
            .await?
    }

    pub async fn update(&self, patch: ParamsPatch) -> Result<UpdateOutcome, EngineError> {
        self.request(|reply_to| PairCommand::Update { patch, reply_to })
            .await?
    }

    pub async fn reconcile(&self, resume: bool) -> Result<(), EngineError> {
        self.request(|reply_to| PairCommand::Reconcile { resume, reply_to })
            .await?
    }

    pub async fn snapshot(&self) -> Result<PairSnapshot, EngineError> {
        self.request(|reply_to| PairCommand::Snapshot { reply_to })
            .await
    }

    pub async fn delete(&self) -> Result<(), EngineError> {
        self.request(|reply_to| PairCommand::Shutdown {
            delete: true,
            reply_to,
        })
        .await?
    }

    pub async fn shutdown(&self) -> Result<(), EngineError> {
        self.request(|reply_to| PairCommand::Shutdown {
            delete: false,
            reply_to,
        })
        .await?
    }

    fn cancel_entry(&self) {
        let token = self
            .entry_cancel
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        token.cancel();
    }
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

/// Lifecycle state machine of one pair.
///
/// Owns its config, runtime and pending config exclusively. Commands and
/// market events are processed one at a time from the same task, so no
/// transition ever overlaps another. Events arriving while orders are in
/// flight wait in the feed until the step resolves.
pub struct PairEngine<D: DecisionPolicy> {
    config: PairConfig,
    runtime: PairRuntime,
    pending: Option<PendingConfig>,
    oracle: SpreadOracle,
    decider: D,
    ctx: Arc<EngineContext>,
    entry_cancel: Arc<Mutex<CancellationToken>>,
    status_tx: watch::Sender<PairStatus>,
    /// MARGIN is reported once per flat period.
    margin_warned: bool,
}

impl<D: DecisionPolicy + 'static> PairEngine<D> {
    pub fn new(config: PairConfig, decider: D, ctx: Arc<EngineContext>) -> Self {
        let (status_tx, _) = watch::channel(PairStatus::Paused);
        Self {
            runtime: PairRuntime::new(config.id),
            config,
            pending: None,
            oracle: SpreadOracle::new(),
            decider,
            ctx,
            entry_cancel: Arc::new(Mutex::new(CancellationToken::new())),
            status_tx,
            margin_warned: false,
        }
    }

    /// Move the actor onto its own task.
    pub fn spawn(self, market: broadcast::Receiver<MarketEvent>) -> PairHandle {
        let (tx, rx) = mpsc::channel(self.ctx.engine_cfg.mailbox_capacity.max(1));
        let handle = PairHandle {
            pair_id: self.config.id,
            tx,
            entry_cancel: self.entry_cancel.clone(),
            status_rx: self.status_tx.subscribe(),
        };
        tokio::spawn(self.run(rx, market));
        handle
    }

    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<PairCommand>,
        mut market: broadcast::Receiver<MarketEvent>,
    ) {
        info!(pair_id = self.config.id, symbol = %self.config.symbol, "Pair actor started");
        let mut market_open = true;
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(c) => {
                            if self.handle_command(c).await.is_break() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                event = market.recv(), if market_open => {
                    match event {
                        Ok(e) => self.handle_market(e).await,
                        Err(RecvError::Lagged(n)) => {
                            debug!(pair_id = self.config.id, skipped = n, "Market feed lagged");
                        }
                        Err(RecvError::Closed) => {
                            warn!(pair_id = self.config.id, "Market feed closed");
                            market_open = false;
                        }
                    }
                }
            }
        }
        info!(pair_id = self.config.id, status = %self.runtime.status, "Pair actor stopped");
    }

    fn set_status(&mut self, status: PairStatus) {
        if self.runtime.status != status {
            info!(
                pair_id = self.config.id,
                symbol = %self.config.symbol,
                from = %self.runtime.status,
                to = %status,
                "Pair transition"
            );
        }
        self.runtime.set_status(status);
        self.status_tx.send_replace(status);
    }

    async fn notify(&self, kind: NotificationKind, severity: Severity, message: String, meta: serde_json::Value) {
        let n = Notification::new(kind, severity, message)
            .for_pair(self.config.id)
            .with_metadata(meta);
        self.ctx.journal.notify(n).await;
    }

    async fn save_config(&mut self) {
        self.config.updated_at = Utc::now();
        if let Err(e) = self.ctx.journal.save_pair(&self.config).await {
            error!(pair_id = self.config.id, error = %e, "Pair config not persisted");
        }
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    async fn handle_command(&mut self, cmd: PairCommand) -> ControlFlow<()> {
        debug!(pair_id = self.config.id, command = ?cmd, status = %self.runtime.status, "Pair command");
        match cmd {
            PairCommand::Start { reply_to } => {
                let res = self.start().await;
                let started = res.is_ok();
                let _ = reply_to.send(res);
                if started {
                    self.evaluate().await;
                }
            }
            PairCommand::Pause { force, reply_to } => {
                let res = self.pause(force).await;
                let _ = reply_to.send(res);
            }
            PairCommand::Update { patch, reply_to } => {
                let res = self.update(patch).await;
                let _ = reply_to.send(res);
            }
            PairCommand::Reconcile { resume, reply_to } => {
                let res = self.reconcile(resume).await;
                let resumed = res.is_ok() && self.runtime.status == PairStatus::Ready;
                let _ = reply_to.send(res);
                if resumed {
                    self.evaluate().await;
                }
            }
            PairCommand::Snapshot { reply_to } => {
                let _ = reply_to.send(self.snapshot());
            }
            PairCommand::Shutdown { delete, reply_to } => {
                if !delete {
                    let _ = reply_to.send(Ok(()));
                    return ControlFlow::Break(());
                }
                if self.runtime.status != PairStatus::Paused {
                    let _ = reply_to.send(Err(EngineError::PairNotPaused(self.config.id)));
                    return ControlFlow::Continue(());
                }
                match self.ctx.journal.delete_pair(self.config.id).await {
                    Ok(_) => {
                        info!(pair_id = self.config.id, symbol = %self.config.symbol, "Pair deleted");
                        let _ = reply_to.send(Ok(()));
                        return ControlFlow::Break(());
                    }
                    Err(e) => {
                        let _ = reply_to.send(Err(e.into()));
                    }
                }
            }
        }
        ControlFlow::Continue(())
    }

    fn snapshot(&self) -> PairSnapshot {
        PairSnapshot {
            config: self.config.clone(),
            runtime: (self.runtime.status != PairStatus::Paused).then(|| self.runtime.clone()),
            pending: self.pending.clone(),
        }
    }

    async fn start(&mut self) -> Result<(), EngineError> {
        let id = self.config.id;
        match self.runtime.status {
            PairStatus::Paused => {}
            PairStatus::Error => return Err(EngineError::PairInError(id)),
            _ => return Err(EngineError::PairAlreadyActive(id)),
        }

        let symbol = self.config.symbol.clone();
        let mut connected = Vec::new();
        for (exchange, gw) in self.ctx.executor.gateways() {
            match gw.health_check().await {
                Ok(()) => connected.push(*exchange),
                Err(e) => warn!(pair_id = id, %exchange, error = %e, "Exchange unhealthy"),
            }
        }
        if connected.len() < 2 {
            return Err(EngineError::NotEnoughExchanges {
                connected: connected.len(),
            });
        }

        let mut venues = Vec::new();
        for exchange in connected {
            let Some(gw) = self.ctx.executor.gateway(exchange) else {
                continue;
            };
            if matches!(gw.is_tradable(&symbol).await, Ok(true)) {
                venues.push(exchange);
            }
        }
        if venues.len() < 2 {
            return Err(EngineError::SymbolNotAvailable(symbol));
        }
        venues.sort();

        self.oracle.set_venues(venues.clone());
        for &exchange in &venues {
            if let Some(gw) = self.ctx.executor.gateway(exchange)
                && let Ok(tick) = gw.get_price(&symbol).await
            {
                self.oracle.update(tick);
            }
        }

        self.runtime.reset();
        self.set_status(PairStatus::Ready);
        self.runtime.mark_to_market(&self.oracle);
        self.config.status = PairActivity::Active;
        self.save_config().await;
        info!(pair_id = id, %symbol, venues = ?venues, "Pair started");
        Ok(())
    }

    async fn pause(&mut self, force: bool) -> Result<(), EngineError> {
        let id = self.config.id;
        match self.runtime.status {
            PairStatus::Paused => return Err(EngineError::PairAlreadyPaused(id)),
            PairStatus::Error => return Err(EngineError::PairInError(id)),
            PairStatus::Ready => self.finish_flat(PairStatus::Paused).await,
            _ if !force => return Err(EngineError::PairHasOpenPosition(id)),
            _ => {
                let spread = self.runtime.current_spread;
                self.exit_position(CloseReason::ForcePause, spread, PairStatus::Paused)
                    .await?;
            }
        }
        self.notify(
            NotificationKind::Pause,
            Severity::Info,
            format!("{} paused", self.config.symbol),
            json!({ "force": force }),
        )
        .await;
        Ok(())
    }

    async fn update(&mut self, patch: ParamsPatch) -> Result<UpdateOutcome, EngineError> {
        let params = patch.apply_to(&self.config.params);
        validate_params(&params)?;

        if self.runtime.status.is_flat() {
            let previous = std::mem::replace(&mut self.config.params, params);
            self.config.updated_at = Utc::now();
            if let Err(e) = self.ctx.journal.save_pair(&self.config).await {
                self.config.params = previous;
                return Err(e.into());
            }
            info!(pair_id = self.config.id, params = ?self.config.params, "Parameters applied");
            return Ok(UpdateOutcome {
                config: self.config.clone(),
                applied_now: true,
                pending: None,
            });
        }

        // Last write wins: a newer update replaces any queued one.
        let pending = PendingConfig {
            params,
            queued_at: Utc::now(),
        };
        info!(pair_id = self.config.id, status = %self.runtime.status, params = ?pending.params, "Parameters queued until flat");
        self.pending = Some(pending.clone());
        Ok(UpdateOutcome {
            config: self.config.clone(),
            applied_now: false,
            pending: Some(pending),
        })
    }

    async fn reconcile(&mut self, resume: bool) -> Result<(), EngineError> {
        if self.runtime.status != PairStatus::Error {
            return Err(EngineError::PairNotInError(self.config.id));
        }
        let target = if resume {
            PairStatus::Ready
        } else {
            PairStatus::Paused
        };
        info!(pair_id = self.config.id, resume, legs = ?self.runtime.legs, "Reconciling pair");
        if self.runtime.has_open_legs() {
            self.exit_position(CloseReason::Reconcile, self.runtime.current_spread, target)
                .await
        } else {
            self.finish_flat(target).await;
            Ok(())
        }
    }

    // -----------------------------------------------------------------------
    // Market events
    // -----------------------------------------------------------------------

    async fn handle_market(&mut self, event: MarketEvent) {
        if event.symbol() != self.config.symbol {
            return;
        }
        match event {
            MarketEvent::Price(tick) => {
                if !self.oracle.update(tick) || self.runtime.status == PairStatus::Paused {
                    return;
                }
                self.runtime.mark_to_market(&self.oracle);
                self.evaluate().await;
            }
            MarketEvent::Liquidation {
                exchange,
                side,
                timestamp,
                ..
            } => self.handle_liquidation(exchange, side, timestamp).await,
        }
    }

    async fn evaluate(&mut self) {
        if !matches!(self.runtime.status, PairStatus::Ready | PairStatus::Holding) {
            return;
        }
        match self
            .decider
            .evaluate(&self.runtime, &self.config.params, &self.oracle)
        {
            Decision::Wait => {}
            Decision::Enter {
                part_index,
                long,
                short,
                spread,
            } => self.enter_part(part_index, long, short, spread).await,
            Decision::Exit { reason, spread } => {
                let reason = match reason {
                    ExitReason::Spread => CloseReason::SpreadExit,
                    ExitReason::StopLoss => CloseReason::StopLoss,
                };
                // Failures already moved the pair to ERROR.
                let _ = self.exit_position(reason, spread, PairStatus::Ready).await;
            }
        }
    }

    async fn handle_liquidation(
        &mut self,
        exchange: Exchange,
        side: PositionSide,
        timestamp: chrono::DateTime<Utc>,
    ) {
        let Some(leg) = self
            .runtime
            .legs
            .iter_mut()
            .find(|l| l.exchange == exchange && l.side == side && l.quantity > Decimal::ZERO)
        else {
            debug!(pair_id = self.config.id, %exchange, %side, "Liquidation for a leg we do not hold");
            return;
        };
        let lost = leg.quantity;
        // The leg stays in place with zero size so the venues of the
        // position remain known for reconciliation.
        leg.quantity = Decimal::ZERO;
        self.runtime.mark_to_market(&self.oracle);
        error!(pair_id = self.config.id, %exchange, %side, quantity = %lost, "Leg liquidated");

        let event = LiquidationEvent {
            pair_id: self.config.id,
            symbol: self.config.symbol.clone(),
            exchange,
            side,
            timestamp,
        };
        let _ = self.ctx.journal.record_liquidation(&event).await;
        self.set_status(PairStatus::Error);
        self.notify(
            NotificationKind::Liquidation,
            Severity::Error,
            format!("{} {side} leg on {exchange} was liquidated", self.config.symbol),
            json!({ "exchange": exchange, "side": side, "quantity": lost }),
        )
        .await;
    }

    // -----------------------------------------------------------------------
    // Entry
    // -----------------------------------------------------------------------

    fn fresh_entry_token(&self) -> CancellationToken {
        let mut slot = self
            .entry_cancel
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = CancellationToken::new();
        slot.clone()
    }

    async fn enter_part(&mut self, part_index: u32, long: Exchange, short: Exchange, spread: Decimal) {
        let id = self.config.id;
        let prev = self.runtime.status;
        let opening = prev.is_flat();

        if opening && !self.ctx.admission.try_admit(id) {
            debug!(pair_id = id, "Concurrent trade limit reached, entry skipped");
            return;
        }

        let qty = self.config.params.part_volume();
        let (Some(long_px), Some(short_px)) = (
            self.oracle.open_price(long, PositionSide::Long),
            self.oracle.open_price(short, PositionSide::Short),
        ) else {
            if opening {
                self.ctx.admission.release(id);
            }
            return;
        };

        let exposures = gather_exposures(
            self.ctx.executor.gateways(),
            &self.config.quote,
            &[(long, qty * long_px), (short, qty * short_px)],
        )
        .await;
        if let Err(violation) = self.ctx.margin.check(id, &exposures) {
            if opening {
                self.ctx.admission.release(id);
            }
            if !self.margin_warned {
                self.margin_warned = true;
                self.notify(
                    NotificationKind::Margin,
                    Severity::Warn,
                    format!("{} entry skipped: {violation}", self.config.symbol),
                    json!({ "part_index": part_index, "violation": violation.to_string() }),
                )
                .await;
            }
            return;
        }

        let token = self.fresh_entry_token();
        self.set_status(PairStatus::Entering);

        let symbol = self.config.symbol.clone();
        let tag = format!("pair-{id}-p{part_index}");
        let long_req = OrderRequest::market(
            long,
            &symbol,
            PositionSide::Long.open_side(),
            qty,
            false,
            format!("{tag}-long"),
        );
        let short_req = OrderRequest::market(
            short,
            &symbol,
            PositionSide::Short.open_side(),
            qty,
            false,
            format!("{tag}-short"),
        );
        info!(pair_id = id, %symbol, part_index, %long, %short, %spread, %qty, "Entering part");

        let (long_fill, short_fill) = self
            .ctx
            .executor
            .open_pair(long_req, short_req, &token)
            .await;
        let _ = self
            .ctx
            .journal
            .record_fills(id, part_index, OrderPurpose::Entry, [&long_fill, &short_fill])
            .await;

        match classify_entry(&long_fill, &short_fill) {
            EntryOutcome::Filled => {
                if self.runtime.confirm_part(
                    part_index,
                    self.config.params.n_orders,
                    &long_fill,
                    &short_fill,
                    spread,
                ) {
                    self.runtime.mark_to_market(&self.oracle);
                    self.set_status(PairStatus::Holding);
                    self.notify(
                        NotificationKind::Open,
                        Severity::Info,
                        format!(
                            "{symbol} part {}/{} opened: long {long} short {short} at {spread}%",
                            part_index + 1,
                            self.config.params.n_orders
                        ),
                        json!({
                            "part_index": part_index,
                            "long_exchange": long,
                            "short_exchange": short,
                            "quantity": qty,
                            "long_price": long_fill.avg_price,
                            "short_price": short_fill.avg_price,
                            "spread": spread,
                        }),
                    )
                    .await;
                } else {
                    warn!(pair_id = id, part_index, filled_parts = self.runtime.filled_parts, "Duplicate part confirmation ignored");
                    self.set_status(if self.runtime.has_open_legs() {
                        PairStatus::Holding
                    } else {
                        prev
                    });
                }
            }
            EntryOutcome::NothingFilled => {
                self.restore_after_entry(prev).await;
                if token.is_cancelled() {
                    info!(pair_id = id, part_index, "Entry cancelled before any fill");
                } else {
                    self.notify(
                        NotificationKind::Error,
                        Severity::Warn,
                        format!("{symbol} part {part_index} not filled"),
                        json!({
                            "part_index": part_index,
                            "long_error": long_fill.error,
                            "short_error": short_fill.error,
                        }),
                    )
                    .await;
                }
            }
            EntryOutcome::Broken => {
                warn!(
                    pair_id = id,
                    part_index,
                    long_filled = %long_fill.filled,
                    short_filled = %short_fill.filled,
                    "Second leg failed, unwinding"
                );
                let report = unwind_fills(
                    &self.ctx.executor,
                    &symbol,
                    [&long_fill, &short_fill],
                    self.ctx.engine_cfg.max_close_attempts,
                    &format!("{tag}-unwind"),
                )
                .await;
                let _ = self
                    .ctx
                    .journal
                    .record_fills(id, part_index, OrderPurpose::Unwind, report.orders())
                    .await;
                self.config.total_pnl += report.realized_pnl;

                let meta = json!({
                    "part_index": part_index,
                    "long_exchange": long,
                    "short_exchange": short,
                    "long_filled": long_fill.filled,
                    "short_filled": short_fill.filled,
                    "long_error": long_fill.error,
                    "short_error": short_fill.error,
                    "unwind_pnl": report.realized_pnl,
                    "unwound": report.is_flat(),
                });
                if report.is_flat() {
                    self.restore_after_entry(prev).await;
                    self.save_config().await;
                    self.notify(
                        NotificationKind::SecondLegFail,
                        Severity::Error,
                        format!("{symbol} part {part_index}: second leg failed, filled leg unwound"),
                        meta,
                    )
                    .await;
                } else {
                    for stranded in &report.stranded {
                        self.runtime.absorb(
                            stranded.exchange,
                            stranded.side,
                            stranded.quantity,
                            stranded.entry_price,
                        );
                    }
                    for (exchange, side) in [(long, PositionSide::Long), (short, PositionSide::Short)] {
                        if self.runtime.leg(side).is_none() {
                            self.runtime
                                .legs
                                .push(Leg::new(exchange, side, Decimal::ZERO, Decimal::ZERO));
                        }
                    }
                    self.runtime.mark_to_market(&self.oracle);
                    self.set_status(PairStatus::Error);
                    self.save_config().await;
                    self.notify(
                        NotificationKind::SecondLegFail,
                        Severity::Error,
                        format!("{symbol} part {part_index}: second leg failed and unwind failed"),
                        meta,
                    )
                    .await;
                }
            }
        }
    }

    /// After an entry that left no new exposure: back to HOLDING if earlier
    /// parts are held, otherwise flat.
    async fn restore_after_entry(&mut self, prev: PairStatus) {
        if self.runtime.has_open_legs() {
            self.set_status(PairStatus::Holding);
        } else {
            self.finish_flat(prev).await;
        }
    }

    // -----------------------------------------------------------------------
    // Exit
    // -----------------------------------------------------------------------

    /// Close every open leg. On success the pair goes flat into `target`;
    /// on failure whatever is left stays in the runtime and the pair goes to
    /// ERROR.
    async fn exit_position(
        &mut self,
        reason: CloseReason,
        spread: Option<Decimal>,
        target: PairStatus,
    ) -> Result<(), EngineError> {
        let id = self.config.id;
        let symbol = self.config.symbol.clone();
        let venues = self.runtime.held_exchanges();
        let quantity = self
            .runtime
            .legs
            .iter()
            .map(|l| l.quantity)
            .max()
            .unwrap_or_default();
        self.set_status(PairStatus::Exiting);

        if reason == CloseReason::StopLoss
            && let Some((long_ex, short_ex)) = venues
        {
            let event = StopLossEvent {
                pair_id: id,
                symbol: symbol.clone(),
                long_exchange: long_ex,
                short_exchange: short_ex,
                unrealized_pnl: self.runtime.unrealized_pnl,
                timestamp: Utc::now(),
            };
            let _ = self.ctx.journal.record_stop_loss(&event).await;
            self.notify(
                NotificationKind::Sl,
                Severity::Warn,
                format!(
                    "{symbol} stop-loss hit at {} (limit {})",
                    self.runtime.unrealized_pnl, self.config.params.stop_loss
                ),
                json!({
                    "long_exchange": long_ex,
                    "short_exchange": short_ex,
                    "unrealized_pnl": self.runtime.unrealized_pnl,
                    "stop_loss": self.config.params.stop_loss,
                }),
            )
            .await;
        }

        let tag = format!("pair-{id}-close-{reason}");
        let attempts = self.ctx.engine_cfg.max_close_attempts;
        let long_leg = self.runtime.leg(PositionSide::Long).cloned();
        let short_leg = self.runtime.leg(PositionSide::Short).cloned();
        let (long_close, short_close) = tokio::join!(
            close_open_leg(&self.ctx.executor, &symbol, long_leg.as_ref(), attempts, &tag),
            close_open_leg(&self.ctx.executor, &symbol, short_leg.as_ref(), attempts, &tag),
        );

        let mut realized = Decimal::ZERO;
        let mut complete = true;
        let mut orders = Vec::new();
        for outcome in [long_close, short_close].into_iter().flatten() {
            if let Some(leg) = self
                .runtime
                .legs
                .iter_mut()
                .find(|l| l.exchange == outcome.exchange && l.side == outcome.side)
            {
                if let Some(px) = outcome.avg_price {
                    realized += leg.pnl_at(outcome.closed, px);
                }
                leg.quantity = (leg.quantity - outcome.closed).max(Decimal::ZERO);
            }
            complete &= outcome.is_complete();
            orders.extend(outcome.orders);
        }
        let _ = self
            .ctx
            .journal
            .record_fills(id, self.runtime.filled_parts, OrderPurpose::Close, &orders)
            .await;
        self.runtime.realized_pnl += realized;

        if !complete {
            self.runtime.mark_to_market(&self.oracle);
            self.set_status(PairStatus::Error);
            let remaining: Vec<_> = self
                .runtime
                .legs
                .iter()
                .filter(|l| l.quantity > Decimal::ZERO)
                .map(|l| json!({ "exchange": l.exchange, "side": l.side, "quantity": l.quantity }))
                .collect();
            self.notify(
                NotificationKind::Error,
                Severity::Error,
                format!("{symbol} close failed after {attempts} attempts"),
                json!({ "reason": reason, "remaining": remaining }),
            )
            .await;
            return Err(EngineError::CloseFailed(format!(
                "{} leg(s) still open",
                remaining.len()
            )));
        }

        let pnl = self.runtime.realized_pnl;
        let exit_spread = spread.or(self.runtime.current_spread).unwrap_or_default();
        if let Some((long_ex, short_ex)) = venues {
            let now = Utc::now();
            let trade = TradeRecord {
                id: Uuid::new_v4(),
                pair_id: id,
                symbol: symbol.clone(),
                long_exchange: long_ex,
                short_exchange: short_ex,
                quantity,
                parts: self.runtime.filled_parts,
                entry_spread_pct: self.runtime.entry_spread.unwrap_or_default(),
                exit_spread_pct: exit_spread,
                realized_pnl: pnl,
                reason,
                opened_at: self.runtime.opened_at.unwrap_or(now),
                closed_at: now,
            };
            let _ = self.ctx.journal.record_trade(&trade).await;
        }
        self.config.trade_count += 1;
        self.config.total_pnl += pnl;

        self.notify(
            NotificationKind::Close,
            Severity::Info,
            format!("{symbol} closed ({reason}), realized {pnl}"),
            json!({
                "reason": reason,
                "realized_pnl": pnl,
                "quantity": quantity,
                "exit_spread": exit_spread,
            }),
        )
        .await;
        self.finish_flat(target).await;
        Ok(())
    }

    /// Single exit point into READY or PAUSED: the slot is released and a
    /// queued config is applied here and nowhere else.
    async fn finish_flat(&mut self, target: PairStatus) {
        let id = self.config.id;
        self.runtime.reset();
        if self.ctx.admission.release(id) {
            debug!(pair_id = id, "Trade slot released");
        }
        self.margin_warned = false;
        if let Some(pending) = self.pending.take() {
            info!(pair_id = id, params = ?pending.params, "Applying queued parameters");
            self.config.params = pending.params;
        }
        self.config.status = if target == PairStatus::Paused {
            PairActivity::Paused
        } else {
            PairActivity::Active
        };
        self.set_status(target);
        self.runtime.mark_to_market(&self.oracle);
        self.save_config().await;
    }
}

async fn close_open_leg(
    executor: &LegExecutor,
    symbol: &str,
    leg: Option<&Leg>,
    attempts: u32,
    tag: &str,
) -> Option<CloseOutcome> {
    let leg = leg.filter(|l| l.quantity > Decimal::ZERO)?;
    Some(
        executor
            .close_leg(
                symbol,
                leg.exchange,
                leg.side,
                leg.quantity,
                attempts,
                &format!("{tag}-{}", leg.side),
            )
            .await,
    )
}
