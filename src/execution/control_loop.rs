use anyhow::Context;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use super::candle_buffer::CandleBuffer;
use super::position::ExitReason;
use super::position_manager::{MarketSnapshot, PositionManager};
use super::reconciler::{EntryBlocked, ReconcileMode, StateReconciler};
use crate::config::BotConfig;
use crate::gateway::ExchangeGateway;
use crate::indicators::calculate_atr;
use crate::journal::TradeLog;
use crate::models::{Candle, Signal};
use crate::risk::{CircuitBreakerTrip, CircuitBreakers, FailureKind};
use crate::strategy::SignalSource;

/// Why the loop stopped
#[derive(Debug, Clone, PartialEq)]
pub enum LoopExit {
    Shutdown,
    BreakerTripped(CircuitBreakerTrip),
}

enum Event {
    Candle(Candle),
    Timeout,
    StreamClosed,
    Shutdown,
}

/// Single cooperative scheduler: candle ingestion, reconciliation cadence,
/// signal dispatch and risk ticks all run on this one task
pub struct ControlLoop<G: ExchangeGateway, S: SignalSource> {
    gateway: Arc<G>,
    config: BotConfig,
    signal: S,
    buffer: CandleBuffer,
    manager: PositionManager<G>,
    reconciler: StateReconciler,
    breakers: Arc<CircuitBreakers>,
    last_evaluated: Option<DateTime<Utc>>, // Open time of the last candle given to the signal source
}

impl<G: ExchangeGateway, S: SignalSource> ControlLoop<G, S> {
    pub fn new(gateway: Arc<G>, config: BotConfig, signal: S, journal: TradeLog) -> Self {
        let breakers = Arc::new(CircuitBreakers::new(config.breaker.clone()));
        let manager = PositionManager::new(
            Arc::clone(&gateway),
            &config,
            Arc::clone(&breakers),
            journal,
        );

        Self {
            buffer: CandleBuffer::new(config.control.max_candles),
            reconciler: StateReconciler::new(&config),
            gateway,
            config,
            signal,
            manager,
            breakers,
            last_evaluated: None,
        }
    }

    pub fn manager(&self) -> &PositionManager<G> {
        &self.manager
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakers> {
        &self.breakers
    }

    pub fn buffer(&self) -> &CandleBuffer {
        &self.buffer
    }

    /// Load history and adopt whatever the exchange already holds
    pub async fn bootstrap(&mut self) -> anyhow::Result<()> {
        let history = self
            .gateway
            .fetch_candles(
                &self.config.symbol,
                self.config.timeframe,
                self.config.control.history_candles,
            )
            .await
            .context("fetching candle history")?;
        let loaded = history.len();
        self.buffer.replace_all(history).map_err(anyhow::Error::msg)?;

        // History is already acted on (or not); only fresh closes produce signals
        self.last_evaluated = self.closed_candles()?.last().map(|c| c.timestamp);

        tracing::info!(
            "📊 Loaded {} {} candles for {} (signal: {})",
            loaded,
            self.config.timeframe,
            self.config.symbol,
            self.signal.name()
        );

        let report = self
            .reconciler
            .reconcile(&mut self.manager, ReconcileMode::Periodic)
            .await
            .context("startup reconciliation")?;
        if let Some(position) = report.exchange_position {
            tracing::warn!(
                "Exchange already holds {} {:.4} @ {:.2}",
                position.side,
                position.quantity,
                position.entry_price
            );
        }
        Ok(())
    }

    /// Run until shutdown is signalled or the circuit breaker trips
    ///
    /// Either way the loop ends with a best-effort close, cancel-all and
    /// disconnect.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<LoopExit> {
        self.bootstrap().await?;
        let mut stream = self.subscribe().await;

        let exit = loop {
            if *shutdown.borrow() {
                break LoopExit::Shutdown;
            }
            if let Some(trip) = self.breakers.trip() {
                break LoopExit::BreakerTripped(trip);
            }

            match self.next_event(&mut stream, &mut shutdown).await {
                Event::Shutdown => break LoopExit::Shutdown,
                Event::Candle(candle) => {
                    self.breakers.record_success(FailureKind::Network);
                    self.ingest(candle);
                }
                Event::Timeout => {
                    tracing::warn!(
                        "⏱️  No candle update for {}s, polling instead",
                        self.config.control.candle_timeout_secs
                    );
                    self.breakers.record_failure(FailureKind::Network);
                    self.poll_fallback().await;
                }
                Event::StreamClosed => {
                    tracing::warn!("Candle stream closed, resubscribing");
                    self.breakers.record_failure(FailureKind::Network);
                    stream = self.subscribe().await;
                    self.poll_fallback().await;
                }
            }

            if let Err(e) = self.step().await {
                tracing::error!("Loop step failed: {:#}", e);
            }
        };

        self.wind_down(&exit).await;
        Ok(exit)
    }

    async fn subscribe(&self) -> Option<mpsc::Receiver<Candle>> {
        match self
            .gateway
            .stream_candles(&self.config.symbol, self.config.timeframe)
            .await
        {
            Ok(rx) => Some(rx),
            Err(e) => {
                tracing::warn!("Candle subscription failed: {}", e);
                None
            }
        }
    }

    async fn next_event(
        &self,
        stream: &mut Option<mpsc::Receiver<Candle>>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Event {
        let timeout = Duration::from_secs(self.config.control.candle_timeout_secs);
        let recv = async {
            match stream.as_mut() {
                Some(rx) => match tokio::time::timeout(timeout, rx.recv()).await {
                    Ok(Some(candle)) => Event::Candle(candle),
                    Ok(None) => Event::StreamClosed,
                    Err(_) => Event::Timeout,
                },
                None => {
                    tokio::time::sleep(timeout).await;
                    Event::StreamClosed
                }
            }
        };

        tokio::select! {
            // A dropped sender counts as shutdown too
            _ = shutdown.changed() => Event::Shutdown,
            event = recv => event,
        }
    }

    fn ingest(&mut self, candle: Candle) {
        if let Err(e) = self.buffer.upsert(candle) {
            tracing::error!("Candle buffer write failed: {}", e);
        }
    }

    /// One-shot fetch when the stream is silent
    async fn poll_fallback(&mut self) {
        match self
            .gateway
            .fetch_candles(&self.config.symbol, self.config.timeframe, 2)
            .await
        {
            Ok(candles) => {
                for candle in candles {
                    self.ingest(candle);
                }
            }
            Err(e) => tracing::warn!("Fallback candle poll failed: {}", e),
        }
    }

    fn closed_candles(&self) -> anyhow::Result<Vec<Candle>> {
        self.buffer
            .closed_candles(
                Utc::now(),
                self.config.timeframe,
                self.config.control.candle_close_threshold,
            )
            .map_err(anyhow::Error::msg)
    }

    /// Reconcile if due, run the risk tick, then act on a freshly closed candle
    async fn step(&mut self) -> anyhow::Result<()> {
        if self.reconciler.is_due(Instant::now()) {
            if let Err(e) = self
                .reconciler
                .reconcile(&mut self.manager, ReconcileMode::Periodic)
                .await
            {
                tracing::warn!("Reconciliation failed: {}", e);
                if e.is_retryable() {
                    self.breakers.record_failure(FailureKind::Network);
                }
            }
        }
        if self.breakers.is_tripped() {
            return Ok(());
        }

        let Some(tail) = self.buffer.last().map_err(anyhow::Error::msg)? else {
            return Ok(());
        };
        let price = tail.close;
        let closed = self.closed_candles()?;

        if self.manager.has_open_position() {
            match MarketSnapshot::from_candles(price, &closed, self.manager.risk_config()) {
                Some(snapshot) => {
                    let report = self.manager.on_tick(&snapshot).await?;
                    if let Some(record) = report.closed {
                        tracing::info!("Position closed on tick: {}", record.reason);
                    }
                }
                None => {
                    tracing::warn!(
                        "Not enough closed candles for ATR ({} buffered), protection only",
                        self.buffer.candle_count().map_err(anyhow::Error::msg)?
                    );
                    if let Some(record) = self.manager.ensure_protected(price).await? {
                        tracing::info!("Position closed on tick: {}", record.reason);
                    }
                }
            }
        }

        let Some(latest) = closed.last() else {
            return Ok(());
        };
        if self.last_evaluated.is_some_and(|t| t >= latest.timestamp) {
            return Ok(());
        }
        self.last_evaluated = Some(latest.timestamp);

        let required = self
            .config
            .control
            .min_candles
            .max(self.signal.min_candles_required());
        if closed.len() < required {
            tracing::debug!("Waiting for history: {}/{} closed candles", closed.len(), required);
            return Ok(());
        }

        let signal = self.signal.detect(&closed);
        self.dispatch(signal, latest.close, &closed).await
    }

    async fn dispatch(&mut self, signal: Signal, price: f64, closed: &[Candle]) -> anyhow::Result<()> {
        let Some(side) = signal.entry_side() else {
            return Ok(());
        };
        tracing::info!("📡 {:?} signal from {} at {:.2}", signal, self.signal.name(), price);

        if let Some(position) = self.manager.position() {
            if position.side == side {
                tracing::debug!("Already {}, signal ignored", side);
                return Ok(());
            }
            self.manager
                .close_position(price, ExitReason::SignalReversal)
                .await
                .context("closing on signal reversal")?;
        }

        let Some(atr) = calculate_atr(closed, self.manager.risk_config().atr_period) else {
            tracing::warn!("No ATR available, entry skipped");
            return Ok(());
        };

        let clearance = match self.reconciler.clear_for_entry(&mut self.manager).await {
            Ok(clearance) => clearance,
            Err(e) => {
                tracing::warn!("⛔ Entry blocked: {}", e);
                if matches!(&e, EntryBlocked::Gateway(g) if g.is_retryable()) {
                    self.breakers.record_failure(FailureKind::Network);
                }
                return Ok(());
            }
        };

        match self.manager.open_position(clearance, side, price, atr).await {
            Ok(outcome) if !outcome.protected => {
                tracing::error!("🚨 Entered {} without a verified stop", side);
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("❌ Entry failed: {}", e),
        }
        Ok(())
    }

    /// Best-effort flatten, cancel-all and disconnect; nothing here may fail
    async fn wind_down(&mut self, exit: &LoopExit) {
        let reason = match exit {
            LoopExit::Shutdown => {
                tracing::info!("🛑 Shutting down");
                ExitReason::Shutdown
            }
            LoopExit::BreakerTripped(trip) => {
                tracing::error!("🚨 CIRCUIT BREAKER TRIPPED: {} - halting", trip);
                ExitReason::CircuitBreaker
            }
        };

        let price = match self.buffer.last() {
            Ok(Some(candle)) => candle.close,
            _ => self
                .manager
                .position()
                .map(|p| p.entry_price)
                .unwrap_or_default(),
        };

        self.manager
            .emergency_flatten(price, reason, self.config.verify.emergency_cancel_attempts)
            .await;
        self.gateway.disconnect().await;

        tracing::info!("💰 Realized PnL this session: {:+.2} USDT", self.manager.total_pnl());
    }
}
