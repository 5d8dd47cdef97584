use std::sync::Arc;
use tokio::sync::{mpsc, Notify};

use crate::candles::{BarClose, CandleAggregator};
use crate::error::CoreError;
use crate::execution::{MarketFeed, Trader};
use crate::models::{ExchangeEvent, ExecutionFill, OrderUpdate, PositionUpdate};
use crate::notify::Notifier;
use crate::strategy::{Strategy, StrategyContext, StrategyError};

/// Why `Engine::run` returned
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// The venue event stream ended
    StreamClosed,
    /// A strategy raised a fatal error; trading is halted
    Fatal(String),
    /// `ShutdownHandle::shutdown` was called
    Shutdown,
}

/// Stops a running engine from another task
#[derive(Clone)]
pub struct ShutdownHandle {
    notify: Arc<Notify>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.notify.notify_one();
    }
}

/// Feeds closed bars to the strategy
///
/// Errors other than `StrategyError::Fatal` are logged and the loop goes on.
pub struct StrategyRunner {
    strategy: Box<dyn Strategy>,
    invocations: u64,
}

impl StrategyRunner {
    pub fn new(strategy: Box<dyn Strategy>) -> Self {
        Self {
            strategy,
            invocations: 0,
        }
    }

    pub fn name(&self) -> &str {
        self.strategy.name()
    }

    pub fn invocations(&self) -> u64 {
        self.invocations
    }

    pub fn run(&mut self, ctx: &StrategyContext<'_>, closes: Vec<BarClose>) -> Result<(), CoreError> {
        for close in closes {
            self.invocations += 1;
            tracing::debug!(
                "[{}] {} bars, last closed {:?}",
                close.timeframe,
                close.series.len(),
                close.series.last_time()
            );

            match self.strategy.on_bar(ctx, close.timeframe, &close.series) {
                Ok(()) => {}
                Err(StrategyError::Fatal(msg)) => {
                    tracing::error!("Fatal error in {}: {}", self.strategy.name(), msg);
                    return Err(CoreError::FatalStrategy(msg));
                }
                Err(StrategyError::Failed(e)) => {
                    tracing::error!(
                        "Strategy {} failed on {}: {:?}",
                        self.strategy.name(),
                        close.timeframe,
                        e
                    );
                }
            }
        }
        Ok(())
    }
}

/// Single consumer of the venue event stream
///
/// Events are handled one at a time in delivery order. Nothing here awaits
/// the venue: order placement and SLTP maintenance run on spawned tasks.
pub struct Engine {
    trader: Arc<Trader>,
    feed: Arc<MarketFeed>,
    candles: CandleAggregator,
    runner: StrategyRunner,
    notifier: Arc<dyn Notifier>,
    shutdown: Arc<Notify>,
}

impl Engine {
    pub fn new(
        trader: Arc<Trader>,
        feed: Arc<MarketFeed>,
        candles: CandleAggregator,
        strategy: Box<dyn Strategy>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            trader,
            feed,
            candles,
            runner: StrategyRunner::new(strategy),
            notifier,
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            notify: Arc::clone(&self.shutdown),
        }
    }

    pub fn trader(&self) -> &Arc<Trader> {
        &self.trader
    }

    pub fn candles(&self) -> &CandleAggregator {
        &self.candles
    }

    pub fn candles_mut(&mut self) -> &mut CandleAggregator {
        &mut self.candles
    }

    pub fn runner(&self) -> &StrategyRunner {
        &self.runner
    }

    /// Process events until the stream closes, a fatal error, or shutdown
    pub async fn run(&mut self, mut events: mpsc::Receiver<ExchangeEvent>) -> RunOutcome {
        tracing::info!(
            "Engine started: strategy {}, timeframes {:?}",
            self.runner.name(),
            self.candles.timeframes()
        );

        let startup = self.candles.startup_due();
        if let Err(e) = self.run_strategy(startup) {
            return self.halt(e).await;
        }

        let shutdown = Arc::clone(&self.shutdown);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.notified() => {
                    tracing::info!("Shutdown requested");
                    self.trader.chaser().stop_all().await;
                    return RunOutcome::Shutdown;
                }
                event = events.recv() => {
                    let Some(event) = event else {
                        tracing::warn!("Event stream closed");
                        return RunOutcome::StreamClosed;
                    };
                    if let Err(e) = self.dispatch(event) {
                        return self.halt(e).await;
                    }
                }
            }
        }
    }

    /// Apply one venue event; only a fatal strategy error is returned
    pub fn dispatch(&mut self, event: ExchangeEvent) -> Result<(), CoreError> {
        tracing::trace!("Event {}", event.topic());
        match event {
            ExchangeEvent::InstrumentTick(tick) => {
                self.feed.on_tick(&tick);
                self.trader.positions().on_price(tick.last_price);
            }
            ExchangeEvent::BookTicker(book) => self.feed.on_book(&book),
            ExchangeEvent::Wallet(wallet) => {
                tracing::debug!("Wallet {}: {:?}", wallet.coin, wallet.balance);
                self.trader.positions().on_wallet(wallet.balance);
            }
            ExchangeEvent::Position(update) => self.on_position(&update),
            ExchangeEvent::Execution(fill) => self.on_fill(&fill),
            ExchangeEvent::OrderStatus(update) => self.on_order(&update),
            ExchangeEvent::Kline(kline) => {
                let closes = self.candles.ingest(kline.source, kline.bar);
                return self.run_strategy(closes);
            }
        }
        Ok(())
    }

    fn run_strategy(&mut self, closes: Vec<BarClose>) -> Result<(), CoreError> {
        if closes.is_empty() {
            return Ok(());
        }
        let ctx = StrategyContext {
            trader: &self.trader,
            candles: &self.candles,
        };
        self.runner.run(&ctx, closes)
    }

    fn on_position(&self, update: &PositionUpdate) {
        let change = self.trader.positions().on_position(update);
        if change.size_changed() {
            self.notifier.notify(&format!(
                "Updated position: entry {} => {}, size {} => {}, liq {} => {}",
                change.previous.entry_price,
                change.current.entry_price,
                change.previous.size,
                change.current.size,
                change.previous.liquidation_price,
                change.current.liquidation_price
            ));
        }
        self.evaluate_risk();
    }

    fn on_fill(&self, fill: &ExecutionFill) {
        tracing::info!(
            client_id = %fill.client_id,
            "Fill {} {} @ {} (fee {})",
            fill.side,
            fill.qty,
            fill.price,
            fill.fee
        );
        self.notifier.notify(&format!(
            "Fill {} {} {} @ {}",
            fill.client_id, fill.side, fill.qty, fill.price
        ));
        self.evaluate_risk();
    }

    fn on_order(&self, update: &OrderUpdate) {
        if !self.trader.chaser().on_order_event(update) {
            self.trader.tracker().on_order_event(update);
        }
        self.trader.on_order_event(update);
        self.evaluate_risk();
    }

    /// Exit checks inline (they only spawn), SLTP maintenance on its own task
    fn evaluate_risk(&self) {
        if let Some(trigger) = self.trader.evaluate_exit() {
            tracing::info!("Exit triggered: {:?}", trigger);
        }

        let trader = Arc::clone(&self.trader);
        tokio::spawn(async move {
            let actions = trader.evaluate_sltp().await;
            if !actions.is_empty() {
                tracing::debug!("SLTP: {:?}", actions);
            }
        });
    }

    async fn halt(&self, err: CoreError) -> RunOutcome {
        let message = err.to_string();
        self.notifier
            .notify(&format!("Fatal error occurred. Stopping bot. {}", message));
        self.trader.tracker().halt();
        self.trader.chaser().stop_all().await;
        RunOutcome::Fatal(message)
    }
}
