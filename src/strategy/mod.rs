// Strategy callbacks driven by closed bars
pub mod sma_cross;

pub use sma_cross::SmaCrossStrategy;

use thiserror::Error;

use crate::candles::CandleAggregator;
use crate::error::CoreError;
use crate::execution::Trader;
use crate::models::{BarSeries, Timeframe};

#[derive(Error, Debug)]
pub enum StrategyError {
    /// Unrecoverable: the engine halts trading and stops
    #[error("{0}")]
    Fatal(String),

    /// Logged; the bar loop carries on
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl From<CoreError> for StrategyError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::FatalStrategy(msg) => StrategyError::Fatal(msg),
            other => StrategyError::Failed(other.into()),
        }
    }
}

/// What a strategy can reach while handling a bar
pub struct StrategyContext<'a> {
    pub trader: &'a Trader,
    pub candles: &'a CandleAggregator,
}

/// Base trait for all trading strategies
pub trait Strategy: Send + Sync {
    fn name(&self) -> &str;

    /// Called once per closed bar of `timeframe`
    ///
    /// `bars` holds the closed history up to and including that bar, oldest
    /// first; the still-open bar is never included.
    fn on_bar(
        &mut self,
        ctx: &StrategyContext<'_>,
        timeframe: Timeframe,
        bars: &BarSeries,
    ) -> Result<(), StrategyError>;
}
