use super::{Strategy, StrategyContext, StrategyError};
use crate::execution::OrderAction;
use crate::models::{BarSeries, ChaseSettings, OrderIntent, Side, Timeframe};

/// Simple average of the `period` values ending at `end` (exclusive)
fn sma_at(values: &[f64], period: usize, end: usize) -> Option<f64> {
    if period == 0 || end < period || end > values.len() {
        return None;
    }
    Some(values[end - period..end].iter().sum::<f64>() / period as f64)
}

/// Moving average crossover
///
/// Goes long when the fast average crosses above the slow one and short on
/// the opposite cross, reversing any open position.
#[derive(Debug, Clone)]
pub struct SmaCrossStrategy {
    fast: usize,
    slow: usize,
    qty: f64,
    timeframe: Option<Timeframe>,
    chase: Option<ChaseSettings>,
}

impl SmaCrossStrategy {
    pub fn new(fast: usize, slow: usize, qty: f64) -> Self {
        Self {
            fast,
            slow,
            qty,
            timeframe: None,
            chase: None,
        }
    }

    /// Only react to bars of `timeframe`
    pub fn on_timeframe(mut self, timeframe: Timeframe) -> Self {
        self.timeframe = Some(timeframe);
        self
    }

    /// Enter with a chased post-only limit instead of a market order
    pub fn with_chase(mut self, settings: ChaseSettings) -> Self {
        self.chase = Some(settings);
        self
    }

    /// Which way the averages crossed on the newest bar, if they did
    pub fn cross(&self, closes: &[f64]) -> Option<Side> {
        let n = closes.len();
        let fast_now = sma_at(closes, self.fast, n)?;
        let slow_now = sma_at(closes, self.slow, n)?;
        let fast_prev = sma_at(closes, self.fast, n - 1)?;
        let slow_prev = sma_at(closes, self.slow, n - 1)?;

        if fast_prev <= slow_prev && fast_now > slow_now {
            Some(Side::Buy)
        } else if fast_prev >= slow_prev && fast_now < slow_now {
            Some(Side::Sell)
        } else {
            None
        }
    }
}

impl Default for SmaCrossStrategy {
    fn default() -> Self {
        Self::new(9, 21, 0.01)
    }
}

impl Strategy for SmaCrossStrategy {
    fn name(&self) -> &str {
        "SmaCross"
    }

    fn on_bar(
        &mut self,
        ctx: &StrategyContext<'_>,
        timeframe: Timeframe,
        bars: &BarSeries,
    ) -> Result<(), StrategyError> {
        if self.timeframe.is_some_and(|tf| tf != timeframe) {
            return Ok(());
        }
        let Some(side) = self.cross(&bars.close) else {
            return Ok(());
        };

        let id = match side {
            Side::Buy => "Long",
            Side::Sell => "Short",
        };
        tracing::info!(
            "{} {} cross on {} at {:?}",
            self.name(),
            id,
            timeframe,
            bars.last_time()
        );

        let mut intent = OrderIntent::new(id, side, self.qty);
        if let Some(settings) = self.chase {
            intent = intent.chase(settings);
        }
        match ctx.trader.entry(intent)? {
            OrderAction::Skipped(reason) => tracing::debug!("{} entry skipped: {}", id, reason),
            action => tracing::debug!("{} entry: {:?}", id, action),
        }
        Ok(())
    }
}
