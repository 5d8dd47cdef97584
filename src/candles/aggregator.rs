use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::cmp::Reverse;
use std::collections::VecDeque;
use std::sync::Arc;

use super::resample::{resample, split_partial};
use super::validator::BarValidator;
use crate::clock::TimeSource;
use crate::error::{CoreError, Result};
use crate::models::{Bar, BarSeries, Timeframe};

/// Order in which timeframes closing on the same update are reported
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TimeframeOrder {
    /// Widest bucket first
    #[default]
    Descending,
    Ascending,
    /// As configured
    Source,
}

#[derive(Debug, Clone, Copy)]
pub struct AggregatorSettings {
    /// Closed bars retained per timeframe
    pub lookback: usize,
    /// Invoke strategies for the last seeded bar before any new close
    pub call_on_start: bool,
    pub order: TimeframeOrder,
    /// Build every timeframe from one-minute klines
    pub minute_granularity: bool,
}

impl Default for AggregatorSettings {
    fn default() -> Self {
        Self {
            lookback: 100,
            call_on_start: true,
            order: TimeframeOrder::Descending,
            minute_granularity: false,
        }
    }
}

/// A timeframe whose strategy is due, with its closed-bar history
#[derive(Debug, Clone, PartialEq)]
pub struct BarClose {
    pub timeframe: Timeframe,
    pub series: BarSeries,
}

/// Closed history plus the live bucket for one timeframe
#[derive(Debug, Clone)]
pub struct TimeframeBuffer {
    timeframe: Timeframe,
    source: Timeframe,
    closed: VecDeque<Bar>,
    // raw source bars of the still-open bucket
    open_bars: Vec<Bar>,
    partial: Option<Bar>,
    last_invocation: Option<DateTime<Utc>>,
    lookback: usize,
}

impl TimeframeBuffer {
    fn new(timeframe: Timeframe, source: Timeframe, lookback: usize) -> Self {
        Self {
            timeframe,
            source,
            closed: VecDeque::with_capacity(lookback + 1),
            open_bars: Vec::new(),
            partial: None,
            last_invocation: None,
            lookback,
        }
    }

    pub fn timeframe(&self) -> Timeframe {
        self.timeframe
    }

    pub fn source(&self) -> Timeframe {
        self.source
    }

    pub fn closed_bars(&self) -> &VecDeque<Bar> {
        &self.closed
    }

    pub fn partial_bar(&self) -> Option<&Bar> {
        self.partial.as_ref()
    }

    pub fn last_invocation(&self) -> Option<DateTime<Utc>> {
        self.last_invocation
    }

    pub fn series(&self) -> BarSeries {
        BarSeries::from_bars(&self.closed)
    }

    fn last_closed_time(&self) -> Option<DateTime<Utc>> {
        self.closed.back().map(|b| b.open_time)
    }

    fn trim(&mut self) {
        while self.closed.len() > self.lookback {
            self.closed.pop_front();
        }
    }

    fn seed(&mut self, bars: &[Bar], now: DateTime<Utc>) {
        let mut sorted = bars.to_vec();
        sorted.sort_by_key(|b| b.open_time);
        sorted.dedup_by_key(|b| b.open_time);

        let (mut closed, mut partial) = split_partial(resample(&sorted, self.timeframe));

        // Newest bucket stays open only if its end is still in the future
        if let Some(p) = partial {
            if self.timeframe.bucket_end(p.open_time) <= now {
                closed.push(p);
                partial = None;
            }
        }

        self.open_bars = match partial {
            Some(p) => sorted
                .into_iter()
                .filter(|b| self.timeframe.bucket_start(b.open_time) == p.open_time)
                .collect(),
            None => Vec::new(),
        };
        self.partial = partial;
        self.closed = closed.into();
        self.trim();
    }

    /// Fold one source bar into the buffer. Returns false if the bar was dropped.
    fn apply(&mut self, bar: Bar) -> bool {
        let bucket = self.timeframe.bucket_start(bar.open_time);

        // Closed bars are immutable
        if let Some(last_closed) = self.last_closed_time() {
            if bucket <= last_closed {
                tracing::warn!(
                    "[{}] Dropping bar {} for already closed bucket {}",
                    self.timeframe,
                    bar.open_time,
                    bucket
                );
                return false;
            }
        }

        match self.open_bars.last_mut() {
            Some(last) if bar.open_time < last.open_time => {
                tracing::warn!(
                    "[{}] Dropping out-of-order bar {} (newest {})",
                    self.timeframe,
                    bar.open_time,
                    last.open_time
                );
                return false;
            }
            // Refresh of the in-progress bar
            Some(last) if bar.open_time == last.open_time => *last = bar,
            _ => self.open_bars.push(bar),
        }

        let (closed, partial) = split_partial(resample(&self.open_bars, self.timeframe));
        if let Some(p) = partial {
            if !closed.is_empty() {
                self.open_bars
                    .retain(|b| self.timeframe.bucket_start(b.open_time) == p.open_time);
                for bar in closed {
                    tracing::debug!("[{}] Closed bar {}", self.timeframe, bar.open_time);
                    self.closed.push_back(bar);
                }
                self.trim();
            }
        }
        self.partial = partial;
        true
    }

    /// The closed history if the newest closed bar has not been handed out yet.
    /// Marks it as handed out.
    fn take_due(&mut self) -> Option<BarSeries> {
        let newest = self.last_closed_time()?;
        if self.last_invocation.is_some_and(|prev| newest <= prev) {
            return None;
        }
        self.last_invocation = Some(newest);
        Some(self.series())
    }
}

/// Multi-timeframe bar buffers fed from venue kline updates
pub struct CandleAggregator {
    buffers: Vec<TimeframeBuffer>,
    settings: AggregatorSettings,
    clock: Arc<dyn TimeSource>,
    validator: BarValidator,
}

impl CandleAggregator {
    /// Create an aggregator for `timeframes`. Duplicates are ignored.
    pub fn new(
        timeframes: &[Timeframe],
        settings: AggregatorSettings,
        clock: Arc<dyn TimeSource>,
    ) -> Self {
        let mut buffers: Vec<TimeframeBuffer> = Vec::with_capacity(timeframes.len());
        for tf in timeframes {
            if buffers.iter().any(|b| b.timeframe == *tf) {
                continue;
            }
            let source = tf.source(settings.minute_granularity);
            buffers.push(TimeframeBuffer::new(*tf, source, settings.lookback.max(1)));
        }

        Self {
            buffers,
            settings,
            clock,
            validator: BarValidator::new(),
        }
    }

    pub fn settings(&self) -> &AggregatorSettings {
        &self.settings
    }

    /// Configured timeframes in source order
    pub fn timeframes(&self) -> Vec<Timeframe> {
        self.buffers.iter().map(|b| b.timeframe).collect()
    }

    /// Distinct kline resolutions that must be subscribed to
    pub fn sources(&self) -> Vec<Timeframe> {
        let mut sources: Vec<Timeframe> = self.buffers.iter().map(|b| b.source).collect();
        sources.sort();
        sources.dedup();
        sources
    }

    pub fn buffer(&self, timeframe: Timeframe) -> Option<&TimeframeBuffer> {
        self.buffers.iter().find(|b| b.timeframe == timeframe)
    }

    pub fn closed_bars(&self, timeframe: Timeframe) -> Vec<Bar> {
        self.buffer(timeframe)
            .map(|b| b.closed.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn partial_bar(&self, timeframe: Timeframe) -> Option<Bar> {
        self.buffer(timeframe).and_then(|b| b.partial)
    }

    /// Bootstrap a timeframe from historical bars at its source resolution
    pub fn seed(&mut self, timeframe: Timeframe, bars: &[Bar]) -> Result<()> {
        let now = self.clock.now();
        let call_on_start = self.settings.call_on_start;

        for bar in bars {
            self.validator.validate(bar)?;
        }

        let buffer = self
            .buffers
            .iter_mut()
            .find(|b| b.timeframe == timeframe)
            .ok_or_else(|| CoreError::InvalidTimeframe(format!("{} not configured", timeframe)))?;

        buffer.seed(bars, now);

        // Without call_on_start the seeded history counts as already seen
        if !call_on_start {
            buffer.last_invocation = buffer.last_closed_time();
        }

        tracing::info!(
            "[{}] Seeded {} closed bars (partial: {})",
            timeframe,
            buffer.closed.len(),
            buffer.partial.is_some()
        );
        Ok(())
    }

    /// Apply a source-resolution update and report the timeframes whose strategy is due
    ///
    /// The returned closes are already marked as invoked, so a failing strategy
    /// is not called again for the same bar.
    pub fn ingest(&mut self, source: Timeframe, bar: Bar) -> Vec<BarClose> {
        if let Err(e) = self.validator.validate(&bar) {
            tracing::warn!("Dropping invalid {} bar at {}: {}", source, bar.open_time, e);
            return Vec::new();
        }

        let mut due = Vec::new();
        for buffer in self.buffers.iter_mut().filter(|b| b.source == source) {
            if !buffer.apply(bar) {
                continue;
            }
            if let Some(series) = buffer.take_due() {
                due.push(BarClose {
                    timeframe: buffer.timeframe,
                    series,
                });
            }
        }

        self.ordered(due)
    }

    /// Closes due before any update arrives (the seeded history with call_on_start)
    pub fn startup_due(&mut self) -> Vec<BarClose> {
        if !self.settings.call_on_start {
            return Vec::new();
        }
        let due = self
            .buffers
            .iter_mut()
            .filter_map(|b| {
                b.take_due().map(|series| BarClose {
                    timeframe: b.timeframe,
                    series,
                })
            })
            .collect();
        self.ordered(due)
    }

    fn ordered(&self, mut due: Vec<BarClose>) -> Vec<BarClose> {
        match self.settings.order {
            TimeframeOrder::Descending => due.sort_by_key(|c| Reverse(c.timeframe.width_secs())),
            TimeframeOrder::Ascending => due.sort_by_key(|c| c.timeframe.width_secs()),
            TimeframeOrder::Source => {}
        }
        due
    }

    /// Closed bars of an arbitrary coarser timeframe, built from the finest compatible buffer
    pub fn security(&self, timeframe: Timeframe) -> Result<BarSeries> {
        let base = self
            .buffers
            .iter()
            .filter(|b| {
                let width = b.timeframe.width_secs();
                width <= timeframe.width_secs() && timeframe.width_secs() % width == 0
            })
            .min_by_key(|b| b.timeframe.width_secs())
            .ok_or_else(|| {
                CoreError::InvalidTimeframe(format!("no buffer can build {}", timeframe))
            })?;

        let window: Vec<Bar> = base
            .closed
            .iter()
            .chain(base.partial.iter())
            .copied()
            .collect();
        let mut bars = resample(&window, timeframe);

        let now = self.clock.now();
        let newest_open = bars
            .last()
            .map(|b| timeframe.bucket_end(b.open_time) > now || base.partial.is_some())
            .unwrap_or(false);
        if newest_open {
            bars.pop();
        }
        Ok(BarSeries::from_bars(&bars))
    }
}
