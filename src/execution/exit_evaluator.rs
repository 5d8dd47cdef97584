use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use super::position_tracker::PositionSnapshot;
use crate::models::{OrderUpdate, SharedCallback};

/// Client id prefix of orders that close the whole position
pub const CLOSE_ID: &str = "Close";

/// Profit target, stop loss and trailing stop in absolute terms
///
/// All thresholds at zero disables the policy. When both the trailing stop
/// and the stop loss are set, the trailing stop takes precedence.
#[derive(Clone, Default)]
pub struct ExitPolicy {
    /// Unrealized profit (quote currency) at which to take profit
    pub profit_abs: f64,
    /// Unrealized loss magnitude at which to cut
    pub loss_abs: f64,
    /// Distance from the trailing water-mark that stops the position out
    pub trail_offset: f64,
    pub on_profit: Option<SharedCallback>,
    pub on_loss: Option<SharedCallback>,
    pub on_trail: Option<SharedCallback>,
    pub split: u32,
    pub interval: Duration,
}

impl ExitPolicy {
    pub fn new(profit_abs: f64, loss_abs: f64, trail_offset: f64) -> Self {
        Self {
            profit_abs,
            loss_abs,
            trail_offset,
            split: 1,
            ..Default::default()
        }
    }

    pub fn is_active(&self) -> bool {
        self.profit_abs > 0.0 || self.loss_abs > 0.0 || self.trail_offset > 0.0
    }
}

impl fmt::Debug for ExitPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExitPolicy")
            .field("profit_abs", &self.profit_abs)
            .field("loss_abs", &self.loss_abs)
            .field("trail_offset", &self.trail_offset)
            .field("split", &self.split)
            .field("interval", &self.interval)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitTrigger {
    TrailingStop,
    StopLoss,
    TakeProfit,
}

/// A close the evaluator wants issued
#[derive(Clone)]
pub struct ExitDecision {
    pub trigger: ExitTrigger,
    pub callback: Option<SharedCallback>,
    pub split: u32,
    pub interval: Duration,
}

impl fmt::Debug for ExitDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExitDecision")
            .field("trigger", &self.trigger)
            .field("has_callback", &self.callback.is_some())
            .field("split", &self.split)
            .finish()
    }
}

/// Decides when the open position must be closed
///
/// Only one close is outstanding at a time: after a decision the evaluator
/// stays quiet until the position is flat or the close order died.
#[derive(Default)]
pub struct ExitEvaluator {
    policy: RwLock<ExitPolicy>,
    pending_close: AtomicBool,
}

impl ExitEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_policy(&self, policy: ExitPolicy) {
        tracing::info!("Exit policy set: {:?}", policy);
        *self.policy.write().unwrap_or_else(|e| e.into_inner()) = policy;
    }

    pub fn policy(&self) -> ExitPolicy {
        self.policy
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn is_close_pending(&self) -> bool {
        self.pending_close.load(Ordering::Acquire)
    }

    /// Forget the outstanding close (submission failed)
    pub fn release(&self) {
        self.pending_close.store(false, Ordering::Release);
    }

    /// Clear the guard when a close order ends without filling
    pub fn on_order_event(&self, update: &OrderUpdate) {
        if update.client_id.starts_with(CLOSE_ID)
            && update.status.is_terminal()
            && update.status != crate::models::OrderStatus::Filled
        {
            tracing::info!(client_id = %update.client_id, "Close order {}, exit re-armed", update.status);
            self.release();
        }
    }

    /// Run the checks in precedence order: trailing stop, stop loss, take profit
    ///
    /// `profit` is the unrealized profit at the snapshot's market price.
    pub fn evaluate(&self, snapshot: &PositionSnapshot, profit: f64) -> Option<ExitDecision> {
        let size = snapshot.position.size;
        if size == 0.0 {
            self.release();
            return None;
        }

        let policy = self.policy();
        if !policy.is_active() || self.is_close_pending() {
            return None;
        }

        let trigger = Self::breached(&policy, snapshot, profit)?;
        if self.pending_close.swap(true, Ordering::AcqRel) {
            return None;
        }

        let callback = match trigger {
            ExitTrigger::TrailingStop => {
                tracing::info!("Loss cut by trailing stop: {}", policy.trail_offset);
                policy.on_trail
            }
            ExitTrigger::StopLoss => {
                tracing::info!("Loss cut by stop loss: {}", policy.loss_abs);
                policy.on_loss
            }
            ExitTrigger::TakeProfit => {
                tracing::info!("Take profit by stop profit: {}", policy.profit_abs);
                policy.on_profit
            }
        };

        Some(ExitDecision {
            trigger,
            callback,
            split: policy.split.max(1),
            interval: policy.interval,
        })
    }

    fn breached(
        policy: &ExitPolicy,
        snapshot: &PositionSnapshot,
        profit: f64,
    ) -> Option<ExitTrigger> {
        let size = snapshot.position.size;
        let market = snapshot.market_price;
        let trail = snapshot.trail_price;
        let offset = policy.trail_offset;

        if offset > 0.0 && trail > 0.0 && market > 0.0 {
            let hit = if size > 0.0 {
                market <= trail - offset
            } else {
                market >= trail + offset
            };
            if hit {
                return Some(ExitTrigger::TrailingStop);
            }
        }

        if profit < 0.0 && policy.loss_abs > 0.0 && policy.loss_abs < profit.abs() {
            return Some(ExitTrigger::StopLoss);
        }

        if profit > 0.0 && policy.profit_abs > 0.0 && policy.profit_abs < profit {
            return Some(ExitTrigger::TakeProfit);
        }

        None
    }
}
