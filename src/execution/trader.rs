use std::sync::Arc;
use std::time::Duration;

use super::exit_evaluator::{ExitEvaluator, ExitPolicy, ExitTrigger, CLOSE_ID};
use super::limit_chaser::LimitChaser;
use super::order_tracker::OrderTracker;
use super::position_tracker::PositionTracker;
use super::sltp::{SltpActions, SltpEvaluator, SltpPolicy};
use crate::error::{CoreError, Result};
use crate::gateway::Product;
use crate::models::{
    AmendField, ChaseSettings, OpenOrder, OrderFilter, OrderIntent, OrderUpdate, SharedCallback,
    Side,
};

/// Minimum pyramiding top-up, as a fraction of the exposure cap
const MIN_TOPUP_FRACTION: f64 = 0.02;

/// What a trading call did
#[derive(Debug, Clone, PartialEq)]
pub enum OrderAction {
    /// Registered with the tracker; placement runs in the background
    Submitted(String),
    /// Handed to a background task (chase, or behind a cancel)
    Queued,
    Skipped(String),
}

impl OrderAction {
    pub fn is_skipped(&self) -> bool {
        matches!(self, OrderAction::Skipped(_))
    }
}

/// Strategy-facing trading API
///
/// Every call returns without waiting on the venue: orders are registered
/// and sent from background tasks so the event loop never stalls.
pub struct Trader {
    tracker: Arc<OrderTracker>,
    chaser: Arc<LimitChaser>,
    positions: Arc<PositionTracker>,
    exit: ExitEvaluator,
    sltp: SltpEvaluator,
}

impl Trader {
    pub fn new(
        tracker: Arc<OrderTracker>,
        chaser: Arc<LimitChaser>,
        positions: Arc<PositionTracker>,
    ) -> Self {
        Self {
            tracker,
            chaser,
            positions,
            exit: ExitEvaluator::new(),
            sltp: SltpEvaluator::new(),
        }
    }

    pub fn tracker(&self) -> &Arc<OrderTracker> {
        &self.tracker
    }

    pub fn chaser(&self) -> &Arc<LimitChaser> {
        &self.chaser
    }

    pub fn positions(&self) -> &Arc<PositionTracker> {
        &self.positions
    }

    pub fn exit_evaluator(&self) -> &ExitEvaluator {
        &self.exit
    }

    pub fn position_size(&self) -> f64 {
        self.positions.size()
    }

    // ============================================================================
    // Orders
    // ============================================================================

    fn dispatch(&self, intent: OrderIntent, cancel_first: bool) -> Result<OrderAction> {
        if self.tracker.is_halted() {
            return Err(CoreError::Halted);
        }

        if intent.chase.is_some() {
            let tracker = Arc::clone(&self.tracker);
            let chaser = Arc::clone(&self.chaser);
            tokio::spawn(async move {
                if cancel_first {
                    tracker.cancel_all(OrderFilter::Both).await;
                }
                if let Err(e) = chaser.start(intent).await {
                    tracing::warn!("Chase not started: {}", e);
                }
            });
            return Ok(OrderAction::Queued);
        }

        if cancel_first {
            let tracker = Arc::clone(&self.tracker);
            tokio::spawn(async move {
                tracker.cancel_all(OrderFilter::Both).await;
                if let Err(e) = tracker.submit(intent).await {
                    tracing::warn!("Order after cancel-all failed: {}", e);
                }
            });
            return Ok(OrderAction::Queued);
        }

        self.tracker
            .submit_detached(intent)
            .map(OrderAction::Submitted)
    }

    /// Send an order as described, chased when it carries chase settings
    pub fn order(&self, intent: OrderIntent) -> Result<OrderAction> {
        self.dispatch(intent, false)
    }

    /// Enter in the intent's direction, reversing any opposite position
    ///
    /// A no-op when already positioned in that direction.
    pub fn entry(&self, mut intent: OrderIntent) -> Result<OrderAction> {
        let size = self.positions.size();
        let long = intent.side == Side::Buy;
        if (long && size > 0.0) || (!long && size < 0.0) {
            return Ok(OrderAction::Skipped(format!(
                "Already {} {}",
                if long { "long" } else { "short" },
                size
            )));
        }

        intent.qty = self.tracker.precision().qty(intent.qty.abs() + size.abs());
        self.dispatch(intent, false)
    }

    /// Enter allowing up to `pyramiding` stacked entries of `intent.qty`
    pub fn entry_pyramiding(
        &self,
        mut intent: OrderIntent,
        pyramiding: u32,
        cancel_all: bool,
    ) -> Result<OrderAction> {
        let qty = intent.qty;
        if qty <= 0.0 {
            return Ok(OrderAction::Skipped("Non-positive quantity".to_string()));
        }

        let size = self.positions.size();
        let long = intent.side == Side::Buy;
        let cap = pyramiding.max(1) as f64 * qty;

        if (long && size >= cap) || (!long && size <= -cap) {
            return Ok(OrderAction::Skipped(format!(
                "Pyramiding cap {} reached (position {})",
                cap, size
            )));
        }

        let opposite = (long && size < 0.0) || (!long && size > 0.0);
        let mut order_qty = if opposite { qty + size.abs() } else { qty };
        if (long && size + qty > cap) || (!long && size - qty < -cap) {
            order_qty = cap - size.abs();
        }

        // avoid dribbling tiny top-ups that only churn the protective orders
        if order_qty < cap * MIN_TOPUP_FRACTION {
            return Ok(OrderAction::Skipped(format!(
                "Top-up {} below {}% of cap",
                order_qty,
                MIN_TOPUP_FRACTION * 100.0
            )));
        }

        intent.qty = self.tracker.precision().qty(order_qty);
        self.dispatch(intent, cancel_all)
    }

    /// Close the whole position at market (or chased when `chase` is set)
    ///
    /// Refused on spot, where the "position" is the wallet's base balance.
    pub fn close_all(
        &self,
        callback: Option<SharedCallback>,
        split: u32,
        interval: Duration,
        chase: Option<ChaseSettings>,
    ) -> Result<OrderAction> {
        if self.tracker.gateway().product() == Product::Spot {
            return Ok(OrderAction::Skipped(
                "Close all refused on spot".to_string(),
            ));
        }
        let size = self.positions.size();
        if size == 0.0 {
            return Ok(OrderAction::Skipped("No position to close".to_string()));
        }

        let mut intent = OrderIntent::new(CLOSE_ID, Side::from_long(size < 0.0), size.abs())
            .split(split, interval);
        if let Some(settings) = chase {
            intent = intent.chase(settings);
        }
        if let Some(cb) = callback {
            intent = intent.on_filled(move || cb());
        }

        tracing::info!("Closing position {}", size);
        self.dispatch(intent, false)
    }

    pub fn cancel(&self, prefix: &str) {
        let tracker = Arc::clone(&self.tracker);
        let prefix = prefix.to_string();
        tokio::spawn(async move {
            tracker.cancel(&prefix).await;
        });
    }

    pub fn cancel_all(&self, filter: OrderFilter) {
        let tracker = Arc::clone(&self.tracker);
        tokio::spawn(async move {
            tracker.cancel_all(filter).await;
        });
    }

    pub fn amend(&self, prefix: &str, field: AmendField) {
        let tracker = Arc::clone(&self.tracker);
        let prefix = prefix.to_string();
        tokio::spawn(async move {
            tracker.amend(&prefix, field).await;
        });
    }

    pub async fn open_orders(&self, prefix: &str, filter: OrderFilter) -> Vec<OpenOrder> {
        self.tracker.open_orders(prefix, filter).await
    }

    pub async fn open_order(&self, prefix: &str, filter: OrderFilter) -> Option<OpenOrder> {
        self.tracker.open_order(prefix, filter).await
    }

    pub async fn open_order_qty(&self, prefix: &str, filter: OrderFilter) -> f64 {
        self.tracker.open_order_qty(prefix, filter).await
    }

    // ============================================================================
    // Risk exits
    // ============================================================================

    pub fn exit(&self, policy: ExitPolicy) {
        self.exit.set_policy(policy);
    }

    pub fn sltp(&self, policy: SltpPolicy) {
        self.sltp.set_policy(policy);
    }

    pub fn on_order_event(&self, update: &OrderUpdate) {
        self.exit.on_order_event(update);
    }

    /// Check the exit policy against the current position; issues the close
    pub fn evaluate_exit(&self) -> Option<ExitTrigger> {
        let snapshot = self.positions.snapshot();
        let profit = self
            .positions
            .profit_at(&snapshot.position, snapshot.market_price);
        let decision = self.exit.evaluate(&snapshot, profit)?;

        match self.close_all(decision.callback, decision.split, decision.interval, None) {
            Ok(OrderAction::Skipped(reason)) => {
                tracing::info!("Exit {:?} not executed: {}", decision.trigger, reason);
                self.exit.release();
                None
            }
            Ok(_) => Some(decision.trigger),
            Err(e) => {
                tracing::warn!("Exit {:?} close failed: {}", decision.trigger, e);
                self.exit.release();
                None
            }
        }
    }

    /// Bring the TP/SL orders in line with the current position
    pub async fn evaluate_sltp(&self) -> SltpActions {
        self.sltp
            .evaluate(&self.tracker, self.positions.position())
            .await
    }
}
