use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use super::order_tracker::OrderTracker;
use super::precision::Precision;
use crate::models::{OrderFilter, OrderIntent, Position, SharedCallback, Side, TriggerPrice};

pub const TAKE_PROFIT_ID: &str = "TP";
pub const STOP_LOSS_ID: &str = "SL";

/// Percentage take-profit / stop-loss targets, per position direction
///
/// Percentages are given in percent (2.0 = 2%). A zero target is disabled.
#[derive(Clone, Default)]
pub struct SltpPolicy {
    pub profit_long_pct: f64,
    pub profit_short_pct: f64,
    pub stop_long_pct: f64,
    pub stop_short_pct: f64,
    pub trigger_by: TriggerPrice,
    pub split: u32,
    pub interval: Duration,
    pub on_profit_long: Option<SharedCallback>,
    pub on_profit_short: Option<SharedCallback>,
    pub on_stop_long: Option<SharedCallback>,
    pub on_stop_short: Option<SharedCallback>,
}

impl SltpPolicy {
    pub fn new(
        profit_long_pct: f64,
        profit_short_pct: f64,
        stop_long_pct: f64,
        stop_short_pct: f64,
    ) -> Self {
        Self {
            profit_long_pct,
            profit_short_pct,
            stop_long_pct,
            stop_short_pct,
            split: 1,
            ..Default::default()
        }
    }

    pub fn is_active(&self) -> bool {
        self.profit_long_pct > 0.0
            || self.profit_short_pct > 0.0
            || self.stop_long_pct > 0.0
            || self.stop_short_pct > 0.0
    }

    /// Take-profit price for a position entered at `entry`
    pub fn take_profit_price(&self, entry: f64, long: bool, precision: &Precision) -> Option<f64> {
        let pct = if long {
            self.profit_long_pct
        } else {
            self.profit_short_pct
        } / 100.0;
        if pct <= 0.0 {
            return None;
        }
        let price = if long {
            entry + entry * pct
        } else {
            entry - entry * pct
        };
        Some(precision.price(price))
    }

    /// Stop-loss trigger price for a position entered at `entry`
    pub fn stop_loss_price(&self, entry: f64, long: bool, precision: &Precision) -> Option<f64> {
        let pct = if long {
            self.stop_long_pct
        } else {
            self.stop_short_pct
        } / 100.0;
        if pct <= 0.0 {
            return None;
        }
        let price = if long {
            entry - entry * pct
        } else {
            entry + entry * pct
        };
        Some(precision.price(price))
    }
}

impl fmt::Debug for SltpPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SltpPolicy")
            .field("profit_long_pct", &self.profit_long_pct)
            .field("profit_short_pct", &self.profit_short_pct)
            .field("stop_long_pct", &self.stop_long_pct)
            .field("stop_short_pct", &self.stop_short_pct)
            .field("trigger_by", &self.trigger_by)
            .field("split", &self.split)
            .field("interval", &self.interval)
            .finish()
    }
}

/// What one evaluation did
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SltpActions {
    pub cancelled: Vec<String>,
    pub submitted: Vec<String>,
}

impl SltpActions {
    pub fn is_empty(&self) -> bool {
        self.cancelled.is_empty() && self.submitted.is_empty()
    }
}

/// Keeps reduce-only TP and SL orders sized to the full position
///
/// Replacing a stale order is cancel-then-submit, not an atomic replace: the
/// position has no resting protection between the two calls. Evaluations are
/// serialized so two updates cannot both resubmit.
#[derive(Default)]
pub struct SltpEvaluator {
    policy: RwLock<SltpPolicy>,
    serial: tokio::sync::Mutex<()>,
}

impl SltpEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_policy(&self, policy: SltpPolicy) {
        tracing::info!("SLTP policy set: {:?}", policy);
        *self.policy.write().unwrap_or_else(|e| e.into_inner()) = policy;
    }

    pub fn policy(&self) -> SltpPolicy {
        self.policy
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub async fn evaluate(&self, tracker: &Arc<OrderTracker>, position: Position) -> SltpActions {
        let mut actions = SltpActions::default();
        let policy = self.policy();
        if !policy.is_active() || position.is_flat() {
            return actions;
        }

        let _serial = self.serial.lock().await;
        let precision = tracker.precision();
        let size = position.size;
        let long = size > 0.0;

        // Take profit
        let tp_order = tracker.open_order(TAKE_PROFIT_ID, OrderFilter::Both).await;
        let mut tp_cancelled = false;
        let tp_covered = match &tp_order {
            Some(order) => {
                if order.side == Side::from_long(long) {
                    tracing::info!(client_id = %order.client_id, "Cancelling wrong-side take profit");
                    if tracker.cancel(&order.client_id).await {
                        actions.cancelled.push(order.client_id.clone());
                    }
                    tp_cancelled = true;
                }
                let qty = tracker.open_order_qty(TAKE_PROFIT_ID, OrderFilter::Both).await
                    + tracker.pending_chain_qty(TAKE_PROFIT_ID);
                !tp_cancelled && precision.qty(qty) == precision.qty(size.abs())
            }
            None => false,
        };

        // Stop loss
        let sl_order = tracker.open_order(STOP_LOSS_ID, OrderFilter::Both).await;
        let mut sl_cancelled = false;
        let sl_covered = match &sl_order {
            Some(order) => {
                if order.side == Side::from_long(long) {
                    // same side as the position: would add to it, never protect it
                    tracing::info!(client_id = %order.client_id, "Cancelling wrong-side stop loss");
                    if tracker.cancel(&order.client_id).await {
                        actions.cancelled.push(order.client_id.clone());
                    }
                    sl_cancelled = true;
                }
                let qty = tracker.open_order_qty(STOP_LOSS_ID, OrderFilter::Both).await
                    + tracker.pending_chain_qty(STOP_LOSS_ID);
                let signed = precision.qty(qty) * order.side.sign();
                !sl_cancelled && signed == -precision.qty(size)
            }
            None => false,
        };

        let entry = position.entry_price;
        let close_side = Side::from_long(!long);

        if !tp_covered {
            if let Some(price) = policy.take_profit_price(entry, long, &precision) {
                if let Some(order) = tp_order.as_ref().filter(|_| !tp_cancelled) {
                    if tracker.cancel(&order.client_id).await {
                        actions.cancelled.push(order.client_id.clone());
                    }
                }
                let callback = if long {
                    policy.on_profit_long.clone()
                } else {
                    policy.on_profit_short.clone()
                };
                let intent = protective_intent(TAKE_PROFIT_ID, close_side, size.abs(), &policy, callback)
                    .limit(price);
                match tracker.submit(intent).await {
                    Ok(id) => {
                        tracing::info!("Take profit {} {} @ {}", id, size.abs(), price);
                        actions.submitted.push(id);
                    }
                    Err(e) => tracing::warn!("Take profit placement failed: {}", e),
                }
            }
        }

        if !sl_covered {
            if let Some(price) = policy.stop_loss_price(entry, long, &precision) {
                if let Some(order) = sl_order.as_ref().filter(|_| !sl_cancelled) {
                    if tracker.cancel(&order.client_id).await {
                        actions.cancelled.push(order.client_id.clone());
                    }
                }
                let callback = if long {
                    policy.on_stop_long.clone()
                } else {
                    policy.on_stop_short.clone()
                };
                let intent = protective_intent(STOP_LOSS_ID, close_side, size.abs(), &policy, callback)
                    .stop(price);
                match tracker.submit(intent).await {
                    Ok(id) => {
                        tracing::info!("Stop loss {} {} @ {}", id, size.abs(), price);
                        actions.submitted.push(id);
                    }
                    Err(e) => tracing::warn!("Stop loss placement failed: {}", e),
                }
            }
        }

        actions
    }
}

fn protective_intent(
    id: &str,
    side: Side,
    qty: f64,
    policy: &SltpPolicy,
    callback: Option<SharedCallback>,
) -> OrderIntent {
    let intent = OrderIntent::new(id, side, qty)
        .reduce_only()
        .trigger_by(policy.trigger_by)
        .split(policy.split, policy.interval);
    match callback {
        Some(cb) => intent.on_filled(move || cb()),
        None => intent,
    }
}
