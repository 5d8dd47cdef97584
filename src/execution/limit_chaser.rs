use chrono::Utc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::market_feed::MarketFeed;
use super::order_tracker::OrderTracker;
use crate::error::{CoreError, Result};
use crate::gateway::GatewayError;
use crate::models::{
    AmendField, ChaseSettings, Completion, Order, OrderClass, OrderIntent, OrderKind, OrderStatus,
    OrderUpdate, Side, TimeInForce, TriggerPrice,
};

/// f64 stored as bits so both tasks can read it without a lock
#[derive(Debug, Default)]
struct AtomicF64(AtomicU64);

impl AtomicF64 {
    fn new(value: f64) -> Self {
        Self(AtomicU64::new(value.to_bits()))
    }

    fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Acquire))
    }

    fn store(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Release)
    }
}

/// Shared state of one side's chase
///
/// Two writers, split by field: the repricing loop owns the quoting fields
/// (`order_id`, `last_quoted`, `active_attempts`), the event dispatch path owns
/// the fill/status fields (everything else). Each side only reads the other's.
struct ChaseState {
    side: Side,
    prefix: String,
    target_qty: f64,
    reduce_only: bool,

    // loop-owned
    order_id: RwLock<String>,
    last_quoted: AtomicF64,
    active_attempts: AtomicU64,

    // dispatch-owned
    status: Mutex<OrderStatus>,
    filled: AtomicF64,
    retired_filled: AtomicF64,
    chase_attempts: AtomicU64,
    cancel_count: AtomicU64,
    is_active: AtomicBool,
    acked: Mutex<Option<(String, f64)>>,
    callback: Mutex<Option<Completion>>,
}

impl ChaseState {
    fn new(intent: &mut OrderIntent, target_qty: f64, order_id: String) -> Self {
        Self {
            side: intent.side,
            prefix: intent.id.clone(),
            target_qty,
            reduce_only: intent.reduce_only,
            order_id: RwLock::new(order_id),
            last_quoted: AtomicF64::new(0.0),
            active_attempts: AtomicU64::new(0),
            status: Mutex::new(OrderStatus::New),
            filled: AtomicF64::new(0.0),
            retired_filled: AtomicF64::new(0.0),
            chase_attempts: AtomicU64::new(0),
            cancel_count: AtomicU64::new(0),
            is_active: AtomicBool::new(true),
            acked: Mutex::new(None),
            callback: Mutex::new(intent.callback.take()),
        }
    }

    fn order_id(&self) -> String {
        self.order_id
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn set_order_id(&self, id: String) {
        *self.order_id.write().unwrap_or_else(|e| e.into_inner()) = id;
    }

    fn status(&self) -> MutexGuard<'_, OrderStatus> {
        self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_active(&self) -> bool {
        self.is_active.load(Ordering::Acquire)
    }

    /// An amend has been sent and its acknowledgement has not arrived yet
    fn is_reprice_in_flight(&self) -> bool {
        self.active_attempts.load(Ordering::Acquire) > self.chase_attempts.load(Ordering::Acquire)
    }

    /// Quantity still to buy/sell after fills on retired orders
    fn remaining_qty(&self) -> f64 {
        (self.target_qty - self.retired_filled.load()).max(0.0)
    }

    /// Clear the attempt counters once the loop has exited
    fn reset_counters(&self) {
        self.active_attempts.store(0, Ordering::Release);
        self.chase_attempts.store(0, Ordering::Release);
        self.cancel_count.store(0, Ordering::Release);
    }

    /// Dispatch-side transition for a status push of the chased order
    fn apply(&self, update: &OrderUpdate) -> Option<Completion> {
        *self.status() = update.status;
        self.filled.store(update.filled_qty);

        match update.status {
            OrderStatus::New | OrderStatus::PartiallyFilled => {
                let Some(price) = update.limit_price else {
                    return None;
                };
                let mut acked = self.acked.lock().unwrap_or_else(|e| e.into_inner());
                // first ack of each order is the placement, not a reprice
                if let Some((id, previous)) = acked.as_ref() {
                    if *id == update.client_id && *previous != price {
                        self.chase_attempts.fetch_add(1, Ordering::AcqRel);
                    }
                }
                *acked = Some((update.client_id.clone(), price));
                None
            }
            OrderStatus::Filled => {
                self.is_active.store(false, Ordering::Release);
                self.callback
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .take()
            }
            OrderStatus::Cancelled | OrderStatus::Expired | OrderStatus::Rejected => {
                let retired = self.retired_filled.load() + update.filled_qty;
                self.retired_filled.store(retired);
                self.filled.store(0.0);

                if self.chase_attempts.load(Ordering::Acquire) > 0 && self.remaining_qty() > 0.0 {
                    // repriced at least once: the loop replaces it with a new order
                    self.cancel_count.fetch_add(1, Ordering::AcqRel);
                } else {
                    self.is_active.store(false, Ordering::Release);
                }
                None
            }
        }
    }

    fn snapshot(&self, running: bool) -> ChaseSnapshot {
        ChaseSnapshot {
            side: self.side,
            order_id: self.order_id(),
            target_qty: self.target_qty,
            filled_qty: self.retired_filled.load() + self.filled.load(),
            last_quoted_price: self.last_quoted.load(),
            status: *self.status(),
            is_active: self.is_active() && running,
            is_reprice_in_flight: self.is_reprice_in_flight(),
            active_attempt_counter: self.active_attempts.load(Ordering::Acquire),
            chase_attempt_counter: self.chase_attempts.load(Ordering::Acquire),
            cancel_count: self.cancel_count.load(Ordering::Acquire),
        }
    }
}

/// Read-only view of a side's chase
#[derive(Debug, Clone, PartialEq)]
pub struct ChaseSnapshot {
    pub side: Side,
    pub order_id: String,
    pub target_qty: f64,
    pub filled_qty: f64,
    pub last_quoted_price: f64,
    pub status: OrderStatus,
    pub is_active: bool,
    pub is_reprice_in_flight: bool,
    pub active_attempt_counter: u64,
    pub chase_attempt_counter: u64,
    pub cancel_count: u64,
}

struct ChaseHandle {
    state: Arc<ChaseState>,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ChaseHandle {
    /// Signal the loop and wait until it has exited
    async fn retire(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.task.await {
            tracing::warn!("Chase loop ended abnormally: {}", e);
        }
    }
}

fn slot_index(side: Side) -> usize {
    match side {
        Side::Buy => 0,
        Side::Sell => 1,
    }
}

/// Keeps one post-only limit order per side pinned to the best bid/ask
pub struct LimitChaser {
    tracker: Arc<OrderTracker>,
    feed: Arc<MarketFeed>,
    slots: [Mutex<Option<ChaseHandle>>; 2],
}

impl LimitChaser {
    pub fn new(tracker: Arc<OrderTracker>, feed: Arc<MarketFeed>) -> Self {
        Self {
            tracker,
            feed,
            slots: [Mutex::new(None), Mutex::new(None)],
        }
    }

    fn slot(&self, side: Side) -> MutexGuard<'_, Option<ChaseHandle>> {
        self.slots[slot_index(side)]
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// Start chasing `intent` on its side
    ///
    /// A chase already running on that side is stopped first and its loop
    /// awaited, so the old state is fully retired before the new one quotes.
    /// Returns the client id of the first order.
    pub async fn start(&self, mut intent: OrderIntent) -> Result<String> {
        if self.tracker.is_halted() {
            return Err(CoreError::Halted);
        }
        let target_qty = self.tracker.precision().qty(intent.qty);
        if target_qty <= 0.0 {
            return Err(CoreError::Placement(format!(
                "{}: chase quantity {} rounds to zero",
                intent.id, intent.qty
            )));
        }

        let side = intent.side;
        let previous = self.slot(side).take();
        if let Some(previous) = previous {
            tracing::info!(
                "Retiring {} chase {} before starting {}",
                side,
                previous.state.order_id(),
                intent.id
            );
            previous.retire().await;
        }

        let settings = intent.chase.unwrap_or_default();
        let order_id = self.tracker.next_client_id(&intent.id);
        let state = Arc::new(ChaseState::new(&mut intent, target_qty, order_id.clone()));
        let (stop, stop_rx) = watch::channel(false);

        let task = tokio::spawn(
            ChaseLoop {
                tracker: Arc::clone(&self.tracker),
                feed: Arc::clone(&self.feed),
                state: Arc::clone(&state),
                settings,
                stop: stop_rx,
            }
            .run(),
        );

        tracing::info!(
            "Chasing {} {} {} (update every {:?})",
            order_id,
            side,
            target_qty,
            settings.update_rate
        );
        *self.slot(side) = Some(ChaseHandle { state, stop, task });
        Ok(order_id)
    }

    /// Route an order-status push to the chase that owns it
    ///
    /// Returns true when the update belonged to a chased order.
    pub fn on_order_event(&self, update: &OrderUpdate) -> bool {
        let state = [Side::Buy, Side::Sell].into_iter().find_map(|side| {
            self.slot(side)
                .as_ref()
                .filter(|h| h.state.order_id() == update.client_id)
                .map(|h| Arc::clone(&h.state))
        });
        let Some(state) = state else {
            return false;
        };

        tracing::debug!(
            client_id = %update.client_id,
            "Chase order {} filled {}/{}",
            update.status,
            update.filled_qty,
            update.qty
        );

        let callback = state.apply(update);
        if update.status == OrderStatus::Filled {
            self.tracker.notifier().notify(&format!(
                "Chase order filled {} {} {}",
                update.client_id, update.side, update.filled_qty
            ));
        }
        if let Some(callback) = callback {
            callback();
        }
        true
    }

    /// Stop the chase on `side`, cancelling its resting order
    pub async fn stop(&self, side: Side) {
        let handle = self.slot(side).take();
        if let Some(handle) = handle {
            tracing::info!("Stopping {} chase {}", side, handle.state.order_id());
            handle.retire().await;
        }
    }

    pub async fn stop_all(&self) {
        self.stop(Side::Buy).await;
        self.stop(Side::Sell).await;
    }

    /// A chase loop is running on `side` and its order is not done
    pub fn is_active(&self, side: Side) -> bool {
        self.slot(side)
            .as_ref()
            .is_some_and(|h| h.state.is_active() && !h.task.is_finished())
    }

    pub fn snapshot(&self, side: Side) -> Option<ChaseSnapshot> {
        self.slot(side)
            .as_ref()
            .map(|h| h.state.snapshot(!h.task.is_finished()))
    }
}

/// The background repricing task of one chase
struct ChaseLoop {
    tracker: Arc<OrderTracker>,
    feed: Arc<MarketFeed>,
    state: Arc<ChaseState>,
    settings: ChaseSettings,
    stop: watch::Receiver<bool>,
}

impl ChaseLoop {
    /// Sleep for `duration`; false when stopped meanwhile
    async fn pause(&mut self, duration: Duration) -> bool {
        if *self.stop.borrow() {
            return false;
        }
        tokio::select! {
            _ = self.stop.changed() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    fn build_order(&self, client_id: String, price: f64) -> Order {
        let state = &self.state;
        Order {
            client_id,
            side: state.side,
            kind: OrderKind::Limit,
            requested_qty: self.tracker.precision().qty(state.remaining_qty()),
            filled_qty: 0.0,
            limit_price: Some(price),
            stop_price: None,
            reduce_only: state.reduce_only,
            time_in_force: TimeInForce::PostOnly,
            trigger_by: TriggerPrice::LastPrice,
            status: OrderStatus::New,
            created_at: Utc::now(),
        }
    }

    async fn place(&self, price: f64) -> bool {
        let order = self.build_order(self.state.order_id(), price);
        match self.tracker.gateway().place_order(&order).await {
            Ok(()) => {
                self.state.last_quoted.store(price);
                tracing::info!(
                    client_id = %order.client_id,
                    "Chase order placed {} {} @ {}",
                    order.side,
                    order.requested_qty,
                    price
                );
                true
            }
            Err(e) => {
                tracing::warn!(client_id = %order.client_id, "Chase placement failed: {}", e);
                false
            }
        }
    }

    async fn cancel_resting(&self) {
        if *self.state.status() == OrderStatus::Filled {
            return;
        }
        let id = self.state.order_id();
        match self
            .tracker
            .gateway()
            .cancel_order(&id, OrderClass::Active)
            .await
        {
            Ok(()) => tracing::info!(client_id = %id, "Chase order cancelled"),
            Err(GatewayError::NotFound(_)) => {
                tracing::debug!(client_id = %id, "Chase order already gone")
            }
            Err(e) => tracing::warn!(client_id = %id, "Chase cancel failed: {}", e),
        }
    }

    async fn reprice(&mut self, price: f64) {
        let id = self.state.order_id();
        self.state.active_attempts.fetch_add(1, Ordering::AcqRel);

        let amended = self
            .tracker
            .gateway()
            .amend_order(&id, OrderClass::Active, AmendField::Price(price))
            .await;
        match amended {
            Ok(()) => {
                self.state.last_quoted.store(price);
                tracing::debug!(client_id = %id, "Chase amend to {}", price);
                if !self.settings.interval.is_zero() {
                    self.pause(self.settings.interval).await;
                }
            }
            Err(e) => {
                self.state.active_attempts.fetch_sub(1, Ordering::AcqRel);
                tracing::debug!(client_id = %id, "Chase amend failed: {}", e);
            }
        }
    }

    async fn run(mut self) {
        let side = self.state.side;
        if !self.settings.init_delay.is_zero() && !self.pause(self.settings.init_delay).await {
            return;
        }

        let mut needs_order = true;
        let mut resubmits = 0;
        let precision = self.tracker.precision();

        loop {
            if needs_order {
                if self.tracker.is_halted() {
                    tracing::warn!("Chase {} stopped: trading halted", self.state.prefix);
                    break;
                }
                let price = precision.price(self.feed.passive_price(side));
                if price > 0.0 {
                    if !self.place(price).await {
                        break;
                    }
                    needs_order = false;
                }
            } else if self.state.cancel_count.load(Ordering::Acquire) > resubmits {
                // cancelled after repricing: replace with a brand-new order
                resubmits = self.state.cancel_count.load(Ordering::Acquire);
                let next_id = self.tracker.next_client_id(&self.state.prefix);
                tracing::info!(
                    "Chase order {} cancelled by venue, resubmitting as {}",
                    self.state.order_id(),
                    next_id
                );
                self.state.set_order_id(next_id);
                // an amend in flight on the dead order will never be acked
                self.state.active_attempts.store(
                    self.state.chase_attempts.load(Ordering::Acquire),
                    Ordering::Release,
                );
                needs_order = true;
                continue;
            } else if !self.state.is_reprice_in_flight() {
                let best = precision.price(self.feed.passive_price(side));
                if best > 0.0 && best != self.state.last_quoted.load() {
                    self.reprice(best).await;
                }
            }

            if !self.pause(self.settings.update_rate).await {
                self.cancel_resting().await;
                break;
            }
            if !self.state.is_active() {
                break;
            }
        }

        self.state.reset_counters();
        tracing::debug!("Chase loop {} exited", self.state.prefix);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::order_tracker::TrackerSettings;
    use crate::execution::precision::Precision;
    use crate::gateway::paper::GatewayCall;
    use crate::gateway::{ExchangeGateway, PaperGateway, Product, Topic};
    use crate::models::{BookTicker, ExchangeEvent};
    use crate::notify::LogNotifier;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;

    struct Harness {
        paper: Arc<PaperGateway>,
        feed: Arc<MarketFeed>,
        chaser: LimitChaser,
        rx: mpsc::Receiver<ExchangeEvent>,
    }

    impl Harness {
        async fn new() -> Self {
            let paper = Arc::new(PaperGateway::new(Product::Linear, "BTCUSDT"));
            let rx = paper.subscribe(&[Topic::Order]).await.unwrap();
            let tracker = Arc::new(OrderTracker::new(
                paper.clone(),
                Arc::new(LogNotifier),
                TrackerSettings {
                    precision: Precision::new(2, 3),
                    ..Default::default()
                },
            ));
            let feed = Arc::new(MarketFeed::new());
            let chaser = LimitChaser::new(tracker, feed.clone());
            let harness = Self {
                paper,
                feed,
                chaser,
                rx,
            };
            harness.book(99.0, 101.0);
            harness
        }

        fn book(&self, bid: f64, ask: f64) {
            self.feed.on_book(&BookTicker {
                best_bid: bid,
                best_ask: ask,
                bid_qty: 1.0,
                ask_qty: 1.0,
            });
        }

        /// Let the loop run one cycle, then dispatch the venue's pushes
        async fn settle(&mut self) {
            tokio::time::sleep(Duration::from_millis(60)).await;
            while let Ok(event) = self.rx.try_recv() {
                if let ExchangeEvent::OrderStatus(u) = event {
                    self.chaser.on_order_event(&u);
                }
            }
        }

        fn resting_id(&self) -> String {
            self.paper.resting_orders()[0].client_id.clone()
        }
    }

    fn buy_intent() -> OrderIntent {
        OrderIntent::new("Chase", Side::Buy, 1.0).chase(ChaseSettings::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_quotes_passive_price_and_reprices() {
        let mut h = Harness::new().await;
        let id = h.chaser.start(buy_intent()).await.unwrap();
        h.settle().await;

        let resting = h.paper.resting_orders();
        assert_eq!(resting.len(), 1);
        assert_eq!(resting[0].client_id, id);
        assert_eq!(resting[0].limit_price, Some(99.0));
        assert_eq!(resting[0].time_in_force, TimeInForce::PostOnly);

        h.book(99.5, 101.0);
        h.settle().await;
        assert_eq!(h.paper.amend_calls(), vec![(id.clone(), AmendField::Price(99.5))]);

        let snapshot = h.chaser.snapshot(Side::Buy).unwrap();
        assert_eq!(snapshot.chase_attempt_counter, 1);
        assert_eq!(snapshot.last_quoted_price, 99.5);
        assert!(!snapshot.is_reprice_in_flight);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_amend_while_previous_in_flight() {
        let mut h = Harness::new().await;
        h.chaser.start(buy_intent()).await.unwrap();
        h.settle().await;

        h.book(99.5, 101.0);
        // loop runs but the ack is never dispatched
        tokio::time::sleep(Duration::from_millis(60)).await;
        h.book(100.0, 101.0);
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(h.paper.amend_calls().len(), 1);
        assert!(h.chaser.snapshot(Side::Buy).unwrap().is_reprice_in_flight);

        // ack arrives, next reprice goes out
        h.settle().await;
        h.settle().await;
        assert_eq!(h.paper.amend_calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_after_reprices_resubmits_new_order() {
        let mut h = Harness::new().await;
        let first_id = h.chaser.start(buy_intent()).await.unwrap();
        h.settle().await;

        h.book(99.5, 101.0);
        h.settle().await;
        h.book(99.8, 101.0);
        h.settle().await;
        assert_eq!(h.chaser.snapshot(Side::Buy).unwrap().chase_attempt_counter, 2);

        h.paper.cancel_externally(&first_id);
        h.settle().await;
        h.settle().await;

        let placed = h.paper.placed_orders();
        assert_eq!(placed.len(), 2);
        assert_ne!(placed[1].client_id, first_id);
        assert!(placed[1].client_id.starts_with("Chase-"));
        assert_eq!(placed[1].requested_qty, 1.0);
        assert_eq!(placed[1].limit_price, Some(99.8));
        // resubmitted, never amended under the old id again
        assert!(h
            .paper
            .amend_calls()
            .iter()
            .all(|(id, _)| *id == first_id));
        assert!(h.chaser.is_active(Side::Buy));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_without_reprice_ends_chase() {
        let mut h = Harness::new().await;
        h.chaser.start(buy_intent()).await.unwrap();
        h.settle().await;

        let id = h.resting_id();
        h.paper.cancel_externally(&id);
        h.settle().await;
        h.settle().await;

        assert_eq!(h.paper.placed_orders().len(), 1);
        assert!(!h.chaser.is_active(Side::Buy));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fill_invokes_callback_and_ends_loop() {
        let mut h = Harness::new().await;
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        h.chaser
            .start(buy_intent().on_filled(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }))
            .await
            .unwrap();
        h.settle().await;

        let id = h.resting_id();
        h.paper.fill(&id, 1.0);
        h.settle().await;
        h.settle().await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!h.chaser.is_active(Side::Buy));
        // filled orders are not cancelled on exit
        assert!(!h
            .paper
            .calls()
            .iter()
            .any(|c| matches!(c, GatewayCall::Cancel { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_retires_previous_chase() {
        let mut h = Harness::new().await;
        let old_id = h.chaser.start(buy_intent()).await.unwrap();
        h.settle().await;
        h.book(99.5, 101.0);
        h.settle().await;
        assert_eq!(h.chaser.snapshot(Side::Buy).unwrap().active_attempt_counter, 1);

        let new_id = h.chaser.start(buy_intent()).await.unwrap();
        h.settle().await;

        assert!(h.paper.calls().contains(&GatewayCall::Cancel {
            client_id: old_id.clone()
        }));
        let resting = h.paper.resting_orders();
        assert_eq!(resting.len(), 1);
        assert_eq!(resting[0].client_id, new_id);

        let snapshot = h.chaser.snapshot(Side::Buy).unwrap();
        assert_eq!(snapshot.order_id, new_id);
        assert_eq!(snapshot.active_attempt_counter, 0);
        assert_eq!(snapshot.chase_attempt_counter, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sides_are_independent() {
        let mut h = Harness::new().await;
        h.chaser.start(buy_intent()).await.unwrap();
        h.chaser
            .start(OrderIntent::new("Chase", Side::Sell, 0.5).chase(ChaseSettings::default()))
            .await
            .unwrap();
        h.settle().await;

        assert_eq!(h.paper.resting_orders().len(), 2);
        assert_eq!(
            h.paper.resting_order("Chase").map(|o| o.side),
            Some(Side::Buy)
        );

        h.chaser.stop(Side::Buy).await;
        assert!(!h.chaser.is_active(Side::Buy));
        assert!(h.chaser.is_active(Side::Sell));
        assert_eq!(h.paper.resting_orders()[0].side, Side::Sell);

        h.chaser.stop_all().await;
        assert!(h.paper.resting_orders().is_empty());
    }
}
