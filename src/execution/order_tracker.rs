use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use super::precision::Precision;
use super::split::SplitChain;
use crate::error::{CoreError, Result};
use crate::gateway::{ExchangeGateway, GatewayError};
use crate::models::{
    AmendField, Completion, OpenOrder, Order, OrderFilter, OrderIntent, OrderKind, OrderStatus,
    OrderUpdate,
};
use crate::notify::Notifier;

#[derive(Debug, Clone, Copy)]
pub struct TrackerSettings {
    pub precision: Precision,
    /// Log every order status push
    pub order_update_log: bool,
    /// Log a banner for each new order
    pub trade_log: bool,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            precision: Precision::default(),
            order_update_log: true,
            trade_log: true,
        }
    }
}

/// What an order-status push did to the local view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderEventOutcome {
    /// Not one of ours (or already terminal)
    Untracked,
    /// Bookkeeping only
    Updated,
    /// Fully filled; callback fired
    Filled,
    /// Cancelled, expired or rejected; callback discarded
    Closed,
}

struct TrackedOrder {
    order: Order,
    callback: Option<Completion>,
    chain: Option<SplitChain>,
}

/// Authoritative local view of in-flight orders and owner of their completion callbacks
pub struct OrderTracker {
    gateway: Arc<dyn ExchangeGateway>,
    notifier: Arc<dyn Notifier>,
    settings: TrackerSettings,
    orders: Mutex<HashMap<String, TrackedOrder>>,
    sequence: AtomicU64,
    halted: AtomicBool,
}

impl OrderTracker {
    pub fn new(
        gateway: Arc<dyn ExchangeGateway>,
        notifier: Arc<dyn Notifier>,
        settings: TrackerSettings,
    ) -> Self {
        Self {
            gateway,
            notifier,
            settings,
            orders: Mutex::new(HashMap::new()),
            sequence: AtomicU64::new(0),
            halted: AtomicBool::new(false),
        }
    }

    fn orders(&self) -> MutexGuard<'_, HashMap<String, TrackedOrder>> {
        self.orders.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn gateway(&self) -> &Arc<dyn ExchangeGateway> {
        &self.gateway
    }

    pub fn notifier(&self) -> &Arc<dyn Notifier> {
        &self.notifier
    }

    pub fn precision(&self) -> Precision {
        self.settings.precision
    }

    /// `{prefix}-{seq}-{6 hex}`: unique per process and across restarts
    pub fn next_client_id(&self, prefix: &str) -> String {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let nonce = uuid::Uuid::new_v4().simple().to_string();
        format!("{}-{}-{}", prefix, seq, &nonce[..6])
    }

    /// Refuse all further submissions
    pub fn halt(&self) {
        if !self.halted.swap(true, Ordering::SeqCst) {
            tracing::warn!("Order tracker halted, no further orders will be sent");
        }
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Local copy of a tracked order
    pub fn tracked(&self, client_id: &str) -> Option<Order> {
        self.orders().get(client_id).map(|t| t.order.clone())
    }

    /// Tracked orders whose id starts with `prefix`
    pub fn tracked_with_prefix(&self, prefix: &str) -> Vec<Order> {
        let mut orders: Vec<Order> = self
            .orders()
            .values()
            .filter(|t| t.order.client_id.starts_with(prefix))
            .map(|t| t.order.clone())
            .collect();
        orders.sort_by_key(|o| o.created_at);
        orders
    }

    pub fn tracked_count(&self) -> usize {
        self.orders().len()
    }

    /// Quantity of split legs under `prefix` that have not been sent yet
    pub fn pending_chain_qty(&self, prefix: &str) -> f64 {
        let qty: f64 = self
            .orders()
            .values()
            .filter(|t| t.order.client_id.starts_with(prefix))
            .filter_map(|t| t.chain.as_ref())
            .map(|c| c.pending_qty())
            .sum();
        self.settings.precision.qty(qty)
    }

    // ============================================================================
    // Submission
    // ============================================================================

    /// Build the local order and store it before anything goes to the venue
    fn register(&self, mut intent: OrderIntent, chain: Option<SplitChain>) -> Result<Order> {
        if self.is_halted() {
            return Err(CoreError::Halted);
        }

        let precision = self.settings.precision;
        let qty = precision.qty(intent.qty);
        if qty <= 0.0 {
            return Err(CoreError::Placement(format!(
                "{}: quantity {} rounds to zero",
                intent.id, intent.qty
            )));
        }
        let kind = intent.kind();
        if intent.post_only && kind == OrderKind::Market {
            return Err(CoreError::Placement(format!(
                "{}: post-only order needs a limit price",
                intent.id
            )));
        }

        let order = Order {
            client_id: self.next_client_id(&intent.id),
            side: intent.side,
            kind,
            requested_qty: qty,
            filled_qty: 0.0,
            limit_price: intent.limit.map(|p| precision.price(p)),
            stop_price: intent.stop.map(|p| precision.price(p)),
            reduce_only: intent.reduce_only,
            time_in_force: intent.effective_time_in_force(),
            trigger_by: intent.trigger_by,
            status: OrderStatus::New,
            created_at: Utc::now(),
        };

        self.orders().insert(
            order.client_id.clone(),
            TrackedOrder {
                order: order.clone(),
                callback: intent.callback.take(),
                chain,
            },
        );
        Ok(order)
    }

    fn prepare(&self, intent: OrderIntent) -> Result<Order> {
        let (first, chain) = SplitChain::plan(intent, &self.settings.precision);
        if let Some(chain) = &chain {
            tracing::info!(
                "Splitting {} into {} legs {:?}",
                chain.prefix(),
                chain.legs().len(),
                chain.legs()
            );
        }
        self.register(first, chain)
    }

    async fn place(&self, order: Order) -> Result<String> {
        let client_id = order.client_id.clone();

        match self.gateway.place_order(&order).await {
            Ok(()) => {
                if self.settings.trade_log {
                    tracing::info!(
                        "========= New Order ==============\n ID: {}\n Side: {}\n Kind: {:?}\n Qty: {}\n Limit: {:?}\n Stop: {:?}\n ReduceOnly: {}\n TIF: {:?}",
                        client_id,
                        order.side,
                        order.kind,
                        order.requested_qty,
                        order.limit_price,
                        order.stop_price,
                        order.reduce_only,
                        order.time_in_force
                    );
                }
                self.notifier.notify(&format!(
                    "New order {} {} {} ({:?})",
                    client_id, order.side, order.requested_qty, order.kind
                ));
                Ok(client_id)
            }
            Err(e) => {
                // Drop the local order so nothing dangles
                self.orders().remove(&client_id);
                tracing::warn!(client_id = %client_id, "Order placement failed: {}", e);
                Err(CoreError::Placement(format!("{}: {}", client_id, e)))
            }
        }
    }

    /// Place an order and wait for the venue to accept it
    ///
    /// Returns the generated client id. On rejection the local order is
    /// discarded and `CoreError::Placement` is returned.
    pub async fn submit(&self, intent: OrderIntent) -> Result<String> {
        let order = self.prepare(intent)?;
        self.place(order).await
    }

    /// Register an order and send it in the background
    ///
    /// The client id is known immediately; a later placement failure is logged
    /// and the local order removed.
    pub fn submit_detached(self: &Arc<Self>, intent: OrderIntent) -> Result<String> {
        let order = self.prepare(intent)?;
        let client_id = order.client_id.clone();
        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            // failure already logged
            let _ = tracker.place(order).await;
        });
        Ok(client_id)
    }

    fn submit_leg(self: &Arc<Self>, intent: OrderIntent, chain: SplitChain) {
        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            if !chain.interval().is_zero() {
                tokio::time::sleep(chain.interval()).await;
            }
            let order = match tracker.register(intent, Some(chain)) {
                Ok(order) => order,
                Err(e) => {
                    tracing::warn!("Split chain stopped: {}", e);
                    return;
                }
            };
            let _ = tracker.place(order).await;
        });
    }

    fn advance_chain(self: &Arc<Self>, mut chain: SplitChain) {
        match chain.next_leg() {
            Some(next) => {
                tracing::info!("Sending split leg {} after {:?}", next.id, chain.interval());
                self.submit_leg(next, chain);
            }
            None => {
                tracing::info!("Split order {} completed", chain.prefix());
                if let Some(callback) = chain.take_completion() {
                    callback();
                }
            }
        }
    }

    // ============================================================================
    // Venue events
    // ============================================================================

    /// Reconcile a venue order-status push with the local view
    ///
    /// `Filled` invokes the registered callback once and removes the order.
    /// `Cancelled`/`Expired`/`Rejected` remove it and discard the callback.
    pub fn on_order_event(self: &Arc<Self>, update: &OrderUpdate) -> OrderEventOutcome {
        let mut orders = self.orders();
        let Some(tracked) = orders.get_mut(&update.client_id) else {
            tracing::debug!(client_id = %update.client_id, "Untracked order update {}", update.status);
            return OrderEventOutcome::Untracked;
        };

        let order = &mut tracked.order;
        order.status = update.status;
        order.filled_qty = update.filled_qty;
        if update.qty > 0.0 {
            order.requested_qty = update.qty;
        }
        if update.limit_price.is_some() {
            order.limit_price = update.limit_price;
        }
        if update.stop_price.is_some() {
            order.stop_price = update.stop_price;
        }

        if self.settings.order_update_log {
            tracing::info!(
                "========= Order Update ===============\n Status: {}\n ID: {}\n Side: {}\n Qty: {}\n Filled: {}\n Limit: {:?}\n Stop: {:?}",
                update.status,
                update.client_id,
                update.side,
                update.qty,
                update.filled_qty,
                update.limit_price,
                update.stop_price
            );
        }

        match update.status {
            OrderStatus::Filled => {
                let Some(done) = orders.remove(&update.client_id) else {
                    return OrderEventOutcome::Untracked;
                };
                drop(orders);

                tracing::info!(client_id = %update.client_id, "Order fully filled");
                self.notifier.notify(&format!(
                    "Order filled {} {} {}",
                    update.client_id, update.side, update.filled_qty
                ));

                // Callbacks run outside the lock; they may submit new orders
                if let Some(callback) = done.callback {
                    callback();
                }
                if let Some(chain) = done.chain {
                    self.advance_chain(chain);
                }
                OrderEventOutcome::Filled
            }
            OrderStatus::Cancelled | OrderStatus::Expired | OrderStatus::Rejected => {
                let chain_stopped = orders
                    .remove(&update.client_id)
                    .is_some_and(|t| t.chain.is_some_and(|c| !c.is_exhausted()));
                drop(orders);

                if update.is_triggered_conditional() {
                    tracing::info!(client_id = %update.client_id, "Conditional order TRIGGERED");
                } else {
                    tracing::info!(client_id = %update.client_id, "Order {}", update.status);
                }
                if chain_stopped {
                    tracing::warn!(client_id = %update.client_id, "Split chain stopped before its last leg");
                }
                OrderEventOutcome::Closed
            }
            OrderStatus::New | OrderStatus::PartiallyFilled => {
                tracing::debug!(
                    client_id = %update.client_id,
                    "Order {} ({}/{})",
                    update.status,
                    update.filled_qty,
                    update.qty
                );
                OrderEventOutcome::Updated
            }
        }
    }

    // ============================================================================
    // Cancel / amend / queries
    // ============================================================================

    /// Open orders at the venue whose id starts with `prefix`
    pub async fn open_orders(&self, prefix: &str, filter: OrderFilter) -> Vec<OpenOrder> {
        match self.gateway.open_orders(filter).await {
            Ok(orders) => orders
                .matching(prefix, filter)
                .into_iter()
                .cloned()
                .collect(),
            Err(e) => {
                tracing::warn!("Open order query failed: {}", e);
                Vec::new()
            }
        }
    }

    /// First open order whose id starts with `prefix`
    pub async fn open_order(&self, prefix: &str, filter: OrderFilter) -> Option<OpenOrder> {
        self.open_orders(prefix, filter).await.into_iter().next()
    }

    /// Total remaining quantity of matching open orders
    pub async fn open_order_qty(&self, prefix: &str, filter: OrderFilter) -> f64 {
        let qty: f64 = self
            .open_orders(prefix, filter)
            .await
            .iter()
            .map(|o| (o.qty - o.filled_qty).max(0.0))
            .sum();
        self.settings.precision.qty(qty)
    }

    /// Cancel the first open order whose id starts with `prefix`
    ///
    /// Returns false (logged, non-fatal) when nothing matched or the venue no
    /// longer had the order.
    pub async fn cancel(&self, prefix: &str) -> bool {
        let Some(target) = self.open_order(prefix, OrderFilter::Both).await else {
            let miss = CoreError::CancelMiss(prefix.to_string());
            tracing::info!("{}", miss);
            return false;
        };

        match self
            .gateway
            .cancel_order(&target.client_id, target.class)
            .await
        {
            Ok(()) => {
                tracing::info!(client_id = %target.client_id, "Cancel order");
                true
            }
            Err(GatewayError::NotFound(_)) => {
                let miss = CoreError::CancelMiss(target.client_id);
                tracing::info!("{}", miss);
                false
            }
            Err(e) => {
                tracing::warn!(client_id = %target.client_id, "Cancel failed: {}", e);
                false
            }
        }
    }

    /// Cancel every open order matching `filter`
    ///
    /// Products without conditional orders only cancel active ones.
    pub async fn cancel_all(&self, filter: OrderFilter) -> bool {
        let rules = self.gateway.product().rules();
        let filter = match filter {
            OrderFilter::Both | OrderFilter::ActiveOnly if !rules.supports_conditional() => {
                OrderFilter::ActiveOnly
            }
            OrderFilter::ConditionalOnly if !rules.supports_conditional() => {
                tracing::info!("No conditional orders on {}", self.gateway.product());
                return false;
            }
            other => other,
        };

        match self.gateway.cancel_all(filter).await {
            Ok(()) => {
                tracing::info!("Cancel all orders ({:?})", filter);
                true
            }
            Err(e) => {
                tracing::warn!("Cancel all failed: {}", e);
                false
            }
        }
    }

    /// Change one field of the first open order whose id starts with `prefix`
    ///
    /// Looks the order up first because active and conditional orders amend
    /// through different routes. Fails quietly (logged) when nothing matches.
    pub async fn amend(&self, prefix: &str, field: AmendField) -> bool {
        let Some(target) = self.open_order(prefix, OrderFilter::Both).await else {
            let err = CoreError::Amend(format!("no open order matching {}", prefix));
            tracing::info!("{}", err);
            return false;
        };

        let precision = self.settings.precision;
        let field = match field {
            AmendField::Qty(q) => AmendField::Qty(precision.qty(q)),
            AmendField::Price(p) => AmendField::Price(precision.price(p)),
            AmendField::TriggerPrice(p) => AmendField::TriggerPrice(precision.price(p)),
        };

        match self
            .gateway
            .amend_order(&target.client_id, target.class, field)
            .await
        {
            Ok(()) => {
                tracing::info!(client_id = %target.client_id, "Amend order {:?}", field);
                true
            }
            Err(e) => {
                let err = CoreError::Amend(format!("{}: {}", target.client_id, e));
                tracing::warn!("{}", err);
                false
            }
        }
    }
}
