use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::mpsc;

use super::product::normalize_listing;
use super::{ExchangeGateway, GatewayError, Product, Topic};
use crate::models::{
    AmendField, Bar, BookTicker, ExchangeEvent, ExecutionFill, InstrumentTick, KlineUpdate,
    OpenOrder, OpenOrders, Order, OrderClass, OrderFilter, OrderKind, OrderStatus, OrderUpdate,
    Position, PositionUpdate, Side, Timeframe, WalletBalance, WalletUpdate,
};

const EVENT_BUFFER: usize = 1024;

/// A request the paper venue received
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayCall {
    Place { order: Order, params: Value },
    Amend { client_id: String, field: AmendField },
    Cancel { client_id: String },
    CancelAll(OrderFilter),
    OpenOrders(OrderFilter),
    Position,
    Balance,
    Subscribe(Vec<Topic>),
}

struct PaperState {
    calls: Vec<GatewayCall>,
    resting: Vec<Order>,
    position: Position,
    balance: WalletBalance,
    best_bid: f64,
    best_ask: f64,
    last_price: f64,
    failures: VecDeque<GatewayError>,
    sender: Option<mpsc::Sender<ExchangeEvent>>,
}

impl PaperState {
    fn emit(&self, event: ExchangeEvent) {
        if let Some(sender) = &self.sender {
            if let Err(e) = sender.try_send(event) {
                tracing::warn!("Paper venue dropped event: {}", e);
            }
        }
    }

    fn emit_order(&self, order: &Order) {
        self.emit(ExchangeEvent::OrderStatus(OrderUpdate {
            client_id: order.client_id.clone(),
            side: order.side,
            status: order.status,
            qty: order.requested_qty,
            filled_qty: order.filled_qty,
            limit_price: order.limit_price,
            stop_price: order.stop_price,
            time_in_force: order.time_in_force,
        }));
    }

    fn market_price(&self, side: Side) -> f64 {
        let quote = match side {
            Side::Buy => self.best_ask,
            Side::Sell => self.best_bid,
        };
        if quote > 0.0 {
            quote
        } else {
            self.last_price
        }
    }

    /// Apply a fill of `qty` at `price` to the position and push the events
    fn apply_fill(&mut self, order: &Order, qty: f64, price: f64) {
        let signed = order.side.sign() * qty;
        let old = self.position;
        let new_size = old.size + signed;

        let entry_price = if new_size == 0.0 {
            0.0
        } else if old.size == 0.0 || old.size.signum() != new_size.signum() {
            price
        } else if new_size.abs() > old.size.abs() {
            (old.entry_price * old.size.abs() + price * qty) / new_size.abs()
        } else {
            old.entry_price
        };

        self.position = Position {
            size: new_size,
            entry_price,
            liquidation_price: 0.0,
        };

        self.emit(ExchangeEvent::Execution(ExecutionFill {
            client_id: order.client_id.clone(),
            side: order.side,
            price,
            qty,
            fee: qty * price * 0.00075,
            time: Utc::now(),
        }));
        self.emit_order(order);
        self.emit(ExchangeEvent::Position(PositionUpdate {
            size: new_size,
            entry_price,
            liq_price: 0.0,
        }));
    }
}

/// In-process venue used for paper trading and tests
///
/// Records every request, keeps resting orders and a position, and pushes
/// venue-style events to the subscriber. Market orders fill immediately;
/// resting orders fill when `match_book` is enabled and the book crosses them,
/// or when a test calls `fill`.
pub struct PaperGateway {
    product: Product,
    symbol: String,
    match_book: bool,
    state: Mutex<PaperState>,
}

impl PaperGateway {
    pub fn new(product: Product, symbol: impl Into<String>) -> Self {
        Self {
            product,
            symbol: symbol.into(),
            match_book: false,
            state: Mutex::new(PaperState {
                calls: Vec::new(),
                resting: Vec::new(),
                position: Position::default(),
                balance: WalletBalance {
                    total: 10_000.0,
                    available: 10_000.0,
                },
                best_bid: 0.0,
                best_ask: 0.0,
                last_price: 0.0,
                failures: VecDeque::new(),
                sender: None,
            }),
        }
    }

    /// Fill resting orders when the book moves through them
    pub fn with_book_matching(mut self) -> Self {
        self.match_book = true;
        self
    }

    fn state(&self) -> MutexGuard<'_, PaperState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn take_failure(&self) -> Result<(), GatewayError> {
        match self.state().failures.pop_front() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    // ============================================================================
    // Test and driver helpers
    // ============================================================================

    /// Fail the next request with `error`
    pub fn fail_next(&self, error: GatewayError) {
        self.state().failures.push_back(error);
    }

    pub fn pending_failures(&self) -> usize {
        self.state().failures.len()
    }

    pub fn calls(&self) -> Vec<GatewayCall> {
        self.state().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    /// Orders placed so far, in request order
    pub fn placed_orders(&self) -> Vec<Order> {
        self.state()
            .calls
            .iter()
            .filter_map(|c| match c {
                GatewayCall::Place { order, .. } => Some(order.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn amend_calls(&self) -> Vec<(String, AmendField)> {
        self.state()
            .calls
            .iter()
            .filter_map(|c| match c {
                GatewayCall::Amend { client_id, field } => Some((client_id.clone(), *field)),
                _ => None,
            })
            .collect()
    }

    pub fn resting_orders(&self) -> Vec<Order> {
        self.state().resting.clone()
    }

    pub fn resting_order(&self, prefix: &str) -> Option<Order> {
        self.state()
            .resting
            .iter()
            .find(|o| o.client_id.starts_with(prefix))
            .cloned()
    }

    /// Fill `qty` of a resting order at its limit (or the market)
    pub fn fill(&self, client_id: &str, qty: f64) -> bool {
        let mut state = self.state();
        let Some(index) = state.resting.iter().position(|o| o.client_id == client_id) else {
            return false;
        };

        let mut order = state.resting[index].clone();
        let qty = qty.min(order.remaining_qty());
        order.filled_qty += qty;
        order.status = if order.remaining_qty() <= f64::EPSILON {
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        };
        let price = order
            .limit_price
            .unwrap_or_else(|| state.market_price(order.side));

        if order.status == OrderStatus::Filled {
            state.resting.remove(index);
        } else {
            state.resting[index] = order.clone();
        }
        state.apply_fill(&order, qty, price);
        true
    }

    /// Venue-side cancel, e.g. a post-only order that would have crossed
    pub fn cancel_externally(&self, client_id: &str) -> bool {
        self.finish(client_id, OrderStatus::Cancelled)
    }

    pub fn expire(&self, client_id: &str) -> bool {
        self.finish(client_id, OrderStatus::Expired)
    }

    fn finish(&self, client_id: &str, status: OrderStatus) -> bool {
        let mut state = self.state();
        let Some(index) = state.resting.iter().position(|o| o.client_id == client_id) else {
            return false;
        };
        let mut order = state.resting.remove(index);
        order.status = status;
        state.emit_order(&order);
        true
    }

    /// Replace the position (external trade) and push it
    pub fn set_position(&self, size: f64, entry_price: f64) {
        let mut state = self.state();
        state.position = Position {
            size,
            entry_price,
            liquidation_price: 0.0,
        };
        state.emit(ExchangeEvent::Position(PositionUpdate {
            size,
            entry_price,
            liq_price: 0.0,
        }));
    }

    pub fn push(&self, event: ExchangeEvent) {
        self.state().emit(event);
    }

    pub fn push_kline(&self, source: Timeframe, bar: Bar) {
        self.state()
            .emit(ExchangeEvent::Kline(KlineUpdate { source, bar }));
    }

    /// Move the book; with matching enabled crossed orders fill
    pub fn push_book(&self, best_bid: f64, best_ask: f64) {
        let mut state = self.state();
        state.best_bid = best_bid;
        state.best_ask = best_ask;
        state.last_price = (best_bid + best_ask) / 2.0;
        state.emit(ExchangeEvent::BookTicker(BookTicker {
            best_bid,
            best_ask,
            bid_qty: 1.0,
            ask_qty: 1.0,
        }));
        state.emit(ExchangeEvent::InstrumentTick(InstrumentTick {
            last_price: state.last_price,
            mark_price: Some(state.last_price),
        }));

        if !self.match_book {
            return;
        }

        let crossed: Vec<Order> = state
            .resting
            .iter()
            .filter(|o| crosses(o, best_bid, best_ask))
            .cloned()
            .collect();
        for mut order in crossed {
            state.resting.retain(|o| o.client_id != order.client_id);
            let qty = order.remaining_qty();
            let price = match order.kind {
                OrderKind::Stop => state.market_price(order.side),
                _ => order.limit_price.unwrap_or(state.last_price),
            };
            order.filled_qty = order.requested_qty;
            order.status = OrderStatus::Filled;
            state.apply_fill(&order, qty, price);
        }
    }
}

fn crosses(order: &Order, best_bid: f64, best_ask: f64) -> bool {
    match (order.kind, order.side) {
        (OrderKind::Limit, Side::Buy) => order.limit_price.is_some_and(|p| p > best_ask),
        (OrderKind::Limit, Side::Sell) => order.limit_price.is_some_and(|p| p < best_bid),
        (OrderKind::Stop | OrderKind::StopLimit, Side::Buy) => {
            order.stop_price.is_some_and(|p| best_ask >= p)
        }
        (OrderKind::Stop | OrderKind::StopLimit, Side::Sell) => {
            order.stop_price.is_some_and(|p| best_bid <= p)
        }
        (OrderKind::Market, _) => true,
    }
}

fn listing(order: &Order) -> OpenOrder {
    OpenOrder {
        client_id: order.client_id.clone(),
        side: order.side,
        qty: order.requested_qty,
        filled_qty: order.filled_qty,
        limit_price: order.limit_price,
        stop_price: order.stop_price,
        class: order.class(),
    }
}

#[async_trait]
impl ExchangeGateway for PaperGateway {
    fn product(&self) -> Product {
        self.product
    }

    async fn place_order(&self, order: &Order) -> Result<(), GatewayError> {
        self.take_failure()?;
        let rules = self.product.rules();
        if order.kind.is_conditional() && !rules.supports_conditional() {
            return Err(GatewayError::Unsupported {
                product: self.product,
                operation: "conditional order",
            });
        }

        let mut state = self.state();
        if state.resting.iter().any(|o| o.client_id == order.client_id) {
            return Err(GatewayError::Rejected(format!(
                "duplicate client id {}",
                order.client_id
            )));
        }
        state.calls.push(GatewayCall::Place {
            order: order.clone(),
            params: rules.order_params(&self.symbol, order),
        });

        let mut order = order.clone();
        if order.kind == OrderKind::Market {
            let price = state.market_price(order.side);
            let qty = order.requested_qty;
            order.filled_qty = qty;
            order.status = OrderStatus::Filled;
            state.apply_fill(&order, qty, price);
        } else {
            order.status = OrderStatus::New;
            state.emit_order(&order);
            state.resting.push(order);
        }
        Ok(())
    }

    async fn amend_order(
        &self,
        client_id: &str,
        _class: OrderClass,
        field: AmendField,
    ) -> Result<(), GatewayError> {
        self.take_failure()?;
        if !self.product.rules().supports_amend() {
            return Err(GatewayError::Unsupported {
                product: self.product,
                operation: "amend",
            });
        }

        let mut state = self.state();
        state.calls.push(GatewayCall::Amend {
            client_id: client_id.to_string(),
            field,
        });
        let Some(order) = state.resting.iter_mut().find(|o| o.client_id == client_id) else {
            return Err(GatewayError::NotFound(client_id.to_string()));
        };
        match field {
            AmendField::Qty(qty) => order.requested_qty = qty,
            AmendField::Price(price) => order.limit_price = Some(price),
            AmendField::TriggerPrice(price) => order.stop_price = Some(price),
        }
        let order = order.clone();
        state.emit_order(&order);
        Ok(())
    }

    async fn cancel_order(&self, client_id: &str, class: OrderClass) -> Result<(), GatewayError> {
        self.take_failure()?;
        if class == OrderClass::Conditional && !self.product.rules().supports_conditional() {
            return Err(GatewayError::Unsupported {
                product: self.product,
                operation: "cancel conditional",
            });
        }
        self.state().calls.push(GatewayCall::Cancel {
            client_id: client_id.to_string(),
        });
        if self.finish(client_id, OrderStatus::Cancelled) {
            Ok(())
        } else {
            Err(GatewayError::NotFound(client_id.to_string()))
        }
    }

    async fn cancel_all(&self, filter: OrderFilter) -> Result<(), GatewayError> {
        self.take_failure()?;
        let mut state = self.state();
        state.calls.push(GatewayCall::CancelAll(filter));

        let (cancelled, kept): (Vec<Order>, Vec<Order>) = state
            .resting
            .drain(..)
            .partition(|o| filter.includes(o.class()));
        state.resting = kept;
        for mut order in cancelled {
            order.status = OrderStatus::Cancelled;
            state.emit_order(&order);
        }
        Ok(())
    }

    async fn open_orders(&self, filter: OrderFilter) -> Result<OpenOrders, GatewayError> {
        self.take_failure()?;
        let mut state = self.state();
        state.calls.push(GatewayCall::OpenOrders(filter));

        let rules = self.product.rules();
        let mut active = Vec::new();
        let mut conditional = Vec::new();
        for order in &state.resting {
            // some venues list stop orders together with plain ones
            if order.class() == OrderClass::Conditional && !rules.conditional_listed_as_active() {
                conditional.push(listing(order));
            } else {
                active.push(listing(order));
            }
        }

        let mut orders = normalize_listing(rules, active, conditional);
        if !filter.includes(OrderClass::Active) {
            orders.active.clear();
        }
        if !filter.includes(OrderClass::Conditional) {
            orders.conditional.clear();
        }
        Ok(orders)
    }

    async fn position(&self) -> Result<Position, GatewayError> {
        self.take_failure()?;
        let mut state = self.state();
        state.calls.push(GatewayCall::Position);
        Ok(state.position)
    }

    async fn balance(&self) -> Result<WalletBalance, GatewayError> {
        self.take_failure()?;
        let mut state = self.state();
        state.calls.push(GatewayCall::Balance);
        Ok(state.balance)
    }

    async fn subscribe(
        &self,
        topics: &[Topic],
    ) -> Result<mpsc::Receiver<ExchangeEvent>, GatewayError> {
        self.take_failure()?;
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let mut state = self.state();
        state.calls.push(GatewayCall::Subscribe(topics.to_vec()));
        let balance = state.balance;
        state.sender = Some(tx);
        state.emit(ExchangeEvent::Wallet(WalletUpdate {
            coin: "USDT".to_string(),
            balance,
        }));
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{TimeInForce, TriggerPrice};

    fn make_order(id: &str, side: Side, kind: OrderKind, qty: f64, limit: Option<f64>) -> Order {
        Order {
            client_id: id.to_string(),
            side,
            kind,
            requested_qty: qty,
            filled_qty: 0.0,
            limit_price: limit,
            stop_price: kind.is_conditional().then_some(90.0),
            reduce_only: false,
            time_in_force: TimeInForce::GoodTillCancel,
            trigger_by: TriggerPrice::LastPrice,
            status: OrderStatus::New,
            created_at: Utc::now(),
        }
    }

    fn drain(rx: &mut mpsc::Receiver<ExchangeEvent>) -> Vec<ExchangeEvent> {
        let mut events = Vec::new();
        while let Ok(e) = rx.try_recv() {
            events.push(e);
        }
        events
    }

    #[tokio::test]
    async fn test_market_order_fills_and_moves_position() {
        let paper = PaperGateway::new(Product::Linear, "BTCUSDT");
        let mut rx = paper.subscribe(&[Topic::Order]).await.unwrap();
        paper.push_book(99.0, 101.0);

        let order = make_order("Long-1", Side::Buy, OrderKind::Market, 2.0, None);
        paper.place_order(&order).await.unwrap();

        let position = paper.position().await.unwrap();
        assert_eq!(position.size, 2.0);
        assert_eq!(position.entry_price, 101.0);

        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(
            e,
            ExchangeEvent::OrderStatus(u) if u.status == OrderStatus::Filled && u.client_id == "Long-1"
        )));
        assert!(events
            .iter()
            .any(|e| matches!(e, ExchangeEvent::Position(p) if p.size == 2.0)));
    }

    #[tokio::test]
    async fn test_partial_then_full_fill() {
        let paper = PaperGateway::new(Product::Linear, "BTCUSDT");
        let mut rx = paper.subscribe(&[Topic::Order]).await.unwrap();
        let order = make_order("L-1", Side::Buy, OrderKind::Limit, 1.0, Some(100.0));
        paper.place_order(&order).await.unwrap();

        assert!(paper.fill("L-1", 0.4));
        assert_eq!(paper.resting_orders().len(), 1);
        assert!(paper.fill("L-1", 1.0));
        assert!(paper.resting_orders().is_empty());
        assert!(!paper.fill("L-1", 1.0));

        let statuses: Vec<OrderStatus> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                ExchangeEvent::OrderStatus(u) => Some(u.status),
                _ => None,
            })
            .collect();
        assert_eq!(
            statuses,
            vec![OrderStatus::New, OrderStatus::PartiallyFilled, OrderStatus::Filled]
        );
        assert_eq!(paper.position().await.unwrap().size, 1.0);
    }

    #[tokio::test]
    async fn test_cancel_missing_order_not_found() {
        let paper = PaperGateway::new(Product::Linear, "BTCUSDT");
        let err = paper
            .cancel_order("ghost", OrderClass::Active)
            .await
            .unwrap_err();
        assert_eq!(err, GatewayError::NotFound("ghost".into()));
    }

    #[tokio::test]
    async fn test_spot_rejects_conditional_and_amend() {
        let paper = PaperGateway::new(Product::Spot, "BTCUSDT");
        let stop = make_order("SL-1", Side::Sell, OrderKind::Stop, 1.0, None);
        assert!(matches!(
            paper.place_order(&stop).await,
            Err(GatewayError::Unsupported { .. })
        ));

        let limit = make_order("L-1", Side::Buy, OrderKind::Limit, 1.0, Some(100.0));
        paper.place_order(&limit).await.unwrap();
        assert!(paper
            .amend_order("L-1", OrderClass::Active, AmendField::Price(101.0))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_usdc_perp_listing_normalized() {
        let paper = PaperGateway::new(Product::UsdcPerp, "BTCPERP");
        paper
            .place_order(&make_order("SL-1", Side::Sell, OrderKind::Stop, 1.0, None))
            .await
            .unwrap();
        paper
            .place_order(&make_order("TP-1", Side::Sell, OrderKind::Limit, 1.0, Some(120.0)))
            .await
            .unwrap();

        let orders = paper.open_orders(OrderFilter::Both).await.unwrap();
        assert_eq!(orders.active.len(), 1);
        assert_eq!(orders.conditional.len(), 1);
        assert_eq!(orders.conditional[0].client_id, "SL-1");

        let orders = paper.open_orders(OrderFilter::ActiveOnly).await.unwrap();
        assert!(orders.conditional.is_empty());
    }

    #[tokio::test]
    async fn test_book_matching_fills_crossed_orders() {
        let paper = PaperGateway::new(Product::Linear, "BTCUSDT").with_book_matching();
        paper.push_book(100.0, 100.5);
        paper
            .place_order(&make_order("B-1", Side::Buy, OrderKind::Limit, 1.0, Some(99.0)))
            .await
            .unwrap();

        paper.push_book(99.5, 99.8);
        assert_eq!(paper.resting_orders().len(), 1);

        paper.push_book(98.0, 98.5);
        assert!(paper.resting_orders().is_empty());
        assert_eq!(paper.position().await.unwrap().entry_price, 99.0);
    }
}
