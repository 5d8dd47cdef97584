pub mod events;
pub mod timeframe;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub use events::{
    BookTicker, ExchangeEvent, ExecutionFill, InstrumentTick, KlineUpdate, OrderUpdate,
    PositionUpdate, WalletBalance, WalletUpdate,
};
pub use timeframe::Timeframe;

/// One-shot completion callback, invoked at most once when an order fills
pub type Completion = Box<dyn FnOnce() + Send + 'static>;

/// Reusable callback held by long-lived policies (exit, SLTP)
pub type SharedCallback = Arc<dyn Fn() + Send + Sync + 'static>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn from_long(long: bool) -> Self {
        if long {
            Side::Buy
        } else {
            Side::Sell
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    /// +1 for buys, -1 for sells
    pub fn sign(&self) -> f64 {
        match self {
            Side::Buy => 1.0,
            Side::Sell => -1.0,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "Buy"),
            Side::Sell => write!(f, "Sell"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OrderKind {
    Market,
    Limit,
    /// Market order released when the trigger price is hit
    Stop,
    StopLimit,
}

impl OrderKind {
    pub fn from_prices(limit: Option<f64>, stop: Option<f64>) -> Self {
        match (limit, stop) {
            (Some(_), Some(_)) => OrderKind::StopLimit,
            (None, Some(_)) => OrderKind::Stop,
            (Some(_), None) => OrderKind::Limit,
            (None, None) => OrderKind::Market,
        }
    }

    pub fn is_conditional(&self) -> bool {
        matches!(self, OrderKind::Stop | OrderKind::StopLimit)
    }
}

/// Order lifecycle: New -> PartiallyFilled -> Filled | Cancelled | Expired | Rejected
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Cancelled,
    Expired,
    Rejected,
}

impl OrderStatus {
    /// Normalize a venue status string
    pub fn from_venue_str(status: &str) -> Option<Self> {
        match status.to_ascii_lowercase().as_str() {
            "created" | "new" | "untriggered" | "active" | "triggered" => Some(Self::New),
            "partiallyfilled" | "partially_filled" => Some(Self::PartiallyFilled),
            "filled" => Some(Self::Filled),
            "cancelled" | "canceled" | "partiallyfilledcanceled" | "deactivated" => {
                Some(Self::Cancelled)
            }
            "expired" => Some(Self::Expired),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Filled | Self::Cancelled | Self::Expired | Self::Rejected
        )
    }

    /// Resting on the book (or waiting for its trigger)
    pub fn is_open(&self) -> bool {
        matches!(self, Self::New | Self::PartiallyFilled)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::New => "New",
            Self::PartiallyFilled => "PartiallyFilled",
            Self::Filled => "Filled",
            Self::Cancelled => "Cancelled",
            Self::Expired => "Expired",
            Self::Rejected => "Rejected",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum TimeInForce {
    #[default]
    GoodTillCancel,
    ImmediateOrCancel,
    FillOrKill,
    PostOnly,
}

/// Price source used to fire conditional orders
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum TriggerPrice {
    #[default]
    LastPrice,
    MarkPrice,
    IndexPrice,
}

/// Venues route active and conditional orders through different endpoints
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OrderClass {
    Active,
    Conditional,
}

/// Which open orders a query or bulk cancel applies to
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum OrderFilter {
    #[default]
    Both,
    ActiveOnly,
    ConditionalOnly,
}

impl OrderFilter {
    pub fn includes(&self, class: OrderClass) -> bool {
        match self {
            OrderFilter::Both => true,
            OrderFilter::ActiveOnly => class == OrderClass::Active,
            OrderFilter::ConditionalOnly => class == OrderClass::Conditional,
        }
    }
}

/// The single field changed by one amend call
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AmendField {
    Qty(f64),
    Price(f64),
    TriggerPrice(f64),
}

/// Locally tracked order
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Order {
    pub client_id: String,
    pub side: Side,
    pub kind: OrderKind,
    pub requested_qty: f64,
    pub filled_qty: f64,
    pub limit_price: Option<f64>,
    pub stop_price: Option<f64>,
    pub reduce_only: bool,
    pub time_in_force: TimeInForce,
    pub trigger_by: TriggerPrice,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
}

impl Order {
    pub fn class(&self) -> OrderClass {
        if self.kind.is_conditional() {
            OrderClass::Conditional
        } else {
            OrderClass::Active
        }
    }

    pub fn is_post_only(&self) -> bool {
        self.time_in_force == TimeInForce::PostOnly
    }

    pub fn remaining_qty(&self) -> f64 {
        (self.requested_qty - self.filled_qty).max(0.0)
    }
}

/// An order as listed by the venue's open-order query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenOrder {
    pub client_id: String,
    pub side: Side,
    pub qty: f64,
    pub filled_qty: f64,
    pub limit_price: Option<f64>,
    pub stop_price: Option<f64>,
    pub class: OrderClass,
}

/// Open orders split by routing class
#[derive(Debug, Clone, Default)]
pub struct OpenOrders {
    pub active: Vec<OpenOrder>,
    pub conditional: Vec<OpenOrder>,
}

impl OpenOrders {
    /// Orders whose client id starts with `prefix`, active first
    pub fn matching(&self, prefix: &str, filter: OrderFilter) -> Vec<&OpenOrder> {
        let active = self
            .active
            .iter()
            .filter(|_| filter.includes(OrderClass::Active));
        let conditional = self
            .conditional
            .iter()
            .filter(|_| filter.includes(OrderClass::Conditional));
        active
            .chain(conditional)
            .filter(|o| o.client_id.starts_with(prefix))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty() && self.conditional.is_empty()
    }
}

/// Repricing cadence for a chased post-only order
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChaseSettings {
    /// Delay before the first quote
    pub init_delay: Duration,
    /// Sleep between checks of the best price
    pub update_rate: Duration,
    /// Pause after each amend
    pub interval: Duration,
}

impl Default for ChaseSettings {
    fn default() -> Self {
        Self {
            init_delay: Duration::from_millis(0),
            update_rate: Duration::from_millis(50),
            interval: Duration::from_millis(0),
        }
    }
}

/// A strategy-level request to trade
///
/// `id` is a caller-chosen prefix; the tracker appends a disambiguating suffix.
pub struct OrderIntent {
    pub id: String,
    pub side: Side,
    pub qty: f64,
    pub limit: Option<f64>,
    pub stop: Option<f64>,
    pub post_only: bool,
    pub reduce_only: bool,
    pub trigger_by: TriggerPrice,
    pub time_in_force: Option<TimeInForce>,
    pub split: u32,
    pub interval: Duration,
    pub chase: Option<ChaseSettings>,
    pub callback: Option<Completion>,
}

impl OrderIntent {
    pub fn new(id: impl Into<String>, side: Side, qty: f64) -> Self {
        Self {
            id: id.into(),
            side,
            qty,
            limit: None,
            stop: None,
            post_only: false,
            reduce_only: false,
            trigger_by: TriggerPrice::default(),
            time_in_force: None,
            split: 1,
            interval: Duration::ZERO,
            chase: None,
            callback: None,
        }
    }

    pub fn limit(mut self, price: f64) -> Self {
        self.limit = (price > 0.0).then_some(price);
        self
    }

    pub fn stop(mut self, price: f64) -> Self {
        self.stop = (price > 0.0).then_some(price);
        self
    }

    pub fn post_only(mut self) -> Self {
        self.post_only = true;
        self
    }

    pub fn reduce_only(mut self) -> Self {
        self.reduce_only = true;
        self
    }

    pub fn trigger_by(mut self, trigger: TriggerPrice) -> Self {
        self.trigger_by = trigger;
        self
    }

    pub fn time_in_force(mut self, tif: TimeInForce) -> Self {
        self.time_in_force = Some(tif);
        self
    }

    /// Iceberg: send `count` sequential legs, `interval` apart
    pub fn split(mut self, count: u32, interval: Duration) -> Self {
        self.split = count.max(1);
        self.interval = interval;
        self
    }

    pub fn chase(mut self, settings: ChaseSettings) -> Self {
        self.post_only = true;
        self.chase = Some(settings);
        self
    }

    pub fn on_filled(mut self, callback: impl FnOnce() + Send + 'static) -> Self {
        self.callback = Some(Box::new(callback));
        self
    }

    pub fn kind(&self) -> OrderKind {
        OrderKind::from_prices(self.limit, self.stop)
    }

    pub fn effective_time_in_force(&self) -> TimeInForce {
        match self.time_in_force {
            Some(tif) => tif,
            None if self.post_only => TimeInForce::PostOnly,
            None => TimeInForce::GoodTillCancel,
        }
    }
}

impl fmt::Debug for OrderIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrderIntent")
            .field("id", &self.id)
            .field("side", &self.side)
            .field("qty", &self.qty)
            .field("limit", &self.limit)
            .field("stop", &self.stop)
            .field("post_only", &self.post_only)
            .field("reduce_only", &self.reduce_only)
            .field("split", &self.split)
            .field("chase", &self.chase)
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}

/// Signed position on the traded pair
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct Position {
    pub size: f64, // positive = long, negative = short
    pub entry_price: f64,
    pub liquidation_price: f64,
}

impl Position {
    pub fn is_flat(&self) -> bool {
        self.size == 0.0
    }

    pub fn is_long(&self) -> bool {
        self.size > 0.0
    }

    pub fn is_short(&self) -> bool {
        self.size < 0.0
    }
}

/// OHLCV bar keyed by the start of its bucket
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Bar {
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Column view of closed bars handed to strategies
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BarSeries {
    pub times: Vec<DateTime<Utc>>,
    pub open: Vec<f64>,
    pub high: Vec<f64>,
    pub low: Vec<f64>,
    pub close: Vec<f64>,
    pub volume: Vec<f64>,
}

impl BarSeries {
    pub fn from_bars<'a>(bars: impl IntoIterator<Item = &'a Bar>) -> Self {
        let mut series = BarSeries::default();
        for bar in bars {
            series.times.push(bar.open_time);
            series.open.push(bar.open);
            series.high.push(bar.high);
            series.low.push(bar.low);
            series.close.push(bar.close);
            series.volume.push(bar.volume);
        }
        series
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    pub fn last_time(&self) -> Option<DateTime<Utc>> {
        self.times.last().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_kind_derivation() {
        assert_eq!(OrderKind::from_prices(None, None), OrderKind::Market);
        assert_eq!(OrderKind::from_prices(Some(1.0), None), OrderKind::Limit);
        assert_eq!(OrderKind::from_prices(None, Some(1.0)), OrderKind::Stop);
        assert_eq!(
            OrderKind::from_prices(Some(1.0), Some(2.0)),
            OrderKind::StopLimit
        );
        assert!(OrderKind::Stop.is_conditional());
        assert!(!OrderKind::Limit.is_conditional());
    }

    #[test]
    fn test_status_normalization() {
        assert_eq!(OrderStatus::from_venue_str("Filled"), Some(OrderStatus::Filled));
        assert_eq!(
            OrderStatus::from_venue_str("CANCELED"),
            Some(OrderStatus::Cancelled)
        );
        assert_eq!(OrderStatus::from_venue_str("Untriggered"), Some(OrderStatus::New));
        assert_eq!(OrderStatus::from_venue_str("bogus"), None);
        assert!(OrderStatus::Expired.is_terminal());
        assert!(!OrderStatus::PartiallyFilled.is_terminal());
    }

    #[test]
    fn test_intent_builder() {
        let intent = OrderIntent::new("TP", Side::Sell, 2.0)
            .limit(105.0)
            .reduce_only()
            .split(3, Duration::from_secs(1));

        assert_eq!(intent.kind(), OrderKind::Limit);
        assert_eq!(intent.split, 3);
        assert!(intent.reduce_only);
        assert_eq!(intent.effective_time_in_force(), TimeInForce::GoodTillCancel);

        // zero prices mean "not set"
        let intent = OrderIntent::new("E", Side::Buy, 1.0).limit(0.0).stop(0.0);
        assert_eq!(intent.kind(), OrderKind::Market);

        let intent = OrderIntent::new("E", Side::Buy, 1.0).chase(ChaseSettings::default());
        assert_eq!(intent.effective_time_in_force(), TimeInForce::PostOnly);
    }

    #[test]
    fn test_open_orders_prefix_match() {
        let order = |id: &str, class| OpenOrder {
            client_id: id.to_string(),
            side: Side::Sell,
            qty: 1.0,
            filled_qty: 0.0,
            limit_price: None,
            stop_price: None,
            class,
        };
        let orders = OpenOrders {
            active: vec![order("TP-1", OrderClass::Active), order("Long-2", OrderClass::Active)],
            conditional: vec![order("SL-3", OrderClass::Conditional)],
        };

        assert_eq!(orders.matching("TP", OrderFilter::Both).len(), 1);
        assert_eq!(orders.matching("SL", OrderFilter::ActiveOnly).len(), 0);
        assert_eq!(orders.matching("", OrderFilter::Both).len(), 3);
        assert_eq!(orders.matching("", OrderFilter::ConditionalOnly)[0].client_id, "SL-3");
    }

    #[test]
    fn test_bar_series_columns() {
        let t0 = DateTime::from_timestamp(0, 0).unwrap();
        let bars = vec![
            Bar { open_time: t0, open: 1.0, high: 2.0, low: 0.5, close: 1.5, volume: 10.0 },
            Bar {
                open_time: t0 + chrono::Duration::minutes(1),
                open: 1.5,
                high: 3.0,
                low: 1.0,
                close: 2.5,
                volume: 20.0,
            },
        ];
        let series = BarSeries::from_bars(&bars);
        assert_eq!(series.len(), 2);
        assert_eq!(series.close, vec![1.5, 2.5]);
        assert_eq!(series.volume, vec![10.0, 20.0]);
        assert_eq!(series.last_time(), Some(t0 + chrono::Duration::minutes(1)));
    }
}
