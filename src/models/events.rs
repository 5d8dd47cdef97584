use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Bar, OrderStatus, Side, Timeframe, TimeInForce};

/// Normalized venue push, delivered in order on a single channel
#[derive(Debug, Clone, PartialEq)]
pub enum ExchangeEvent {
    InstrumentTick(InstrumentTick),
    BookTicker(BookTicker),
    Wallet(WalletUpdate),
    Position(PositionUpdate),
    Execution(ExecutionFill),
    OrderStatus(OrderUpdate),
    Kline(KlineUpdate),
}

impl ExchangeEvent {
    pub fn topic(&self) -> &'static str {
        match self {
            ExchangeEvent::InstrumentTick(_) => "instrument",
            ExchangeEvent::BookTicker(_) => "bookticker",
            ExchangeEvent::Wallet(_) => "wallet",
            ExchangeEvent::Position(_) => "position",
            ExchangeEvent::Execution(_) => "execution",
            ExchangeEvent::OrderStatus(_) => "order",
            ExchangeEvent::Kline(_) => "kline",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct InstrumentTick {
    pub last_price: f64,
    pub mark_price: Option<f64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct BookTicker {
    pub best_bid: f64,
    pub best_ask: f64,
    pub bid_qty: f64,
    pub ask_qty: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct WalletBalance {
    pub total: f64,
    pub available: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WalletUpdate {
    pub coin: String,
    pub balance: WalletBalance,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PositionUpdate {
    pub size: f64,
    pub entry_price: f64,
    pub liq_price: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionFill {
    pub client_id: String,
    pub side: Side,
    pub price: f64,
    pub qty: f64,
    pub fee: f64,
    pub time: DateTime<Utc>,
}

/// Order-status push. `status` is already normalized.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderUpdate {
    pub client_id: String,
    pub side: Side,
    pub status: OrderStatus,
    pub qty: f64,
    pub filled_qty: f64,
    pub limit_price: Option<f64>,
    pub stop_price: Option<f64>,
    pub time_in_force: TimeInForce,
}

impl OrderUpdate {
    /// A stop order the venue reports as expired without a fill has triggered
    pub fn is_triggered_conditional(&self) -> bool {
        self.status == OrderStatus::Expired
            && self.stop_price.is_some_and(|p| p > 0.0)
            && self.time_in_force == TimeInForce::GoodTillCancel
            && self.filled_qty == 0.0
    }
}

/// Source-resolution kline update, possibly for a still-open bucket
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct KlineUpdate {
    pub source: Timeframe,
    pub bar: Bar,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(status: OrderStatus, stop: Option<f64>, filled: f64) -> OrderUpdate {
        OrderUpdate {
            client_id: "SL-1-abc".to_string(),
            side: Side::Sell,
            status,
            qty: 1.0,
            filled_qty: filled,
            limit_price: None,
            stop_price: stop,
            time_in_force: TimeInForce::GoodTillCancel,
        }
    }

    #[test]
    fn test_triggered_conditional_detection() {
        assert!(update(OrderStatus::Expired, Some(95.0), 0.0).is_triggered_conditional());
        assert!(!update(OrderStatus::Expired, None, 0.0).is_triggered_conditional());
        assert!(!update(OrderStatus::Expired, Some(95.0), 0.5).is_triggered_conditional());
        assert!(!update(OrderStatus::Cancelled, Some(95.0), 0.0).is_triggered_conditional());
    }
}
