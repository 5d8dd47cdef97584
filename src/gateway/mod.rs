pub mod paper;
pub mod product;
pub mod retry;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::models::{
    AmendField, ExchangeEvent, OpenOrders, Order, OrderClass, OrderFilter, Position, Timeframe,
    WalletBalance,
};

pub use paper::PaperGateway;
pub use product::{Product, ProductRules};
pub use retry::{Backoff, RetryPolicy, RetryingGateway};

/// Failures at the venue seam
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GatewayError {
    /// Network failure, timeout or rate limit. Safe to retry.
    #[error("Transient gateway failure: {0}")]
    Transient(String),

    #[error("Rejected by venue: {0}")]
    Rejected(String),

    #[error("Order not found: {0}")]
    NotFound(String),

    #[error("Not supported for {product}: {operation}")]
    Unsupported {
        product: Product,
        operation: &'static str,
    },

    #[error("Malformed venue response: {0}")]
    Malformed(String),
}

impl GatewayError {
    pub fn is_transient(&self) -> bool {
        matches!(self, GatewayError::Transient(_))
    }
}

/// Streams the core subscribes to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Instrument,
    BookTicker,
    Wallet,
    Position,
    Execution,
    Order,
    Kline(Timeframe),
}

/// Venue capability interface
///
/// One implementation per venue connection. Wire formats, signing and
/// reconnection live behind this trait; the core only sees normalized
/// models and events.
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    fn product(&self) -> Product;

    async fn place_order(&self, order: &Order) -> Result<(), GatewayError>;

    /// Change exactly one field of a resting order
    async fn amend_order(
        &self,
        client_id: &str,
        class: OrderClass,
        field: AmendField,
    ) -> Result<(), GatewayError>;

    /// Fails with `NotFound` when nothing with that id is open
    async fn cancel_order(&self, client_id: &str, class: OrderClass) -> Result<(), GatewayError>;

    async fn cancel_all(&self, filter: OrderFilter) -> Result<(), GatewayError>;

    async fn open_orders(&self, filter: OrderFilter) -> Result<OpenOrders, GatewayError>;

    async fn position(&self) -> Result<Position, GatewayError>;

    async fn balance(&self) -> Result<WalletBalance, GatewayError>;

    /// Open the push stream. Events arrive in venue delivery order.
    async fn subscribe(&self, topics: &[Topic])
        -> Result<mpsc::Receiver<ExchangeEvent>, GatewayError>;
}
