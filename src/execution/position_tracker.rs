use std::sync::{Mutex, MutexGuard};

use super::precision::Precision;
use crate::error::Result;
use crate::gateway::ExchangeGateway;
use crate::models::{Position, PositionUpdate, WalletBalance};

/// Point-in-time view used by the evaluators
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PositionSnapshot {
    pub position: Position,
    pub market_price: f64,
    /// Best price seen since the position last changed size
    pub trail_price: f64,
    pub balance: WalletBalance,
}

/// Result of applying a venue position push
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionChange {
    pub previous: Position,
    pub current: Position,
}

impl PositionChange {
    pub fn size_changed(&self) -> bool {
        self.previous.size != self.current.size
    }
}

#[derive(Debug, Default)]
struct Inner {
    position: Position,
    market_price: f64,
    trail_price: f64,
    balance: WalletBalance,
}

/// Local cache of the venue position, market price and trailing water-mark
pub struct PositionTracker {
    inner: Mutex<Inner>,
    commission: f64,
    qty_in_quote: bool,
    precision: Precision,
}

impl PositionTracker {
    /// # Arguments
    /// * `commission` - Taker fee rate deducted from the close rate (0.00075 = 0.075%)
    /// * `qty_in_quote` - Position size is counted in quote currency (inverse contracts)
    pub fn new(commission: f64, qty_in_quote: bool, precision: Precision) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            commission,
            qty_in_quote,
            precision,
        }
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Apply a venue position push
    ///
    /// A size change to a non-zero size restarts the trailing water-mark at the
    /// current market price.
    pub fn on_position(&self, update: &PositionUpdate) -> PositionChange {
        let mut inner = self.inner();
        let previous = inner.position;
        let current = Position {
            size: update.size,
            entry_price: update.entry_price,
            liquidation_price: update.liq_price,
        };

        if previous.size != current.size {
            inner.trail_price = if current.size != 0.0 {
                inner.market_price
            } else {
                0.0
            };
            tracing::info!(
                "Updated position: entry {} => {}, size {} => {}, liq {} => {}, balance {:.2}",
                previous.entry_price,
                current.entry_price,
                previous.size,
                current.size,
                previous.liquidation_price,
                current.liquidation_price,
                inner.balance.total
            );
        }

        inner.position = current;
        PositionChange { previous, current }
    }

    /// Record a trade price and move the water-mark when it improves
    pub fn on_price(&self, price: f64) {
        if price <= 0.0 {
            return;
        }
        let mut inner = self.inner();
        inner.market_price = price;

        let size = inner.position.size;
        if size > 0.0 && price > inner.trail_price {
            inner.trail_price = price;
        } else if size < 0.0 && (inner.trail_price == 0.0 || price < inner.trail_price) {
            inner.trail_price = price;
        }
    }

    pub fn on_wallet(&self, balance: WalletBalance) {
        self.inner().balance = balance;
    }

    pub fn position(&self) -> Position {
        self.inner().position
    }

    pub fn size(&self) -> f64 {
        self.inner().position.size
    }

    pub fn market_price(&self) -> f64 {
        self.inner().market_price
    }

    pub fn trail_price(&self) -> f64 {
        self.inner().trail_price
    }

    pub fn snapshot(&self) -> PositionSnapshot {
        let inner = self.inner();
        PositionSnapshot {
            position: inner.position,
            market_price: inner.market_price,
            trail_price: inner.trail_price,
            balance: inner.balance,
        }
    }

    /// Unrealized profit at `close` (market price when None), net of commission
    pub fn profit(&self, close: Option<f64>) -> f64 {
        let snapshot = self.snapshot();
        let close = close.unwrap_or(snapshot.market_price);
        self.profit_at(&snapshot.position, close)
    }

    pub fn profit_at(&self, position: &Position, close: f64) -> f64 {
        let entry = position.entry_price;
        if entry <= 0.0 || position.size == 0.0 {
            return 0.0;
        }

        let rate = if position.size > 0.0 {
            (close - entry) / entry - self.commission
        } else {
            (entry - close) / entry - self.commission
        };
        let scale = if self.qty_in_quote { 1.0 } else { entry };

        self.precision.price(position.size.abs() * rate * scale)
    }

    /// Unrealized profit as a percentage of wallet balance
    pub fn pnl_pct(&self) -> f64 {
        let balance = self.inner().balance.total;
        if balance <= 0.0 {
            return 0.0;
        }
        self.profit(None) * 100.0 / balance
    }

    /// Pull position and balance from the venue (startup and resync)
    pub async fn reconcile(&self, gateway: &dyn ExchangeGateway) -> Result<PositionChange> {
        let position = gateway.position().await?;
        let balance = gateway.balance().await?;

        self.on_wallet(balance);
        let change = self.on_position(&PositionUpdate {
            size: position.size,
            entry_price: position.entry_price,
            liq_price: position.liquidation_price,
        });

        tracing::info!(
            "Reconciled position: size {}, entry {}, balance {:.2}",
            position.size,
            position.entry_price,
            balance.total
        );
        Ok(change)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{PaperGateway, Product};

    fn tracker() -> PositionTracker {
        PositionTracker::new(0.00075, false, Precision::new(2, 3))
    }

    fn update(size: f64, entry: f64) -> PositionUpdate {
        PositionUpdate {
            size,
            entry_price: entry,
            liq_price: 0.0,
        }
    }

    #[test]
    fn test_size_change_resets_trail() {
        let tracker = tracker();
        tracker.on_price(100.0);
        tracker.on_position(&update(1.0, 100.0));
        assert_eq!(tracker.trail_price(), 100.0);

        tracker.on_price(110.0);
        assert_eq!(tracker.trail_price(), 110.0);
        // adverse move leaves the water-mark
        tracker.on_price(105.0);
        assert_eq!(tracker.trail_price(), 110.0);

        // same size: no reset
        let change = tracker.on_position(&update(1.0, 100.0));
        assert!(!change.size_changed());
        assert_eq!(tracker.trail_price(), 110.0);

        // added to position: restart from market
        tracker.on_position(&update(2.0, 102.5));
        assert_eq!(tracker.trail_price(), 105.0);

        tracker.on_position(&update(0.0, 0.0));
        assert_eq!(tracker.trail_price(), 0.0);
    }

    #[test]
    fn test_short_trail_moves_down() {
        let tracker = tracker();
        tracker.on_price(100.0);
        tracker.on_position(&update(-1.0, 100.0));
        tracker.on_price(95.0);
        tracker.on_price(97.0);
        assert_eq!(tracker.trail_price(), 95.0);
    }

    #[test]
    fn test_profit_long_and_short() {
        let tracker = tracker();
        tracker.on_position(&update(2.0, 100.0));
        // 2 * (0.1 - 0.00075) * 100
        assert_eq!(tracker.profit(Some(110.0)), 19.85);

        tracker.on_position(&update(-2.0, 100.0));
        assert_eq!(tracker.profit(Some(90.0)), 19.85);
        assert!(tracker.profit(Some(110.0)) < 0.0);
    }

    #[test]
    fn test_profit_quote_denominated() {
        let tracker = PositionTracker::new(0.0, true, Precision::new(4, 0));
        tracker.on_position(&update(1000.0, 20000.0));
        // 1000 * 0.05
        assert_eq!(tracker.profit(Some(21000.0)), 50.0);
    }

    #[test]
    fn test_pnl_pct_uses_balance() {
        let tracker = PositionTracker::new(0.0, false, Precision::new(2, 3));
        tracker.on_wallet(WalletBalance {
            total: 1000.0,
            available: 1000.0,
        });
        tracker.on_position(&update(1.0, 100.0));
        tracker.on_price(110.0);
        assert_eq!(tracker.pnl_pct(), 1.0);
    }

    #[tokio::test]
    async fn test_reconcile_pulls_venue_state() {
        let paper = PaperGateway::new(Product::Linear, "BTCUSDT");
        paper.set_position(-0.5, 25000.0);

        let tracker = tracker();
        let change = tracker.reconcile(&paper).await.unwrap();
        assert!(change.size_changed());
        assert_eq!(tracker.size(), -0.5);
        assert_eq!(tracker.snapshot().balance.total, 10_000.0);
    }
}
