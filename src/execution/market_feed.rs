use std::sync::RwLock;

use crate::models::{BookTicker, InstrumentTick, Side};

/// Latest top of book and last trade price
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Quote {
    pub best_bid: f64,
    pub best_ask: f64,
    pub bid_qty: f64,
    pub ask_qty: f64,
    pub last_price: f64,
    pub mark_price: f64,
}

/// Shared market snapshot
///
/// Written by the dispatch path only, read by the chase loops and evaluators.
#[derive(Debug, Default)]
pub struct MarketFeed {
    quote: RwLock<Quote>,
}

impl MarketFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_book(&self, book: &BookTicker) {
        let mut quote = self.quote.write().unwrap_or_else(|e| e.into_inner());
        quote.best_bid = book.best_bid;
        quote.best_ask = book.best_ask;
        quote.bid_qty = book.bid_qty;
        quote.ask_qty = book.ask_qty;
    }

    pub fn on_tick(&self, tick: &InstrumentTick) {
        let mut quote = self.quote.write().unwrap_or_else(|e| e.into_inner());
        quote.last_price = tick.last_price;
        if let Some(mark) = tick.mark_price {
            quote.mark_price = mark;
        }
    }

    pub fn quote(&self) -> Quote {
        *self.quote.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Price a passive order on `side` should rest at: best bid for buys, best ask for sells
    pub fn passive_price(&self, side: Side) -> f64 {
        let quote = self.quote();
        match side {
            Side::Buy => quote.best_bid,
            Side::Sell => quote.best_ask,
        }
    }

    pub fn last_price(&self) -> f64 {
        self.quote().last_price
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_passive_price_per_side() {
        let feed = MarketFeed::new();
        assert_eq!(feed.passive_price(Side::Buy), 0.0);

        feed.on_book(&BookTicker {
            best_bid: 99.5,
            best_ask: 100.5,
            bid_qty: 3.0,
            ask_qty: 4.0,
        });
        assert_eq!(feed.passive_price(Side::Buy), 99.5);
        assert_eq!(feed.passive_price(Side::Sell), 100.5);
    }

    #[test]
    fn test_tick_keeps_previous_mark() {
        let feed = MarketFeed::new();
        feed.on_tick(&InstrumentTick {
            last_price: 100.0,
            mark_price: Some(100.2),
        });
        feed.on_tick(&InstrumentTick {
            last_price: 101.0,
            mark_price: None,
        });
        let quote = feed.quote();
        assert_eq!(quote.last_price, 101.0);
        assert_eq!(quote.mark_price, 100.2);
    }
}
