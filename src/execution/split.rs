use std::time::Duration;

use super::precision::Precision;
use crate::models::{Completion, OrderIntent, Side, TimeInForce, TriggerPrice};

/// Order fields shared by every leg of a split
#[derive(Debug, Clone)]
struct LegTemplate {
    side: Side,
    limit: Option<f64>,
    stop: Option<f64>,
    post_only: bool,
    reduce_only: bool,
    trigger_by: TriggerPrice,
    time_in_force: Option<TimeInForce>,
}

/// Iceberg order: leg quantities plus the index of the next leg to send
///
/// The tracker owns the chain while a leg is resting and advances it when that
/// leg fills. Dropping the chain (leg cancelled, tracker halted) stops it.
pub struct SplitChain {
    prefix: String,
    legs: Vec<f64>,
    next: usize,
    interval: Duration,
    template: LegTemplate,
    on_complete: Option<Completion>,
}

impl SplitChain {
    /// Decompose `intent` into its first leg and the chain carrying the rest
    ///
    /// Each leg gets `qty / split` rounded to the lot size and the last leg takes
    /// the remainder. Returns the intent unchanged with no chain when it is not
    /// split or the legs would round to nothing.
    pub fn plan(mut intent: OrderIntent, precision: &Precision) -> (OrderIntent, Option<SplitChain>) {
        let split = intent.split;
        if split <= 1 {
            return (intent, None);
        }

        let sub_qty = precision.qty_floor(intent.qty / split as f64);
        if sub_qty <= 0.0 {
            tracing::warn!(
                "Split of {} x{} rounds to zero, sending a single order",
                intent.qty,
                split
            );
            intent.split = 1;
            return (intent, None);
        }

        let mut legs = vec![sub_qty; (split - 1) as usize];
        let last = precision.qty(intent.qty - sub_qty * (split - 1) as f64);
        legs.push(last);
        legs.retain(|q| *q > 0.0);

        let mut chain = SplitChain {
            prefix: intent.id.clone(),
            legs,
            next: 0,
            interval: intent.interval,
            template: LegTemplate {
                side: intent.side,
                limit: intent.limit,
                stop: intent.stop,
                post_only: intent.post_only,
                reduce_only: intent.reduce_only,
                trigger_by: intent.trigger_by,
                time_in_force: intent.time_in_force,
            },
            on_complete: intent.callback.take(),
        };

        match chain.next_leg() {
            Some(first) => (first, Some(chain)),
            None => (intent, None),
        }
    }

    /// Intent for the next leg, or None when every leg has been sent
    pub fn next_leg(&mut self) -> Option<OrderIntent> {
        let qty = *self.legs.get(self.next)?;
        let k = self.next + 1;
        self.next += 1;

        let t = &self.template;
        let mut intent = OrderIntent::new(format!("{}_sub{}", self.prefix, k), t.side, qty);
        intent.limit = t.limit;
        // only the first leg carries the stop
        intent.stop = if k == 1 { t.stop } else { None };
        intent.post_only = t.post_only;
        intent.reduce_only = t.reduce_only;
        intent.trigger_by = t.trigger_by;
        intent.time_in_force = t.time_in_force;
        Some(intent)
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn legs(&self) -> &[f64] {
        &self.legs
    }

    pub fn is_exhausted(&self) -> bool {
        self.next >= self.legs.len()
    }

    /// Quantity of the legs not sent yet
    pub fn pending_qty(&self) -> f64 {
        self.legs.iter().skip(self.next).sum()
    }

    /// Caller-supplied callback, handed out once the last leg filled
    pub fn take_completion(&mut self) -> Option<Completion> {
        self.on_complete.take()
    }
}

impl std::fmt::Debug for SplitChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SplitChain")
            .field("prefix", &self.prefix)
            .field("legs", &self.legs)
            .field("next", &self.next)
            .field("interval", &self.interval)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_splits_with_remainder() {
        let intent = OrderIntent::new("TP", Side::Sell, 1.0)
            .limit(105.0)
            .split(3, Duration::from_secs(2));

        let (first, chain) = SplitChain::plan(intent, &Precision::new(2, 2));
        let mut chain = chain.unwrap();

        assert_eq!(chain.legs(), &[0.33, 0.33, 0.34]);
        assert_eq!(first.id, "TP_sub1");
        assert_eq!(first.qty, 0.33);
        assert_eq!(first.limit, Some(105.0));
        assert_eq!(chain.interval(), Duration::from_secs(2));

        assert_eq!(chain.pending_qty(), 0.67);
        let second = chain.next_leg().unwrap();
        assert_eq!(second.id, "TP_sub2");
        let third = chain.next_leg().unwrap();
        assert_eq!(third.qty, 0.34);
        assert!(chain.next_leg().is_none());
        assert!(chain.is_exhausted());
    }

    #[test]
    fn test_legs_never_exceed_requested_qty() {
        // 0.011 / 7 rounds up to 0.002, which would overshoot by 0.001
        let intent = OrderIntent::new("E", Side::Buy, 0.011).split(7, Duration::ZERO);
        let (first, chain) = SplitChain::plan(intent, &Precision::new(2, 3));
        let chain = chain.unwrap();

        assert_eq!(first.qty, 0.001);
        assert_eq!(chain.legs().len(), 7);
        assert!(chain.legs().iter().all(|q| *q > 0.0));
        let total: f64 = chain.legs().iter().sum();
        assert_eq!(Precision::new(2, 3).qty(total), 0.011);
        assert_eq!(chain.legs()[6], 0.005);
    }

    #[test]
    fn test_stop_only_on_first_leg() {
        let intent = OrderIntent::new("SL", Side::Sell, 2.0)
            .stop(95.0)
            .split(2, Duration::ZERO);
        let (first, chain) = SplitChain::plan(intent, &Precision::default());
        assert_eq!(first.stop, Some(95.0));
        assert_eq!(chain.unwrap().next_leg().unwrap().stop, None);
    }

    #[test]
    fn test_unsplit_intent_passes_through() {
        let intent = OrderIntent::new("E", Side::Buy, 1.0).on_filled(|| {});
        let (first, chain) = SplitChain::plan(intent, &Precision::default());
        assert!(chain.is_none());
        assert_eq!(first.id, "E");
        assert!(first.callback.is_some());
    }

    #[test]
    fn test_split_rounding_to_zero_falls_back() {
        let intent = OrderIntent::new("E", Side::Buy, 1.0).split(4, Duration::ZERO);
        let (first, chain) = SplitChain::plan(intent, &Precision::new(2, 0));
        assert!(chain.is_none());
        assert_eq!(first.qty, 1.0);
        assert_eq!(first.split, 1);
    }

    #[test]
    fn test_completion_moves_to_chain() {
        let intent = OrderIntent::new("E", Side::Buy, 1.0)
            .split(2, Duration::ZERO)
            .on_filled(|| {});
        let (first, chain) = SplitChain::plan(intent, &Precision::default());
        assert!(first.callback.is_none());
        assert!(chain.unwrap().take_completion().is_some());
    }
}
