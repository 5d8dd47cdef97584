use async_trait::async_trait;
use governor::{Quota, RateLimiter};
use rand::Rng;
use serde::Deserialize;
use std::future::Future;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use super::{ExchangeGateway, GatewayError, Product, Topic};
use crate::models::{
    AmendField, ExchangeEvent, OpenOrders, Order, OrderClass, OrderFilter, Position,
    WalletBalance,
};

type VenueRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    #[default]
    Exponential,
    Fixed,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff: Backoff,
    pub requests_per_second: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            backoff: Backoff::Exponential,
            requests_per_second: 10,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based), without jitter
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = match self.backoff {
            Backoff::Fixed => self.base_delay,
            Backoff::Exponential => {
                let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
                self.base_delay.saturating_mul(factor)
            }
        };
        delay.min(self.max_delay)
    }

    fn jittered(&self, attempt: u32) -> Duration {
        let delay = self.delay_for(attempt);
        let spread = (delay.as_millis() as u64) / 10;
        if spread == 0 {
            return delay;
        }
        let jitter = rand::thread_rng().gen_range(0..=spread);
        delay + Duration::from_millis(jitter)
    }
}

/// Rate-limited bounded-retry wrapper around a venue gateway
///
/// Only `GatewayError::Transient` is retried. Everything the core sees from
/// here is the final outcome.
pub struct RetryingGateway {
    inner: Arc<dyn ExchangeGateway>,
    policy: RetryPolicy,
    rate_limiter: Arc<VenueRateLimiter>,
}

impl RetryingGateway {
    pub fn new(inner: Arc<dyn ExchangeGateway>, policy: RetryPolicy) -> Self {
        let rps = NonZeroU32::new(policy.requests_per_second).unwrap_or(NonZeroU32::MIN);
        let rate_limiter = Arc::new(RateLimiter::direct(Quota::per_second(rps)));

        Self {
            inner,
            policy,
            rate_limiter,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    async fn with_retry<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T, GatewayError>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, GatewayError>> + Send,
        T: Send,
    {
        let max_attempts = self.policy.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            self.rate_limiter.until_ready().await;

            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let delay = self.policy.jittered(attempt);
                    tracing::warn!(
                        "{} failed: {}, retrying in {:?} (attempt {}/{})",
                        operation,
                        e,
                        delay,
                        attempt,
                        max_attempts
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    if e.is_transient() {
                        tracing::error!(
                            "{} failed after {} attempts: {}",
                            operation,
                            max_attempts,
                            e
                        );
                    }
                    return Err(e);
                }
            }
        }

        Err(GatewayError::Transient(format!(
            "{} failed after {} attempts",
            operation, max_attempts
        )))
    }
}

#[async_trait]
impl ExchangeGateway for RetryingGateway {
    fn product(&self) -> Product {
        self.inner.product()
    }

    async fn place_order(&self, order: &Order) -> Result<(), GatewayError> {
        self.with_retry("place_order", || self.inner.place_order(order))
            .await
    }

    async fn amend_order(
        &self,
        client_id: &str,
        class: OrderClass,
        field: AmendField,
    ) -> Result<(), GatewayError> {
        self.with_retry("amend_order", || {
            self.inner.amend_order(client_id, class, field)
        })
        .await
    }

    async fn cancel_order(&self, client_id: &str, class: OrderClass) -> Result<(), GatewayError> {
        self.with_retry("cancel_order", || self.inner.cancel_order(client_id, class))
            .await
    }

    async fn cancel_all(&self, filter: OrderFilter) -> Result<(), GatewayError> {
        self.with_retry("cancel_all", || self.inner.cancel_all(filter))
            .await
    }

    async fn open_orders(&self, filter: OrderFilter) -> Result<OpenOrders, GatewayError> {
        self.with_retry("open_orders", || self.inner.open_orders(filter))
            .await
    }

    async fn position(&self) -> Result<Position, GatewayError> {
        self.with_retry("position", || self.inner.position()).await
    }

    async fn balance(&self) -> Result<WalletBalance, GatewayError> {
        self.with_retry("balance", || self.inner.balance()).await
    }

    async fn subscribe(
        &self,
        topics: &[Topic],
    ) -> Result<mpsc::Receiver<ExchangeEvent>, GatewayError> {
        self.with_retry("subscribe", || self.inner.subscribe(topics))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::paper::{GatewayCall, PaperGateway};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            backoff: Backoff::Exponential,
            requests_per_second: 1000,
        }
    }

    #[test]
    fn test_exponential_delay_capped() {
        let policy = fast_policy(10);
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(8), Duration::from_secs(1));
    }

    #[test]
    fn test_fixed_delay() {
        let policy = RetryPolicy {
            backoff: Backoff::Fixed,
            ..fast_policy(3)
        };
        assert_eq!(policy.delay_for(1), policy.delay_for(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_absorbed() {
        let paper = Arc::new(PaperGateway::new(Product::Linear, "BTCUSDT"));
        paper.fail_next(GatewayError::Transient("timeout".into()));
        paper.fail_next(GatewayError::Transient("429".into()));

        let gateway = RetryingGateway::new(paper.clone(), fast_policy(3));
        let position = gateway.position().await;
        assert!(position.is_ok());
        assert_eq!(
            paper
                .calls()
                .iter()
                .filter(|c| matches!(c, GatewayCall::Position))
                .count(),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let paper = Arc::new(PaperGateway::new(Product::Linear, "BTCUSDT"));
        for _ in 0..3 {
            paper.fail_next(GatewayError::Transient("timeout".into()));
        }

        let gateway = RetryingGateway::new(paper.clone(), fast_policy(2));
        let err = gateway.balance().await.unwrap_err();
        assert!(err.is_transient());
        // one injected failure left over
        assert_eq!(paper.pending_failures(), 1);
    }

    #[tokio::test]
    async fn test_rejection_not_retried() {
        let paper = Arc::new(PaperGateway::new(Product::Linear, "BTCUSDT"));
        paper.fail_next(GatewayError::Rejected("insufficient margin".into()));
        paper.fail_next(GatewayError::Transient("unused".into()));

        let gateway = RetryingGateway::new(paper.clone(), fast_policy(3));
        let err = gateway.position().await.unwrap_err();
        assert_eq!(err, GatewayError::Rejected("insufficient margin".into()));
        assert_eq!(paper.pending_failures(), 1);
    }
}
