// Order lifecycle, chasing, positions and risk exits
pub mod exit_evaluator;
pub mod limit_chaser;
pub mod market_feed;
pub mod order_tracker;
pub mod position_tracker;
pub mod precision;
pub mod sltp;
pub mod split;
pub mod trader;

pub use exit_evaluator::{ExitDecision, ExitEvaluator, ExitPolicy, ExitTrigger, CLOSE_ID};
pub use limit_chaser::{ChaseSnapshot, LimitChaser};
pub use market_feed::{MarketFeed, Quote};
pub use order_tracker::{OrderEventOutcome, OrderTracker, TrackerSettings};
pub use position_tracker::{PositionChange, PositionSnapshot, PositionTracker};
pub use precision::Precision;
pub use sltp::{SltpActions, SltpEvaluator, SltpPolicy, STOP_LOSS_ID, TAKE_PROFIT_ID};
pub use split::SplitChain;
pub use trader::{OrderAction, Trader};
