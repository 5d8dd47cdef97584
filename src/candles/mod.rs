pub mod aggregator;
pub mod resample;
pub mod validator;

pub use aggregator::{AggregatorSettings, BarClose, CandleAggregator, TimeframeBuffer, TimeframeOrder};
pub use resample::resample;
pub use validator::BarValidator;
