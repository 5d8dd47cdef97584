// Core modules
pub mod candles;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod execution;
pub mod gateway;
pub mod models;
pub mod notify;
pub mod strategy;

// Re-export commonly used types
pub use config::AppConfig;
pub use engine::{Engine, RunOutcome, ShutdownHandle};
pub use models::*;
pub use strategy::Strategy;

// Error handling
pub use error::{CoreError, Result};
