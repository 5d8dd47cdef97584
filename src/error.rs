use thiserror::Error;

use crate::gateway::GatewayError;

/// Errors surfaced by the execution core
#[derive(Error, Debug)]
pub enum CoreError {
    /// Order rejected synchronously. Callers should not blindly retry.
    #[error("Order placement failed: {0}")]
    Placement(String),

    /// Amend target missing or not amendable
    #[error("Amend failed: {0}")]
    Amend(String),

    /// Nothing matched a cancel request
    #[error("Nothing to cancel: {0}")]
    CancelMiss(String),

    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    /// Raised by a strategy to stop the bot
    #[error("Fatal strategy error: {0}")]
    FatalStrategy(String),

    /// The core stopped issuing orders after a fatal error
    #[error("Trading halted")]
    Halted,

    #[error("Invalid timeframe: {0}")]
    InvalidTimeframe(String),

    /// Venue payload missing an expected field or carrying nonsense
    #[error("Malformed update: {0}")]
    Malformed(String),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

pub type Result<T> = std::result::Result<T, CoreError>;
