// src/error.rs
use thiserror::Error;

/// Failures reported by an exchange binding.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ExchangeError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("order rejected: {reason}")]
    OrderRejected { code: Option<i64>, reason: String },

    #[error("unexpected exchange response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for ExchangeError {
    fn from(e: reqwest::Error) -> Self {
        ExchangeError::Network(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ExchangeError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        ExchangeError::Network(e.to_string())
    }
}

impl From<serde_json::Error> for ExchangeError {
    fn from(e: serde_json::Error) -> Self {
        ExchangeError::Decode(e.to_string())
    }
}

impl From<rust_decimal::Error> for ExchangeError {
    fn from(e: rust_decimal::Error) -> Self {
        ExchangeError::Decode(e.to_string())
    }
}

/// Failures surfaced by the connectivity manager to the trading loop.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConnectivityError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("network error: {0}")]
    Network(String),

    /// The price stream ended. Retried like a network failure.
    #[error("market data stream closed")]
    StreamClosed,

    #[error("order rejected: {0}")]
    OrderRejected(String),

    /// Transport failed mid-order, the connection came back and the exchange
    /// has no record of the order.
    #[error("order not executed: {0}")]
    OrderFailed(String),

    #[error("reconnection attempts exhausted after {attempts} tries: {last}")]
    RetryExhausted { attempts: u32, last: String },
}

impl ConnectivityError {
    /// Per-order failures that leave the position untouched and the
    /// connection usable. Everything else ends the run.
    pub fn is_order_recoverable(&self) -> bool {
        matches!(
            self,
            ConnectivityError::OrderRejected(_) | ConnectivityError::OrderFailed(_)
        )
    }
}

impl From<ExchangeError> for ConnectivityError {
    fn from(e: ExchangeError) -> Self {
        match e {
            ExchangeError::Auth(msg) => ConnectivityError::Auth(msg),
            ExchangeError::Network(msg) => ConnectivityError::Network(msg),
            ExchangeError::OrderRejected { reason, .. } => ConnectivityError::OrderRejected(reason),
            ExchangeError::Decode(msg) => ConnectivityError::Network(msg),
        }
    }
}

/// Position state violations. Any of these aborts the run.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TrackerError {
    #[error("fill for order {0} was already applied")]
    DuplicateFill(String),

    #[error("sell fill for order {0} while flat")]
    SellWhileFlat(String),

    #[error("sell fill for order {order_id} exceeds held quantity {held}")]
    Oversell {
        order_id: String,
        held: rust_decimal::Decimal,
    },

    #[error("fill for order {0} has non-positive price or quantity")]
    InvalidFill(String),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Connectivity(#[from] ConnectivityError),

    #[error(transparent)]
    Tracker(#[from] TrackerError),

    #[error("state store error: {0}")]
    Storage(#[from] std::io::Error),
}
