//! Error types for the signal auto-trader

use thiserror::Error;

/// Result type alias using our custom Error
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // Signal errors
    #[error("Invalid signal: {0}")]
    InvalidSignal(String),

    #[error("Signal row {row}: {reason}")]
    SignalRow { row: usize, reason: String },

    // Ladder errors
    #[error("Event at {event} precedes last processed event at {last}")]
    OutOfOrderEvent {
        event: chrono::DateTime<chrono::Utc>,
        last: chrono::DateTime<chrono::Utc>,
    },

    // Broker errors
    #[error("Broker API error: {0}")]
    Broker(String),

    #[error("Broker returned HTTP {status}: {body}")]
    BrokerStatus { status: u16, body: String },

    #[error("Unknown symbol: {0}")]
    UnknownSymbol(String),

    #[error("Order quantity rounds to zero for {symbol} (step {step_size})")]
    ZeroQuantity { symbol: String, step_size: f64 },

    /// The entry filled but at least one protective order could not be placed.
    /// The position is live on the exchange without full protection.
    #[error("POSITION OPEN WITHOUT PROTECTION on {symbol}: {detail}")]
    UnprotectedPosition { symbol: String, detail: String },

    // Wrapped library errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Errors worth retrying on the next poll rather than giving up.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Http(_) => true,
            Error::BrokerStatus { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}
