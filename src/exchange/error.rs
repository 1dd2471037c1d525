//! Errors surfaced by exchange collaborators.

use thiserror::Error;

/// Failures from the REST client, order placement, or the live feed.
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// Transport-level failure (connect, timeout, TLS).
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// HTTP 429 persisted through every retry.
    #[error("rate limited on {endpoint} after {attempts} attempts")]
    RateLimited { endpoint: String, attempts: u32 },

    /// Non-success status without a parseable error body.
    #[error("unexpected HTTP status {status} from {endpoint}")]
    Status { endpoint: String, status: u16 },

    /// Error payload reported by the exchange (e.g. order rejected).
    #[error("exchange error {name}: {message}")]
    Api { name: String, message: String },

    /// Fewer bars than requested; the symbol is skipped for the cycle.
    #[error("insufficient history: requested {requested}, received {received}")]
    InsufficientHistory { requested: usize, received: usize },

    /// Order side outside of bid/ask.
    #[error("invalid order side '{0}', expected 'bid' or 'ask'")]
    InvalidOrderSide(String),

    #[error("failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),

    /// WebSocket send/receive failure.
    #[error("websocket error: {0}")]
    WebSocket(String),

    #[error("websocket is not connected")]
    NotConnected,
}

impl ExchangeError {
    /// Whether a retry of the same request could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ExchangeError::Http(_)
                | ExchangeError::RateLimited { .. }
                | ExchangeError::Status { .. }
                | ExchangeError::Decode(_)
                | ExchangeError::WebSocket(_)
                | ExchangeError::NotConnected
        )
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ExchangeError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        ExchangeError::WebSocket(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let api = ExchangeError::Api {
            name: "insufficient_funds_bid".to_string(),
            message: "not enough KRW".to_string(),
        };
        assert!(!api.is_transient());
        assert!(!ExchangeError::InvalidOrderSide("buy".to_string()).is_transient());
        assert!(ExchangeError::RateLimited {
            endpoint: "/v1/accounts".to_string(),
            attempts: 5
        }
        .is_transient());
    }
}
