use thiserror::Error;

/// Conditions that stop a market keeper and shut the process down.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FeedError {
    #[error("price subscription failed {failures} times in a row: {last}")]
    SendExhausted { failures: u32, last: String },

    #[error("price receive failed {failures} times in a row: {last}")]
    ReceiveExhausted { failures: u32, last: String },

    #[error("wallet refresh failed {failures} times in a row: {last}")]
    WalletExhausted { failures: u32, last: String },

    /// The exchange rejected the account request outright (e.g. bad keys).
    #[error("wallet refresh rejected by exchange: {0}")]
    WalletRejected(String),
}
