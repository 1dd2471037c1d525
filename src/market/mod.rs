//! Market keepers: live slot prices and the account wallet view.
//!
//! Both run as long-lived tasks, count consecutive failures, and escalate
//! to a fatal shutdown when a limit is reached.

mod error;
mod price_feed;
mod wallet_sync;

pub use error::FeedError;
pub use price_feed::PriceFeedKeeper;
pub use wallet_sync::WalletSync;
