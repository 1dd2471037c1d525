//! Shared utilities: decimal arithmetic, the exchange clock, and the
//! process-wide shutdown signal.

pub mod clock;
pub mod decimal;
pub mod shutdown;

pub use clock::{Clock, ExchangeClock};
pub use shutdown::{Shutdown, ShutdownReason};
