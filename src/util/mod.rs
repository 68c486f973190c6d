//! Process plumbing for the `flowpay` binary.
//!
//! - [`shutdown`] - Graceful shutdown signal handling
//! - [`telemetry`] - Log subscriber setup

pub mod shutdown;
pub mod telemetry;

pub use shutdown::*;
pub use telemetry::*;
