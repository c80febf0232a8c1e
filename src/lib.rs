//! Recheck library crate
//!
//! Exposes core modules so benchmarks and external tooling can exercise
//! internal performance-critical paths without going through CLI startup.

pub mod analyze;
pub mod assistant;
pub mod cache;
pub mod config;
pub mod error;
pub mod fix;
pub mod imports;
pub mod learn;
pub mod logging;
pub mod testing;
pub mod util;
