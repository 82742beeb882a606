//! # ciccni Common
//!
//! Shared utilities for the ciccni agent binaries.
//!
//! ## Logging
//!
//! ```rust
//! // Initialize with level
//! ciccni_common::init_logging("info").unwrap();
//! ```

pub mod logging;

// Re-export logging functions
pub use logging::{init_logging, init_logging_json, TimedOperation};
