//! # Configuration
//!
//! Controller configuration loaded from environment variables.
//!
//! - `controller`: reconciliation, refresh budget and backoff settings

pub mod controller;

pub use controller::{ControllerConfig, LogFormat, SharedControllerConfig};
