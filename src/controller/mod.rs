//! # Controller
//!
//! Core controller modules for the pod refresher.
//!
//! - `backoff`: Fibonacci and exponential backoff for retries
//! - `fingerprint`: Certificate secret fingerprints
//! - `queue`: Deduplicating, rate-limited reconcile queue
//! - `refresh`: Pod refresh executor
//! - `reconciler`: Core reconciliation logic

pub mod backoff;
pub mod fingerprint;
pub mod queue;
pub mod reconciler;
pub mod refresh;
