//! # Runtime
//!
//! Process wiring around the reconciler.
//!
//! - `initialization`: tracing, metrics, probe server, client and reconciler setup
//! - `watch`: watch streams mapping cluster changes to queue keys
//! - `workers`: the worker pool draining the queue
//! - `error_policy`: requeue decisions after each reconciliation
//! - `shutdown`: SIGTERM and SIGINT handling

pub mod error_policy;
pub mod initialization;
pub mod shutdown;
pub mod watch;
pub mod workers;

pub use error_policy::{handle_result, QueueAction};
pub use initialization::{initialize, InitializationResult};
pub use shutdown::shutdown_signal;
pub use watch::{run_watchers, ResourceIndex};
pub use workers::{process_key, run_workers};
