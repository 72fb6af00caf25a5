//! Asynchronous request dispatch
//!
//! This module runs HTTP exchanges on a bounded pool and hands back results
//! that can be awaited, blocked on, or observed through callbacks.

mod dispatcher;
mod pending;
mod response;

// Re-export the public API
pub use dispatcher::{DEFAULT_WORKERS, Dispatcher};
pub use pending::{Outcome, PendingResult};
pub use response::{Body, Response};
