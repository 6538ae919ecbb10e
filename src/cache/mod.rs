//! In-memory token caching.
//!
//! Both the managed identity tokens and the application tokens live in a
//! [`TokenCache`], swept periodically by a background task.

pub mod cleanup;
pub mod store;

pub use cleanup::{spawn_cleanup_task, Sweep, DEFAULT_CLEANUP_INTERVAL_SECS};
pub use store::TokenCache;
