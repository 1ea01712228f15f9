//! Request handlers for sync operations.

mod pull;
mod push;

pub use pull::*;
pub use push::*;

/// Server time in milliseconds since epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
