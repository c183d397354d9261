use thiserror::Error;

/// Failures reported through the `on_error` callback. Nothing in the
/// channel's public surface throws; callers are UI code that must not
/// crash on a dropped socket.
#[derive(Debug, Error)]
pub enum RealtimeError {
    #[error("connect failed: {0}")]
    Connect(String),
}
