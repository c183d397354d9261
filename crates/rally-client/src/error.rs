use rally_types::Envelope;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    /// Non-2xx status other than a refreshable 401. The envelope, when the
    /// body parsed as one, carries the backend's message for the caller.
    #[error("request failed with status {status}")]
    Status {
        status: u16,
        envelope: Option<Envelope>,
    },

    /// Terminal 401: the refresh endpoint itself rejected us, or a request
    /// that was already replayed once got a second 401.
    #[error("unauthorized")]
    Unauthorized,

    /// The single-flight token refresh failed; the session has been cleared.
    #[error("token refresh failed: {0}")]
    RefreshFailed(String),

    /// Network-level failure, propagated unchanged. No retry at this layer.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
}
