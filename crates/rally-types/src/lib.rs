pub mod api;
pub mod events;
pub mod normalize;
pub mod session;

// Re-export key types for convenience.
pub use api::{Comment, Envelope, NotificationItem, RefreshData, UserSummary};
pub use events::{ClientFrame, ServerFrame, post_comments_topic, user_queue_topic};
pub use normalize::{IdKey, identity_of, unwrap_envelope};
pub use session::{Session, SessionStore};
