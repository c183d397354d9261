use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Frames sent FROM the client TO the realtime endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ClientFrame {
    /// Start receiving messages for a topic
    Subscribe { topic: String },

    /// Stop receiving messages for a topic
    Unsubscribe { topic: String },

    /// Fire-and-forget publish to a topic
    Publish { topic: String, body: Value },
}

/// Frames sent FROM the realtime endpoint TO the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ServerFrame {
    /// Connection authenticated and ready
    Ready,

    /// A message pushed on a subscribed topic. The body may arrive bare or
    /// wrapped in a `{success, data}` envelope; normalization happens on
    /// the client before dispatch.
    Message { topic: String, body: Value },

    /// Server-reported error, informational only
    Error { message: String },
}

/// Broadcast topic for new comments on a post.
pub fn post_comments_topic(post_id: i64) -> String {
    format!("/topic/posts/{post_id}/comments")
}

/// Per-user targeted queue (e.g. `notifications`), scoped to the
/// authenticated principal by the server.
pub fn user_queue_topic(name: &str) -> String {
    format!("/user/queue/{name}")
}
