pub mod channel;
pub mod config;
pub mod error;
mod socket;

pub use channel::{RealtimeChannel, Unsubscribe};
pub use config::RealtimeConfig;
pub use error::RealtimeError;
