pub mod client;
pub mod config;
pub mod error;

pub use client::{ApiClient, AuthEvent, PUBLIC_PATHS, REFRESH_PATH};
pub use config::ApiConfig;
pub use error::ApiError;
