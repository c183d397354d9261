/// REST API configuration.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Base URL every request path is appended to, without a trailing slash.
    pub base_url: String,
}

impl ApiConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }

    /// Read configuration from the environment, with a localhost fallback.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        let base_url = std::env::var("RALLY_API_URL")
            .unwrap_or_else(|_| "http://localhost:8080/api".into());
        Self { base_url }
    }
}
