//! Environment-driven configuration for the sync service.

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_path: String,
    pub base_url: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    /// Delay between page fetches, to respect source rate limits.
    pub page_delay_seconds: u64,
    pub max_pages: u64,
    pub poll_interval_seconds: u64,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            database_path: std::env::var("DATABASE_PATH")
                .unwrap_or_else(|_| "./lotsync.db".to_string()),
            base_url: std::env::var("LOTSYNC_BASE_URL")
                .unwrap_or_else(|_| "https://vendor.example".to_string()),
            user_agent: std::env::var("LOTSYNC_USER_AGENT")
                .unwrap_or_else(|_| "lotsync-bot/0.1".to_string()),
            http_timeout_secs: env_u64("LOTSYNC_HTTP_TIMEOUT_SECS", 20),
            page_delay_seconds: env_u64("LOTSYNC_PAGE_DELAY_SECS", 2),
            max_pages: env_u64("LOTSYNC_MAX_PAGES", 50),
            poll_interval_seconds: env_u64("LOTSYNC_POLL_INTERVAL_SECS", 60),
        }
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
