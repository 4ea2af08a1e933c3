use std::time::Duration;

fn usize_env(name: &str, default: usize) -> usize {
    std::env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn millis_env(name: &str, default: u64) -> Duration {
    Duration::from_millis(std::env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default))
}

/// Per-session engine tuning.
#[derive(Clone, Debug)]
pub struct ChatConfig {
    pub typing_debounce: Duration,
    pub typing_display_timeout: Duration,
    pub message_page_limit: Option<usize>,
    pub feed_capacity: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            typing_debounce: Duration::from_secs(2),
            typing_display_timeout: Duration::from_secs(3),
            message_page_limit: None,
            feed_capacity: 256,
        }
    }
}

impl ChatConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        let page = usize_env("CHAT_MESSAGE_PAGE_LIMIT", 0);
        Self {
            typing_debounce: millis_env("CHAT_TYPING_DEBOUNCE_MS", d.typing_debounce.as_millis() as u64),
            typing_display_timeout: millis_env("CHAT_TYPING_TIMEOUT_MS", d.typing_display_timeout.as_millis() as u64),
            message_page_limit: if page == 0 { None } else { Some(page) },
            feed_capacity: usize_env("CHAT_FEED_CAPACITY", d.feed_capacity),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("JWT_SECRET must be at least 32 characters long")]
    WeakSecret,
}

/// Process-level settings for the HTTP service.
#[derive(Clone, Debug)]
pub struct ServiceConfig {
    pub bind_addr: String,
    pub port: u16,
    pub backend_url: Option<String>,
    pub change_secret: Option<String>,
    pub frontend_url: String,
    pub metrics: bool,
    pub chat: ChatConfig,
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let secret = std::env::var("JWT_SECRET").map_err(|_| ConfigError::Missing("JWT_SECRET"))?;
        if secret.len() < 32 {
            return Err(ConfigError::WeakSecret);
        }
        let non_empty = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());
        Ok(Self {
            bind_addr: non_empty("CHAT_BIND_ADDR").unwrap_or_else(|| "0.0.0.0".into()),
            port: non_empty("CHAT_PORT").and_then(|p| p.parse().ok()).unwrap_or(8080),
            backend_url: non_empty("CHAT_BACKEND_URL"),
            change_secret: non_empty("CHAT_CHANGE_SECRET"),
            frontend_url: non_empty("FRONTEND_URL").unwrap_or_else(|| "http://localhost:5173".into()),
            metrics: non_empty("CHAT_METRICS").map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(true),
            chat: ChatConfig::from_env(),
        })
    }
}
