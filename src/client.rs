// client.rs - ClientConfig and the Clock seam used for deterministic tests (§2, §3)

use std::time::Duration;

/// Static configuration for one app's worth of `DataStore`s (§3).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub app_key: String,
    pub app_secret: String,
    pub master_secret: Option<String>,
    pub base_url: String,
    pub mic_host: Option<String>,
    pub default_timeout: Duration,
    pub default_page_size: usize,
    pub max_concurrent_pull_requests: usize,
    pub max_concurrent_push_requests: usize,
}

impl ClientConfig {
    pub fn new(app_key: impl Into<String>, app_secret: impl Into<String>) -> Self {
        Self {
            app_key: app_key.into(),
            app_secret: app_secret.into(),
            master_secret: None,
            base_url: "https://baas.kinvey.com".to_string(),
            mic_host: None,
            default_timeout: Duration::from_secs(60),
            default_page_size: 10_000,
            max_concurrent_pull_requests: 4,
            max_concurrent_push_requests: 4,
        }
    }

    pub fn with_master_secret(mut self, master_secret: impl Into<String>) -> Self {
        self.master_secret = Some(master_secret.into());
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_default_page_size(mut self, page_size: usize) -> Self {
        self.default_page_size = page_size;
        self
    }

    pub fn with_mic_host(mut self, mic_host: impl Into<String>) -> Self {
        self.mic_host = Some(mic_host.into());
        self
    }
}

/// Source of "now", injected so pull/push timestamp logic can be tested
/// deterministically instead of depending on the wall clock.
pub trait Clock: Send + Sync {
    fn now(&self) -> chrono::DateTime<chrono::Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> chrono::DateTime<chrono::Utc> {
        chrono::Utc::now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_overrides_defaults() {
        let config = ClientConfig::new("app1", "secret1")
            .with_master_secret("master1")
            .with_base_url("https://example.com")
            .with_default_page_size(500);
        assert_eq!(config.master_secret, Some("master1".to_string()));
        assert_eq!(config.base_url, "https://example.com");
        assert_eq!(config.default_page_size, 500);
    }
}
