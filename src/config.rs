use std::time::Duration;

use crate::error::{ClientError, ClientResult};

pub const DEFAULT_USER: &str = "difystream";
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

const ENV_API_BASE: &str = "DIFY_API_BASE";
const ENV_API_KEY: &str = "DIFY_API_KEY";
const ENV_USER: &str = "DIFY_USER";
const ENV_CONNECT_TIMEOUT: &str = "DIFY_CONNECT_TIMEOUT_SECS";

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub api_key: String,
    /// End-user identifier sent with every user-scoped request.
    pub user: String,
    /// Bound on the time until response headers arrive. Streaming bodies are not bounded.
    pub connect_timeout: Duration,
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            user: user.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn from_env() -> ClientResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> ClientResult<Self> {
        let base_url = lookup(ENV_API_BASE)
            .ok_or_else(|| ClientError::Config(format!("{} is not set", ENV_API_BASE)))?;
        let api_key = lookup(ENV_API_KEY)
            .ok_or_else(|| ClientError::Config(format!("{} is not set", ENV_API_KEY)))?;
        let user = lookup(ENV_USER).unwrap_or_else(|| DEFAULT_USER.to_string());

        let mut config = Self::new(base_url, api_key, user);
        if let Some(raw) = lookup(ENV_CONNECT_TIMEOUT) {
            let secs: u64 = raw.trim().parse().map_err(|_| {
                ClientError::Config(format!("{} must be a whole number of seconds", ENV_CONNECT_TIMEOUT))
            })?;
            config.connect_timeout = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ClientResult<()> {
        if self.base_url.trim().is_empty() {
            return Err(ClientError::Config("base url is empty".to_string()));
        }
        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            return Err(ClientError::Config(format!(
                "base url must start with http:// or https://, got {}",
                self.base_url
            )));
        }
        if self.api_key.trim().is_empty() {
            return Err(ClientError::Config("api key is empty".to_string()));
        }
        if self.user.trim().is_empty() {
            return Err(ClientError::Config("user is empty".to_string()));
        }
        Ok(())
    }
}
