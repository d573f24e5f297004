use std::time::Duration;

use reqwest::{Client as HttpClient, RequestBuilder, Response};
use serde::Deserialize;
use tracing::debug;

use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};

/// Authenticated access to one Dify app's API.
#[derive(Clone)]
pub struct Transport {
    http: HttpClient,
    base_url: String,
    api_key: String,
    connect_timeout: Duration,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl Transport {
    pub fn new(config: &ClientConfig) -> ClientResult<Self> {
        config.validate()?;
        Ok(Self {
            http: HttpClient::new(),
            base_url: normalize_base_url(&config.base_url),
            api_key: config.api_key.clone(),
            connect_timeout: config.connect_timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub(crate) fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    pub(crate) fn get(&self, path: &str) -> RequestBuilder {
        self.http.get(self.url(path)).bearer_auth(&self.api_key)
    }

    pub(crate) fn post(&self, path: &str) -> RequestBuilder {
        self.http.post(self.url(path)).bearer_auth(&self.api_key)
    }

    pub(crate) fn delete(&self, path: &str) -> RequestBuilder {
        self.http.delete(self.url(path)).bearer_auth(&self.api_key)
    }

    /// Sends and waits for response headers, bounded by the connect timeout.
    /// Does not look at the status.
    pub(crate) async fn send_raw(&self, request: RequestBuilder) -> ClientResult<Response> {
        match tokio::time::timeout(self.connect_timeout, request.send()).await {
            Ok(result) => {
                let response = result?;
                debug!(status = %response.status(), url = %response.url(), "response received");
                Ok(response)
            }
            Err(_) => Err(ClientError::Timeout(self.connect_timeout)),
        }
    }

    /// Like [`Transport::send_raw`], but non-2xx statuses become [`ClientError::Http`].
    pub(crate) async fn send(&self, request: RequestBuilder) -> ClientResult<Response> {
        let response = self.send_raw(request).await?;
        ensure_ok(response).await
    }
}

pub(crate) async fn ensure_ok(response: Response) -> ClientResult<Response> {
    if response.status().is_success() {
        return Ok(response);
    }

    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    Err(error_from_body(status, &body))
}

/// Dify reports failures as `{"code": ..., "message": ..., "status": ...}`.
/// Anything else is surfaced as the raw body text.
pub(crate) fn error_from_body(status: u16, body: &str) -> ClientError {
    let parsed = serde_json::from_str::<ErrorBody>(body).unwrap_or_default();
    let message = match parsed.message {
        Some(message) if !message.is_empty() => message,
        _ if !body.trim().is_empty() && parsed.code.is_none() => body.trim().to_string(),
        _ => format!("request failed: {}", status),
    };

    ClientError::Http {
        status,
        code: parsed.code.filter(|code| !code.is_empty()),
        message,
    }
}

pub(crate) fn normalize_base_url(value: &str) -> String {
    value.trim().trim_end_matches('/').to_string()
}
