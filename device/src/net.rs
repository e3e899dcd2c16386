use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use std::error::Error as StdError;
use std::io;
use std::time::Duration;
use tracing::debug;

use crate::error::{ApiError, ApiResult, TransportError};

pub const JSON_CONTENT_TYPE: &str = "application/json; charset=utf-8";

/// A JSON POST ready to be put on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl HttpRequest {
    pub fn post_json(url: String, body: String) -> Self {
        Self {
            url,
            headers: Vec::new(),
            body,
        }
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Sends JSON POST requests. Any completed exchange, whatever its status,
/// is `Ok`; only failures to reach the server are errors.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn post(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;
}

pub struct ReqwestTransport {
    http: Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let http = Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()?;
        Ok(Self { http })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn post(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let mut builder = self
            .http
            .post(&request.url)
            .header(CONTENT_TYPE, JSON_CONTENT_TYPE);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder
            .body(request.body)
            .send()
            .await
            .map_err(|e| classify(&request.url, &e))?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| classify(&request.url, &e))?;
        debug!(url = %request.url, status, "POST completed");
        Ok(HttpResponse { status, body })
    }
}

/// Maps a reqwest failure onto the transport error kinds.
fn classify(url: &str, err: &reqwest::Error) -> TransportError {
    let url = url.to_string();
    if err.is_timeout() {
        return TransportError::Timeout { url };
    }

    let mut source = err.source();
    while let Some(cause) = source {
        if let Some(io_err) = cause.downcast_ref::<io::Error>() {
            match io_err.kind() {
                io::ErrorKind::ConnectionRefused => return TransportError::ConnectionRefused { url },
                io::ErrorKind::TimedOut => return TransportError::Timeout { url },
                _ => {}
            }
        }
        let text = cause.to_string();
        if text.contains("dns error") || text.contains("failed to lookup address") {
            return TransportError::Dns { url };
        }
        source = cause.source();
    }

    if err.is_connect() {
        return TransportError::ConnectionRefused { url };
    }
    TransportError::Other {
        url,
        message: err.to_string(),
    }
}

/// Trims whitespace and trailing slashes and requires an `http://` or
/// `https://` scheme (any case).
pub fn normalize_base_url(raw: &str) -> ApiResult<String> {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(ApiError::Configuration("server address is not configured".to_string()));
    }

    let lower = trimmed.to_ascii_lowercase();
    let scheme_len = if lower.starts_with("https://") {
        "https://".len()
    } else if lower.starts_with("http://") {
        "http://".len()
    } else {
        return Err(ApiError::Configuration(format!(
            "server address must start with http:// or https://: {trimmed}"
        )));
    };

    if trimmed.len() == scheme_len {
        return Err(ApiError::Configuration(format!("server address has no host: {trimmed}")));
    }

    Ok(format!("{}{}", &lower[..scheme_len], &trimmed[scheme_len..]))
}
