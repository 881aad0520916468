//! Remote request dispatch
//!
//! The upload pipeline and the filesystem adapter only need "send a
//! request, get a response". [`RequestDispatcher`] is that seam;
//! [`HttpDispatcher`] implements it over reqwest with bearer-token auth.
//!
//! # Example
//!
//! ```no_run
//! use charmfs::client::{DispatchRequest, HttpDispatcher, HttpDispatcherConfig, RequestDispatcher};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let dispatcher = HttpDispatcher::new(HttpDispatcherConfig {
//!     base_url: "https://cloud.charm.sh:35354".to_string(),
//!     token: Some("token".to_string()),
//!     timeout: std::time::Duration::from_secs(30),
//! })?;
//!
//! let response = dispatcher.dispatch(DispatchRequest::get("/v1/fs/")).await?;
//! println!("status: {}", response.status);
//! # Ok(())
//! # }
//! ```

use crate::upload::pipe::PipeReader;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode};
use std::time::Duration;
use thiserror::Error;

/// Dispatch errors
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Request error: {0}")]
    RequestError(String),

    #[error("Server returned {status}: {message}")]
    Status { status: StatusCode, message: String },
}

impl ClientError {
    /// HTTP status for `Status` errors
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ClientError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Request body source
#[derive(Debug, Default)]
pub enum RequestBody {
    #[default]
    Empty,
    /// Streamed from the consumer end of an upload pipe
    Stream(PipeReader),
}

/// One outbound request
#[derive(Debug)]
pub struct DispatchRequest {
    pub method: Method,
    /// Path and query relative to the server base URL, e.g. `/v1/fs/x?mode=436`
    pub path: String,
    pub headers: HeaderMap,
    pub body: RequestBody,
}

impl DispatchRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: HeaderMap::new(),
            body: RequestBody::Empty,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }
}

/// Response with a fully read body
#[derive(Debug, Clone)]
pub struct DispatchResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Sends requests to the remote store
#[async_trait]
pub trait RequestDispatcher: Send + Sync {
    /// Send `request`; non-success statuses are reported as
    /// [`ClientError::Status`]
    async fn dispatch(&self, request: DispatchRequest) -> Result<DispatchResponse, ClientError>;
}

/// HTTP dispatcher configuration
#[derive(Debug, Clone)]
pub struct HttpDispatcherConfig {
    pub base_url: String,
    pub token: Option<String>,
    pub timeout: Duration,
}

impl From<&crate::config::RemoteConfig> for HttpDispatcherConfig {
    fn from(remote: &crate::config::RemoteConfig) -> Self {
        Self {
            base_url: remote.url.clone(),
            token: remote.token.clone(),
            timeout: Duration::from_secs(remote.timeout_seconds),
        }
    }
}

/// reqwest backed [`RequestDispatcher`]
pub struct HttpDispatcher {
    config: HttpDispatcherConfig,
    http_client: reqwest::Client,
}

impl HttpDispatcher {
    /// Create a new dispatcher
    pub fn new(config: HttpDispatcherConfig) -> Result<Self, ClientError> {
        let http_client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ClientError::ConfigError(e.to_string()))?;

        Ok(Self {
            config,
            http_client,
        })
    }

    /// Get the base URL
    pub fn base_url(&self) -> &str {
        &self.config.base_url
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

#[async_trait]
impl RequestDispatcher for HttpDispatcher {
    #[tracing::instrument(
        name = "client.dispatch",
        skip(self, request),
        fields(
            http.method = %request.method,
            http.path = %request.path,
            http.status_code = tracing::field::Empty
        ),
        err
    )]
    async fn dispatch(&self, request: DispatchRequest) -> Result<DispatchResponse, ClientError> {
        let mut builder = self
            .http_client
            .request(request.method, self.url(&request.path))
            .headers(request.headers);

        if let Some(token) = &self.config.token {
            builder = builder.bearer_auth(token);
        }

        if let RequestBody::Stream(reader) = request.body {
            builder = builder.body(reqwest::Body::wrap_stream(reader));
        }

        let response = builder
            .send()
            .await
            .map_err(|e| ClientError::RequestError(error_chain(&e)))?;

        let status = response.status();
        tracing::Span::current().record("http.status_code", status.as_u16());

        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| ClientError::RequestError(error_chain(&e)))?;

        if !status.is_success() {
            return Err(ClientError::Status {
                status,
                message: String::from_utf8_lossy(&body).trim().to_string(),
            });
        }

        Ok(DispatchResponse {
            status,
            headers,
            body,
        })
    }
}

/// Flatten an error and its sources into one message
fn error_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dispatcher(base_url: &str) -> HttpDispatcher {
        HttpDispatcher::new(HttpDispatcherConfig {
            base_url: base_url.into(),
            token: None,
            timeout: Duration::from_secs(5),
        })
        .unwrap()
    }

    #[test]
    fn test_url_join() {
        let d = dispatcher("http://localhost:35354/");
        assert_eq!(d.url("/v1/fs/abc"), "http://localhost:35354/v1/fs/abc");
        assert_eq!(d.url("v1/fs/abc"), "http://localhost:35354/v1/fs/abc");
    }

    #[test]
    fn test_status_accessor() {
        let err = ClientError::Status {
            status: StatusCode::NOT_FOUND,
            message: "missing".into(),
        };
        assert_eq!(err.status(), Some(StatusCode::NOT_FOUND));
        assert_eq!(ClientError::RequestError("x".into()).status(), None);
    }

    #[test]
    fn test_request_constructors() {
        let req = DispatchRequest::delete("/v1/fs/abc");
        assert_eq!(req.method, Method::DELETE);
        assert!(matches!(req.body, RequestBody::Empty));
    }
}
