mod http;
mod jobs;
mod token;

#[cfg(test)]
pub mod fake;

use async_trait::async_trait;
use std::sync::Arc;

pub use http::HttpTransport;
pub use jobs::{fetch_jobs, FetchError, JOBS_PATH};
pub use token::{AccessToken, AuthError, Credentials, TokenManager, TOKEN_PATH};

pub const API_VERSION_HEADER: &str = "x-api-version";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub bearer: Option<String>,
    pub form: Option<Vec<(String, String)>>,
}

impl ApiRequest {
    pub fn get(path: &str) -> Self {
        Self {
            method: Method::Get,
            path: path.to_string(),
            query: Vec::new(),
            headers: Vec::new(),
            bearer: None,
            form: None,
        }
    }

    pub fn post_form(path: &str, form: Vec<(String, String)>) -> Self {
        Self {
            method: Method::Post,
            form: Some(form),
            ..Self::get(path)
        }
    }

    pub fn query(mut self, key: &str, value: impl ToString) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn bearer(mut self, token: &str) -> Self {
        self.bearer = Some(token.to_string());
        self
    }
}

/// Status line and body of an HTTP exchange, uninterpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub status: u16,
    pub body: String,
}

impl RawResponse {
    pub fn is_success(&self) -> bool {
        self.status == 200
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("request failed: {0}")]
    Request(String),
}

/// Sends requests to one backup server. Paths are relative to its base URL.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: ApiRequest) -> Result<RawResponse, TransportError>;
    fn verify_tls(&self) -> bool;
}

/// A transport paired with a bearer token that was valid when it was handed out.
#[derive(Clone)]
pub struct AuthenticatedClient {
    transport: Arc<dyn Transport>,
    token: String,
}

impl AuthenticatedClient {
    pub fn new(transport: Arc<dyn Transport>, token: String) -> Self {
        Self { transport, token }
    }

    pub fn verify_tls(&self) -> bool {
        self.transport.verify_tls()
    }

    pub async fn send(&self, request: ApiRequest) -> Result<RawResponse, TransportError> {
        self.transport.send(request.bearer(&self.token)).await
    }
}

impl std::fmt::Debug for AuthenticatedClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthenticatedClient")
            .field("verify_tls", &self.verify_tls())
            .finish_non_exhaustive()
    }
}
