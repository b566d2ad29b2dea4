use crate::api::{ApiRequest, Method, RawResponse, Transport, TransportError};
use async_trait::async_trait;
use std::time::Duration;

const USER_AGENT: &str = concat!("vbr-monitor/", env!("CARGO_PKG_VERSION"));
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    verify_tls: bool,
}

impl HttpTransport {
    pub fn new(base_url: &str, verify_tls: bool, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .connect_timeout(CONNECT_TIMEOUT.min(timeout))
            .danger_accept_invalid_certs(!verify_tls)
            .build()?;

        if !verify_tls {
            tracing::warn!(base_url, "TLS certificate verification disabled");
        }

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            verify_tls,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: ApiRequest) -> Result<RawResponse, TransportError> {
        let url = format!("{}{}", self.base_url, request.path);
        let mut builder = match request.method {
            Method::Get => self.client.get(&url),
            Method::Post => self.client.post(&url),
        };

        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(token) = &request.bearer {
            builder = builder.bearer_auth(token);
        }
        if let Some(form) = &request.form {
            builder = builder.form(form);
        }

        tracing::debug!(method = ?request.method, %url, "Sending request");
        let response = builder.send().await.map_err(classify)?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(classify)?;

        Ok(RawResponse { status, body })
    }

    fn verify_tls(&self) -> bool {
        self.verify_tls
    }
}

fn classify(error: reqwest::Error) -> TransportError {
    if error.is_timeout() {
        TransportError::Timeout
    } else if error.is_connect() {
        TransportError::Connect(error.to_string())
    } else {
        TransportError::Request(error.to_string())
    }
}
