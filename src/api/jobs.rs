use crate::api::{ApiRequest, AuthenticatedClient, RawResponse, TransportError, API_VERSION_HEADER};

pub const JOBS_PATH: &str = "/api/v1/jobs";

#[derive(Debug, Clone, thiserror::Error)]
pub enum FetchError {
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),
    #[error("API returned status {0}")]
    Status(u16),
    #[error("API returned an empty response")]
    EmptyBody,
}

impl FetchError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, FetchError::Status(401))
    }

    /// Whether trying again later has a chance of a different answer.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Transport(_) | FetchError::EmptyBody => true,
            FetchError::Status(status) => *status == 401 || *status == 429 || *status >= 500,
        }
    }
}

/// Lists jobs. The body comes back as-is for the caller to decode.
pub async fn fetch_jobs(
    client: &AuthenticatedClient,
    api_version: &str,
    limit: u32,
) -> Result<RawResponse, FetchError> {
    let request = ApiRequest::get(JOBS_PATH)
        .query("limit", limit)
        .header(API_VERSION_HEADER, api_version);

    let response = client.send(request).await?;

    if !response.is_success() {
        return Err(FetchError::Status(response.status));
    }
    if response.body.trim().is_empty() {
        return Err(FetchError::EmptyBody);
    }

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::fake::FakeTransport;
    use crate::api::Method;
    use std::sync::Arc;

    fn client_for(transport: &Arc<FakeTransport>) -> AuthenticatedClient {
        AuthenticatedClient::new(transport.clone(), "tok-1".to_string())
    }

    #[tokio::test]
    async fn test_request_shape() {
        let transport = Arc::new(FakeTransport::new());
        transport.reply(JOBS_PATH, 200, r#"{"data":[]}"#);

        let response = fetch_jobs(&client_for(&transport), "1.2-rev0", 200)
            .await
            .unwrap();
        assert_eq!(response.body, r#"{"data":[]}"#);

        let requests = transport.requests();
        assert_eq!(requests.len(), 1);
        let request = &requests[0];
        assert_eq!(request.method, Method::Get);
        assert_eq!(request.path, "/api/v1/jobs");
        assert_eq!(
            request.query,
            vec![("limit".to_string(), "200".to_string())]
        );
        assert_eq!(
            request.headers,
            vec![("x-api-version".to_string(), "1.2-rev0".to_string())]
        );
        assert_eq!(request.bearer.as_deref(), Some("tok-1"));
    }

    #[tokio::test]
    async fn test_non_200_status() {
        let transport = Arc::new(FakeTransport::new());
        transport.reply(JOBS_PATH, 500, "boom");

        let err = fetch_jobs(&client_for(&transport), "1.2-rev0", 200)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Status(500)));
        assert!(err.is_retryable());
        assert_eq!(err.to_string(), "API returned status 500");
    }

    #[tokio::test]
    async fn test_empty_body() {
        let transport = Arc::new(FakeTransport::new());
        transport.reply(JOBS_PATH, 200, "  ");

        let err = fetch_jobs(&client_for(&transport), "1.2-rev0", 200)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::EmptyBody));
    }

    #[tokio::test]
    async fn test_transport_failure() {
        let transport = Arc::new(FakeTransport::new());
        transport.fail(JOBS_PATH, TransportError::Timeout);

        let err = fetch_jobs(&client_for(&transport), "1.2-rev0", 200)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Transport(TransportError::Timeout)));
    }

    #[test]
    fn test_error_classification() {
        assert!(FetchError::Status(401).is_unauthorized());
        assert!(!FetchError::Status(404).is_retryable());
        assert!(!FetchError::Status(400).is_retryable());
        assert!(FetchError::Status(503).is_retryable());
    }
}
