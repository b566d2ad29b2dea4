use crate::api::{
    ApiRequest, AuthenticatedClient, Transport, TransportError, API_VERSION_HEADER,
};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

pub const TOKEN_PATH: &str = "/api/oauth2/token";

/// Renew this long before the server-side expiry.
const EXPIRY_MARGIN_SECS: i64 = 60;
const MAX_TOKEN_LIFETIME_SECS: i64 = 30 * 24 * 60 * 60;

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Clone)]
pub struct AccessToken {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl AccessToken {
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }

    pub fn needs_renewal_at(&self, now: DateTime<Utc>) -> bool {
        now + Duration::seconds(EXPIRY_MARGIN_SECS) >= self.expires_at
    }
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    expires_in: i64,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum AuthError {
    #[error("token request failed: {0}")]
    Transport(#[from] TransportError),
    #[error("token request rejected with status {0}")]
    Rejected(u16),
    #[error("malformed token response: {0}")]
    Malformed(String),
}

#[derive(Debug, Default)]
struct RefreshRecord {
    attempt: u64,
    succeeded: bool,
}

/// Owns the bearer token for one server and renews it on demand.
pub struct TokenManager {
    transport: Arc<dyn Transport>,
    credentials: Credentials,
    api_version: String,
    current: RwLock<Option<Arc<AccessToken>>>,
    refresh: Mutex<RefreshRecord>,
    attempts: AtomicU64,
}

impl TokenManager {
    pub fn new(transport: Arc<dyn Transport>, credentials: Credentials, api_version: &str) -> Self {
        Self {
            transport,
            credentials,
            api_version: api_version.to_string(),
            current: RwLock::new(None),
            refresh: Mutex::new(RefreshRecord::default()),
            attempts: AtomicU64::new(0),
        }
    }

    /// Makes sure a token is held that will not expire within the safety
    /// margin, renewing it if needed. Concurrent callers share one renewal;
    /// a failed renewal leaves the previous token in place.
    pub async fn ensure_valid_token(&self) -> bool {
        if self.is_fresh().await {
            return true;
        }

        let seen = self.attempts.load(Ordering::Acquire);
        let mut record = self.refresh.lock().await;

        if record.attempt != seen {
            // Another caller renewed while we waited on the lock.
            return record.succeeded;
        }
        if self.is_fresh().await {
            return true;
        }

        let succeeded = match self.renew().await {
            Ok(token) => {
                tracing::debug!(expires_at = %token.expires_at, "Obtained access token");
                *self.current.write().await = Some(Arc::new(token));
                true
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    username = %self.credentials.username,
                    "Failed to obtain access token"
                );
                false
            }
        };

        record.attempt += 1;
        record.succeeded = succeeded;
        self.attempts.store(record.attempt, Ordering::Release);
        succeeded
    }

    /// A client carrying the current token, or `None` when no unexpired token is held.
    pub async fn get_authenticated_client(&self) -> Option<AuthenticatedClient> {
        let token = self.current.read().await.clone()?;
        if !token.is_valid_at(Utc::now()) {
            return None;
        }

        Some(AuthenticatedClient::new(
            Arc::clone(&self.transport),
            token.access_token.clone(),
        ))
    }

    /// Drops the held token so the next `ensure_valid_token` re-authenticates.
    pub async fn invalidate(&self) {
        if self.current.write().await.take().is_some() {
            tracing::info!("Access token invalidated");
        }
    }

    pub async fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.current.read().await.as_ref().map(|t| t.expires_at)
    }

    #[cfg(test)]
    pub async fn install(&self, token: AccessToken) {
        *self.current.write().await = Some(Arc::new(token));
    }

    async fn is_fresh(&self) -> bool {
        self.current
            .read()
            .await
            .as_ref()
            .is_some_and(|t| !t.needs_renewal_at(Utc::now()))
    }

    async fn renew(&self) -> Result<AccessToken, AuthError> {
        let refresh_token = self
            .current
            .read()
            .await
            .as_ref()
            .and_then(|t| t.refresh_token.clone());

        if let Some(refresh_token) = refresh_token {
            let form = vec![
                ("grant_type".to_string(), "refresh_token".to_string()),
                ("refresh_token".to_string(), refresh_token),
            ];
            match self.request_token(form).await {
                Ok(token) => return Ok(token),
                Err(e) => {
                    tracing::debug!(error = %e, "Refresh token not accepted, using password grant");
                }
            }
        }

        let form = vec![
            ("grant_type".to_string(), "password".to_string()),
            ("username".to_string(), self.credentials.username.clone()),
            ("password".to_string(), self.credentials.password.clone()),
        ];
        self.request_token(form).await
    }

    async fn request_token(&self, form: Vec<(String, String)>) -> Result<AccessToken, AuthError> {
        let request =
            ApiRequest::post_form(TOKEN_PATH, form).header(API_VERSION_HEADER, &self.api_version);
        let response = self.transport.send(request).await?;

        if !response.is_success() {
            return Err(AuthError::Rejected(response.status));
        }

        let parsed: TokenResponse = serde_json::from_str(&response.body)
            .map_err(|e| AuthError::Malformed(e.to_string()))?;
        if parsed.access_token.is_empty() {
            return Err(AuthError::Malformed("empty access_token".to_string()));
        }
        if parsed.expires_in <= 0 {
            return Err(AuthError::Malformed(format!(
                "non-positive expires_in: {}",
                parsed.expires_in
            )));
        }

        let lifetime = parsed.expires_in.min(MAX_TOKEN_LIFETIME_SECS);
        Ok(AccessToken {
            access_token: parsed.access_token,
            refresh_token: parsed.refresh_token.filter(|t| !t.is_empty()),
            expires_at: Utc::now() + Duration::seconds(lifetime),
        })
    }
}
