mod instance;
mod subscriber;

use crate::api::{fetch_jobs, Credentials, FetchError, HttpTransport, TokenManager};
use crate::core::models::{JobIcon, JobRecord, JobState, Snapshot};
use crate::core::normalize::normalize;
use crate::core::retry::RetryState;
use crate::core::settings::{PollingSettings, ServerConfig};
use crate::core::store::{Phase, SnapshotStore};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot, Mutex};

pub use instance::{ServerInstance, SetupError};
pub use subscriber::JobSubscriber;

const EVENT_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Authentication,
    Transport,
    Protocol,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum RefreshError {
    #[error("no valid token")]
    NoValidToken,
    #[error("no authenticated client")]
    NoAuthenticatedClient,
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("parse error: {0}")]
    Parse(String),
}

impl RefreshError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RefreshError::NoValidToken | RefreshError::NoAuthenticatedClient => {
                ErrorKind::Authentication
            }
            RefreshError::Fetch(FetchError::Transport(_)) => ErrorKind::Transport,
            RefreshError::Fetch(_) | RefreshError::Parse(_) => ErrorKind::Protocol,
        }
    }

    /// False when the server answered in a way the next cycle will repeat,
    /// like a 404 for the jobs path or a body that is not JSON.
    pub fn is_retryable(&self) -> bool {
        match self {
            RefreshError::NoValidToken | RefreshError::NoAuthenticatedClient => true,
            RefreshError::Fetch(e) => e.is_retryable(),
            RefreshError::Parse(_) => false,
        }
    }
}

#[derive(Debug, Clone)]
pub enum CycleOutcome {
    Success { jobs: usize },
    Failed(RefreshError),
    /// Another cycle was already running; this trigger was dropped.
    Skipped,
}

impl CycleOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, CycleOutcome::Success { .. })
    }
}

/// Sent to subscribers after every completed cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshEvent {
    pub server: String,
    pub sequence: u64,
    pub succeeded: bool,
    /// Set on failures the next cycle is expected to repeat.
    pub permanent: bool,
    pub error: Option<String>,
}

/// Drives the fetch-normalize-publish cycle for one backup server.
pub struct Coordinator {
    name: String,
    api_version: String,
    page_limit: u32,
    tokens: Arc<TokenManager>,
    store: SnapshotStore,
    cycle_lock: Mutex<()>,
    sequence: AtomicU64,
    events: broadcast::Sender<RefreshEvent>,
}

impl Coordinator {
    pub fn new(
        name: &str,
        tokens: Arc<TokenManager>,
        api_version: &str,
        polling: &PollingSettings,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            name: name.to_string(),
            api_version: api_version.to_string(),
            page_limit: polling.page_limit,
            tokens,
            store: SnapshotStore::new(RetryState::new(polling.interval(), polling.max_backoff())),
            cycle_lock: Mutex::new(()),
            sequence: AtomicU64::new(0),
            events,
        }
    }

    /// Builds the HTTP transport and token manager for `server`.
    pub fn connect(server: &ServerConfig, polling: &PollingSettings) -> Result<Self, SetupError> {
        let transport = HttpTransport::new(
            &server.base_url(),
            server.verify_ssl,
            polling.request_timeout(),
        )
        .map_err(|source| SetupError::Client {
            server: server.name.clone(),
            source,
        })?;

        let tokens = TokenManager::new(
            Arc::new(transport),
            Credentials {
                username: server.username.clone(),
                password: server.password.clone(),
            },
            &server.api_version,
        );

        Ok(Self::new(
            &server.name,
            Arc::new(tokens),
            &server.api_version,
            polling,
        ))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tokens(&self) -> &Arc<TokenManager> {
        &self.tokens
    }

    pub async fn snapshot(&self) -> Option<Arc<Snapshot>> {
        self.store.snapshot().await
    }

    pub async fn last_error(&self) -> Option<String> {
        self.store.last_error().await
    }

    pub async fn phase(&self) -> Phase {
        self.store.phase().await
    }

    pub async fn last_attempt(&self) -> Option<DateTime<Utc>> {
        self.store.last_attempt().await
    }

    /// True while failed cycles have stretched the poll delay.
    pub async fn in_backoff(&self) -> bool {
        self.store.in_backoff().await
    }

    pub async fn current_status(&self, job_id: &str) -> JobState {
        self.store.job_state(job_id).await
    }

    pub async fn current_icon(&self, job_id: &str) -> JobIcon {
        self.store.job_state(job_id).await.icon
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RefreshEvent> {
        self.events.subscribe()
    }

    /// One subscriber per job in the current snapshot.
    pub async fn job_subscribers(self: &Arc<Self>) -> Vec<JobSubscriber> {
        let Some(snapshot) = self.snapshot().await else {
            return Vec::new();
        };
        snapshot
            .jobs
            .iter()
            .map(|job| JobSubscriber::new(Arc::clone(self), job))
            .collect()
    }

    /// Runs one cycle unless one is already in flight.
    pub async fn refresh(&self) -> CycleOutcome {
        let Ok(_cycle) = self.cycle_lock.try_lock() else {
            tracing::debug!(server = %self.name, "Refresh already running, dropping trigger");
            return CycleOutcome::Skipped;
        };

        self.store.set_phase(Phase::Refreshing).await;

        let outcome = match self.run_cycle().await {
            Ok(jobs) => {
                let snapshot = self.store.publish(jobs).await;
                tracing::info!(server = %self.name, jobs = snapshot.len(), "Refreshed job states");
                CycleOutcome::Success {
                    jobs: snapshot.len(),
                }
            }
            Err(e) => {
                if matches!(&e, RefreshError::Fetch(f) if f.is_unauthorized()) {
                    self.tokens.invalidate().await;
                }

                let failures = self.store.record_failure(e.to_string()).await;
                let next_delay = self.store.next_delay().await;
                if e.is_retryable() {
                    tracing::warn!(
                        server = %self.name,
                        error = %e,
                        kind = ?e.kind(),
                        consecutive_failures = failures,
                        next_retry_secs = next_delay.as_secs(),
                        "Refresh failed, keeping previous job states"
                    );
                } else {
                    tracing::error!(
                        server = %self.name,
                        error = %e,
                        kind = ?e.kind(),
                        consecutive_failures = failures,
                        next_retry_secs = next_delay.as_secs(),
                        "Refresh rejected by server, check the API version and permissions"
                    );
                }
                CycleOutcome::Failed(e)
            }
        };

        self.store.set_phase(Phase::Idle).await;
        self.notify(&outcome);
        outcome
    }

    /// Polls until `shutdown` fires. The first cycle is expected to have run already.
    pub async fn run(self: Arc<Self>, mut shutdown: oneshot::Receiver<()>) {
        tracing::info!(server = %self.name, "Polling loop started");

        loop {
            let delay = self.store.next_delay().await;
            tokio::select! {
                _ = &mut shutdown => break,
                _ = tokio::time::sleep(delay) => {
                    self.refresh().await;
                }
            }
        }

        tracing::info!(server = %self.name, "Polling loop stopped");
    }

    async fn run_cycle(&self) -> Result<Vec<JobRecord>, RefreshError> {
        if !self.tokens.ensure_valid_token().await {
            return Err(RefreshError::NoValidToken);
        }

        let client = self
            .tokens
            .get_authenticated_client()
            .await
            .ok_or(RefreshError::NoAuthenticatedClient)?;

        let response = fetch_jobs(&client, &self.api_version, self.page_limit).await?;

        let payload: serde_json::Value = serde_json::from_str(&response.body)
            .map_err(|e| RefreshError::Parse(e.to_string()))?;

        Ok(normalize(&payload))
    }

    fn notify(&self, outcome: &CycleOutcome) {
        let (succeeded, permanent, error) = match outcome {
            CycleOutcome::Success { .. } => (true, false, None),
            CycleOutcome::Failed(e) => (false, !e.is_retryable(), Some(e.to_string())),
            CycleOutcome::Skipped => return,
        };

        let sequence = self.sequence.fetch_add(1, Ordering::AcqRel) + 1;
        // No receivers is fine.
        let _ = self.events.send(RefreshEvent {
            server: self.name.clone(),
            sequence,
            succeeded,
            permanent,
            error,
        });
    }
}
