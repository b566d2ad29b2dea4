use crate::core::models::{JobRecord, JobState, Snapshot};
use crate::core::retry::RetryState;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Idle,
    Refreshing,
}

struct StoreInner {
    snapshot: Option<Arc<Snapshot>>,
    last_error: Option<String>,
    last_attempt: Option<DateTime<Utc>>,
    phase: Phase,
    retry: RetryState,
}

/// Published state of one coordinator. Snapshots are swapped whole, so
/// readers always get a complete one.
#[derive(Clone)]
pub struct SnapshotStore {
    inner: Arc<RwLock<StoreInner>>,
}

impl SnapshotStore {
    pub fn new(retry: RetryState) -> Self {
        Self {
            inner: Arc::new(RwLock::new(StoreInner {
                snapshot: None,
                last_error: None,
                last_attempt: None,
                phase: Phase::Idle,
                retry,
            })),
        }
    }

    pub async fn snapshot(&self) -> Option<Arc<Snapshot>> {
        self.inner.read().await.snapshot.clone()
    }

    pub async fn last_error(&self) -> Option<String> {
        self.inner.read().await.last_error.clone()
    }

    pub async fn last_attempt(&self) -> Option<DateTime<Utc>> {
        self.inner.read().await.last_attempt
    }

    pub async fn phase(&self) -> Phase {
        self.inner.read().await.phase
    }

    pub async fn set_phase(&self, phase: Phase) {
        let mut inner = self.inner.write().await;
        inner.phase = phase;
        if phase == Phase::Refreshing {
            inner.last_attempt = Some(Utc::now());
        }
    }

    pub async fn publish(&self, jobs: Vec<JobRecord>) -> Arc<Snapshot> {
        let snapshot = Arc::new(Snapshot::new(jobs));
        let mut inner = self.inner.write().await;
        inner.snapshot = Some(Arc::clone(&snapshot));
        inner.last_error = None;
        inner.retry.record_success();
        snapshot
    }

    /// Records a failed cycle; the published snapshot stays as it was.
    /// Returns the number of consecutive failures.
    pub async fn record_failure(&self, error: String) -> u32 {
        let mut inner = self.inner.write().await;
        inner.last_error = Some(error);
        inner.retry.record_failure();
        inner.retry.consecutive_failures()
    }

    pub async fn in_backoff(&self) -> bool {
        self.inner.read().await.retry.is_in_backoff()
    }

    pub async fn next_delay(&self) -> Duration {
        self.inner.read().await.retry.current_delay()
    }

    pub async fn job_state(&self, job_id: &str) -> JobState {
        let inner = self.inner.read().await;

        let mut state = inner
            .snapshot
            .as_deref()
            .and_then(|snapshot| {
                snapshot
                    .find(job_id)
                    .map(|record| JobState::from_record(record, snapshot))
            })
            .unwrap_or_else(|| JobState::missing(job_id));

        state.stale = inner.last_error.is_some() && state.available;
        state.last_error = inner.last_error.clone();
        state
    }
}
