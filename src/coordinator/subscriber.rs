use crate::coordinator::{Coordinator, RefreshEvent};
use crate::core::models::{JobIcon, JobRecord, JobState};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};

/// Follows one job by identifier. Each read re-resolves the job in the
/// coordinator's current snapshot.
pub struct JobSubscriber {
    job_id: String,
    coordinator: Arc<Coordinator>,
    events: broadcast::Receiver<RefreshEvent>,
}

impl JobSubscriber {
    pub fn new(coordinator: Arc<Coordinator>, record: &JobRecord) -> Self {
        let events = coordinator.subscribe();
        Self {
            job_id: record.identifier().to_string(),
            coordinator,
            events,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub async fn state(&self) -> JobState {
        self.coordinator.current_status(&self.job_id).await
    }

    pub async fn icon(&self) -> JobIcon {
        self.coordinator.current_icon(&self.job_id).await
    }

    /// Waits for the next completed cycle. Missed events are skipped over.
    pub async fn changed(&mut self) -> Option<RefreshEvent> {
        loop {
            match self.events.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(job_id = %self.job_id, skipped, "Subscriber lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}
