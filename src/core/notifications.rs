use crate::core::models::{JobStatus, Snapshot};
use anyhow::Result;
use notify_rust::Notification;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobTransition {
    pub job_id: String,
    pub job_name: String,
    pub from: JobStatus,
    pub to: JobStatus,
}

/// Jobs that moved into `failed` (or `warning`, when `include_warning`)
/// between two snapshots. Jobs that first appear in such a state count too.
pub fn job_transitions(
    previous: &Snapshot,
    current: &Snapshot,
    include_warning: bool,
) -> Vec<JobTransition> {
    current
        .jobs
        .iter()
        .filter(|job| match job.status {
            JobStatus::Failed => true,
            JobStatus::Warning => include_warning,
            _ => false,
        })
        .filter_map(|job| {
            let from = previous
                .find(job.identifier())
                .map(|prior| prior.status.clone())
                .unwrap_or(JobStatus::Unknown);
            (from != job.status).then(|| JobTransition {
                job_id: job.identifier().to_string(),
                job_name: job.name.clone(),
                from,
                to: job.status.clone(),
            })
        })
        .collect()
}

pub fn send_job_notification(server: &str, transition: &JobTransition) -> Result<()> {
    let urgency = match transition.to {
        JobStatus::Failed => notify_rust::Urgency::Critical,
        _ => notify_rust::Urgency::Normal,
    };

    Notification::new()
        .summary(&format!("Backup job {}", transition.to))
        .body(&format!(
            "{} on {} changed from {} to {}.",
            transition.job_name, server, transition.from, transition.to
        ))
        .icon(transition.to.icon().as_str())
        .appname("vbr-monitor")
        .urgency(urgency)
        .timeout(notify_rust::Timeout::Milliseconds(5000))
        .show()?;

    tracing::info!(
        server,
        job_id = %transition.job_id,
        status = %transition.to,
        "Sent job status notification"
    );

    Ok(())
}
