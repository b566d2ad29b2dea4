use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum JobStatus {
    Unknown,
    Running,
    Success,
    Warning,
    Failed,
    /// Status string the server reported that has no dedicated variant.
    Other(String),
}

/// Discriminant of [`JobStatus`], usable as a table index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusKind {
    Unknown = 0,
    Running = 1,
    Success = 2,
    Warning = 3,
    Failed = 4,
    Other = 5,
}

impl JobStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "unknown" => JobStatus::Unknown,
            "running" => JobStatus::Running,
            "success" => JobStatus::Success,
            "warning" => JobStatus::Warning,
            "failed" => JobStatus::Failed,
            _ => JobStatus::Other(raw.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            JobStatus::Unknown => "unknown",
            JobStatus::Running => "running",
            JobStatus::Success => "success",
            JobStatus::Warning => "warning",
            JobStatus::Failed => "failed",
            JobStatus::Other(raw) => raw,
        }
    }

    pub fn kind(&self) -> StatusKind {
        match self {
            JobStatus::Unknown => StatusKind::Unknown,
            JobStatus::Running => StatusKind::Running,
            JobStatus::Success => StatusKind::Success,
            JobStatus::Warning => StatusKind::Warning,
            JobStatus::Failed => StatusKind::Failed,
            JobStatus::Other(_) => StatusKind::Other,
        }
    }

    pub fn icon(&self) -> JobIcon {
        JobIcon::for_status(self)
    }
}

impl From<String> for JobStatus {
    fn from(raw: String) -> Self {
        JobStatus::parse(&raw)
    }
}

impl From<JobStatus> for String {
    fn from(status: JobStatus) -> Self {
        status.as_str().to_string()
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobIcon {
    BackupRestore,
    CheckCircle,
    Alert,
    CloseCircle,
    CloudSync,
}

/// Indexed by `StatusKind as usize`.
const STATUS_ICONS: [JobIcon; 6] = [
    JobIcon::CloudSync,
    JobIcon::BackupRestore,
    JobIcon::CheckCircle,
    JobIcon::Alert,
    JobIcon::CloseCircle,
    JobIcon::CloudSync,
];

impl JobIcon {
    pub fn for_status(status: &JobStatus) -> Self {
        STATUS_ICONS[status.kind() as usize]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobIcon::BackupRestore => "backup-restore",
            JobIcon::CheckCircle => "check-circle",
            JobIcon::Alert => "alert",
            JobIcon::CloseCircle => "close-circle",
            JobIcon::CloudSync => "cloud-sync",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: Option<String>,
    pub name: String,
    pub status: JobStatus,
    #[serde(rename = "type")]
    pub job_type: Option<String>,
    pub last_run: Option<String>,
    pub next_run: Option<String>,
    pub last_result: Option<String>,
}

impl JobRecord {
    /// Stable key for this job: the server id, or the name when the server sent none.
    pub fn identifier(&self) -> &str {
        self.id.as_deref().unwrap_or(&self.name)
    }

    pub fn attributes(&self) -> JobAttributes {
        JobAttributes {
            job_id: self.id.clone(),
            job_name: Some(self.name.clone()),
            job_type: self.job_type.clone(),
            last_run: self.last_run.clone(),
            next_run: self.next_run.clone(),
            last_result: self.last_result.clone(),
        }
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

/// Presentation attributes of a job. Every field is always present, `None`
/// when the server did not report it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobAttributes {
    pub job_id: Option<String>,
    pub job_name: Option<String>,
    pub job_type: Option<String>,
    pub last_run: Option<String>,
    pub next_run: Option<String>,
    pub last_result: Option<String>,
}

impl JobAttributes {
    pub fn last_run_at(&self) -> Option<DateTime<Utc>> {
        parse_timestamp(self.last_run.as_deref()?)
    }

    pub fn next_run_at(&self) -> Option<DateTime<Utc>> {
        parse_timestamp(self.next_run.as_deref()?)
    }
}

/// Jobs from one successful poll. Never mutated after publication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub jobs: Vec<JobRecord>,
    pub fetched_at: DateTime<Utc>,
}

impl Snapshot {
    pub fn new(jobs: Vec<JobRecord>) -> Self {
        Self {
            jobs,
            fetched_at: Utc::now(),
        }
    }

    pub fn find(&self, job_id: &str) -> Option<&JobRecord> {
        self.jobs.iter().find(|job| job.identifier() == job_id)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

/// What a subscriber sees for one job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobState {
    pub job_id: String,
    pub status: JobStatus,
    pub icon: JobIcon,
    pub attributes: JobAttributes,
    /// False when the job is not in the current snapshot.
    pub available: bool,
    /// True when the latest cycle failed and the data is from an earlier one.
    pub stale: bool,
    pub last_error: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl JobState {
    pub fn missing(job_id: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            status: JobStatus::Unknown,
            icon: JobIcon::for_status(&JobStatus::Unknown),
            attributes: JobAttributes::default(),
            available: false,
            stale: false,
            last_error: None,
            updated_at: None,
        }
    }

    pub fn from_record(record: &JobRecord, snapshot: &Snapshot) -> Self {
        Self {
            job_id: record.identifier().to_string(),
            status: record.status.clone(),
            icon: record.status.icon(),
            attributes: record.attributes(),
            available: true,
            stale: false,
            last_error: None,
            updated_at: Some(snapshot.fetched_at),
        }
    }
}
