use anyhow::Result;
use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use vbr_monitor::coordinator::{Coordinator, CycleOutcome};
use vbr_monitor::core::models::JobState;
use vbr_monitor::core::settings::{PollingSettings, ServerConfig, Settings};
use vbr_monitor::core::store::Phase;

#[derive(Serialize)]
struct StatusOutput {
    servers: BTreeMap<String, ServerStatus>,
    #[serde(with = "chrono::serde::ts_seconds")]
    fetched_at: DateTime<Utc>,
}

#[derive(Serialize)]
struct ServerStatus {
    jobs: Vec<JobState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    phase: Option<Phase>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_attempt: Option<DateTime<Utc>>,
    in_backoff: bool,
}

impl ServerStatus {
    fn unreachable(error: String) -> Self {
        Self {
            jobs: Vec::new(),
            error: Some(error),
            phase: None,
            last_attempt: None,
            in_backoff: false,
        }
    }
}

pub async fn run(json: bool, server_filter: Option<String>, job_filter: Option<String>) -> Result<()> {
    let settings = Settings::load()?;

    let servers: Vec<&ServerConfig> = match server_filter.as_deref() {
        Some(name) => settings.server(name).into_iter().collect(),
        None => settings.servers.iter().collect(),
    };

    if servers.is_empty() {
        if let Some(filter) = &server_filter {
            anyhow::bail!("Unknown server: {}", filter);
        } else {
            anyhow::bail!("No servers configured. Check your configuration.");
        }
    }

    let mut results = BTreeMap::new();
    for server in servers {
        let status = fetch_server_status(server, &settings.polling, job_filter.as_deref()).await;
        results.insert(server.name.clone(), status);
    }

    if json {
        let output = StatusOutput {
            servers: results,
            fetched_at: Utc::now(),
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        print_text_output(&results);
    }

    Ok(())
}

async fn fetch_server_status(
    server: &ServerConfig,
    polling: &PollingSettings,
    job_filter: Option<&str>,
) -> ServerStatus {
    let coordinator = match Coordinator::connect(server, polling) {
        Ok(coordinator) => Arc::new(coordinator),
        Err(e) => return ServerStatus::unreachable(e.to_string()),
    };

    let error = match coordinator.refresh().await {
        CycleOutcome::Failed(e) => Some(e.to_string()),
        CycleOutcome::Success { .. } | CycleOutcome::Skipped => None,
    };

    let jobs = match job_filter {
        Some(job_id) => vec![coordinator.current_status(job_id).await],
        None => {
            let mut states = Vec::new();
            for subscriber in coordinator.job_subscribers().await {
                states.push(subscriber.state().await);
            }
            states
        }
    };

    ServerStatus {
        jobs,
        error,
        phase: Some(coordinator.phase().await),
        last_attempt: coordinator.last_attempt().await,
        in_backoff: coordinator.in_backoff().await,
    }
}

fn print_text_output(results: &BTreeMap<String, ServerStatus>) {
    for (i, (name, status)) in results.iter().enumerate() {
        if i > 0 {
            println!();
        }

        println!("{}", name);

        if let Some(error) = &status.error {
            println!("  Error: {}", error);
            continue;
        }

        if status.jobs.is_empty() {
            println!("  (no jobs)");
        }

        for job in &status.jobs {
            print_job_line(job);
        }
    }
}

fn print_job_line(job: &JobState) {
    if !job.available {
        println!("  {:<32} not found", job.job_id);
        return;
    }

    let name = job.attributes.job_name.as_deref().unwrap_or(&job.job_id);
    let mut details = Vec::new();
    let attributes = &job.attributes;
    if let Some(last_run) = &attributes.last_run {
        details.push(format!("last {}", format_run_time(attributes.last_run_at(), last_run)));
    }
    if let Some(next_run) = &attributes.next_run {
        details.push(format!("next {}", format_run_time(attributes.next_run_at(), next_run)));
    }
    if let Some(result) = &job.attributes.last_result {
        details.push(format!("result {}", result));
    }

    println!(
        "  {:<32} {:<10} [{}] {}",
        name,
        job.status.as_str(),
        job.icon.as_str(),
        details.join(", ")
    );
}

/// Local time when the server sent a parseable timestamp, the raw text otherwise.
fn format_run_time(parsed: Option<DateTime<Utc>>, raw: &str) -> String {
    match parsed {
        Some(ts) => ts.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string(),
        None => raw.to_string(),
    }
}
