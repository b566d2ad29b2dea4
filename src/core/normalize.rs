use crate::core::models::{JobRecord, JobStatus};
use serde_json::{Map, Value};
use std::collections::HashSet;

const DATA_KEY: &str = "data";
const DEFAULT_NAME: &str = "Unknown";

/// Turns a decoded jobs listing into job records.
///
/// Anything that does not look like the expected shape is dropped instead of
/// reported: a missing or non-list `data` key yields no jobs, non-object
/// entries are skipped, and absent fields take their defaults. The first
/// record wins when two entries share an identifier.
pub fn normalize(payload: &Value) -> Vec<JobRecord> {
    let Some(entries) = payload.get(DATA_KEY).and_then(Value::as_array) else {
        tracing::debug!("Jobs payload has no `data` list");
        return Vec::new();
    };

    let mut seen = HashSet::new();
    let mut jobs = Vec::with_capacity(entries.len());

    for entry in entries {
        let Some(object) = entry.as_object() else {
            continue;
        };

        let job = normalize_job(object);
        if !seen.insert(job.identifier().to_string()) {
            tracing::debug!(job_id = job.identifier(), "Dropping duplicate job entry");
            continue;
        }
        jobs.push(job);
    }

    jobs
}

fn normalize_job(object: &Map<String, Value>) -> JobRecord {
    JobRecord {
        id: text_field(object, "id"),
        name: text_field(object, "name").unwrap_or_else(|| DEFAULT_NAME.to_string()),
        status: text_field(object, "status")
            .map(|raw| JobStatus::parse(&raw))
            .unwrap_or(JobStatus::Unknown),
        job_type: text_field(object, "type"),
        last_run: text_field(object, "lastRun"),
        next_run: text_field(object, "nextRun"),
        last_result: text_field(object, "lastResult"),
    }
}

fn text_field(object: &Map<String, Value>, key: &str) -> Option<String> {
    match object.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_missing_or_wrong_data_key() {
        assert!(normalize(&json!({})).is_empty());
        assert!(normalize(&json!({"data": {"id": "j1"}})).is_empty());
        assert!(normalize(&json!({"data": "jobs"})).is_empty());
        assert!(normalize(&json!({"data": null})).is_empty());
        assert!(normalize(&json!([{"id": "j1"}])).is_empty());
        assert!(normalize(&Value::Null).is_empty());
    }

    #[test]
    fn test_single_job_scenario() {
        let payload = json!({"data": [{"id": "j1", "name": "Daily", "status": "success"}]});

        let jobs = normalize(&payload);
        assert_eq!(
            jobs,
            vec![JobRecord {
                id: Some("j1".to_string()),
                name: "Daily".to_string(),
                status: JobStatus::Success,
                job_type: None,
                last_run: None,
                next_run: None,
                last_result: None,
            }]
        );

        let value = serde_json::to_value(&jobs[0]).unwrap();
        assert_eq!(
            value,
            json!({
                "id": "j1",
                "name": "Daily",
                "status": "success",
                "type": null,
                "last_run": null,
                "next_run": null,
                "last_result": null,
            })
        );
    }

    #[test]
    fn test_defaults_for_missing_fields() {
        let jobs = normalize(&json!({"data": [{}]}));

        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].name, "Unknown");
        assert_eq!(jobs[0].status, JobStatus::Unknown);
        assert_eq!(jobs[0].status.as_str(), "unknown");
        assert!(jobs[0].id.is_none());
    }

    #[test]
    fn test_non_objects_are_skipped() {
        let payload = json!({"data": [1, "job", null, [], {"id": "j1"}, true]});

        let jobs = normalize(&payload);
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].identifier(), "j1");
    }

    #[test]
    fn test_full_record_and_order() {
        let payload = json!({"data": [
            {
                "id": "b",
                "name": "Nightly",
                "status": "Running",
                "type": "Backup",
                "lastRun": "2026-01-18T01:00:00Z",
                "nextRun": "2026-01-19T01:00:00Z",
                "lastResult": "Warning"
            },
            {"id": "a", "name": "Replica", "status": "failed", "type": "Replica"}
        ]});

        let jobs = normalize(&payload);
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].identifier(), "b");
        assert_eq!(jobs[0].status, JobStatus::Running);
        assert_eq!(jobs[0].job_type.as_deref(), Some("Backup"));
        assert_eq!(jobs[0].last_run.as_deref(), Some("2026-01-18T01:00:00Z"));
        assert_eq!(jobs[0].next_run.as_deref(), Some("2026-01-19T01:00:00Z"));
        assert_eq!(jobs[0].last_result.as_deref(), Some("Warning"));
        assert_eq!(jobs[1].identifier(), "a");
        assert_eq!(jobs[1].status, JobStatus::Failed);
    }

    #[test]
    fn test_scalar_fields_are_stringified_and_structures_ignored() {
        let payload = json!({"data": [
            {"id": 42, "name": {"first": "x"}, "status": ["running"], "lastResult": false}
        ]});

        let jobs = normalize(&payload);
        assert_eq!(jobs[0].id.as_deref(), Some("42"));
        assert_eq!(jobs[0].name, "Unknown");
        assert_eq!(jobs[0].status, JobStatus::Unknown);
        assert_eq!(jobs[0].last_result.as_deref(), Some("false"));
    }

    #[test]
    fn test_duplicate_identifiers_keep_first() {
        let payload = json!({"data": [
            {"id": "j1", "name": "First"},
            {"name": "NoId"},
            {"id": "j1", "name": "Second"},
            {"name": "NoId", "status": "failed"}
        ]});

        let jobs = normalize(&payload);
        let names: Vec<_> = jobs.iter().map(|j| j.name.as_str()).collect();
        assert_eq!(names, vec!["First", "NoId"]);
        assert_eq!(jobs[1].status, JobStatus::Unknown);
    }

    #[test]
    fn test_output_never_exceeds_input() {
        let payload = json!({"data": [{"id": "x"}, 3, {"id": "y"}, {"id": "x"}]});
        let jobs = normalize(&payload);
        assert!(jobs.len() <= payload["data"].as_array().unwrap().len());
        assert_eq!(jobs.len(), 2);
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let payload = json!({"data": [
            {"id": "j1", "name": "Daily", "status": "success"},
            {"name": "Weekly", "status": "warning", "nextRun": "soon"},
            "junk"
        ]});

        assert_eq!(normalize(&payload), normalize(&payload));
    }
}
