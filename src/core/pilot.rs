//! Records mirroring the queue service's JSON documents.

use crate::resources::group::Requirement;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A pilot: a batch job submitted on behalf of the queue, sized to run one
/// or more matched tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PilotRecord {
    pub pilot_id: String,
    /// `{site}.{hostname}` of the queue daemon that owns this pilot.
    pub queue_host: String,
    /// Identifier assigned by the batch system at submission. Absent until
    /// the submit step records it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grid_queue_id: Option<String>,
    pub resources: Requirement,
    /// Tasks the pilot has picked up. Empty until the pilot claims work.
    #[serde(default)]
    pub tasks: Vec<PilotTaskRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submit_dir: Option<PathBuf>,
    pub submit_date: DateTime<Utc>,
}

impl PilotRecord {
    /// Age of the pilot since submission, in seconds.
    pub fn age_secs(&self, now: DateTime<Utc>) -> i64 {
        (now - self.submit_date).num_seconds()
    }
}

/// A task carried by a pilot, keyed by dataset so logs and errors stay
/// attributed after the task itself is gone from the claim queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PilotTaskRef {
    pub task_id: String,
    pub dataset_id: String,
}

/// A claimed task and the context needed to build a pilot for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: String,
    pub job_id: String,
    pub dataset_id: String,
    pub name: String,
    /// Raw requirements as authored in the dataset config; sanitized and
    /// rounded before use.
    #[serde(default)]
    pub requirements: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: String,
    pub job_index: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetRecord {
    pub dataset_id: String,
    /// Human-facing dataset number.
    pub dataset: u64,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub debug: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pilot_record_roundtrip() {
        let json = serde_json::json!({
            "pilot_id": "p1",
            "queue_host": "site.example.org",
            "grid_queue_id": "1234.0",
            "resources": {"cpu": 1, "memory": 4.0},
            "tasks": [{"task_id": "t1", "dataset_id": "d1"}],
            "submit_date": "2026-08-01T12:00:00Z",
        });
        let pilot: PilotRecord = serde_json::from_value(json).unwrap();
        assert_eq!(pilot.grid_queue_id.as_deref(), Some("1234.0"));
        assert_eq!(pilot.resources.memory, Some(4.0));
        assert_eq!(
            pilot.tasks,
            vec![PilotTaskRef {
                task_id: "t1".to_string(),
                dataset_id: "d1".to_string(),
            }]
        );
    }

    #[test]
    fn test_pilot_record_defaults() {
        let json = serde_json::json!({
            "pilot_id": "p2",
            "queue_host": "site.example.org",
            "resources": {},
            "submit_date": "2026-08-01T12:00:00Z",
        });
        let pilot: PilotRecord = serde_json::from_value(json).unwrap();
        assert!(pilot.grid_queue_id.is_none());
        assert!(pilot.tasks.is_empty());
        assert!(pilot.submit_dir.is_none());
    }
}
