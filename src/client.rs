//! HTTP client for the remote queue service.
//!
//! The engine only ever talks to the service through the [`QueueService`]
//! trait, so tests can substitute an in-memory fake. [`QueueClient`] is
//! the real reqwest-backed implementation.

use crate::core::pilot::{DatasetRecord, JobRecord, PilotRecord, TaskRecord};
use crate::resources::group::Requirement;
use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::Duration;

/// A task failure being reported back to the queue.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TaskErrorReport {
    pub task_id: String,
    pub dataset_id: String,
    pub reason: String,
    /// Resources the task was observed using, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<serde_json::Value>,
}

#[async_trait]
pub trait QueueService: Send + Sync {
    /// All pilots owned by `queue_host`.
    async fn pilots(&self, queue_host: &str) -> anyhow::Result<Vec<PilotRecord>>;

    /// Register a pilot; returns the service-assigned pilot id.
    async fn create_pilot(&self, pilot: &PilotRecord) -> anyhow::Result<String>;

    /// Partial update of a pilot record.
    async fn update_pilot(&self, pilot_id: &str, patch: serde_json::Value) -> anyhow::Result<()>;

    /// Delete a pilot. An already-deleted pilot is not an error.
    async fn delete_pilot(&self, pilot_id: &str) -> anyhow::Result<()>;

    /// Number of tasks currently waiting that this queue host could run.
    async fn waiting_task_count(&self, queue_host: &str) -> anyhow::Result<usize>;

    /// Atomically claim the next waiting task that fits inside `envelope`.
    /// `Ok(None)` when the queue has nothing for us.
    async fn claim_task(
        &self,
        queue_host: &str,
        envelope: &Requirement,
    ) -> anyhow::Result<Option<TaskRecord>>;

    async fn job(&self, job_id: &str) -> anyhow::Result<JobRecord>;
    async fn dataset(&self, dataset_id: &str) -> anyhow::Result<DatasetRecord>;
    /// The dataset's task-graph config document, as raw JSON.
    async fn dataset_config(&self, dataset_id: &str) -> anyhow::Result<serde_json::Value>;

    /// Store a captured log under `name` for a task.
    async fn upload_log(
        &self,
        task_id: &str,
        dataset_id: &str,
        name: &str,
        data: &str,
    ) -> anyhow::Result<()>;

    /// Mark a task finished, with its final resource usage when known.
    async fn finish_task(
        &self,
        task_id: &str,
        resources: Option<serde_json::Value>,
    ) -> anyhow::Result<()>;

    /// Mark a task failed (or killed) with a classification reason.
    async fn error_task(&self, report: &TaskErrorReport) -> anyhow::Result<()>;

    /// Issue a short-lived credential for pilots submitted by `queue_host`.
    async fn credential(&self, queue_host: &str) -> anyhow::Result<String>;
}

pub struct QueueClient {
    client: reqwest::Client,
    address: String,
}

impl QueueClient {
    pub fn new(address: &str, token: Option<&str>) -> anyhow::Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        if let Some(token) = token {
            let value = format!("Bearer {token}")
                .parse()
                .context("Invalid authorization token")?;
            headers.insert(reqwest::header::AUTHORIZATION, value);
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .default_headers(headers)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(QueueClient {
            client,
            address: address.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.address, path)
    }
}

#[async_trait]
impl QueueService for QueueClient {
    async fn pilots(&self, queue_host: &str) -> anyhow::Result<Vec<PilotRecord>> {
        let response = self
            .client
            .get(self.url("/pilots"))
            .query(&[
                ("queue_host", queue_host),
                (
                    "keys",
                    "pilot_id|queue_host|grid_queue_id|resources|tasks|submit_dir|submit_date",
                ),
            ])
            .send()
            .await
            .context("Failed to list pilots")?;
        response
            .error_for_status()
            .context("Pilot listing rejected")?
            .json()
            .await
            .context("Failed to parse pilot listing")
    }

    async fn create_pilot(&self, pilot: &PilotRecord) -> anyhow::Result<String> {
        #[derive(serde::Deserialize)]
        struct Created {
            result: String,
        }
        let response = self
            .client
            .post(self.url("/pilots"))
            .json(pilot)
            .send()
            .await
            .context("Failed to create pilot")?;
        let created: Created = response
            .error_for_status()
            .context("Pilot creation rejected")?
            .json()
            .await
            .context("Failed to parse pilot creation response")?;
        Ok(created.result)
    }

    async fn update_pilot(&self, pilot_id: &str, patch: serde_json::Value) -> anyhow::Result<()> {
        self.client
            .patch(self.url(&format!("/pilots/{pilot_id}")))
            .json(&patch)
            .send()
            .await
            .context("Failed to update pilot")?
            .error_for_status()
            .context("Pilot update rejected")?;
        Ok(())
    }

    async fn delete_pilot(&self, pilot_id: &str) -> anyhow::Result<()> {
        let response = self
            .client
            .delete(self.url(&format!("/pilots/{pilot_id}")))
            .send()
            .await
            .context("Failed to delete pilot")?;
        if response.status() == StatusCode::NOT_FOUND {
            tracing::debug!("pilot {pilot_id} already deleted");
            return Ok(());
        }
        response.error_for_status().context("Pilot delete rejected")?;
        Ok(())
    }

    async fn waiting_task_count(&self, queue_host: &str) -> anyhow::Result<usize> {
        #[derive(serde::Deserialize)]
        struct Counts {
            #[serde(default)]
            waiting: usize,
        }
        let response = self
            .client
            .get(self.url("/task_counts/status"))
            .query(&[("queue_host", queue_host)])
            .send()
            .await
            .context("Failed to get task counts")?;
        let counts: Counts = response
            .error_for_status()
            .context("Task count request rejected")?
            .json()
            .await
            .context("Failed to parse task counts")?;
        Ok(counts.waiting)
    }

    async fn claim_task(
        &self,
        queue_host: &str,
        envelope: &Requirement,
    ) -> anyhow::Result<Option<TaskRecord>> {
        let response = self
            .client
            .post(self.url("/task_actions/claim"))
            .json(&serde_json::json!({
                "queue_host": queue_host,
                "requirements": envelope,
            }))
            .send()
            .await
            .context("Failed to claim task")?;
        // the service answers 404 when no waiting task fits
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let task = response
            .error_for_status()
            .context("Task claim rejected")?
            .json()
            .await
            .context("Failed to parse claimed task")?;
        Ok(Some(task))
    }

    async fn job(&self, job_id: &str) -> anyhow::Result<JobRecord> {
        self.client
            .get(self.url(&format!("/jobs/{job_id}")))
            .send()
            .await
            .context("Failed to get job")?
            .error_for_status()
            .context("Job request rejected")?
            .json()
            .await
            .context("Failed to parse job")
    }

    async fn dataset(&self, dataset_id: &str) -> anyhow::Result<DatasetRecord> {
        self.client
            .get(self.url(&format!("/datasets/{dataset_id}")))
            .send()
            .await
            .context("Failed to get dataset")?
            .error_for_status()
            .context("Dataset request rejected")?
            .json()
            .await
            .context("Failed to parse dataset")
    }

    async fn dataset_config(&self, dataset_id: &str) -> anyhow::Result<serde_json::Value> {
        self.client
            .get(self.url(&format!("/config/{dataset_id}")))
            .send()
            .await
            .context("Failed to get dataset config")?
            .error_for_status()
            .context("Dataset config request rejected")?
            .json()
            .await
            .context("Failed to parse dataset config")
    }

    async fn upload_log(
        &self,
        task_id: &str,
        dataset_id: &str,
        name: &str,
        data: &str,
    ) -> anyhow::Result<()> {
        self.client
            .post(self.url("/logs"))
            .json(&serde_json::json!({
                "task_id": task_id,
                "dataset_id": dataset_id,
                "name": name,
                "data": data,
            }))
            .send()
            .await
            .context("Failed to upload log")?
            .error_for_status()
            .context("Log upload rejected")?;
        Ok(())
    }

    async fn finish_task(
        &self,
        task_id: &str,
        resources: Option<serde_json::Value>,
    ) -> anyhow::Result<()> {
        let mut body = serde_json::json!({});
        if let Some(resources) = resources {
            body["resources"] = resources;
        }
        self.client
            .post(self.url(&format!("/tasks/{task_id}/task_actions/complete")))
            .json(&body)
            .send()
            .await
            .context("Failed to finish task")?
            .error_for_status()
            .context("Task finish rejected")?;
        Ok(())
    }

    async fn error_task(&self, report: &TaskErrorReport) -> anyhow::Result<()> {
        self.client
            .post(self.url(&format!(
                "/tasks/{}/task_actions/error",
                report.task_id
            )))
            .json(report)
            .send()
            .await
            .context("Failed to report task error")?
            .error_for_status()
            .context("Task error report rejected")?;
        Ok(())
    }

    async fn credential(&self, queue_host: &str) -> anyhow::Result<String> {
        #[derive(serde::Deserialize)]
        struct Credential {
            token: String,
        }
        let response = self
            .client
            .post(self.url("/credentials"))
            .json(&serde_json::json!({"queue_host": queue_host}))
            .send()
            .await
            .context("Failed to issue credential")?;
        let credential: Credential = response
            .error_for_status()
            .context("Credential request rejected")?
            .json()
            .await
            .context("Failed to parse credential")?;
        Ok(credential.token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_normalization() {
        let client = QueueClient::new("http://localhost:8080/", None).unwrap();
        assert_eq!(client.url("/pilots"), "http://localhost:8080/pilots");
        let client = QueueClient::new("http://localhost:8080", None).unwrap();
        assert_eq!(client.url("/pilots"), "http://localhost:8080/pilots");
    }
}
