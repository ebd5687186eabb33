//! The per-cycle reconciliation and submission loop.
//!
//! Each cycle runs two phases. Phase A reconciles the queue service's
//! pilot records against what the batch system actually reports: it
//! finalizes completed pilots, deletes records whose jobs vanished,
//! force-removes stuck jobs, asks for removal of orphaned jobs, and sweeps
//! stale submit directories. Phase B then claims waiting tasks up to a
//! computed ceiling, clusters them into resource groups so interchangeable
//! requests share one pilot shape, and runs a submission pipeline per
//! task, fanned out over a bounded set of workers. Cycles never overlap;
//! the daemon awaits one full cycle before starting the next.

use crate::client::{QueueService, TaskErrorReport};
use crate::config::QueueConfig;
use crate::core::adapter::{with_retries, BatchAdapter, BatchStatus, CompletedJob, SubmitContext};
use crate::core::pilot::{DatasetRecord, PilotRecord, PilotTaskRef, TaskRecord};
use crate::core::signatures::FailureScanner;
use crate::core::{STDERR_FILENAME, STDLOG_FILENAME, STDOUT_FILENAME};
use crate::resources::group::{group_hash, round, sanitize, Requirement};
use anyhow::Context;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinSet;

/// What one cycle did, for the daemon's log line.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct CycleSummary {
    pub idle: usize,
    pub processing: usize,
    pub completed: usize,
    pub submitted: usize,
}

pub struct ReconciliationEngine {
    cfg: QueueConfig,
    queue_host: String,
    submit_root: PathBuf,
    client: Arc<dyn QueueService>,
    adapter: Arc<dyn BatchAdapter>,
    scanner: FailureScanner,
    /// Batch jobs seen without a queue record last cycle. A job must show
    /// up here twice in a row before removal is requested, absorbing the
    /// race with pilots registered mid-listing.
    orphans_pending: HashSet<String>,
}

pub struct ReconciliationEngineBuilder {
    cfg: QueueConfig,
    client: Option<Arc<dyn QueueService>>,
    adapter: Option<Arc<dyn BatchAdapter>>,
    submit_root: Option<PathBuf>,
}

impl ReconciliationEngineBuilder {
    pub fn new(cfg: QueueConfig) -> Self {
        ReconciliationEngineBuilder {
            cfg,
            client: None,
            adapter: None,
            submit_root: None,
        }
    }

    pub fn with_client(mut self, client: Arc<dyn QueueService>) -> Self {
        self.client = Some(client);
        self
    }

    pub fn with_adapter(mut self, adapter: Arc<dyn BatchAdapter>) -> Self {
        self.adapter = Some(adapter);
        self
    }

    pub fn with_submit_root(mut self, submit_root: impl Into<PathBuf>) -> Self {
        self.submit_root = Some(submit_root.into());
        self
    }

    pub fn build(self) -> anyhow::Result<ReconciliationEngine> {
        let submit_root = match self.submit_root.or_else(|| self.cfg.submit_dir.clone()) {
            Some(root) => root,
            None => crate::get_submit_dir()?,
        };
        Ok(ReconciliationEngine {
            queue_host: self.cfg.queue_host(),
            client: self.client.context("engine requires a queue client")?,
            adapter: self.adapter.context("engine requires a batch adapter")?,
            scanner: FailureScanner::new(),
            orphans_pending: HashSet::new(),
            submit_root,
            cfg: self.cfg,
        })
    }
}

impl ReconciliationEngine {
    pub fn builder(cfg: QueueConfig) -> ReconciliationEngineBuilder {
        ReconciliationEngineBuilder::new(cfg)
    }

    /// Run one full reconcile + queue cycle.
    pub async fn run_cycle(&mut self) -> anyhow::Result<CycleSummary> {
        let mut summary = self.reconcile().await?;
        summary.submitted = self.queue_tasks(&summary).await?;
        tracing::info!(
            "cycle done: {} idle, {} processing, {} completed, {} submitted",
            summary.idle,
            summary.processing,
            summary.completed,
            summary.submitted
        );
        Ok(summary)
    }

    /// Phase A.
    async fn reconcile(&mut self) -> anyhow::Result<CycleSummary> {
        let pilots = self.client.pilots(&self.queue_host).await?;
        let live = self.adapter.live_status(&self.queue_host).await?;
        let completions: HashMap<String, CompletedJob> = self
            .adapter
            .completions(&self.queue_host, self.cfg.completions_limit)
            .await?
            .into_iter()
            .map(|job| (job.grid_queue_id.clone(), job))
            .collect();

        let mut summary = CycleSummary::default();
        let mut known_jobs = HashSet::new();
        let now = Utc::now();

        for pilot in pilots {
            let Some(gid) = pilot.grid_queue_id.clone() else {
                // still being submitted; give it the queued budget, then
                // assume the submitting cycle died
                if pilot.age_secs(now) > self.cfg.max_age_secs(BatchStatus::Queued) as i64 {
                    tracing::warn!("pilot {} never got a batch job, deleting", pilot.pilot_id);
                    self.delete_pilot(&pilot.pilot_id).await;
                } else {
                    summary.idle += 1;
                }
                continue;
            };
            known_jobs.insert(gid.clone());

            if let Some(completion) = completions.get(&gid) {
                self.post_process(&pilot, completion).await;
                summary.completed += 1;
            } else if let Some(status) = live.get(&gid).copied() {
                if pilot.age_secs(now) > self.cfg.max_age_secs(status) as i64 {
                    self.force_remove(&pilot, &gid, status).await;
                } else {
                    match status {
                        BatchStatus::Queued => summary.idle += 1,
                        // unknown counts as alive until its full budget runs out
                        _ => summary.processing += 1,
                    }
                }
            } else {
                // the batch job is gone with no completion record; deleting
                // the pilot returns its tasks to the queue
                tracing::info!("batch job for pilot {} vanished", pilot.pilot_id);
                self.delete_pilot(&pilot.pilot_id).await;
            }
        }

        self.remove_orphans(&live, &known_jobs).await;
        self.sweep_submit_dirs().await;
        Ok(summary)
    }

    /// Request removal of batch jobs with no queue record, after one full
    /// cycle of grace.
    async fn remove_orphans(
        &mut self,
        live: &HashMap<String, BatchStatus>,
        known_jobs: &HashSet<String>,
    ) {
        let mut pending = HashSet::new();
        for gid in live.keys() {
            if known_jobs.contains(gid) {
                continue;
            }
            if self.orphans_pending.contains(gid) {
                tracing::warn!("removing orphaned batch job {gid}");
                if let Err(e) = self.adapter.remove(gid).await {
                    tracing::warn!("failed to remove orphan {gid}: {e:#}");
                }
            } else {
                tracing::debug!("batch job {gid} has no pilot record, watching");
                pending.insert(gid.clone());
            }
        }
        self.orphans_pending = pending;
    }

    /// A pilot stuck past its per-status time budget: kill the batch job
    /// and fail its tasks.
    async fn force_remove(&self, pilot: &PilotRecord, gid: &str, status: BatchStatus) {
        tracing::warn!("pilot {} exceeded its {status} time limit", pilot.pilot_id);
        if let Err(e) = self.adapter.remove(gid).await {
            tracing::warn!("failed to remove batch job {gid}: {e:#}");
        }
        for task in &pilot.tasks {
            let report = TaskErrorReport {
                task_id: task.task_id.clone(),
                dataset_id: task.dataset_id.clone(),
                reason: format!("pilot exceeded {status} time limit"),
                resources: None,
            };
            if let Err(e) = self.client.error_task(&report).await {
                tracing::warn!("failed to report error for task {}: {e:#}", task.task_id);
            }
        }
        self.delete_pilot(&pilot.pilot_id).await;
    }

    /// A pilot whose batch job finished: classify the outcome from the
    /// exit signal and captured logs, report it per task, drop the pilot.
    async fn post_process(&self, pilot: &PilotRecord, completion: &CompletedJob) {
        let submit_dir = pilot.submit_dir.clone().unwrap_or_default();
        let stdlog = read_or_empty(&submit_dir.join(STDLOG_FILENAME)).await;
        let stdout = read_or_empty(&submit_dir.join(STDOUT_FILENAME)).await;
        let stderr = read_or_empty(&submit_dir.join(STDERR_FILENAME)).await;
        let batch_out = read_or_empty(&submit_dir.join(self.adapter.batch_outfile())).await;
        let batch_log = read_or_empty(&submit_dir.join(self.adapter.batch_log())).await;

        let resources = parse_resources_block(&stdout).or_else(|| parse_resources_block(&batch_out));

        for task in &pilot.tasks {
            for (name, data) in [
                (STDLOG_FILENAME, &stdlog),
                (STDOUT_FILENAME, &stdout),
                (STDERR_FILENAME, &stderr),
            ] {
                if data.is_empty() {
                    continue;
                }
                if let Err(e) = self
                    .client
                    .upload_log(&task.task_id, &task.dataset_id, name, data)
                    .await
                {
                    tracing::warn!("failed to upload {name} for task {}: {e:#}", task.task_id);
                }
            }

            let result = if completion.ok {
                self.client.finish_task(&task.task_id, resources.clone()).await
            } else {
                let reason = self.classify_failure(completion, &stdlog, &batch_log);
                tracing::info!("task {} failed: {reason}", task.task_id);
                let report = TaskErrorReport {
                    task_id: task.task_id.clone(),
                    dataset_id: task.dataset_id.clone(),
                    reason,
                    resources: resources.clone(),
                };
                self.client.error_task(&report).await
            };
            if let Err(e) = result {
                tracing::warn!("failed to report outcome for task {}: {e:#}", task.task_id);
            }
        }
        self.delete_pilot(&pilot.pilot_id).await;
    }

    fn classify_failure(
        &self,
        completion: &CompletedJob,
        stdlog: &str,
        batch_log: &str,
    ) -> String {
        if let Some(reason) = completion
            .hold_reason
            .as_deref()
            .and_then(|reason| self.scanner.scan_hold_reason(reason))
        {
            return reason;
        }
        if let Some(reason) = self.scanner.scan_stdlog(stdlog) {
            return reason;
        }
        if let Some(reason) = self.scanner.scan_batch_log(batch_log) {
            return reason;
        }
        if let Some(reason) = &completion.hold_reason {
            return reason.clone();
        }
        match completion.exit_code {
            Some(code) => format!("pilot failed with exit code {code}"),
            None => "pilot failed".to_string(),
        }
    }

    async fn delete_pilot(&self, pilot_id: &str) {
        if let Err(e) = self.client.delete_pilot(pilot_id).await {
            tracing::warn!("failed to delete pilot {pilot_id}: {e:#}");
        }
    }

    /// Delete submit directories older than the whole lifecycle budget
    /// that no live pilot is using.
    async fn sweep_submit_dirs(&self) {
        let cutoff = std::time::SystemTime::now()
            - std::time::Duration::from_secs(self.cfg.max_age_secs(BatchStatus::Unknown));
        let Ok(mut entries) = tokio::fs::read_dir(&self.submit_root).await else {
            return;
        };
        let live_dirs: HashSet<String> = match self.client.pilots(&self.queue_host).await {
            Ok(pilots) => pilots
                .into_iter()
                .filter_map(|p| p.submit_dir)
                .filter_map(|d| d.file_name().map(|n| n.to_string_lossy().into_owned()))
                .collect(),
            Err(e) => {
                tracing::warn!("skipping submit dir sweep: {e:#}");
                return;
            }
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().into_owned();
            // pilot dirs are named {task_id}_{pilot_id}
            if !name.contains('_') || live_dirs.contains(&name) {
                continue;
            }
            let Ok(metadata) = entry.metadata().await else {
                continue;
            };
            if !metadata.is_dir() {
                continue;
            }
            let old = metadata.modified().map(|m| m < cutoff).unwrap_or(false);
            if old {
                tracing::info!("sweeping stale submit dir {name}");
                if let Err(e) = tokio::fs::remove_dir_all(entry.path()).await {
                    tracing::warn!("failed to delete {name}: {e:#}");
                }
            }
        }
    }

    /// Phase B.
    async fn queue_tasks(&self, summary: &CycleSummary) -> anyhow::Result<usize> {
        let waiting = self.client.waiting_task_count(&self.queue_host).await?;
        let ceiling = pilot_ceiling(&self.cfg, waiting, summary.idle, summary.processing);
        if ceiling == 0 {
            tracing::debug!("no pilot capacity this cycle ({waiting} tasks waiting)");
            return Ok(0);
        }
        tracing::info!("queueing up to {ceiling} pilots ({waiting} tasks waiting)");

        let credential = match self.client.credential(&self.queue_host).await {
            Ok(token) => Some(token),
            Err(e) => {
                tracing::warn!("credential issuance failed, pilots run without one: {e:#}");
                None
            }
        };
        let ctx = PipelineCtx {
            client: Arc::clone(&self.client),
            adapter: Arc::clone(&self.adapter),
            site: self.cfg.site.clone(),
            queue_host: self.queue_host.clone(),
            submit_root: self.submit_root.clone(),
            credentials_dir: self.cfg.credentials_dir.clone(),
            batchopts: self.cfg.batchopts.clone(),
            credential,
            datasets: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
            configs: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
        };

        // the envelope keeps the service from handing over tasks the
        // site's worker nodes cannot run
        let envelope = self.cfg.resources.clone();
        let mut groups: HashMap<u64, Vec<PreparedTask>> = HashMap::new();
        let mut claimed = 0;
        while claimed < ceiling {
            let task = match self.client.claim_task(&self.queue_host, &envelope).await {
                Ok(Some(task)) => task,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("task claim failed, stopping this cycle: {e:#}");
                    break;
                }
            };
            claimed += 1;
            match prepare_task(&ctx, &task).await {
                Ok(prepared) => groups.entry(prepared.group).or_default().push(prepared),
                Err(e) => {
                    tracing::warn!("cannot build a pilot for task {}: {e:#}", task.task_id);
                    let report = TaskErrorReport {
                        task_id: task.task_id.clone(),
                        dataset_id: task.dataset_id.clone(),
                        reason: format!("{e:#}"),
                        resources: None,
                    };
                    if let Err(e) = self.client.error_task(&report).await {
                        tracing::warn!("failed to report error for task {}: {e:#}", task.task_id);
                    }
                }
            }
        }
        if groups.is_empty() {
            return Ok(0);
        }
        tracing::debug!("{claimed} claimed tasks fall into {} resource groups", groups.len());

        let mut submitted = 0;
        let mut workers: JoinSet<bool> = JoinSet::new();
        for members in groups.into_values() {
            // every pilot in a group gets the group's shared shape
            let shape = members
                .iter()
                .fold(Requirement::default(), |acc, p| acc.merge_max(&p.requirement));
            for prepared in members {
                while workers.len() >= self.cfg.parallel_submits.max(1) {
                    if let Some(Ok(true)) = workers.join_next().await {
                        submitted += 1;
                    }
                }
                workers.spawn(process_task(ctx.clone(), prepared, shape.clone()));
            }
        }
        while let Some(result) = workers.join_next().await {
            if matches!(result, Ok(true)) {
                submitted += 1;
            }
        }
        Ok(submitted)
    }
}

/// How many pilots may be queued this cycle.
pub(crate) fn pilot_ceiling(
    cfg: &QueueConfig,
    waiting: usize,
    idle: usize,
    processing: usize,
) -> usize {
    let total_room = cfg.max_total_pilots.saturating_sub(processing + idle);
    let idle_room = cfg.max_idle_pilots.saturating_sub(idle);
    waiting
        .min(total_room)
        .min(idle_room)
        .min(cfg.max_pilots_per_cycle)
}

/// Shared context for per-task submission pipelines.
#[derive(Clone)]
struct PipelineCtx {
    client: Arc<dyn QueueService>,
    adapter: Arc<dyn BatchAdapter>,
    site: String,
    queue_host: String,
    submit_root: PathBuf,
    credentials_dir: Option<PathBuf>,
    batchopts: HashMap<String, String>,
    credential: Option<String>,
    // per-cycle lookup caches
    datasets: Arc<tokio::sync::Mutex<HashMap<String, DatasetRecord>>>,
    configs: Arc<tokio::sync::Mutex<HashMap<String, serde_json::Value>>>,
}

/// A claimed task with its lookups done and requirements settled, waiting
/// for a submission pipeline.
struct PreparedTask {
    task: TaskRecord,
    job_index: u64,
    dataset: DatasetRecord,
    config: serde_json::Value,
    requirement: Requirement,
    /// Resource group key; tasks sharing it get identical pilot shapes.
    group: u64,
}

/// Partially created state a failed pipeline must unwind.
#[derive(Default)]
struct PipelineState {
    pilot_id: Option<String>,
    grid_queue_id: Option<String>,
}

/// Resolve a claimed task's context and settle what to ask the batch
/// system for: sanitize its raw requirements, fold in the dataset-wide
/// ones, fill defaults and round onto the bin ladders.
async fn prepare_task(ctx: &PipelineCtx, task: &TaskRecord) -> anyhow::Result<PreparedTask> {
    let job = ctx.client.job(&task.job_id).await?;
    let dataset = {
        let mut cache = ctx.datasets.lock().await;
        match cache.get(&task.dataset_id) {
            Some(dataset) => dataset.clone(),
            None => {
                let dataset = ctx.client.dataset(&task.dataset_id).await?;
                cache.insert(task.dataset_id.clone(), dataset.clone());
                dataset
            }
        }
    };
    let config = {
        let mut cache = ctx.configs.lock().await;
        match cache.get(&task.dataset_id) {
            Some(config) => config.clone(),
            None => {
                let config = ctx.client.dataset_config(&task.dataset_id).await?;
                cache.insert(task.dataset_id.clone(), config.clone());
                config
            }
        }
    };

    // task requirements win over dataset-wide ones by taking the max
    let task_req = sanitize(&task.requirements, false);
    let dataset_req = config
        .pointer("/options/requirements")
        .map(|raw| sanitize(raw, false))
        .unwrap_or_default();
    let requirement = round(&task_req.merge_max(&dataset_req).with_defaults())
        .context("task requirements are unschedulable")?;
    let group = group_hash(&requirement);
    Ok(PreparedTask {
        task: task.clone(),
        job_index: job.job_index,
        dataset,
        config,
        requirement,
        group,
    })
}

/// Run one task's submission pipeline, cleaning up on failure. Returns
/// whether a pilot was successfully submitted; errors never escape, so a
/// bad task cannot abort the cycle.
async fn process_task(ctx: PipelineCtx, prepared: PreparedTask, shape: Requirement) -> bool {
    let mut state = PipelineState::default();
    let task_id = prepared.task.task_id.clone();
    match run_pipeline(&ctx, &prepared, &shape, &mut state).await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!("submission pipeline for task {task_id} failed: {e:#}");
            let report = TaskErrorReport {
                task_id: task_id.clone(),
                dataset_id: prepared.task.dataset_id.clone(),
                reason: format!("{e:#}"),
                resources: None,
            };
            if let Err(e) = ctx.client.error_task(&report).await {
                tracing::warn!("failed to report error for task {task_id}: {e:#}");
            }
            if let Some(gid) = &state.grid_queue_id {
                if let Err(e) = ctx.adapter.remove(gid).await {
                    tracing::warn!("failed to remove batch job {gid}: {e:#}");
                }
            }
            if let Some(pilot_id) = &state.pilot_id {
                if let Err(e) = ctx.client.delete_pilot(pilot_id).await {
                    tracing::warn!("failed to delete pilot {pilot_id}: {e:#}");
                }
            }
            false
        }
    }
}

async fn run_pipeline(
    ctx: &PipelineCtx,
    prepared: &PreparedTask,
    shape: &Requirement,
    state: &mut PipelineState,
) -> anyhow::Result<()> {
    let task = &prepared.task;
    let pilot = PilotRecord {
        pilot_id: uuid::Uuid::new_v4().to_string(),
        queue_host: ctx.queue_host.clone(),
        grid_queue_id: None,
        resources: shape.clone(),
        tasks: vec![PilotTaskRef {
            task_id: task.task_id.clone(),
            dataset_id: task.dataset_id.clone(),
        }],
        submit_dir: None,
        submit_date: Utc::now(),
    };
    let pilot_id = ctx.client.create_pilot(&pilot).await?;
    state.pilot_id = Some(pilot_id.clone());

    let submit_dir = ctx.submit_root.join(format!("{}_{pilot_id}", task.task_id));
    materialize_submit_dir(
        ctx,
        task,
        prepared.job_index,
        &prepared.dataset,
        &prepared.config,
        &submit_dir,
    )
    .await?;
    ctx.client
        .update_pilot(
            &pilot_id,
            serde_json::json!({"submit_dir": submit_dir}),
        )
        .await?;

    let submit_ctx = SubmitContext {
        submit_dir: submit_dir.clone(),
        resources: shape.clone(),
        dataset_id: task.dataset_id.clone(),
        job_id: task.job_id.clone(),
        task_id: task.task_id.clone(),
        queue_host: ctx.queue_host.clone(),
        site: ctx.site.clone(),
        batchopts: ctx.batchopts.clone(),
    };
    ctx.adapter.render_descriptor(&submit_ctx).await?;

    let gid = with_retries(3, || ctx.adapter.submit(&submit_dir)).await?;
    state.grid_queue_id = Some(gid.clone());
    ctx.client
        .update_pilot(&pilot_id, serde_json::json!({"grid_queue_id": gid}))
        .await?;
    tracing::info!("submitted pilot {pilot_id} as batch job {gid} for task {}", task.task_id);
    Ok(())
}

/// Write the loader entrypoint, serialized task context and credential
/// material into a fresh submit directory.
async fn materialize_submit_dir(
    ctx: &PipelineCtx,
    task: &TaskRecord,
    job_index: u64,
    dataset: &DatasetRecord,
    config: &serde_json::Value,
    submit_dir: &Path,
) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(submit_dir)
        .await
        .with_context(|| format!("failed to create {}", submit_dir.display()))?;

    let task_cfg = serde_json::json!({
        "dataset_id": task.dataset_id,
        "dataset": dataset.dataset,
        "job_id": task.job_id,
        "job_index": job_index,
        "task_id": task.task_id,
        "task": task.name,
        "config": config,
    });
    tokio::fs::write(
        submit_dir.join("task_cfg.json"),
        serde_json::to_vec_pretty(&task_cfg)?,
    )
    .await
    .context("failed to write task config")?;

    if let Some(credential) = &ctx.credential {
        tokio::fs::write(submit_dir.join("credential"), credential)
            .await
            .context("failed to write credential")?;
    }

    // long-lived site credentials (proxies, tokens) ride along unchanged
    if let Some(credentials_dir) = &ctx.credentials_dir {
        let mut entries = tokio::fs::read_dir(credentials_dir)
            .await
            .with_context(|| format!("failed to read {}", credentials_dir.display()))?;
        while let Some(entry) = entries.next_entry().await.transpose() {
            let entry = entry?;
            if entry.file_type().await.map(|t| t.is_file()).unwrap_or(false) {
                tokio::fs::copy(entry.path(), submit_dir.join(entry.file_name()))
                    .await
                    .with_context(|| {
                        format!("failed to copy credential {:?}", entry.file_name())
                    })?;
            }
        }
    }

    let loader = format!(
        "#!/bin/sh\n\
         export GRIDFLOW_TASK_ID=\"{}\"\n\
         export GRIDFLOW_DATASET_ID=\"{}\"\n\
         export GRIDFLOW_QUEUE_HOST=\"{}\"\n\
         exec gridflow-pilot \"$@\"\n",
        task.task_id, task.dataset_id, ctx.queue_host
    );
    let loader_path = submit_dir.join("pilot.sh");
    tokio::fs::write(&loader_path, loader)
        .await
        .context("failed to write loader entrypoint")?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&loader_path, std::fs::Permissions::from_mode(0o755))
            .await
            .context("failed to mark loader executable")?;
    }
    Ok(())
}

async fn read_or_empty(path: &Path) -> String {
    tokio::fs::read_to_string(path).await.unwrap_or_default()
}

/// Parse the `Resources:` summary block a pilot prints at the end of its
/// stdout into a dimension -> value map.
pub(crate) fn parse_resources_block(text: &str) -> Option<serde_json::Value> {
    let mut lines = text.lines().skip_while(|line| line.trim() != "Resources:");
    lines.next()?;
    let mut map = serde_json::Map::new();
    for line in lines {
        let Some((key, value)) = line.trim().split_once(':') else {
            break;
        };
        let Ok(value) = value.trim().parse::<f64>() else {
            break;
        };
        if let Some(number) = serde_json::Number::from_f64(value) {
            map.insert(key.trim().to_string(), serde_json::Value::Number(number));
        }
    }
    (!map.is_empty()).then(|| serde_json::Value::Object(map))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::adapter::AdapterKind;
    use crate::core::signatures::DOWNLOAD_FAILURE;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeQueue {
        pilots: Mutex<Vec<PilotRecord>>,
        tasks: Mutex<Vec<TaskRecord>>,
        waiting: Mutex<usize>,
        claims: Mutex<Vec<Requirement>>,
        created: Mutex<Vec<PilotRecord>>,
        updates: Mutex<Vec<(String, serde_json::Value)>>,
        deleted: Mutex<Vec<String>>,
        uploads: Mutex<Vec<(String, String, String)>>,
        finished: Mutex<Vec<(String, Option<serde_json::Value>)>>,
        errors: Mutex<Vec<TaskErrorReport>>,
    }

    #[async_trait]
    impl QueueService for FakeQueue {
        async fn pilots(&self, _queue_host: &str) -> anyhow::Result<Vec<PilotRecord>> {
            Ok(self.pilots.lock().unwrap().clone())
        }

        async fn create_pilot(&self, pilot: &PilotRecord) -> anyhow::Result<String> {
            self.created.lock().unwrap().push(pilot.clone());
            Ok(pilot.pilot_id.clone())
        }

        async fn update_pilot(
            &self,
            pilot_id: &str,
            patch: serde_json::Value,
        ) -> anyhow::Result<()> {
            self.updates
                .lock()
                .unwrap()
                .push((pilot_id.to_string(), patch));
            Ok(())
        }

        async fn delete_pilot(&self, pilot_id: &str) -> anyhow::Result<()> {
            self.deleted.lock().unwrap().push(pilot_id.to_string());
            Ok(())
        }

        async fn waiting_task_count(&self, _queue_host: &str) -> anyhow::Result<usize> {
            Ok(*self.waiting.lock().unwrap())
        }

        async fn claim_task(
            &self,
            _queue_host: &str,
            envelope: &Requirement,
        ) -> anyhow::Result<Option<TaskRecord>> {
            self.claims.lock().unwrap().push(envelope.clone());
            let mut tasks = self.tasks.lock().unwrap();
            if tasks.is_empty() {
                Ok(None)
            } else {
                Ok(Some(tasks.remove(0)))
            }
        }

        async fn job(&self, job_id: &str) -> anyhow::Result<crate::core::pilot::JobRecord> {
            Ok(crate::core::pilot::JobRecord {
                job_id: job_id.to_string(),
                job_index: 0,
            })
        }

        async fn dataset(&self, dataset_id: &str) -> anyhow::Result<DatasetRecord> {
            Ok(DatasetRecord {
                dataset_id: dataset_id.to_string(),
                dataset: 1234,
                group: None,
                user: None,
                debug: false,
            })
        }

        async fn dataset_config(&self, _dataset_id: &str) -> anyhow::Result<serde_json::Value> {
            Ok(serde_json::json!({"options": {"requirements": {"memory": 3.5}}}))
        }

        async fn upload_log(
            &self,
            task_id: &str,
            dataset_id: &str,
            name: &str,
            _data: &str,
        ) -> anyhow::Result<()> {
            self.uploads.lock().unwrap().push((
                task_id.to_string(),
                dataset_id.to_string(),
                name.to_string(),
            ));
            Ok(())
        }

        async fn finish_task(
            &self,
            task_id: &str,
            resources: Option<serde_json::Value>,
        ) -> anyhow::Result<()> {
            self.finished
                .lock()
                .unwrap()
                .push((task_id.to_string(), resources));
            Ok(())
        }

        async fn error_task(&self, report: &TaskErrorReport) -> anyhow::Result<()> {
            self.errors.lock().unwrap().push(report.clone());
            Ok(())
        }

        async fn credential(&self, _queue_host: &str) -> anyhow::Result<String> {
            Ok("test-token".to_string())
        }
    }

    #[derive(Default)]
    struct FakeAdapter {
        live: Mutex<HashMap<String, BatchStatus>>,
        completions: Mutex<Vec<CompletedJob>>,
        removed: Mutex<Vec<String>>,
        submitted: Mutex<usize>,
        /// Submit fails for dirs whose name starts with this prefix.
        fail_prefix: Option<String>,
    }

    #[async_trait]
    impl BatchAdapter for FakeAdapter {
        fn batch_log(&self) -> &'static str {
            "batch.log"
        }

        fn batch_outfile(&self) -> &'static str {
            "batch.out"
        }

        async fn render_descriptor(&self, ctx: &SubmitContext) -> anyhow::Result<PathBuf> {
            let path = ctx.submit_dir.join("descriptor");
            tokio::fs::write(&path, "fake").await?;
            Ok(path)
        }

        async fn submit(&self, submit_dir: &Path) -> anyhow::Result<String> {
            let name = submit_dir.file_name().unwrap().to_string_lossy();
            if let Some(prefix) = &self.fail_prefix {
                if name.starts_with(prefix.as_str()) {
                    anyhow::bail!("submission refused");
                }
            }
            let mut count = self.submitted.lock().unwrap();
            *count += 1;
            Ok(format!("gid-{count}"))
        }

        async fn live_status(
            &self,
            _queue_host: &str,
        ) -> anyhow::Result<HashMap<String, BatchStatus>> {
            Ok(self.live.lock().unwrap().clone())
        }

        async fn completions(
            &self,
            _queue_host: &str,
            _limit: usize,
        ) -> anyhow::Result<Vec<CompletedJob>> {
            Ok(self.completions.lock().unwrap().clone())
        }

        async fn remove(&self, grid_queue_id: &str) -> anyhow::Result<()> {
            self.removed.lock().unwrap().push(grid_queue_id.to_string());
            Ok(())
        }
    }

    fn test_config() -> QueueConfig {
        QueueConfig {
            queue_host: Some("site.host".to_string()),
            adapter: AdapterKind::Htcondor,
            parallel_submits: 2,
            ..Default::default()
        }
    }

    fn engine(
        cfg: QueueConfig,
        queue: Arc<FakeQueue>,
        adapter: Arc<FakeAdapter>,
        submit_root: &Path,
    ) -> ReconciliationEngine {
        ReconciliationEngine::builder(cfg)
            .with_client(queue)
            .with_adapter(adapter)
            .with_submit_root(submit_root)
            .build()
            .unwrap()
    }

    fn pilot(pilot_id: &str, gid: Option<&str>, age_secs: i64) -> PilotRecord {
        PilotRecord {
            pilot_id: pilot_id.to_string(),
            queue_host: "site.host".to_string(),
            grid_queue_id: gid.map(str::to_string),
            resources: Requirement::default(),
            tasks: vec![PilotTaskRef {
                task_id: format!("task-of-{pilot_id}"),
                dataset_id: "d1".to_string(),
            }],
            submit_dir: None,
            submit_date: Utc::now() - chrono::Duration::seconds(age_secs),
        }
    }

    fn task(task_id: &str) -> TaskRecord {
        task_with_memory(task_id, 2.0)
    }

    fn task_with_memory(task_id: &str, memory: f64) -> TaskRecord {
        TaskRecord {
            task_id: task_id.to_string(),
            job_id: "j1".to_string(),
            dataset_id: "d1".to_string(),
            name: "generate".to_string(),
            requirements: serde_json::json!({"cpu": 1, "memory": memory}),
        }
    }

    #[tokio::test]
    async fn test_orphan_removed_only_after_two_cycles() {
        let queue = Arc::new(FakeQueue::default());
        let adapter = Arc::new(FakeAdapter::default());
        adapter
            .live
            .lock()
            .unwrap()
            .insert("999.0".to_string(), BatchStatus::Queued);
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine(test_config(), queue, adapter.clone(), dir.path());

        engine.run_cycle().await.unwrap();
        assert!(adapter.removed.lock().unwrap().is_empty());

        engine.run_cycle().await.unwrap();
        assert_eq!(*adapter.removed.lock().unwrap(), vec!["999.0".to_string()]);
    }

    #[tokio::test]
    async fn test_orphan_grace_resets_when_job_registers() {
        let queue = Arc::new(FakeQueue::default());
        let adapter = Arc::new(FakeAdapter::default());
        adapter
            .live
            .lock()
            .unwrap()
            .insert("7.0".to_string(), BatchStatus::Queued);
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine(test_config(), queue.clone(), adapter.clone(), dir.path());

        engine.run_cycle().await.unwrap();
        // the pilot record shows up before the second cycle
        queue.pilots.lock().unwrap().push(pilot("p1", Some("7.0"), 60));
        engine.run_cycle().await.unwrap();
        assert!(adapter.removed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_vanished_job_deletes_pilot() {
        let queue = Arc::new(FakeQueue::default());
        queue.pilots.lock().unwrap().push(pilot("p1", Some("1.0"), 60));
        let adapter = Arc::new(FakeAdapter::default());
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine(test_config(), queue.clone(), adapter.clone(), dir.path());

        engine.run_cycle().await.unwrap();
        assert_eq!(*queue.deleted.lock().unwrap(), vec!["p1".to_string()]);
        assert!(adapter.removed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_overaged_processing_pilot_force_removed() {
        let queue = Arc::new(FakeQueue::default());
        // ten days old, well past queued+processing budget
        queue
            .pilots
            .lock()
            .unwrap()
            .push(pilot("p1", Some("1.0"), 86400 * 10));
        let adapter = Arc::new(FakeAdapter::default());
        adapter
            .live
            .lock()
            .unwrap()
            .insert("1.0".to_string(), BatchStatus::Processing);
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine(test_config(), queue.clone(), adapter.clone(), dir.path());

        engine.run_cycle().await.unwrap();
        assert_eq!(*adapter.removed.lock().unwrap(), vec!["1.0".to_string()]);
        assert_eq!(*queue.deleted.lock().unwrap(), vec!["p1".to_string()]);
        let errors = queue.errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].reason.contains("time limit"), "{}", errors[0].reason);
        assert_eq!(errors[0].dataset_id, "d1");
    }

    #[tokio::test]
    async fn test_live_pilot_within_budget_left_alone() {
        let queue = Arc::new(FakeQueue::default());
        queue.pilots.lock().unwrap().push(pilot("p1", Some("1.0"), 60));
        let adapter = Arc::new(FakeAdapter::default());
        adapter
            .live
            .lock()
            .unwrap()
            .insert("1.0".to_string(), BatchStatus::Processing);
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine(test_config(), queue.clone(), adapter.clone(), dir.path());

        let summary = engine.run_cycle().await.unwrap();
        assert_eq!(summary.processing, 1);
        assert!(queue.deleted.lock().unwrap().is_empty());
        assert!(adapter.removed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_completion_failure_signature_reason() {
        let dir = tempfile::tempdir().unwrap();
        let submit_dir = dir.path().join("t1_p1");
        std::fs::create_dir_all(&submit_dir).unwrap();
        std::fs::write(
            submit_dir.join(STDLOG_FILENAME),
            "starting\nfailed to download input.i3\n",
        )
        .unwrap();

        let queue = Arc::new(FakeQueue::default());
        let mut record = pilot("p1", Some("1.0"), 60);
        record.submit_dir = Some(submit_dir);
        queue.pilots.lock().unwrap().push(record);

        let adapter = Arc::new(FakeAdapter::default());
        adapter.completions.lock().unwrap().push(CompletedJob {
            grid_queue_id: "1.0".to_string(),
            ok: false,
            exit_code: Some(1),
            hold_reason: None,
        });
        let mut engine = engine(test_config(), queue.clone(), adapter, dir.path());

        engine.run_cycle().await.unwrap();
        let errors = queue.errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].reason, DOWNLOAD_FAILURE);
        assert_eq!(errors[0].dataset_id, "d1");
        assert_eq!(*queue.deleted.lock().unwrap(), vec!["p1".to_string()]);

        // uploaded logs carry the dataset the task belongs to
        let uploads = queue.uploads.lock().unwrap();
        assert!(!uploads.is_empty());
        assert!(uploads.iter().all(|(t, d, _)| t == "task-of-p1" && d == "d1"));
    }

    #[tokio::test]
    async fn test_successful_completion_reports_resources() {
        let dir = tempfile::tempdir().unwrap();
        let submit_dir = dir.path().join("t1_p1");
        std::fs::create_dir_all(&submit_dir).unwrap();
        std::fs::write(
            submit_dir.join(STDOUT_FILENAME),
            "work work\nResources:\n  cpu: 0.9\n  memory: 1.5\ndone\n",
        )
        .unwrap();

        let queue = Arc::new(FakeQueue::default());
        let mut record = pilot("p1", Some("1.0"), 60);
        record.submit_dir = Some(submit_dir);
        queue.pilots.lock().unwrap().push(record);

        let adapter = Arc::new(FakeAdapter::default());
        adapter.completions.lock().unwrap().push(CompletedJob {
            grid_queue_id: "1.0".to_string(),
            ok: true,
            exit_code: Some(0),
            hold_reason: None,
        });
        let mut engine = engine(test_config(), queue.clone(), adapter, dir.path());

        engine.run_cycle().await.unwrap();
        let finished = queue.finished.lock().unwrap();
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].0, "task-of-p1");
        let resources = finished[0].1.as_ref().unwrap();
        assert_eq!(resources["cpu"], 0.9);
        assert_eq!(resources["memory"], 1.5);
        assert!(queue.errors.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_queue_submits_waiting_tasks() {
        let queue = Arc::new(FakeQueue::default());
        *queue.waiting.lock().unwrap() = 2;
        queue.tasks.lock().unwrap().extend([task("t1"), task("t2")]);
        let adapter = Arc::new(FakeAdapter::default());
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine(test_config(), queue.clone(), adapter.clone(), dir.path());

        let summary = engine.run_cycle().await.unwrap();
        assert_eq!(summary.submitted, 2);
        assert_eq!(*adapter.submitted.lock().unwrap(), 2);

        let created = queue.created.lock().unwrap();
        assert_eq!(created.len(), 2);
        // pipelines run concurrently, so find t1's pilot by its task list
        let p1 = created
            .iter()
            .find(|p| p.tasks[0].task_id == "t1")
            .unwrap();
        assert_eq!(p1.tasks[0].dataset_id, "d1");
        // requirement rounded and merged with the dataset-level memory
        assert_eq!(p1.resources.memory, Some((4.0 / std::f64::consts::E).exp()));
        assert_eq!(p1.resources.cpu, Some(1));

        // submit dir named {task_id}_{pilot_id}, loader and config inside
        let submit_dir = dir.path().join(format!("t1_{}", p1.pilot_id));
        assert!(submit_dir.join("pilot.sh").exists());
        assert!(submit_dir.join("task_cfg.json").exists());
        assert!(submit_dir.join("credential").exists());

        // grid queue id recorded
        let updates = queue.updates.lock().unwrap();
        assert!(updates
            .iter()
            .any(|(_, patch)| patch.get("grid_queue_id").is_some()));
    }

    #[tokio::test]
    async fn test_tasks_in_one_resource_group_share_a_pilot_shape() {
        let queue = Arc::new(FakeQueue::default());
        *queue.waiting.lock().unwrap() = 3;
        // 4.0 and 4.01 GB fall in the same memory bin; 10 GB does not
        queue.tasks.lock().unwrap().extend([
            task_with_memory("t-a", 4.0),
            task_with_memory("t-b", 4.01),
            task_with_memory("t-c", 10.0),
        ]);
        let adapter = Arc::new(FakeAdapter::default());
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine(test_config(), queue.clone(), adapter, dir.path());

        let summary = engine.run_cycle().await.unwrap();
        assert_eq!(summary.submitted, 3);

        let created = queue.created.lock().unwrap();
        let find = |task_id: &str| {
            created
                .iter()
                .find(|p| p.tasks[0].task_id == task_id)
                .unwrap()
        };
        assert_eq!(find("t-a").resources, find("t-b").resources);
        assert_ne!(find("t-a").resources, find("t-c").resources);
    }

    #[tokio::test]
    async fn test_claim_envelope_carries_site_resources() {
        let queue = Arc::new(FakeQueue::default());
        *queue.waiting.lock().unwrap() = 1;
        queue.tasks.lock().unwrap().push(task("t1"));
        let adapter = Arc::new(FakeAdapter::default());
        let dir = tempfile::tempdir().unwrap();
        let cfg = QueueConfig {
            resources: Requirement {
                memory: Some(8.0),
                gpu: Some(1),
                ..Default::default()
            },
            ..test_config()
        };
        let mut engine = engine(cfg, queue.clone(), adapter, dir.path());

        engine.run_cycle().await.unwrap();
        let claims = queue.claims.lock().unwrap();
        assert!(!claims.is_empty());
        assert_eq!(claims[0].memory, Some(8.0));
        assert_eq!(claims[0].gpu, Some(1));
    }

    #[tokio::test]
    async fn test_pipeline_failure_does_not_abort_cycle() {
        let queue = Arc::new(FakeQueue::default());
        *queue.waiting.lock().unwrap() = 2;
        queue.tasks.lock().unwrap().extend([task("t1"), task("t2")]);
        let adapter = Arc::new(FakeAdapter {
            fail_prefix: Some("t1_".to_string()),
            ..Default::default()
        });
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine(test_config(), queue.clone(), adapter.clone(), dir.path());

        let summary = engine.run_cycle().await.unwrap();
        assert_eq!(summary.submitted, 1);

        // the failed task was reported and its half-made pilot deleted
        let errors = queue.errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].task_id, "t1");
        assert_eq!(queue.deleted.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_no_submission_when_queue_empty() {
        let queue = Arc::new(FakeQueue::default());
        *queue.waiting.lock().unwrap() = 5;
        // waiting count is stale; claim returns nothing
        let adapter = Arc::new(FakeAdapter::default());
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine(test_config(), queue.clone(), adapter, dir.path());

        let summary = engine.run_cycle().await.unwrap();
        assert_eq!(summary.submitted, 0);
        assert!(queue.errors.lock().unwrap().is_empty());
    }

    #[test]
    fn test_pilot_ceiling_math() {
        let cfg = QueueConfig {
            max_idle_pilots: 10,
            max_total_pilots: 20,
            max_pilots_per_cycle: 8,
            ..Default::default()
        };
        // limited by waiting tasks
        assert_eq!(pilot_ceiling(&cfg, 3, 0, 0), 3);
        // limited by the per-cycle cap
        assert_eq!(pilot_ceiling(&cfg, 100, 0, 0), 8);
        // limited by idle headroom
        assert_eq!(pilot_ceiling(&cfg, 100, 7, 0), 3);
        // limited by total headroom
        assert_eq!(pilot_ceiling(&cfg, 100, 2, 17), 1);
        // saturates at zero
        assert_eq!(pilot_ceiling(&cfg, 100, 12, 30), 0);
    }

    #[test]
    fn test_parse_resources_block() {
        let text = "setup\nResources:\n  cpu: 1.2\n  memory: 3.4\nall done\n";
        let parsed = parse_resources_block(text).unwrap();
        assert_eq!(parsed["cpu"], 1.2);
        assert_eq!(parsed["memory"], 3.4);

        assert!(parse_resources_block("no block here").is_none());
        assert!(parse_resources_block("Resources:\nnot a pair").is_none());
    }

    #[tokio::test]
    async fn test_sweep_ignores_fresh_and_live_dirs() {
        let queue = Arc::new(FakeQueue::default());
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("t9_p9")).unwrap();
        let adapter = Arc::new(FakeAdapter::default());
        let mut engine = engine(test_config(), queue, adapter, dir.path());

        engine.run_cycle().await.unwrap();
        // fresh directory survives the sweep
        assert!(dir.path().join("t9_p9").exists());
    }
}
