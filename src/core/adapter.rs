//! Batch-system adapters.
//!
//! The engine talks to the local batch system through [`BatchAdapter`], a
//! small object-safe contract: render a submission descriptor, submit it,
//! list live jobs, list recent completions, remove a job. Both shipped
//! adapters drive the native command-line tools through `tokio::process`.

use crate::resources::group::Requirement;
use anyhow::Context;
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;

/// Lifecycle vocabulary every batch system is translated into.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    strum::Display,
    strum::EnumString,
    serde::Serialize,
    serde::Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Queued,
    Processing,
    Completed,
    Error,
    #[default]
    Unknown,
}

/// A finished batch job as reported by the batch system's history.
#[derive(Debug, Clone)]
pub struct CompletedJob {
    pub grid_queue_id: String,
    /// Clean completion: terminal status, zero exit code, no signal.
    pub ok: bool,
    pub exit_code: Option<i64>,
    /// Batch-system explanation when the job was held or killed, e.g. a
    /// resource policy message. Fed to failure-signature scanning.
    pub hold_reason: Option<String>,
}

/// Everything an adapter needs to render one pilot submission.
#[derive(Debug, Clone)]
pub struct SubmitContext {
    pub submit_dir: PathBuf,
    pub resources: Requirement,
    pub dataset_id: String,
    pub job_id: String,
    pub task_id: String,
    pub queue_host: String,
    pub site: String,
    /// Free-form extra descriptor lines from configuration.
    pub batchopts: HashMap<String, String>,
}

#[async_trait]
pub trait BatchAdapter: Send + Sync {
    /// Filename of the batch system's own event log inside the submit dir.
    fn batch_log(&self) -> &'static str;
    /// Filename the pilot's stdout is captured to.
    fn batch_outfile(&self) -> &'static str;

    /// Write the submission descriptor into `ctx.submit_dir` and return
    /// its path.
    async fn render_descriptor(&self, ctx: &SubmitContext) -> anyhow::Result<PathBuf>;

    /// Submit the descriptor in `submit_dir`; returns the batch system's
    /// job identifier.
    async fn submit(&self, submit_dir: &Path) -> anyhow::Result<String>;

    /// Status of every live job belonging to `queue_host`.
    async fn live_status(&self, queue_host: &str) -> anyhow::Result<HashMap<String, BatchStatus>>;

    /// Recently finished jobs belonging to `queue_host`, newest first,
    /// at most `limit`.
    async fn completions(&self, queue_host: &str, limit: usize)
        -> anyhow::Result<Vec<CompletedJob>>;

    /// Remove a job from the batch system.
    async fn remove(&self, grid_queue_id: &str) -> anyhow::Result<()>;
}

/// Which adapter a site runs, selected in configuration.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString, serde::Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum AdapterKind {
    Htcondor,
    Slurm,
}

pub fn create_adapter(
    kind: AdapterKind,
    batchopts: HashMap<String, String>,
) -> Arc<dyn BatchAdapter> {
    match kind {
        AdapterKind::Htcondor => Arc::new(CondorAdapter { batchopts }),
        AdapterKind::Slurm => Arc::new(SlurmAdapter { batchopts }),
    }
}

/// Retry a transient operation up to `attempts` times with linear backoff.
pub async fn with_retries<T, F, Fut>(attempts: u32, mut op: F) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let mut last_err = None;
    for attempt in 1..=attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                tracing::warn!("attempt {attempt}/{attempts} failed: {e:#}");
                last_err = Some(e);
                if attempt < attempts {
                    tokio::time::sleep(Duration::from_secs(attempt as u64)).await;
                }
            }
        }
    }
    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("no attempts made")))
}

async fn run_command(cmd: &mut Command) -> anyhow::Result<String> {
    let program = cmd.as_std().get_program().to_string_lossy().into_owned();
    let output = cmd
        .output()
        .await
        .with_context(|| format!("failed to run {program}"))?;
    if !output.status.success() {
        anyhow::bail!(
            "{program} exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

// ---------------------------------------------------------------------------
// HTCondor

pub struct CondorAdapter {
    batchopts: HashMap<String, String>,
}

/// Classad attribute carrying the owning queue host, so status listings
/// can be constrained to our own jobs.
const CONDOR_HOST_AD: &str = "GridflowQueueHost";

impl CondorAdapter {
    fn render(&self, ctx: &SubmitContext) -> String {
        let mut lines = vec![
            format!("output = {}", self.batch_outfile()),
            "error = condor.err".to_string(),
            format!("log = {}", self.batch_log()),
            "notification = never".to_string(),
            "executable = pilot.sh".to_string(),
            "+IsGridflowPilot = true".to_string(),
            format!("+{CONDOR_HOST_AD} = \"{}\"", ctx.queue_host),
            format!("+GridflowSite = \"{}\"", ctx.site),
            format!("+GridflowDatasetId = \"{}\"", ctx.dataset_id),
            format!("+GridflowJobId = \"{}\"", ctx.job_id),
            format!("+GridflowTaskId = \"{}\"", ctx.task_id),
        ];
        if let Some(cpu) = ctx.resources.cpu {
            lines.push(format!("request_cpus = {cpu}"));
        }
        if let Some(gpu) = ctx.resources.gpu.filter(|g| *g > 0) {
            lines.push(format!("request_gpus = {gpu}"));
        }
        if let Some(memory) = ctx.resources.memory {
            // condor wants MB
            lines.push(format!("request_memory = {}", (memory * 1000.0) as u64));
        }
        if let Some(disk) = ctx.resources.disk {
            // condor wants KB
            lines.push(format!("request_disk = {}", (disk * 1_000_000.0) as u64));
        }
        for (key, value) in &self.batchopts {
            lines.push(format!("{key} = {value}"));
        }
        lines.push("queue".to_string());
        lines.join("\n") + "\n"
    }
}

#[async_trait]
impl BatchAdapter for CondorAdapter {
    fn batch_log(&self) -> &'static str {
        "condor.log"
    }

    fn batch_outfile(&self) -> &'static str {
        "condor.out"
    }

    async fn render_descriptor(&self, ctx: &SubmitContext) -> anyhow::Result<PathBuf> {
        let path = ctx.submit_dir.join("condor.submit");
        tokio::fs::write(&path, self.render(ctx))
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(path)
    }

    async fn submit(&self, submit_dir: &Path) -> anyhow::Result<String> {
        let out = run_command(
            Command::new("condor_submit")
                .arg("-terse")
                .arg("condor.submit")
                .current_dir(submit_dir),
        )
        .await?;
        // -terse prints "1234.0 - 1234.0"
        out.split_whitespace()
            .next()
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("condor_submit returned no job id: {out:?}"))
    }

    async fn live_status(&self, queue_host: &str) -> anyhow::Result<HashMap<String, BatchStatus>> {
        let out = run_command(
            Command::new("condor_q")
                .arg("-constraint")
                .arg(format!("{CONDOR_HOST_AD} == \"{queue_host}\""))
                .args(["-af", "ClusterId", "ProcId", "JobStatus"]),
        )
        .await?;
        Ok(parse_condor_queue(&out))
    }

    async fn completions(
        &self,
        queue_host: &str,
        limit: usize,
    ) -> anyhow::Result<Vec<CompletedJob>> {
        let out = run_command(
            Command::new("condor_history")
                .arg("-constraint")
                .arg(format!("{CONDOR_HOST_AD} == \"{queue_host}\""))
                .args(["-limit", &limit.to_string()])
                .args([
                    "-af",
                    "ClusterId",
                    "ProcId",
                    "JobStatus",
                    "ExitCode",
                    "ExitBySignal",
                    "HoldReason",
                ]),
        )
        .await?;
        Ok(parse_condor_history(&out))
    }

    async fn remove(&self, grid_queue_id: &str) -> anyhow::Result<()> {
        run_command(Command::new("condor_rm").arg(grid_queue_id)).await?;
        Ok(())
    }
}

fn condor_status(code: &str) -> BatchStatus {
    match code {
        "0" | "1" => BatchStatus::Queued,
        "2" | "3" | "6" | "7" => BatchStatus::Processing,
        "4" => BatchStatus::Completed,
        "5" => BatchStatus::Error,
        _ => BatchStatus::Unknown,
    }
}

fn parse_condor_queue(out: &str) -> HashMap<String, BatchStatus> {
    let mut jobs = HashMap::new();
    for line in out.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if let [cluster, proc, status] = fields[..] {
            jobs.insert(format!("{cluster}.{proc}"), condor_status(status));
        }
    }
    jobs
}

fn parse_condor_history(out: &str) -> Vec<CompletedJob> {
    let mut jobs = Vec::new();
    for line in out.lines() {
        let fields: Vec<&str> = line.splitn(6, char::is_whitespace).collect();
        let [cluster, proc, status, exit_code, exit_by_signal, hold_reason] = fields[..] else {
            continue;
        };
        let exit_code = exit_code.parse::<i64>().ok();
        let ok = condor_status(status) == BatchStatus::Completed
            && exit_code == Some(0)
            && !exit_by_signal.eq_ignore_ascii_case("true");
        let hold_reason = hold_reason.trim();
        jobs.push(CompletedJob {
            grid_queue_id: format!("{cluster}.{proc}"),
            ok,
            exit_code,
            hold_reason: (!hold_reason.is_empty() && hold_reason != "undefined")
                .then(|| hold_reason.to_string()),
        });
    }
    jobs
}

// ---------------------------------------------------------------------------
// SLURM

pub struct SlurmAdapter {
    batchopts: HashMap<String, String>,
}

/// Job name used for every pilot so sacct/squeue can be narrowed before
/// comment filtering.
const SLURM_JOB_NAME: &str = "gridflow-pilot";

impl SlurmAdapter {
    fn render(&self, ctx: &SubmitContext) -> String {
        let mut lines = vec![
            "#!/bin/bash".to_string(),
            format!("#SBATCH --job-name={SLURM_JOB_NAME}"),
            format!("#SBATCH --output={}", self.batch_outfile()),
            "#SBATCH --error=slurm.err".to_string(),
            format!(
                "#SBATCH --comment={}",
                slurm_comment(&ctx.queue_host, &ctx.dataset_id, &ctx.job_id, &ctx.task_id)
            ),
        ];
        if let Some(cpu) = ctx.resources.cpu {
            lines.push(format!("#SBATCH --cpus-per-task={cpu}"));
        }
        if let Some(gpu) = ctx.resources.gpu.filter(|g| *g > 0) {
            lines.push(format!("#SBATCH --gres=gpu:{gpu}"));
        }
        if let Some(memory) = ctx.resources.memory {
            lines.push(format!("#SBATCH --mem={}M", (memory * 1000.0) as u64));
        }
        if let Some(disk) = ctx.resources.disk {
            lines.push(format!("#SBATCH --tmp={}M", (disk * 1000.0) as u64));
        }
        if let Some(time) = ctx.resources.time {
            lines.push(format!("#SBATCH --time={}", (time * 60.0) as u64));
        }
        for (key, value) in &self.batchopts {
            lines.push(format!("#SBATCH --{key}={value}"));
        }
        lines.push("exec ./pilot.sh".to_string());
        lines.join("\n") + "\n"
    }
}

fn slurm_comment(queue_host: &str, dataset_id: &str, job_id: &str, task_id: &str) -> String {
    format!("gridflow:{queue_host}:{dataset_id}:{job_id}:{task_id}")
}

#[async_trait]
impl BatchAdapter for SlurmAdapter {
    fn batch_log(&self) -> &'static str {
        // slurm has no separate event log; stdout capture doubles as it
        "slurm.out"
    }

    fn batch_outfile(&self) -> &'static str {
        "slurm.out"
    }

    async fn render_descriptor(&self, ctx: &SubmitContext) -> anyhow::Result<PathBuf> {
        let path = ctx.submit_dir.join("submit.sbatch");
        tokio::fs::write(&path, self.render(ctx))
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(path)
    }

    async fn submit(&self, submit_dir: &Path) -> anyhow::Result<String> {
        let out = run_command(
            Command::new("sbatch")
                .arg("--parsable")
                .arg("submit.sbatch")
                .current_dir(submit_dir),
        )
        .await?;
        let id = out.trim().split(';').next().unwrap_or_default();
        if id.is_empty() {
            anyhow::bail!("sbatch returned no job id: {out:?}");
        }
        Ok(id.to_string())
    }

    async fn live_status(&self, queue_host: &str) -> anyhow::Result<HashMap<String, BatchStatus>> {
        let out = run_command(
            Command::new("squeue")
                .args(["--noheader", "--name", SLURM_JOB_NAME])
                .args(["-o", "%i %t %k"]),
        )
        .await?;
        Ok(parse_squeue(&out, queue_host))
    }

    async fn completions(
        &self,
        queue_host: &str,
        limit: usize,
    ) -> anyhow::Result<Vec<CompletedJob>> {
        let out = run_command(
            Command::new("sacct")
                .args(["--noheader", "--parsable2"])
                .args(["--name", SLURM_JOB_NAME])
                .args(["-o", "JobID,State,ExitCode,Comment"]),
        )
        .await?;
        let mut jobs = parse_sacct(&out, queue_host);
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn remove(&self, grid_queue_id: &str) -> anyhow::Result<()> {
        run_command(Command::new("scancel").arg(grid_queue_id)).await?;
        Ok(())
    }
}

fn slurm_status(code: &str) -> BatchStatus {
    // squeue short codes and sacct long states
    match code {
        "PD" | "CF" | "PENDING" | "CONFIGURING" => BatchStatus::Queued,
        "R" | "CG" | "S" | "RUNNING" | "COMPLETING" | "SUSPENDED" => BatchStatus::Processing,
        "CD" | "COMPLETED" => BatchStatus::Completed,
        "F" | "CA" | "TO" | "OOM" | "NF" | "BF" | "FAILED" | "CANCELLED" | "TIMEOUT"
        | "OUT_OF_MEMORY" | "NODE_FAIL" | "BOOT_FAIL" => BatchStatus::Error,
        _ => BatchStatus::Unknown,
    }
}

fn parse_squeue(out: &str, queue_host: &str) -> HashMap<String, BatchStatus> {
    let tag = format!("gridflow:{queue_host}:");
    let mut jobs = HashMap::new();
    for line in out.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if let [id, state, comment] = fields[..] {
            if comment.starts_with(&tag) {
                jobs.insert(id.to_string(), slurm_status(state));
            }
        }
    }
    jobs
}

fn parse_sacct(out: &str, queue_host: &str) -> Vec<CompletedJob> {
    let tag = format!("gridflow:{queue_host}:");
    let mut jobs = Vec::new();
    for line in out.lines() {
        let fields: Vec<&str> = line.split('|').collect();
        let [id, state, exit_code, comment] = fields[..] else {
            continue;
        };
        // sacct repeats steps as "1234.batch"; only the parent row counts
        if id.contains('.') || !comment.starts_with(&tag) {
            continue;
        }
        // CANCELLED may carry a suffix like "CANCELLED by 1000"
        let state = state.split_whitespace().next().unwrap_or(state);
        let status = slurm_status(state);
        if !matches!(status, BatchStatus::Completed | BatchStatus::Error) {
            continue;
        }
        let exit_code = exit_code.split(':').next().and_then(|c| c.parse().ok());
        let hold_reason = match state {
            "OUT_OF_MEMORY" => Some("Job exceeded memory limit".to_string()),
            "TIMEOUT" => Some("Job exceeded time limit".to_string()),
            _ => None,
        };
        jobs.push(CompletedJob {
            grid_queue_id: id.to_string(),
            ok: status == BatchStatus::Completed && exit_code == Some(0),
            exit_code,
            hold_reason,
        });
    }
    jobs
}
