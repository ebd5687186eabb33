//! Node-local resource accounting for a running pilot.
//!
//! The ledger tracks total, available and claimed capacity, measures what
//! each claimed task actually consumes, and applies the overusage policy.
//! It is an explicitly constructed object owned by the pilot process; the
//! owner wraps it in a mutex so `claim`/`release` are mutually exclusive.

use super::{
    detect_total_resources, overusage_limit, ResourceError, ResourceRequest, Resources,
};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// One cpu/memory measurement over a process tree: cores in use and
/// resident memory in GB.
#[derive(Debug, Clone, Copy)]
pub struct ProcessSample {
    pub cpu: f64,
    pub memory: f64,
}

/// Measurement backend. Split out so ledgers are testable without live
/// processes or GPUs.
pub trait UsageProbe: Send {
    /// Sample a process and all its descendants. `None` if the process is
    /// gone or cannot be inspected.
    fn sample_process_tree(&mut self, pid: u32) -> Option<ProcessSample>;
    /// Utilization of one GPU device in [0, 1], by device id.
    fn gpu_utilization(&mut self, device: &str) -> Option<f64>;
}

/// Probe backed by sysinfo (process tree) and NVML (GPU utilization).
pub struct SystemProbe {
    system: sysinfo::System,
    nvml: Option<nvml_wrapper::Nvml>,
}

impl SystemProbe {
    pub fn new() -> Self {
        let nvml = match nvml_wrapper::Nvml::init() {
            Ok(nvml) => Some(nvml),
            Err(e) => {
                tracing::info!("NVML unavailable, gpu usage will not be tracked: {e}");
                None
            }
        };
        SystemProbe {
            system: sysinfo::System::new(),
            nvml,
        }
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl UsageProbe for SystemProbe {
    fn sample_process_tree(&mut self, pid: u32) -> Option<ProcessSample> {
        self.system
            .refresh_processes(sysinfo::ProcessesToUpdate::All, true);
        let root = sysinfo::Pid::from_u32(pid);
        self.system.process(root)?;

        // walk parent links to a fixpoint to collect the whole tree
        let mut members = vec![root];
        loop {
            let mut grew = false;
            for (child, proc) in self.system.processes() {
                if members.contains(child) {
                    continue;
                }
                if proc.parent().is_some_and(|p| members.contains(&p)) {
                    members.push(*child);
                    grew = true;
                }
            }
            if !grew {
                break;
            }
        }

        let mut cpu = 0.0;
        let mut memory = 0.0;
        for pid in &members {
            if let Some(proc) = self.system.process(*pid) {
                cpu += proc.cpu_usage() as f64 / 100.0;
                memory += proc.memory() as f64 / 1e9;
            }
        }
        Some(ProcessSample { cpu, memory })
    }

    fn gpu_utilization(&mut self, device: &str) -> Option<f64> {
        let nvml = self.nvml.as_ref()?;
        // device ids may look like "CUDA0" or "0"; keep the digits
        let index: u32 = device
            .chars()
            .filter(|c| c.is_ascii_digit())
            .collect::<String>()
            .parse()
            .ok()?;
        let rates = nvml.device_by_index(index).ok()?.utilization_rates().ok()?;
        Some(rates.gpu as f64 / 100.0)
    }
}

/// How stale a cached measurement may get before the dimension is
/// re-measured on the next `get_usage` call.
#[derive(Debug, Clone, Copy)]
pub struct LookupIntervals {
    pub process: Duration,
    pub gpu: Duration,
    pub disk: Duration,
}

impl Default for LookupIntervals {
    fn default() -> Self {
        LookupIntervals {
            process: Duration::from_secs(1),
            gpu: Duration::from_secs(1),
            // directory walks are expensive
            disk: Duration::from_secs(180),
        }
    }
}

/// Smoothed measurements for one claim. cpu/memory keep a bounded window
/// of samples; disk and gpu keep the latest walk/poll.
struct UsageHistory {
    cpu: VecDeque<f64>,
    memory: VecDeque<f64>,
    disk: f64,
    gpu: f64,
    process_last: Option<Instant>,
    disk_last: Option<Instant>,
    gpu_last: Option<Instant>,
}

impl UsageHistory {
    fn new(window: usize) -> Self {
        UsageHistory {
            cpu: VecDeque::with_capacity(window),
            memory: VecDeque::with_capacity(window),
            disk: 0.0,
            gpu: 0.0,
            process_last: None,
            disk_last: None,
            gpu_last: None,
        }
    }
}

/// Smoothed usage of one claim across all dimensions. `time` is wall-clock
/// hours since the task's process was registered.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Usage {
    pub cpu: f64,
    pub gpu: f64,
    pub memory: f64,
    pub disk: f64,
    pub time: f64,
}

#[derive(Debug, Default, Clone, Copy)]
struct UsageStat {
    max: f64,
    cnt: u64,
    avg: f64,
}

struct Claim {
    resources: Resources,
    pid: Option<u32>,
    workdir: Option<PathBuf>,
    started: Option<Instant>,
}

pub struct ResourceLedger {
    total: Resources,
    available: Resources,
    claims: HashMap<String, Claim>,
    history: HashMap<String, UsageHistory>,
    used: HashMap<String, HashMap<&'static str, UsageStat>>,
    probe: Box<dyn UsageProbe>,
    window: usize,
    intervals: LookupIntervals,
    started: Instant,
}

pub struct ResourceLedgerBuilder {
    total: Option<Resources>,
    probe: Option<Box<dyn UsageProbe>>,
    window: usize,
    intervals: LookupIntervals,
}

impl ResourceLedgerBuilder {
    pub fn new() -> Self {
        ResourceLedgerBuilder {
            total: None,
            probe: None,
            window: 10,
            intervals: LookupIntervals::default(),
        }
    }

    /// Override the auto-detected node totals.
    pub fn with_total(mut self, total: Resources) -> Self {
        self.total = Some(total);
        self
    }

    pub fn with_probe(mut self, probe: Box<dyn UsageProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn with_window(mut self, window: usize) -> Self {
        self.window = window.max(1);
        self
    }

    pub fn with_intervals(mut self, intervals: LookupIntervals) -> Self {
        self.intervals = intervals;
        self
    }

    pub fn build(self) -> ResourceLedger {
        let total = self.total.unwrap_or_else(detect_total_resources);
        tracing::info!("total resources: {total:?}");
        ResourceLedger {
            available: total.clone(),
            total,
            claims: HashMap::new(),
            history: HashMap::new(),
            used: HashMap::new(),
            probe: self.probe.unwrap_or_else(|| Box::new(SystemProbe::new())),
            window: self.window,
            intervals: self.intervals,
            started: Instant::now(),
        }
    }
}

impl Default for ResourceLedgerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceLedger {
    pub fn builder() -> ResourceLedgerBuilder {
        ResourceLedgerBuilder::new()
    }

    pub fn total(&self) -> &Resources {
        &self.total
    }

    /// Unclaimed capacity. `time` is the live wall-clock remaining, not a
    /// stored quantity.
    pub fn available(&self) -> Resources {
        Resources {
            time: self.time_remaining(),
            ..self.available.clone()
        }
    }

    fn time_remaining(&self) -> f64 {
        (self.total.time - self.started.elapsed().as_secs_f64() / 3600.0).max(0.0)
    }

    /// Claim resources for a task. With no request, everything currently
    /// available is granted. Validation happens before any mutation, so a
    /// failed claim leaves the ledger untouched.
    pub fn claim(
        &mut self,
        task_id: &str,
        requested: Option<&ResourceRequest>,
    ) -> Result<Resources, ResourceError> {
        let grant = match requested {
            None => {
                tracing::info!("claiming all available resources for {task_id}");
                self.available()
            }
            Some(req) => {
                let mut grant = Resources {
                    time: self.time_remaining(),
                    ..Default::default()
                };
                if let Some(cpu) = req.cpu {
                    if cpu > self.available.cpu {
                        return Err(ResourceError::Insufficient {
                            resource: "cpu",
                            requested: cpu,
                            available: self.available.cpu,
                        });
                    }
                    grant.cpu = cpu;
                }
                if let Some(gpu) = req.gpu {
                    if gpu > self.available.gpu.len() {
                        return Err(ResourceError::Insufficient {
                            resource: "gpu",
                            requested: gpu as f64,
                            available: self.available.gpu.len() as f64,
                        });
                    }
                    grant.gpu = self.available.gpu[..gpu].to_vec();
                }
                if let Some(memory) = req.memory {
                    if memory > self.available.memory {
                        return Err(ResourceError::Insufficient {
                            resource: "memory",
                            requested: memory,
                            available: self.available.memory,
                        });
                    }
                    grant.memory = memory;
                }
                if let Some(disk) = req.disk {
                    if disk > self.available.disk {
                        return Err(ResourceError::Insufficient {
                            resource: "disk",
                            requested: disk,
                            available: self.available.disk,
                        });
                    }
                    grant.disk = disk;
                }
                if let Some(time) = req.time {
                    let remaining = self.time_remaining();
                    if time > remaining {
                        return Err(ResourceError::Insufficient {
                            resource: "time",
                            requested: time,
                            available: remaining,
                        });
                    }
                    grant.time = time;
                }
                grant
            }
        };

        // the claim is valid; remove from available. time is informational
        // and never subtracted.
        self.available.cpu -= grant.cpu;
        self.available.memory -= grant.memory;
        self.available.disk -= grant.disk;
        self.available.gpu.retain(|id| !grant.gpu.contains(id));

        tracing::info!("granted {grant:?} to {task_id}");
        self.claims.insert(
            task_id.to_string(),
            Claim {
                resources: grant.clone(),
                pid: None,
                workdir: None,
                started: None,
            },
        );
        Ok(grant)
    }

    /// Release a claim, returning exactly what was claimed. Unknown task
    /// ids are a warning, not an error.
    pub fn release(&mut self, task_id: &str) {
        let Some(claim) = self.claims.remove(task_id) else {
            tracing::warn!("release: {task_id} not claimed");
            return;
        };
        self.available.cpu += claim.resources.cpu;
        self.available.memory += claim.resources.memory;
        self.available.disk += claim.resources.disk;
        self.available.gpu.extend(claim.resources.gpu);
        self.history.remove(task_id);
        self.used.remove(task_id);
    }

    /// Attach the OS process and working directory to an existing claim so
    /// usage can be measured.
    pub fn register_process(&mut self, task_id: &str, pid: u32, workdir: impl Into<PathBuf>) {
        let Some(claim) = self.claims.get_mut(task_id) else {
            tracing::warn!("register_process: {task_id} not claimed");
            return;
        };
        claim.pid = Some(pid);
        claim.workdir = Some(workdir.into());
        claim.started = Some(Instant::now());
    }

    /// Measure what a claim is currently using.
    ///
    /// cpu/memory are smoothed over a bounded moving average; a partial
    /// window reports the mean of the samples collected so far. disk and
    /// gpu keep the latest measurement. Each dimension is re-measured only
    /// once its minimum recheck interval has passed, unless `force`.
    pub fn get_usage(&mut self, task_id: &str, force: bool) -> anyhow::Result<Usage> {
        let claim = self
            .claims
            .get(task_id)
            .ok_or_else(|| anyhow::anyhow!("unknown claim for {task_id}"))?;
        let pid = claim
            .pid
            .ok_or_else(|| anyhow::anyhow!("no process registered for {task_id}"))?;
        let workdir = claim
            .workdir
            .clone()
            .ok_or_else(|| anyhow::anyhow!("no working directory for {task_id}"))?;
        let started = claim
            .started
            .ok_or_else(|| anyhow::anyhow!("no start time for {task_id}"))?;
        let gpu_ids = claim.resources.gpu.clone();

        let now = Instant::now();
        let window = self.window;
        let intervals = self.intervals;
        let history = self
            .history
            .entry(task_id.to_string())
            .or_insert_with(|| UsageHistory::new(window));

        let stale = |last: Option<Instant>, interval: Duration| {
            force || last.map_or(true, |t| now.duration_since(t) > interval)
        };

        if stale(history.process_last, intervals.process) {
            history.process_last = Some(now);
            if let Some(sample) = self.probe.sample_process_tree(pid) {
                if history.cpu.len() >= window {
                    history.cpu.pop_front();
                }
                history.cpu.push_back(sample.cpu);
                if history.memory.len() >= window {
                    history.memory.pop_front();
                }
                history.memory.push_back(sample.memory);
            }
        }

        if stale(history.disk_last, intervals.disk) {
            history.disk_last = Some(now);
            history.disk = dir_size(&workdir) as f64 / 1e9;
        }

        if !gpu_ids.is_empty() && stale(history.gpu_last, intervals.gpu) {
            history.gpu_last = Some(now);
            let mut total = 0.0;
            for id in &gpu_ids {
                if let Some(util) = self.probe.gpu_utilization(id) {
                    total += util;
                }
            }
            history.gpu = total;
        }

        let usage = Usage {
            cpu: mean(&history.cpu),
            memory: mean(&history.memory),
            disk: history.disk,
            gpu: history.gpu,
            time: started.elapsed().as_secs_f64() / 3600.0,
        };
        tracing::debug!("{task_id} is using {usage:?}");
        Ok(usage)
    }

    /// Compare every active claim's usage against its allocation.
    ///
    /// Returns a task_id -> reason map for claims violating the overusage
    /// policy; the first violating dimension short-circuits further checks
    /// for that task. Also updates the running max/average summaries behind
    /// `get_peak`/`get_final`.
    pub fn check_claims(&mut self, force: bool) -> HashMap<String, String> {
        let mut violations = HashMap::new();
        let task_ids: Vec<String> = self.claims.keys().cloned().collect();
        for task_id in task_ids {
            let usage = match self.get_usage(&task_id, force) {
                Ok(usage) => usage,
                Err(e) => {
                    tracing::warn!("error getting usage for {task_id}: {e:#}");
                    continue;
                }
            };
            let Some(claim) = self.claims.get(&task_id).map(|c| c.resources.clone()) else {
                continue;
            };

            let checks: [(&'static str, f64, f64, f64); 5] = [
                ("cpu", usage.cpu, claim.cpu, self.available.cpu),
                (
                    "gpu",
                    usage.gpu,
                    claim.gpu.len() as f64,
                    self.available.gpu.len() as f64,
                ),
                ("memory", usage.memory, claim.memory, self.available.memory),
                ("disk", usage.disk, claim.disk, self.available.disk),
                ("time", usage.time, claim.time, self.time_remaining()),
            ];

            for (name, used, claimed, avail) in checks.iter().copied() {
                let overusage = used - claimed;
                if overusage <= 0.0 {
                    continue;
                }
                let limit = overusage_limit(name);
                if claimed > 0.0 && used / claimed < limit.ignore {
                    tracing::info!("ignoring overusage of {name} for {task_id}");
                } else if name == "time" && avail > 0.0 {
                    // over its slice, but the pilot still has wall-clock left
                    tracing::info!("manageable overusage of time for {task_id}");
                } else if name != "time"
                    && overusage < avail
                    && claimed > 0.0
                    && used / claimed < limit.allowed
                {
                    tracing::info!("manageable overusage of {name} for {task_id}");
                } else {
                    violations.insert(
                        task_id.clone(),
                        format!("Resource overusage for {name}: {used}"),
                    );
                    break;
                }
            }

            let stats = self.used.entry(task_id.clone()).or_default();
            for (name, used, _, _) in checks.iter().copied() {
                let stat = stats.entry(name).or_default();
                stat.avg = (used + stat.cnt as f64 * stat.avg) / (stat.cnt + 1) as f64;
                stat.cnt += 1;
                if used > stat.max {
                    stat.max = used;
                }
            }
        }
        violations
    }

    /// Peak usage seen for a claim, per dimension.
    pub fn get_peak(&self, task_id: &str) -> HashMap<&'static str, f64> {
        self.used
            .get(task_id)
            .map(|stats| stats.iter().map(|(name, s)| (*name, s.max)).collect())
            .unwrap_or_default()
    }

    /// Final usage summary for reporting: max per dimension, except gpu
    /// which reports the average utilization over the claim's lifetime.
    pub fn get_final(&self, task_id: &str) -> Option<HashMap<&'static str, f64>> {
        let stats = self.used.get(task_id)?;
        Some(
            stats
                .iter()
                .map(|(name, s)| (*name, if *name == "gpu" { s.avg } else { s.max }))
                .collect(),
        )
    }
}

fn mean(samples: &VecDeque<f64>) -> f64 {
    if samples.is_empty() {
        0.0
    } else {
        samples.iter().sum::<f64>() / samples.len() as f64
    }
}

/// Disk usage of a directory tree in bytes. Symlinks are not followed, so
/// nothing outside the tree is counted twice. Unreadable entries count as
/// zero rather than failing the measurement.
pub fn dir_size(path: &Path) -> u64 {
    let mut total = 0;
    let Ok(entries) = std::fs::read_dir(path) else {
        return 0;
    };
    for entry in entries.flatten() {
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if file_type.is_symlink() {
            continue;
        }
        if file_type.is_dir() {
            total += dir_size(&entry.path());
        } else if let Ok(metadata) = entry.metadata() {
            total += metadata.len();
        }
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MockProbe {
        cpu: f64,
        memory: f64,
        gpu: f64,
    }

    impl UsageProbe for MockProbe {
        fn sample_process_tree(&mut self, _pid: u32) -> Option<ProcessSample> {
            Some(ProcessSample {
                cpu: self.cpu,
                memory: self.memory,
            })
        }

        fn gpu_utilization(&mut self, _device: &str) -> Option<f64> {
            Some(self.gpu)
        }
    }

    fn test_total() -> Resources {
        Resources {
            cpu: 4.0,
            gpu: vec!["0".to_string(), "1".to_string()],
            memory: 8.0,
            disk: 100.0,
            time: 10.0,
        }
    }

    fn test_ledger(probe: MockProbe) -> ResourceLedger {
        ResourceLedger::builder()
            .with_total(test_total())
            .with_probe(Box::new(probe))
            .build()
    }

    fn quiet_probe() -> MockProbe {
        MockProbe {
            cpu: 0.0,
            memory: 0.0,
            gpu: 0.0,
        }
    }

    fn request(raw: serde_json::Value) -> ResourceRequest {
        ResourceRequest::from_raw(&raw).unwrap()
    }

    #[test]
    fn test_claim_release_scenario() {
        let mut ledger = test_ledger(quiet_probe());

        let grant = ledger
            .claim("t1", Some(&request(serde_json::json!({"cpu": 2, "memory": 4}))))
            .unwrap();
        assert_eq!(grant.cpu, 2.0);
        assert_eq!(grant.memory, 4.0);

        let available = ledger.available();
        assert_eq!(available.cpu, 2.0);
        assert_eq!(available.memory, 4.0);
        assert_eq!(available.disk, 100.0);

        let err = ledger
            .claim("t2", Some(&request(serde_json::json!({"cpu": 3}))))
            .unwrap_err();
        assert!(matches!(
            err,
            ResourceError::Insufficient { resource: "cpu", .. }
        ));

        ledger.release("t1");
        let available = ledger.available();
        assert_eq!(available.cpu, 4.0);
        assert_eq!(available.memory, 8.0);
    }

    #[test]
    fn test_failed_claim_leaves_state_unchanged() {
        let mut ledger = test_ledger(quiet_probe());
        // cpu fits, memory does not; nothing may be subtracted
        let err = ledger
            .claim("t1", Some(&request(serde_json::json!({"cpu": 2, "memory": 50}))))
            .unwrap_err();
        assert!(matches!(err, ResourceError::Insufficient { .. }));
        assert_eq!(ledger.available().cpu, 4.0);
        assert_eq!(ledger.available().memory, 8.0);
    }

    #[test]
    fn test_gpu_ids_disjoint_across_claims() {
        let mut ledger = test_ledger(quiet_probe());
        let g1 = ledger
            .claim("t1", Some(&request(serde_json::json!({"gpu": 1}))))
            .unwrap();
        let g2 = ledger
            .claim("t2", Some(&request(serde_json::json!({"gpu": 1}))))
            .unwrap();
        assert_eq!(g1.gpu.len(), 1);
        assert_eq!(g2.gpu.len(), 1);
        assert_ne!(g1.gpu[0], g2.gpu[0]);

        let err = ledger
            .claim("t3", Some(&request(serde_json::json!({"gpu": 1}))))
            .unwrap_err();
        assert!(matches!(
            err,
            ResourceError::Insufficient { resource: "gpu", .. }
        ));

        // release returns exactly the claimed devices
        ledger.release("t1");
        let g3 = ledger
            .claim("t3", Some(&request(serde_json::json!({"gpu": 1}))))
            .unwrap();
        assert_eq!(g3.gpu, g1.gpu);
    }

    #[test]
    fn test_claim_everything_when_unspecified() {
        let mut ledger = test_ledger(quiet_probe());
        let grant = ledger.claim("t1", None).unwrap();
        assert_eq!(grant.cpu, 4.0);
        assert_eq!(grant.gpu.len(), 2);
        assert_eq!(grant.memory, 8.0);
        assert_eq!(ledger.available().cpu, 0.0);
        assert!(ledger.available().gpu.is_empty());
    }

    #[test]
    fn test_release_unknown_is_noop() {
        let mut ledger = test_ledger(quiet_probe());
        ledger.release("nope");
        assert_eq!(ledger.available().cpu, 4.0);
    }

    #[test]
    fn test_check_claims_flags_runaway_memory() {
        let probe = MockProbe {
            cpu: 0.5,
            memory: 90.0,
            gpu: 0.0,
        };
        let mut ledger = test_ledger(probe);
        let dir = tempfile::tempdir().unwrap();
        ledger
            .claim("t1", Some(&request(serde_json::json!({"cpu": 1, "memory": 2}))))
            .unwrap();
        ledger.register_process("t1", 4242, dir.path());

        let violations = ledger.check_claims(true);
        let reason = violations.get("t1").expect("violation expected");
        assert!(reason.starts_with("Resource overusage for memory:"), "{reason}");
    }

    #[test]
    fn test_check_claims_tolerates_overusage_within_spare() {
        // 3 GB used on a 2 GB claim: overage fits in the 6 GB still free
        // and stays under the allowed ratio
        let probe = MockProbe {
            cpu: 0.5,
            memory: 3.0,
            gpu: 0.0,
        };
        let mut ledger = test_ledger(probe);
        let dir = tempfile::tempdir().unwrap();
        ledger
            .claim("t1", Some(&request(serde_json::json!({"cpu": 1, "memory": 2}))))
            .unwrap();
        ledger.register_process("t1", 4242, dir.path());

        let violations = ledger.check_claims(true);
        assert!(violations.is_empty(), "{violations:?}");

        // summaries were still updated
        let peak = ledger.get_peak("t1");
        assert_eq!(peak.get("memory"), Some(&3.0));
        let final_usage = ledger.get_final("t1").unwrap();
        assert_eq!(final_usage.get("memory"), Some(&3.0));
    }

    #[test]
    fn test_release_discards_usage_history() {
        let probe = MockProbe {
            cpu: 0.5,
            memory: 3.0,
            gpu: 0.0,
        };
        let mut ledger = test_ledger(probe);
        let dir = tempfile::tempdir().unwrap();
        ledger.claim("t1", None).unwrap();
        ledger.register_process("t1", 4242, dir.path());
        ledger.check_claims(true);
        assert!(!ledger.get_peak("t1").is_empty());

        ledger.release("t1");
        assert!(ledger.get_peak("t1").is_empty());
        assert!(ledger.get_final("t1").is_none());
    }

    #[test]
    fn test_moving_average_partial_window() {
        let probe = MockProbe {
            cpu: 2.0,
            memory: 1.0,
            gpu: 0.0,
        };
        let mut ledger = ResourceLedger::builder()
            .with_total(test_total())
            .with_probe(Box::new(probe))
            .with_window(4)
            .build();
        let dir = tempfile::tempdir().unwrap();
        ledger.claim("t1", None).unwrap();
        ledger.register_process("t1", 4242, dir.path());

        // one sample: the partial window reports its mean
        let usage = ledger.get_usage("t1", true).unwrap();
        assert_eq!(usage.cpu, 2.0);
        assert_eq!(usage.memory, 1.0);
    }

    #[test]
    fn test_dir_size_skips_symlinks() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("data.bin"), vec![0u8; 1000]).unwrap();
        let sub = dir.path().join("sub");
        std::fs::create_dir(&sub).unwrap();
        std::fs::write(sub.join("more.bin"), vec![0u8; 500]).unwrap();
        #[cfg(unix)]
        std::os::unix::fs::symlink(dir.path().join("data.bin"), dir.path().join("alias"))
            .unwrap();

        assert_eq!(dir_size(dir.path()), 1500);
    }
}
