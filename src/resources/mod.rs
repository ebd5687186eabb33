//! Resource definitions, detection and tracking for pilots and tasks.

pub mod group;
pub mod ledger;

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Dimensions tracked for every pilot and task, in declaration order.
pub const DIMENSIONS: [&str; 5] = ["cpu", "gpu", "memory", "disk", "time"];

/// Default resource values for a task that declares nothing.
///
/// memory/disk in GB, time in hours, gpu is a count of whole devices.
pub const DEFAULT_CPU: u32 = 1;
pub const DEFAULT_GPU: u32 = 0;
pub const DEFAULT_MEMORY: f64 = 1.0;
pub const DEFAULT_DISK: f64 = 10.0;
pub const DEFAULT_TIME: f64 = 1.0;

/// Margin subtracted from auto-detected totals so a pilot never promises
/// the very last bit of its allocation.
const DETECTION_MARGIN: f64 = 0.1;

#[derive(Debug, thiserror::Error)]
pub enum ResourceError {
    /// A claim asked for more than is currently unclaimed. The caller's
    /// request was wrong; retrying without releasing something won't help.
    #[error("not enough {resource} available: {requested} > {available}")]
    Insufficient {
        resource: &'static str,
        requested: f64,
        available: f64,
    },
    /// An unknown dimension name, or a value that cannot be coerced to the
    /// dimension's declared type.
    #[error("bad resource type: {0}")]
    BadResourceType(String),
}

/// A concrete resource vector: what a node has, or what one claim holds.
///
/// `gpu` carries the actual device ids so that concurrent claims stay
/// disjoint; everywhere a count is needed use `gpu.len()`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Resources {
    pub cpu: f64,
    pub gpu: Vec<String>,
    pub memory: f64,
    pub disk: f64,
    /// Wall-clock budget in hours. Informational for claims: it is never
    /// subtracted from the available pool.
    pub time: f64,
}

/// A claim request: only the dimensions the caller cares about.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceRequest {
    pub cpu: Option<f64>,
    pub gpu: Option<usize>,
    pub memory: Option<f64>,
    pub disk: Option<f64>,
    pub time: Option<f64>,
}

impl ResourceRequest {
    /// Parse a raw JSON object into a request, coercing each value to its
    /// declared type. Unknown dimension names are an error here (unlike
    /// requirement sanitizing, which drops them): a pilot asking for a
    /// dimension the ledger does not track is a caller bug.
    pub fn from_raw(raw: &serde_json::Value) -> Result<Self, ResourceError> {
        let map = raw
            .as_object()
            .ok_or_else(|| ResourceError::BadResourceType(format!("{raw}")))?;
        let mut req = ResourceRequest::default();
        for (key, value) in map {
            let num = coerce_number(value)
                .ok_or_else(|| ResourceError::BadResourceType(format!("{key}={value}")))?;
            match key.as_str() {
                "cpu" => req.cpu = Some(num.floor()),
                "gpu" => req.gpu = Some(num as usize),
                "memory" => req.memory = Some(num),
                "disk" => req.disk = Some(num),
                "time" => req.time = Some(num),
                other => return Err(ResourceError::BadResourceType(other.to_string())),
            }
        }
        Ok(req)
    }
}

/// Accept numbers and numeric strings; anything else is unconvertible.
pub(crate) fn coerce_number(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Detect the resources allocated to this process.
///
/// An HTCondor machine ad file takes precedence, then the environment
/// variables glideins and SLURM prologs set. Falls back to the declared
/// defaults. Memory, disk and time get a small safety margin subtracted.
pub fn detect_total_resources() -> Resources {
    let ad = MachineAd::load(Path::new(".machine.ad"));
    Resources {
        cpu: detect_cpus(&ad),
        gpu: detect_gpus(&ad),
        memory: (detect_memory(&ad) - DETECTION_MARGIN).max(0.0),
        disk: (detect_disk(&ad) - DETECTION_MARGIN).max(0.0),
        time: (detect_time(&ad) - DETECTION_MARGIN).max(0.0),
    }
}

/// Key/value view of an HTCondor `.machine.ad` file, keys lowercased.
struct MachineAd {
    entries: Vec<(String, String)>,
}

impl MachineAd {
    fn load(path: &Path) -> Self {
        let mut entries = Vec::new();
        if let Ok(data) = std::fs::read_to_string(path) {
            for line in data.lines() {
                if let Some((key, value)) = line.split_once('=') {
                    entries.push((
                        key.trim().to_lowercase(),
                        value.trim().trim_matches('"').to_string(),
                    ));
                }
            }
        }
        MachineAd { entries }
    }

    fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(|v| v.parse::<f64>().ok())
    }
}

fn env_f64(name: &str) -> Option<f64> {
    std::env::var(name).ok().and_then(|v| v.parse::<f64>().ok())
}

fn detect_cpus(ad: &MachineAd) -> f64 {
    if let Some(v) = ad.get_f64("totalcpus") {
        tracing::info!("got cpus from machine ad: {v}");
        return v.floor();
    }
    if let Some(v) = env_f64("NUM_CPUS") {
        tracing::info!("got cpus from NUM_CPUS: {v}");
        return v.floor();
    }
    DEFAULT_CPU as f64
}

fn detect_gpus(ad: &MachineAd) -> Vec<String> {
    let sources = [
        ad.get("assignedgpus").map(str::to_string),
        std::env::var("CUDA_VISIBLE_DEVICES").ok(),
        std::env::var("GPU_DEVICE_ORDINAL").ok(),
        std::env::var("_CONDOR_AssignedGPUs").ok(),
    ];
    for src in sources.into_iter().flatten() {
        let ids: Vec<String> = src
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        if !ids.is_empty() {
            tracing::info!("got gpus: {ids:?}");
            return ids;
        }
    }
    if let Some(n) = env_f64("NUM_GPUS") {
        return (0..n as u32).map(|i| i.to_string()).collect();
    }
    Vec::new()
}

fn detect_memory(ad: &MachineAd) -> f64 {
    if let Some(v) = ad.get_f64("totalmemory") {
        return v / 1000.0; // ad is in MB
    }
    env_f64("NUM_MEMORY").unwrap_or(DEFAULT_MEMORY)
}

fn detect_disk(ad: &MachineAd) -> f64 {
    if let Some(v) = ad.get_f64("totaldisk") {
        return v / 1_000_000.0; // ad is in KB
    }
    env_f64("NUM_DISK").unwrap_or(DEFAULT_DISK)
}

fn detect_time(ad: &MachineAd) -> f64 {
    if let Some(v) = ad.get_f64("timetolive") {
        return v / 3600.0; // ad is in seconds
    }
    env_f64("NUM_TIME").unwrap_or(DEFAULT_TIME)
}

/// Per-dimension overusage policy.
///
/// `ignore`: usage below this ratio of the claim is never flagged.
/// `allowed`: usage up to this ratio is tolerated while the overage still
/// fits in the unclaimed pool. Anything beyond either bound is a violation.
#[derive(Debug, Clone, Copy)]
pub struct OverusageLimit {
    pub ignore: f64,
    pub allowed: f64,
}

pub fn overusage_limit(dimension: &str) -> OverusageLimit {
    match dimension {
        "cpu" => OverusageLimit {
            ignore: 2.0,
            allowed: 4.0,
        },
        "gpu" => OverusageLimit {
            ignore: 1.5,
            allowed: 1.5,
        },
        // memory/disk/time: flag any overusage unless it fits in spare
        // capacity, up to 10x the claim
        _ => OverusageLimit {
            ignore: 0.0,
            allowed: 10.0,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_from_raw_coerces_types() {
        let raw = serde_json::json!({"cpu": 2.7, "memory": "4", "gpu": 1});
        let req = ResourceRequest::from_raw(&raw).unwrap();
        assert_eq!(req.cpu, Some(2.0));
        assert_eq!(req.memory, Some(4.0));
        assert_eq!(req.gpu, Some(1));
        assert_eq!(req.disk, None);
    }

    #[test]
    fn test_request_from_raw_unknown_dimension() {
        let raw = serde_json::json!({"quantum": 3});
        let err = ResourceRequest::from_raw(&raw).unwrap_err();
        assert!(matches!(err, ResourceError::BadResourceType(_)));
    }

    #[test]
    fn test_request_from_raw_unconvertible_value() {
        let raw = serde_json::json!({"memory": [1, 2]});
        let err = ResourceRequest::from_raw(&raw).unwrap_err();
        assert!(matches!(err, ResourceError::BadResourceType(_)));
    }

    #[test]
    fn test_overusage_limits_table() {
        assert_eq!(overusage_limit("cpu").ignore, 2.0);
        assert_eq!(overusage_limit("memory").ignore, 0.0);
        assert_eq!(overusage_limit("gpu").allowed, 1.5);
    }
}
