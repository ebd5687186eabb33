//! Requirement sanitizing, rounding and grouping.
//!
//! Task requirements arrive as loosely typed JSON. Before pilots are sized
//! from them they are sanitized into a typed [`Requirement`], rounded up
//! onto a fixed bin ladder so similar tasks land on identical vectors, and
//! hashed so the queue can group interchangeable requests.

use super::coerce_number;
use serde::{Deserialize, Serialize};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::LazyLock;

/// Bin ladders for the continuous dimensions, in GB (memory, disk) and
/// hours (time). Values above the last rung cannot be scheduled.
///
/// memory/disk rungs sit at `e^(k/e)`, the upper edges of the bins
/// [`group_hash`] folds those dimensions into. Every value inside one hash
/// bin therefore rounds to the same rung, so sub-bin differences (2 GB vs
/// 2.01 GB) collapse into one resource group. time is hashed at whole-hour
/// granularity and keeps a coarse linear ladder.
static MEMORY_BINS: LazyLock<Vec<f64>> = LazyLock::new(|| log_bins(14)); // up to ~172 GB
static DISK_BINS: LazyLock<Vec<f64>> = LazyLock::new(|| log_bins(19)); // up to ~1083 GB
pub const TIME_BINS: [f64; 9] = [1.0, 2.0, 4.0, 6.0, 8.0, 12.0, 24.0, 48.0, 96.0];

fn log_bins(count: u32) -> Vec<f64> {
    (1..=count)
        .map(|k| (f64::from(k) / std::f64::consts::E).exp())
        .collect()
}

/// A task's declared needs. Only the dimensions it actually declared are
/// set; `os` and `site` are pass-through constraints that take part in
/// grouping but not in sizing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Requirement {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpu: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub site: Option<String>,
}

/// Sanitize a raw requirements object.
///
/// Values are coerced to their declared types; numeric strings count as
/// numbers. Unknown keys and unconvertible values are dropped silently,
/// unlike ledger claim parsing where they are errors: requirements come
/// from user-authored dataset configs and one bad key must not strand the
/// whole dataset. With `use_defaults`, missing numeric dimensions are
/// filled in with the standard defaults.
pub fn sanitize(raw: &serde_json::Value, use_defaults: bool) -> Requirement {
    let mut req = Requirement::default();
    if let Some(map) = raw.as_object() {
        for (key, value) in map {
            match key.as_str() {
                "cpu" => req.cpu = coerce_number(value).map(|n| n.floor() as u32),
                "gpu" => req.gpu = coerce_number(value).map(|n| n.floor() as u32),
                "memory" => req.memory = coerce_number(value),
                "disk" => req.disk = coerce_number(value),
                "time" => req.time = coerce_number(value),
                "os" => req.os = value.as_str().map(str::to_string),
                "site" => req.site = value.as_str().map(str::to_string),
                other => {
                    tracing::debug!("dropping unknown requirement {other}");
                }
            }
        }
    }
    if use_defaults {
        req = req.with_defaults();
    }
    req
}

impl Requirement {
    /// Fill any missing numeric dimension with its standard default.
    pub fn with_defaults(mut self) -> Requirement {
        self.cpu.get_or_insert(super::DEFAULT_CPU);
        self.gpu.get_or_insert(super::DEFAULT_GPU);
        self.memory.get_or_insert(super::DEFAULT_MEMORY);
        self.disk.get_or_insert(super::DEFAULT_DISK);
        self.time.get_or_insert(super::DEFAULT_TIME);
        self
    }

    /// Combine two requirements dimension-wise, taking the larger numeric
    /// value. Used to fold a dataset-level requirement over a task's own.
    pub fn merge_max(&self, other: &Requirement) -> Requirement {
        fn max_opt<T: PartialOrd + Copy>(a: Option<T>, b: Option<T>) -> Option<T> {
            match (a, b) {
                (Some(a), Some(b)) => Some(if a > b { a } else { b }),
                (a, b) => a.or(b),
            }
        }
        Requirement {
            cpu: max_opt(self.cpu, other.cpu),
            gpu: max_opt(self.gpu, other.gpu),
            memory: max_opt(self.memory, other.memory),
            disk: max_opt(self.disk, other.disk),
            time: max_opt(self.time, other.time),
            os: self.os.clone().or_else(|| other.os.clone()),
            site: self.site.clone().or_else(|| other.site.clone()),
        }
    }
}

fn round_up(value: f64, bins: &[f64], dimension: &str) -> anyhow::Result<f64> {
    for bin in bins {
        if value <= *bin {
            return Ok(*bin);
        }
    }
    anyhow::bail!(
        "requested {dimension} {value} exceeds the largest schedulable size {}",
        bins[bins.len() - 1]
    )
}

/// Round a requirement up onto the bin ladders.
///
/// cpu/gpu counts are already discrete and pass through unchanged;
/// memory/disk/time snap up to the next rung. Rounding never decreases a
/// value and is idempotent: bin values map to themselves. A value above
/// the largest rung is unschedulable and fails. Two values that land in
/// the same [`group_hash`] bin always round to the same rung.
pub fn round(req: &Requirement) -> anyhow::Result<Requirement> {
    let mut rounded = req.clone();
    if let Some(memory) = req.memory {
        rounded.memory = Some(round_up(memory, &MEMORY_BINS, "memory")?);
    }
    if let Some(disk) = req.disk {
        rounded.disk = Some(round_up(disk, &DISK_BINS, "disk")?);
    }
    if let Some(time) = req.time {
        rounded.time = Some(round_up(time, &TIME_BINS, "time")?);
    }
    Ok(rounded)
}

/// Deterministic grouping key for a (rounded) requirement.
///
/// Each dimension is folded into a disjoint region of the key space so two
/// requirements collide only when every dimension matches. Stable across
/// processes for the numeric part; the `os` fold uses the process hasher
/// and groups identically within one run.
pub fn group_hash(req: &Requirement) -> u64 {
    let cpu = req.cpu.unwrap_or(super::DEFAULT_CPU) as u64;
    let gpu = req.gpu.unwrap_or(super::DEFAULT_GPU) as u64;
    let memory = req.memory.unwrap_or(super::DEFAULT_MEMORY).max(1.0);
    let disk = req.disk.unwrap_or(super::DEFAULT_DISK).max(1.0);
    let time = req.time.unwrap_or(super::DEFAULT_TIME).max(0.0);

    let mut hash = cpu;
    hash ^= gpu * 100;
    hash ^= (memory.ln() * std::f64::consts::E) as u64 * 1_000;
    hash ^= (disk.ln() * std::f64::consts::E) as u64 * 1_000_000;
    hash ^= time as u64 * 1_000_000_000;
    if let Some(os) = &req.os {
        let mut hasher = DefaultHasher::new();
        os.hash(&mut hasher);
        hash ^= hasher.finish();
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_drops_unknown_and_coerces() {
        let raw = serde_json::json!({
            "cpu": "2",
            "memory": 3.5,
            "flux_capacitors": 1,
            "os": "RHEL_7_x86_64",
        });
        let req = sanitize(&raw, false);
        assert_eq!(req.cpu, Some(2));
        assert_eq!(req.memory, Some(3.5));
        assert_eq!(req.os.as_deref(), Some("RHEL_7_x86_64"));
        assert_eq!(req.gpu, None);
        assert_eq!(req.disk, None);
    }

    #[test]
    fn test_sanitize_drops_unconvertible_value() {
        let raw = serde_json::json!({"memory": {"lots": true}, "cpu": 1});
        let req = sanitize(&raw, false);
        assert_eq!(req.memory, None);
        assert_eq!(req.cpu, Some(1));
    }

    #[test]
    fn test_sanitize_with_defaults_fills_gaps() {
        let raw = serde_json::json!({"gpu": 1});
        let req = sanitize(&raw, true);
        assert_eq!(req.gpu, Some(1));
        assert_eq!(req.cpu, Some(1));
        assert_eq!(req.memory, Some(1.0));
        assert_eq!(req.disk, Some(10.0));
        assert_eq!(req.time, Some(1.0));
    }

    #[test]
    fn test_round_snaps_up() {
        let req = Requirement {
            memory: Some(3.2),
            disk: Some(11.0),
            time: Some(5.0),
            ..Default::default()
        };
        let rounded = round(&req).unwrap();
        // memory/disk rungs are e^(k/e); 3.2 GB needs the k=4 rung,
        // 11 GB the k=7 rung
        assert_eq!(rounded.memory, Some((4.0 / std::f64::consts::E).exp()));
        assert_eq!(rounded.disk, Some((7.0 / std::f64::consts::E).exp()));
        assert_eq!(rounded.time, Some(6.0));
    }

    #[test]
    fn test_round_is_idempotent_and_never_decreases() {
        let req = Requirement {
            memory: Some(3.2),
            disk: Some(11.0),
            time: Some(5.0),
            ..Default::default()
        };
        let once = round(&req).unwrap();
        let twice = round(&once).unwrap();
        assert_eq!(once, twice);
        assert!(once.memory.unwrap() >= req.memory.unwrap());
        assert!(once.disk.unwrap() >= req.disk.unwrap());
        assert!(once.time.unwrap() >= req.time.unwrap());
    }

    #[test]
    fn test_round_fails_above_largest_bin() {
        let req = Requirement {
            memory: Some(300.0),
            ..Default::default()
        };
        assert!(round(&req).is_err());
    }

    #[test]
    fn test_group_hash_separates_dimensions() {
        let base = Requirement {
            cpu: Some(1),
            gpu: Some(0),
            memory: Some(4.0),
            disk: Some(20.0),
            time: Some(8.0),
            ..Default::default()
        };
        let mut more_memory = base.clone();
        more_memory.memory = Some(8.0);
        let mut other_os = base.clone();
        other_os.os = Some("RHEL_7_x86_64".to_string());

        assert_eq!(group_hash(&base), group_hash(&base.clone()));
        assert_ne!(group_hash(&base), group_hash(&more_memory));
        assert_ne!(group_hash(&base), group_hash(&other_os));
    }

    #[test]
    fn test_group_hash_identical_after_rounding() {
        // two tasks that differ only inside one bin group together
        let a = round(&Requirement {
            memory: Some(3.1),
            disk: Some(15.0),
            time: Some(5.0),
            ..Default::default()
        })
        .unwrap();
        let b = round(&Requirement {
            memory: Some(3.9),
            disk: Some(18.0),
            time: Some(5.5),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(group_hash(&a), group_hash(&b));
    }

    #[test]
    fn test_near_identical_memory_requests_share_a_group() {
        // 2 GB and 2.01 GB sit in the same logarithmic bin and must not
        // produce two pilot shapes
        let a = round(&Requirement {
            cpu: Some(1),
            memory: Some(2.0),
            ..Default::default()
        })
        .unwrap();
        let b = round(&Requirement {
            cpu: Some(1),
            memory: Some(2.01),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(a.memory, b.memory);
        assert_eq!(group_hash(&a), group_hash(&b));
    }
}
