//! Failure-signature scanning for finished pilots.
//!
//! When a pilot ends badly the batch system's hold reason and the pilot's
//! captured logs usually say why. The scanner turns those free-form
//! messages into the short, stable reason strings the queue service stores
//! with a task error, so a resubmitted task can be resized.

use regex::Regex;

/// Stable reason strings for transfer failures.
pub const DOWNLOAD_FAILURE: &str = "failed to download input file(s)";
pub const UPLOAD_FAILURE: &str = "failed to upload output file(s)";

pub struct FailureScanner {
    memory_limit: Regex,
    time_limit: Regex,
    storage_limit: Regex,
    return_code: Regex,
}

impl FailureScanner {
    pub fn new() -> Self {
        // all patterns run against lowercased text
        FailureScanner {
            memory_limit: Regex::new(r"memory limit of (\d+(?:\.\d+)?)").unwrap(),
            time_limit: Regex::new(r"(\d+(?:\.\d+)?)\s*sec").unwrap(),
            storage_limit: Regex::new(r"storage limit of (\d+(?:\.\d+)?)\s*(kb|mb|gb)?").unwrap(),
            return_code: Regex::new(r"return code:\s*(-?\d+)").unwrap(),
        }
    }

    /// Translate a batch-system hold reason into a task error reason.
    /// `None` when the reason does not match any known resource policy or
    /// transfer failure.
    pub fn scan_hold_reason(&self, reason: &str) -> Option<String> {
        let lower = reason.to_lowercase();
        if lower.contains("memory limit") {
            // batch systems report MB
            let value = first_number(&self.memory_limit, &lower).map(|mb| mb / 1024.0);
            return Some(overusage("memory", value));
        }
        if lower.contains("cpu limit")
            || (lower.contains("policy violation") && lower.contains("cpu"))
        {
            return Some(overusage("cpu", None));
        }
        if lower.contains("time limit") || lower.contains("execution time") {
            let value = first_number(&self.time_limit, &lower).map(|secs| secs / 3600.0);
            return Some(overusage("time", value));
        }
        if lower.contains("storage limit") || lower.contains("disk limit") {
            let value = self.storage_limit.captures(&lower).and_then(|caps| {
                let number: f64 = caps.get(1)?.as_str().parse().ok()?;
                Some(match caps.get(2).map(|m| m.as_str()) {
                    Some("kb") => number / 1e6,
                    Some("gb") => number,
                    _ => number / 1000.0,
                })
            });
            return Some(overusage("disk", value));
        }
        if lower.contains("transfer input files") {
            return Some(DOWNLOAD_FAILURE.to_string());
        }
        if lower.contains("transfer output files") {
            return Some(UPLOAD_FAILURE.to_string());
        }
        None
    }

    /// Scan the pilot's own log for the first recognizable failure. Runs
    /// line by line so the reported reason stays short.
    pub fn scan_stdlog(&self, text: &str) -> Option<String> {
        for line in text.lines() {
            if line.contains("failed to download") {
                return Some(DOWNLOAD_FAILURE.to_string());
            }
            if line.contains("failed to upload") {
                return Some(UPLOAD_FAILURE.to_string());
            }
            if line.contains("Exception") {
                return Some(line.trim().to_string());
            }
            if let Some(code) = first_number(&self.return_code, &line.to_lowercase()) {
                return Some(format!("task error: return code {}", code as i64));
            }
        }
        None
    }

    /// Scan the batch system's event log for resource policy messages.
    pub fn scan_batch_log(&self, text: &str) -> Option<String> {
        text.lines().find_map(|line| self.scan_hold_reason(line))
    }
}

impl Default for FailureScanner {
    fn default() -> Self {
        Self::new()
    }
}

fn overusage(dimension: &str, value: Option<f64>) -> String {
    match value {
        Some(value) => format!("Resource overusage for {dimension}: {value}"),
        None => format!("Resource overusage for {dimension}"),
    }
}

fn first_number(re: &Regex, text: &str) -> Option<f64> {
    re.captures(text)?.get(1)?.as_str().parse().ok()
}
