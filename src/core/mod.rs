pub mod adapter;
pub mod engine;
pub mod pilot;
pub mod signatures;

/// Filenames of the logs a pilot captures in its submit directory. The
/// queue service stores them under the same names.
pub const STDOUT_FILENAME: &str = "task.out";
pub const STDERR_FILENAME: &str = "task.err";
pub const STDLOG_FILENAME: &str = "task.log";
