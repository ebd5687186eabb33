pub mod client;
pub mod config;
pub mod core;
pub mod resources;

use std::path::PathBuf;

pub fn get_config_dir() -> anyhow::Result<PathBuf> {
    dirs::config_dir()
        .ok_or_else(|| anyhow::anyhow!("Failed to get config directory"))
        .map(|p| p.join("gridflow"))
}

pub fn get_data_dir() -> anyhow::Result<PathBuf> {
    dirs::data_dir()
        .ok_or_else(|| anyhow::anyhow!("Failed to get data directory"))
        .map(|p| p.join("gridflow"))
}

/// Default root for pilot submission working directories.
pub fn get_submit_dir() -> anyhow::Result<PathBuf> {
    get_data_dir().map(|p| p.join("submit"))
}
