use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    // Core settings (can override CLI)
    pub runtime: Option<i64>,
    pub max_loops: Option<u64>,
    pub workers: Option<usize>,
    pub singleton: Option<bool>,
    pub singleton_timeout: Option<i64>,
    pub lock_db: Option<String>,
    pub pidfile: Option<String>,
    pub pause_secs: Option<u64>,
    pub pause_interval_secs: Option<u64>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }
}
