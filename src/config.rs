//! Engine configuration.
//!
//! Defaults suit a desktop machine. A JSON file can override any subset of
//! fields, and a few `PACKFORGE_*` environment variables override both.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

const MIB: u64 = 1024 * 1024;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Byte budget of one planner load.
    pub block_budget: u64,
    /// Size at which a compress worker flushes its in-memory batch.
    pub flush_threshold: usize,
    /// Size of each of the two forward-scan windows.
    pub scan_buffer_size: usize,
    pub max_threads: usize,
    /// Workers started unpaused when CPU monitoring is on.
    pub delayed_start: usize,
    pub monitor_cpu: bool,
    /// CPU usage (percent) at or above which a worker gets paused.
    pub critical_cpu: f32,
    pub cooldown_ticks: u32,
    /// Passes with fewer entries poll at `poll_fast_ms`.
    pub small_pass_entries: usize,
    pub poll_fast_ms: u64,
    pub poll_slow_ms: u64,
    /// Compress passes with at least this many staged files...
    pub small_file_count: usize,
    /// ...averaging at most this many bytes use the batched small-file variant.
    pub small_file_avg: u64,
    /// Largest stream the container's offsets can address.
    pub max_archive_size: u64,
    pub temp_root: Option<PathBuf>,
    #[serde(skip_serializing)]
    pub secondary_key: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            block_budget: 8 * MIB,
            flush_threshold: 4 * MIB as usize,
            scan_buffer_size: 64 * 1024,
            max_threads: num_cpus::get(),
            delayed_start: 2,
            monitor_cpu: true,
            critical_cpu: 85.0,
            cooldown_ticks: 4,
            small_pass_entries: 5000,
            poll_fast_ms: 75,
            poll_slow_ms: 200,
            small_file_count: 1000,
            small_file_avg: 256 * 1024,
            max_archive_size: u32::MAX as u64,
            temp_root: None,
            secondary_key: None,
        }
    }
}

/// Parses a megabyte count into bytes; `None` when unparseable or too large.
fn budget_from_mb(value: &str) -> Option<u64> {
    value.trim().parse::<u64>().ok().and_then(|mb| mb.checked_mul(MIB))
}

impl EngineConfig {
    /// Reads a JSON config file; missing fields keep their defaults.
    pub fn load(path: &Path) -> Result<Self, EngineError> {
        let text = fs::read_to_string(path).map_err(|e| EngineError::io_at(e, path))?;
        let config: EngineConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Applies `PACKFORGE_*` environment overrides. Unparseable or overflowing values are ignored.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(threads) = env::var("PACKFORGE_THREADS").ok().and_then(|v| v.parse::<usize>().ok()) {
            self.max_threads = threads;
        }
        if let Some(budget) = env::var("PACKFORGE_BLOCK_BUDGET_MB").ok().and_then(|v| budget_from_mb(&v)) {
            self.block_budget = budget;
        }
        if let Some(cpu) = env::var("PACKFORGE_CRITICAL_CPU").ok().and_then(|v| v.parse::<f32>().ok()) {
            self.critical_cpu = cpu;
        }
        if env::var_os("PACKFORGE_NO_MONITOR").is_some() {
            self.monitor_cpu = false;
        }
        if let Some(dir) = env::var_os("PACKFORGE_TEMP_DIR") {
            self.temp_root = Some(PathBuf::from(dir));
        }
        if let Ok(key) = env::var("PACKFORGE_KEY") {
            self.secondary_key = Some(key);
        }
        self
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.block_budget == 0 {
            return Err(EngineError::Config("block_budget must be positive".into()));
        }
        if self.flush_threshold == 0 || self.scan_buffer_size == 0 {
            return Err(EngineError::Config("buffer sizes must be positive".into()));
        }
        if self.max_threads == 0 {
            return Err(EngineError::Config("max_threads must be at least 1".into()));
        }
        if !(self.critical_cpu > 0.0 && self.critical_cpu <= 100.0) {
            return Err(EngineError::Config(format!("critical_cpu {} is outside (0, 100]", self.critical_cpu)));
        }
        if self.poll_fast_ms == 0 || self.poll_slow_ms == 0 {
            return Err(EngineError::Config("poll intervals must be positive".into()));
        }
        Ok(())
    }

    pub fn temp_root(&self) -> PathBuf {
        self.temp_root.clone().unwrap_or_else(env::temp_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.block_budget, 8 * MIB);
        assert_eq!(config.max_archive_size, u32::MAX as u64);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        fs::write(&path, r#"{ "max_threads": 3, "critical_cpu": 70.0 }"#).unwrap();
        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.max_threads, 3);
        assert_eq!(config.critical_cpu, 70.0);
        assert_eq!(config.poll_fast_ms, 75);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let config = EngineConfig { critical_cpu: 0.0, ..EngineConfig::default() };
        assert!(matches!(config.validate(), Err(EngineError::Config(_))));
        let config = EngineConfig { max_threads: 0, ..EngineConfig::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn budget_override_ignores_overflow() {
        assert_eq!(budget_from_mb("16"), Some(16 * MIB));
        assert_eq!(budget_from_mb(" 2 "), Some(2 * MIB));
        assert_eq!(budget_from_mb("lots"), None);
        assert_eq!(budget_from_mb(&u64::MAX.to_string()), None);
        assert_eq!(budget_from_mb(&(u64::MAX / MIB + 1).to_string()), None);
    }

    #[test]
    fn malformed_file_is_a_json_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(EngineConfig::load(&path), Err(EngineError::SerdeJson(_))));
    }
}
