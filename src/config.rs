use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

const DEFAULT_ACTIVE_WINDOW_SECONDS: u64 = 3_600;
const DEFAULT_POLL_SECONDS: u64 = 30;
const DEFAULT_EXPORT_SECONDS: u64 = 60;
const MIN_POLL_SECONDS: u64 = 5;
const MIN_ACTIVE_WINDOW_SECONDS: u64 = 60;
const CONFIG_SCHEMA_VERSION: u32 = 2;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExporterConfig {
    pub schema_version: u32,
    pub active_window_seconds: u64,
    pub poll_interval_seconds: u64,
    pub export_interval_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub active_window: Duration,
    pub poll_interval: Duration,
    pub export_interval: Duration,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            schema_version: CONFIG_SCHEMA_VERSION,
            active_window_seconds: DEFAULT_ACTIVE_WINDOW_SECONDS,
            poll_interval_seconds: DEFAULT_POLL_SECONDS,
            export_interval_seconds: DEFAULT_EXPORT_SECONDS,
        }
    }
}

impl ExporterConfig {
    pub fn load_or_init() -> Result<Self> {
        let cfg_path = config_path();
        if let Some(parent) = cfg_path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create config directory {}", parent.display())
            })?;
        }

        if cfg_path.exists() {
            let raw = fs::read_to_string(&cfg_path)
                .with_context(|| format!("failed to read {}", cfg_path.display()))?;
            let mut parsed: ExporterConfig = serde_json::from_str(&raw)
                .with_context(|| format!("invalid JSON in {}", cfg_path.display()))?;
            if parsed.normalize_and_migrate() {
                parsed.save()?;
            }
            Ok(parsed)
        } else {
            let cfg = ExporterConfig::default();
            cfg.save()?;
            Ok(cfg)
        }
    }

    pub fn save(&self) -> Result<()> {
        let path = config_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create config directory {}", parent.display())
            })?;
        }

        let data = serde_json::to_string_pretty(self)?;
        fs::write(&path, data).with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    /// Environment variables win over the config file; both are clamped to
    /// the same minimums before the values reach the poll loop.
    pub fn runtime_settings(&self) -> RuntimeSettings {
        let active_window =
            env_u64("CLAUDE_EXPORTER_ACTIVE_WINDOW_SECONDS", self.active_window_seconds)
                .max(MIN_ACTIVE_WINDOW_SECONDS);
        let poll_interval = env_u64("CLAUDE_EXPORTER_POLL_SECONDS", self.poll_interval_seconds)
            .max(MIN_POLL_SECONDS);
        let export_interval =
            env_u64("CLAUDE_EXPORTER_EXPORT_SECONDS", self.export_interval_seconds).max(1);

        RuntimeSettings {
            active_window: Duration::from_secs(active_window),
            poll_interval: Duration::from_secs(poll_interval),
            export_interval: Duration::from_secs(export_interval),
        }
    }

    fn normalize_and_migrate(&mut self) -> bool {
        let mut changed = false;

        if self.schema_version < CONFIG_SCHEMA_VERSION {
            self.schema_version = CONFIG_SCHEMA_VERSION;
            changed = true;
        }

        if self.active_window_seconds < MIN_ACTIVE_WINDOW_SECONDS {
            self.active_window_seconds = DEFAULT_ACTIVE_WINDOW_SECONDS;
            changed = true;
        }
        if self.poll_interval_seconds < MIN_POLL_SECONDS {
            self.poll_interval_seconds = DEFAULT_POLL_SECONDS;
            changed = true;
        }
        if self.export_interval_seconds == 0 {
            self.export_interval_seconds = DEFAULT_EXPORT_SECONDS;
            changed = true;
        }

        changed
    }
}

pub fn claude_home() -> PathBuf {
    if let Ok(custom) = env::var("CLAUDE_HOME") {
        let trimmed = custom.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }

    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".claude")
}

pub fn snapshot_path() -> PathBuf {
    claude_home().join("usage-snapshot.json")
}

pub fn projects_path() -> PathBuf {
    claude_home().join("projects")
}

pub fn telemetry_dir() -> PathBuf {
    claude_home().join("telemetry")
}

pub fn metrics_spool_path() -> PathBuf {
    telemetry_dir().join("metrics.jsonl")
}

pub fn config_path() -> PathBuf {
    claude_home().join("usage-exporter-config.json")
}

pub fn lock_path() -> PathBuf {
    claude_home().join("usage-exporter.lock")
}

pub fn instance_meta_path() -> PathBuf {
    claude_home().join("usage-exporter.instance.json")
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}
