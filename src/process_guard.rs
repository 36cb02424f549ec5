use std::env;
use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::config;

pub enum AcquireState {
    Acquired(InstanceGuard),
    AlreadyRunning { pid: Option<u32> },
}

pub enum RunningState {
    NotRunning,
    Running { pid: Option<u32> },
}

/// Holds the exclusive data-directory lock for the lifetime of the exporter.
/// At most one reconciliation loop may run per data directory; a second
/// instance would double-publish every counter delta.
pub struct InstanceGuard {
    file: File,
    meta_path: PathBuf,
    pid: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct InstanceMetadata {
    pid: u32,
    exe_path: Option<String>,
}

impl Drop for InstanceGuard {
    fn drop(&mut self) {
        let _ = self.file.unlock();
        remove_instance_metadata_if_owned(self.pid, &self.meta_path);
    }
}

pub fn acquire_single_instance() -> Result<AcquireState> {
    let lock_path = config::lock_path();
    if let Some(parent) = lock_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create lock directory {}", parent.display()))?;
    }

    let meta_path = config::instance_meta_path();
    let mut file = open_lock_file(&lock_path)?;
    match file.try_lock_exclusive() {
        Ok(()) => {
            write_pid_compat(&mut file)?;
            let metadata = InstanceMetadata {
                pid: std::process::id(),
                exe_path: env::current_exe()
                    .ok()
                    .map(|path| path.display().to_string()),
            };
            write_instance_metadata(&meta_path, &metadata)?;
            Ok(AcquireState::Acquired(InstanceGuard {
                file,
                meta_path,
                pid: metadata.pid,
            }))
        }
        Err(_) => {
            let pid = read_instance_metadata(&meta_path)
                .ok()
                .flatten()
                .map(|m| m.pid);
            Ok(AcquireState::AlreadyRunning { pid })
        }
    }
}

pub fn inspect_running_instance() -> Result<RunningState> {
    let lock_path = config::lock_path();
    if !lock_path.exists() {
        return Ok(RunningState::NotRunning);
    }

    let meta_path = config::instance_meta_path();
    let file = open_lock_file(&lock_path)?;
    match file.try_lock_exclusive() {
        Ok(()) => {
            let _ = file.unlock();
            let _ = fs::remove_file(&meta_path);
            Ok(RunningState::NotRunning)
        }
        Err(_) => {
            let pid = read_instance_metadata(&meta_path)
                .ok()
                .flatten()
                .map(|m| m.pid);
            Ok(RunningState::Running { pid })
        }
    }
}

fn open_lock_file(path: &PathBuf) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path)
        .with_context(|| format!("failed to open lock file {}", path.display()))
}

fn write_pid_compat(file: &mut File) -> Result<()> {
    let pid = std::process::id();
    file.seek(SeekFrom::Start(0))?;
    file.set_len(0)?;
    file.write_all(pid.to_string().as_bytes())?;
    file.flush()?;
    Ok(())
}

fn write_instance_metadata(path: &PathBuf, metadata: &InstanceMetadata) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| {
            format!(
                "failed to create instance metadata directory {}",
                parent.display()
            )
        })?;
    }
    let payload = serde_json::to_string_pretty(metadata)?;
    fs::write(path, payload)
        .with_context(|| format!("failed to write instance metadata {}", path.display()))?;
    Ok(())
}

fn read_instance_metadata(path: &PathBuf) -> Result<Option<InstanceMetadata>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read instance metadata {}", path.display()))?;
    let parsed: InstanceMetadata = serde_json::from_str(&raw)
        .with_context(|| format!("invalid JSON in {}", path.display()))?;
    Ok(Some(parsed))
}

fn remove_instance_metadata_if_owned(expected_pid: u32, path: &PathBuf) {
    let Ok(Some(metadata)) = read_instance_metadata(path) else {
        return;
    };
    if metadata.pid == expected_pid {
        let _ = fs::remove_file(path);
    }
}
