use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::Deserialize;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::store::record_id;

/// A session whose record file was modified within the recency window.
/// Recomputed wholesale on every poll; never mutated in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveSession {
    pub id: String,
    pub title: String,
    pub project_path: PathBuf,
    pub last_modified: SystemTime,
    pub message_count: u64,
}

/// One pass over the projects tree: the recency-filtered active sessions
/// plus the full set of record ids currently on disk (for deduplication).
#[derive(Debug, Default)]
pub struct DirectoryScan {
    pub active: Vec<ActiveSession>,
    pub record_ids: BTreeSet<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct SessionIndex {
    sessions: HashMap<String, SessionIndexEntry>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct SessionIndexEntry {
    first_prompt: String,
    path: String,
    message_count: u64,
}

const INDEX_FILE: &str = "sessions-index.json";

/// Scans every project subdirectory under `projects_root`. A session is
/// active iff its record file mtime is strictly newer than `now - window`;
/// the per-project index only enriches metadata and is never required.
/// Failures are isolated per project; an absent root yields an empty scan.
pub fn scan_projects(projects_root: &Path, window: Duration, now: SystemTime) -> DirectoryScan {
    let mut scan = DirectoryScan::default();

    let entries = match fs::read_dir(projects_root) {
        Ok(entries) => entries,
        Err(err) => {
            debug!(root = %projects_root.display(), error = %err, "projects directory unavailable");
            return scan;
        }
    };

    let cutoff = now.checked_sub(window).unwrap_or(SystemTime::UNIX_EPOCH);

    for entry in entries.filter_map(std::result::Result::ok) {
        let project_dir = entry.path();
        if !project_dir.is_dir() {
            continue;
        }
        let project_name = match project_dir.file_name().and_then(|name| name.to_str()) {
            Some(name) => name.to_string(),
            None => continue,
        };

        if let Err(err) = scan_project(&project_dir, &project_name, cutoff, &mut scan) {
            warn!(project = %project_name, error = %err, "failed to scan project; skipping");
        }
    }

    sort_sessions(&mut scan.active);
    scan
}

fn scan_project(
    project_dir: &Path,
    project_name: &str,
    cutoff: SystemTime,
    scan: &mut DirectoryScan,
) -> std::io::Result<()> {
    let index = load_index(&project_dir.join(INDEX_FILE));

    for entry in WalkDir::new(project_dir) {
        let entry = entry.map_err(|err| {
            err.into_io_error()
                .unwrap_or_else(|| std::io::Error::other("walk loop"))
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("jsonl") {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };

        scan.record_ids.insert(record_id(project_name, stem));

        let metadata = match entry.metadata() {
            Ok(meta) => meta,
            Err(_) => continue,
        };
        let modified = match metadata.modified() {
            Ok(modified) => modified,
            Err(_) => continue,
        };
        if modified <= cutoff {
            continue;
        }

        let meta = index
            .as_ref()
            .and_then(|index| index.sessions.get(stem))
            .cloned()
            .unwrap_or_default();
        scan.active.push(ActiveSession {
            id: stem.to_string(),
            title: meta.first_prompt,
            project_path: if meta.path.is_empty() {
                project_dir.to_path_buf()
            } else {
                PathBuf::from(meta.path)
            },
            last_modified: modified,
            message_count: meta.message_count,
        });
    }

    Ok(())
}

fn load_index(path: &Path) -> Option<SessionIndex> {
    let raw = fs::read_to_string(path).ok()?;
    match serde_json::from_str(&raw) {
        Ok(index) => Some(index),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "session index is not valid JSON; ignoring");
            None
        }
    }
}

/// Most recent first; ties broken by id so repeated scans of the same tree
/// order identically.
fn sort_sessions(sessions: &mut [ActiveSession]) {
    sessions.sort_by(|a, b| {
        b.last_modified
            .cmp(&a.last_modified)
            .then_with(|| a.id.cmp(&b.id))
    });
}
