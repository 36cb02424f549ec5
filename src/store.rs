use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use thiserror::Error;

const ACTIVE_TIME_FILE: &str = "active-time.json";
const SEEN_RECORDS_FILE: &str = "seen-conversations.json";

/// Durable active-time accrual. `cumulative_seconds` must never decrease for
/// the lifetime of the data directory, across any number of process restarts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ActiveTimeState {
    pub cumulative_seconds: u64,
    pub last_observation_at: Option<DateTime<Utc>>,
}

/// Durable set of conversation record ids already counted. Append-only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeenRecordSet {
    pub ids: BTreeSet<String>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid JSON in {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode {path}: {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Two independent durable records, each read once at startup and rewritten
/// wholesale after every mutation. Writes go through a temp file and an
/// atomic rename so a crash mid-write leaves the previous record intact.
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn load_active_time(&self) -> Result<ActiveTimeState, StoreError> {
        self.read_record(ACTIVE_TIME_FILE)
    }

    pub fn save_active_time(&self, state: &ActiveTimeState) -> Result<(), StoreError> {
        self.write_record(ACTIVE_TIME_FILE, state)
    }

    pub fn load_seen_records(&self) -> Result<SeenRecordSet, StoreError> {
        self.read_record(SEEN_RECORDS_FILE)
    }

    pub fn save_seen_records(&self, set: &SeenRecordSet) -> Result<(), StoreError> {
        self.write_record(SEEN_RECORDS_FILE, set)
    }

    fn read_record<T: DeserializeOwned + Default>(&self, name: &str) -> Result<T, StoreError> {
        let path = self.dir.join(name);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(T::default()),
            Err(err) => return Err(StoreError::Io { path, source: err }),
        };
        serde_json::from_str(&raw).map_err(|source| StoreError::Decode { path, source })
    }

    fn write_record<T: Serialize>(&self, name: &str, record: &T) -> Result<(), StoreError> {
        fs::create_dir_all(&self.dir).map_err(|source| StoreError::Io {
            path: self.dir.clone(),
            source,
        })?;

        let path = self.dir.join(name);
        let tmp = self.dir.join(format!("{name}.tmp"));
        let data = serde_json::to_string_pretty(record).map_err(|source| StoreError::Encode {
            path: path.clone(),
            source,
        })?;
        fs::write(&tmp, data).map_err(|source| StoreError::Io {
            path: tmp.clone(),
            source,
        })?;
        fs::rename(&tmp, &path).map_err(|source| StoreError::Io { path, source })?;
        Ok(())
    }
}

pub fn record_id(project: &str, file_stem: &str) -> String {
    format!("{project}/{file_stem}")
}
