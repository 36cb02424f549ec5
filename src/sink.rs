use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

pub const COUNTER_SESSIONS: &str = "claude.sessions";
pub const COUNTER_MESSAGES: &str = "claude.messages";
pub const COUNTER_TOOL_CALLS: &str = "claude.tool_calls";
pub const COUNTER_TOKENS: &str = "claude.tokens";
pub const COUNTER_COST_USD: &str = "claude.cost_usd";
pub const COUNTER_ACTIVE_TIME_SECONDS: &str = "claude.active_time_seconds";
pub const COUNTER_NEW_CONVERSATIONS: &str = "claude.new_conversations";
pub const GAUGE_ACTIVE_SESSIONS: &str = "claude.active_sessions";
pub const GAUGE_ACTIVE_TIME_TOTAL: &str = "claude.active_time_total_seconds";

pub const LABEL_INSTANCE: &str = "instance";
pub const LABEL_MODEL: &str = "model";
pub const LABEL_TYPE: &str = "type";

pub type Labels = Vec<(&'static str, String)>;

/// Accepts non-negative counter adds. Implementations batch and export on
/// their own cadence; callers never wait on the backend.
pub trait MetricSink {
    fn add_counter(&self, name: &'static str, value: f64, labels: Labels);
}

/// Point-in-time values published by the poll cycle and read synchronously
/// by the export worker when it assembles a batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GaugeReadings {
    pub active_sessions: u64,
    pub cumulative_active_seconds: u64,
    pub last_poll_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
pub struct GaugeState(Mutex<GaugeReadings>);

impl GaugeState {
    pub fn publish(&self, readings: GaugeReadings) {
        *self.0.lock().expect("gauge state lock") = readings;
    }

    pub fn read(&self) -> GaugeReadings {
        self.0.lock().expect("gauge state lock").clone()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct SeriesKey {
    name: &'static str,
    labels: BTreeMap<&'static str, String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CounterLine {
    name: &'static str,
    value: f64,
    labels: BTreeMap<&'static str, String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GaugeLine {
    name: &'static str,
    value: f64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ExportBatch {
    exported_at: DateTime<Utc>,
    counters: Vec<CounterLine>,
    gauges: Vec<GaugeLine>,
}

#[derive(Debug)]
struct PipelineShared {
    pending: Mutex<BTreeMap<SeriesKey, f64>>,
    gauges: GaugeState,
    spool_path: PathBuf,
}

/// Buffers counter adds from the poll cycle and appends export batches to
/// the metrics spool on an interval independent of the polling cadence.
/// Shutdown signals the worker, which flushes once more and exits.
pub struct TelemetryPipeline {
    shared: Arc<PipelineShared>,
    stop_tx: Sender<()>,
    worker: Option<JoinHandle<()>>,
}

impl TelemetryPipeline {
    pub fn start(spool_path: PathBuf, export_interval: Duration) -> Result<Self> {
        if let Some(parent) = spool_path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create telemetry directory {}", parent.display())
            })?;
        }

        let shared = Arc::new(PipelineShared {
            pending: Mutex::new(BTreeMap::new()),
            gauges: GaugeState::default(),
            spool_path,
        });

        let (stop_tx, stop_rx) = mpsc::channel();
        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("telemetry-export".to_string())
            .spawn(move || export_worker(worker_shared, stop_rx, export_interval))
            .context("failed to spawn telemetry export worker")?;

        Ok(Self {
            shared,
            stop_tx,
            worker: Some(worker),
        })
    }

    pub fn gauges(&self) -> &GaugeState {
        &self.shared.gauges
    }

    /// Signals the worker and waits for its final flush.
    pub fn shutdown(mut self) {
        let _ = self.stop_tx.send(());
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for TelemetryPipeline {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(());
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl MetricSink for TelemetryPipeline {
    fn add_counter(&self, name: &'static str, value: f64, labels: Labels) {
        if !value.is_finite() || value <= 0.0 {
            return;
        }
        let key = SeriesKey {
            name,
            labels: labels.into_iter().collect(),
        };
        let mut pending = self.shared.pending.lock().expect("pending buffer lock");
        *pending.entry(key).or_insert(0.0) += value;
    }
}

fn export_worker(shared: Arc<PipelineShared>, stop_rx: Receiver<()>, interval: Duration) {
    let mut last_gauges: Option<GaugeReadings> = None;
    loop {
        match stop_rx.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {
                flush_once(&shared, &mut last_gauges);
            }
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                flush_once(&shared, &mut last_gauges);
                debug!("telemetry export worker stopped");
                return;
            }
        }
    }
}

fn flush_once(shared: &PipelineShared, last_gauges: &mut Option<GaugeReadings>) {
    let drained: BTreeMap<SeriesKey, f64> = {
        let mut pending = shared.pending.lock().expect("pending buffer lock");
        std::mem::take(&mut *pending)
    };
    let gauges = shared.gauges.read();

    let gauges_changed = last_gauges.as_ref() != Some(&gauges);
    if drained.is_empty() && !gauges_changed {
        return;
    }
    *last_gauges = Some(gauges.clone());

    let batch = ExportBatch {
        exported_at: Utc::now(),
        counters: drained
            .into_iter()
            .map(|(key, value)| CounterLine {
                name: key.name,
                value,
                labels: key.labels,
            })
            .collect(),
        gauges: vec![
            GaugeLine {
                name: GAUGE_ACTIVE_SESSIONS,
                value: gauges.active_sessions as f64,
            },
            GaugeLine {
                name: GAUGE_ACTIVE_TIME_TOTAL,
                value: gauges.cumulative_active_seconds as f64,
            },
        ],
    };

    if let Err(err) = append_batch(&shared.spool_path, &batch) {
        warn!(path = %shared.spool_path.display(), error = %err, "failed to append export batch");
    }
}

fn append_batch(path: &PathBuf, batch: &ExportBatch) -> Result<()> {
    let line = serde_json::to_string(batch)?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    writeln!(file, "{line}").with_context(|| format!("failed to append to {}", path.display()))?;
    Ok(())
}
