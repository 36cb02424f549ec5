use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::active_time::ActiveTimeAccumulator;
use crate::config::{self, ExporterConfig, RuntimeSettings};
use crate::dedupe::ConversationDeduper;
use crate::process_guard::{self, RunningState};
use crate::reconcile::{DeltaReconciler, ReconcileOutcome};
use crate::sessions;
use crate::sink::{
    COUNTER_ACTIVE_TIME_SECONDS, COUNTER_NEW_CONVERSATIONS, GaugeReadings, GaugeState,
    LABEL_INSTANCE, MetricSink, TelemetryPipeline,
};
use crate::snapshot;
use crate::store::StateStore;
use crate::util::{format_cost, format_local, format_tokens, human_duration, truncate};

/// Source locations read by every poll cycle.
#[derive(Debug, Clone)]
pub struct DataPaths {
    pub snapshot: PathBuf,
    pub projects: PathBuf,
}

impl DataPaths {
    pub fn default_locations() -> Self {
        Self {
            snapshot: config::snapshot_path(),
            projects: config::projects_path(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CycleReport {
    pub snapshot_present: bool,
    pub backfill: bool,
    pub counters_emitted: usize,
    pub active_sessions: usize,
    pub new_conversations: u64,
    pub accrued_seconds: u64,
}

/// Owns every piece of reconciliation state for the process lifetime and
/// runs the sequential per-tick pass. Constructed once; never shared.
pub struct ExporterEngine {
    reconciler: DeltaReconciler,
    active_time: ActiveTimeAccumulator,
    deduper: ConversationDeduper,
    store: StateStore,
    instance_id: String,
}

impl ExporterEngine {
    pub fn new(store: StateStore, instance_id: String) -> Self {
        let active_state = store.load_active_time().unwrap_or_else(|err| {
            warn!(error = %err, "could not load active-time state; starting from zero");
            Default::default()
        });
        let seen = store.load_seen_records().unwrap_or_else(|err| {
            warn!(error = %err, "could not load seen-conversation state; starting empty");
            Default::default()
        });

        Self {
            reconciler: DeltaReconciler::new(instance_id.clone()),
            active_time: ActiveTimeAccumulator::from_state(active_state),
            deduper: ConversationDeduper::new(seen, store.clone()),
            store,
            instance_id,
        }
    }

    /// One full reconciliation pass: source reads, derivations, delta
    /// emission, persistence flush, gauge publication. Errors inside the
    /// pass are logged and recovered on the next tick; none are fatal.
    pub fn run_cycle(
        &mut self,
        paths: &DataPaths,
        active_window: Duration,
        sink: &dyn MetricSink,
        gauges: &GaugeState,
        now: DateTime<Utc>,
        disk_now: SystemTime,
    ) -> CycleReport {
        let usage = snapshot::read_snapshot(&paths.snapshot);
        let scan = sessions::scan_projects(&paths.projects, active_window, disk_now);

        let new_ids = self.deduper.find_new(&scan.record_ids);
        let mut new_conversations = 0u64;
        if !self.deduper.initialized() {
            // Records present at startup are pre-existing population, not
            // new-conversation events.
            if let Err(err) = self.deduper.commit(&new_ids) {
                warn!(error = %err, "failed to persist conversation baseline");
            }
        } else if !new_ids.is_empty() {
            new_conversations = new_ids.len() as u64;
            sink.add_counter(
                COUNTER_NEW_CONVERSATIONS,
                new_conversations as f64,
                vec![(LABEL_INSTANCE, self.instance_id.clone())],
            );
            if let Err(err) = self.deduper.commit(&new_ids) {
                warn!(error = %err, "failed to persist seen conversations");
            }
        }

        let outcome = match &usage {
            Some(usage) => self.reconciler.reconcile(usage, sink),
            None => {
                debug!("usage snapshot unavailable; skipping reconciliation this cycle");
                ReconcileOutcome::default()
            }
        };

        let increment = self.active_time.observe(!scan.active.is_empty(), now);
        if increment.counter_delta > 0 {
            sink.add_counter(
                COUNTER_ACTIVE_TIME_SECONDS,
                increment.counter_delta as f64,
                vec![(LABEL_INSTANCE, self.instance_id.clone())],
            );
        }
        if let Err(err) = self.store.save_active_time(self.active_time.state()) {
            warn!(error = %err, "failed to persist active-time state");
        }

        gauges.publish(GaugeReadings {
            active_sessions: scan.active.len() as u64,
            cumulative_active_seconds: self.active_time.cumulative_seconds(),
            last_poll_at: Some(now),
        });

        CycleReport {
            snapshot_present: usage.is_some(),
            backfill: outcome.backfill,
            counters_emitted: outcome.counters_emitted,
            active_sessions: scan.active.len(),
            new_conversations,
            accrued_seconds: increment.accrued_seconds,
        }
    }
}

pub fn run(runtime: RuntimeSettings) -> Result<()> {
    let stop = install_stop_signal()?;
    let paths = DataPaths::default_locations();
    let store = StateStore::new(config::telemetry_dir());
    let instance_id = Uuid::new_v4().to_string();
    let mut engine = ExporterEngine::new(store, instance_id.clone());
    let pipeline = TelemetryPipeline::start(config::metrics_spool_path(), runtime.export_interval)?;

    info!(
        instance = %instance_id,
        poll_secs = runtime.poll_interval.as_secs(),
        export_secs = runtime.export_interval.as_secs(),
        window_secs = runtime.active_window.as_secs(),
        "usage exporter started"
    );

    let mut last_tick = Instant::now() - runtime.poll_interval;
    while !stop.load(Ordering::Relaxed) {
        if last_tick.elapsed() >= runtime.poll_interval {
            let report = engine.run_cycle(
                &paths,
                runtime.active_window,
                &pipeline,
                pipeline.gauges(),
                Utc::now(),
                SystemTime::now(),
            );
            debug!(
                snapshot = report.snapshot_present,
                backfill = report.backfill,
                counters = report.counters_emitted,
                active = report.active_sessions,
                new_conversations = report.new_conversations,
                accrued = report.accrued_seconds,
                "poll cycle complete"
            );
            last_tick = Instant::now();
        }
        thread::sleep(Duration::from_millis(200));
    }

    info!("stop requested; flushing telemetry");
    pipeline.shutdown();
    Ok(())
}

pub fn print_status(config: &ExporterConfig) -> Result<()> {
    let runtime = config.runtime_settings();
    let paths = DataPaths::default_locations();
    let store = StateStore::new(config::telemetry_dir());

    let running = process_guard::inspect_running_instance()?;
    let (is_running, running_pid) = match running {
        RunningState::NotRunning => (false, None),
        RunningState::Running { pid } => (true, pid),
    };

    println!("claude-usage-exporter status");
    println!("running: {is_running}");
    if let Some(pid) = running_pid {
        println!("pid: {pid}");
    }
    println!("config: {}", config::config_path().display());
    println!("data_home: {}", config::claude_home().display());
    println!("metrics_spool: {}", config::metrics_spool_path().display());

    match snapshot::read_snapshot(&paths.snapshot) {
        Some(usage) => {
            let tokens: u64 = usage
                .tokens_by_model
                .values()
                .map(|t| t.input + t.output + t.cache_read + t.cache_write)
                .sum();
            let cost: f64 = usage.cost_by_model.values().sum();
            println!("snapshot: present");
            println!(
                "  sessions: {} | messages: {} | tool_calls: {}",
                usage.session_count,
                usage.message_count,
                usage.tool_call_count()
            );
            println!(
                "  models: {} | tokens: {} | cost: {}",
                usage.tokens_by_model.len(),
                format_tokens(tokens),
                format_cost(cost)
            );
        }
        None => println!("snapshot: absent"),
    }

    let active_time = store.load_active_time().unwrap_or_default();
    print!(
        "active_time: {}",
        human_duration(Duration::from_secs(active_time.cumulative_seconds))
    );
    match active_time.last_observation_at {
        Some(ts) => println!(" (last observed {})", format_local(ts)),
        None => println!(),
    }
    let seen = store.load_seen_records().unwrap_or_default();
    println!("seen_conversations: {}", seen.ids.len());

    let scan = sessions::scan_projects(&paths.projects, runtime.active_window, SystemTime::now());
    println!("active_sessions: {}", scan.active.len());
    for session in scan.active.iter().take(5) {
        let age = SystemTime::now()
            .duration_since(session.last_modified)
            .unwrap_or_default();
        if session.title.is_empty() {
            println!("  - {} ({} ago)", session.id, human_duration(age));
        } else {
            println!(
                "  - {} \"{}\" ({} ago)",
                session.id,
                truncate(&session.title, 48),
                human_duration(age)
            );
        }
    }

    Ok(())
}

pub fn doctor(config: &ExporterConfig) -> Result<u8> {
    let mut issues = 0u8;
    let runtime = config.runtime_settings();
    let paths = DataPaths::default_locations();

    println!("claude-usage-exporter doctor");
    println!("config_path: {}", config::config_path().display());
    println!("data_home: {}", config::claude_home().display());

    if config::claude_home().is_dir() {
        println!("[OK] Data home directory is accessible.");
    } else {
        issues += 1;
        println!("[WARN] Data home directory does not exist.");
    }

    match snapshot::read_snapshot(&paths.snapshot) {
        Some(_) => println!("[OK] Usage snapshot is readable."),
        None => {
            println!(
                "[INFO] Usage snapshot not readable at {} (cycles will skip reconciliation until it appears).",
                paths.snapshot.display()
            );
        }
    }

    if paths.projects.is_dir() {
        println!("[OK] Projects directory is accessible.");
    } else {
        println!("[INFO] Projects directory not found; no sessions will be reported.");
    }

    match std::fs::create_dir_all(config::telemetry_dir()) {
        Ok(()) => println!("[OK] Telemetry state directory is writable."),
        Err(err) => {
            issues += 1;
            println!("[WARN] Cannot create telemetry state directory: {err}.");
        }
    }

    if runtime.poll_interval >= runtime.active_window {
        issues += 1;
        println!(
            "[WARN] Poll interval ({}) is not shorter than the active window ({}).",
            human_duration(runtime.poll_interval),
            human_duration(runtime.active_window)
        );
    } else {
        println!("[OK] Poll interval is shorter than the active window.");
    }

    match process_guard::inspect_running_instance()? {
        RunningState::Running { pid } => match pid {
            Some(pid) => println!("[INFO] Exporter already running (PID {pid})."),
            None => println!("[INFO] Exporter already running."),
        },
        RunningState::NotRunning => println!("[OK] No other exporter instance is running."),
    }

    if issues == 0 {
        println!("Doctor: healthy");
        Ok(0)
    } else {
        println!("Doctor: {issues} issue(s) found");
        Ok(1)
    }
}

fn install_stop_signal() -> Result<Arc<AtomicBool>> {
    let stop = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&stop);
    ctrlc::set_handler(move || {
        flag.store(true, Ordering::Relaxed);
    })
    .context("failed to install Ctrl+C handler")?;
    Ok(stop)
}
