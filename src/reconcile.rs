use tracing::debug;

use crate::sink::{
    COUNTER_COST_USD, COUNTER_MESSAGES, COUNTER_SESSIONS, COUNTER_TOKENS, COUNTER_TOOL_CALLS,
    LABEL_INSTANCE, LABEL_MODEL, LABEL_TYPE, Labels, MetricSink,
};
use crate::snapshot::{ModelTokens, UsageSnapshot};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub backfill: bool,
    pub counters_emitted: usize,
}

/// Turns absolute usage snapshots into non-negative counter deltas.
///
/// The first snapshot of a process lifetime is emitted in full (backfill);
/// afterwards only forward movement is reported. The stored previous
/// snapshot is always replaced wholesale, so a spurious decrease suppresses
/// the delta once instead of over-reporting on the next cycle. A model key
/// absent from the new snapshot means "no data", never "decrease to zero".
#[derive(Debug)]
pub struct DeltaReconciler {
    instance_id: String,
    previous: UsageSnapshot,
    initialized: bool,
}

impl DeltaReconciler {
    pub fn new(instance_id: String) -> Self {
        Self {
            instance_id,
            previous: UsageSnapshot::default(),
            initialized: false,
        }
    }

    pub fn reconcile(&mut self, snapshot: &UsageSnapshot, sink: &dyn MetricSink) -> ReconcileOutcome {
        let backfill = !self.initialized;
        let mut emitted = 0usize;

        self.emit_scalar(
            sink,
            COUNTER_SESSIONS,
            snapshot.session_count,
            self.previous.session_count,
            &mut emitted,
        );
        self.emit_scalar(
            sink,
            COUNTER_MESSAGES,
            snapshot.message_count,
            self.previous.message_count,
            &mut emitted,
        );
        self.emit_scalar(
            sink,
            COUNTER_TOOL_CALLS,
            snapshot.tool_call_count(),
            self.previous.tool_call_count(),
            &mut emitted,
        );

        for (model, tokens) in &snapshot.tokens_by_model {
            let previous = self
                .previous
                .tokens_by_model
                .get(model)
                .copied()
                .unwrap_or_default();
            self.emit_token_deltas(sink, model, *tokens, previous, &mut emitted);
        }

        for (model, cost) in &snapshot.cost_by_model {
            let previous = self.previous.cost_by_model.get(model).copied().unwrap_or(0.0);
            let delta = cost - previous;
            if delta > 0.0 {
                sink.add_counter(
                    COUNTER_COST_USD,
                    delta,
                    self.labels(&[(LABEL_MODEL, model.clone())]),
                );
                emitted += 1;
            }
        }

        self.previous = snapshot.clone();
        self.initialized = true;

        if backfill {
            debug!(counters = emitted, "backfilled baseline usage totals");
        }

        ReconcileOutcome {
            backfill,
            counters_emitted: emitted,
        }
    }

    fn emit_scalar(
        &self,
        sink: &dyn MetricSink,
        name: &'static str,
        new: u64,
        previous: u64,
        emitted: &mut usize,
    ) {
        if new > previous {
            sink.add_counter(name, (new - previous) as f64, self.labels(&[]));
            *emitted += 1;
        }
    }

    fn emit_token_deltas(
        &self,
        sink: &dyn MetricSink,
        model: &str,
        new: ModelTokens,
        previous: ModelTokens,
        emitted: &mut usize,
    ) {
        let pairs = [
            ("input", new.input, previous.input),
            ("output", new.output, previous.output),
            ("cache_read", new.cache_read, previous.cache_read),
            ("cache_write", new.cache_write, previous.cache_write),
        ];
        for (token_type, new_value, previous_value) in pairs {
            if new_value > previous_value {
                sink.add_counter(
                    COUNTER_TOKENS,
                    (new_value - previous_value) as f64,
                    self.labels(&[
                        (LABEL_MODEL, model.to_string()),
                        (LABEL_TYPE, token_type.to_string()),
                    ]),
                );
                *emitted += 1;
            }
        }
    }

    fn labels(&self, extra: &[(&'static str, String)]) -> Labels {
        let mut labels: Labels = vec![(LABEL_INSTANCE, self.instance_id.clone())];
        labels.extend(extra.iter().cloned());
        labels
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::BTreeMap;

    #[derive(Default)]
    struct RecordingSink {
        adds: RefCell<Vec<(&'static str, f64, BTreeMap<&'static str, String>)>>,
    }

    impl MetricSink for RecordingSink {
        fn add_counter(&self, name: &'static str, value: f64, labels: Labels) {
            self.adds
                .borrow_mut()
                .push((name, value, labels.into_iter().collect()));
        }
    }

    impl RecordingSink {
        fn total(&self, name: &str) -> f64 {
            self.adds
                .borrow()
                .iter()
                .filter(|(n, _, _)| *n == name)
                .map(|(_, v, _)| v)
                .sum()
        }

        fn count(&self) -> usize {
            self.adds.borrow().len()
        }

        fn clear(&self) {
            self.adds.borrow_mut().clear();
        }
    }

    fn tokens(input: u64, output: u64, cache_read: u64, cache_write: u64) -> ModelTokens {
        ModelTokens {
            input,
            output,
            cache_read,
            cache_write,
        }
    }

    fn sample_snapshot() -> UsageSnapshot {
        let mut snapshot = UsageSnapshot {
            session_count: 10,
            message_count: 200,
            ..UsageSnapshot::default()
        };
        snapshot.tool_calls_by_day.insert("2026-08-05".into(), 30);
        snapshot.tool_calls_by_day.insert("2026-08-06".into(), 12);
        snapshot
            .tokens_by_model
            .insert("claude-sonnet-4-5".into(), tokens(1_000, 500, 200, 100));
        snapshot.cost_by_model.insert("claude-sonnet-4-5".into(), 2.5);
        snapshot
    }

    #[test]
    fn first_reconcile_backfills_every_non_zero_field() {
        let sink = RecordingSink::default();
        let mut reconciler = DeltaReconciler::new("inst".into());

        let outcome = reconciler.reconcile(&sample_snapshot(), &sink);

        assert!(outcome.backfill);
        assert_eq!(sink.total(COUNTER_SESSIONS), 10.0);
        assert_eq!(sink.total(COUNTER_MESSAGES), 200.0);
        assert_eq!(sink.total(COUNTER_TOOL_CALLS), 42.0);
        assert_eq!(sink.total(COUNTER_TOKENS), 1_800.0);
        assert_eq!(sink.total(COUNTER_COST_USD), 2.5);
        // 3 scalars + 4 token types + 1 cost
        assert_eq!(outcome.counters_emitted, 8);
    }

    #[test]
    fn identical_snapshot_emits_nothing() {
        let sink = RecordingSink::default();
        let mut reconciler = DeltaReconciler::new("inst".into());
        let snapshot = sample_snapshot();

        reconciler.reconcile(&snapshot, &sink);
        sink.clear();

        let outcome = reconciler.reconcile(&snapshot, &sink);
        assert!(!outcome.backfill);
        assert_eq!(outcome.counters_emitted, 0);
        assert_eq!(sink.count(), 0);
    }

    #[test]
    fn steady_state_emits_only_forward_movement() {
        let sink = RecordingSink::default();
        let mut reconciler = DeltaReconciler::new("inst".into());

        reconciler.reconcile(&sample_snapshot(), &sink);
        sink.clear();

        let mut next = sample_snapshot();
        next.session_count = 12;
        next.message_count = 230;
        next.tokens_by_model
            .insert("claude-sonnet-4-5".into(), tokens(1_500, 500, 250, 100));
        next.cost_by_model.insert("claude-sonnet-4-5".into(), 3.0);

        let outcome = reconciler.reconcile(&next, &sink);
        assert_eq!(sink.total(COUNTER_SESSIONS), 2.0);
        assert_eq!(sink.total(COUNTER_MESSAGES), 30.0);
        assert_eq!(sink.total(COUNTER_TOOL_CALLS), 0.0);
        // input +500, cache_read +50; output and cache_write unchanged
        assert_eq!(sink.total(COUNTER_TOKENS), 550.0);
        assert!((sink.total(COUNTER_COST_USD) - 0.5).abs() < 1e-9);
        assert_eq!(outcome.counters_emitted, 5);
    }

    #[test]
    fn decrease_is_suppressed_and_becomes_the_new_watermark() {
        let sink = RecordingSink::default();
        let mut reconciler = DeltaReconciler::new("inst".into());

        let mut snapshot = UsageSnapshot::default();
        snapshot.session_count = 10;
        reconciler.reconcile(&snapshot, &sink);
        sink.clear();

        // Upstream file truncated: count drops to 7. No negative emission.
        snapshot.session_count = 7;
        let outcome = reconciler.reconcile(&snapshot, &sink);
        assert_eq!(outcome.counters_emitted, 0);
        assert_eq!(sink.count(), 0);

        // Recovery to 9 is measured against the observed 7, not the old 10.
        snapshot.session_count = 9;
        reconciler.reconcile(&snapshot, &sink);
        assert_eq!(sink.total(COUNTER_SESSIONS), 2.0);
    }

    #[test]
    fn disappeared_model_key_synthesizes_no_decrease() {
        let sink = RecordingSink::default();
        let mut reconciler = DeltaReconciler::new("inst".into());

        reconciler.reconcile(&sample_snapshot(), &sink);
        sink.clear();

        let mut next = sample_snapshot();
        next.tokens_by_model.clear();
        next.cost_by_model.clear();

        let outcome = reconciler.reconcile(&next, &sink);
        assert_eq!(outcome.counters_emitted, 0);

        // When the model reappears its totals are all new data.
        let outcome = reconciler.reconcile(&sample_snapshot(), &sink);
        assert_eq!(sink.total(COUNTER_TOKENS), 1_800.0);
        assert_eq!(sink.total(COUNTER_COST_USD), 2.5);
        assert_eq!(outcome.counters_emitted, 5);
    }

    #[test]
    fn token_types_move_independently() {
        let sink = RecordingSink::default();
        let mut reconciler = DeltaReconciler::new("inst".into());

        let mut snapshot = UsageSnapshot::default();
        snapshot
            .tokens_by_model
            .insert("claude-opus-4-1".into(), tokens(100, 100, 0, 0));
        reconciler.reconcile(&snapshot, &sink);
        sink.clear();

        // Input grows while output regresses; only input is reported.
        snapshot
            .tokens_by_model
            .insert("claude-opus-4-1".into(), tokens(150, 40, 0, 0));
        reconciler.reconcile(&snapshot, &sink);

        let adds = sink.adds.borrow();
        assert_eq!(adds.len(), 1);
        let (name, value, labels) = &adds[0];
        assert_eq!(*name, COUNTER_TOKENS);
        assert_eq!(*value, 50.0);
        assert_eq!(labels.get(LABEL_TYPE).map(String::as_str), Some("input"));
        assert_eq!(
            labels.get(LABEL_MODEL).map(String::as_str),
            Some("claude-opus-4-1")
        );
        assert_eq!(labels.get(LABEL_INSTANCE).map(String::as_str), Some("inst"));
    }

    #[test]
    fn sum_of_deltas_matches_final_total_for_monotone_input() {
        let sink = RecordingSink::default();
        let mut reconciler = DeltaReconciler::new("inst".into());

        for messages in [5u64, 5, 17, 120, 120, 4_000] {
            let snapshot = UsageSnapshot {
                message_count: messages,
                ..UsageSnapshot::default()
            };
            reconciler.reconcile(&snapshot, &sink);
        }

        assert_eq!(sink.total(COUNTER_MESSAGES), 4_000.0);
        assert!(sink.adds.borrow().iter().all(|(_, value, _)| *value > 0.0));
    }
}
