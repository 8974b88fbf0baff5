use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use crate::emitter::ProfileEmitter;
use crate::stack_collector::{StackSource, Stacktrace};
use crate::thread_context::{SpanContext, ThreadContextRegistry};
use crate::util::lock;

use super::configuration::{Configuration, InstrumentationSource};
use super::Session;

/// Baggage entry that marks a trace as selected for snapshot profiling.
pub const SNAPSHOT_VOLUME_BAGGAGE_KEY: &str = "splunk.trace.snapshot.volume";
pub const SNAPSHOT_VOLUME_HIGHEST: &str = "highest";

/// How long the sampler keeps running after the last selected span ends,
/// so closely spaced requests of the same trace do not thrash the timer.
pub const DEFAULT_PAUSE_GRACE: Duration = Duration::from_secs(60);

/// Snapshot-mode activation: drives a [`Session`] from span lifecycle events.
///
/// A span is selected when it begins a local trace (no parent, or a remote
/// parent) and its baggage carries the snapshot volume marker. While any
/// selected span is open the session runs, and its per-tick filter keeps
/// only the stacktraces of threads whose active trace is a selected one.
/// When the last selected span ends the sampler is paused after a grace
/// period rather than stopped; the next selected span resumes it.
pub struct SnapshotTracker {
    /// Open selected spans, span id to trace id.
    spans: Arc<Mutex<HashMap<u64, u128>>>,
    session: Session,
    pause_grace: Duration,
}

impl SnapshotTracker {
    pub fn new(
        configuration: Configuration,
        registry: ThreadContextRegistry,
        stack_source: Arc<dyn StackSource>,
        emitter: Arc<dyn ProfileEmitter>,
    ) -> Self {
        Self::with_pause_grace(
            configuration,
            registry,
            stack_source,
            emitter,
            DEFAULT_PAUSE_GRACE,
        )
    }

    pub fn with_pause_grace(
        mut configuration: Configuration,
        registry: ThreadContextRegistry,
        stack_source: Arc<dyn StackSource>,
        emitter: Arc<dyn ProfileEmitter>,
        pause_grace: Duration,
    ) -> Self {
        configuration.instrumentation_source = InstrumentationSource::Snapshot;

        let spans: Arc<Mutex<HashMap<u64, u128>>> = Arc::default();
        let selected = Arc::clone(&spans);
        let filter = move |stacktraces: Vec<Stacktrace>,
                           thread_states: &HashMap<u64, SpanContext>|
              -> Vec<Stacktrace> {
            let selected = lock(&selected);
            stacktraces
                .into_iter()
                .filter(|stacktrace| {
                    thread_states
                        .get(&stacktrace.thread_id)
                        .is_some_and(|context| {
                            selected.values().any(|trace_id| *trace_id == context.trace_id)
                        })
                })
                .collect()
        };

        let session = Session::build(
            configuration,
            registry,
            stack_source,
            emitter,
            Some(Box::new(filter)),
            Box::new(SystemTime::now),
        );

        SnapshotTracker {
            spans,
            session,
            pause_grace,
        }
    }

    /// Observes a span starting. `parent_is_remote` is `None` when the span
    /// has no valid parent; only trace-initiating spans (no parent, or a
    /// remote one) are considered, so one trace is tracked through a single
    /// entry span per service.
    pub fn on_span_start(
        &self,
        span: SpanContext,
        parent_is_remote: Option<bool>,
        snapshot_volume: Option<&str>,
    ) {
        if !parent_is_remote.unwrap_or(true) {
            return;
        }
        if snapshot_volume != Some(SNAPSHOT_VOLUME_HIGHEST) {
            return;
        }

        log::debug!(
            "trace {:032x} selected for snapshot profiling",
            span.trace_id
        );
        lock(&self.spans).insert(span.span_id, span.trace_id);
        self.session.start();
    }

    /// Observes a span ending. When the last tracked span ends, the sampler
    /// is left running for the grace period and then paused.
    pub fn on_span_end(&self, span_id: u64) {
        let mut spans = lock(&self.spans);
        if spans.remove(&span_id).is_none() {
            return;
        }
        if spans.is_empty() {
            log::debug!("no selected spans open, scheduling sampler pause");
            self.session.pause_after(self.pause_grace);
        }
    }

    pub fn is_running(&self) -> bool {
        self.session.is_running()
    }

    /// Stops the underlying session for good. Called at process shutdown.
    pub fn shutdown(&self) {
        self.session.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile_serializer::{deserialize_profile, THREAD_ID_LABEL};
    use crate::session::tests::{label_num, stacktrace, FakeEmitter, FakeStackSource};
    use std::thread;

    fn configuration() -> Configuration {
        Configuration {
            call_stack_interval: Duration::from_millis(20),
            include_internal_stacks: true,
            service_name: "snapshot-test".to_owned(),
            instrumentation_source: InstrumentationSource::Continuous,
        }
    }

    fn tracker_with(
        registry: ThreadContextRegistry,
        source: Arc<FakeStackSource>,
        emitter: Arc<FakeEmitter>,
        pause_grace: Duration,
    ) -> SnapshotTracker {
        SnapshotTracker::with_pause_grace(
            configuration(),
            registry,
            source,
            emitter,
            pause_grace,
        )
    }

    #[test]
    fn unmarked_spans_do_not_start_profiling() {
        let tracker = tracker_with(
            ThreadContextRegistry::new(),
            FakeStackSource::new(vec![]),
            FakeEmitter::new(),
            DEFAULT_PAUSE_GRACE,
        );

        tracker.on_span_start(SpanContext::new(7, 100), None, None);
        tracker.on_span_start(SpanContext::new(7, 101), None, Some("high"));
        assert!(!tracker.is_running());
    }

    #[test]
    fn spans_with_local_parents_are_ignored() {
        let tracker = tracker_with(
            ThreadContextRegistry::new(),
            FakeStackSource::new(vec![]),
            FakeEmitter::new(),
            DEFAULT_PAUSE_GRACE,
        );

        tracker.on_span_start(
            SpanContext::new(7, 100),
            Some(false),
            Some(SNAPSHOT_VOLUME_HIGHEST),
        );
        assert!(!tracker.is_running());

        tracker.on_span_start(
            SpanContext::new(7, 101),
            Some(true),
            Some(SNAPSHOT_VOLUME_HIGHEST),
        );
        assert!(tracker.is_running());
        tracker.shutdown();
    }

    #[test]
    fn only_threads_on_selected_traces_are_emitted() {
        let registry = ThreadContextRegistry::new();
        registry.on_attach(31, Some(SpanContext::new(7, 200)));
        registry.on_attach(32, Some(SpanContext::new(8, 300)));

        let source = FakeStackSource::new(vec![stacktrace(31), stacktrace(32), stacktrace(33)]);
        let emitter = FakeEmitter::new();
        let tracker = tracker_with(
            registry,
            source,
            Arc::clone(&emitter),
            DEFAULT_PAUSE_GRACE,
        );

        tracker.on_span_start(SpanContext::new(7, 100), None, Some(SNAPSHOT_VOLUME_HIGHEST));
        thread::sleep(Duration::from_millis(70));
        tracker.shutdown();

        let records = emitter.records.lock().unwrap();
        assert!(!records.is_empty());
        for record in records.iter() {
            let profile = deserialize_profile(&record.body).unwrap();
            assert_eq!(profile.sample.len(), 1);
            assert_eq!(
                label_num(&profile, &profile.sample[0], THREAD_ID_LABEL),
                Some(31)
            );
        }
    }

    #[test]
    fn no_matching_threads_means_no_emission() {
        let source = FakeStackSource::new(vec![stacktrace(31)]);
        let emitter = FakeEmitter::new();
        let tracker = tracker_with(
            ThreadContextRegistry::new(),
            source,
            Arc::clone(&emitter),
            DEFAULT_PAUSE_GRACE,
        );

        tracker.on_span_start(SpanContext::new(7, 100), None, Some(SNAPSHOT_VOLUME_HIGHEST));
        thread::sleep(Duration::from_millis(70));
        tracker.shutdown();

        assert!(!tracker.is_running());
        assert_eq!(emitter.record_count(), 0);
    }

    #[test]
    fn last_span_end_pauses_and_next_span_resumes() {
        let registry = ThreadContextRegistry::new();
        registry.on_attach(31, Some(SpanContext::new(7, 200)));

        let source = FakeStackSource::new(vec![stacktrace(31)]);
        let emitter = FakeEmitter::new();
        let tracker = tracker_with(registry, source, Arc::clone(&emitter), Duration::ZERO);

        tracker.on_span_start(SpanContext::new(7, 100), None, Some(SNAPSHOT_VOLUME_HIGHEST));
        thread::sleep(Duration::from_millis(70));
        tracker.on_span_end(100);
        thread::sleep(Duration::from_millis(70));

        let while_paused = emitter.record_count();
        thread::sleep(Duration::from_millis(70));
        assert_eq!(emitter.record_count(), while_paused);
        // Paused, not stopped.
        assert!(tracker.is_running());

        tracker.on_span_start(SpanContext::new(7, 101), None, Some(SNAPSHOT_VOLUME_HIGHEST));
        thread::sleep(Duration::from_millis(70));
        assert!(emitter.record_count() > while_paused);
        tracker.shutdown();
    }

    #[test]
    fn pause_waits_for_every_selected_span_to_end() {
        let registry = ThreadContextRegistry::new();
        registry.on_attach(31, Some(SpanContext::new(7, 200)));

        let source = FakeStackSource::new(vec![stacktrace(31)]);
        let emitter = FakeEmitter::new();
        let tracker = tracker_with(registry, source, Arc::clone(&emitter), Duration::ZERO);

        tracker.on_span_start(SpanContext::new(7, 100), None, Some(SNAPSHOT_VOLUME_HIGHEST));
        tracker.on_span_start(SpanContext::new(9, 101), None, Some(SNAPSHOT_VOLUME_HIGHEST));

        tracker.on_span_end(100);
        // Unknown span ids are ignored.
        tracker.on_span_end(555);

        thread::sleep(Duration::from_millis(70));
        let before = emitter.record_count();
        thread::sleep(Duration::from_millis(70));
        assert!(emitter.record_count() > before, "sampler paused too early");

        tracker.shutdown();
    }
}
