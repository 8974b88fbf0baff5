pub mod configuration;
pub mod snapshot;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::emitter::{AttributeValue, LogRecord, ProfileEmitter, Resource, SeverityNumber};
use crate::profile_serializer::{encode_cpu_profile, serialize_profile};
use crate::stack_collector::{StackSource, Stacktrace};
use crate::thread_context::{SpanContext, ThreadContextRegistry};
use crate::timer_thread::IntervalTimer;
use crate::util::current_thread_id;

use self::configuration::Configuration;

pub const DATA_FORMAT_ATTR: &str = "profiling.data.format";
pub const DATA_TYPE_ATTR: &str = "profiling.data.type";
pub const SOURCETYPE_ATTR: &str = "com.splunk.sourcetype";
pub const FRAME_COUNT_ATTR: &str = "profiling.data.total.frame.count";
pub const INSTRUMENTATION_SOURCE_ATTR: &str = "profiling.instrumentation.source";

pub const DATA_FORMAT: &str = "pprof-gzip-base64";
pub const DATA_TYPE: &str = "cpu";
pub const SOURCETYPE: &str = "otel.profiling";

type StacktraceFilter =
    dyn Fn(Vec<Stacktrace>, &HashMap<u64, SpanContext>) -> Vec<Stacktrace> + Send + Sync;
type Clock = dyn Fn() -> SystemTime + Send + Sync;

/// One profiling session: a resolved configuration, a context registry, a
/// stack source and a destination emitter, driven by an [`IntervalTimer`].
///
/// Every tick snapshots all live threads, correlates them with their active
/// span contexts, encodes one pprof profile and hands it to the emitter.
pub struct Session {
    inner: Arc<SessionInner>,
    timer: IntervalTimer,
}

struct SessionInner {
    configuration: Configuration,
    resource: Resource,
    registry: ThreadContextRegistry,
    stack_source: Arc<dyn StackSource>,
    emitter: Arc<dyn ProfileEmitter>,
    filter: Option<Box<StacktraceFilter>>,
    clock: Box<Clock>,
}

impl Session {
    pub fn new(
        configuration: Configuration,
        registry: ThreadContextRegistry,
        stack_source: Arc<dyn StackSource>,
        emitter: Arc<dyn ProfileEmitter>,
    ) -> Session {
        Self::build(
            configuration,
            registry,
            stack_source,
            emitter,
            None,
            Box::new(SystemTime::now),
        )
    }

    fn build(
        configuration: Configuration,
        registry: ThreadContextRegistry,
        stack_source: Arc<dyn StackSource>,
        emitter: Arc<dyn ProfileEmitter>,
        filter: Option<Box<StacktraceFilter>>,
        clock: Box<Clock>,
    ) -> Session {
        let resource = Resource::new(&configuration.service_name);
        let inner = Arc::new(SessionInner {
            configuration,
            resource,
            registry,
            stack_source,
            emitter,
            filter,
            clock,
        });

        let ticking = Arc::clone(&inner);
        let timer = IntervalTimer::new(inner.configuration.call_stack_interval, move || {
            ticking.tick()
        });

        Session { inner, timer }
    }

    /// Starts sampling, or resumes a paused session and cancels any
    /// scheduled pause. Starting a running session is a no-op.
    pub fn start(&self) {
        if self.timer.is_running() {
            log::debug!("profiler already running");
        } else {
            log::debug!(
                "starting profiling interval={:?} source={}",
                self.inner.configuration.call_stack_interval,
                self.inner.configuration.instrumentation_source.as_str()
            );
        }
        self.timer.start();
    }

    pub fn stop(&self) {
        self.timer.stop();
    }

    pub fn pause_after(&self, delay: Duration) {
        self.timer.pause_after(delay);
    }

    pub fn is_running(&self) -> bool {
        self.timer.is_running()
    }

    pub fn configuration(&self) -> &Configuration {
        &self.inner.configuration
    }
}

impl SessionInner {
    fn tick(&self) {
        let ignored = self.ignored_thread_ids();
        let stacktraces = self.stack_source.collect(&ignored);
        let thread_states = self.registry.snapshot();

        let stacktraces = match &self.filter {
            Some(filter) => {
                let filtered = filter(stacktraces, &thread_states);
                if filtered.is_empty() {
                    log::trace!("no stacktraces for selected traces, skipping emission");
                    return;
                }
                filtered
            }
            None => stacktraces,
        };

        let total_frame_count: i64 = stacktraces
            .iter()
            .map(|stacktrace| stacktrace.frames.len() as i64)
            .sum();

        let time = (self.clock)();
        let profile = encode_cpu_profile(
            &stacktraces,
            &thread_states,
            self.configuration.interval_millis(),
            time,
        );
        let body = match serialize_profile(&profile) {
            Ok(body) => body,
            Err(err) => {
                log::warn!("failed to serialize profile, dropping tick: {err}");
                return;
            }
        };

        self.emitter.emit(LogRecord {
            timestamp_unix_nanos: time
                .duration_since(UNIX_EPOCH)
                .map(|elapsed| elapsed.as_nanos() as u64)
                .unwrap_or(0),
            severity_number: SeverityNumber::Unspecified,
            trace_flags: 1,
            body,
            attributes: self.record_attributes(total_frame_count),
            resource: self.resource.clone(),
        });
    }

    fn record_attributes(&self, total_frame_count: i64) -> BTreeMap<String, AttributeValue> {
        let mut attributes = BTreeMap::new();
        attributes.insert(DATA_FORMAT_ATTR.to_owned(), DATA_FORMAT.into());
        attributes.insert(DATA_TYPE_ATTR.to_owned(), DATA_TYPE.into());
        attributes.insert(SOURCETYPE_ATTR.to_owned(), SOURCETYPE.into());
        attributes.insert(FRAME_COUNT_ATTR.to_owned(), total_frame_count.into());
        attributes.insert(
            INSTRUMENTATION_SOURCE_ATTR.to_owned(),
            self.configuration.instrumentation_source.as_str().into(),
        );
        attributes
    }

    /// The sampler never profiles itself, and leaves the emitter's worker
    /// threads out unless configured to include internal stacks.
    fn ignored_thread_ids(&self) -> HashSet<u64> {
        if self.configuration.include_internal_stacks {
            return HashSet::new();
        }

        let mut ignored = HashSet::from([current_thread_id()]);
        ignored.extend(self.emitter.internal_thread_ids());
        ignored
    }
}
