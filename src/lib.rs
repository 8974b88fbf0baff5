#[macro_use]
extern crate serde_derive;

mod emitter;
pub mod pprof;
mod profile_serializer;
mod session;
mod stack_collector;
mod string_table;
mod thread_context;
mod timer_thread;
mod util;

pub use emitter::{
    AttributeValue, JsonLinesEmitter, LogRecord, ProfileEmitter, Resource, SeverityNumber,
};
pub use pprof as profile_format;
pub use profile_serializer::{
    deserialize_profile, encode_cpu_profile, serialize_profile, EncodeError,
};
pub use session::configuration::{Configuration, Env, InstrumentationSource, Options};
pub use session::snapshot::{
    SnapshotTracker, DEFAULT_PAUSE_GRACE, SNAPSHOT_VOLUME_BAGGAGE_KEY, SNAPSHOT_VOLUME_HIGHEST,
};
pub use session::Session;
pub use stack_collector::{StackFrame, StackSource, Stacktrace};
#[cfg(target_os = "linux")]
pub use stack_collector::signal_source::SignalStackSource;
pub use string_table::StringTable;
pub use thread_context::{ContextGuard, SpanContext, ThreadContextRegistry};
pub use timer_thread::IntervalTimer;
pub use util::current_thread_id;

/// Routes `log` output to stderr. Built only with the `debug` feature.
#[cfg(feature = "debug")]
pub fn init_debug_logging() {
    let _ = env_logger::builder().is_test(false).try_init();
}
