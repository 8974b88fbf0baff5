use std::collections::HashMap;
use std::time::Duration;

pub const DEFAULT_CALL_STACK_INTERVAL: Duration = Duration::from_millis(1000);
pub const DEFAULT_SERVICE_NAME: &str = "unknown_service";

pub const CALL_STACK_INTERVAL_VAR: &str = "SPANPROF_CALL_STACK_INTERVAL";
pub const INCLUDE_INTERNAL_STACKS_VAR: &str = "SPANPROF_INCLUDE_INTERNAL_STACKS";
pub const SERVICE_NAME_VAR: &str = "OTEL_SERVICE_NAME";

/// Which activation policy a session runs under.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstrumentationSource {
    /// Sample unconditionally at a fixed cadence for the process lifetime.
    Continuous,
    /// Sample only while a selected distributed trace is active locally.
    Snapshot,
}

impl InstrumentationSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstrumentationSource::Continuous => "continuous",
            InstrumentationSource::Snapshot => "snapshot",
        }
    }
}

/// Environment variables behind an injectable store, so configuration
/// resolution is testable without touching process state.
#[derive(Clone, Debug)]
pub struct Env {
    store: HashMap<String, String>,
}

impl Env {
    pub fn from_os() -> Self {
        Env {
            store: std::env::vars().collect(),
        }
    }

    pub fn from_map(store: HashMap<String, String>) -> Self {
        Env { store }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.store.get(key).map(String::as_str)
    }

    pub fn is_true(&self, key: &str) -> bool {
        self.get(key)
            .is_some_and(|value| value.trim().eq_ignore_ascii_case("true"))
    }
}

impl Default for Env {
    fn default() -> Self {
        Self::from_os()
    }
}

/// Explicit caller overrides; anything left `None` falls back to the
/// environment, then to the built-in default.
#[derive(Clone, Debug, Default)]
pub struct Options {
    pub call_stack_interval: Option<Duration>,
    pub include_internal_stacks: Option<bool>,
    pub service_name: Option<String>,
    pub instrumentation_source: Option<InstrumentationSource>,
}

/// Resolved profiler configuration.
///
/// Resolved exactly once at construction with precedence
/// explicit argument > environment variable > default, and never re-read.
#[derive(Clone, Debug, PartialEq)]
pub struct Configuration {
    pub call_stack_interval: Duration,
    pub include_internal_stacks: bool,
    pub service_name: String,
    pub instrumentation_source: InstrumentationSource,
}

impl Configuration {
    pub fn resolve(options: Options, env: &Env) -> Configuration {
        Configuration {
            call_stack_interval: resolve_interval(options.call_stack_interval, env),
            include_internal_stacks: options
                .include_internal_stacks
                .unwrap_or_else(|| env.is_true(INCLUDE_INTERNAL_STACKS_VAR)),
            service_name: options
                .service_name
                .or_else(|| env.get(SERVICE_NAME_VAR).map(str::to_owned))
                .unwrap_or_else(|| DEFAULT_SERVICE_NAME.to_owned()),
            instrumentation_source: options
                .instrumentation_source
                .unwrap_or(InstrumentationSource::Continuous),
        }
    }

    pub fn interval_millis(&self) -> i64 {
        self.call_stack_interval.as_millis() as i64
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Configuration::resolve(Options::default(), &Env::from_os())
    }
}

fn resolve_interval(explicit: Option<Duration>, env: &Env) -> Duration {
    let interval = match explicit {
        Some(interval) => Some(interval),
        None => match env.get(CALL_STACK_INTERVAL_VAR) {
            Some(raw) => match raw.trim().parse::<u64>() {
                Ok(millis) => Some(Duration::from_millis(millis)),
                Err(_) => {
                    log::warn!(
                        "invalid {CALL_STACK_INTERVAL_VAR}={raw:?}, using default interval"
                    );
                    None
                }
            },
            None => None,
        },
    };

    match interval {
        Some(interval) if !interval.is_zero() => interval,
        Some(_) => {
            log::warn!("call stack interval must be positive, using default interval");
            DEFAULT_CALL_STACK_INTERVAL
        }
        None => DEFAULT_CALL_STACK_INTERVAL,
    }
}
