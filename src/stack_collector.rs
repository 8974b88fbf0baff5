#[cfg(target_os = "linux")]
pub mod signal_source;

use std::collections::HashSet;
use std::time::SystemTime;

/// One resolved frame of a captured call stack.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StackFrame {
    pub file_name: String,
    pub function_name: String,
    /// `None` (and 0) encode as the sentinel -1.
    pub line_number: Option<u32>,
}

impl StackFrame {
    pub fn new(file_name: &str, function_name: &str, line_number: Option<u32>) -> Self {
        StackFrame {
            file_name: file_name.to_owned(),
            function_name: function_name.to_owned(),
            line_number,
        }
    }
}

/// One thread's call stack at a single instant.
///
/// Frames are stored outermost first; the encoder reverses them so the wire
/// format lists locations innermost first.
#[derive(Clone, Debug, PartialEq)]
pub struct Stacktrace {
    pub thread_id: u64,
    pub frames: Vec<StackFrame>,
    pub timestamp: SystemTime,
}

/// Snapshots the call stacks of all live threads.
///
/// "Enumerate every thread's stack from the outside" has no portable
/// primitive, so the mechanism is a seam: the crate ships a signal-based
/// implementation for Linux ([`signal_source::SignalStackSource`]) and tests
/// inject synthetic sources. Implementations must never return a stacktrace
/// for an excluded thread id and must skip (not fail on) threads that exit
/// mid-collection.
pub trait StackSource: Send + Sync {
    fn collect(&self, excluded_thread_ids: &HashSet<u64>) -> Vec<Stacktrace>;
}
