use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::util::{current_thread_id, read_lock, write_lock};

/// Trace/span identifiers of the span currently active on a thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SpanContext {
    pub trace_id: u128,
    pub span_id: u64,
}

impl SpanContext {
    pub fn new(trace_id: u128, span_id: u64) -> Self {
        SpanContext { trace_id, span_id }
    }
}

/// Shared mapping from thread id to the span context active on that thread.
///
/// Kept current by observing context attach/detach through [`attach`]
/// (or the raw `on_attach`/`on_detach` hooks for integrations that register
/// callbacks with their tracing layer directly). Each thread only ever writes
/// its own key; the sampler thread reads all keys during a tick. Entries are
/// never evicted and may go stale after a thread exits, so readers must
/// tolerate reused thread ids.
///
/// This is an injectable component, not a process global: tests and embedders
/// construct isolated instances and pass them into the session explicitly.
///
/// [`attach`]: ThreadContextRegistry::attach
#[derive(Clone, Debug, Default)]
pub struct ThreadContextRegistry {
    states: Arc<RwLock<HashMap<u64, SpanContext>>>,
}

impl ThreadContextRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, thread_id: u64) -> Option<SpanContext> {
        read_lock(&self.states).get(&thread_id).copied()
    }

    /// A new context was attached on `thread_id`. Contexts without an active
    /// span leave the previous mapping in place, mirroring how a tracing
    /// layer's attach of a span-less context does not end the current span.
    pub fn on_attach(&self, thread_id: u64, context: Option<SpanContext>) {
        if let Some(context) = context {
            write_lock(&self.states).insert(thread_id, context);
        }
    }

    /// A context was detached on `thread_id`; `previous` is the context that
    /// becomes active again. A span-less previous context clears the entry.
    pub fn on_detach(&self, thread_id: u64, previous: Option<SpanContext>) {
        match previous {
            Some(context) => {
                write_lock(&self.states).insert(thread_id, context);
            }
            None => {
                write_lock(&self.states).remove(&thread_id);
            }
        }
    }

    /// Marks `context` active on the calling thread until the returned guard
    /// is dropped. This is the explicit wrapper applications call through in
    /// place of their tracing library's raw attach/detach pair.
    pub fn attach(&self, context: Option<SpanContext>) -> ContextGuard {
        let thread_id = current_thread_id();
        let previous = self.get(thread_id);
        self.on_attach(thread_id, context);
        ContextGuard {
            registry: self.clone(),
            thread_id,
            previous,
        }
    }

    /// Point-in-time copy of all thread states, taken once per encode pass.
    pub fn snapshot(&self) -> HashMap<u64, SpanContext> {
        read_lock(&self.states).clone()
    }
}

/// Restores the previously active span context when dropped.
#[must_use = "the span context is detached when the guard is dropped"]
pub struct ContextGuard {
    registry: ThreadContextRegistry,
    thread_id: u64,
    previous: Option<SpanContext>,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        self.registry.on_detach(self.thread_id, self.previous);
    }
}
