#![deny(unsafe_op_in_unsafe_fn)]

use std::collections::HashSet;
use std::ffi::c_int;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, Once};
use std::time::{Duration, Instant, SystemTime};

use crate::stack_collector::{StackFrame, StackSource, Stacktrace};
use crate::util::lock;

const SAMPLE_SIGNAL: c_int = libc::SIGPROF;
const MAX_STACK_DEPTH: usize = 128;

// How long to wait for a signalled thread to publish its stack before the
// thread is skipped for this tick.
const CAPTURE_DEADLINE: Duration = Duration::from_millis(20);

// One process-wide capture slot, serialized by COLLECT_LOCK. The handler
// publishes its own tid alongside the stack: a thread that missed its
// deadline on an earlier pass keeps its signal pending, and its late answer
// must not be taken for the thread currently being waited on.
struct CaptureSlot {
    thread_id: AtomicU64,
    depth: AtomicUsize,
    complete: AtomicBool,
    pcs: [AtomicUsize; MAX_STACK_DEPTH],
}

static CAPTURE: CaptureSlot = CaptureSlot {
    thread_id: AtomicU64::new(0),
    depth: AtomicUsize::new(0),
    complete: AtomicBool::new(false),
    pcs: [const { AtomicUsize::new(0) }; MAX_STACK_DEPTH],
};

static COLLECT_LOCK: Mutex<()> = Mutex::new(());
static HANDLER_INSTALL: Once = Once::new();

/// Stack source for Linux: delivers a profiling signal to every live thread
/// of the process in turn and walks the interrupted stack from the handler.
///
/// Threads are enumerated through `/proc/self/task`; a thread that exits
/// between enumeration and signalling (or does not answer within a short
/// deadline) is skipped for the tick. Program counters are resolved to
/// (file, function, line) on the collecting thread, never inside the handler.
#[derive(Debug, Default)]
pub struct SignalStackSource;

impl SignalStackSource {
    pub fn new() -> Self {
        install_handler();
        SignalStackSource
    }
}

impl StackSource for SignalStackSource {
    fn collect(&self, excluded_thread_ids: &HashSet<u64>) -> Vec<Stacktrace> {
        let _collecting = lock(&COLLECT_LOCK);
        install_handler();

        let thread_ids = match live_thread_ids() {
            Ok(thread_ids) => thread_ids,
            Err(err) => {
                log::warn!("failed to enumerate threads: {err}");
                return vec![];
            }
        };

        let timestamp = SystemTime::now();
        let pid = std::process::id() as libc::pid_t;
        let mut stacktraces = Vec::with_capacity(thread_ids.len());

        for thread_id in thread_ids {
            if excluded_thread_ids.contains(&thread_id) {
                continue;
            }

            CAPTURE.thread_id.store(0, Ordering::Relaxed);
            CAPTURE.depth.store(0, Ordering::Relaxed);
            CAPTURE.complete.store(false, Ordering::Release);

            let err = unsafe {
                libc::syscall(libc::SYS_tgkill, pid, thread_id as libc::pid_t, SAMPLE_SIGNAL)
            };
            if err != 0 {
                // The thread exited after enumeration.
                log::debug!("thread {thread_id} gone before sampling, skipping");
                continue;
            }

            let Some(pcs) = await_capture(thread_id) else {
                log::debug!("thread {thread_id} did not answer the sample signal, skipping");
                continue;
            };

            let mut frames: Vec<StackFrame> = pcs.into_iter().map(resolve_frame).collect();

            // The handler's own frames are always captured; strip them.
            frames.retain(|frame| !is_profiler_frame(frame));
            // Captured innermost first; stacktraces store outermost first.
            frames.reverse();

            stacktraces.push(Stacktrace {
                thread_id,
                frames,
                timestamp,
            });
        }

        stacktraces
    }
}

// Waits for `thread_id` to publish its stack, returning the raw program
// counters. A publish carrying any other tid is a late answer from a thread
// skipped on an earlier pass; it is discarded and the wait continues.
fn await_capture(thread_id: u64) -> Option<Vec<usize>> {
    let deadline = Instant::now() + CAPTURE_DEADLINE;
    while Instant::now() < deadline {
        if !CAPTURE.complete.load(Ordering::Acquire) {
            std::hint::spin_loop();
            continue;
        }
        if CAPTURE.thread_id.load(Ordering::Relaxed) != thread_id {
            CAPTURE.complete.store(false, Ordering::Release);
            continue;
        }

        let depth = CAPTURE.depth.load(Ordering::Relaxed);
        let pcs: Vec<usize> = CAPTURE.pcs[..depth]
            .iter()
            .map(|pc| pc.load(Ordering::Relaxed))
            .collect();
        // A late answer may have raced the copy; keep it only if the slot
        // still belongs to the signalled thread.
        if CAPTURE.thread_id.load(Ordering::Relaxed) == thread_id {
            return Some(pcs);
        }
    }
    None
}

fn install_handler() {
    HANDLER_INSTALL.call_once(|| {
        let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
        action.sa_sigaction = capture_handler as usize;
        action.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART;
        let err = unsafe { libc::sigaction(SAMPLE_SIGNAL, &action, std::ptr::null_mut()) };
        if err != 0 {
            log::warn!("sigaction failed: {}", std::io::Error::last_os_error());
        }
    });
}

// Runs on the signalled thread. The frame walk is not strictly
// async-signal-safe; this is the accepted trade-off of in-process sampling
// profilers that walk stacks from a handler.
extern "C" fn capture_handler(
    _signum: c_int,
    _info: *mut libc::siginfo_t,
    _ucontext: *mut libc::c_void,
) {
    let mut depth = 0;
    unsafe {
        backtrace::trace_unsynchronized(|frame| {
            if depth >= MAX_STACK_DEPTH {
                return false;
            }
            CAPTURE.pcs[depth].store(frame.ip() as usize, Ordering::Relaxed);
            depth += 1;
            true
        });
    }
    let own_tid = unsafe { libc::syscall(libc::SYS_gettid) } as u64;
    CAPTURE.depth.store(depth, Ordering::Relaxed);
    CAPTURE.thread_id.store(own_tid, Ordering::Relaxed);
    CAPTURE.complete.store(true, Ordering::Release);
}

fn live_thread_ids() -> std::io::Result<Vec<u64>> {
    let mut thread_ids = vec![];
    for entry in std::fs::read_dir("/proc/self/task")? {
        let entry = entry?;
        if let Ok(thread_id) = entry.file_name().to_string_lossy().parse::<u64>() {
            thread_ids.push(thread_id);
        }
    }
    Ok(thread_ids)
}

fn resolve_frame(pc: usize) -> StackFrame {
    let mut resolved: Option<StackFrame> = None;
    backtrace::resolve(pc as *mut libc::c_void, |symbol| {
        // Only the first resolution is kept: one Line per Location, inlined
        // call sites are not expanded.
        if resolved.is_some() {
            return;
        }
        let function_name = symbol
            .name()
            .map(|name| name.to_string())
            .unwrap_or_else(|| "(unknown)".to_owned());
        let file_name = symbol
            .filename()
            .map(|path| path.to_string_lossy().into_owned())
            .unwrap_or_else(|| "(unknown)".to_owned());
        resolved = Some(StackFrame {
            file_name,
            function_name,
            line_number: symbol.lineno(),
        });
    });
    resolved.unwrap_or_else(|| StackFrame::new("(unknown)", "(unknown)", None))
}

fn is_profiler_frame(frame: &StackFrame) -> bool {
    frame.function_name.contains("stack_collector::signal_source")
        || frame.function_name.starts_with("backtrace::")
        || frame.function_name.contains("__restore_rt")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::current_thread_id;
    use std::sync::atomic::AtomicBool;
    use std::sync::mpsc;
    use std::sync::Arc;

    #[test]
    fn excluded_threads_are_never_returned() {
        let source = SignalStackSource::new();
        let own_tid = current_thread_id();

        let excluded = HashSet::from([own_tid]);
        let stacktraces = source.collect(&excluded);
        assert!(stacktraces.iter().all(|st| st.thread_id != own_tid));
    }

    #[test]
    fn running_threads_are_captured() {
        let source = SignalStackSource::new();

        let stop = Arc::new(AtomicBool::new(false));
        let (tid_tx, tid_rx) = mpsc::channel();
        let worker = {
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || {
                tid_tx.send(current_thread_id()).unwrap();
                while !stop.load(Ordering::Relaxed) {
                    std::hint::spin_loop();
                }
            })
        };
        let worker_tid = tid_rx.recv().unwrap();

        let stacktraces = source.collect(&HashSet::new());
        stop.store(true, Ordering::Relaxed);
        worker.join().unwrap();

        let captured = stacktraces
            .iter()
            .find(|st| st.thread_id == worker_tid)
            .expect("busy thread should be captured");
        assert!(!captured.frames.is_empty());
    }

    fn set_sample_signal_blocked(blocked: bool) {
        unsafe {
            let mut set: libc::sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut set);
            libc::sigaddset(&mut set, SAMPLE_SIGNAL);
            let how = if blocked { libc::SIG_BLOCK } else { libc::SIG_UNBLOCK };
            libc::pthread_sigmask(how, &set, std::ptr::null_mut());
        }
    }

    // A thread that misses its capture deadline keeps the signal pending.
    // When it is finally delivered, mid-collection of some other thread, the
    // late answer must be discarded rather than attributed to that thread.
    #[test]
    fn late_answers_from_skipped_threads_are_not_misattributed() {
        let source = SignalStackSource::new();
        let stop = Arc::new(AtomicBool::new(false));
        let unblock = Arc::new(AtomicBool::new(false));

        let (late_tx, late_rx) = mpsc::channel();
        let late = {
            let stop = Arc::clone(&stop);
            let unblock = Arc::clone(&unblock);
            std::thread::spawn(move || {
                set_sample_signal_blocked(true);
                late_tx.send(current_thread_id()).unwrap();
                while !unblock.load(Ordering::Relaxed) {
                    std::hint::spin_loop();
                }
                // The pending signal is delivered here.
                set_sample_signal_blocked(false);
                while !stop.load(Ordering::Relaxed) {
                    std::hint::spin_loop();
                }
            })
        };
        let (deaf_tx, deaf_rx) = mpsc::channel();
        let deaf = {
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || {
                set_sample_signal_blocked(true);
                deaf_tx.send(current_thread_id()).unwrap();
                while !stop.load(Ordering::Relaxed) {
                    std::hint::spin_loop();
                }
            })
        };
        let late_tid = late_rx.recv().unwrap();
        let deaf_tid = deaf_rx.recv().unwrap();

        // Both threads miss the deadline; their signals stay pending.
        let first = source.collect(&HashSet::new());
        assert!(first
            .iter()
            .all(|st| st.thread_id != late_tid && st.thread_id != deaf_tid));

        // Second pass leaves the late thread out; its pending signal fires
        // while the collector is waiting on other threads.
        let releaser = {
            let unblock = Arc::clone(&unblock);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(5));
                unblock.store(true, Ordering::Relaxed);
            })
        };
        let second = source.collect(&HashSet::from([late_tid]));
        releaser.join().unwrap();

        assert!(
            second.iter().all(|st| st.thread_id != late_tid),
            "excluded thread must never be returned"
        );
        assert!(
            second.iter().all(|st| st.thread_id != deaf_tid),
            "a thread that never ran the handler was attributed a stack"
        );

        stop.store(true, Ordering::Relaxed);
        late.join().unwrap();
        deaf.join().unwrap();
    }

    #[test]
    fn dead_threads_are_skipped_without_error() {
        let source = SignalStackSource::new();
        // A collection pass right after threads have exited must not fail.
        for _ in 0..3 {
            std::thread::spawn(|| {}).join().unwrap();
        }
        source.collect(&HashSet::new());
    }
}
