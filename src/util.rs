use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Kernel thread id of the calling thread. Stable for the thread's lifetime;
/// the kernel may reuse it after the thread exits.
#[cfg(target_os = "linux")]
pub fn current_thread_id() -> u64 {
    unsafe { libc::syscall(libc::SYS_gettid) as u64 }
}

#[cfg(not(target_os = "linux"))]
pub fn current_thread_id() -> u64 {
    use std::sync::atomic::{AtomicU64, Ordering};

    static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);
    thread_local! {
        static THREAD_ID: u64 = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
    }
    THREAD_ID.with(|id| *id)
}

// Canonical hex forms for correlation labels: lowercase, no 0x prefix,
// zero-padded to 16 digits.
pub(crate) fn format_trace_id(trace_id: u128) -> String {
    format!("{trace_id:016x}")
}

pub(crate) fn format_span_id(span_id: u64) -> String {
    format!("{span_id:016x}")
}

// Lock helpers that survive poisoning. A panicking application thread must
// not take the profiler down with it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read_lock<T>(rwlock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    rwlock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write_lock<T>(rwlock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    rwlock.write().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_ids_are_stable_and_distinct() {
        let id = current_thread_id();
        assert_eq!(id, current_thread_id());

        let other = std::thread::spawn(current_thread_id).join().unwrap();
        assert_ne!(id, other);
    }

    #[test]
    fn hex_labels_are_zero_padded() {
        assert_eq!(format_trace_id(5), "0000000000000005");
        assert_eq!(format_span_id(9), "0000000000000009");
        assert_eq!(format_span_id(u64::MAX), "ffffffffffffffff");
    }

    #[test]
    fn large_trace_ids_keep_all_digits() {
        assert_eq!(
            format_trace_id(0x0102030405060708090a0b0c0d0e0f10),
            "102030405060708090a0b0c0d0e0f10"
        );
    }
}
