//! Cross-process atomic wait/notify shims used by the shared primitives.
//!
//! Linux parks on shared (non-private) futexes: the kernel keys them by the
//! backing file page, so a wake issued through one mapping reaches waiters
//! parked through any other mapping of the same segment, in this process or
//! another. Other Unix targets fall back to short sleeping polls.

use std::sync::atomic::AtomicU32;
use std::time::Duration;

/// Result of attempting to wait on an atomic location.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitResult {
    /// The caller was woken (possibly spuriously); re-check the condition.
    Ok,
    /// The value no longer matched when the wait was attempted.
    NotEqual,
    /// The wait timed out before a notify was observed.
    TimedOut,
}

#[cfg(target_os = "linux")]
mod imp {
    use super::{AtomicU32, Duration, WaitResult};
    use std::io;

    #[inline]
    pub(crate) fn wait_u32(atomic: &AtomicU32, expected: u32, timeout: Option<Duration>) -> WaitResult {
        let ts = timeout.map(|d| libc::timespec {
            tv_sec: d.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
            tv_nsec: d.subsec_nanos() as libc::c_long,
        });
        let ts_ptr = ts
            .as_ref()
            .map_or(std::ptr::null(), |ts| ts as *const libc::timespec);
        // SAFETY: `atomic` points at a live, aligned u32; FUTEX_WAIT without the
        // private flag so waiters in other mappings share the same wait queue.
        let rc = unsafe {
            libc::syscall(
                libc::SYS_futex,
                atomic as *const AtomicU32,
                libc::FUTEX_WAIT,
                expected,
                ts_ptr,
            )
        };
        if rc == 0 {
            return WaitResult::Ok;
        }
        match io::Error::last_os_error().raw_os_error() {
            Some(libc::EAGAIN) => WaitResult::NotEqual,
            Some(libc::ETIMEDOUT) => WaitResult::TimedOut,
            _ => WaitResult::Ok,
        }
    }

    #[inline]
    pub(crate) fn wake(atomic: &AtomicU32, count: u32) -> u32 {
        let count = count.min(i32::MAX as u32) as libc::c_int;
        // SAFETY: same address/queue as `wait_u32`.
        let rc = unsafe {
            libc::syscall(
                libc::SYS_futex,
                atomic as *const AtomicU32,
                libc::FUTEX_WAKE,
                count,
            )
        };
        rc.max(0) as u32
    }
}

#[cfg(not(target_os = "linux"))]
mod imp {
    use super::{AtomicU32, Duration, WaitResult};
    use std::sync::atomic::Ordering;
    use std::time::Instant;

    const POLL_SLICE: Duration = Duration::from_millis(1);

    #[inline]
    pub(crate) fn wait_u32(atomic: &AtomicU32, expected: u32, timeout: Option<Duration>) -> WaitResult {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if atomic.load(Ordering::Acquire) != expected {
                return WaitResult::NotEqual;
            }
            let slice = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return WaitResult::TimedOut;
                    }
                    (deadline - now).min(POLL_SLICE)
                }
                None => POLL_SLICE,
            };
            std::thread::sleep(slice);
            if atomic.load(Ordering::Acquire) != expected {
                return WaitResult::Ok;
            }
        }
    }

    #[inline]
    pub(crate) fn wake(atomic: &AtomicU32, count: u32) -> u32 {
        let _ = (atomic, count);
        0
    }
}

/// Blocks until the atomic differs from `expected`, a wakeup occurs, or the
/// optional timeout expires.
#[inline]
pub fn wait_u32(atomic: &AtomicU32, expected: u32, timeout: Option<Duration>) -> WaitResult {
    imp::wait_u32(atomic, expected, timeout)
}

/// Wakes at most one waiter parked on `atomic`.
#[inline]
pub fn wake_one(atomic: &AtomicU32) -> u32 {
    imp::wake(atomic, 1)
}

/// Wakes all waiters parked on `atomic`.
#[inline]
pub fn wake_all(atomic: &AtomicU32) -> u32 {
    imp::wake(atomic, u32::MAX)
}
