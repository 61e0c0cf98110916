//! Lock-free reference counting on a shared `u32`.
//!
//! Counts only move through compare-and-swap: an increment never revives a
//! count that already reached zero, and exactly one decrement observes the
//! transition to zero. That caller owns destruction.

use std::sync::atomic::Ordering;

/// Atomic cell a reference count can live in.
pub trait RefCounter {
    fn load(&self, order: Ordering) -> u32;
    fn compare_exchange_weak(
        &self,
        current: u32,
        new: u32,
        success: Ordering,
        failure: Ordering,
    ) -> Result<u32, u32>;
}

impl RefCounter for std::sync::atomic::AtomicU32 {
    fn load(&self, order: Ordering) -> u32 {
        std::sync::atomic::AtomicU32::load(self, order)
    }

    fn compare_exchange_weak(
        &self,
        current: u32,
        new: u32,
        success: Ordering,
        failure: Ordering,
    ) -> Result<u32, u32> {
        std::sync::atomic::AtomicU32::compare_exchange_weak(self, current, new, success, failure)
    }
}

#[cfg(feature = "loom")]
impl RefCounter for loom::sync::atomic::AtomicU32 {
    fn load(&self, order: Ordering) -> u32 {
        loom::sync::atomic::AtomicU32::load(self, order)
    }

    fn compare_exchange_weak(
        &self,
        current: u32,
        new: u32,
        success: Ordering,
        failure: Ordering,
    ) -> Result<u32, u32> {
        loom::sync::atomic::AtomicU32::compare_exchange_weak(self, current, new, success, failure)
    }
}

/// Result of dropping one reference.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Release {
    /// Other references remain; carries the new count.
    Alive(u32),
    /// This call dropped the last reference.
    Last,
}

/// Adds a reference unless the count already reached zero.
/// Returns the new count, or `None` if the object is dead.
pub fn try_acquire(count: &impl RefCounter) -> Option<u32> {
    let mut current = count.load(Ordering::Acquire);
    loop {
        if current == 0 || current == u32::MAX {
            return None;
        }
        match count.compare_exchange_weak(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => return Some(current + 1),
            Err(actual) => current = actual,
        }
    }
}

/// Drops a reference. Returns `None` if the count was already zero.
pub fn release(count: &impl RefCounter) -> Option<Release> {
    let mut current = count.load(Ordering::Acquire);
    loop {
        if current == 0 {
            return None;
        }
        match count.compare_exchange_weak(current, current - 1, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) if current == 1 => return Some(Release::Last),
            Ok(_) => return Some(Release::Alive(current - 1)),
            Err(actual) => current = actual,
        }
    }
}

/// Drops `n` references at once, e.g. when reaping a dead holder.
pub fn release_many(count: &impl RefCounter, n: u32) -> Option<Release> {
    if n == 0 {
        return Some(Release::Alive(count.load(Ordering::Acquire)));
    }
    let mut current = count.load(Ordering::Acquire);
    loop {
        if current == 0 {
            return None;
        }
        let next = current.saturating_sub(n);
        match count.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) if next == 0 => return Some(Release::Last),
            Ok(_) => return Some(Release::Alive(next)),
            Err(actual) => current = actual,
        }
    }
}
