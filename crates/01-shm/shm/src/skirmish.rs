//! Process-shared recursive lock with an attached wait queue.
//!
//! A [`SkirmishRaw`] lives inside a shared segment. Every participant views it
//! through a [`Skirmish`] handle bound to its [`LockOwner`], which supplies the
//! owner identity (fusion id + thread token) and a liveness probe. The lock
//! word follows the classic three-state futex mutex (free / locked /
//! contended); a separate sequence word implements condition-style waits.
//!
//! Owners are robust: a waiter that keeps timing out checks whether the holder
//! is still a live member and takes the lock over if it is not.

use crate::region::ShmLayout;
use crate::wait::{wait_u32, wake_all, wake_one, WaitResult};
use crate::{ShmError, ShmResult};
use std::cell::Cell;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const FREE: u32 = 0;
const LOCKED: u32 = 1;
const CONTENDED: u32 = 2;
const DESTROYED: u32 = u32::MAX;

/// Shared representation of a skirmish. Zeroed memory is a valid, unlocked,
/// non-recursive skirmish.
#[repr(C, align(8))]
pub struct SkirmishRaw {
    state: AtomicU32,
    seq: AtomicU32,
    owner: AtomicU64,
    depth: AtomicU32,
    recursive: AtomicU32,
}

// SAFETY: repr(C), atomics only, all-zero is the unlocked state.
unsafe impl ShmLayout for SkirmishRaw {}

impl SkirmishRaw {
    /// Resets the skirmish to the unlocked state.
    pub fn init(&self, recursive: bool) {
        self.owner.store(0, Ordering::Relaxed);
        self.depth.store(0, Ordering::Relaxed);
        self.seq.store(0, Ordering::Relaxed);
        self.recursive
            .store(u32::from(recursive), Ordering::Relaxed);
        self.state.store(FREE, Ordering::Release);
    }

    /// Fusion id of the current holder, if any.
    pub fn holder(&self) -> Option<u32> {
        match self.owner.load(Ordering::Acquire) {
            0 => None,
            token => Some((token >> 32) as u32),
        }
    }

    /// Returns true once [`Skirmish::destroy`] ran.
    pub fn is_destroyed(&self) -> bool {
        self.state.load(Ordering::Acquire) == DESTROYED
    }

    /// Releases the lock if `fusion_id` holds it. Used when reaping a dead
    /// member whose locks are known up front.
    pub fn release_if_held_by(&self, fusion_id: u32) -> bool {
        let token = self.owner.load(Ordering::Acquire);
        if token == 0 || (token >> 32) as u32 != fusion_id {
            return false;
        }
        if self
            .owner
            .compare_exchange(token, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.depth.store(0, Ordering::Relaxed);
        if self
            .state
            .fetch_update(Ordering::Release, Ordering::Relaxed, |s| {
                (s != DESTROYED).then_some(FREE)
            })
            .is_ok()
        {
            wake_all(&self.state);
        }
        true
    }
}

impl fmt::Debug for SkirmishRaw {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SkirmishRaw")
            .field("state", &self.state.load(Ordering::Relaxed))
            .field("holder", &self.holder())
            .field("depth", &self.depth.load(Ordering::Relaxed))
            .finish()
    }
}

/// Answers whether a fusion id still belongs to a live member.
pub trait OwnerProbe: Send + Sync {
    fn is_alive(&self, fusion_id: u32) -> bool;
}

/// Probe for single-process use: every owner is considered alive.
#[derive(Clone, Copy, Debug, Default)]
pub struct AlwaysAlive;

impl OwnerProbe for AlwaysAlive {
    fn is_alive(&self, _fusion_id: u32) -> bool {
        true
    }
}

thread_local! {
    static THREAD_TOKEN: Cell<u32> = const { Cell::new(0) };
}

static NEXT_THREAD_TOKEN: AtomicU32 = AtomicU32::new(1);

fn thread_token() -> u32 {
    THREAD_TOKEN.with(|cell| {
        let token = cell.get();
        if token != 0 {
            return token;
        }
        let token = NEXT_THREAD_TOKEN.fetch_add(1, Ordering::Relaxed).max(1);
        cell.set(token);
        token
    })
}

/// Identity used when acquiring skirmishes: one per attached member.
#[derive(Clone)]
pub struct LockOwner {
    fusion_id: u32,
    probe: Arc<dyn OwnerProbe>,
    poll: Duration,
}

impl LockOwner {
    /// `poll` bounds how long a contended waiter sleeps before re-checking
    /// the holder's liveness.
    pub fn new(fusion_id: u32, probe: Arc<dyn OwnerProbe>, poll: Duration) -> Self {
        Self {
            fusion_id,
            probe,
            poll: poll.max(Duration::from_millis(1)),
        }
    }

    /// Owner for single-process use without liveness checks.
    pub fn local(fusion_id: u32) -> Self {
        Self::new(fusion_id, Arc::new(AlwaysAlive), Duration::from_millis(100))
    }

    pub fn fusion_id(&self) -> u32 {
        self.fusion_id
    }

    fn token(&self) -> u64 {
        (u64::from(self.fusion_id) << 32) | u64::from(thread_token())
    }
}

impl fmt::Debug for LockOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockOwner")
            .field("fusion_id", &self.fusion_id)
            .field("poll", &self.poll)
            .finish()
    }
}

/// A skirmish viewed by one owner.
#[derive(Clone, Copy)]
pub struct Skirmish<'a> {
    raw: &'a SkirmishRaw,
    owner: &'a LockOwner,
}

impl<'a> Skirmish<'a> {
    pub fn new(raw: &'a SkirmishRaw, owner: &'a LockOwner) -> Self {
        Self { raw, owner }
    }

    /// Returns true if the calling thread of this owner holds the lock.
    pub fn is_held(&self) -> bool {
        self.raw.owner.load(Ordering::Acquire) == self.owner.token()
    }

    /// Blocks until the lock is acquired. Re-entrant for recursive skirmishes.
    pub fn lock(&self) -> ShmResult<()> {
        let me = self.owner.token();
        if self.raw.owner.load(Ordering::Acquire) == me {
            if self.raw.recursive.load(Ordering::Relaxed) == 0 {
                debug_assert!(false, "non-recursive skirmish relocked by its owner");
                return Err(ShmError::Corrupt("non-recursive skirmish relocked by its owner"));
            }
            self.raw.depth.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        match self
            .raw
            .state
            .compare_exchange(FREE, LOCKED, Ordering::Acquire, Ordering::Relaxed)
        {
            Ok(_) => {
                self.acquired(me);
                Ok(())
            }
            Err(DESTROYED) => Err(ShmError::Destroyed),
            Err(_) => self.lock_contended(me),
        }
    }

    /// Acquires the lock only if it is free (or already held by this owner).
    pub fn try_lock(&self) -> ShmResult<bool> {
        let me = self.owner.token();
        if self.raw.owner.load(Ordering::Acquire) == me {
            if self.raw.recursive.load(Ordering::Relaxed) == 0 {
                return Ok(false);
            }
            self.raw.depth.fetch_add(1, Ordering::Relaxed);
            return Ok(true);
        }
        match self
            .raw
            .state
            .compare_exchange(FREE, LOCKED, Ordering::Acquire, Ordering::Relaxed)
        {
            Ok(_) => {
                self.acquired(me);
                Ok(true)
            }
            Err(DESTROYED) => Err(ShmError::Destroyed),
            Err(_) => Ok(false),
        }
    }

    fn acquired(&self, me: u64) {
        self.raw.owner.store(me, Ordering::Release);
        self.raw.depth.store(1, Ordering::Relaxed);
    }

    fn lock_contended(&self, me: u64) -> ShmResult<()> {
        loop {
            match self.raw.state.load(Ordering::Relaxed) {
                DESTROYED => return Err(ShmError::Destroyed),
                FREE => {
                    if self
                        .raw
                        .state
                        .compare_exchange(FREE, CONTENDED, Ordering::Acquire, Ordering::Relaxed)
                        .is_ok()
                    {
                        self.acquired(me);
                        return Ok(());
                    }
                    continue;
                }
                LOCKED => {
                    let _ = self.raw.state.compare_exchange(
                        LOCKED,
                        CONTENDED,
                        Ordering::Relaxed,
                        Ordering::Relaxed,
                    );
                    continue;
                }
                _ => {}
            }

            if wait_u32(&self.raw.state, CONTENDED, Some(self.owner.poll)) == WaitResult::TimedOut
                && self.take_over_dead_holder(me)
            {
                return Ok(());
            }
        }
    }

    fn take_over_dead_holder(&self, me: u64) -> bool {
        let holder = self.raw.owner.load(Ordering::Acquire);
        if holder == 0 {
            return false;
        }
        let fusion_id = (holder >> 32) as u32;
        if self.owner.probe.is_alive(fusion_id) {
            return false;
        }
        if self
            .raw
            .owner
            .compare_exchange(holder, me, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.raw.depth.store(1, Ordering::Relaxed);
        tracing::warn!(dead = fusion_id, "took over skirmish held by a dead member");
        true
    }

    /// Releases one level of the lock.
    pub fn unlock(&self) -> ShmResult<()> {
        let me = self.owner.token();
        if self.raw.owner.load(Ordering::Acquire) != me {
            debug_assert!(false, "skirmish unlocked by a non-owner");
            return Err(ShmError::Corrupt("skirmish unlocked by a non-owner"));
        }
        let depth = self.raw.depth.load(Ordering::Relaxed);
        if depth > 1 {
            self.raw.depth.store(depth - 1, Ordering::Relaxed);
            return Ok(());
        }

        self.raw.depth.store(0, Ordering::Relaxed);
        self.raw.owner.store(0, Ordering::Release);
        let previous = self
            .raw
            .state
            .fetch_update(Ordering::Release, Ordering::Relaxed, |s| {
                (s != DESTROYED).then_some(FREE)
            });
        if previous == Ok(CONTENDED) {
            wake_one(&self.raw.state);
        }
        Ok(())
    }

    /// Atomically releases the lock (all recursion levels), sleeps until
    /// notified, then re-acquires it with the previous depth.
    ///
    /// Returns [`ShmError::TimedOut`] when `timeout` expired; the lock is held
    /// again in that case too. Wakeups may be spurious: re-check the guarded
    /// condition.
    pub fn wait(&self, timeout: Option<Duration>) -> ShmResult<()> {
        if !self.is_held() {
            return Err(ShmError::Corrupt("skirmish wait without holding the lock"));
        }
        let seq = self.raw.seq.load(Ordering::Acquire);
        let depth = self.raw.depth.load(Ordering::Relaxed);
        self.raw.depth.store(1, Ordering::Relaxed);
        self.unlock()?;

        let deadline = timeout.map(|t| Instant::now() + t);
        let mut result = wait_u32(&self.raw.seq, seq, timeout);
        if result == WaitResult::Ok && deadline.is_some_and(|d| Instant::now() >= d) {
            result = WaitResult::TimedOut;
        }

        self.lock()?;
        self.raw.depth.store(depth, Ordering::Relaxed);
        match result {
            WaitResult::TimedOut => Err(ShmError::TimedOut),
            WaitResult::Ok | WaitResult::NotEqual => Ok(()),
        }
    }

    /// Wakes one waiter blocked in [`Skirmish::wait`].
    pub fn notify(&self) {
        self.raw.seq.fetch_add(1, Ordering::Release);
        wake_one(&self.raw.seq);
    }

    /// Wakes every waiter blocked in [`Skirmish::wait`].
    pub fn notify_all(&self) {
        self.raw.seq.fetch_add(1, Ordering::Release);
        wake_all(&self.raw.seq);
    }

    /// Marks the skirmish destroyed; current and future lockers get
    /// [`ShmError::Destroyed`].
    pub fn destroy(&self) {
        self.raw.owner.store(0, Ordering::Release);
        self.raw.depth.store(0, Ordering::Relaxed);
        self.raw.state.store(DESTROYED, Ordering::Release);
        wake_all(&self.raw.state);
        self.notify_all();
    }

    /// Locks and returns a guard that unlocks on drop.
    pub fn guard(self) -> ShmResult<SkirmishGuard<'a>> {
        self.lock()?;
        Ok(SkirmishGuard { lock: self })
    }
}

/// RAII guard returned by [`Skirmish::guard`].
pub struct SkirmishGuard<'a> {
    lock: Skirmish<'a>,
}

impl SkirmishGuard<'_> {
    /// See [`Skirmish::wait`].
    pub fn wait(&self, timeout: Option<Duration>) -> ShmResult<()> {
        self.lock.wait(timeout)
    }

    pub fn notify(&self) {
        self.lock.notify();
    }

    pub fn notify_all(&self) {
        self.lock.notify_all();
    }
}

impl Drop for SkirmishGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.lock.unlock() {
            tracing::error!("failed to release skirmish: {err}");
        }
    }
}
