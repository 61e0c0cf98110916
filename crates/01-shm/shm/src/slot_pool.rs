//! Fixed-size slot table inside a shared segment.
//!
//! The table is a run of equally sized slots plus an index ring listing the
//! free ones. Each slot starts with a [`SlotHeader`] whose `state` word is a
//! futex the slot's users park on; the remaining bytes are payload. Calls use
//! it for reply slots: the caller acquires a slot, the callee fills it and
//! flips `state`, the caller reads the answer and releases the slot.
//!
//! Acquire and release must be serialised by the caller (one lock guards the
//! free ring); the per-slot protocol itself only needs the header atomics.

use crate::region::{SharedRegion, ShmLayout};
use crate::wait::{wait_u32, wake_all, WaitResult};
use crate::{ShmError, ShmResult};
use std::mem;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

/// Alignment enforced for every slot inside the table.
pub const SLOT_ALIGNMENT: usize = 64;

/// `state` value of a slot sitting in the free ring.
pub const SLOT_FREE: u32 = 0;

const FREE_RING_MAGIC: u64 = 0x5350_4F4F_4C46_5245; // "SPOOLFRE"

#[repr(C, align(8))]
struct IndexRingHeader {
    capacity: AtomicU32,
    head: AtomicU32,
    tail: AtomicU32,
    _pad: AtomicU32,
    magic: AtomicU64,
    _reserved: AtomicU64,
}

// SAFETY: repr(C), atomics only.
unsafe impl ShmLayout for IndexRingHeader {}

/// Header at the front of every slot. Field meaning beyond `state` and
/// `generation` belongs to the table's user.
#[repr(C, align(8))]
#[derive(Debug)]
pub struct SlotHeader {
    /// Futex word; [`SLOT_FREE`] while the slot is in the free ring.
    pub state: AtomicU32,
    /// Bumped on every acquire so stale users can detect reuse.
    pub generation: AtomicU32,
    pub owner: AtomicU32,
    pub peer: AtomicU32,
    pub value: AtomicU32,
    pub len: AtomicU32,
    pub code: AtomicU32,
    pub _pad: AtomicU32,
}

// SAFETY: repr(C), atomics only.
unsafe impl ShmLayout for SlotHeader {}

const SLOT_HEADER: usize = mem::size_of::<SlotHeader>();

impl SlotHeader {
    /// Parks while `state` equals `expected`.
    pub fn wait_state(&self, expected: u32, timeout: Option<Duration>) -> WaitResult {
        wait_u32(&self.state, expected, timeout)
    }

    /// Publishes a new `state` and wakes everyone parked on it.
    pub fn set_state(&self, state: u32) {
        self.state.store(state, Ordering::Release);
        wake_all(&self.state);
    }
}

/// Configuration describing the shape of a slot table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotPoolConfig {
    /// Number of slots managed by the table.
    pub slot_count: u32,
    /// Payload bytes per slot, excluding the header.
    pub payload_size: usize,
}

impl SlotPoolConfig {
    fn slot_size(&self) -> usize {
        (SLOT_HEADER + self.payload_size).next_multiple_of(SLOT_ALIGNMENT)
    }

    fn ring_size(&self) -> usize {
        (mem::size_of::<IndexRingHeader>() + mem::size_of::<u32>() * self.slot_count as usize)
            .next_multiple_of(SLOT_ALIGNMENT)
    }

    /// Bytes the table occupies in the segment.
    pub fn footprint(&self) -> usize {
        self.ring_size() + self.slot_size() * self.slot_count as usize
    }
}

/// View of a slot table inside a mapping.
#[derive(Clone, Copy)]
pub struct SlotPool<'a> {
    region: &'a SharedRegion,
    ring: &'a IndexRingHeader,
    base: usize,
    config: SlotPoolConfig,
}

impl<'a> SlotPool<'a> {
    /// Lays out an empty table at `base` with every slot free.
    pub fn format(region: &'a SharedRegion, base: usize, config: SlotPoolConfig) -> ShmResult<Self> {
        validate_config(&config)?;
        region.fill(base, config.footprint(), 0)?;
        let ring = region.at::<IndexRingHeader>(base)?;
        ring.capacity.store(config.slot_count, Ordering::Relaxed);
        let pool = Self {
            region,
            ring,
            base,
            config,
        };
        for idx in 0..config.slot_count {
            pool.entry(idx)?.store(idx, Ordering::Relaxed);
        }
        ring.tail.store(0, Ordering::Relaxed);
        ring.head.store(config.slot_count, Ordering::Relaxed);
        ring.magic.store(FREE_RING_MAGIC, Ordering::Release);
        Ok(pool)
    }

    /// Views a table previously written by [`SlotPool::format`].
    pub fn attach(region: &'a SharedRegion, base: usize, config: SlotPoolConfig) -> ShmResult<Self> {
        validate_config(&config)?;
        let ring = region.at::<IndexRingHeader>(base)?;
        if ring.magic.load(Ordering::Acquire) != FREE_RING_MAGIC
            || ring.capacity.load(Ordering::Relaxed) != config.slot_count
        {
            return Err(ShmError::Corrupt("slot table header mismatch"));
        }
        region.slice(base, config.footprint())?;
        Ok(Self {
            region,
            ring,
            base,
            config,
        })
    }

    /// Returns the number of slots managed by the table.
    pub fn slot_count(&self) -> u32 {
        self.config.slot_count
    }

    /// Payload bytes available per slot.
    pub fn payload_size(&self) -> usize {
        self.config.payload_size
    }

    fn entry(&self, position: u32) -> ShmResult<&'a AtomicU32> {
        let index = (position % self.config.slot_count) as usize;
        self.region
            .at(self.base + mem::size_of::<IndexRingHeader>() + index * mem::size_of::<u32>())
    }

    fn slot_offset(&self, idx: u32) -> ShmResult<usize> {
        if idx >= self.config.slot_count {
            return Err(ShmError::OutOfBounds {
                offset: idx as usize,
                len: 1,
                mapped: self.config.slot_count as usize,
            });
        }
        Ok(self.base + self.config.ring_size() + idx as usize * self.config.slot_size())
    }

    /// Number of slots currently in the free ring.
    pub fn free_count(&self) -> u32 {
        self.ring
            .head
            .load(Ordering::Acquire)
            .wrapping_sub(self.ring.tail.load(Ordering::Acquire))
    }

    /// Pops the next free slot, stamping `state` and bumping its generation.
    ///
    /// Returns `None` when all slots are checked out.
    pub fn try_acquire(&self, state: u32) -> ShmResult<Option<u32>> {
        debug_assert_ne!(state, SLOT_FREE);
        let head = self.ring.head.load(Ordering::Acquire);
        let tail = self.ring.tail.load(Ordering::Relaxed);
        if head == tail {
            return Ok(None);
        }
        let idx = self.entry(tail)?.load(Ordering::Relaxed);
        self.ring.tail.store(tail.wrapping_add(1), Ordering::Release);

        let header = self.header(idx)?;
        header.generation.fetch_add(1, Ordering::Relaxed);
        header.state.store(state, Ordering::Release);
        Ok(Some(idx))
    }

    /// Returns a slot to the free ring.
    pub fn release(&self, idx: u32) -> ShmResult<()> {
        let header = self.header(idx)?;
        if header.state.swap(SLOT_FREE, Ordering::AcqRel) == SLOT_FREE {
            debug_assert!(false, "slot {idx} released twice");
            return Err(ShmError::Corrupt("slot released twice"));
        }

        let head = self.ring.head.load(Ordering::Relaxed);
        let tail = self.ring.tail.load(Ordering::Acquire);
        if head.wrapping_sub(tail) >= self.config.slot_count {
            return Err(ShmError::Corrupt("free ring overflowed"));
        }
        self.entry(head)?.store(idx, Ordering::Relaxed);
        self.ring.head.store(head.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Header of slot `idx`.
    pub fn header(&self, idx: u32) -> ShmResult<&'a SlotHeader> {
        self.region.at(self.slot_offset(idx)?)
    }

    /// Copies `data` into the payload of slot `idx`.
    pub fn write_payload(&self, idx: u32, data: &[u8]) -> ShmResult<()> {
        if data.len() > self.config.payload_size {
            return Err(ShmError::OutOfBounds {
                offset: 0,
                len: data.len(),
                mapped: self.config.payload_size,
            });
        }
        self.region.write(self.slot_offset(idx)? + SLOT_HEADER, data)
    }

    /// Copies the first `buf.len()` payload bytes of slot `idx` out.
    pub fn read_payload(&self, idx: u32, buf: &mut [u8]) -> ShmResult<()> {
        if buf.len() > self.config.payload_size {
            return Err(ShmError::OutOfBounds {
                offset: 0,
                len: buf.len(),
                mapped: self.config.payload_size,
            });
        }
        self.region.read(self.slot_offset(idx)? + SLOT_HEADER, buf)
    }

    /// Indices of slots that are checked out, for recovery scans.
    pub fn busy_slots(&self) -> ShmResult<Vec<u32>> {
        let mut busy = Vec::new();
        for idx in 0..self.config.slot_count {
            if self.header(idx)?.state.load(Ordering::Acquire) != SLOT_FREE {
                busy.push(idx);
            }
        }
        Ok(busy)
    }
}

fn validate_config(config: &SlotPoolConfig) -> ShmResult<()> {
    if config.slot_count == 0 {
        return Err(ShmError::InvalidCapacity {
            requested: 0,
            minimum: 1,
        });
    }
    if config.payload_size == 0 {
        return Err(ShmError::InvalidCapacity {
            requested: 0,
            minimum: SLOT_ALIGNMENT,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SLOT_COUNT: u32 = 8;
    const PENDING: u32 = 1;
    const DONE: u32 = 2;

    fn config() -> SlotPoolConfig {
        SlotPoolConfig {
            slot_count: SLOT_COUNT,
            payload_size: 100,
        }
    }

    fn region() -> SharedRegion {
        SharedRegion::anonymous(256 + config().footprint()).expect("anon")
    }

    #[test]
    fn lifecycle_roundtrip() {
        let region = region();
        let pool = SlotPool::format(&region, 256, config()).expect("format");
        let mut acquired = Vec::new();
        for _ in 0..pool.slot_count() {
            acquired.push(
                pool.try_acquire(PENDING)
                    .expect("acquire")
                    .expect("expected free slot"),
            );
        }
        assert!(
            pool.try_acquire(PENDING).expect("acquire").is_none(),
            "table should be exhausted"
        );

        for &idx in &acquired {
            pool.release(idx).expect("release");
        }
        assert_eq!(pool.free_count(), SLOT_COUNT);

        let mut reacquired = Vec::new();
        while let Some(idx) = pool.try_acquire(PENDING).expect("acquire") {
            reacquired.push(idx);
        }
        let mut original = acquired.clone();
        original.sort_unstable();
        reacquired.sort_unstable();
        assert_eq!(original, reacquired);
    }

    #[test]
    fn slots_are_aligned_and_sized() {
        let region = region();
        let pool = SlotPool::format(&region, 256, config()).expect("format");
        for idx in 0..SLOT_COUNT {
            let offset = pool.slot_offset(idx).expect("offset");
            assert_eq!(offset % SLOT_ALIGNMENT, 0, "slot must honor alignment");
        }
        assert!(pool.write_payload(0, &[0u8; 101]).is_err());
        assert!(pool.header(SLOT_COUNT).is_err());
    }

    #[test]
    fn generation_advances_on_reuse() {
        let region = region();
        let pool = SlotPool::format(&region, 256, config()).expect("format");
        let idx = pool.try_acquire(PENDING).expect("acquire").expect("slot");
        let first = pool.header(idx).expect("header").generation.load(Ordering::Relaxed);
        pool.release(idx).expect("release");
        while let Some(next) = pool.try_acquire(PENDING).expect("acquire") {
            if next == idx {
                let second = pool.header(idx).expect("header").generation.load(Ordering::Relaxed);
                assert_eq!(second, first + 1);
                return;
            }
        }
        panic!("slot {idx} never came back");
    }

    #[test]
    fn double_release_is_rejected() {
        let region = region();
        let pool = SlotPool::format(&region, 256, config()).expect("format");
        let idx = pool.try_acquire(PENDING).expect("acquire").expect("slot");
        pool.release(idx).expect("release");
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| pool.release(idx)));
        match result {
            Ok(outcome) => assert!(outcome.is_err()),
            Err(_) => assert!(cfg!(debug_assertions), "only debug builds assert"),
        }
    }

    #[test]
    fn payload_and_state_cross_mappings() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("slots");
        let a = SharedRegion::create(&path, 4096).expect("create");
        let b = SharedRegion::open(&path).expect("open");
        let caller = SlotPool::format(&a, 0, config()).expect("format");
        let callee = SlotPool::attach(&b, 0, config()).expect("attach");

        let idx = caller.try_acquire(PENDING).expect("acquire").expect("slot");
        callee.write_payload(idx, b"reply").expect("write");
        callee.header(idx).expect("header").set_state(DONE);

        let header = caller.header(idx).expect("header");
        assert_eq!(header.wait_state(PENDING, None), WaitResult::NotEqual);
        let mut buf = [0u8; 5];
        caller.read_payload(idx, &mut buf).expect("read");
        assert_eq!(&buf, b"reply");
        caller.release(idx).expect("release");
        assert!(caller.busy_slots().expect("scan").is_empty());
    }
}
