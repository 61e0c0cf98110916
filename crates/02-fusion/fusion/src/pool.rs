//! Named, growable SHM pools.
//!
//! A pool is an entry in the world's pool table plus a backing file
//! `fusion.<world>.pool<index>.<generation>`. The entry holds the allocator
//! state and the pool's skirmish; the file holds the heap itself. Every
//! process maps the file at its own address and only exchanges [`ShmPtr`]
//! offsets. Growth extends the file; other processes remap lazily when they
//! meet an offset past the end of their mapping.

use crate::world::layout::{PoolEntry, ENTRY_ACTIVE, ENTRY_EMPTY, MAX_POOLS};
use crate::world::{World, WorldInner};
use crate::{FusionError, FusionId, FusionResult, ShmPtr};
use arc_swap::ArcSwap;
use fusion_shm::heap::{align_up, ALIGN, MIN_BLOCK};
use fusion_shm::{Heap, ShmError, ShmName, SharedRegion, SkirmishGuard};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, warn};

const PAGE: u64 = 4096;
const INITIAL_POOL_SIZE: u64 = 16 * 1024;
const MIN_POOL_SIZE: u64 = PAGE;
const POISON: u8 = 0xdb;

pub(crate) fn pool_path(dir: &Path, world: &str, index: usize, generation: u32) -> PathBuf {
    dir.join(format!("fusion.{world}.pool{index}.{generation}"))
}

pub(crate) fn check_name(name: &str) -> FusionResult<()> {
    ShmName::validate(name).map_err(|_| FusionError::InvalidArgument("names must be 1 to 31 bytes"))
}

/// This process' mapping of one pool file.
pub(crate) struct PoolMapping {
    pub generation: u32,
    path: PathBuf,
    region: ArcSwap<SharedRegion>,
    remap: Mutex<()>,
}

impl PoolMapping {
    fn create(path: PathBuf, generation: u32, size: u64) -> FusionResult<Self> {
        let region = match SharedRegion::create(&path, size as usize) {
            Err(ShmError::Exists(_)) => {
                warn!(path = %path.display(), "replacing leftover pool file");
                SharedRegion::unlink(&path)?;
                SharedRegion::create(&path, size as usize)?
            }
            other => other?,
        };
        Ok(Self {
            generation,
            path,
            region: ArcSwap::from_pointee(region),
            remap: Mutex::new(()),
        })
    }

    pub(crate) fn open(path: PathBuf, generation: u32) -> FusionResult<Self> {
        let region = SharedRegion::open(&path).map_err(|_| FusionError::Dead)?;
        Ok(Self {
            generation,
            path,
            region: ArcSwap::from_pointee(region),
            remap: Mutex::new(()),
        })
    }

    /// A mapping covering at least `[0, end)`, remapping if the file grew.
    pub fn region(&self, end: u64) -> FusionResult<Arc<SharedRegion>> {
        let current = self.region.load_full();
        if current.len() as u64 >= end {
            return Ok(current);
        }
        let _remap = self.remap.lock();
        let current = self.region.load_full();
        if current.len() as u64 >= end {
            return Ok(current);
        }
        let fresh = Arc::new(SharedRegion::open(&self.path).map_err(|_| FusionError::Dead)?);
        if (fresh.len() as u64) < end {
            return Err(FusionError::Shm(ShmError::OutOfBounds {
                offset: 0,
                len: end as usize,
                mapped: fresh.len(),
            }));
        }
        debug!(path = %self.path.display(), len = fresh.len(), "remapped pool");
        self.region.store(Arc::clone(&fresh));
        Ok(fresh)
    }

    pub fn unlink(&self) -> FusionResult<()> {
        Ok(SharedRegion::unlink(&self.path)?)
    }
}

/// One pool as seen from one member. Methods whose name ends in `_locked`
/// expect the pool skirmish to be held.
pub(crate) struct PoolView<'w> {
    world: &'w WorldInner,
    pub index: usize,
    pub entry: &'w PoolEntry,
    pub mapping: Arc<PoolMapping>,
}

impl<'w> PoolView<'w> {
    pub fn new(world: &'w WorldInner, index: usize, generation: u32) -> FusionResult<Self> {
        if index >= MAX_POOLS {
            return Err(FusionError::InvalidArgument("pool index out of range"));
        }
        let entry: &PoolEntry = world.segment.at(world.layout.pool(index))?;
        Self::check(entry, generation)?;
        let mapping = world.pool_mapping(index, generation)?;
        Ok(Self {
            world,
            index,
            entry,
            mapping,
        })
    }

    fn check(entry: &PoolEntry, generation: u32) -> FusionResult<()> {
        if entry.state.load(Ordering::Acquire) != ENTRY_ACTIVE
            || entry.generation.load(Ordering::Acquire) != generation
        {
            return Err(FusionError::Dead);
        }
        Ok(())
    }

    /// Takes the pool skirmish, then confirms the pool was not destroyed
    /// while waiting for it.
    pub fn lock(&self) -> FusionResult<SkirmishGuard<'w>> {
        let guard = self.world.lock(&self.entry.lock)?;
        Self::check(self.entry, self.mapping.generation)?;
        Ok(guard)
    }

    pub fn is_locked(&self) -> bool {
        self.world.skirmish(&self.entry.lock).is_held()
    }

    fn heap_region(&self) -> FusionResult<Arc<SharedRegion>> {
        self.mapping.region(self.entry.heap.size())
    }

    /// Mapping covering `[offset, offset + len)`.
    pub fn region_for(&self, offset: u64, len: u64) -> FusionResult<Arc<SharedRegion>> {
        let end = offset
            .checked_add(len)
            .ok_or(FusionError::InvalidArgument("range overflows"))?;
        if end > self.entry.heap.size() {
            return Err(FusionError::InvalidArgument("range lies outside the pool"));
        }
        self.mapping.region(end)
    }

    fn ptr(&self, offset: u64) -> ShmPtr {
        ShmPtr::new(self.index as u16, offset)
    }

    fn is_debug(&self) -> bool {
        self.entry.debug.load(Ordering::Relaxed) != 0
    }

    pub fn allocate_locked(&self, size: u64, clear: bool) -> FusionResult<ShmPtr> {
        if size == 0 {
            return Err(FusionError::InvalidArgument("allocation size must be non-zero"));
        }
        if Heap::block_size(size) > self.capacity() {
            return Err(FusionError::OutOfMemory);
        }
        loop {
            let region = self.heap_region()?;
            let heap = Heap::new(&region, &self.entry.heap);
            match heap.allocate(size, self.world.fusion_id.get()) {
                Ok(offset) => {
                    if clear {
                        region.fill(offset as usize, size as usize, 0)?;
                    }
                    return Ok(self.ptr(offset));
                }
                Err(ShmError::OutOfSpace { .. }) => self.grow(size)?,
                Err(err) => return Err(err.into()),
            }
        }
    }

    pub fn reallocate_locked(&self, ptr: ShmPtr, size: u64) -> FusionResult<ShmPtr> {
        self.owns(ptr)?;
        if size == 0 {
            return Err(FusionError::InvalidArgument("allocation size must be non-zero"));
        }
        if Heap::block_size(size) > self.capacity() {
            return Err(FusionError::OutOfMemory);
        }
        loop {
            let region = self.heap_region()?;
            let heap = Heap::new(&region, &self.entry.heap);
            match heap.reallocate(ptr.offset, size, self.world.fusion_id.get()) {
                Ok(offset) => return Ok(self.ptr(offset)),
                Err(ShmError::OutOfSpace { .. }) => self.grow(size)?,
                Err(ShmError::Corrupt(_)) => {
                    return Err(FusionError::InvalidArgument("not a live allocation"))
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    pub fn deallocate_locked(&self, ptr: ShmPtr) -> FusionResult<()> {
        self.owns(ptr)?;
        let region = self.heap_region()?;
        let heap = Heap::new(&region, &self.entry.heap);
        let live = |err: ShmError| match err {
            ShmError::Corrupt(_) => FusionError::InvalidArgument("not a live allocation"),
            other => other.into(),
        };
        if self.is_debug() {
            let requested = heap.requested_size(ptr.offset).map_err(live)?;
            region.fill(ptr.offset as usize, requested as usize, POISON)?;
        }
        heap.deallocate(ptr.offset).map_err(live)?;
        Ok(())
    }

    fn owns(&self, ptr: ShmPtr) -> FusionResult<()> {
        if ptr.pool as usize != self.index {
            return Err(FusionError::InvalidArgument("pointer belongs to another pool"));
        }
        Ok(())
    }

    fn capacity(&self) -> u64 {
        self.entry.max_size.load(Ordering::Relaxed) & !(ALIGN - 1)
    }

    fn grow(&self, size: u64) -> FusionResult<()> {
        let current = self.entry.heap.size();
        let wanted = (current * 2).max(current + Heap::block_size(size));
        let target = align_up(wanted, PAGE).min(self.capacity());
        if target < current + MIN_BLOCK {
            return Err(FusionError::OutOfMemory);
        }
        SharedRegion::grow_file(&self.mapping.path, target as usize)?;
        let region = self.mapping.region(target)?;
        Heap::new(&region, &self.entry.heap).extend(target)?;
        debug!(pool = self.index, from = current, to = target, "grew shm pool");
        Ok(())
    }

    pub fn stats_locked(&self) -> FusionResult<PoolStats> {
        let region = self.heap_region()?;
        let heap = Heap::new(&region, &self.entry.heap);
        Ok(PoolStats {
            size: self.entry.heap.size(),
            max_size: self.entry.max_size.load(Ordering::Relaxed),
            used: self.entry.heap.used(),
            allocations: self.entry.heap.allocations(),
            largest_free: heap.largest_free()?,
        })
    }
}

/// Creates a pool entry and its file. Caller holds the world lock.
pub(crate) fn create_entry(
    world: &WorldInner,
    name: &str,
    initial: u64,
    max_size: u64,
    debug: bool,
) -> FusionResult<(usize, u32)> {
    check_name(name)?;
    if max_size < MIN_POOL_SIZE {
        return Err(FusionError::InvalidArgument("pool max size must be at least 4096 bytes"));
    }
    let mut free = None;
    for index in 0..MAX_POOLS {
        let entry: &PoolEntry = world.segment.at(world.layout.pool(index))?;
        match entry.state.load(Ordering::Acquire) {
            ENTRY_ACTIVE if entry.name.matches(name) => {
                return Err(FusionError::InvalidArgument("pool name already in use"))
            }
            ENTRY_EMPTY if free.is_none() => free = Some((index, entry)),
            _ => {}
        }
    }
    let (index, entry) = free.ok_or(FusionError::LimitExceeded("pool table is full"))?;

    let generation = entry.generation.load(Ordering::Relaxed).wrapping_add(1);
    let capacity = max_size & !(ALIGN - 1);
    let size = align_up(initial.max(MIN_POOL_SIZE), PAGE).min(capacity);
    let path = pool_path(&world.config.shm_dir, &world.name, index, generation);
    let mapping = Arc::new(PoolMapping::create(path, generation, size)?);

    entry.lock.init(true);
    entry.name.store(name)?;
    entry.max_size.store(max_size, Ordering::Relaxed);
    entry.debug.store(u32::from(debug), Ordering::Relaxed);
    entry.creator.store(world.fusion_id.get(), Ordering::Relaxed);
    entry.attach_count.store(1, Ordering::Relaxed);
    Heap::new(&mapping.region.load(), &entry.heap).format(size)?;
    entry.generation.store(generation, Ordering::Release);
    entry.state.store(ENTRY_ACTIVE, Ordering::Release);
    world.pools.lock().insert(index, mapping);

    let tracked = debug;
    debug!(pool = name, index, size, max_size, tracked, "created shm pool");
    Ok((index, generation))
}

/// Clears a pool entry and unlinks its file. Caller holds the world lock.
fn destroy_entry(world: &WorldInner, index: usize, generation: u32) -> FusionResult<()> {
    let view = PoolView::new(world, index, generation)?;
    let guard = view.lock()?;
    view.entry.state.store(ENTRY_EMPTY, Ordering::Release);
    view.entry.name.clear();
    view.entry.attach_count.store(0, Ordering::Relaxed);
    drop(guard);
    view.mapping.unlink()?;
    world.pools.lock().remove(&index);
    debug!(pool = index, "destroyed shm pool");
    Ok(())
}

/// Unlinks the files of every pool still in the table. Used when the last
/// member leaves.
pub(crate) fn unlink_all(world: &WorldInner) {
    for index in 0..MAX_POOLS {
        let Ok(entry) = world.segment.at::<PoolEntry>(world.layout.pool(index)) else {
            continue;
        };
        if entry.state.load(Ordering::Acquire) != ENTRY_ACTIVE {
            continue;
        }
        let generation = entry.generation.load(Ordering::Acquire);
        let path = pool_path(&world.config.shm_dir, &world.name, index, generation);
        if let Err(err) = SharedRegion::unlink(&path) {
            warn!(path = %path.display(), "failed to unlink pool file: {err}");
        }
        entry.state.store(ENTRY_EMPTY, Ordering::Release);
    }
    world.pools.lock().clear();
}

/// Usage figures of a pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolStats {
    /// Bytes currently backed by the pool file.
    pub size: u64,
    pub max_size: u64,
    /// Sum of the sizes requested by live allocations.
    pub used: u64,
    pub allocations: u64,
    /// Largest free block, bookkeeping included.
    pub largest_free: u64,
}

/// A live allocation in a debug pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Allocation {
    pub ptr: ShmPtr,
    pub size: u64,
    pub owner: FusionId,
}

/// Held pool skirmish; pass `lock = false` to pool operations while it is
/// alive.
pub struct PoolGuard<'a> {
    _guard: SkirmishGuard<'a>,
}

/// Handle on an attached SHM pool. Dropping it detaches.
pub struct ShmPool {
    world: Arc<WorldInner>,
    index: usize,
    generation: u32,
    name: String,
    attached: bool,
}

impl ShmPool {
    /// Creates a pool called `name` that may grow up to `max_size` bytes.
    /// `debug` keeps allocation owners listable and poisons freed memory.
    pub fn create(world: &World, name: &str, max_size: u64, debug: bool) -> FusionResult<Self> {
        let inner = world.inner();
        inner.check_active()?;
        let header = inner.header()?;
        let _world_lock = inner.lock(&header.world_lock)?;
        let debug = debug || inner.config.debug_shm;
        let (index, generation) = create_entry(inner, name, INITIAL_POOL_SIZE, max_size, debug)?;
        Ok(Self {
            world: Arc::clone(inner),
            index,
            generation,
            name: name.to_owned(),
            attached: true,
        })
    }

    /// Attaches to an existing pool by name.
    pub fn attach(world: &World, name: &str) -> FusionResult<Self> {
        Self::attach_inner(world.inner(), name)
    }

    pub(crate) fn attach_inner(inner: &Arc<WorldInner>, name: &str) -> FusionResult<Self> {
        check_name(name)?;
        inner.check_active()?;
        let header = inner.header()?;
        let _world_lock = inner.lock(&header.world_lock)?;
        for index in 0..MAX_POOLS {
            let entry: &PoolEntry = inner.segment.at(inner.layout.pool(index))?;
            if entry.state.load(Ordering::Acquire) == ENTRY_ACTIVE && entry.name.matches(name) {
                let generation = entry.generation.load(Ordering::Acquire);
                inner.pool_mapping(index, generation)?;
                entry.attach_count.fetch_add(1, Ordering::AcqRel);
                return Ok(Self {
                    world: Arc::clone(inner),
                    index,
                    generation,
                    name: name.to_owned(),
                    attached: true,
                });
            }
        }
        Err(FusionError::ItemNotFound)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn index(&self) -> u16 {
        self.index as u16
    }

    fn view(&self) -> FusionResult<PoolView<'_>> {
        self.world.check_active()?;
        PoolView::new(&self.world, self.index, self.generation)
    }

    /// Takes the pool lock for a batch of `lock = false` operations.
    pub fn lock(&self) -> FusionResult<PoolGuard<'_>> {
        let view = self.view()?;
        Ok(PoolGuard {
            _guard: view.lock()?,
        })
    }

    fn locked<T>(
        &self,
        lock: bool,
        op: impl FnOnce(&PoolView<'_>) -> FusionResult<T>,
    ) -> FusionResult<T> {
        let view = self.view()?;
        if lock {
            let _guard = view.lock()?;
            op(&view)
        } else if view.is_locked() {
            op(&view)
        } else {
            Err(FusionError::InvalidArgument("pool lock is not held"))
        }
    }

    /// Allocates `size` bytes, zeroed when `clear` is set. With `lock ==
    /// false` the caller must hold [`ShmPool::lock`].
    pub fn allocate(&self, size: u64, clear: bool, lock: bool) -> FusionResult<ShmPtr> {
        self.locked(lock, |view| view.allocate_locked(size, clear))
    }

    pub fn reallocate(&self, ptr: ShmPtr, size: u64, lock: bool) -> FusionResult<ShmPtr> {
        self.locked(lock, |view| view.reallocate_locked(ptr, size))
    }

    pub fn deallocate(&self, ptr: ShmPtr, lock: bool) -> FusionResult<()> {
        self.locked(lock, |view| view.deallocate_locked(ptr))
    }

    pub fn stats(&self) -> FusionResult<PoolStats> {
        self.locked(true, |view| view.stats_locked())
    }

    /// Live allocations with their owners. Only pools created with `debug`
    /// track them.
    pub fn debug_allocations(&self) -> FusionResult<Vec<Allocation>> {
        self.locked(true, |view| {
            if !view.is_debug() {
                return Err(FusionError::Unsupported("pool was created without debug tracking"));
            }
            let region = view.heap_region()?;
            let blocks = Heap::new(&region, &view.entry.heap).walk()?;
            Ok(blocks
                .into_iter()
                .map(|block| Allocation {
                    ptr: view.ptr(block.offset),
                    size: block.size,
                    owner: FusionId(block.owner),
                })
                .collect())
        })
    }

    fn checked_region(&self, ptr: ShmPtr, len: usize) -> FusionResult<Arc<SharedRegion>> {
        let view = self.view()?;
        view.owns(ptr)?;
        view.region_for(ptr.offset, len as u64)
    }

    /// Copies bytes out of the pool. Synchronisation is the caller's job.
    pub fn read(&self, ptr: ShmPtr, buf: &mut [u8]) -> FusionResult<()> {
        let region = self.checked_region(ptr, buf.len())?;
        Ok(region.read(ptr.offset as usize, buf)?)
    }

    pub fn write(&self, ptr: ShmPtr, data: &[u8]) -> FusionResult<()> {
        let region = self.checked_region(ptr, data.len())?;
        Ok(region.write(ptr.offset as usize, data)?)
    }

    /// Borrows `len` bytes at `ptr` for the duration of `f`.
    pub fn with_bytes<R>(&self, ptr: ShmPtr, len: usize, f: impl FnOnce(&[u8]) -> R) -> FusionResult<R> {
        let region = self.checked_region(ptr, len)?;
        Ok(f(region.slice(ptr.offset as usize, len)?))
    }

    fn detach_inner(&mut self) -> FusionResult<()> {
        if !std::mem::take(&mut self.attached) {
            return Ok(());
        }
        let header = self.world.header()?;
        let _world_lock = self.world.lock(&header.world_lock)?;
        let entry: &PoolEntry = self.world.segment.at(self.world.layout.pool(self.index))?;
        PoolView::check(entry, self.generation)?;
        let _ = entry
            .attach_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        Ok(())
    }

    pub fn detach(mut self) -> FusionResult<()> {
        self.detach_inner()
    }

    /// Removes the pool for every member. Outstanding handles turn
    /// [`FusionError::Dead`].
    pub fn destroy(mut self) -> FusionResult<()> {
        let header = self.world.header()?;
        if header.main_pool.load(Ordering::Acquire) as usize == self.index {
            return Err(FusionError::InvalidArgument("the main pool belongs to the world"));
        }
        self.attached = false;
        let _world_lock = self.world.lock(&header.world_lock)?;
        destroy_entry(&self.world, self.index, self.generation)
    }
}

impl Drop for ShmPool {
    fn drop(&mut self) {
        if self.world.is_destroyed() {
            return;
        }
        if let Err(err) = self.detach_inner() {
            if !matches!(err, FusionError::Dead | FusionError::Destroyed) {
                warn!(pool = %self.name, "detach failed: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{self, TestWorld};

    #[test]
    fn allocations_account_used_bytes() {
        let t = TestWorld::new("pool-acct");
        let world = t.enter();
        let pool = ShmPool::create(&world, "surfaces", 1 << 20, false).expect("create");
        let a = pool.allocate(100, true, true).expect("a");
        let b = pool.allocate(300, false, true).expect("b");
        assert_eq!(pool.stats().expect("stats").used, 400);
        pool.deallocate(a, true).expect("free a");
        let stats = pool.stats().expect("stats");
        assert_eq!(stats.used, 300);
        assert_eq!(stats.allocations, 1);
        pool.deallocate(b, true).expect("free b");
        assert_eq!(pool.stats().expect("stats").used, 0);
    }

    #[test]
    fn growth_is_visible_to_other_members() {
        let t = TestWorld::new("pool-grow");
        let p1 = t.enter();
        let p2 = t.enter();
        let pool1 = ShmPool::create(&p1, "big", 4 << 20, false).expect("create");
        let pool2 = ShmPool::attach(&p2, "big").expect("attach");

        let first = pool1.allocate(1024, true, true).expect("small");
        let large = pool1.allocate(256 * 1024, true, true).expect("forces growth");
        assert!(pool1.stats().expect("stats").size > INITIAL_POOL_SIZE);

        pool1.write(large.add(200_000), b"far away").expect("write");
        let mut buf = [0u8; 8];
        pool2.read(large.add(200_000), &mut buf).expect("remap on read");
        assert_eq!(&buf, b"far away");

        pool2.deallocate(large, true).expect("free from other member");
        pool2.deallocate(first, true).expect("free");
        assert_eq!(pool1.stats().expect("stats").allocations, 0);
    }

    #[test]
    fn exceeding_max_size_is_out_of_memory_and_recoverable() {
        let t = TestWorld::new("pool-oom");
        let world = t.enter();
        let pool = ShmPool::create(&world, "tiny", 64 * 1024, false).expect("create");
        let held: Vec<_> = (0..6)
            .map(|_| pool.allocate(8 * 1024, false, true).expect("fits"))
            .collect();
        assert!(matches!(
            pool.allocate(32 * 1024, false, true),
            Err(FusionError::OutOfMemory)
        ));
        assert!(matches!(
            pool.allocate(1 << 20, false, true),
            Err(FusionError::OutOfMemory)
        ));
        for ptr in held {
            pool.deallocate(ptr, true).expect("free");
        }
        pool.allocate(32 * 1024, false, true).expect("fits after frees");
    }

    #[test]
    fn unlocked_calls_require_the_guard() {
        let t = TestWorld::new("pool-guard");
        let world = t.enter();
        let pool = ShmPool::create(&world, "guarded", 1 << 20, false).expect("create");
        assert!(matches!(
            pool.allocate(16, false, false),
            Err(FusionError::InvalidArgument(_))
        ));
        let guard = pool.lock().expect("lock");
        let ptr = pool.allocate(16, false, false).expect("under guard");
        let ptr = pool.reallocate(ptr, 4096, false).expect("grow in place or move");
        pool.deallocate(ptr, false).expect("free under guard");
        drop(guard);
    }

    #[test]
    fn debug_pools_list_owners_and_poison_frees() {
        let t = TestWorld::new("pool-debug");
        let world = t.enter();
        let pool = ShmPool::create(&world, "tracked", 1 << 20, true).expect("create");
        let ptr = pool.allocate(64, true, true).expect("alloc");
        let live = pool.debug_allocations().expect("tracked");
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].ptr, ptr);
        assert_eq!(live[0].owner, world.fusion_id());

        let keep = pool.allocate(64, true, true).expect("neighbour");
        pool.deallocate(ptr, true).expect("free");
        let mut buf = [0u8; 8];
        pool.read(ptr.add(16), &mut buf).expect("read freed bytes");
        assert_eq!(buf, [POISON; 8]);
        pool.deallocate(keep, true).expect("free");

        let plain = ShmPool::create(&world, "plain", 1 << 20, false).expect("create");
        assert!(matches!(
            plain.debug_allocations(),
            Err(FusionError::Unsupported(_))
        ));
    }

    #[test]
    fn names_and_lifetimes() {
        let t = TestWorld::new("pool-names");
        let p1 = t.enter();
        let p2 = t.enter();
        let pool = ShmPool::create(&p1, "shared", 1 << 20, false).expect("create");
        assert!(matches!(
            ShmPool::create(&p2, "shared", 1 << 20, false),
            Err(FusionError::InvalidArgument(_))
        ));
        assert!(matches!(
            ShmPool::attach(&p2, "missing"),
            Err(FusionError::ItemNotFound)
        ));
        let other = ShmPool::attach(&p2, "shared").expect("attach");
        let ptr = other.allocate(32, false, true).expect("alloc");

        pool.destroy().expect("destroy");
        assert!(matches!(other.allocate(32, false, true), Err(FusionError::Dead)));
        assert!(matches!(other.deallocate(ptr, true), Err(FusionError::Dead)));
        testing::assert_no_file(&t, "fusion.pool-names.pool1.1");

        let main = p1.main_pool().expect("main pool");
        assert!(matches!(main.destroy(), Err(FusionError::InvalidArgument(_))));
    }
}
