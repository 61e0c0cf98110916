//! Reference-counted shared objects.
//!
//! An object pool is an entry in the world's object-pool table plus up to
//! [`MAX_CHUNKS`] chunks of [`CHUNK_SLOTS`] slots carved from the main pool.
//! Chunks never move, so the atomics in a slot header stay valid for as
//! long as the pool exists.
//!
//! The global count moves only through compare-and-swap (see
//! [`fusion_shm::refcount`]); the per-member counts beside it let the reaper
//! hand back the references of a member that died. Whoever drops the last
//! reference runs the destructor, outside every world-level lock. A member
//! without a destructor for the pool hands the object to one that has one.

use crate::call::{self, CallFlags, CallReply, CallRequest, CallResult, MemberCall};
use crate::pool::{self, PoolView};
use crate::reactor::{self, ListenerToken, Reaction, Reactor};
use crate::world::layout::{
    ObjectPoolEntry, CHUNK_SLOTS, ENTRY_ACTIVE, ENTRY_EMPTY, MAX_CHUNKS, MAX_MEMBERS,
    MAX_OBJECT_POOLS, NO_SLOT,
};
use crate::world::{World, WorldInner};
use crate::{FusionError, FusionId, FusionResult, ObjectId, ReactorId, ShmPtr};
use fusion_shm::heap::align_up;
use fusion_shm::refcount::{self, Release};
use fusion_shm::{SharedRegion, ShmLayout};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::mem::size_of;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

const OBJECT_FREE: u32 = 0;
const OBJECT_LIVE: u32 = 1;
const OBJECT_DYING: u32 = 2;

const SLOT_ALIGN: u64 = 64;
const OBJECT_HEADER: u64 = size_of::<ObjectHeader>() as u64;
const DOOMED_LEN: usize = 24;

#[repr(C)]
struct ObjectHeader {
    state: AtomicU32,
    generation: AtomicU32,
    id: AtomicU64,
    refs: AtomicU32,
    creator: AtomicU32,
    /// Next free slot while on the free list.
    next_free: AtomicU32,
    reactor_id: AtomicU32,
    /// Main pool offset of the object's reactor, 0 until first needed.
    reactor: AtomicU64,
    /// References held per member slot.
    member_refs: [AtomicU32; MAX_MEMBERS],
}

// SAFETY: repr(C) over atomics; zeroed is a free slot.
unsafe impl ShmLayout for ObjectHeader {}

fn slot_size(object_size: u32) -> u64 {
    align_up(OBJECT_HEADER + u64::from(object_size), SLOT_ALIGN)
}

/// Runs when an object's last reference is dropped. `zombie` is set when
/// the object's creator is no longer a live member.
pub trait Destructor: Send + Sync + 'static {
    fn destroy(&self, object: &Object, zombie: bool);
}

impl<F> Destructor for F
where
    F: Fn(&Object, bool) + Send + Sync + 'static,
{
    fn destroy(&self, object: &Object, zombie: bool) {
        self(object, zombie)
    }
}

/// Destructors registered by this process, keyed by pool index and
/// generation.
#[derive(Default)]
pub(crate) struct LocalDestructors {
    map: Mutex<HashMap<(usize, u32), Arc<dyn Destructor>>>,
}

impl LocalDestructors {
    fn get(&self, index: usize, generation: u32) -> Option<Arc<dyn Destructor>> {
        self.map.lock().get(&(index, generation)).cloned()
    }
}

/// Which objects [`ObjectPool::enumerate_where`] visits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjectFilter {
    All,
    CreatedBy(FusionId),
    /// Objects the member holds at least one reference to.
    HeldBy(FusionId),
}

#[derive(Clone)]
pub struct ObjectPool {
    world: Arc<WorldInner>,
    index: usize,
    generation: u32,
    object_size: u32,
    message_size: u32,
    slot_size: u64,
}

impl ObjectPool {
    /// Creates the pool `name`, or joins it if another member already did.
    /// Joining requires the same object and message sizes.
    pub fn create(
        world: &World,
        name: &str,
        object_size: u32,
        message_size: u32,
        destructor: impl Destructor,
    ) -> FusionResult<ObjectPool> {
        let inner = world.inner();
        inner.check_active()?;
        pool::check_name(name)?;
        let header = inner.header()?;
        let (index, generation) = {
            let _guard = inner.lock(&header.world_lock)?;
            let (index, generation) = find_or_claim(inner, name, object_size, message_size)?;
            let entry: &ObjectPoolEntry = inner.segment.at(inner.layout.object_pool(index))?;
            entry.destructors.fetch_or(1 << inner.slot, Ordering::AcqRel);
            (index, generation)
        };
        inner
            .destructors
            .map
            .lock()
            .insert((index, generation), Arc::new(destructor));
        Ok(ObjectPool {
            world: Arc::clone(inner),
            index,
            generation,
            object_size,
            message_size,
            slot_size: slot_size(object_size),
        })
    }

    fn handle(world: &Arc<WorldInner>, index: usize) -> FusionResult<ObjectPool> {
        let entry: &ObjectPoolEntry = world.segment.at(world.layout.object_pool(index))?;
        let object_size = entry.object_size.load(Ordering::Acquire);
        Ok(ObjectPool {
            world: Arc::clone(world),
            index,
            generation: entry.generation.load(Ordering::Acquire),
            object_size,
            message_size: entry.message_size.load(Ordering::Acquire),
            slot_size: slot_size(object_size),
        })
    }

    pub fn object_size(&self) -> u32 {
        self.object_size
    }

    pub fn message_size(&self) -> u32 {
        self.message_size
    }

    fn entry(&self) -> FusionResult<&ObjectPoolEntry> {
        let entry: &ObjectPoolEntry = self.world.segment.at(self.world.layout.object_pool(self.index))?;
        if entry.state.load(Ordering::Acquire) != ENTRY_ACTIVE
            || entry.generation.load(Ordering::Acquire) != self.generation
        {
            return Err(FusionError::Dead);
        }
        Ok(entry)
    }

    pub fn name(&self) -> FusionResult<String> {
        Ok(self.entry()?.name.load())
    }

    /// Live objects in the pool.
    pub fn len(&self) -> FusionResult<usize> {
        Ok(self.entry()?.count.load(Ordering::Acquire) as usize)
    }

    pub fn is_empty(&self) -> FusionResult<bool> {
        Ok(self.len()? == 0)
    }

    fn slot_offset(&self, entry: &ObjectPoolEntry, slot: u32) -> FusionResult<u64> {
        let chunk = slot as usize / CHUNK_SLOTS;
        let base = entry
            .chunks
            .get(chunk)
            .map(|c| c.load(Ordering::Acquire))
            .filter(|&base| base != 0)
            .ok_or(FusionError::Dead)?;
        Ok(base + (slot as usize % CHUNK_SLOTS) as u64 * self.slot_size)
    }

    fn slot_count(entry: &ObjectPoolEntry) -> u32 {
        entry.chunk_count.load(Ordering::Acquire) * CHUNK_SLOTS as u32
    }

    /// Allocates and initialises an object; the caller holds its single
    /// reference.
    pub fn create_object(&self) -> FusionResult<Object> {
        self.world.check_active()?;
        let entry = self.entry()?;
        let view = self.world.main_pool()?;
        let _lock = self.world.lock(&entry.lock)?;
        let entry = self.entry()?;

        if entry.free_head.load(Ordering::Acquire) == NO_SLOT {
            self.grow_locked(entry, &view)?;
        }
        let slot = entry.free_head.load(Ordering::Acquire);
        let offset = self.slot_offset(entry, slot)?;
        let region = view.region_for(offset, self.slot_size)?;
        let header: &ObjectHeader = region.at(offset as usize)?;
        entry
            .free_head
            .store(header.next_free.load(Ordering::Relaxed), Ordering::Release);

        let generation = header.generation.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
        let id = ObjectId(entry.next_id.fetch_add(1, Ordering::AcqRel));
        header.id.store(id.get(), Ordering::Relaxed);
        header.creator.store(self.world.fusion_id.get(), Ordering::Relaxed);
        header.next_free.store(NO_SLOT, Ordering::Relaxed);
        header.reactor_id.store(0, Ordering::Relaxed);
        header.reactor.store(0, Ordering::Relaxed);
        for count in &header.member_refs {
            count.store(0, Ordering::Relaxed);
        }
        header.member_refs[self.world.slot].store(1, Ordering::Relaxed);
        region.fill((offset + OBJECT_HEADER) as usize, self.object_size as usize, 0)?;
        header.refs.store(1, Ordering::Release);
        header.state.store(OBJECT_LIVE, Ordering::Release);
        entry.count.fetch_add(1, Ordering::AcqRel);

        debug!(pool = self.index, object = %id, slot, "created object");
        Ok(Object {
            pool: self.clone(),
            slot,
            generation,
            id,
            offset,
        })
    }

    /// Adds a chunk and threads its slots onto the free list. Caller holds
    /// the pool lock.
    fn grow_locked(&self, entry: &ObjectPoolEntry, view: &PoolView<'_>) -> FusionResult<()> {
        let chunk = entry.chunk_count.load(Ordering::Acquire) as usize;
        if chunk >= MAX_CHUNKS {
            return Err(FusionError::OutOfMemory);
        }
        let ptr = {
            let _pool = view.lock()?;
            view.allocate_locked(self.slot_size * CHUNK_SLOTS as u64, true)?
        };
        let region = view.region_for(ptr.offset, self.slot_size * CHUNK_SLOTS as u64)?;
        let first = (chunk * CHUNK_SLOTS) as u32;
        for i in 0..CHUNK_SLOTS as u32 {
            let header: &ObjectHeader =
                region.at((ptr.offset + u64::from(i) * self.slot_size) as usize)?;
            let next = if i + 1 < CHUNK_SLOTS as u32 {
                first + i + 1
            } else {
                entry.free_head.load(Ordering::Acquire)
            };
            header.next_free.store(next, Ordering::Relaxed);
        }
        entry.chunks[chunk].store(ptr.offset, Ordering::Release);
        entry.chunk_count.store(chunk as u32 + 1, Ordering::Release);
        entry.free_head.store(first, Ordering::Release);
        debug!(pool = self.index, chunk, "added object chunk");
        Ok(())
    }

    fn object_at(&self, entry: &ObjectPoolEntry, view: &PoolView<'_>, slot: u32) -> FusionResult<Option<(Object, Arc<SharedRegion>)>> {
        let offset = self.slot_offset(entry, slot)?;
        let region = view.region_for(offset, self.slot_size)?;
        let header: &ObjectHeader = region.at(offset as usize)?;
        if header.state.load(Ordering::Acquire) != OBJECT_LIVE {
            return Ok(None);
        }
        let object = Object {
            pool: self.clone(),
            slot,
            generation: header.generation.load(Ordering::Acquire),
            id: ObjectId(header.id.load(Ordering::Acquire)),
            offset,
        };
        Ok(Some((object, region)))
    }

    /// Live object with `id`. No reference is taken.
    pub fn lookup(&self, id: ObjectId) -> FusionResult<Object> {
        let mut found = None;
        self.enumerate(|object| {
            if object.id == id {
                found = Some(object.clone());
                return ControlFlow::Break(());
            }
            ControlFlow::Continue(())
        })?;
        found.ok_or(FusionError::ItemNotFound)
    }

    /// Visits every live object with the pool lock held.
    pub fn enumerate(&self, visit: impl FnMut(&Object) -> ControlFlow<()>) -> FusionResult<()> {
        self.enumerate_where(ObjectFilter::All, visit)
    }

    pub fn enumerate_where(
        &self,
        filter: ObjectFilter,
        mut visit: impl FnMut(&Object) -> ControlFlow<()>,
    ) -> FusionResult<()> {
        self.world.check_active()?;
        let entry = self.entry()?;
        let view = self.world.main_pool()?;
        let _lock = self.world.lock(&entry.lock)?;
        let entry = self.entry()?;
        let holder = match filter {
            ObjectFilter::HeldBy(member) => match self.world.liveness.slot_of(member) {
                Some(slot) => Some(slot),
                None => return Ok(()),
            },
            _ => None,
        };

        for slot in 0..Self::slot_count(entry) {
            let Some((object, region)) = self.object_at(entry, &view, slot)? else {
                continue;
            };
            let header: &ObjectHeader = region.at(object.offset as usize)?;
            let wanted = match filter {
                ObjectFilter::All => true,
                ObjectFilter::CreatedBy(member) => header.creator.load(Ordering::Acquire) == member.get(),
                ObjectFilter::HeldBy(_) => {
                    holder.is_some_and(|h| header.member_refs[h].load(Ordering::Acquire) > 0)
                }
            };
            if wanted && visit(&object).is_break() {
                break;
            }
        }
        Ok(())
    }

    /// Frees the pool. Fails with [`FusionError::Busy`] while objects live.
    pub fn destroy(self) -> FusionResult<()> {
        let header = self.world.header()?;
        let _guard = self.world.lock(&header.world_lock)?;
        let entry = self.entry()?;
        let view = self.world.main_pool()?;
        let _lock = self.world.lock(&entry.lock)?;
        if entry.count.load(Ordering::Acquire) > 0 {
            return Err(FusionError::Busy);
        }
        {
            let _pool = view.lock()?;
            for chunk in &entry.chunks {
                let offset = chunk.swap(0, Ordering::AcqRel);
                if offset != 0 {
                    view.deallocate_locked(ShmPtr::new(view.index as u16, offset))?;
                }
            }
        }
        entry.chunk_count.store(0, Ordering::Relaxed);
        entry.free_head.store(NO_SLOT, Ordering::Relaxed);
        entry.destructors.store(0, Ordering::Relaxed);
        entry.name.clear();
        entry.state.store(ENTRY_EMPTY, Ordering::Release);
        self.world
            .destructors
            .map
            .lock()
            .remove(&(self.index, self.generation));
        debug!(pool = self.index, "destroyed object pool");
        Ok(())
    }

    /// Returns a dying slot to the free list. Runs without world-level
    /// locks held.
    fn free_slot(&self, slot: u32, generation: u32, offset: u64) -> FusionResult<()> {
        let view = self.world.main_pool()?;
        let region = view.region_for(offset, self.slot_size)?;
        let header: &ObjectHeader = region.at(offset as usize)?;
        if header.generation.load(Ordering::Acquire) != generation
            || header.state.load(Ordering::Acquire) != OBJECT_DYING
        {
            return Err(FusionError::Dead);
        }
        let reactor = header.reactor.swap(0, Ordering::AcqRel);
        if reactor != 0 {
            let id = ReactorId(header.reactor_id.load(Ordering::Acquire));
            if let Err(err) = reactor::destroy(&self.world, id, reactor) {
                warn!(reactor = %id, "destroying object reactor failed: {err}");
            }
        }

        let entry = self.entry()?;
        let _lock = self.world.lock(&entry.lock)?;
        header.state.store(OBJECT_FREE, Ordering::Release);
        header
            .next_free
            .store(entry.free_head.load(Ordering::Acquire), Ordering::Relaxed);
        entry.free_head.store(slot, Ordering::Release);
        entry.count.fetch_sub(1, Ordering::AcqRel);
        Ok(())
    }
}

impl fmt::Debug for ObjectPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectPool")
            .field("index", &self.index)
            .field("generation", &self.generation)
            .field("object_size", &self.object_size)
            .finish()
    }
}

/// Finds `name` in the object-pool table or claims an empty entry. Caller
/// holds the world lock.
fn find_or_claim(
    world: &WorldInner,
    name: &str,
    object_size: u32,
    message_size: u32,
) -> FusionResult<(usize, u32)> {
    let mut empty = None;
    for index in 0..MAX_OBJECT_POOLS {
        let entry: &ObjectPoolEntry = world.segment.at(world.layout.object_pool(index))?;
        match entry.state.load(Ordering::Acquire) {
            ENTRY_ACTIVE if entry.name.matches(name) => {
                if entry.object_size.load(Ordering::Acquire) != object_size
                    || entry.message_size.load(Ordering::Acquire) != message_size
                {
                    return Err(FusionError::InvalidArgument(
                        "object pool exists with different sizes",
                    ));
                }
                debug!(pool = index, name, "joined object pool");
                return Ok((index, entry.generation.load(Ordering::Acquire)));
            }
            ENTRY_EMPTY if empty.is_none() => empty = Some((index, entry)),
            _ => {}
        }
    }
    let (index, entry) =
        empty.ok_or(FusionError::LimitExceeded("object pool table is full"))?;
    if entry.generation.load(Ordering::Acquire) == 0 {
        entry.lock.init(true);
    }
    let generation = entry.generation.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
    entry.object_size.store(object_size, Ordering::Relaxed);
    entry.message_size.store(message_size, Ordering::Relaxed);
    entry.next_id.store(1, Ordering::Relaxed);
    entry.count.store(0, Ordering::Relaxed);
    entry.creator.store(world.fusion_id.get(), Ordering::Relaxed);
    entry.free_head.store(NO_SLOT, Ordering::Relaxed);
    entry.chunk_count.store(0, Ordering::Relaxed);
    entry.destructors.store(0, Ordering::Relaxed);
    for chunk in &entry.chunks {
        chunk.store(0, Ordering::Relaxed);
    }
    entry.name.store(name)?;
    entry.state.store(ENTRY_ACTIVE, Ordering::Release);
    debug!(pool = index, name, object_size, "created object pool");
    Ok((index, generation))
}

/// Handle on one object. Cloning a handle does not take a reference; use
/// [`Object::add_ref`] and [`Object::unref`].
#[derive(Clone)]
pub struct Object {
    pool: ObjectPool,
    slot: u32,
    generation: u32,
    id: ObjectId,
    offset: u64,
}

/// Reference change on an object that is already gone.
fn destroyed_object() -> FusionError {
    debug_assert!(false, "reference change on a destroyed object");
    FusionError::Dead
}

impl Object {
    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn pool(&self) -> &ObjectPool {
        &self.pool
    }

    fn region(&self) -> FusionResult<Arc<SharedRegion>> {
        self.pool
            .world
            .main_pool()?
            .region_for(self.offset, self.pool.slot_size)
    }

    fn header<'r>(&self, region: &'r SharedRegion) -> FusionResult<&'r ObjectHeader> {
        let header: &ObjectHeader = region.at(self.offset as usize)?;
        if header.generation.load(Ordering::Acquire) != self.generation
            || header.state.load(Ordering::Acquire) == OBJECT_FREE
        {
            return Err(FusionError::Dead);
        }
        Ok(header)
    }

    pub fn creator(&self) -> FusionResult<FusionId> {
        let region = self.region()?;
        Ok(FusionId(self.header(&region)?.creator.load(Ordering::Acquire)))
    }

    /// Global reference count.
    pub fn refs(&self) -> FusionResult<u32> {
        let region = self.region()?;
        Ok(self.header(&region)?.refs.load(Ordering::Acquire))
    }

    pub fn add_ref(&self) -> FusionResult<()> {
        let region = self.region()?;
        let header = self.header(&region).map_err(|_| destroyed_object())?;
        if refcount::try_acquire(&header.refs).is_none() {
            return Err(destroyed_object());
        }
        header.member_refs[self.pool.world.slot].fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Drops one reference. Dropping the last one runs the destructor in
    /// this process before returning.
    pub fn unref(&self) -> FusionResult<()> {
        let world = &self.pool.world;
        let region = self.region()?;
        let header = self.header(&region).map_err(|_| destroyed_object())?;
        if !take_member_ref(header, world.slot) {
            self.take_foreign_ref(header)?;
        }
        match refcount::release(&header.refs) {
            None => Err(destroyed_object()),
            Some(Release::Alive(_)) => Ok(()),
            Some(Release::Last) => {
                header.state.store(OBJECT_DYING, Ordering::Release);
                let creator = FusionId(header.creator.load(Ordering::Acquire));
                let zombie = !world.liveness.is_member_alive(creator);
                Doomed {
                    object: self.clone(),
                    zombie,
                }
                .finish()
            }
        }
    }

    /// Charges a reference this member never took to a member that holds
    /// one, the creator first, so the per-member counts keep adding up to
    /// the global count.
    fn take_foreign_ref(&self, header: &ObjectHeader) -> FusionResult<()> {
        let world = &self.pool.world;
        let entry = self.pool.entry()?;
        let _lock = world.lock(&entry.lock)?;
        let creator = world
            .liveness
            .slot_of(FusionId(header.creator.load(Ordering::Acquire)));
        let holder = creator
            .into_iter()
            .chain(0..MAX_MEMBERS)
            .find(|&slot| take_member_ref(header, slot));
        match holder {
            Some(slot) => debug!(object = %self.id, holder = slot, "dropped a reference held by another member"),
            None => warn!(object = %self.id, "no member accounts for the dropped reference"),
        }
        Ok(())
    }

    fn payload_range(&self, offset: usize, len: usize) -> FusionResult<usize> {
        let end = offset
            .checked_add(len)
            .ok_or(FusionError::InvalidArgument("payload range overflows"))?;
        if end > self.pool.object_size as usize {
            return Err(FusionError::InvalidArgument("payload range exceeds the object size"));
        }
        Ok(self.offset as usize + OBJECT_HEADER as usize + offset)
    }

    pub fn read_payload(&self, offset: usize, buf: &mut [u8]) -> FusionResult<()> {
        let at = self.payload_range(offset, buf.len())?;
        let region = self.region()?;
        self.header(&region)?;
        Ok(region.read(at, buf)?)
    }

    pub fn write_payload(&self, offset: usize, data: &[u8]) -> FusionResult<()> {
        let at = self.payload_range(offset, data.len())?;
        let region = self.region()?;
        self.header(&region)?;
        Ok(region.write(at, data)?)
    }

    /// The object's reactor, created on first use.
    pub fn reactor(&self) -> FusionResult<Reactor> {
        let world = &self.pool.world;
        let region = self.region()?;
        let header = self.header(&region)?;
        let existing = |header: &ObjectHeader| {
            let offset = header.reactor.load(Ordering::Acquire);
            (offset != 0).then(|| {
                let id = ReactorId(header.reactor_id.load(Ordering::Acquire));
                reactor::handle(world, id, offset)
            })
        };
        if let Some(reactor) = existing(header) {
            return Ok(reactor);
        }

        let entry = self.pool.entry()?;
        let _lock = world.lock(&entry.lock)?;
        let header = self.header(&region)?;
        if let Some(reactor) = existing(header) {
            return Ok(reactor);
        }
        let reactor = reactor::create(world, self.pool.message_size)?;
        header.reactor_id.store(reactor.id().get(), Ordering::Relaxed);
        header.reactor.store(reactor.offset(), Ordering::Release);
        Ok(reactor)
    }

    pub fn attach(&self, reaction: impl Reaction) -> FusionResult<ListenerToken> {
        self.reactor()?.attach(reaction)
    }

    pub fn attach_channel(&self, channel: u32, reaction: impl Reaction) -> FusionResult<ListenerToken> {
        self.reactor()?.attach_channel(channel, reaction)
    }

    pub fn detach(&self, token: ListenerToken) -> FusionResult<()> {
        self.reactor()?.detach(token)
    }

    pub fn set_direct(&self, enabled: bool) -> FusionResult<()> {
        self.reactor()?.set_direct(enabled)
    }

    /// Notifies the object's listeners. This member must hold a reference.
    pub fn dispatch(&self, message: &[u8], self_notify: bool) -> FusionResult<()> {
        self.dispatch_channel(0, message, self_notify)
    }

    pub fn dispatch_channel(&self, channel: u32, message: &[u8], self_notify: bool) -> FusionResult<()> {
        let region = self.region()?;
        let header = self.header(&region)?;
        if header.member_refs[self.pool.world.slot].load(Ordering::Acquire) == 0 {
            return Err(FusionError::InvalidArgument("dispatch requires a held reference"));
        }
        self.reactor()?.dispatch_channel(channel, message, self_notify)
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Object")
            .field("id", &self.id)
            .field("pool", &self.pool.index)
            .field("slot", &self.slot)
            .finish()
    }
}

fn take_member_ref(header: &ObjectHeader, slot: usize) -> bool {
    header.member_refs[slot]
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |held| held.checked_sub(1))
        .is_ok()
}

/// An object whose last reference is gone, waiting for its destructor.
pub(crate) struct Doomed {
    object: Object,
    zombie: bool,
}

impl Doomed {
    fn finish(self) -> FusionResult<()> {
        let pool = &self.object.pool;
        match pool.world.destructors.get(pool.index, pool.generation) {
            Some(destructor) => destructor.destroy(&self.object, self.zombie),
            None => match self.hand_off() {
                Ok(member) => {
                    debug!(object = %self.object.id, %member, zombie = self.zombie, "destroyed object in peer");
                    return Ok(());
                }
                Err(err) => {
                    warn!(object = %self.object.id, "no destructor reachable, freeing slot: {err}");
                }
            },
        }
        debug!(object = %self.object.id, zombie = self.zombie, "destroyed object");
        pool.free_slot(self.object.slot, self.object.generation, self.object.offset)
    }

    /// Asks a live member that registered a destructor for the pool to run
    /// it and free the slot.
    fn hand_off(&self) -> FusionResult<FusionId> {
        let pool = &self.object.pool;
        let world = &pool.world;
        let registered = pool.entry()?.destructors.load(Ordering::Acquire);
        let request = encode_doomed(&self.object);
        for slot in (0..MAX_MEMBERS).filter(|&slot| slot != world.slot && registered & (1 << slot) != 0) {
            let member = world.member(slot)?;
            if !member.is_active() || !world.liveness.entry_alive(member) {
                continue;
            }
            let target = FusionId(member.fusion_id.load(Ordering::Acquire));
            let result = call::execute_member_call(
                world,
                MemberCall::Destructors,
                target,
                CallFlags::empty(),
                i32::from(self.zombie),
                &request,
            );
            match result {
                Ok(_) => return Ok(target),
                Err(FusionError::Destroyed | FusionError::ItemNotFound | FusionError::Busy) => continue,
                Err(err) => return Err(err),
            }
        }
        Err(FusionError::ItemNotFound)
    }
}

fn encode_doomed(object: &Object) -> Vec<u8> {
    let mut buf = Vec::with_capacity(DOOMED_LEN);
    for word in [
        object.pool.index as u32,
        object.pool.generation,
        object.slot,
        object.generation,
    ] {
        buf.extend_from_slice(&word.to_le_bytes());
    }
    buf.extend_from_slice(&object.offset.to_le_bytes());
    buf
}

/// `(pool index, pool generation, slot, object generation, offset)`.
fn decode_doomed(buf: &[u8]) -> FusionResult<(usize, u32, u32, u32, u64)> {
    let malformed = || FusionError::InvalidArgument("malformed destroy request");
    if buf.len() != DOOMED_LEN {
        return Err(malformed());
    }
    let word = |at: usize| u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
    let index = word(0) as usize;
    if index >= MAX_OBJECT_POOLS {
        return Err(malformed());
    }
    let mut offset = [0u8; 8];
    offset.copy_from_slice(&buf[16..DOOMED_LEN]);
    Ok((index, word(4), word(8), word(12), u64::from_le_bytes(offset)))
}

/// Body of every member's destroy call: runs the local destructor for an
/// object a peer doomed and frees its slot.
pub(crate) fn destroy_remote(world: &Arc<WorldInner>, request: CallRequest<'_>) -> CallResult {
    let (index, pool_generation, slot, generation, offset) = decode_doomed(request.input)?;
    let destructor = world
        .destructors
        .get(index, pool_generation)
        .ok_or(FusionError::ItemNotFound)?;
    let pool = ObjectPool::handle(world, index)?;
    if pool.generation != pool_generation {
        return Err(FusionError::Dead);
    }
    let region = world.main_pool()?.region_for(offset, pool.slot_size)?;
    let header: &ObjectHeader = region.at(offset as usize)?;
    if header.generation.load(Ordering::Acquire) != generation
        || header.state.load(Ordering::Acquire) != OBJECT_DYING
    {
        return Err(FusionError::Dead);
    }
    let object = Object {
        id: ObjectId(header.id.load(Ordering::Acquire)),
        pool,
        slot,
        generation,
        offset,
    };
    let zombie = request.call_arg != 0;
    destructor.destroy(&object, zombie);
    debug!(object = %object.id, zombie, caller = %request.caller, "destroyed object for a peer");
    if let Err(err) = object.pool.free_slot(slot, generation, offset) {
        warn!(object = %object.id, "freeing destroyed object failed: {err}");
    }
    Ok(CallReply::default())
}

/// Runs destructors for objects collected while locks were held.
pub(crate) fn finish_destruction(doomed: Vec<Doomed>) {
    for item in doomed {
        let id = item.object.id;
        if let Err(err) = item.finish() {
            warn!(object = %id, "freeing destroyed object failed: {err}");
        }
    }
}

/// Drops every reference the member in `slot` holds. Objects that lose
/// their last reference are returned for destruction. Caller holds the
/// world lock.
pub(crate) fn reap_member(world: &Arc<WorldInner>, slot: usize, dead: bool) -> FusionResult<Vec<Doomed>> {
    let mut doomed = Vec::new();
    let view = world.main_pool()?;
    for index in 0..MAX_OBJECT_POOLS {
        let entry: &ObjectPoolEntry = world.segment.at(world.layout.object_pool(index))?;
        if entry.state.load(Ordering::Acquire) != ENTRY_ACTIVE {
            continue;
        }
        let pool = ObjectPool::handle(world, index)?;
        let _lock = world.lock(&entry.lock)?;
        entry.destructors.fetch_and(!(1 << slot), Ordering::AcqRel);
        for object_slot in 0..ObjectPool::slot_count(entry) {
            let Some((object, region)) = pool.object_at(entry, &view, object_slot)? else {
                continue;
            };
            let header: &ObjectHeader = region.at(object.offset as usize)?;
            let held = header.member_refs[slot].swap(0, Ordering::AcqRel);
            if held == 0 {
                continue;
            }
            if let Some(Release::Last) = refcount::release_many(&header.refs, held) {
                header.state.store(OBJECT_DYING, Ordering::Release);
                let creator = FusionId(header.creator.load(Ordering::Acquire));
                let zombie = dead || !world.liveness.is_member_alive(creator);
                doomed.push(Doomed { object, zombie });
            }
        }
    }
    if !doomed.is_empty() {
        debug!(slot, objects = doomed.len(), "references of departed member dropped");
    }
    Ok(doomed)
}
