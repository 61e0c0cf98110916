//! Ordered publish / subscribe.
//!
//! A reactor is a header in the world's main pool plus a listener array
//! `(listener id, fusion id, channel)` kept in attach order. The closure
//! behind each listener lives in the process that attached it. Dispatching
//! walks the array once: listeners of the dispatching member run here,
//! every run of consecutive listeners owned by another member is delivered
//! with one synchronous call to that member's reactor call.
//!
//! Locks: `dispatch_lock` serialises dispatch passes, `list_lock` guards the
//! listener array. Order is dispatch lock, then the world's reactor lock
//! (registry), then the list lock, then the main pool lock. A reaction that
//! dispatches on its own reactor from a thread other than the dispatching one
//! gets [`FusionError::Busy`].

use crate::call::{self, CallFlags, CallReply, CallRequest, CallResult, MemberCall};
use crate::pool::PoolView;
use crate::world::{World, WorldInner};
use crate::{CallId, FusionError, FusionId, FusionResult, ListenerId, ReactorId, ShmPtr};
use fusion_shm::{SharedRegion, ShmLayout, SkirmishRaw};
use parking_lot::Mutex;
use smallvec::{smallvec, SmallVec};
use std::cell::Cell;
use std::collections::HashMap;
use std::fmt;
use std::mem::size_of;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

const REACTOR_MAGIC: u32 = 0x5245_4143; // "REAC"
const INITIAL_LISTENERS: u32 = 4;
const HEADER_SIZE: u64 = size_of::<ReactorHeader>() as u64;
const ENTRY_SIZE: u64 = size_of::<ListenerEntry>() as u64;

thread_local! {
    /// World token and reactor whose reactions the current thread runs.
    static REACTING: Cell<Option<(u64, ReactorId)>> = const { Cell::new(None) };
}

/// Restores the enclosing reaction scope when a delivery finishes.
struct Reacting(Option<(u64, ReactorId)>);

impl Reacting {
    fn enter(world: &WorldInner, reactor: ReactorId) -> Self {
        Self(REACTING.with(|cell| cell.replace(Some((world.token, reactor)))))
    }
}

impl Drop for Reacting {
    fn drop(&mut self) {
        REACTING.with(|cell| cell.set(self.0));
    }
}

fn is_reacting(world: &WorldInner, reactor: ReactorId) -> bool {
    REACTING.with(|cell| cell.get() == Some((world.token, reactor)))
}

#[repr(C, align(8))]
struct ReactorHeader {
    magic: AtomicU32,
    id: AtomicU32,
    creator: AtomicU32,
    direct: AtomicU32,
    message_size: AtomicU32,
    next_listener: AtomicU32,
    count: AtomicU32,
    capacity: AtomicU32,
    /// Main pool offset of the listener array, 0 before the first attach.
    listeners: AtomicU64,
    /// Next reactor in the world's registry.
    next: AtomicU64,
    dispatch_lock: SkirmishRaw,
    list_lock: SkirmishRaw,
}

#[repr(C)]
struct ListenerEntry {
    id: AtomicU32,
    fusion_id: AtomicU32,
    channel: AtomicU32,
    _pad: AtomicU32,
}

// SAFETY: repr(C) over atomics and skirmishes; zeroed is an unused header.
unsafe impl ShmLayout for ReactorHeader {}
// SAFETY: as above.
unsafe impl ShmLayout for ListenerEntry {}

/// What a reaction asks of the dispatcher.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReactionResult {
    Keep,
    /// Detach this listener as part of the current dispatch.
    Remove,
}

/// Listener closure, run in the process that attached it.
pub trait Reaction: Send + Sync + 'static {
    fn react(&self, message: &[u8]) -> ReactionResult;
}

impl<F> Reaction for F
where
    F: Fn(&[u8]) -> ReactionResult + Send + Sync + 'static,
{
    fn react(&self, message: &[u8]) -> ReactionResult {
        self(message)
    }
}

/// Identifies one attached listener.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerToken {
    pub reactor: ReactorId,
    pub listener: ListenerId,
}

/// Reactions attached from this process.
#[derive(Default)]
pub(crate) struct LocalReactions {
    map: Mutex<HashMap<(ReactorId, ListenerId), Arc<dyn Reaction>>>,
}

impl LocalReactions {
    fn get(&self, reactor: ReactorId, listener: ListenerId) -> Option<Arc<dyn Reaction>> {
        self.map.lock().get(&(reactor, listener)).cloned()
    }

    fn insert(&self, reactor: ReactorId, listener: ListenerId, reaction: Arc<dyn Reaction>) {
        self.map.lock().insert((reactor, listener), reaction);
    }

    fn remove(&self, reactor: ReactorId, listener: ListenerId) {
        self.map.lock().remove(&(reactor, listener));
    }

    fn remove_reactor(&self, reactor: ReactorId) {
        self.map.lock().retain(|(id, _), _| *id != reactor);
    }
}

/// Handle on a reactor living in the world's main pool.
#[derive(Clone)]
pub struct Reactor {
    world: Arc<WorldInner>,
    id: ReactorId,
    offset: u64,
}

impl Reactor {
    /// Creates a standalone reactor whose messages are at most
    /// `message_size` bytes.
    pub fn new(world: &World, message_size: u32) -> FusionResult<Reactor> {
        create(world.inner(), message_size)
    }

    /// Handle on an existing reactor, e.g. one whose id arrived in a call.
    pub fn open(world: &World, id: ReactorId) -> FusionResult<Reactor> {
        let inner = world.inner();
        inner.check_active()?;
        let header = inner.header()?;
        let _registry = inner.lock(&header.reactor_lock)?;
        let view = inner.main_pool()?;
        let mut offset = header.reactors.load(Ordering::Acquire);
        while offset != 0 {
            let region = view.region_for(offset, HEADER_SIZE)?;
            let reactor: &ReactorHeader = region.at(offset as usize)?;
            if reactor.id.load(Ordering::Acquire) == id.get() {
                return Ok(Reactor {
                    world: Arc::clone(inner),
                    id,
                    offset,
                });
            }
            offset = reactor.next.load(Ordering::Acquire);
        }
        Err(FusionError::ItemNotFound)
    }

    pub fn id(&self) -> ReactorId {
        self.id
    }

    pub(crate) fn offset(&self) -> u64 {
        self.offset
    }

    fn view(&self) -> FusionResult<PoolView<'_>> {
        self.world.check_active()?;
        self.world.main_pool()
    }

    /// Mapping covering the header, checked to still be this reactor.
    fn mapped(&self, view: &PoolView<'_>) -> FusionResult<Arc<SharedRegion>> {
        let region = view.region_for(self.offset, HEADER_SIZE)?;
        let header: &ReactorHeader = region.at(self.offset as usize)?;
        if header.magic.load(Ordering::Acquire) != REACTOR_MAGIC
            || header.id.load(Ordering::Acquire) != self.id.get()
        {
            return Err(FusionError::Dead);
        }
        Ok(region)
    }

    fn header<'r>(&self, region: &'r SharedRegion) -> FusionResult<&'r ReactorHeader> {
        let header: &ReactorHeader = region.at(self.offset as usize)?;
        if header.magic.load(Ordering::Acquire) != REACTOR_MAGIC {
            return Err(FusionError::Dead);
        }
        Ok(header)
    }

    /// Listeners currently attached, across all members.
    pub fn len(&self) -> FusionResult<usize> {
        let view = self.view()?;
        let region = self.mapped(&view)?;
        Ok(self.header(&region)?.count.load(Ordering::Acquire) as usize)
    }

    pub fn is_empty(&self) -> FusionResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Largest message [`Reactor::dispatch`] accepts.
    pub fn message_size(&self) -> FusionResult<u32> {
        let view = self.view()?;
        let region = self.mapped(&view)?;
        Ok(self.header(&region)?.message_size.load(Ordering::Relaxed))
    }

    /// Attaches `reaction` to channel 0.
    pub fn attach(&self, reaction: impl Reaction) -> FusionResult<ListenerToken> {
        self.attach_channel(0, reaction)
    }

    pub fn attach_channel(&self, channel: u32, reaction: impl Reaction) -> FusionResult<ListenerToken> {
        let view = self.view()?;
        let region = self.mapped(&view)?;
        let header = self.header(&region)?;
        let _list = self.world.lock(&header.list_lock)?;
        let header = self.header(&region)?;

        if header.count.load(Ordering::Relaxed) == header.capacity.load(Ordering::Relaxed) {
            grow_listeners(&view, header)?;
        }
        let listener = ListenerId(header.next_listener.fetch_add(1, Ordering::AcqRel));
        self.world.reactions.insert(self.id, listener, Arc::new(reaction));

        let count = header.count.load(Ordering::Relaxed);
        let base = header.listeners.load(Ordering::Relaxed);
        let region = view.region_for(0, base + u64::from(count + 1) * ENTRY_SIZE)?;
        let entry: &ListenerEntry = region.at((base + u64::from(count) * ENTRY_SIZE) as usize)?;
        entry.id.store(listener.get(), Ordering::Relaxed);
        entry.fusion_id.store(self.world.fusion_id.get(), Ordering::Relaxed);
        entry.channel.store(channel, Ordering::Relaxed);
        header.count.store(count + 1, Ordering::Release);
        debug!(reactor = %self.id, listener = %listener, channel, "attached listener");
        Ok(ListenerToken {
            reactor: self.id,
            listener,
        })
    }

    pub fn detach(&self, token: ListenerToken) -> FusionResult<()> {
        if token.reactor != self.id {
            return Err(FusionError::InvalidArgument("token belongs to another reactor"));
        }
        let view = self.view()?;
        let region = self.mapped(&view)?;
        let header = self.header(&region)?;
        let _list = self.world.lock(&header.list_lock)?;
        let removed = remove_listeners(&view, self.header(&region)?, |id, _| id == token.listener)?;
        self.world.reactions.remove(self.id, token.listener);
        if removed == 0 {
            return Err(FusionError::ItemNotFound);
        }
        Ok(())
    }

    /// Delivers local listeners inline instead of through this member's
    /// reactor worker.
    pub fn set_direct(&self, enabled: bool) -> FusionResult<()> {
        let view = self.view()?;
        let region = self.mapped(&view)?;
        self.header(&region)?
            .direct
            .store(u32::from(enabled), Ordering::Release);
        Ok(())
    }

    /// Sends `message` to every channel 0 listener in attach order.
    pub fn dispatch(&self, message: &[u8], self_notify: bool) -> FusionResult<()> {
        self.dispatch_channel(0, message, self_notify)
    }

    pub fn dispatch_channel(&self, channel: u32, message: &[u8], self_notify: bool) -> FusionResult<()> {
        let view = self.view()?;
        let region = self.mapped(&view)?;
        let header = self.header(&region)?;
        if message.len() > header.message_size.load(Ordering::Relaxed) as usize {
            return Err(FusionError::LimitExceeded("message exceeds the reactor message size"));
        }
        if is_reacting(&self.world, self.id) && !self.world.skirmish(&header.dispatch_lock).is_held() {
            return Err(FusionError::Busy);
        }
        let _dispatch = self.world.lock(&header.dispatch_lock)?;
        let header = self.header(&region)?;
        let listeners = {
            let _list = self.world.lock(&header.list_lock)?;
            snapshot(&view, header, channel)?
        };

        let me = self.world.fusion_id;
        let mut removed = Vec::new();
        for (owner, ids) in runs(&listeners) {
            if owner == me {
                if self_notify {
                    removed.extend(self.deliver_local(header, channel, &ids, message)?);
                }
            } else if !self.world.liveness.is_member_alive(owner) {
                debug!(reactor = %self.id, member = %owner, "pruning listeners of dead member");
                removed.extend(ids);
            } else {
                match self.deliver_to(owner, channel, &ids, message) {
                    Ok(gone) => removed.extend(gone),
                    Err(FusionError::Destroyed) => removed.extend(ids),
                    Err(err) => warn!(reactor = %self.id, member = %owner, "reaction delivery failed: {err}"),
                }
            }
        }

        if !removed.is_empty() {
            let _list = self.world.lock(&header.list_lock)?;
            remove_listeners(&view, header, |id, _| removed.contains(&id))?;
            for id in &removed {
                self.world.reactions.remove(self.id, *id);
            }
        }
        Ok(())
    }

    fn deliver_local(
        &self,
        header: &ReactorHeader,
        channel: u32,
        ids: &[ListenerId],
        message: &[u8],
    ) -> FusionResult<Vec<ListenerId>> {
        let own_call = CallId(self.world.reactor_call.load(Ordering::Acquire));
        let inline = header.direct.load(Ordering::Acquire) != 0
            || own_call.get() == 0
            || call::is_serving(&self.world, own_call);
        if inline {
            return Ok(react(&self.world, self.id, ids, message));
        }
        let reply = call::execute_member_call(
            &self.world,
            MemberCall::Reactions,
            self.world.fusion_id,
            CallFlags::NODIRECT,
            channel as i32,
            &encode_delivery(self.id, ids, message),
        )?;
        decode_ids(&reply.output)
    }

    fn deliver_to(
        &self,
        owner: FusionId,
        channel: u32,
        ids: &[ListenerId],
        message: &[u8],
    ) -> FusionResult<Vec<ListenerId>> {
        let reply = call::execute_member_call(
            &self.world,
            MemberCall::Reactions,
            owner,
            CallFlags::empty(),
            channel as i32,
            &encode_delivery(self.id, ids, message),
        )?;
        decode_ids(&reply.output)
    }

    /// Unregisters the reactor and frees its memory. Outstanding handles
    /// turn [`FusionError::Dead`].
    pub fn destroy(self) -> FusionResult<()> {
        destroy(&self.world, self.id, self.offset)
    }
}

impl fmt::Debug for Reactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reactor")
            .field("id", &self.id)
            .field("offset", &self.offset)
            .finish()
    }
}

pub(crate) fn create(world: &Arc<WorldInner>, message_size: u32) -> FusionResult<Reactor> {
    world.check_active()?;
    let header = world.header()?;
    let _registry = world.lock(&header.reactor_lock)?;
    let view = world.main_pool()?;
    let ptr = {
        let _pool = view.lock()?;
        view.allocate_locked(HEADER_SIZE, true)?
    };
    let region = view.region_for(ptr.offset, HEADER_SIZE)?;
    let reactor: &ReactorHeader = region.at(ptr.offset as usize)?;
    let id = ReactorId(header.next_reactor_id.fetch_add(1, Ordering::AcqRel));
    reactor.id.store(id.get(), Ordering::Relaxed);
    reactor.creator.store(world.fusion_id.get(), Ordering::Relaxed);
    reactor.message_size.store(message_size, Ordering::Relaxed);
    reactor.next_listener.store(1, Ordering::Relaxed);
    reactor.dispatch_lock.init(true);
    reactor.list_lock.init(true);
    reactor.next.store(header.reactors.load(Ordering::Acquire), Ordering::Relaxed);
    reactor.magic.store(REACTOR_MAGIC, Ordering::Release);
    header.reactors.store(ptr.offset, Ordering::Release);
    debug!(reactor = %id, message_size, "created reactor");
    Ok(Reactor {
        world: Arc::clone(world),
        id,
        offset: ptr.offset,
    })
}

pub(crate) fn handle(world: &Arc<WorldInner>, id: ReactorId, offset: u64) -> Reactor {
    Reactor {
        world: Arc::clone(world),
        id,
        offset,
    }
}

pub(crate) fn destroy(world: &WorldInner, id: ReactorId, offset: u64) -> FusionResult<()> {
    let view = world.main_pool()?;
    let region = view.region_for(offset, HEADER_SIZE)?;
    let reactor: &ReactorHeader = region.at(offset as usize)?;
    if reactor.magic.load(Ordering::Acquire) != REACTOR_MAGIC || reactor.id.load(Ordering::Acquire) != id.get() {
        return Err(FusionError::Dead);
    }
    let _dispatch = world.lock(&reactor.dispatch_lock)?;
    let header = world.header()?;
    let _registry = world.lock(&header.reactor_lock)?;
    if reactor.magic.load(Ordering::Acquire) != REACTOR_MAGIC {
        return Err(FusionError::Dead);
    }

    let next = reactor.next.load(Ordering::Acquire);
    let mut prev = None;
    let mut current = header.reactors.load(Ordering::Acquire);
    while current != 0 && current != offset {
        let region = view.region_for(current, HEADER_SIZE)?;
        prev = Some(current);
        current = region.at::<ReactorHeader>(current as usize)?.next.load(Ordering::Acquire);
    }
    match prev {
        _ if current == 0 => warn!(reactor = %id, "reactor missing from registry"),
        None => header.reactors.store(next, Ordering::Release),
        Some(prev) => view
            .region_for(prev, HEADER_SIZE)?
            .at::<ReactorHeader>(prev as usize)?
            .next
            .store(next, Ordering::Release),
    }

    let listeners = {
        let _list = world.lock(&reactor.list_lock)?;
        reactor.magic.store(0, Ordering::Release);
        reactor.count.store(0, Ordering::Relaxed);
        reactor.listeners.swap(0, Ordering::AcqRel)
    };
    {
        let _pool = view.lock()?;
        if listeners != 0 {
            view.deallocate_locked(ShmPtr::new(view.index as u16, listeners))?;
        }
        view.deallocate_locked(ShmPtr::new(view.index as u16, offset))?;
    }
    world.reactions.remove_reactor(id);
    debug!(reactor = %id, "destroyed reactor");
    Ok(())
}

/// Moves the listener array to one twice the size. Caller holds the list
/// lock.
fn grow_listeners(view: &PoolView<'_>, header: &ReactorHeader) -> FusionResult<()> {
    let capacity = header.capacity.load(Ordering::Relaxed);
    let count = u64::from(header.count.load(Ordering::Relaxed));
    let grown = capacity.saturating_mul(2).max(INITIAL_LISTENERS);
    let _pool = view.lock()?;
    let fresh = view.allocate_locked(u64::from(grown) * ENTRY_SIZE, true)?;
    let old = header.listeners.load(Ordering::Acquire);
    if old != 0 {
        let end = (old + count * ENTRY_SIZE).max(fresh.offset + count * ENTRY_SIZE);
        let region = view.region_for(0, end)?;
        region.copy_within(old as usize, fresh.offset as usize, (count * ENTRY_SIZE) as usize)?;
        view.deallocate_locked(ShmPtr::new(view.index as u16, old))?;
    }
    header.listeners.store(fresh.offset, Ordering::Release);
    header.capacity.store(grown, Ordering::Release);
    Ok(())
}

/// Listeners on `channel` in attach order. Caller holds the list lock.
fn snapshot(
    view: &PoolView<'_>,
    header: &ReactorHeader,
    channel: u32,
) -> FusionResult<Vec<(ListenerId, FusionId)>> {
    let count = u64::from(header.count.load(Ordering::Acquire));
    let base = header.listeners.load(Ordering::Acquire);
    if count == 0 {
        return Ok(Vec::new());
    }
    let region = view.region_for(base, count * ENTRY_SIZE)?;
    let mut listeners = Vec::with_capacity(count as usize);
    for i in 0..count {
        let entry: &ListenerEntry = region.at((base + i * ENTRY_SIZE) as usize)?;
        if entry.channel.load(Ordering::Relaxed) == channel {
            listeners.push((
                ListenerId(entry.id.load(Ordering::Relaxed)),
                FusionId(entry.fusion_id.load(Ordering::Relaxed)),
            ));
        }
    }
    Ok(listeners)
}

/// Drops every entry matching `doomed`, keeping the rest in order. Caller
/// holds the list lock.
fn remove_listeners(
    view: &PoolView<'_>,
    header: &ReactorHeader,
    doomed: impl Fn(ListenerId, FusionId) -> bool,
) -> FusionResult<usize> {
    let count = u64::from(header.count.load(Ordering::Acquire));
    if count == 0 {
        return Ok(0);
    }
    let base = header.listeners.load(Ordering::Acquire);
    let region = view.region_for(base, count * ENTRY_SIZE)?;
    let mut kept = 0u64;
    for i in 0..count {
        let entry: &ListenerEntry = region.at((base + i * ENTRY_SIZE) as usize)?;
        let id = ListenerId(entry.id.load(Ordering::Relaxed));
        let owner = FusionId(entry.fusion_id.load(Ordering::Relaxed));
        if doomed(id, owner) {
            continue;
        }
        if kept != i {
            let to: &ListenerEntry = region.at((base + kept * ENTRY_SIZE) as usize)?;
            to.id.store(id.get(), Ordering::Relaxed);
            to.fusion_id.store(owner.get(), Ordering::Relaxed);
            to.channel
                .store(entry.channel.load(Ordering::Relaxed), Ordering::Relaxed);
        }
        kept += 1;
    }
    header.count.store(kept as u32, Ordering::Release);
    Ok((count - kept) as usize)
}

type Run = (FusionId, SmallVec<[ListenerId; 4]>);

/// Consecutive listeners grouped by owning member.
fn runs(listeners: &[(ListenerId, FusionId)]) -> Vec<Run> {
    let mut runs: Vec<Run> = Vec::new();
    for &(id, owner) in listeners {
        match runs.last_mut() {
            Some((last, ids)) if *last == owner => ids.push(id),
            _ => runs.push((owner, smallvec![id])),
        }
    }
    runs
}

/// Runs the local reactions behind `ids` and returns those asking to be
/// removed. Listeners detached meanwhile are skipped.
fn react(world: &WorldInner, reactor: ReactorId, ids: &[ListenerId], message: &[u8]) -> Vec<ListenerId> {
    let _scope = Reacting::enter(world, reactor);
    let mut removed = Vec::new();
    for &id in ids {
        let Some(reaction) = world.reactions.get(reactor, id) else {
            continue;
        };
        if reaction.react(message) == ReactionResult::Remove {
            world.reactions.remove(reactor, id);
            removed.push(id);
        }
    }
    removed
}

fn encode_delivery(reactor: ReactorId, ids: &[ListenerId], message: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8 + ids.len() * 4 + message.len());
    buf.extend_from_slice(&reactor.get().to_le_bytes());
    buf.extend_from_slice(&(ids.len() as u32).to_le_bytes());
    for id in ids {
        buf.extend_from_slice(&id.get().to_le_bytes());
    }
    buf.extend_from_slice(message);
    buf
}

fn read_u32(buf: &[u8], at: usize) -> FusionResult<u32> {
    buf.get(at..at + 4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_le_bytes)
        .ok_or(FusionError::InvalidArgument("truncated reaction delivery"))
}

fn decode_delivery(buf: &[u8]) -> FusionResult<(ReactorId, Vec<ListenerId>, &[u8])> {
    let reactor = ReactorId(read_u32(buf, 0)?);
    let count = read_u32(buf, 4)? as usize;
    let ids = (0..count)
        .map(|i| read_u32(buf, 8 + i * 4).map(ListenerId))
        .collect::<FusionResult<Vec<_>>>()?;
    Ok((reactor, ids, &buf[8 + count * 4..]))
}

fn decode_ids(buf: &[u8]) -> FusionResult<Vec<ListenerId>> {
    if buf.len() % 4 != 0 {
        return Err(FusionError::InvalidArgument("truncated removal list"));
    }
    (0..buf.len() / 4)
        .map(|i| read_u32(buf, i * 4).map(ListenerId))
        .collect()
}

/// Body of every member's reactor call: runs the listed local reactions and
/// answers with the ids that asked to be removed.
pub(crate) fn deliver_remote(world: &WorldInner, request: CallRequest<'_>) -> CallResult {
    let (reactor, ids, message) = decode_delivery(request.input)?;
    let removed = react(world, reactor, &ids, message);
    let output: Vec<u8> = removed.iter().flat_map(|id| id.get().to_le_bytes()).collect();
    Ok(CallReply::with_output(0, output))
}

/// Drops every listener owned by `fusion_id`. A dead member's dispatch and
/// list locks are released first.
pub(crate) fn reap_member(world: &WorldInner, fusion_id: FusionId, dead: bool) -> FusionResult<()> {
    let header = world.header()?;
    let _registry = world.lock(&header.reactor_lock)?;
    let view = world.main_pool()?;
    let mut offset = header.reactors.load(Ordering::Acquire);
    let mut pruned = 0;
    while offset != 0 {
        let region = view.region_for(offset, HEADER_SIZE)?;
        let reactor: &ReactorHeader = region.at(offset as usize)?;
        if dead {
            reactor.dispatch_lock.release_if_held_by(fusion_id.get());
            reactor.list_lock.release_if_held_by(fusion_id.get());
        }
        {
            let _list = world.lock(&reactor.list_lock)?;
            pruned += remove_listeners(&view, reactor, |_, owner| owner == fusion_id)?;
        }
        offset = reactor.next.load(Ordering::Acquire);
    }
    if pruned > 0 {
        debug!(member = %fusion_id, pruned, "dropped listeners of departed member");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{wait_until, TestWorld};
    use crossbeam_channel::unbounded;
    use proptest::prelude::*;
    use std::time::Duration;

    fn recorder(log: &Arc<Mutex<Vec<String>>>, tag: &str, result: ReactionResult) -> impl Reaction {
        let log = Arc::clone(log);
        let tag = tag.to_owned();
        move |message: &[u8]| {
            log.lock()
                .push(format!("{tag}:{}", String::from_utf8_lossy(message)));
            result
        }
    }

    #[test]
    fn runs_group_consecutive_owners() {
        let a = FusionId(1);
        let b = FusionId(2);
        let listeners = [
            (ListenerId(1), a),
            (ListenerId(2), a),
            (ListenerId(3), b),
            (ListenerId(4), a),
        ];
        let expected: Vec<Run> = vec![
            (a, smallvec![ListenerId(1), ListenerId(2)]),
            (b, smallvec![ListenerId(3)]),
            (a, smallvec![ListenerId(4)]),
        ];
        assert_eq!(runs(&listeners), expected);
    }

    proptest! {
        #[test]
        fn runs_preserve_order_and_split_on_owner_change(
            owners in proptest::collection::vec(1u32..4, 0..40),
        ) {
            let listeners: Vec<_> = owners
                .iter()
                .enumerate()
                .map(|(i, &owner)| (ListenerId(i as u32 + 1), FusionId(owner)))
                .collect();
            let grouped = runs(&listeners);
            prop_assert!(grouped.windows(2).all(|w| w[0].0 != w[1].0));
            prop_assert!(grouped.iter().all(|(_, ids)| !ids.is_empty()));
            let flattened: Vec<_> = grouped
                .iter()
                .flat_map(|(owner, ids)| ids.iter().map(move |&id| (id, *owner)))
                .collect();
            prop_assert_eq!(flattened, listeners);
        }
    }

    #[test]
    fn delivery_encoding_round_trips() {
        let ids = [ListenerId(3), ListenerId(9)];
        let buf = encode_delivery(ReactorId(7), &ids, b"hello");
        let (reactor, decoded, message) = decode_delivery(&buf).expect("decode");
        assert_eq!(reactor, ReactorId(7));
        assert_eq!(decoded, ids);
        assert_eq!(message, b"hello");
        assert!(decode_delivery(&buf[..10]).is_err());
        assert!(decode_ids(&[1, 2, 3]).is_err());
    }

    #[test]
    fn listeners_across_members_see_attach_order() {
        let t = TestWorld::new("reactor-order");
        let p1 = t.enter();
        let p2 = t.enter();
        let log = Arc::new(Mutex::new(Vec::new()));

        let reactor = Reactor::new(&p1, 64).expect("reactor");
        let remote = Reactor::open(&p2, reactor.id()).expect("open");
        reactor.attach(recorder(&log, "l1", ReactionResult::Keep)).expect("l1");
        remote.attach(recorder(&log, "l2", ReactionResult::Keep)).expect("l2");
        reactor.attach(recorder(&log, "l3", ReactionResult::Keep)).expect("l3");
        assert_eq!(reactor.len().expect("len"), 3);

        reactor.dispatch(b"m", true).expect("dispatch");
        assert_eq!(*log.lock(), ["l1:m", "l2:m", "l3:m"]);

        log.lock().clear();
        remote.dispatch(b"n", false).expect("dispatch");
        assert_eq!(*log.lock(), ["l1:n", "l3:n"]);
    }

    #[test]
    fn remove_detaches_within_the_same_pass() {
        let t = TestWorld::new("reactor-remove");
        let p1 = t.enter();
        let p2 = t.enter();
        let log = Arc::new(Mutex::new(Vec::new()));

        let reactor = Reactor::new(&p1, 64).expect("reactor");
        let remote = Reactor::open(&p2, reactor.id()).expect("open");
        reactor.attach(recorder(&log, "once", ReactionResult::Remove)).expect("once");
        remote.attach(recorder(&log, "remote-once", ReactionResult::Remove)).expect("remote");
        reactor.attach(recorder(&log, "always", ReactionResult::Keep)).expect("always");

        reactor.dispatch(b"1", true).expect("first");
        assert_eq!(reactor.len().expect("len"), 1);
        reactor.dispatch(b"2", true).expect("second");
        assert_eq!(*log.lock(), ["once:1", "remote-once:1", "always:1", "always:2"]);
    }

    #[test]
    fn channels_and_detach_filter_delivery() {
        let t = TestWorld::new("reactor-channel");
        let p1 = t.enter();
        let log = Arc::new(Mutex::new(Vec::new()));
        let reactor = Reactor::new(&p1, 16).expect("reactor");
        reactor.set_direct(true).expect("direct");
        let zero = reactor.attach(recorder(&log, "zero", ReactionResult::Keep)).expect("zero");
        reactor
            .attach_channel(5, recorder(&log, "five", ReactionResult::Keep))
            .expect("five");

        reactor.dispatch_channel(5, b"x", true).expect("dispatch 5");
        reactor.detach(zero).expect("detach");
        assert!(matches!(reactor.detach(zero), Err(FusionError::ItemNotFound)));
        reactor.dispatch(b"y", true).expect("dispatch 0");
        assert_eq!(*log.lock(), ["five:x"]);

        assert!(matches!(
            reactor.dispatch(&[0; 17], true),
            Err(FusionError::LimitExceeded(_))
        ));
    }

    #[test]
    fn indirect_local_delivery_runs_on_the_reactor_worker() {
        let t = TestWorld::new("reactor-indirect");
        let p1 = t.enter();
        let (tx, rx) = unbounded();
        let reactor = Reactor::new(&p1, 16).expect("reactor");
        reactor
            .attach(move |_: &[u8]| {
                let name = std::thread::current().name().map(str::to_owned);
                tx.send(name).expect("send");
                ReactionResult::Keep
            })
            .expect("attach");

        reactor.dispatch(b"", true).expect("indirect");
        let name = rx.recv_timeout(Duration::from_secs(5)).expect("delivered");
        assert!(name.is_some_and(|n| n.starts_with("fusion-call-")));

        reactor.set_direct(true).expect("direct");
        reactor.dispatch(b"", true).expect("direct");
        let name = rx.recv_timeout(Duration::from_secs(5)).expect("delivered");
        assert_eq!(name, std::thread::current().name().map(str::to_owned));
    }

    #[test]
    fn dispatch_from_a_worker_reaction_on_the_same_reactor_is_busy() {
        let t = TestWorld::new("reactor-reentry");
        let p1 = t.enter();
        let p2 = t.enter();
        let (tx, rx) = unbounded();
        let reactor = Reactor::new(&p1, 16).expect("reactor");
        let nested = Arc::new(Mutex::new(Some(Reactor::open(&p2, reactor.id()).expect("open"))));
        Reactor::open(&p2, reactor.id())
            .expect("open")
            .attach(move |message: &[u8]| {
                if let Some(inner) = nested.lock().take() {
                    tx.send(inner.dispatch(message, true)).expect("send");
                }
                ReactionResult::Keep
            })
            .expect("attach");

        reactor.dispatch(b"outer", true).expect("dispatch");
        let nested = rx.recv_timeout(Duration::from_secs(5)).expect("delivered");
        assert!(matches!(nested, Err(FusionError::Busy)));
        reactor.dispatch(b"again", true).expect("lock released");
    }

    #[test]
    fn direct_reaction_may_dispatch_on_its_own_reactor() {
        let t = TestWorld::new("reactor-direct-reentry");
        let p1 = t.enter();
        let log = Arc::new(Mutex::new(Vec::new()));
        let reactor = Reactor::new(&p1, 16).expect("reactor");
        reactor.set_direct(true).expect("direct");
        reactor.attach(recorder(&log, "L1", ReactionResult::Keep)).expect("attach");
        let nested = Arc::new(Mutex::new(Some(reactor.clone())));
        reactor
            .attach(move |_: &[u8]| {
                if let Some(inner) = nested.lock().take() {
                    inner.dispatch(b"inner", true).expect("nested dispatch");
                }
                ReactionResult::Keep
            })
            .expect("attach");

        reactor.dispatch(b"outer", true).expect("dispatch");
        assert_eq!(*log.lock(), ["L1:outer", "L1:inner"]);
    }

    #[test]
    fn listeners_of_a_dead_member_are_pruned() {
        let t = TestWorld::new("reactor-dead");
        let p1 = t.enter();
        let p2 = t.enter();
        let reactor = Reactor::new(&p1, 16).expect("reactor");
        let remote = Reactor::open(&p2, reactor.id()).expect("open");
        remote.attach(|_: &[u8]| ReactionResult::Keep).expect("attach");
        drop(remote);
        p2.abandon();

        assert!(wait_until(Duration::from_secs(5), || {
            reactor.len().is_ok_and(|n| n == 0)
        }));
        reactor.dispatch(b"", true).expect("dispatch after reap");
    }

    #[test]
    fn destroyed_reactors_turn_dead() {
        let t = TestWorld::new("reactor-destroy");
        let p1 = t.enter();
        let first = Reactor::new(&p1, 8).expect("first");
        let second = Reactor::new(&p1, 8).expect("second");
        second.attach(|_: &[u8]| ReactionResult::Keep).expect("attach");
        let stale = second.clone();
        let id = second.id();
        second.destroy().expect("destroy");

        assert!(matches!(stale.dispatch(b"", true), Err(FusionError::Dead)));
        assert!(matches!(Reactor::open(&p1, id), Err(FusionError::ItemNotFound)));
        Reactor::open(&p1, first.id()).expect("first survives");
    }
}
