//! Supervision: dead member detection, master election and reaping.

use super::layout::{
    ArenaEntry, ObjectPoolEntry, PoolEntry, WorldHeader, MAX_ARENAS, MAX_MEMBERS,
    MAX_OBJECT_POOLS, MAX_POOLS, MEMBER_ACTIVE, MEMBER_EMPTY, MEMBER_REAPING, RECOVERY_DESTROY,
    WORLD_ACTIVE, WORLD_DESTROYED,
};
use super::WorldInner;
use crate::object::{self, Doomed};
use crate::{arena, call, reactor, FusionId, FusionResult};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Departure {
    /// The member is leaving through [`crate::World::exit`].
    Graceful,
    /// The member stopped heartbeating or its process is gone.
    Dead,
}

/// One watch-thread pass: notice world destruction or our own removal,
/// replace a dead master, and let the master reap dead members.
pub(super) fn supervise(world: &Arc<WorldInner>) -> FusionResult<()> {
    let header = world.header()?;
    if header.state.load(Ordering::Acquire) == WORLD_DESTROYED {
        world.mark_destroyed();
        return Ok(());
    }
    let own = world.own_member()?;
    if own.state.load(Ordering::Acquire) != MEMBER_ACTIVE
        || own.fusion_id.load(Ordering::Acquire) != world.fusion_id.get()
    {
        warn!(world = %world.name, fusion_id = %world.fusion_id, "this member was reaped");
        world.mark_destroyed();
        return Ok(());
    }

    let dead = dead_members(world)?;
    let master = FusionId(header.master.load(Ordering::Acquire));
    let master_lost = !world.liveness.is_member_alive(master);
    if dead.is_empty() && !master_lost {
        return Ok(());
    }

    let mut doomed = Vec::new();
    {
        let _guard = world.lock(&header.world_lock)?;
        if master_lost {
            elect(world, header, master);
        }
        if header.state.load(Ordering::Acquire) != WORLD_ACTIVE {
            drop(_guard);
            world.mark_destroyed();
            return Ok(());
        }
        if header.master.load(Ordering::Acquire) == world.fusion_id.get() {
            for (slot, fusion_id) in dead_members(world)? {
                warn!(world = %world.name, dead = %fusion_id, "reaping dead member");
                doomed.extend(reap(world, slot, fusion_id, Departure::Dead));
            }
        }
    }
    object::finish_destruction(doomed);
    Ok(())
}

fn dead_members(world: &WorldInner) -> FusionResult<Vec<(usize, FusionId)>> {
    let mut dead = Vec::new();
    for slot in 0..MAX_MEMBERS {
        if slot == world.slot {
            continue;
        }
        let entry = world.member(slot)?;
        if entry.state.load(Ordering::Acquire) == MEMBER_ACTIVE && !world.liveness.entry_alive(entry)
        {
            dead.push((slot, FusionId(entry.fusion_id.load(Ordering::Acquire))));
        }
    }
    Ok(dead)
}

/// Applies the recovery policy after the master vanished. Caller holds the
/// world lock.
fn elect(world: &WorldInner, header: &WorldHeader, lost: FusionId) {
    if header.master.load(Ordering::Acquire) != lost.get()
        || world.liveness.is_member_alive(lost)
    {
        return;
    }
    if header.recovery.load(Ordering::Acquire) == RECOVERY_DESTROY {
        header.state.store(WORLD_DESTROYED, Ordering::Release);
        warn!(world = %world.name, master = %lost, "master died, world destroyed");
        return;
    }
    if let Some(next) = world.live_members().into_iter().min() {
        header.master.store(next.get(), Ordering::Release);
        warn!(world = %world.name, dead = %lost, master = %next, "promoted new master");
    }
}

/// Removes every trace of the member in `slot`. Caller holds the world lock.
/// Objects whose last reference belonged to the member are returned for
/// destruction once the lock is released.
pub(crate) fn reap(
    world: &Arc<WorldInner>,
    slot: usize,
    fusion_id: FusionId,
    departure: Departure,
) -> Vec<Doomed> {
    let Ok(entry) = world.member(slot) else {
        return Vec::new();
    };
    if entry.state.load(Ordering::Acquire) != MEMBER_ACTIVE
        || entry.fusion_id.load(Ordering::Acquire) != fusion_id.get()
    {
        return Vec::new();
    }
    entry.state.store(MEMBER_REAPING, Ordering::Release);

    if departure == Departure::Dead {
        release_locks(world, fusion_id);
    }
    let doomed = object::reap_member(world, slot, departure == Departure::Dead)
        .unwrap_or_else(|err| {
            warn!(member = %fusion_id, "dropping object references failed: {err}");
            Vec::new()
        });
    if let Err(err) = call::reap_member(world, fusion_id) {
        warn!(member = %fusion_id, "failing pending calls failed: {err}");
    }
    if let Err(err) = arena::reap_member(world, slot) {
        warn!(member = %fusion_id, "dropping arena holdership failed: {err}");
    }
    if let Err(err) = reactor::reap_member(world, fusion_id, departure == Departure::Dead) {
        warn!(member = %fusion_id, "pruning listeners failed: {err}");
    }
    if let Ok(inbox) = world.inbox(slot) {
        inbox.reset();
    }
    entry.inbox_lock.release_if_held_by(fusion_id.get());

    entry.reactor_call.store(0, Ordering::Relaxed);
    entry.destroy_call.store(0, Ordering::Relaxed);
    entry.pid.store(0, Ordering::Relaxed);
    entry.heartbeat.store(0, Ordering::Relaxed);
    entry.fusion_id.store(0, Ordering::Relaxed);
    entry.state.store(MEMBER_EMPTY, Ordering::Release);
    debug!(member = %fusion_id, slot, ?departure, "member removed");
    doomed
}

/// Frees every world-level lock a dead member still holds.
fn release_locks(world: &WorldInner, fusion_id: FusionId) {
    let id = fusion_id.get();
    let segment = &world.segment;
    let layout = &world.layout;
    let mut released = 0;
    if let Ok(header) = world.header() {
        for raw in [&header.call_lock, &header.reactor_lock] {
            released += usize::from(raw.release_if_held_by(id));
        }
    }
    for index in 0..MAX_POOLS {
        if let Ok(entry) = segment.at::<PoolEntry>(layout.pool(index)) {
            released += usize::from(entry.lock.release_if_held_by(id));
        }
    }
    for index in 0..MAX_ARENAS {
        if let Ok(entry) = segment.at::<ArenaEntry>(layout.arena(index)) {
            released += usize::from(entry.lock.release_if_held_by(id));
        }
    }
    for index in 0..MAX_OBJECT_POOLS {
        if let Ok(entry) = segment.at::<ObjectPoolEntry>(layout.object_pool(index)) {
            released += usize::from(entry.lock.release_if_held_by(id));
        }
    }
    for slot in 0..MAX_MEMBERS {
        if let Ok(entry) = world.member(slot) {
            released += usize::from(entry.inbox_lock.release_if_held_by(id));
        }
    }
    if released > 0 {
        warn!(member = %fusion_id, released, "released locks held by dead member");
    }
}

#[cfg(test)]
mod tests {
    use crate::testing::{wait_until, TestWorld};
    use crate::ShmPool;
    use std::time::Duration;

    #[test]
    fn locks_held_by_a_dead_member_are_recovered() {
        let t = TestWorld::new("reap-locks");
        let p1 = t.enter();
        let p2 = t.enter();
        let pool = ShmPool::create(&p2, "contended", 1 << 20, false).expect("create");
        let guard = pool.lock().expect("lock");
        std::mem::forget(guard);
        std::mem::forget(pool);
        p2.abandon();

        assert!(wait_until(Duration::from_secs(5), || {
            p1.members().is_ok_and(|m| m.len() == 1)
        }));
        let pool = ShmPool::attach(&p1, "contended").expect("attach");
        pool.allocate(128, false, true).expect("lock is free again");
    }
}
