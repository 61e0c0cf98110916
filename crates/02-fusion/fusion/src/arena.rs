//! Named rendezvous with exactly-once initialisation.
//!
//! The first member to take an arena's lock while it is `INITIALIZING` runs
//! the initializer; everyone after it joins. The last holder to exit runs
//! the shutdown callback and returns the entry to the table.
//!
//! The arena lock is taken after the world lock has been released, never
//! under it. The reaper, which does hold the world lock, only try-locks.

use crate::pool;
use crate::world::layout::{
    ArenaEntry, FieldEntry, ARENA_EMPTY, ARENA_INITIALIZING, ARENA_READY, MAX_ARENAS,
};
use crate::world::{World, WorldInner};
use crate::{FusionError, FusionResult, ShmPtr};
use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::debug;

/// A member's holdership of one arena.
pub struct Arena {
    world: Arc<WorldInner>,
    index: usize,
    generation: u32,
    name: String,
}

impl Arena {
    /// Enters `name`, running `initialize` if this member is first and
    /// `join` otherwise. A failing initializer leaves no arena behind.
    pub fn enter(
        world: &World,
        name: &str,
        initialize: impl FnOnce(&Arena) -> FusionResult<()>,
        join: impl FnOnce(&Arena) -> FusionResult<()>,
    ) -> FusionResult<Arena> {
        let inner = world.inner();
        pool::check_name(name)?;
        let mut initialize = Some(initialize);
        let mut join = Some(join);
        loop {
            inner.check_active()?;
            let (index, generation) = claim(inner, name)?;
            let arena = Arena {
                world: Arc::clone(inner),
                index,
                generation,
                name: name.to_owned(),
            };
            {
                let entry = arena.entry_raw()?;
                let _lock = inner.lock(&entry.lock)?;
                let state = entry.state.load(Ordering::Acquire);
                if state == ARENA_EMPTY
                    || entry.generation.load(Ordering::Acquire) != generation
                    || !entry.name.matches(name)
                {
                    debug!(arena = name, "arena vanished while entering, retrying");
                    continue;
                }
                let bit = 1u32 << inner.slot;
                if entry.holders.load(Ordering::Acquire) & bit != 0 {
                    return Err(FusionError::InvalidArgument("arena already entered by this member"));
                }

                if state == ARENA_INITIALIZING {
                    let Some(initialize) = initialize.take() else {
                        return Err(FusionError::Failed);
                    };
                    if let Err(err) = initialize(&arena) {
                        debug!(arena = name, "arena initializer failed: {err}");
                        arena.release_entry()?;
                        return Err(err);
                    }
                    entry.state.store(ARENA_READY, Ordering::Release);
                    debug!(arena = name, index, "initialized arena");
                } else {
                    let Some(join) = join.take() else {
                        return Err(FusionError::Failed);
                    };
                    join(&arena)?;
                    debug!(arena = name, index, "joined arena");
                }
                entry.holders.fetch_or(bit, Ordering::AcqRel);
                entry.count.fetch_add(1, Ordering::AcqRel);
            }
            return Ok(arena);
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn entry_raw(&self) -> FusionResult<&ArenaEntry> {
        Ok(self.world.segment.at(self.world.layout.arena(self.index))?)
    }

    fn entry(&self) -> FusionResult<&ArenaEntry> {
        let entry = self.entry_raw()?;
        if entry.state.load(Ordering::Acquire) == ARENA_EMPTY
            || entry.generation.load(Ordering::Acquire) != self.generation
        {
            return Err(FusionError::Dead);
        }
        Ok(entry)
    }

    /// Members currently holding the arena.
    pub fn holders(&self) -> FusionResult<u32> {
        Ok(self.entry()?.count.load(Ordering::Acquire))
    }

    /// Stores `value` under `name`, replacing an existing field of that name.
    pub fn add_shared_field(&self, name: &str, value: u64) -> FusionResult<()> {
        pool::check_name(name)?;
        let entry = self.entry()?;
        let _lock = self.world.lock(&entry.lock)?;
        let entry = self.entry()?;
        let field = match find_field(entry, name) {
            Some(field) => field,
            None => {
                let field = entry
                    .fields
                    .iter()
                    .find(|f| f.used.load(Ordering::Acquire) == 0)
                    .ok_or(FusionError::LimitExceeded("arena field table is full"))?;
                field.name.store(name)?;
                field
            }
        };
        field.value.store(value, Ordering::Release);
        field.used.store(1, Ordering::Release);
        Ok(())
    }

    pub fn get_shared_field(&self, name: &str) -> FusionResult<u64> {
        let entry = self.entry()?;
        let _lock = self.world.lock(&entry.lock)?;
        find_field(self.entry()?, name)
            .map(|field| field.value.load(Ordering::Acquire))
            .ok_or(FusionError::ItemNotFound)
    }

    pub fn add_shared_ptr(&self, name: &str, ptr: ShmPtr) -> FusionResult<()> {
        self.add_shared_field(name, ptr.pack())
    }

    pub fn get_shared_ptr(&self, name: &str) -> FusionResult<ShmPtr> {
        self.get_shared_field(name).map(ShmPtr::unpack)
    }

    /// Gives up holdership. The last holder, or any holder when `emergency`
    /// is set, runs `shutdown` and frees the arena; the others run `leave`.
    /// The arena is released even when the callback fails.
    pub fn exit(
        self,
        shutdown: impl FnOnce(&Arena, bool) -> FusionResult<()>,
        leave: impl FnOnce(&Arena, bool) -> FusionResult<()>,
        emergency: bool,
    ) -> FusionResult<()> {
        let entry = self.entry()?;
        let _lock = self.world.lock(&entry.lock)?;
        let entry = self.entry()?;
        let bit = 1u32 << self.world.slot;
        if entry.holders.fetch_and(!bit, Ordering::AcqRel) & bit == 0 {
            return Err(FusionError::InvalidArgument("arena not held by this member"));
        }
        let remaining = entry.count.fetch_sub(1, Ordering::AcqRel).saturating_sub(1);
        if remaining == 0 || emergency {
            let result = shutdown(&self, emergency);
            self.release_entry()?;
            debug!(arena = %self.name, emergency, "shut arena down");
            result
        } else {
            debug!(arena = %self.name, remaining, "left arena");
            leave(&self, emergency)
        }
    }

    /// Returns the entry to the table. Caller holds the arena lock.
    fn release_entry(&self) -> FusionResult<()> {
        let header = self.world.header()?;
        let _guard = self.world.lock(&header.world_lock)?;
        clear(self.entry_raw()?);
        Ok(())
    }
}

impl fmt::Debug for Arena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena")
            .field("name", &self.name)
            .field("index", &self.index)
            .finish()
    }
}

fn find_field<'e>(entry: &'e ArenaEntry, name: &str) -> Option<&'e FieldEntry> {
    entry
        .fields
        .iter()
        .find(|f| f.used.load(Ordering::Acquire) != 0 && f.name.matches(name))
}

fn clear(entry: &ArenaEntry) {
    for field in &entry.fields {
        field.used.store(0, Ordering::Relaxed);
        field.value.store(0, Ordering::Relaxed);
        field.name.clear();
    }
    entry.holders.store(0, Ordering::Relaxed);
    entry.count.store(0, Ordering::Relaxed);
    entry.name.clear();
    entry.state.store(ARENA_EMPTY, Ordering::Release);
}

/// Finds the arena `name` or claims an empty entry for it.
fn claim(world: &WorldInner, name: &str) -> FusionResult<(usize, u32)> {
    let header = world.header()?;
    let _guard = world.lock(&header.world_lock)?;
    let mut empty = None;
    for index in 0..MAX_ARENAS {
        let entry: &ArenaEntry = world.segment.at(world.layout.arena(index))?;
        match entry.state.load(Ordering::Acquire) {
            ARENA_EMPTY => {
                empty.get_or_insert((index, entry));
            }
            _ if entry.name.matches(name) => {
                return Ok((index, entry.generation.load(Ordering::Acquire)));
            }
            _ => {}
        }
    }
    let (index, entry) = empty.ok_or(FusionError::LimitExceeded("arena table is full"))?;
    // Late waiters may still sit on the lock of a released entry.
    if entry.generation.load(Ordering::Acquire) == 0 {
        entry.lock.init(true);
    }
    let generation = entry.generation.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
    clear(entry);
    entry.name.store(name)?;
    entry.state.store(ARENA_INITIALIZING, Ordering::Release);
    Ok((index, generation))
}

/// Drops the holdership of the member in `slot`. An arena left without
/// holders is freed if its lock is available. Caller holds the world lock.
pub(crate) fn reap_member(world: &WorldInner, slot: usize) -> FusionResult<()> {
    let bit = 1u32 << slot;
    for index in 0..MAX_ARENAS {
        let entry: &ArenaEntry = world.segment.at(world.layout.arena(index))?;
        if entry.state.load(Ordering::Acquire) == ARENA_EMPTY
            || entry.holders.fetch_and(!bit, Ordering::AcqRel) & bit == 0
        {
            continue;
        }
        let remaining = entry.count.fetch_sub(1, Ordering::AcqRel).saturating_sub(1);
        if remaining > 0 {
            continue;
        }
        let lock = world.skirmish(&entry.lock);
        if lock.try_lock()? {
            let name = entry.name.load();
            clear(entry);
            lock.unlock()?;
            debug!(arena = %name, "released arena without holders");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{wait_until, TestWorld};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    fn ok(_: &Arena) -> FusionResult<()> {
        Ok(())
    }

    fn ok_exit(_: &Arena, _: bool) -> FusionResult<()> {
        Ok(())
    }

    #[test]
    fn exactly_one_member_initializes() {
        let t = TestWorld::new("arena-once");
        let worlds = (0..4).map(|_| t.enter()).collect::<Vec<_>>();
        let inits = Arc::new(AtomicUsize::new(0));
        let joins = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(worlds.len()));

        let arenas = thread::scope(|scope| {
            let handles = worlds
                .iter()
                .map(|world| {
                    let (inits, joins, barrier) = (&inits, &joins, &barrier);
                    scope.spawn(move || {
                        barrier.wait();
                        Arena::enter(
                            world,
                            "core",
                            |arena| {
                                inits.fetch_add(1, Ordering::SeqCst);
                                arena.add_shared_field("shared", 42)
                            },
                            |_| {
                                joins.fetch_add(1, Ordering::SeqCst);
                                Ok(())
                            },
                        )
                        .expect("enter")
                    })
                })
                .collect::<Vec<_>>();
            handles
                .into_iter()
                .map(|h| h.join().expect("join thread"))
                .collect::<Vec<_>>()
        });

        assert_eq!(inits.load(Ordering::SeqCst), 1);
        assert_eq!(joins.load(Ordering::SeqCst), 3);
        for arena in &arenas {
            assert_eq!(arena.get_shared_field("shared").expect("field"), 42);
        }
        assert_eq!(arenas[0].holders().expect("holders"), 4);
    }

    #[test]
    fn failed_initializer_leaves_no_arena() {
        let t = TestWorld::new("arena-fail");
        let p1 = t.enter();
        let err = Arena::enter(&p1, "flaky", |_| Err(FusionError::OutOfMemory), ok)
            .expect_err("initializer fails");
        assert!(matches!(err, FusionError::OutOfMemory));

        let inits = AtomicUsize::new(0);
        Arena::enter(
            &p1,
            "flaky",
            |_| {
                inits.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            ok,
        )
        .expect("second enter");
        assert_eq!(inits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn fields_replace_and_report_missing() {
        let t = TestWorld::new("arena-fields");
        let p1 = t.enter();
        let arena = Arena::enter(&p1, "fields", ok, ok).expect("enter");
        arena.add_shared_field("x", 1).expect("add");
        arena.add_shared_field("x", 2).expect("replace");
        assert_eq!(arena.get_shared_field("x").expect("get"), 2);
        assert!(matches!(arena.get_shared_field("y"), Err(FusionError::ItemNotFound)));

        let ptr = ShmPtr::new(2, 0x400);
        arena.add_shared_ptr("ptr", ptr).expect("ptr");
        assert_eq!(arena.get_shared_ptr("ptr").expect("ptr"), ptr);

        for i in 2..16 {
            arena.add_shared_field(&format!("f{i}"), i).expect("fill");
        }
        assert!(matches!(
            arena.add_shared_field("overflow", 0),
            Err(FusionError::LimitExceeded(_))
        ));
        assert!(matches!(
            arena.add_shared_field(&"n".repeat(40), 0),
            Err(FusionError::InvalidArgument(_))
        ));
    }

    #[test]
    fn last_holder_shuts_down_and_emergency_forces_it() {
        let t = TestWorld::new("arena-exit");
        let p1 = t.enter();
        let p2 = t.enter();
        let log = parking_lot::Mutex::new(Vec::new());
        let record = |what: &'static str| {
            let log = &log;
            move |_: &Arena, emergency: bool| -> FusionResult<()> {
                log.lock().push((what, emergency));
                Ok(())
            }
        };

        let a1 = Arena::enter(&p1, "shared", ok, ok).expect("p1");
        let a2 = Arena::enter(&p2, "shared", ok, ok).expect("p2");
        a1.exit(record("shutdown"), record("leave"), false).expect("exit p1");
        a2.exit(record("shutdown"), record("leave"), false).expect("exit p2");
        assert_eq!(*log.lock(), [("leave", false), ("shutdown", false)]);

        log.lock().clear();
        let a1 = Arena::enter(&p1, "shared", ok, ok).expect("p1 again");
        let a2 = Arena::enter(&p2, "shared", ok, ok).expect("p2 again");
        a1.exit(record("shutdown"), record("leave"), true).expect("emergency");
        assert_eq!(*log.lock(), [("shutdown", true)]);
        assert!(matches!(a2.holders(), Err(FusionError::Dead)));
    }

    #[test]
    fn arena_of_a_dead_sole_holder_is_released() {
        let t = TestWorld::new("arena-reap");
        let p1 = t.enter();
        let p2 = t.enter();
        let held = Arena::enter(&p2, "orphan", ok, ok).expect("enter");
        std::mem::forget(held);
        p2.abandon();

        assert!(wait_until(Duration::from_secs(5), || {
            p1.members().is_ok_and(|m| m.len() == 1)
        }));
        let inits = AtomicUsize::new(0);
        let arena = Arena::enter(
            &p1,
            "orphan",
            |_| {
                inits.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            ok,
        )
        .expect("enter again");
        assert_eq!(inits.load(Ordering::SeqCst), 1);
        arena.exit(ok_exit, ok_exit, false).expect("exit");
    }
}
