//! World membership, master role and the ordered enter / exit sequence.
//!
//! A world is a segment file `fusion.<name>` in the configured shared memory
//! directory. The first member to create it is the master and lays out the
//! tables; later members map the same file and register in the member table.
//! Each member runs two threads: a dispatcher draining its inbox ring and a
//! watch thread that heartbeats and reaps dead peers.

pub(crate) mod layout;
pub(crate) mod liveness;
mod watch;

use crate::call::{self, MemberCall};
use crate::lifecycle::Lifecycle;
use crate::object::LocalDestructors;
use crate::pool::{self, PoolMapping, ShmPool};
use crate::reactor::LocalReactions;
use crate::{FusionConfig, FusionError, FusionId, FusionResult, MasterRecovery};
use crossbeam_channel::{bounded, Receiver, Sender};
use fusion_shm::{
    LockOwner, MsgRing, SharedRegion, ShmError, Skirmish, SkirmishGuard, SkirmishRaw, SlotPool,
};
use layout::{
    Layout, MemberEntry, WorldHeader, MAX_MEMBERS, MEMBER_ACTIVE, MEMBER_EMPTY,
    RECOVERY_DESTROY, RECOVERY_PROMOTE, WORLD_ACTIVE, WORLD_DESTROYED, WORLD_INITIALIZING,
    WORLD_MAGIC, WORLD_VERSION,
};
use liveness::{now_nanos, Liveness};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const MAIN_POOL_NAME: &str = "main";
const MAIN_POOL_GROWTH: u64 = 64;

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

/// A member's view of a world. Dropping it exits the world.
pub struct World {
    inner: Arc<WorldInner>,
    lifecycle: Mutex<Lifecycle>,
}

/// Snapshot of one member table entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemberInfo {
    pub fusion_id: FusionId,
    pub pid: u32,
    pub is_master: bool,
}

/// Process-wide state behind a [`World`] handle, shared with its threads.
pub(crate) struct WorldInner {
    pub name: String,
    pub config: FusionConfig,
    pub segment: Arc<SharedRegion>,
    pub layout: Layout,
    pub fusion_id: FusionId,
    pub slot: usize,
    pub owner: LockOwner,
    pub liveness: Arc<Liveness>,
    /// Distinguishes worlds entered by the same process.
    pub token: u64,
    pub pools: Mutex<HashMap<usize, Arc<PoolMapping>>>,
    pub calls: call::LocalCalls,
    pub reactions: LocalReactions,
    pub destructors: LocalDestructors,
    pub reactor_call: AtomicU32,
    pub destroy_call: AtomicU32,
    stop: AtomicBool,
    destroyed: AtomicBool,
    ticker: Mutex<Option<Sender<()>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl World {
    /// Enters (or creates) the world called `name`.
    pub fn enter(name: &str, config: FusionConfig) -> FusionResult<World> {
        config.validate()?;
        check_world_name(name)?;
        let path = config.shm_dir.join(format!("fusion.{name}"));
        let mut lifecycle = Lifecycle::new();

        let (segment, created) = attach_segment(&path, &config)?;
        let segment = Arc::new(segment);
        {
            let segment = Arc::clone(&segment);
            let path = path.clone();
            lifecycle.push("segment", move || {
                let destroyed = segment
                    .at::<WorldHeader>(0)
                    .is_ok_and(|h| h.state.load(Ordering::Acquire) == WORLD_DESTROYED);
                if destroyed {
                    if let Err(err) = SharedRegion::unlink(&path) {
                        warn!(path = %path.display(), "failed to unlink world: {err}");
                    }
                }
            });
        }

        let header: &WorldHeader = segment.at(0)?;
        let layout = Layout::from_header(header);
        if created {
            format_tables(&segment, &layout)?;
            let segment = Arc::clone(&segment);
            lifecycle.push("tables", move || {
                if let Ok(header) = segment.at::<WorldHeader>(0) {
                    let _ = header.state.compare_exchange(
                        WORLD_INITIALIZING,
                        WORLD_DESTROYED,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    );
                }
            });
        }

        let interval = Duration::from_millis(header.heartbeat_ms.load(Ordering::Acquire).max(1));
        let liveness = Arc::new(Liveness::new(Arc::clone(&segment), layout, interval));
        let fusion_id = FusionId(header.next_fusion_id.fetch_add(1, Ordering::AcqRel));
        let owner = LockOwner::new(fusion_id.get(), liveness.clone(), interval);
        let slot = register_member(&segment, &layout, &owner, fusion_id, created)?;

        let inner = Arc::new(WorldInner {
            name: name.to_owned(),
            config,
            segment: Arc::clone(&segment),
            layout,
            fusion_id,
            slot,
            owner,
            liveness,
            token: NEXT_TOKEN.fetch_add(1, Ordering::Relaxed),
            pools: Mutex::new(HashMap::new()),
            calls: call::LocalCalls::default(),
            reactions: LocalReactions::default(),
            destructors: LocalDestructors::default(),
            reactor_call: AtomicU32::new(0),
            destroy_call: AtomicU32::new(0),
            stop: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            ticker: Mutex::new(None),
            threads: Mutex::new(Vec::new()),
        });
        {
            let inner = Arc::clone(&inner);
            lifecycle.push("member", move || {
                if let Err(err) = inner.leave() {
                    warn!(world = %inner.name, "leaving failed: {err}");
                }
            });
        }

        if created {
            inner.create_main_pool()?;
            let inner = Arc::clone(&inner);
            lifecycle.push("main-pool", move || inner.pools.lock().clear());
        }

        for (step, kind) in [
            ("reactor-call", MemberCall::Reactions),
            ("destroy-call", MemberCall::Destructors),
        ] {
            call::install_member_call(&inner, kind)?;
            let inner = Arc::clone(&inner);
            lifecycle.push(step, move || call::remove_member_call(&inner, kind));
        }

        inner.spawn_threads()?;
        {
            let inner = Arc::clone(&inner);
            lifecycle.push("threads", move || inner.stop_threads());
        }

        if created {
            header.state.store(WORLD_ACTIVE, Ordering::Release);
        }
        info!(world = name, fusion_id = %fusion_id, master = created, "entered world");
        Ok(World {
            inner,
            lifecycle: Mutex::new(lifecycle),
        })
    }

    /// Enters `name` with configuration read from `FUSION_*` variables.
    pub fn enter_default(name: &str) -> FusionResult<World> {
        Self::enter(name, FusionConfig::from_env()?)
    }

    /// Leaves the world, running the teardown steps in reverse order. The
    /// last member to leave removes the segment and every pool file.
    pub fn exit(self) -> FusionResult<()> {
        self.lifecycle.lock().unwind();
        Ok(())
    }

    /// Stops this member's threads without the leave handshake, as if the
    /// process had crashed. Survivors reap it once its heartbeat goes stale.
    pub fn abandon(self) {
        warn!(world = %self.inner.name, fusion_id = %self.inner.fusion_id, "abandoning world");
        self.inner.stop_threads();
        self.inner.mark_destroyed();
        self.lifecycle.lock().forget();
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn fusion_id(&self) -> FusionId {
        self.inner.fusion_id
    }

    pub fn config(&self) -> &FusionConfig {
        &self.inner.config
    }

    pub fn master(&self) -> FusionResult<FusionId> {
        Ok(FusionId(self.inner.header()?.master.load(Ordering::Acquire)))
    }

    pub fn is_master(&self) -> bool {
        self.master().is_ok_and(|master| master == self.inner.fusion_id)
    }

    /// Whether the world was destroyed or this member was reaped.
    pub fn is_destroyed(&self) -> bool {
        self.inner.check_active().is_err()
    }

    /// Active members in slot order.
    pub fn members(&self) -> FusionResult<Vec<MemberInfo>> {
        let master = self.master()?;
        let mut members = Vec::new();
        for slot in 0..MAX_MEMBERS {
            let entry = self.inner.member(slot)?;
            if entry.state.load(Ordering::Acquire) != MEMBER_ACTIVE {
                continue;
            }
            let fusion_id = FusionId(entry.fusion_id.load(Ordering::Acquire));
            members.push(MemberInfo {
                fusion_id,
                pid: entry.pid.load(Ordering::Acquire),
                is_master: fusion_id == master,
            });
        }
        Ok(members)
    }

    /// The world's own pool, holding object chunks and reactor lists.
    pub fn main_pool(&self) -> FusionResult<ShmPool> {
        ShmPool::attach_inner(&self.inner, MAIN_POOL_NAME)
    }

    pub(crate) fn inner(&self) -> &Arc<WorldInner> {
        &self.inner
    }
}

impl std::fmt::Debug for World {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("World")
            .field("name", &self.inner.name)
            .field("fusion_id", &self.inner.fusion_id)
            .field("slot", &self.inner.slot)
            .finish()
    }
}

fn check_world_name(name: &str) -> FusionResult<()> {
    let valid = !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(FusionError::InvalidArgument(
            "world names are 1 to 64 characters of [A-Za-z0-9._-]",
        ))
    }
}

enum Probe {
    Active,
    Pending,
    Stale,
}

/// Creates the segment, or maps an existing one once it is active.
fn attach_segment(path: &Path, config: &FusionConfig) -> FusionResult<(SharedRegion, bool)> {
    let layout = Layout::new(
        config.inbox_capacity,
        config.call_slots,
        config.reply_capacity,
    );
    let patience = (config.heartbeat_interval * 20).max(Duration::from_secs(5));
    let deadline = Instant::now() + patience;
    let mut destroyed_since: Option<Instant> = None;

    loop {
        match SharedRegion::create(path, layout.total) {
            Ok(region) => {
                init_header(&region, config)?;
                return Ok((region, true));
            }
            Err(ShmError::Exists(_)) => {}
            Err(err) => return Err(err.into()),
        }

        if let Ok(region) = SharedRegion::open(path) {
            match probe(&region)? {
                Probe::Active => return Ok((region, false)),
                Probe::Stale => {
                    warn!(path = %path.display(), "replacing stale world");
                    remove_stale(&region, path, config);
                    continue;
                }
                Probe::Pending => {}
            }
            let destroyed = region
                .at::<WorldHeader>(0)
                .is_ok_and(|h| h.state.load(Ordering::Acquire) == WORLD_DESTROYED);
            if destroyed {
                // The last member unlinks right after marking the world
                // destroyed; a file that lingers belongs to a crashed leaver.
                let since = *destroyed_since.get_or_insert_with(Instant::now);
                if since.elapsed() > config.heartbeat_interval {
                    remove_stale(&region, path, config);
                    destroyed_since = None;
                    continue;
                }
            }
        }

        if Instant::now() >= deadline {
            return Err(FusionError::Timeout);
        }
        thread::sleep(Duration::from_millis(2));
    }
}

fn probe(region: &SharedRegion) -> FusionResult<Probe> {
    let Ok(header) = region.at::<WorldHeader>(0) else {
        return Ok(Probe::Pending);
    };
    if header.magic.load(Ordering::Acquire) != WORLD_MAGIC {
        return Ok(Probe::Pending);
    }
    if header.version.load(Ordering::Acquire) != WORLD_VERSION {
        return Err(FusionError::Unsupported("world segment version mismatch"));
    }
    match header.state.load(Ordering::Acquire) {
        WORLD_ACTIVE => {
            let layout = Layout::from_header(header);
            if region.len() < layout.total {
                return Ok(Probe::Pending);
            }
            let interval =
                Duration::from_millis(header.heartbeat_ms.load(Ordering::Acquire).max(1));
            let own_pid = std::process::id();
            let anyone = (0..MAX_MEMBERS).any(|slot| {
                region
                    .at::<MemberEntry>(layout.member(slot))
                    .is_ok_and(|entry| {
                        entry.is_active() && liveness::member_alive(entry, interval, own_pid)
                    })
            });
            Ok(if anyone { Probe::Active } else { Probe::Stale })
        }
        WORLD_INITIALIZING => {
            let creator = header.created_pid.load(Ordering::Acquire);
            Ok(if liveness::process_exists(creator) {
                Probe::Pending
            } else {
                Probe::Stale
            })
        }
        _ => Ok(Probe::Pending),
    }
}

/// Unlinks a dead world's pool files and segment.
fn remove_stale(region: &SharedRegion, path: &Path, config: &FusionConfig) {
    if let Ok(header) = region.at::<WorldHeader>(0) {
        let layout = Layout::from_header(header);
        if let Some(world) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_prefix("fusion."))
        {
            for index in 0..layout::MAX_POOLS {
                let Ok(entry) = region.at::<layout::PoolEntry>(layout.pool(index)) else {
                    continue;
                };
                if entry.state.load(Ordering::Acquire) == layout::ENTRY_ACTIVE {
                    let generation = entry.generation.load(Ordering::Acquire);
                    let _ = SharedRegion::unlink(&pool::pool_path(
                        &config.shm_dir,
                        world,
                        index,
                        generation,
                    ));
                }
            }
        }
    }
    if let Err(err) = SharedRegion::unlink(path) {
        warn!(path = %path.display(), "failed to unlink stale world: {err}");
    }
}

fn init_header(region: &SharedRegion, config: &FusionConfig) -> FusionResult<()> {
    let header: &WorldHeader = region.at(0)?;
    header.version.store(WORLD_VERSION, Ordering::Relaxed);
    header.state.store(WORLD_INITIALIZING, Ordering::Relaxed);
    header.next_fusion_id.store(FusionId::MASTER.get(), Ordering::Relaxed);
    header.next_call_id.store(1, Ordering::Relaxed);
    header.next_reactor_id.store(1, Ordering::Relaxed);
    header
        .inbox_capacity
        .store(config.inbox_capacity as u32, Ordering::Relaxed);
    header.call_slots.store(config.call_slots, Ordering::Relaxed);
    header
        .reply_capacity
        .store(config.reply_capacity as u32, Ordering::Relaxed);
    header.heartbeat_ms.store(
        config.heartbeat_interval.as_millis().max(1) as u64,
        Ordering::Relaxed,
    );
    header.recovery.store(
        match config.master_recovery {
            MasterRecovery::Promote => RECOVERY_PROMOTE,
            MasterRecovery::Destroy => RECOVERY_DESTROY,
        },
        Ordering::Relaxed,
    );
    header.created_pid.store(std::process::id(), Ordering::Relaxed);
    header.world_lock.init(true);
    header.call_lock.init(true);
    header.reactor_lock.init(true);
    header.magic.store(WORLD_MAGIC, Ordering::Release);
    Ok(())
}

fn format_tables(segment: &SharedRegion, layout: &Layout) -> FusionResult<()> {
    for slot in 0..MAX_MEMBERS {
        MsgRing::format(segment, layout.inbox(slot), layout.inbox_capacity)?;
    }
    SlotPool::format(segment, layout.replies, layout.reply)?;
    Ok(())
}

fn register_member(
    segment: &SharedRegion,
    layout: &Layout,
    owner: &LockOwner,
    fusion_id: FusionId,
    master: bool,
) -> FusionResult<usize> {
    let header: &WorldHeader = segment.at(0)?;
    let _guard = Skirmish::new(&header.world_lock, owner).guard()?;
    if header.state.load(Ordering::Acquire) == WORLD_DESTROYED {
        return Err(FusionError::Destroyed);
    }
    for slot in 0..MAX_MEMBERS {
        let entry: &MemberEntry = segment.at(layout.member(slot))?;
        if entry.state.load(Ordering::Acquire) != MEMBER_EMPTY {
            continue;
        }
        let now = now_nanos();
        entry.fusion_id.store(fusion_id.get(), Ordering::Relaxed);
        entry.pid.store(std::process::id(), Ordering::Relaxed);
        entry.reactor_call.store(0, Ordering::Relaxed);
        entry.destroy_call.store(0, Ordering::Relaxed);
        entry.heartbeat.store(now, Ordering::Relaxed);
        entry.attached_at.store(now, Ordering::Relaxed);
        entry.inbox_lock.init(true);
        MsgRing::attach(segment, layout.inbox(slot))?.reset();
        entry.state.store(MEMBER_ACTIVE, Ordering::Release);
        if master {
            header.master.store(fusion_id.get(), Ordering::Release);
        }
        debug!(fusion_id = %fusion_id, slot, "registered member");
        return Ok(slot);
    }
    Err(FusionError::LimitExceeded("world member table is full"))
}

impl WorldInner {
    pub fn header(&self) -> FusionResult<&WorldHeader> {
        Ok(self.segment.at(0)?)
    }

    pub fn member(&self, slot: usize) -> FusionResult<&MemberEntry> {
        Ok(self.segment.at(self.layout.member(slot))?)
    }

    pub fn own_member(&self) -> FusionResult<&MemberEntry> {
        self.member(self.slot)
    }

    pub fn skirmish<'a>(&'a self, raw: &'a SkirmishRaw) -> Skirmish<'a> {
        Skirmish::new(raw, &self.owner)
    }

    /// Locks `raw` as this member.
    pub fn lock<'a>(&'a self, raw: &'a SkirmishRaw) -> FusionResult<SkirmishGuard<'a>> {
        Ok(self.skirmish(raw).guard()?)
    }

    pub fn inbox(&self, slot: usize) -> FusionResult<MsgRing<'_>> {
        Ok(MsgRing::attach(&self.segment, self.layout.inbox(slot))?)
    }

    pub fn replies(&self) -> FusionResult<SlotPool<'_>> {
        Ok(SlotPool::attach(
            &self.segment,
            self.layout.replies,
            self.layout.reply,
        )?)
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    pub fn is_stopping(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Fails with [`FusionError::Destroyed`] once the world is gone or this
    /// member was reaped.
    pub fn check_active(&self) -> FusionResult<()> {
        if self.is_destroyed() {
            return Err(FusionError::Destroyed);
        }
        if self.header()?.state.load(Ordering::Acquire) == WORLD_DESTROYED {
            self.mark_destroyed();
            return Err(FusionError::Destroyed);
        }
        Ok(())
    }

    pub fn mark_destroyed(&self) {
        if !self.destroyed.swap(true, Ordering::AcqRel) {
            debug!(world = %self.name, fusion_id = %self.fusion_id, "world handle destroyed");
        }
    }

    /// This process' mapping of pool `index`, opened on first use.
    pub fn pool_mapping(&self, index: usize, generation: u32) -> FusionResult<Arc<PoolMapping>> {
        let mut pools = self.pools.lock();
        if let Some(mapping) = pools.get(&index) {
            if mapping.generation == generation {
                return Ok(Arc::clone(mapping));
            }
        }
        let path = pool::pool_path(&self.config.shm_dir, &self.name, index, generation);
        let mapping = Arc::new(PoolMapping::open(path, generation)?);
        pools.insert(index, Arc::clone(&mapping));
        Ok(mapping)
    }

    /// Index and generation of the main pool.
    pub fn main_pool_id(&self) -> FusionResult<(usize, u32)> {
        let index = self.header()?.main_pool.load(Ordering::Acquire) as usize;
        let entry: &layout::PoolEntry = self.segment.at(self.layout.pool(index))?;
        Ok((index, entry.generation.load(Ordering::Acquire)))
    }

    pub fn main_pool(&self) -> FusionResult<pool::PoolView<'_>> {
        let (index, generation) = self.main_pool_id()?;
        pool::PoolView::new(self, index, generation)
    }

    fn create_main_pool(&self) -> FusionResult<()> {
        let header = self.header()?;
        let _guard = self.lock(&header.world_lock)?;
        let size = self.config.main_pool_size;
        let (index, _) = pool::create_entry(
            self,
            MAIN_POOL_NAME,
            size,
            size.saturating_mul(MAIN_POOL_GROWTH),
            self.config.debug_shm,
        )?;
        header.main_pool.store(index as u32, Ordering::Release);
        Ok(())
    }

    /// Fusion ids of active members that still heartbeat.
    pub fn live_members(&self) -> Vec<FusionId> {
        (0..MAX_MEMBERS)
            .filter_map(|slot| self.member(slot).ok())
            .filter(|entry| entry.is_active() && self.liveness.entry_alive(entry))
            .map(|entry| FusionId(entry.fusion_id.load(Ordering::Acquire)))
            .collect()
    }

    fn spawn_threads(self: &Arc<Self>) -> FusionResult<()> {
        let (tx, rx) = bounded::<()>(1);
        *self.ticker.lock() = Some(tx);
        let dispatcher = call::spawn_dispatcher(self)?;
        let watcher = {
            let world = Arc::clone(self);
            thread::Builder::new()
                .name(format!("fusion-watch-{}", self.fusion_id))
                .spawn(move || watch_loop(world, rx))
                .map_err(|_| FusionError::Failed)?
        };
        self.threads.lock().extend([dispatcher, watcher]);
        Ok(())
    }

    fn stop_threads(&self) {
        self.stop.store(true, Ordering::Release);
        self.ticker.lock().take();
        if let Ok(inbox) = self.inbox(self.slot) {
            inbox.ring_doorbell();
        }
        let current = thread::current().id();
        let threads: Vec<_> = self.threads.lock().drain(..).collect();
        for handle in threads {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                warn!(world = %self.name, "world thread panicked");
            }
        }
        call::stop_workers(self);
    }

    /// Graceful departure: drop this member's references and holdings, hand
    /// the master role on, and tear the world down if nobody is left.
    fn leave(self: &Arc<Self>) -> FusionResult<()> {
        let header = self.header()?;
        let doomed = {
            let _guard = self.lock(&header.world_lock)?;
            watch::reap(self, self.slot, self.fusion_id, watch::Departure::Graceful)
        };
        crate::object::finish_destruction(doomed);

        let _guard = self.lock(&header.world_lock)?;
        let was_master = header.master.load(Ordering::Acquire) == self.fusion_id.get();
        let remaining = self.live_members();
        if remaining.is_empty() {
            header.state.store(WORLD_DESTROYED, Ordering::Release);
            pool::unlink_all(self);
            info!(world = %self.name, "last member left, world destroyed");
        } else if was_master && header.state.load(Ordering::Acquire) == WORLD_ACTIVE {
            match header.recovery.load(Ordering::Acquire) {
                RECOVERY_DESTROY => {
                    header.state.store(WORLD_DESTROYED, Ordering::Release);
                    warn!(world = %self.name, "master left, world destroyed");
                }
                _ => {
                    if let Some(next) = remaining.iter().min() {
                        header.master.store(next.get(), Ordering::Release);
                        info!(world = %self.name, master = %next, "master role handed over");
                    }
                }
            }
        }
        self.mark_destroyed();
        info!(world = %self.name, fusion_id = %self.fusion_id, "left world");
        Ok(())
    }
}

fn watch_loop(world: Arc<WorldInner>, ticker: Receiver<()>) {
    let interval = world.liveness.interval();
    loop {
        if let Ok(entry) = world.own_member() {
            if entry.fusion_id.load(Ordering::Acquire) == world.fusion_id.get() {
                entry.heartbeat.store(now_nanos(), Ordering::Release);
            }
        }
        if !world.is_destroyed() {
            if let Err(err) = watch::supervise(&world) {
                warn!(world = %world.name, "supervision pass failed: {err}");
            }
        }
        match ticker.recv_timeout(interval) {
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
            _ => break,
        }
        if world.is_stopping() {
            break;
        }
    }
    debug!(world = %world.name, "watch thread stopped");
}
