//! Shared tables of the world segment.
//!
//! ```text
//! +--------------+-------------+-----------+------------+--------------+-----------+
//! | WorldHeader  | members[32] | pools[16] | arenas[16] | objpools[16] | calls[256]|
//! +--------------+-------------+-----------+------------+--------------+-----------+
//! | inbox ring per member slot (32)         | reply slot table                     |
//! +-----------------------------------------+--------------------------------------+
//! ```
//!
//! Every table entry is `#[repr(C)]`, atomics only, and valid when zeroed.
//! Sizes that depend on configuration are recorded in the header by the
//! creating member; later members rebuild the [`Layout`] from there.

use fusion_shm::{
    HeapState, MsgRing, ShmLayout, ShmName, SkirmishRaw, SlotPoolConfig, SLOT_ALIGNMENT,
};
use std::mem::size_of;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

pub(crate) const WORLD_MAGIC: u64 = 0x4655_5349_4f4e_5731; // "FUSIONW1"
pub(crate) const WORLD_VERSION: u32 = 1;

pub const MAX_MEMBERS: usize = 32;
pub const MAX_POOLS: usize = 16;
pub const MAX_ARENAS: usize = 16;
pub const MAX_FIELDS: usize = 16;
pub const MAX_OBJECT_POOLS: usize = 16;
pub const MAX_CHUNKS: usize = 64;
pub const CHUNK_SLOTS: usize = 64;
pub const MAX_CALLS: usize = 256;

pub(crate) const WORLD_INITIALIZING: u32 = 0;
pub(crate) const WORLD_ACTIVE: u32 = 1;
pub(crate) const WORLD_DESTROYED: u32 = 2;

pub(crate) const ENTRY_EMPTY: u32 = 0;
pub(crate) const ENTRY_ACTIVE: u32 = 1;

pub(crate) const MEMBER_EMPTY: u32 = 0;
pub(crate) const MEMBER_ACTIVE: u32 = 2;
pub(crate) const MEMBER_REAPING: u32 = 3;

pub(crate) const ARENA_EMPTY: u32 = 0;
pub(crate) const ARENA_INITIALIZING: u32 = 1;
pub(crate) const ARENA_READY: u32 = 2;

pub(crate) const RECOVERY_PROMOTE: u32 = 0;
pub(crate) const RECOVERY_DESTROY: u32 = 1;

#[repr(C, align(64))]
pub(crate) struct WorldHeader {
    pub magic: AtomicU64,
    pub version: AtomicU32,
    pub state: AtomicU32,
    pub master: AtomicU32,
    pub next_fusion_id: AtomicU32,
    pub next_call_id: AtomicU32,
    pub next_reactor_id: AtomicU32,
    pub inbox_capacity: AtomicU32,
    pub call_slots: AtomicU32,
    pub reply_capacity: AtomicU32,
    pub main_pool: AtomicU32,
    pub heartbeat_ms: AtomicU64,
    pub recovery: AtomicU32,
    pub created_pid: AtomicU32,
    /// Head of the reactor registry (main pool offset, 0 = empty).
    pub reactors: AtomicU64,
    /// Guards membership, the pool, arena and object-pool tables.
    pub world_lock: SkirmishRaw,
    /// Guards the call table and the reply slot free ring.
    pub call_lock: SkirmishRaw,
    /// Guards the reactor registry.
    pub reactor_lock: SkirmishRaw,
}

#[repr(C, align(64))]
pub(crate) struct MemberEntry {
    pub state: AtomicU32,
    pub fusion_id: AtomicU32,
    pub pid: AtomicU32,
    pub reactor_call: AtomicU32,
    pub destroy_call: AtomicU32,
    pub _pad: AtomicU32,
    /// Wall clock nanoseconds of the last heartbeat.
    pub heartbeat: AtomicU64,
    pub attached_at: AtomicU64,
    /// Serialises producers on this member's inbox ring.
    pub inbox_lock: SkirmishRaw,
}

#[repr(C, align(64))]
pub(crate) struct PoolEntry {
    pub state: AtomicU32,
    pub generation: AtomicU32,
    pub debug: AtomicU32,
    pub creator: AtomicU32,
    pub max_size: AtomicU64,
    pub attach_count: AtomicU32,
    pub _pad: AtomicU32,
    pub name: ShmName,
    pub lock: SkirmishRaw,
    pub heap: HeapState,
}

#[repr(C)]
pub(crate) struct FieldEntry {
    pub used: AtomicU32,
    pub _pad: AtomicU32,
    pub value: AtomicU64,
    pub name: ShmName,
}

#[repr(C, align(64))]
pub(crate) struct ArenaEntry {
    pub state: AtomicU32,
    pub generation: AtomicU32,
    pub count: AtomicU32,
    /// Bit per member slot holding the arena.
    pub holders: AtomicU32,
    pub name: ShmName,
    pub lock: SkirmishRaw,
    pub fields: [FieldEntry; MAX_FIELDS],
}

pub(crate) const NO_SLOT: u32 = u32::MAX;

#[repr(C, align(64))]
pub(crate) struct ObjectPoolEntry {
    pub state: AtomicU32,
    pub generation: AtomicU32,
    pub object_size: AtomicU32,
    pub message_size: AtomicU32,
    pub next_id: AtomicU64,
    pub count: AtomicU32,
    pub creator: AtomicU32,
    /// First free slot, or [`NO_SLOT`].
    pub free_head: AtomicU32,
    pub chunk_count: AtomicU32,
    /// Bit per member slot that registered a destructor for this pool.
    pub destructors: AtomicU32,
    pub _pad: AtomicU32,
    pub name: ShmName,
    pub lock: SkirmishRaw,
    /// Main pool offsets of the slot chunks.
    pub chunks: [AtomicU64; MAX_CHUNKS],
}

#[repr(C)]
pub(crate) struct CallEntry {
    pub state: AtomicU32,
    pub owner: AtomicU32,
    pub id: AtomicU32,
    pub _pad: AtomicU32,
}

// SAFETY: every table entry is repr(C) over atomics and shared-layout types,
// and all-zero is its empty state.
unsafe impl ShmLayout for WorldHeader {}
// SAFETY: as above.
unsafe impl ShmLayout for MemberEntry {}
// SAFETY: as above.
unsafe impl ShmLayout for PoolEntry {}
// SAFETY: as above.
unsafe impl ShmLayout for FieldEntry {}
// SAFETY: as above.
unsafe impl ShmLayout for ArenaEntry {}
// SAFETY: as above.
unsafe impl ShmLayout for ObjectPoolEntry {}
// SAFETY: as above.
unsafe impl ShmLayout for CallEntry {}

impl MemberEntry {
    pub fn is_active(&self) -> bool {
        self.state.load(Ordering::Acquire) == MEMBER_ACTIVE
    }
}

const fn align64(value: usize) -> usize {
    (value + 63) & !63
}

/// Byte offsets of every table inside the world segment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Layout {
    pub members: usize,
    pub pools: usize,
    pub arenas: usize,
    pub object_pools: usize,
    pub calls: usize,
    pub inboxes: usize,
    pub inbox_stride: usize,
    pub inbox_capacity: usize,
    pub replies: usize,
    pub reply: SlotPoolConfig,
    pub total: usize,
}

impl Layout {
    pub fn new(inbox_capacity: usize, call_slots: u32, reply_capacity: usize) -> Self {
        let mut cursor = align64(size_of::<WorldHeader>());
        let mut table = |size: usize| {
            let at = cursor;
            cursor = align64(cursor + size);
            at
        };
        let members = table(size_of::<MemberEntry>() * MAX_MEMBERS);
        let pools = table(size_of::<PoolEntry>() * MAX_POOLS);
        let arenas = table(size_of::<ArenaEntry>() * MAX_ARENAS);
        let object_pools = table(size_of::<ObjectPoolEntry>() * MAX_OBJECT_POOLS);
        let calls = table(size_of::<CallEntry>() * MAX_CALLS);
        let inbox_stride = align64(MsgRing::footprint(inbox_capacity));
        let inboxes = table(inbox_stride * MAX_MEMBERS);
        let reply = SlotPoolConfig {
            slot_count: call_slots,
            payload_size: reply_capacity,
        };
        let replies = table(reply.footprint());
        debug_assert_eq!(replies % SLOT_ALIGNMENT, 0);
        Self {
            members,
            pools,
            arenas,
            object_pools,
            calls,
            inboxes,
            inbox_stride,
            inbox_capacity,
            replies,
            reply,
            total: cursor,
        }
    }

    /// Rebuilds the layout recorded in an existing segment's header.
    pub fn from_header(header: &WorldHeader) -> Self {
        Self::new(
            header.inbox_capacity.load(Ordering::Acquire) as usize,
            header.call_slots.load(Ordering::Acquire),
            header.reply_capacity.load(Ordering::Acquire) as usize,
        )
    }

    pub fn member(&self, slot: usize) -> usize {
        debug_assert!(slot < MAX_MEMBERS);
        self.members + slot * size_of::<MemberEntry>()
    }

    pub fn pool(&self, index: usize) -> usize {
        debug_assert!(index < MAX_POOLS);
        self.pools + index * size_of::<PoolEntry>()
    }

    pub fn arena(&self, index: usize) -> usize {
        debug_assert!(index < MAX_ARENAS);
        self.arenas + index * size_of::<ArenaEntry>()
    }

    pub fn object_pool(&self, index: usize) -> usize {
        debug_assert!(index < MAX_OBJECT_POOLS);
        self.object_pools + index * size_of::<ObjectPoolEntry>()
    }

    pub fn call(&self, index: usize) -> usize {
        debug_assert!(index < MAX_CALLS);
        self.calls + index * size_of::<CallEntry>()
    }

    pub fn inbox(&self, slot: usize) -> usize {
        debug_assert!(slot < MAX_MEMBERS);
        self.inboxes + slot * self.inbox_stride
    }
}
