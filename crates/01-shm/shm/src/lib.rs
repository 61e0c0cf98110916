//! Shared memory primitives underneath the Fusion world.
//!
//! * [`SharedRegion`] – file-backed mappings addressed by offset.
//! * [`Skirmish`] – process-shared recursive lock with a wait queue.
//! * [`Heap`] – boundary-tag allocator for pool segments.
//! * [`MsgRing`] – inbox ring with a futex doorbell.
//! * [`SlotPool`] – fixed slot table used for call replies.
//! * [`refcount`] – compare-and-swap reference counting.
//! * [`ShmError`] – error surface for mapping, capacity and corruption failures.

mod error;
pub mod heap;
mod msg_ring;
mod name;
pub mod refcount;
mod region;
mod skirmish;
mod slot_pool;
pub mod wait;

pub use error::{ShmError, ShmResult};
pub use heap::{BlockInfo, Heap, HeapState};
pub use msg_ring::{Envelope, MsgRing, Record};
pub use name::{ShmName, MAX_NAME_LEN};
pub use region::{SharedRegion, ShmLayout};
pub use skirmish::{
    AlwaysAlive, LockOwner, OwnerProbe, Skirmish, SkirmishGuard, SkirmishRaw,
};
pub use slot_pool::{SlotHeader, SlotPool, SlotPoolConfig, SLOT_ALIGNMENT, SLOT_FREE};
pub use wait::WaitResult;
