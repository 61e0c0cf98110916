//! Fusion: a multi-process world over shared memory.
//!
//! Processes on one host [`World::enter`] a named world and share:
//!
//! * [`ShmPool`] – growable shared heaps handing out pool-relative [`ShmPtr`]s.
//! * [`Arena`] – named rendezvous with exactly-once initialisation.
//! * [`ObjectPool`] / [`Object`] – reference-counted shared objects with
//!   destructors.
//! * [`Call`] – cross-process procedure calls with typed replies.
//! * [`Reactor`] – ordered publish / subscribe across members.
//!
//! Locks, rings and allocators come from [`fusion_shm`].

pub mod arena;
pub mod call;
pub mod config;
mod error;
mod ids;
mod lifecycle;
pub mod object;
pub mod pool;
pub mod reactor;
mod world;

#[cfg(test)]
pub(crate) mod testing;

pub use arena::Arena;
pub use call::{Call, CallFlags, CallHandler, CallReply, CallRequest, CallResult};
pub use config::{CallMode, FusionConfig, MasterRecovery};
pub use error::{ErrorCode, FusionError, FusionResult};
pub use ids::{CallId, FusionId, ListenerId, ObjectId, ReactorId, ShmPtr};
pub use lifecycle::Lifecycle;
pub use object::{Destructor, Object, ObjectFilter, ObjectPool};
pub use pool::{Allocation, PoolGuard, PoolStats, ShmPool};
pub use reactor::{ListenerToken, Reaction, ReactionResult, Reactor};
pub use world::{MemberInfo, World};
