//! Identifier newtypes shared across the world.

use std::fmt;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident($inner:ty)) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub $inner);

        impl $name {
            pub const fn get(self) -> $inner {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type!(
    /// Identity of a member process, issued from 1 and never reused while
    /// the world exists.
    FusionId(u32)
);
id_type!(
    /// World-wide call identifier, issued from 1.
    CallId(u32)
);
id_type!(
    /// Pool-scoped object identifier, issued from 1.
    ObjectId(u64)
);
id_type!(
    /// Reactor-scoped listener identifier.
    ListenerId(u32)
);
id_type!(
    /// World-wide reactor identifier.
    ReactorId(u32)
);

impl FusionId {
    /// Identity of the first member to enter a world.
    pub const MASTER: FusionId = FusionId(1);
}

/// Pool-relative pointer: which SHM pool, and the byte offset inside it.
///
/// Packs into a `u64` (16-bit pool index, 48-bit offset) so it can be stored
/// in arena fields and object payloads.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ShmPtr {
    pub pool: u16,
    pub offset: u64,
}

const OFFSET_BITS: u32 = 48;
const OFFSET_MASK: u64 = (1 << OFFSET_BITS) - 1;

impl ShmPtr {
    pub const fn new(pool: u16, offset: u64) -> Self {
        Self { pool, offset }
    }

    pub const fn pack(self) -> u64 {
        ((self.pool as u64) << OFFSET_BITS) | (self.offset & OFFSET_MASK)
    }

    pub const fn unpack(raw: u64) -> Self {
        Self {
            pool: (raw >> OFFSET_BITS) as u16,
            offset: raw & OFFSET_MASK,
        }
    }

    /// Pointer `delta` bytes further into the same allocation.
    pub const fn add(self, delta: u64) -> Self {
        Self {
            pool: self.pool,
            offset: self.offset + delta,
        }
    }
}

impl fmt::Display for ShmPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pool{}+{:#x}", self.pool, self.offset)
    }
}
