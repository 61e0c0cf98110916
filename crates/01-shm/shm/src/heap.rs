//! Boundary-tag allocator for SHM pool segments.
//!
//! The heap spans `[0, size)` of a pool file. Every block carries a 48-byte
//! header and an 8-byte footer repeating its size, so neighbours can be
//! coalesced in both directions on free. Free blocks form a doubly linked list
//! threaded through their headers; allocation is first fit with splitting.
//!
//! Allocator state lives in a [`HeapState`] that the owner places in shared
//! memory next to the pool's lock. All methods assume that lock is held.
//!
//! ```text
//! +--------+-----------+---------+---------------------+--------+
//! | size|u | requested | next/prev free | owner | magic | payload | footer |
//! +--------+-----------+---------+---------------------+--------+
//! ```

use crate::region::{SharedRegion, ShmLayout};
use crate::{ShmError, ShmResult};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Marker for "no block" in free-list links.
pub const NIL: u64 = u64::MAX;
/// Alignment of every block and payload.
pub const ALIGN: u64 = 16;
/// Bytes of bookkeeping in front of each payload.
pub const HEADER: u64 = 48;
const FOOTER: u64 = 8;
/// Smallest block the allocator will carve out.
pub const MIN_BLOCK: u64 = 64;
const USED_BIT: u64 = 1;

const MAGIC_USED: u32 = 0x4655_4231;
const MAGIC_FREE: u32 = 0x4655_4230;

const _: () = assert!(std::mem::size_of::<BlockHeader>() as u64 == HEADER);

#[inline]
pub const fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

fn block_size_for(size: u64) -> u64 {
    align_up(HEADER + size + FOOTER, ALIGN).max(MIN_BLOCK)
}

/// Shared allocator bookkeeping.
#[repr(C)]
#[derive(Debug)]
pub struct HeapState {
    size: AtomicU64,
    free_head: AtomicU64,
    used: AtomicU64,
    allocations: AtomicU64,
}

// SAFETY: repr(C), atomics only.
unsafe impl ShmLayout for HeapState {}

impl HeapState {
    /// Bytes managed by the heap (the pool's current size).
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    /// Sum of the requested sizes of live allocations.
    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Acquire)
    }

    /// Number of live allocations.
    pub fn allocations(&self) -> u64 {
        self.allocations.load(Ordering::Acquire)
    }
}

#[repr(C)]
struct BlockHeader {
    size: AtomicU64,
    requested: AtomicU64,
    next_free: AtomicU64,
    prev_free: AtomicU64,
    owner: AtomicU32,
    magic: AtomicU32,
    _reserved: AtomicU64,
}

// SAFETY: repr(C), atomics only.
unsafe impl ShmLayout for BlockHeader {}

/// A live allocation reported by [`Heap::walk`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockInfo {
    /// Payload offset inside the pool.
    pub offset: u64,
    /// Size the caller asked for.
    pub size: u64,
    /// Member that allocated the block.
    pub owner: u32,
}

/// Allocator view over one mapping of a pool file.
#[derive(Clone, Copy)]
pub struct Heap<'a> {
    region: &'a SharedRegion,
    state: &'a HeapState,
}

impl<'a> Heap<'a> {
    /// `region` must cover at least `state.size()` bytes.
    pub fn new(region: &'a SharedRegion, state: &'a HeapState) -> Self {
        Self { region, state }
    }

    /// Initialises an empty heap of `size` bytes.
    pub fn format(&self, size: u64) -> ShmResult<()> {
        if size < MIN_BLOCK || size % ALIGN != 0 {
            return Err(ShmError::InvalidCapacity {
                requested: size as usize,
                minimum: MIN_BLOCK as usize,
            });
        }
        self.state.size.store(size, Ordering::Relaxed);
        self.state.free_head.store(NIL, Ordering::Relaxed);
        self.state.used.store(0, Ordering::Relaxed);
        self.state.allocations.store(0, Ordering::Relaxed);
        self.write_free(0, size)?;
        self.push_free(0)
    }

    fn header(&self, at: u64) -> ShmResult<&'a BlockHeader> {
        self.region.at(at as usize)
    }

    fn footer(&self, at: u64) -> ShmResult<&'a AtomicU64> {
        self.region.at(at as usize)
    }

    fn write_free(&self, at: u64, size: u64) -> ShmResult<()> {
        let header = self.header(at)?;
        header.size.store(size, Ordering::Relaxed);
        header.requested.store(0, Ordering::Relaxed);
        header.next_free.store(NIL, Ordering::Relaxed);
        header.prev_free.store(NIL, Ordering::Relaxed);
        header.owner.store(0, Ordering::Relaxed);
        header.magic.store(MAGIC_FREE, Ordering::Relaxed);
        self.footer(at + size - FOOTER)?
            .store(size, Ordering::Relaxed);
        Ok(())
    }

    fn write_used(&self, at: u64, size: u64, requested: u64, owner: u32) -> ShmResult<()> {
        let header = self.header(at)?;
        header.size.store(size | USED_BIT, Ordering::Relaxed);
        header.requested.store(requested, Ordering::Relaxed);
        header.next_free.store(NIL, Ordering::Relaxed);
        header.prev_free.store(NIL, Ordering::Relaxed);
        header.owner.store(owner, Ordering::Relaxed);
        header.magic.store(MAGIC_USED, Ordering::Relaxed);
        self.footer(at + size - FOOTER)?
            .store(size | USED_BIT, Ordering::Relaxed);
        Ok(())
    }

    fn push_free(&self, at: u64) -> ShmResult<()> {
        let head = self.state.free_head.load(Ordering::Relaxed);
        let header = self.header(at)?;
        header.next_free.store(head, Ordering::Relaxed);
        header.prev_free.store(NIL, Ordering::Relaxed);
        if head != NIL {
            self.header(head)?.prev_free.store(at, Ordering::Relaxed);
        }
        self.state.free_head.store(at, Ordering::Relaxed);
        Ok(())
    }

    fn unlink_free(&self, at: u64) -> ShmResult<()> {
        let header = self.header(at)?;
        let next = header.next_free.load(Ordering::Relaxed);
        let prev = header.prev_free.load(Ordering::Relaxed);
        if prev == NIL {
            self.state.free_head.store(next, Ordering::Relaxed);
        } else {
            self.header(prev)?.next_free.store(next, Ordering::Relaxed);
        }
        if next != NIL {
            self.header(next)?.prev_free.store(prev, Ordering::Relaxed);
        }
        Ok(())
    }

    fn used_block(&self, payload: u64) -> ShmResult<(u64, &'a BlockHeader)> {
        let at = payload
            .checked_sub(HEADER)
            .filter(|at| at % ALIGN == 0 && *at < self.state.size())
            .ok_or(ShmError::Corrupt("offset is not an allocation"))?;
        let header = self.header(at)?;
        if header.magic.load(Ordering::Relaxed) != MAGIC_USED
            || header.size.load(Ordering::Relaxed) & USED_BIT == 0
        {
            return Err(ShmError::Corrupt("offset is not a live allocation"));
        }
        Ok((at, header))
    }

    /// Allocates `size` bytes and returns the payload offset.
    ///
    /// Fails with [`ShmError::OutOfSpace`] when no free block fits; the caller
    /// may [`Heap::extend`] the heap and retry.
    pub fn allocate(&self, size: u64, owner: u32) -> ShmResult<u64> {
        let need = block_size_for(size);
        let mut cursor = self.state.free_head.load(Ordering::Relaxed);
        while cursor != NIL {
            let header = self.header(cursor)?;
            if header.magic.load(Ordering::Relaxed) != MAGIC_FREE {
                return Err(ShmError::Corrupt("free list links a non-free block"));
            }
            let block = header.size.load(Ordering::Relaxed);
            if block >= need {
                self.unlink_free(cursor)?;
                let rest = block - need;
                let taken = if rest >= MIN_BLOCK {
                    self.write_free(cursor + need, rest)?;
                    self.push_free(cursor + need)?;
                    need
                } else {
                    block
                };
                self.write_used(cursor, taken, size, owner)?;
                self.state.used.fetch_add(size, Ordering::Relaxed);
                self.state.allocations.fetch_add(1, Ordering::Relaxed);
                return Ok(cursor + HEADER);
            }
            cursor = header.next_free.load(Ordering::Relaxed);
        }
        Err(ShmError::OutOfSpace { requested: size })
    }

    /// Frees the allocation at `payload`, merging it with free neighbours.
    /// Returns the size that had been requested for it.
    pub fn deallocate(&self, payload: u64) -> ShmResult<u64> {
        let (at, header) = self.used_block(payload)?;
        let requested = header.requested.load(Ordering::Relaxed);
        let mut start = at;
        let mut len = header.size.load(Ordering::Relaxed) & !USED_BIT;

        self.state.used.fetch_sub(requested, Ordering::Relaxed);
        self.state.allocations.fetch_sub(1, Ordering::Relaxed);
        header.magic.store(0, Ordering::Relaxed);

        let next = at + len;
        if next < self.state.size() {
            let next_header = self.header(next)?;
            let next_size = next_header.size.load(Ordering::Relaxed);
            if next_size & USED_BIT == 0 && next_header.magic.load(Ordering::Relaxed) == MAGIC_FREE
            {
                self.unlink_free(next)?;
                next_header.magic.store(0, Ordering::Relaxed);
                len += next_size;
            }
        }

        if at > 0 {
            let prev_size = self.footer(at - FOOTER)?.load(Ordering::Relaxed);
            if prev_size & USED_BIT == 0 && prev_size <= at {
                let prev = at - prev_size;
                if self.header(prev)?.magic.load(Ordering::Relaxed) == MAGIC_FREE {
                    self.unlink_free(prev)?;
                    start = prev;
                    len += prev_size;
                }
            }
        }

        self.write_free(start, len)?;
        self.push_free(start)?;
        Ok(requested)
    }

    /// Size originally requested for the allocation at `payload`.
    pub fn requested_size(&self, payload: u64) -> ShmResult<u64> {
        let (_, header) = self.used_block(payload)?;
        Ok(header.requested.load(Ordering::Relaxed))
    }

    /// Resizes an allocation, in place when the block has room, otherwise by
    /// allocate, copy, free. Contents up to the smaller size are preserved.
    pub fn reallocate(&self, payload: u64, size: u64, owner: u32) -> ShmResult<u64> {
        let (at, header) = self.used_block(payload)?;
        let old = header.requested.load(Ordering::Relaxed);
        let block = header.size.load(Ordering::Relaxed) & !USED_BIT;
        if size <= block - HEADER - FOOTER {
            header.requested.store(size, Ordering::Relaxed);
            self.state.used.fetch_sub(old, Ordering::Relaxed);
            self.state.used.fetch_add(size, Ordering::Relaxed);
            debug_assert_eq!(at + HEADER, payload);
            return Ok(payload);
        }

        let fresh = self.allocate(size, owner)?;
        self.region
            .copy_within(payload as usize, fresh as usize, old.min(size) as usize)?;
        self.deallocate(payload)?;
        Ok(fresh)
    }

    /// Adds `[size(), new_size)` to the heap after the pool file grew.
    pub fn extend(&self, new_size: u64) -> ShmResult<()> {
        let old = self.state.size();
        if new_size <= old {
            return Ok(());
        }
        let growth = new_size - old;
        if growth < MIN_BLOCK || growth % ALIGN != 0 {
            return Err(ShmError::InvalidCapacity {
                requested: growth as usize,
                minimum: MIN_BLOCK as usize,
            });
        }
        if (self.region.len() as u64) < new_size {
            return Err(ShmError::OutOfBounds {
                offset: old as usize,
                len: growth as usize,
                mapped: self.region.len(),
            });
        }

        let mut start = old;
        let mut len = growth;
        if old > 0 {
            let last_size = self.footer(old - FOOTER)?.load(Ordering::Relaxed);
            if last_size & USED_BIT == 0 && last_size <= old {
                let last = old - last_size;
                if self.header(last)?.magic.load(Ordering::Relaxed) == MAGIC_FREE {
                    self.unlink_free(last)?;
                    start = last;
                    len += last_size;
                }
            }
        }
        self.state.size.store(new_size, Ordering::Release);
        self.write_free(start, len)?;
        self.push_free(start)
    }

    /// Lists every live allocation in address order.
    pub fn walk(&self) -> ShmResult<Vec<BlockInfo>> {
        let size = self.state.size();
        let mut blocks = Vec::new();
        let mut at = 0;
        while at < size {
            let header = self.header(at)?;
            let raw = header.size.load(Ordering::Relaxed);
            let len = raw & !USED_BIT;
            if len < MIN_BLOCK || at + len > size {
                return Err(ShmError::Corrupt("block size out of range"));
            }
            if raw & USED_BIT != 0 {
                blocks.push(BlockInfo {
                    offset: at + HEADER,
                    size: header.requested.load(Ordering::Relaxed),
                    owner: header.owner.load(Ordering::Relaxed),
                });
            }
            at += len;
        }
        Ok(blocks)
    }

    /// Size of the largest free block, header included.
    pub fn largest_free(&self) -> ShmResult<u64> {
        let mut largest = 0;
        let mut cursor = self.state.free_head.load(Ordering::Relaxed);
        while cursor != NIL {
            let header = self.header(cursor)?;
            largest = largest.max(header.size.load(Ordering::Relaxed));
            cursor = header.next_free.load(Ordering::Relaxed);
        }
        Ok(largest)
    }

    /// Bookkeeping needed to fit a `size`-byte payload in a fresh block.
    pub fn block_size(size: u64) -> u64 {
        block_size_for(size)
    }
}
