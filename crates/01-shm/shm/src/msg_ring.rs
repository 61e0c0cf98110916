//! Message ring living at a fixed offset inside a shared segment.
//!
//! Layout:
//!
//! ```text
//! +----------------------+--------------------------------------------+
//! | Header (32 bytes)    | Data region (capacity bytes, 8B aligned)   |
//! +----------------------+--------------------------------------------+
//!                          Record:
//!                          [u32 total_len][u8 tag][u8 ver][u16 flags]
//!                          [payload ...][pad → 8 bytes]
//!                          Sentinel (wrap): total_len == 0xFFFF_FFFF
//! ```
//!
//! The ring has a single consumer (the member owning it). Producers are
//! serialised by the caller, usually under a skirmish, so the ring itself
//! only needs single-producer ordering. The head word doubles as a futex
//! doorbell: committing a record wakes a consumer parked in
//! [`MsgRing::wait_readable`].

use crate::region::{SharedRegion, ShmLayout};
use crate::wait::{wait_u32, wake_all, WaitResult};
use crate::{ShmError, ShmResult};
use std::mem::size_of;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

const ALIGN: usize = 8;
const ENVELOPE_LEN: usize = 8;
const SENTINEL: u32 = u32::MAX;
const HEADER_SIZE: usize = size_of::<MsgRingHeader>();
const MIN_CAPACITY: usize = 64;

const MSG_RING_MAGIC: u64 = 0x4D53_4752_494E_4755;

#[repr(C, align(8))]
struct MsgRingHeader {
    capacity_bytes: AtomicU32,
    head_bytes: AtomicU32,
    tail_bytes: AtomicU32,
    _flags_or_pad: AtomicU32,
    magic: AtomicU64,
    _reserved: AtomicU64,
}

// SAFETY: repr(C), atomics only.
unsafe impl ShmLayout for MsgRingHeader {}

/// Metadata stored alongside each payload inside the ring.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Envelope {
    /// Record kind chosen by the producer.
    pub tag: u8,
    /// Layout version of the payload.
    pub ver: u8,
    /// Bitflags that travel with the payload.
    pub flags: u16,
}

impl Envelope {
    /// Constructs an envelope with the given tag and version.
    pub const fn new(tag: u8, ver: u8) -> Self {
        Self { tag, ver, flags: 0 }
    }

    /// Same envelope with `flags` set.
    pub const fn with_flags(self, flags: u16) -> Self {
        Self { flags, ..self }
    }
}

/// Record copied out of the ring by [`MsgRing::pop`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    pub envelope: Envelope,
    pub payload: Vec<u8>,
}

/// View of a ring inside a mapping.
#[derive(Clone, Copy)]
pub struct MsgRing<'a> {
    region: &'a SharedRegion,
    header: &'a MsgRingHeader,
    base: usize,
    capacity: usize,
}

impl<'a> MsgRing<'a> {
    /// Bytes needed in the segment for a ring of `capacity_bytes`.
    pub const fn footprint(capacity_bytes: usize) -> usize {
        HEADER_SIZE + align_up(capacity_bytes, ALIGN)
    }

    /// Writes an empty ring header at `base`.
    pub fn format(region: &'a SharedRegion, base: usize, capacity_bytes: usize) -> ShmResult<Self> {
        let capacity = align_up(capacity_bytes, ALIGN);
        if capacity < MIN_CAPACITY || capacity >= u32::MAX as usize {
            return Err(ShmError::InvalidCapacity {
                requested: capacity_bytes,
                minimum: MIN_CAPACITY,
            });
        }
        region.fill(base, Self::footprint(capacity), 0)?;
        let header = region.at::<MsgRingHeader>(base)?;
        header
            .capacity_bytes
            .store(capacity as u32, Ordering::Relaxed);
        header.magic.store(MSG_RING_MAGIC, Ordering::Release);
        Ok(Self {
            region,
            header,
            base,
            capacity,
        })
    }

    /// Views a ring previously written by [`MsgRing::format`].
    pub fn attach(region: &'a SharedRegion, base: usize) -> ShmResult<Self> {
        let header = region.at::<MsgRingHeader>(base)?;
        if header.magic.load(Ordering::Acquire) != MSG_RING_MAGIC {
            return Err(ShmError::Corrupt("message ring magic mismatch"));
        }
        let capacity = header.capacity_bytes.load(Ordering::Relaxed) as usize;
        region.slice(base + HEADER_SIZE, capacity)?;
        Ok(Self {
            region,
            header,
            base,
            capacity,
        })
    }

    /// Usable bytes in the data region.
    pub fn capacity_bytes(&self) -> usize {
        self.capacity
    }

    /// Largest payload a single record may carry.
    pub fn max_payload(&self) -> usize {
        (self.capacity / 2).saturating_sub(ENVELOPE_LEN)
    }

    fn header(&self) -> &'a MsgRingHeader {
        self.header
    }

    fn data(&self) -> usize {
        self.base + HEADER_SIZE
    }

    /// Returns true when no record is pending.
    pub fn is_empty(&self) -> bool {
        let header = self.header();
        header.head_bytes.load(Ordering::Acquire) == header.tail_bytes.load(Ordering::Acquire)
    }

    /// Appends a record whose payload is the concatenation of `parts`.
    ///
    /// Returns `Ok(false)` when the ring lacks room. Callers must serialise
    /// producers.
    pub fn push(&self, envelope: Envelope, parts: &[&[u8]]) -> ShmResult<bool> {
        let payload_len: usize = parts.iter().map(|part| part.len()).sum();
        let total_len = ENVELOPE_LEN + payload_len;
        let record_len = align_up(total_len, ALIGN);
        if record_len >= self.capacity {
            return Ok(false);
        }

        let header = self.header();
        let head = header.head_bytes.load(Ordering::Relaxed) as usize;
        let tail = header.tail_bytes.load(Ordering::Acquire) as usize;
        let Some((offset, new_head)) = self.reserve_offset(head, tail, record_len)? else {
            return Ok(false);
        };

        let data = self.data();
        let mut envelope_bytes = [0u8; ENVELOPE_LEN];
        envelope_bytes[..4].copy_from_slice(&(total_len as u32).to_le_bytes());
        envelope_bytes[4] = envelope.tag;
        envelope_bytes[5] = envelope.ver;
        envelope_bytes[6..].copy_from_slice(&envelope.flags.to_le_bytes());
        self.region.write(data + offset, &envelope_bytes)?;

        let mut cursor = data + offset + ENVELOPE_LEN;
        for part in parts {
            self.region.write(cursor, part)?;
            cursor += part.len();
        }
        let pad = record_len - total_len;
        if pad > 0 {
            self.region.fill(cursor, pad, 0)?;
        }

        header.head_bytes.store(new_head as u32, Ordering::Release);
        wake_all(&header.head_bytes);
        Ok(true)
    }

    fn reserve_offset(
        &self,
        head: usize,
        tail: usize,
        record_len: usize,
    ) -> ShmResult<Option<(usize, usize)>> {
        let capacity = self.capacity;
        if head >= capacity || tail >= capacity {
            return Err(ShmError::Corrupt("message ring cursor out of range"));
        }

        if head >= tail {
            let space_at_end = capacity - head;
            if space_at_end >= record_len {
                let mut new_head = head + record_len;
                if new_head == capacity {
                    new_head = 0;
                }
                if new_head == tail {
                    return Ok(None);
                }
                Ok(Some((head, new_head)))
            } else {
                if tail <= record_len {
                    return Ok(None);
                }
                self.region
                    .write(self.data() + head, &SENTINEL.to_le_bytes())?;
                Ok(Some((0, record_len)))
            }
        } else {
            if record_len >= tail - head {
                return Ok(None);
            }
            Ok(Some((head, head + record_len)))
        }
    }

    fn read_u32(&self, offset: usize) -> ShmResult<u32> {
        let mut buf = [0u8; 4];
        self.region.read(self.data() + offset, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Removes and returns the oldest record, if any. Single consumer only.
    pub fn pop(&self) -> ShmResult<Option<Record>> {
        let header = self.header();
        let mut tail = header.tail_bytes.load(Ordering::Relaxed) as usize;

        loop {
            let head = header.head_bytes.load(Ordering::Acquire) as usize;
            if head == tail {
                return Ok(None);
            }

            let total_len = self.read_u32(tail)?;
            if total_len == SENTINEL {
                header.tail_bytes.store(0, Ordering::Release);
                tail = 0;
                continue;
            }

            let total_len = total_len as usize;
            if total_len < ENVELOPE_LEN || tail + total_len > self.capacity {
                return Err(ShmError::Corrupt("message ring record overruns buffer"));
            }

            let mut envelope_bytes = [0u8; ENVELOPE_LEN];
            self.region.read(self.data() + tail, &mut envelope_bytes)?;
            let envelope = Envelope {
                tag: envelope_bytes[4],
                ver: envelope_bytes[5],
                flags: u16::from_le_bytes([envelope_bytes[6], envelope_bytes[7]]),
            };
            let mut payload = vec![0u8; total_len - ENVELOPE_LEN];
            self.region
                .read(self.data() + tail + ENVELOPE_LEN, &mut payload)?;

            let mut new_tail = tail + align_up(total_len, ALIGN);
            if new_tail >= self.capacity {
                new_tail -= self.capacity;
            }
            header.tail_bytes.store(new_tail as u32, Ordering::Release);
            return Ok(Some(Record { envelope, payload }));
        }
    }

    /// Parks until a record is pending or `timeout` expires.
    pub fn wait_readable(&self, timeout: Option<Duration>) -> WaitResult {
        let header = self.header();
        let head = header.head_bytes.load(Ordering::Acquire);
        if head != header.tail_bytes.load(Ordering::Acquire) {
            return WaitResult::NotEqual;
        }
        wait_u32(&header.head_bytes, head, timeout)
    }

    /// Wakes consumers parked in [`MsgRing::wait_readable`] without
    /// publishing a record, e.g. to let a dispatcher observe shutdown.
    pub fn ring_doorbell(&self) {
        wake_all(&self.header().head_bytes);
    }

    /// Drops every pending record.
    pub fn reset(&self) {
        let header = self.header();
        let head = header.head_bytes.load(Ordering::Acquire);
        header.tail_bytes.store(head, Ordering::Release);
    }
}

const fn align_up(value: usize, align: usize) -> usize {
    (value + (align - 1)) & !(align - 1)
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use rand::prelude::*;
    use std::collections::VecDeque;
    use std::sync::Arc;
    use std::thread;

    fn region(capacity: usize) -> SharedRegion {
        SharedRegion::anonymous(64 + MsgRing::footprint(capacity)).expect("anon")
    }

    fn drain_expected(ring: &MsgRing<'_>, expected: &mut VecDeque<Vec<u8>>) -> bool {
        match ring.pop().expect("pop") {
            Some(record) => {
                let lhs = expected.pop_front().expect("expected payload");
                assert_eq!(lhs, record.payload);
                true
            }
            None => false,
        }
    }

    #[test]
    fn single_record_round_trip() {
        let region = region(256);
        let ring = MsgRing::format(&region, 64, 256).expect("format");
        let envelope = Envelope::new(0x11, 1).with_flags(0x3);
        assert!(ring
            .push(envelope, &[b"hello ", b"fusion"])
            .expect("push"));

        let record = ring.pop().expect("pop").expect("record");
        assert_eq!(record.payload, b"hello fusion");
        assert_eq!(record.envelope, envelope);
        assert!(ring.pop().expect("pop").is_none());
    }

    #[test]
    fn sentinel_wrap_path() {
        let region = region(128);
        let ring = MsgRing::format(&region, 64, 128).expect("format");
        let envelope = Envelope::new(1, 1);
        let block_a = vec![0xAA; 16];
        let block_b = vec![0xBB; 24];
        let block_c = vec![0xCC; 24];

        assert!(ring.push(envelope, &[&block_a]).expect("push"));
        assert!(ring.pop().expect("pop").is_some());
        assert!(ring.push(envelope, &[&block_b]).expect("push"));
        assert!(ring.push(envelope, &[&block_c]).expect("push"));
        assert!(ring.pop().expect("pop").is_some());

        let record = ring.pop().expect("pop").expect("wrapped record");
        assert_eq!(record.payload, block_c);
    }

    #[test]
    fn backpressure_on_full() {
        let region = region(128);
        let ring = MsgRing::format(&region, 64, 128).expect("format");
        let payload = vec![0xAB; 48];
        while ring.push(Envelope::new(0, 0), &[&payload]).expect("push") {}
        assert!(!ring.push(Envelope::new(0, 0), &[&payload]).expect("push"));
    }

    #[test]
    fn second_mapping_attaches_to_formatted_ring() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("inbox");
        let a = SharedRegion::create(&path, 4096).expect("create");
        let b = SharedRegion::open(&path).expect("open");
        let producer = MsgRing::format(&a, 128, 1024).expect("format");
        let consumer = MsgRing::attach(&b, 128).expect("attach");
        assert!(producer.push(Envelope::new(2, 1), &[b"ping"]).expect("push"));
        assert_eq!(consumer.pop().expect("pop").expect("record").payload, b"ping");
        assert!(MsgRing::attach(&b, 0).is_err());
    }

    #[test]
    fn doorbell_wakes_parked_consumer() {
        let region = Arc::new(region(512));
        MsgRing::format(&region, 64, 512).expect("format");
        let consumer = {
            let region = Arc::clone(&region);
            thread::spawn(move || {
                let ring = MsgRing::attach(&region, 64).expect("attach");
                loop {
                    if let Some(record) = ring.pop().expect("pop") {
                        return record.payload;
                    }
                    ring.wait_readable(Some(Duration::from_secs(5)));
                }
            })
        };
        thread::sleep(Duration::from_millis(20));
        let ring = MsgRing::attach(&region, 64).expect("attach");
        assert!(ring.push(Envelope::new(3, 1), &[b"wake"]).expect("push"));
        assert_eq!(consumer.join().expect("join"), b"wake");
    }

    #[test]
    fn var_len_stress() {
        let region = region(4096);
        let ring = MsgRing::format(&region, 64, 4096).expect("format");
        let mut rng = StdRng::seed_from_u64(0xC0FFEE);
        let mut expected = VecDeque::<Vec<u8>>::new();

        for _ in 0..5_000 {
            let len = rng.gen_range(1..=ring.max_payload());
            let mut payload = vec![0u8; len];
            rng.fill_bytes(&mut payload);

            loop {
                if ring.push(Envelope::new(0, 1), &[&payload]).expect("push") {
                    expected.push_back(payload);
                    break;
                }
                assert!(
                    drain_expected(&ring, &mut expected),
                    "cannot fit payload of size {len} in empty ring"
                );
            }
        }

        while drain_expected(&ring, &mut expected) {}
        assert!(ring.is_empty());
        assert!(expected.is_empty());
    }
}
