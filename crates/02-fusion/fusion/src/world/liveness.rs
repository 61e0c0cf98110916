//! Member liveness: heartbeat staleness plus an OS process probe.

use super::layout::{Layout, MemberEntry, MAX_MEMBERS, MEMBER_ACTIVE};
use crate::FusionId;
use fusion_shm::{OwnerProbe, SharedRegion};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Heartbeats older than this many intervals mark a member dead.
const STALE_INTERVALS: u32 = 3;

pub(crate) fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// Read-only view over the member table used by locks, callers and the
/// watch thread to decide whether a peer is still around.
pub(crate) struct Liveness {
    segment: Arc<SharedRegion>,
    layout: Layout,
    interval: Duration,
    own_pid: u32,
}

impl Liveness {
    pub fn new(segment: Arc<SharedRegion>, layout: Layout, interval: Duration) -> Self {
        Self {
            segment,
            layout,
            interval,
            own_pid: std::process::id(),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    fn entry(&self, slot: usize) -> Option<&MemberEntry> {
        self.segment.at(self.layout.member(slot)).ok()
    }

    /// Slot of the active member carrying `fusion_id`.
    pub fn slot_of(&self, fusion_id: FusionId) -> Option<usize> {
        (0..MAX_MEMBERS).find(|&slot| {
            self.entry(slot).is_some_and(|entry| {
                entry.state.load(Ordering::Acquire) == MEMBER_ACTIVE
                    && entry.fusion_id.load(Ordering::Acquire) == fusion_id.get()
            })
        })
    }

    /// Whether the member in `entry` still heartbeats and its process exists.
    pub fn entry_alive(&self, entry: &MemberEntry) -> bool {
        member_alive(entry, self.interval, self.own_pid)
    }

    /// Whether `fusion_id` names an active, live member.
    pub fn is_member_alive(&self, fusion_id: FusionId) -> bool {
        self.slot_of(fusion_id)
            .and_then(|slot| self.entry(slot))
            .is_some_and(|entry| self.entry_alive(entry))
    }
}

impl OwnerProbe for Liveness {
    fn is_alive(&self, fusion_id: u32) -> bool {
        self.is_member_alive(FusionId(fusion_id))
    }
}

/// Heartbeat and process check for one member entry. The process probe is
/// skipped for members living in `own_pid`.
pub(crate) fn member_alive(entry: &MemberEntry, interval: Duration, own_pid: u32) -> bool {
    let beat = entry.heartbeat.load(Ordering::Acquire);
    let stale = interval.as_nanos() as u64 * u64::from(STALE_INTERVALS);
    if now_nanos().saturating_sub(beat) > stale {
        return false;
    }
    let pid = entry.pid.load(Ordering::Acquire);
    pid == own_pid || process_exists(pid)
}

#[cfg(unix)]
pub(crate) fn process_exists(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    // SAFETY: signal 0 performs only the existence and permission check.
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
}

#[cfg(not(unix))]
pub(crate) fn process_exists(pid: u32) -> bool {
    pid != 0
}
