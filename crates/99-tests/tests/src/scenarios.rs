use crate::support::{eventually, Harness};
use anyhow::{ensure, Context, Result};
use fusion::{
    Call, CallFlags, CallReply, CallRequest, FusionError, Object, ObjectPool, ShmPool,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Counts destructor runs, and how many of them were zombies.
#[derive(Clone, Default)]
struct Tally {
    runs: Arc<AtomicUsize>,
    zombies: Arc<AtomicUsize>,
}

impl Tally {
    fn destructor(&self) -> impl Fn(&Object, bool) + Send + Sync + 'static {
        let tally = self.clone();
        move |_: &Object, zombie: bool| {
            tally.runs.fetch_add(1, Ordering::SeqCst);
            if zombie {
                tally.zombies.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    fn zombies(&self) -> usize {
        self.zombies.load(Ordering::SeqCst)
    }
}

#[test]
fn shared_object_survives_until_the_last_unref() -> Result<()> {
    let h = Harness::new("test")?;
    let p1 = h.member()?;
    ensure!(p1.is_master(), "first member is master");
    let p2 = h.member()?;

    let (t1, t2) = (Tally::default(), Tally::default());
    let surfaces1 = ObjectPool::create(&p1, "Surfaces", 64, 32, t1.destructor())?;
    let surfaces2 = ObjectPool::create(&p2, "Surfaces", 64, 32, t2.destructor())?;

    let object = surfaces1.create_object()?;
    let seen = surfaces2.lookup(object.id())?;
    seen.add_ref()?;
    object.unref()?;
    ensure!(seen.refs()? == 1, "object still live with one reference");
    ensure!(t1.runs() + t2.runs() == 0, "no destructor yet");

    seen.unref()?;
    ensure!(t2.runs() == 1 && t2.zombies() == 0, "p2 destroys, not a zombie");
    ensure!(t1.runs() == 0, "p1 never destroys");
    Ok(())
}

#[test]
fn call_doubles_its_input_across_members() -> Result<()> {
    let h = Harness::new("double")?;
    let p1 = h.member()?;
    let p2 = h.member()?;

    let call = Call::new(&p1, |request: CallRequest<'_>| {
        let bytes: [u8; 4] = request
            .input
            .try_into()
            .map_err(|_| FusionError::InvalidArgument("expected an i32"))?;
        let doubled = i32::from_le_bytes(bytes) * 2;
        Ok(CallReply::with_output(0, doubled.to_le_bytes().to_vec()))
    })?;

    let remote = Call::lookup(&p2, call.id())?;
    let reply = remote.execute(CallFlags::empty(), 0, &21i32.to_le_bytes())?;
    let output: [u8; 4] = reply.output.as_slice().try_into().context("reply size")?;
    ensure!(i32::from_le_bytes(output) == 42, "21 doubled");
    ensure!(reply.value == 0);
    Ok(())
}

#[test]
fn dead_masters_objects_become_zombies() -> Result<()> {
    let h = Harness::new("zombie")?;
    let p1 = h.member()?;
    let p2 = h.member()?;

    let tally = Tally::default();
    let pool1 = ObjectPool::create(&p1, "Surfaces", 16, 8, |_: &Object, _: bool| {})?;
    let pool2 = ObjectPool::create(&p2, "Surfaces", 16, 8, tally.destructor())?;
    let object = pool1.create_object()?;
    let held = pool2.lookup(object.id())?;
    held.add_ref()?;
    p1.abandon();

    eventually(Duration::from_secs(5), "p2 promoted", || p2.is_master())?;
    eventually(Duration::from_secs(5), "p1's reference reaped", || {
        held.refs().is_ok_and(|refs| refs == 1)
    })?;
    ensure!(tally.runs() == 0);

    held.unref()?;
    ensure!(tally.runs() == 1 && tally.zombies() == 1, "destroyed as a zombie");
    ensure!(pool2.is_empty()?);
    Ok(())
}

#[test]
fn pool_ceiling_is_enforced_and_recovers() -> Result<()> {
    let h = Harness::new("ceiling")?;
    let p1 = h.member()?;
    let pool = ShmPool::create(&p1, "playback", 64 * 1024, false)?;

    let first = pool.allocate(40 * 1024, false, true)?;
    let err = pool
        .allocate(40 * 1024, false, true)
        .expect_err("second block exceeds the ceiling");
    ensure!(matches!(err, FusionError::OutOfMemory), "got {err}");
    ensure!(matches!(
        pool.allocate(128 * 1024, false, true),
        Err(FusionError::OutOfMemory)
    ));

    pool.deallocate(first, true)?;
    let again = pool.allocate(40 * 1024, true, true)?;
    pool.deallocate(again, true)?;
    ensure!(pool.stats()?.allocations == 0);
    Ok(())
}
