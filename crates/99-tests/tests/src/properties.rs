use crate::support::Harness;
use anyhow::{ensure, Result};
use crossbeam_channel::unbounded;
use fusion::{
    Arena, Call, CallFlags, CallReply, CallRequest, FusionError, Object, ObjectPool,
    ReactionResult, Reactor, ShmPool, World,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

#[test]
fn destructor_runs_once_when_refs_balance() -> Result<()> {
    let h = Harness::new("balance")?;
    let members = (0..3).map(|_| h.member()).collect::<Result<Vec<World>>>()?;
    let destroyed = Arc::new(AtomicUsize::new(0));
    let pools = members
        .iter()
        .map(|world| {
            let destroyed = Arc::clone(&destroyed);
            ObjectPool::create(world, "counted", 8, 0, move |_: &Object, _: bool| {
                destroyed.fetch_add(1, Ordering::SeqCst);
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let object = pools[0].create_object()?;
    thread::scope(|scope| -> Result<()> {
        let workers = pools
            .iter()
            .enumerate()
            .map(|(i, pool)| {
                let id = object.id();
                scope.spawn(move || -> Result<()> {
                    let handle = pool.lookup(id)?;
                    for round in 0..50 {
                        handle.add_ref()?;
                        if (round + i) % 3 == 0 {
                            handle.add_ref()?;
                            handle.unref()?;
                        }
                        handle.unref()?;
                    }
                    Ok(())
                })
            })
            .collect::<Vec<_>>();
        for worker in workers {
            worker.join().map_err(|_| anyhow::anyhow!("worker panicked"))??;
        }
        Ok(())
    })?;

    ensure!(object.refs()? == 1, "only the creator's reference remains");
    ensure!(destroyed.load(Ordering::SeqCst) == 0);
    object.unref()?;
    ensure!(destroyed.load(Ordering::SeqCst) == 1, "exactly one destructor run");
    ensure!(pools[1].is_empty()?);
    Ok(())
}

#[test]
fn used_bytes_match_outstanding_allocations() -> Result<()> {
    let h = Harness::new("accounting")?;
    let members = (0..3).map(|_| h.member()).collect::<Result<Vec<World>>>()?;
    let creator = ShmPool::create(&members[0], "shared", 8 << 20, false)?;
    let pools = members
        .iter()
        .map(|world| ShmPool::attach(world, "shared"))
        .collect::<Result<Vec<_>, _>>()?;

    let kept = thread::scope(|scope| -> Result<Vec<(u64, fusion::ShmPtr)>> {
        let workers = pools
            .iter()
            .enumerate()
            .map(|(i, pool)| {
                scope.spawn(move || -> Result<Vec<(u64, fusion::ShmPtr)>> {
                    let mut kept = Vec::new();
                    for n in 0..200u64 {
                        let size = 16 + (n * 37 + i as u64 * 101) % 700;
                        let ptr = pool.allocate(size, false, true)?;
                        if n % 3 == 0 {
                            kept.push((size, ptr));
                        } else {
                            pool.deallocate(ptr, true)?;
                        }
                    }
                    Ok(kept)
                })
            })
            .collect::<Vec<_>>();
        let mut kept = Vec::new();
        for worker in workers {
            kept.extend(worker.join().map_err(|_| anyhow::anyhow!("worker panicked"))??);
        }
        Ok(kept)
    })?;

    let stats = creator.stats()?;
    ensure!(stats.allocations == kept.len() as u64);
    ensure!(stats.used == kept.iter().map(|(size, _)| size).sum::<u64>());

    for (_, ptr) in kept {
        creator.deallocate(ptr, true)?;
    }
    let stats = creator.stats()?;
    ensure!(stats.used == 0 && stats.allocations == 0, "nothing leaked: {stats:?}");
    Ok(())
}

#[test]
fn every_member_sees_the_initializers_fields() -> Result<()> {
    let h = Harness::new("rendezvous")?;
    let members = (0..5).map(|_| h.member()).collect::<Result<Vec<World>>>()?;
    let inits = AtomicUsize::new(0);
    let joins = AtomicUsize::new(0);
    let barrier = Barrier::new(members.len());

    let seen = thread::scope(|scope| -> Result<Vec<(u64, fusion::ShmPtr)>> {
        let workers = members
            .iter()
            .map(|world| {
                let (inits, joins, barrier) = (&inits, &joins, &barrier);
                scope.spawn(move || -> Result<(u64, fusion::ShmPtr)> {
                    barrier.wait();
                    let arena = Arena::enter(
                        world,
                        "core",
                        |arena| {
                            inits.fetch_add(1, Ordering::SeqCst);
                            let ptr = world.main_pool()?.allocate(256, true, true)?;
                            arena.add_shared_ptr("shared", ptr)?;
                            arena.add_shared_field("creator", u64::from(world.fusion_id().get()))
                        },
                        |_| {
                            joins.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        },
                    )?;
                    Ok((arena.get_shared_field("creator")?, arena.get_shared_ptr("shared")?))
                })
            })
            .collect::<Vec<_>>();
        workers
            .into_iter()
            .map(|w| w.join().map_err(|_| anyhow::anyhow!("worker panicked"))?)
            .collect()
    })?;

    ensure!(inits.load(Ordering::SeqCst) == 1, "exactly one initializer");
    ensure!(joins.load(Ordering::SeqCst) == members.len() - 1);
    ensure!(seen.windows(2).all(|w| w[0] == w[1]), "identical fields: {seen:?}");
    Ok(())
}

#[test]
fn call_payloads_round_trip_byte_for_byte() -> Result<()> {
    let h = Harness::new("echo")?;
    let p1 = h.member()?;
    let p2 = h.member()?;
    let received = Arc::new(Mutex::new(Vec::new()));

    let sink = Arc::clone(&received);
    let call = Call::new(&p1, move |request: CallRequest<'_>| {
        sink.lock().push(request.input.to_vec());
        if request.call_arg < 0 {
            return Err(FusionError::ItemNotFound);
        }
        let mut output = request.input.to_vec();
        output.reverse();
        Ok(CallReply::with_output(request.call_arg, output))
    })?;

    let input = (0..=255u8).cycle().take(1000).collect::<Vec<_>>();
    let mut expected = input.clone();
    expected.reverse();

    let remote = Call::lookup(&p2, call.id())?;
    let reply = remote.execute(CallFlags::empty(), 7, &input)?;
    ensure!(reply.value == 7 && reply.output == expected);

    let reply = call.execute(CallFlags::NODIRECT, 8, &input)?;
    ensure!(reply.value == 8 && reply.output == expected);

    ensure!(matches!(
        remote.execute(CallFlags::empty(), -1, b"missing"),
        Err(FusionError::ItemNotFound)
    ));
    let received = received.lock();
    ensure!(received.len() == 3 && received[0] == input && received[1] == input);
    Ok(())
}

#[test]
fn reactions_keep_attach_order_under_concurrent_attach() -> Result<()> {
    let h = Harness::new("ordering")?;
    let p1 = h.member()?;
    let p2 = h.member()?;
    let p3 = h.member()?;
    let log = Arc::new(Mutex::new(Vec::new()));
    let record = |tag: &'static str| {
        let log = Arc::clone(&log);
        move |message: &[u8]| {
            log.lock().push((tag, message.to_vec()));
            ReactionResult::Keep
        }
    };

    let reactor = Reactor::new(&p1, 16)?;
    reactor.attach(record("L1"))?;
    Reactor::open(&p2, reactor.id())?.attach(record("L2"))?;
    reactor.attach(record("L3"))?;

    let (attached_tx, attached_rx) = unbounded();
    let late = Reactor::open(&p3, reactor.id())?;
    thread::scope(|scope| -> Result<()> {
        let attacher = scope.spawn(|| -> Result<()> {
            let token = late.attach(record("L4"))?;
            attached_tx.send(()).ok();
            late.detach(token)?;
            Ok(())
        });
        reactor.dispatch(b"first", true)?;
        reactor.dispatch(b"second", true)?;
        attacher.join().map_err(|_| anyhow::anyhow!("attacher panicked"))??;
        Ok(())
    })?;
    ensure!(attached_rx.try_recv().is_ok());

    let ordered = log
        .lock()
        .iter()
        .filter(|(tag, _)| *tag != "L4")
        .map(|(tag, message)| format!("{tag}:{}", String::from_utf8_lossy(message)))
        .collect::<Vec<_>>();
    ensure!(
        ordered == ["L1:first", "L2:first", "L3:first", "L1:second", "L2:second", "L3:second"],
        "unexpected order {ordered:?}"
    );
    Ok(())
}
