//! Cross-member calls.
//!
//! A call is an entry in the world's call table owned by the member that
//! registers its handler. Executing it from another member pushes a request
//! record into the owner's inbox ring. The owner's dispatcher thread hands
//! the request to the worker thread of that call id, which runs the handler
//! and posts the answer into a reply slot the caller is parked on.
//!
//! Reply slots move `FREE -> PENDING` (caller), `PENDING -> WRITING -> DONE`
//! (callee) and back to `FREE` (caller). A caller that gives up swaps in
//! `ABANDONED`; whoever meets the slot next returns it to the free ring.
//!
//! Request record payload, little endian:
//!
//! ```text
//! [u32 call id][i32 call arg][u32 caller][u32 reply slot][u32 serial][u32 input len][input ...]
//! ```

use crate::config::CallMode;
use crate::world::layout::{CallEntry, MemberEntry, ENTRY_ACTIVE, ENTRY_EMPTY, MAX_CALLS, NO_SLOT};
use crate::world::{World, WorldInner};
use crate::{object, reactor, CallId, ErrorCode, FusionError, FusionId, FusionResult};
use bitflags::bitflags;
use crossbeam_channel::{unbounded, Receiver, Sender};
use fusion_shm::wait::wake_all;
use fusion_shm::{Envelope, Record, SlotPool, SLOT_FREE};
use parking_lot::Mutex;
use std::cell::Cell;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

const REPLY_PENDING: u32 = 1;
const REPLY_WRITING: u32 = 2;
const REPLY_DONE: u32 = 3;
const REPLY_ABANDONED: u32 = 4;

const TAG_CALL: u8 = 1;
const WIRE_VERSION: u8 = 1;
const REQUEST_HEADER: usize = 24;

bitflags! {
    /// Execution flags of [`Call::execute`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CallFlags: u16 {
        /// Return once the request is queued; no result is observed.
        const ONEWAY   = 0b0001;
        /// Always go through the owner's queue. Implies `ONEWAY`.
        const QUEUE    = 0b0010;
        /// Never invoke the handler inline, even from the owning member.
        const NODIRECT = 0b0100;
    }
}

/// What a handler sees of one request.
#[derive(Clone, Copy, Debug)]
pub struct CallRequest<'a> {
    pub caller: FusionId,
    pub call_arg: i32,
    pub flags: CallFlags,
    pub input: &'a [u8],
}

/// Handler answer: a return value plus output bytes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CallReply {
    pub value: i32,
    pub output: Vec<u8>,
}

impl CallReply {
    pub fn value(value: i32) -> Self {
        Self {
            value,
            output: Vec::new(),
        }
    }

    pub fn with_output(value: i32, output: impl Into<Vec<u8>>) -> Self {
        Self {
            value,
            output: output.into(),
        }
    }
}

pub type CallResult = FusionResult<CallReply>;

/// Serves the requests of one call.
pub trait CallHandler: Send + Sync + 'static {
    fn handle(&self, request: CallRequest<'_>) -> CallResult;
}

impl<F> CallHandler for F
where
    F: Fn(CallRequest<'_>) -> CallResult + Send + Sync + 'static,
{
    fn handle(&self, request: CallRequest<'_>) -> CallResult {
        self(request)
    }
}

thread_local! {
    /// World token and call id served by the current worker thread.
    static SERVING: Cell<Option<(u64, CallId)>> = const { Cell::new(None) };
}

/// Whether the current thread is the worker serving `id` in `world`.
pub(crate) fn is_serving(world: &WorldInner, id: CallId) -> bool {
    SERVING.with(|cell| cell.get() == Some((world.token, id)))
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Request {
    call: CallId,
    call_arg: i32,
    caller: FusionId,
    reply_slot: u32,
    serial: u32,
    input: Vec<u8>,
}

impl Request {
    fn header(
        call: CallId,
        call_arg: i32,
        caller: FusionId,
        reply_slot: u32,
        serial: u32,
        input_len: usize,
    ) -> [u8; REQUEST_HEADER] {
        let mut out = [0u8; REQUEST_HEADER];
        out[0..4].copy_from_slice(&call.get().to_le_bytes());
        out[4..8].copy_from_slice(&call_arg.to_le_bytes());
        out[8..12].copy_from_slice(&caller.get().to_le_bytes());
        out[12..16].copy_from_slice(&reply_slot.to_le_bytes());
        out[16..20].copy_from_slice(&serial.to_le_bytes());
        out[20..24].copy_from_slice(&(input_len as u32).to_le_bytes());
        out
    }

    fn decode(record: &Record) -> FusionResult<(Request, CallFlags)> {
        if record.envelope.tag != TAG_CALL {
            return Err(FusionError::Unsupported("unknown inbox record tag"));
        }
        if record.envelope.ver != WIRE_VERSION {
            return Err(FusionError::Unsupported("call record version mismatch"));
        }
        let payload = &record.payload;
        if payload.len() < REQUEST_HEADER {
            return Err(FusionError::InvalidArgument("truncated call record"));
        }
        let word = |at: usize| {
            u32::from_le_bytes([payload[at], payload[at + 1], payload[at + 2], payload[at + 3]])
        };
        let len = word(20) as usize;
        if payload.len() != REQUEST_HEADER + len {
            return Err(FusionError::InvalidArgument("call record length mismatch"));
        }
        let request = Request {
            call: CallId(word(0)),
            call_arg: word(4) as i32,
            caller: FusionId(word(8)),
            reply_slot: word(12),
            serial: word(16),
            input: payload[REQUEST_HEADER..].to_vec(),
        };
        Ok((request, CallFlags::from_bits_truncate(record.envelope.flags)))
    }
}

struct Job {
    request: Request,
    flags: CallFlags,
}

struct Worker {
    jobs: Sender<Job>,
    thread: JoinHandle<()>,
}

/// Handlers registered by this process plus the worker thread per call id.
#[derive(Default)]
pub(crate) struct LocalCalls {
    handlers: Mutex<HashMap<CallId, Arc<dyn CallHandler>>>,
    workers: Mutex<HashMap<CallId, Worker>>,
}

impl LocalCalls {
    fn handler(&self, id: CallId) -> Option<Arc<dyn CallHandler>> {
        self.handlers.lock().get(&id).cloned()
    }

    fn set_handler(&self, id: CallId, handler: Arc<dyn CallHandler>) {
        self.handlers.lock().insert(id, handler);
    }

    /// Forgets the handler; the worker drains its queue and exits.
    fn remove(&self, id: CallId) {
        self.handlers.lock().remove(&id);
        self.workers.lock().remove(&id);
    }
}

/// Handle on an entry of the world's call table.
#[derive(Clone)]
pub struct Call {
    world: Arc<WorldInner>,
    id: CallId,
    index: usize,
}

impl Call {
    /// Creates a call owned by this member. Requests arriving before
    /// [`Call::register`] fail with [`FusionError::Unsupported`].
    pub fn init(world: &World) -> FusionResult<Call> {
        let inner = world.inner();
        inner.check_active()?;
        let (index, id) = claim_entry(inner)?;
        Ok(Call {
            world: Arc::clone(inner),
            id,
            index,
        })
    }

    /// [`Call::init`] followed by [`Call::register`].
    pub fn new(world: &World, handler: impl CallHandler) -> FusionResult<Call> {
        let call = Self::init(world)?;
        call.register(handler)?;
        Ok(call)
    }

    /// Installs the handler serving this call. Only the owner may.
    pub fn register(&self, handler: impl CallHandler) -> FusionResult<()> {
        if self.owner()? != self.world.fusion_id {
            return Err(FusionError::InvalidArgument(
                "only the owning member registers a handler",
            ));
        }
        self.world.calls.set_handler(self.id, Arc::new(handler));
        debug!(call = %self.id, "registered call handler");
        Ok(())
    }

    /// Handle on a call registered by any member.
    pub fn lookup(world: &World, id: CallId) -> FusionResult<Call> {
        let inner = world.inner();
        inner.check_active()?;
        for index in 0..MAX_CALLS {
            let entry: &CallEntry = inner.segment.at(inner.layout.call(index))?;
            if entry.state.load(Ordering::Acquire) == ENTRY_ACTIVE
                && entry.id.load(Ordering::Acquire) == id.get()
            {
                return Ok(Call {
                    world: Arc::clone(inner),
                    id,
                    index,
                });
            }
        }
        Err(FusionError::ItemNotFound)
    }

    pub fn id(&self) -> CallId {
        self.id
    }

    /// Member serving this call.
    pub fn owner(&self) -> FusionResult<FusionId> {
        let entry: &CallEntry = self.world.segment.at(self.world.layout.call(self.index))?;
        if entry.state.load(Ordering::Acquire) != ENTRY_ACTIVE
            || entry.id.load(Ordering::Acquire) != self.id.get()
        {
            return Err(FusionError::Destroyed);
        }
        Ok(FusionId(entry.owner.load(Ordering::Acquire)))
    }

    /// Runs the call with the configured timeout, if any.
    pub fn execute(&self, flags: CallFlags, call_arg: i32, input: &[u8]) -> CallResult {
        execute(&self.world, self.id, self.index, flags, call_arg, input, self.world.config.call_timeout)
    }

    /// Runs the call, failing with [`FusionError::Timeout`] once `timeout`
    /// passes without an answer.
    pub fn execute_timeout(
        &self,
        flags: CallFlags,
        call_arg: i32,
        input: &[u8],
        timeout: Duration,
    ) -> CallResult {
        execute(&self.world, self.id, self.index, flags, call_arg, input, Some(timeout))
    }

    /// Removes the call. Requests still queued are answered with
    /// [`FusionError::Destroyed`].
    pub fn destroy(self) -> FusionResult<()> {
        if self.owner()? != self.world.fusion_id {
            return Err(FusionError::InvalidArgument("only the owning member destroys a call"));
        }
        release_entry(&self.world, self.index, self.id)?;
        self.world.calls.remove(self.id);
        debug!(call = %self.id, "destroyed call");
        Ok(())
    }
}

impl fmt::Debug for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Call")
            .field("id", &self.id)
            .field("index", &self.index)
            .finish()
    }
}

fn claim_entry(world: &WorldInner) -> FusionResult<(usize, CallId)> {
    let header = world.header()?;
    let _guard = world.lock(&header.call_lock)?;
    for index in 0..MAX_CALLS {
        let entry: &CallEntry = world.segment.at(world.layout.call(index))?;
        if entry.state.load(Ordering::Acquire) != ENTRY_EMPTY {
            continue;
        }
        let id = CallId(header.next_call_id.fetch_add(1, Ordering::AcqRel));
        entry.id.store(id.get(), Ordering::Relaxed);
        entry.owner.store(world.fusion_id.get(), Ordering::Relaxed);
        entry.state.store(ENTRY_ACTIVE, Ordering::Release);
        return Ok((index, id));
    }
    Err(FusionError::LimitExceeded("call table is full"))
}

fn release_entry(world: &WorldInner, index: usize, id: CallId) -> FusionResult<()> {
    let header = world.header()?;
    let _guard = world.lock(&header.call_lock)?;
    let entry: &CallEntry = world.segment.at(world.layout.call(index))?;
    if entry.state.load(Ordering::Acquire) != ENTRY_ACTIVE || entry.id.load(Ordering::Acquire) != id.get() {
        return Err(FusionError::Destroyed);
    }
    entry.state.store(ENTRY_EMPTY, Ordering::Release);
    entry.owner.store(0, Ordering::Relaxed);
    Ok(())
}

fn call_owner(world: &WorldInner, index: usize, id: CallId) -> FusionResult<FusionId> {
    let entry: &CallEntry = world.segment.at(world.layout.call(index))?;
    if entry.state.load(Ordering::Acquire) != ENTRY_ACTIVE || entry.id.load(Ordering::Acquire) != id.get() {
        return Err(FusionError::Destroyed);
    }
    Ok(FusionId(entry.owner.load(Ordering::Acquire)))
}

fn is_registered(world: &WorldInner, id: CallId) -> bool {
    (0..MAX_CALLS)
        .any(|index| matches!(call_owner(world, index, id), Ok(owner) if owner == world.fusion_id))
}

/// Runs a local handler, or explains why there is none.
fn run_local(world: &WorldInner, id: CallId, request: CallRequest<'_>) -> CallResult {
    match world.calls.handler(id) {
        Some(handler) => handler.handle(request),
        None if is_registered(world, id) => Err(FusionError::Unsupported("no handler registered")),
        None => Err(FusionError::Destroyed),
    }
}

pub(crate) fn execute(
    world: &WorldInner,
    id: CallId,
    index: usize,
    mut flags: CallFlags,
    call_arg: i32,
    input: &[u8],
    timeout: Option<Duration>,
) -> CallResult {
    world.check_active()?;
    if flags.contains(CallFlags::QUEUE) {
        flags |= CallFlags::ONEWAY | CallFlags::NODIRECT;
    }
    let owner = call_owner(world, index, id)?;
    let direct = owner == world.fusion_id
        && world.config.call_mode == CallMode::Direct
        && !flags.contains(CallFlags::NODIRECT);
    if direct {
        let result = run_local(
            world,
            id,
            CallRequest {
                caller: world.fusion_id,
                call_arg,
                flags,
                input,
            },
        );
        return if flags.contains(CallFlags::ONEWAY) {
            Ok(CallReply::default())
        } else {
            result
        };
    }

    let oneway = flags.contains(CallFlags::ONEWAY);
    let (slot, serial) = if oneway {
        (NO_SLOT, 0)
    } else {
        acquire_reply(world, owner)?
    };
    let header = Request::header(id, call_arg, world.fusion_id, slot, serial, input.len());
    if let Err(err) = send(world, owner, flags, &header, input) {
        if slot != NO_SLOT {
            release_reply(world, slot);
        }
        return Err(err);
    }
    if oneway {
        return Ok(CallReply::default());
    }
    await_reply(world, owner, slot, timeout)
}

fn acquire_reply(world: &WorldInner, owner: FusionId) -> FusionResult<(u32, u32)> {
    let header = world.header()?;
    let _guard = world.lock(&header.call_lock)?;
    let replies = world.replies()?;
    let slot = replies
        .try_acquire(REPLY_PENDING)?
        .ok_or(FusionError::Busy)?;
    let reply = replies.header(slot)?;
    reply.owner.store(world.fusion_id.get(), Ordering::Relaxed);
    reply.peer.store(owner.get(), Ordering::Relaxed);
    reply.value.store(0, Ordering::Relaxed);
    reply.len.store(0, Ordering::Relaxed);
    reply.code.store(ErrorCode::Ok as u32, Ordering::Release);
    Ok((slot, reply.generation.load(Ordering::Acquire)))
}

fn release_reply(world: &WorldInner, slot: u32) {
    let result = world.header().and_then(|header| {
        let _guard = world.lock(&header.call_lock)?;
        world.replies()?.release(slot)?;
        Ok(())
    });
    if let Err(err) = result {
        warn!(slot, "failed to release reply slot: {err}");
    }
}

fn send(
    world: &WorldInner,
    owner: FusionId,
    flags: CallFlags,
    header: &[u8],
    input: &[u8],
) -> FusionResult<()> {
    let slot = world.liveness.slot_of(owner).ok_or(FusionError::Destroyed)?;
    let member = world.member(slot)?;
    let inbox = world.inbox(slot)?;
    if header.len() + input.len() > inbox.max_payload() {
        return Err(FusionError::LimitExceeded("call input exceeds the inbox record size"));
    }
    let _guard = world.lock(&member.inbox_lock)?;
    if member.fusion_id.load(Ordering::Acquire) != owner.get() {
        return Err(FusionError::Destroyed);
    }
    let envelope = Envelope::new(TAG_CALL, WIRE_VERSION).with_flags(flags.bits());
    if !inbox.push(envelope, &[header, input])? {
        return Err(FusionError::Busy);
    }
    Ok(())
}

fn await_reply(
    world: &WorldInner,
    owner: FusionId,
    slot: u32,
    timeout: Option<Duration>,
) -> CallResult {
    let deadline = timeout.map(|t| Instant::now() + t);
    let poll = world.liveness.interval();
    let replies = world.replies()?;
    let reply = replies.header(slot)?;
    loop {
        let state = reply.state.load(Ordering::Acquire);
        if state == REPLY_DONE {
            return take_reply(world, &replies, slot);
        }
        if state != REPLY_PENDING && state != REPLY_WRITING {
            return Err(FusionError::Destroyed);
        }
        let gone = world.check_active().is_err() || !world.liveness.is_member_alive(owner);
        let expired = deadline.is_some_and(|d| Instant::now() >= d);
        if gone || expired {
            if reply
                .state
                .compare_exchange(state, REPLY_ABANDONED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Err(if gone {
                    FusionError::Destroyed
                } else {
                    FusionError::Timeout
                });
            }
            continue;
        }
        let wait = deadline.map_or(poll, |d| d.saturating_duration_since(Instant::now()).min(poll));
        reply.wait_state(state, Some(wait));
    }
}

fn take_reply(world: &WorldInner, replies: &SlotPool<'_>, slot: u32) -> CallResult {
    let reply = replies.header(slot)?;
    let code = ErrorCode::from_u32(reply.code.load(Ordering::Acquire)).unwrap_or(ErrorCode::Failure);
    let value = reply.value.load(Ordering::Relaxed) as i32;
    let len = reply.len.load(Ordering::Relaxed) as usize;
    let mut output = vec![0u8; len.min(replies.payload_size())];
    let read = replies.read_payload(slot, &mut output);
    release_reply(world, slot);
    code.into_result()?;
    read?;
    Ok(CallReply { value, output })
}

fn post_reply(world: &WorldInner, slot: u32, serial: u32, result: &CallResult) {
    if let Err(err) = try_post_reply(world, slot, serial, result) {
        error!(slot, "failed to post call reply: {err}");
    }
}

fn try_post_reply(world: &WorldInner, slot: u32, serial: u32, result: &CallResult) -> FusionResult<()> {
    let replies = world.replies()?;
    let reply = replies.header(slot)?;
    if reply.generation.load(Ordering::Acquire) != serial {
        return Ok(());
    }
    if reply
        .state
        .compare_exchange(REPLY_PENDING, REPLY_WRITING, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return release_abandoned(world, slot);
    }
    let code = match result {
        Ok(answer) if answer.output.len() <= replies.payload_size() => {
            replies.write_payload(slot, &answer.output)?;
            reply.value.store(answer.value as u32, Ordering::Relaxed);
            reply.len.store(answer.output.len() as u32, Ordering::Relaxed);
            ErrorCode::Ok
        }
        Ok(_) => ErrorCode::LimitExceeded,
        Err(err) => err.code(),
    };
    reply.code.store(code as u32, Ordering::Relaxed);
    match reply
        .state
        .compare_exchange(REPLY_WRITING, REPLY_DONE, Ordering::AcqRel, Ordering::Acquire)
    {
        Ok(_) => {
            wake_all(&reply.state);
            Ok(())
        }
        Err(_) => release_abandoned(world, slot),
    }
}

fn release_abandoned(world: &WorldInner, slot: u32) -> FusionResult<()> {
    let header = world.header()?;
    let _guard = world.lock(&header.call_lock)?;
    let replies = world.replies()?;
    if replies.header(slot)?.state.load(Ordering::Acquire) == REPLY_ABANDONED {
        replies.release(slot)?;
    }
    Ok(())
}

pub(crate) fn spawn_dispatcher(world: &Arc<WorldInner>) -> FusionResult<JoinHandle<()>> {
    let world = Arc::clone(world);
    thread::Builder::new()
        .name(format!("fusion-dispatch-{}", world.fusion_id))
        .spawn(move || dispatch_loop(world))
        .map_err(|_| FusionError::Failed)
}

fn dispatch_loop(world: Arc<WorldInner>) {
    let interval = world.liveness.interval();
    while !world.is_stopping() {
        let inbox = match world.inbox(world.slot) {
            Ok(inbox) => inbox,
            Err(err) => {
                error!(world = %world.name, "inbox unavailable: {err}");
                break;
            }
        };
        match inbox.pop() {
            Ok(Some(record)) => accept(&world, &record),
            Ok(None) => {
                inbox.wait_readable(Some(interval));
            }
            Err(err) => {
                error!(world = %world.name, "inbox corrupt, dropping pending records: {err}");
                inbox.reset();
            }
        }
    }
    debug!(world = %world.name, "dispatcher stopped");
}

fn accept(world: &Arc<WorldInner>, record: &Record) {
    match Request::decode(record) {
        Ok((request, flags)) => submit(world, Job { request, flags }),
        Err(err) => error!(world = %world.name, "dropping undecodable inbox record: {err}"),
    }
}

fn submit(world: &Arc<WorldInner>, job: Job) {
    let id = job.request.call;
    let mut workers = world.calls.workers.lock();
    let worker = match workers.entry(id) {
        Entry::Occupied(occupied) => occupied.into_mut(),
        Entry::Vacant(vacant) => {
            let (tx, rx) = unbounded();
            let owner = Arc::clone(world);
            let spawned = thread::Builder::new()
                .name(format!("fusion-call-{id}"))
                .spawn(move || worker_loop(owner, id, rx));
            match spawned {
                Ok(thread) => vacant.insert(Worker { jobs: tx, thread }),
                Err(err) => {
                    drop(workers);
                    error!(call = %id, "failed to spawn call worker: {err}");
                    answer(world, &job, &Err(FusionError::Failed));
                    return;
                }
            }
        }
    };
    if let Err(rejected) = worker.jobs.send(job) {
        drop(workers);
        answer(world, &rejected.0, &Err(FusionError::Destroyed));
    }
}

fn worker_loop(world: Arc<WorldInner>, id: CallId, jobs: Receiver<Job>) {
    SERVING.with(|cell| cell.set(Some((world.token, id))));
    for job in jobs.iter() {
        let result = run_local(
            &world,
            id,
            CallRequest {
                caller: job.request.caller,
                call_arg: job.request.call_arg,
                flags: job.flags,
                input: &job.request.input,
            },
        );
        answer(&world, &job, &result);
    }
    debug!(call = %id, "call worker stopped");
}

fn answer(world: &WorldInner, job: &Job, result: &CallResult) {
    if job.request.reply_slot != NO_SLOT {
        post_reply(world, job.request.reply_slot, job.request.serial, result);
    } else if let Err(err) = result {
        debug!(call = %job.request.call, caller = %job.request.caller, "one-way call failed: {err}");
    }
}

/// Joins every worker thread of this member. Queued requests are served
/// first.
pub(crate) fn stop_workers(world: &WorldInner) {
    let workers: Vec<Worker> = world.calls.workers.lock().drain().map(|(_, w)| w).collect();
    let current = thread::current().id();
    for Worker { jobs, thread } in workers {
        drop(jobs);
        if thread.thread().id() == current {
            continue;
        }
        if thread.join().is_err() {
            warn!(world = %world.name, "call worker panicked");
        }
    }
}

/// Calls every member registers on entry so peers can reach it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum MemberCall {
    /// Runs listed local reactions; the call arg is the channel.
    Reactions,
    /// Runs the local destructor of an object another member doomed; the
    /// call arg is the zombie flag.
    Destructors,
}

impl MemberCall {
    fn local(self, world: &WorldInner) -> &AtomicU32 {
        match self {
            MemberCall::Reactions => &world.reactor_call,
            MemberCall::Destructors => &world.destroy_call,
        }
    }

    fn shared(self, entry: &MemberEntry) -> &AtomicU32 {
        match self {
            MemberCall::Reactions => &entry.reactor_call,
            MemberCall::Destructors => &entry.destroy_call,
        }
    }

    fn serve(self, world: &Arc<WorldInner>, request: CallRequest<'_>) -> CallResult {
        match self {
            MemberCall::Reactions => reactor::deliver_remote(world, request),
            MemberCall::Destructors => object::destroy_remote(world, request),
        }
    }
}

/// Registers `kind` for this member.
pub(crate) fn install_member_call(world: &Arc<WorldInner>, kind: MemberCall) -> FusionResult<()> {
    let (_, id) = claim_entry(world)?;
    let weak = Arc::downgrade(world);
    world.calls.set_handler(
        id,
        Arc::new(move |request: CallRequest<'_>| match weak.upgrade() {
            Some(world) => kind.serve(&world, request),
            None => Err(FusionError::Destroyed),
        }),
    );
    kind.local(world).store(id.get(), Ordering::Release);
    kind.shared(world.own_member()?).store(id.get(), Ordering::Release);
    Ok(())
}

pub(crate) fn remove_member_call(world: &Arc<WorldInner>, kind: MemberCall) {
    let id = CallId(kind.local(world).swap(0, Ordering::AcqRel));
    if id.get() == 0 {
        return;
    }
    if let Ok(entry) = world.own_member() {
        kind.shared(entry).store(0, Ordering::Release);
    }
    let index = (0..MAX_CALLS).find(|&index| call_owner(world, index, id).is_ok());
    if let Some(index) = index {
        if let Err(err) = release_entry(world, index, id) {
            debug!(call = %id, ?kind, "member call already gone: {err}");
        }
    }
    world.calls.remove(id);
}

/// Runs the `kind` call of `target` synchronously.
pub(crate) fn execute_member_call(
    world: &WorldInner,
    kind: MemberCall,
    target: FusionId,
    flags: CallFlags,
    call_arg: i32,
    input: &[u8],
) -> CallResult {
    let slot = world.liveness.slot_of(target).ok_or(FusionError::Destroyed)?;
    let id = CallId(kind.shared(world.member(slot)?).load(Ordering::Acquire));
    if id.get() == 0 {
        return Err(FusionError::Destroyed);
    }
    let index = (0..MAX_CALLS)
        .find(|&index| matches!(call_owner(world, index, id), Ok(owner) if owner == target))
        .ok_or(FusionError::Destroyed)?;
    execute(world, id, index, flags, call_arg, input, None)
}

/// Drops the calls owned by a departed member and settles every reply slot
/// it was part of. Caller holds the world lock.
pub(crate) fn reap_member(world: &WorldInner, fusion_id: FusionId) -> FusionResult<()> {
    let header = world.header()?;
    let _guard = world.lock(&header.call_lock)?;
    let mut dropped = 0;
    for index in 0..MAX_CALLS {
        let entry: &CallEntry = world.segment.at(world.layout.call(index))?;
        if entry.state.load(Ordering::Acquire) == ENTRY_ACTIVE
            && entry.owner.load(Ordering::Acquire) == fusion_id.get()
        {
            entry.state.store(ENTRY_EMPTY, Ordering::Release);
            entry.owner.store(0, Ordering::Relaxed);
            dropped += 1;
        }
    }
    let replies = world.replies()?;
    for slot in replies.busy_slots()? {
        let reply = replies.header(slot)?;
        let caller_gone = reply.owner.load(Ordering::Acquire) == fusion_id.get();
        let callee_gone = reply.peer.load(Ordering::Acquire) == fusion_id.get();
        if caller_gone || callee_gone {
            settle_reply(&replies, slot, caller_gone, callee_gone)?;
        }
    }
    if dropped > 0 {
        debug!(member = %fusion_id, dropped, "dropped calls of departed member");
    }
    Ok(())
}

fn settle_reply(
    replies: &SlotPool<'_>,
    slot: u32,
    caller_gone: bool,
    callee_gone: bool,
) -> FusionResult<()> {
    let reply = replies.header(slot)?;
    loop {
        let state = reply.state.load(Ordering::Acquire);
        let release = match state {
            SLOT_FREE => false,
            _ if caller_gone && callee_gone => true,
            REPLY_DONE => caller_gone,
            REPLY_ABANDONED => callee_gone,
            _ if callee_gone => {
                reply.len.store(0, Ordering::Relaxed);
                reply.code.store(ErrorCode::Destroyed as u32, Ordering::Relaxed);
                if reply
                    .state
                    .compare_exchange(state, REPLY_DONE, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    continue;
                }
                wake_all(&reply.state);
                false
            }
            _ => {
                if reply
                    .state
                    .compare_exchange(state, REPLY_ABANDONED, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    continue;
                }
                false
            }
        };
        if release {
            replies.release(slot)?;
        }
        return Ok(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{wait_until, TestWorld};
    use crate::FusionConfig;
    use crossbeam_channel::bounded;

    fn doubler() -> impl CallHandler {
        |request: CallRequest<'_>| {
            let bytes: [u8; 4] = request
                .input
                .try_into()
                .map_err(|_| FusionError::InvalidArgument("expected an i32"))?;
            let doubled = i32::from_le_bytes(bytes) * 2;
            Ok(CallReply::with_output(doubled, doubled.to_le_bytes()))
        }
    }

    #[test]
    fn request_records_decode_what_was_encoded() {
        let header = Request::header(CallId(7), -3, FusionId(2), 5, 9, 3);
        let record = Record {
            envelope: Envelope::new(TAG_CALL, WIRE_VERSION).with_flags(CallFlags::NODIRECT.bits()),
            payload: [&header[..], b"abc"].concat(),
        };
        let (request, flags) = Request::decode(&record).expect("decode");
        assert_eq!(request.call, CallId(7));
        assert_eq!(request.call_arg, -3);
        assert_eq!(request.caller, FusionId(2));
        assert_eq!((request.reply_slot, request.serial), (5, 9));
        assert_eq!(request.input, b"abc");
        assert_eq!(flags, CallFlags::NODIRECT);

        let truncated = Record {
            payload: header[..10].to_vec(),
            ..record
        };
        assert!(Request::decode(&truncated).is_err());
    }

    #[test]
    fn bytes_round_trip_between_members() {
        let t = TestWorld::new("call-echo");
        let p1 = t.enter();
        let p2 = t.enter();
        let call = Call::new(&p1, |request: CallRequest<'_>| {
            let mut output = request.input.to_vec();
            output.reverse();
            Ok(CallReply::with_output(request.call_arg + 1, output))
        })
        .expect("register");

        let remote = Call::lookup(&p2, call.id()).expect("lookup");
        assert_eq!(remote.owner().expect("owner"), p1.fusion_id());
        let input: Vec<u8> = (0..=255).collect();
        let reply = remote.execute(CallFlags::empty(), 41, &input).expect("execute");
        assert_eq!(reply.value, 42);
        let mut expected = input.clone();
        expected.reverse();
        assert_eq!(reply.output, expected, "output must arrive byte-identical");
    }

    #[test]
    fn handler_errors_travel_as_codes() {
        let t = TestWorld::new("call-errors");
        let p1 = t.enter();
        let p2 = t.enter();
        let call = Call::new(&p1, doubler()).expect("register");
        let remote = Call::lookup(&p2, call.id()).expect("lookup");
        assert!(matches!(
            remote.execute(CallFlags::empty(), 0, b"odd"),
            Err(FusionError::InvalidArgument(_))
        ));
        assert!(matches!(
            Call::lookup(&p2, CallId(999)),
            Err(FusionError::ItemNotFound)
        ));
    }

    #[test]
    fn nodirect_goes_through_the_owners_dispatcher() {
        let t = TestWorld::new("call-nodirect");
        let p1 = t.enter();
        let (tx, rx) = bounded(4);
        let call = Call::new(&p1, move |_: CallRequest<'_>| {
            tx.send(thread::current().name().map(str::to_owned)).ok();
            Ok(CallReply::value(1))
        })
        .expect("register");

        call.execute(CallFlags::empty(), 0, &[]).expect("direct");
        let direct = rx.recv().expect("direct run");
        call.execute(CallFlags::NODIRECT, 0, &[]).expect("indirect");
        let indirect = rx.recv().expect("indirect run");
        assert_ne!(direct, indirect);
        assert_eq!(indirect.as_deref(), Some(format!("fusion-call-{}", call.id()).as_str()));
    }

    #[test]
    fn queued_calls_keep_acceptance_order() {
        let t = TestWorld::new("call-queue");
        let p1 = t.enter();
        let p2 = t.enter();
        let (tx, rx) = bounded(64);
        let call = Call::new(&p1, move |request: CallRequest<'_>| {
            tx.send(request.call_arg).ok();
            Ok(CallReply::default())
        })
        .expect("register");
        let remote = Call::lookup(&p2, call.id()).expect("lookup");
        for n in 0..32 {
            remote.execute(CallFlags::QUEUE, n, &[]).expect("queue");
        }
        let seen: Vec<i32> = (0..32)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).expect("delivered"))
            .collect();
        assert_eq!(seen, (0..32).collect::<Vec<_>>());
    }

    #[test]
    fn different_calls_do_not_block_each_other() {
        let t = TestWorld::new("call-parallel");
        let p1 = t.enter();
        let p2 = t.enter();
        let (release_tx, release_rx) = bounded::<()>(1);
        let slow = Call::new(&p1, move |_: CallRequest<'_>| {
            release_rx.recv().ok();
            Ok(CallReply::value(1))
        })
        .expect("slow");
        let fast = Call::new(&p1, doubler()).expect("fast");

        let slow_remote = Call::lookup(&p2, slow.id()).expect("lookup");
        let blocked = thread::spawn(move || slow_remote.execute(CallFlags::empty(), 0, &[]));
        let fast_remote = Call::lookup(&p2, fast.id()).expect("lookup");
        let reply = fast_remote
            .execute_timeout(CallFlags::empty(), 0, &21i32.to_le_bytes(), Duration::from_secs(5))
            .expect("fast call is not stuck behind the slow one");
        assert_eq!(reply.value, 42);

        release_tx.send(()).expect("release");
        assert_eq!(blocked.join().expect("join").expect("slow").value, 1);
    }

    #[test]
    fn saturated_reply_slots_are_busy_and_timeouts_are_explicit() {
        let t = TestWorld::new("call-busy");
        let config = FusionConfig {
            call_slots: 1,
            ..t.config()
        };
        let p1 = World::enter("call-busy", config).expect("enter");
        let p2 = t.enter();
        let (release_tx, release_rx) = bounded::<()>(1);
        let call = Call::new(&p1, move |_: CallRequest<'_>| {
            release_rx.recv().ok();
            Ok(CallReply::value(7))
        })
        .expect("register");
        let remote = Call::lookup(&p2, call.id()).expect("lookup");

        let timed_out = remote.execute_timeout(CallFlags::empty(), 0, &[], Duration::from_millis(50));
        assert!(matches!(timed_out, Err(FusionError::Timeout)));
        // The abandoned request still occupies the only reply slot.
        assert!(matches!(
            remote.execute(CallFlags::empty(), 0, &[]),
            Err(FusionError::Busy)
        ));
        remote
            .execute(CallFlags::ONEWAY, 0, &[])
            .expect("one-way calls need no reply slot");
        drop(release_tx);
        assert!(wait_until(Duration::from_secs(5), || {
            remote.execute(CallFlags::empty(), 0, &[]).is_ok()
        }));
    }

    #[test]
    fn destroyed_and_departed_owners_fail_with_destroyed() {
        let t = TestWorld::new("call-gone");
        let p1 = t.enter();
        let p2 = t.enter();
        let p3 = t.enter();
        let call = Call::new(&p2, doubler()).expect("register");
        let remote = Call::lookup(&p1, call.id()).expect("lookup");
        assert!(matches!(
            remote.clone().destroy(),
            Err(FusionError::InvalidArgument(_))
        ));
        call.destroy().expect("destroy");
        assert!(matches!(
            remote.execute(CallFlags::empty(), 0, &[0; 4]),
            Err(FusionError::Destroyed)
        ));

        let call = Call::new(&p3, doubler()).expect("register");
        let remote = Call::lookup(&p1, call.id()).expect("lookup");
        p3.exit().expect("exit");
        assert!(matches!(
            remote.execute(CallFlags::empty(), 0, &[0; 4]),
            Err(FusionError::Destroyed)
        ));
    }
}
