// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Connection lifecycle, mailbox, match rules, and receive path.
// Author: Lukas Bower

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::{Duration, Instant};

use log::debug;
use waggle_wire::{decode_message, BloomFilter, BloomMask, Message};

use crate::bus::Bus;
use crate::endpoint::Endpoint;
use crate::memfd::MemfdHandle;
use crate::names::{NameFlags, NameListEntry, NameListFilter, NameStatus};
use crate::policy::{effective_allows, PolicyVerb};
use crate::pool::Pool;
use crate::router;
use crate::{AttachMask, BusError, ProcessContext};

/// Smallest accepted receive pool, in bytes.
pub const POOL_MIN_BYTES: u64 = 1024;

/// Largest accepted receive pool, in bytes.
pub const POOL_MAX_BYTES: u64 = 1 << 30;

/// Capacity of a connection's passed-descriptor table.
pub const FD_TABLE_CAP: usize = 253;

/// Upper-bound estimate of an overflow indicator frame, used to decide when
/// the pending indicator can be flushed.
const OVERFLOW_FRAME_HINT: u64 = 160;

/// Connection lifecycle phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Unconnected,
    Active,
    Terminated(TerminationCause),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TerminationCause {
    /// The client said BYE or closed its handle.
    Local,
    /// The endpoint, bus, or domain above disconnected.
    Cascade,
}

/// Sender filter of a match rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchSender {
    /// Match a specific source connection id.
    Id(u64),
    /// Match whoever owns the given well-known name at delivery time.
    Name(String),
}

/// A broadcast subscription: a bloom mask array plus an optional sender
/// filter, installed under a caller-chosen cookie.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchRule {
    /// Caller-chosen cookie for REMOVE_MATCH.
    pub cookie: u64,
    /// Optional sender filter.
    pub sender: Option<MatchSender>,
    /// Per-generation mask entries; empty means match-all.
    pub mask: BloomMask,
}

impl MatchRule {
    fn sender_matches(&self, src_id: u64, sender_names: &[String]) -> bool {
        match &self.sender {
            None => true,
            Some(MatchSender::Id(id)) => *id == src_id,
            Some(MatchSender::Name(name)) => sender_names.iter().any(|owned| owned == name),
        }
    }

    pub(crate) fn admits(
        &self,
        src_id: u64,
        sender_names: &[String],
        bloom: Option<&BloomFilter>,
    ) -> bool {
        if !self.sender_matches(src_id, sender_names) {
            return false;
        }
        if self.mask.is_empty() {
            return true;
        }
        bloom.is_some_and(|filter| self.mask.admits(filter))
    }

    pub(crate) fn watches_peer(&self, peer_id: u64, peer_names: &[String]) -> bool {
        match &self.sender {
            Some(MatchSender::Id(id)) => *id == peer_id,
            Some(MatchSender::Name(name)) => peer_names.iter().any(|owned| owned == name),
            None => false,
        }
    }
}

/// A delivered message: where it sits in the pool plus its attachments.
#[derive(Debug)]
pub struct MsgDescriptor {
    /// Offset of the framed message in the receive pool.
    pub offset: u64,
    /// Framed size in bytes.
    pub size: u64,
    /// Source connection id; 0 for core-synthesized messages.
    pub src_id: u64,
    /// Monotonic per-bus message id stamped at send.
    pub msg_id: u64,
    /// Sender-chosen cookie.
    pub cookie: u64,
    /// Sealed memory objects attached to this delivery.
    pub memfds: Vec<MemfdHandle>,
    /// Receiver-table indices of descriptors passed with this delivery.
    pub fds: Vec<u64>,
}

pub(crate) struct MailboxEntry {
    pub(crate) offset: u64,
    pub(crate) size: u64,
    pub(crate) src_id: u64,
    pub(crate) msg_id: u64,
    pub(crate) cookie: u64,
    pub(crate) memfds: Vec<MemfdHandle>,
    pub(crate) fds: Vec<u64>,
}

pub(crate) struct ReplyWaiter {
    pub(crate) cookie: u64,
    pub(crate) peer: u64,
    pub(crate) deadline: Instant,
}

pub(crate) struct ConnState {
    pub(crate) phase: Phase,
    pub(crate) attach: AttachMask,
    pub(crate) mailbox: VecDeque<MailboxEntry>,
    pub(crate) matches: Vec<MatchRule>,
    pub(crate) fd_table: Vec<u64>,
    pub(crate) reply_waiters: Vec<ReplyWaiter>,
    pub(crate) lossy: bool,
    pub(crate) overflow_dropped: u64,
    pub(crate) interrupted: bool,
}

/// One client attachment to an endpoint.
pub(crate) struct Connection {
    pub(crate) bus: Weak<Bus>,
    pub(crate) endpoint: Weak<Endpoint>,
    pub(crate) creds: ProcessContext,
    id: AtomicU64,
    pool: OnceLock<Pool>,
    pub(crate) state: Mutex<ConnState>,
}

impl Connection {
    pub(crate) fn new(
        bus: &Arc<Bus>,
        endpoint: &Arc<Endpoint>,
        creds: ProcessContext,
    ) -> Arc<Self> {
        Arc::new(Self {
            bus: Arc::downgrade(bus),
            endpoint: Arc::downgrade(endpoint),
            creds,
            id: AtomicU64::new(0),
            pool: OnceLock::new(),
            state: Mutex::new(ConnState {
                phase: Phase::Unconnected,
                attach: AttachMask::NONE,
                mailbox: VecDeque::new(),
                matches: Vec::new(),
                fd_table: Vec::new(),
                reply_waiters: Vec::new(),
                lossy: false,
                overflow_dropped: 0,
                interrupted: false,
            }),
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id.load(Ordering::Acquire)
    }

    pub(crate) fn bus(&self) -> Result<Arc<Bus>, BusError> {
        self.bus.upgrade().ok_or(BusError::Disconnected)
    }

    pub(crate) fn pool(&self) -> Result<&Pool, BusError> {
        self.pool.get().ok_or(BusError::NotActive)
    }

    pub(crate) fn is_active(&self) -> bool {
        self.state.lock().expect("poisoned connection lock").phase == Phase::Active
    }

    pub(crate) fn attach_mask(&self) -> AttachMask {
        self.state.lock().expect("poisoned connection lock").attach
    }

    pub(crate) fn ensure_active(&self) -> Result<(), BusError> {
        match self.state.lock().expect("poisoned connection lock").phase {
            Phase::Active => Ok(()),
            Phase::Unconnected => Err(BusError::NotActive),
            Phase::Terminated(_) => Err(BusError::Disconnected),
        }
    }

    fn wake(&self) {
        if let Some(endpoint) = self.endpoint.upgrade() {
            endpoint.wait().notify_all();
        }
    }

    /// Materialized delivery: reserve pool space, copy the frame, append a
    /// mailbox entry, and wake receivers. Fails with `POOL_FULL` instead of
    /// blocking and releases the reservation on any later failure.
    pub(crate) fn enqueue(
        self: &Arc<Self>,
        frame: &[u8],
        msg_id: u64,
        cookie: u64,
        memfds: Vec<MemfdHandle>,
        fds: Vec<u64>,
    ) -> Result<(), BusError> {
        let src_id = frame_src_id(frame);
        {
            let state = self.state.lock().expect("poisoned connection lock");
            if state.phase != Phase::Active {
                return Err(BusError::Disconnected);
            }
            if state.fd_table.len() + fds.len() > FD_TABLE_CAP {
                return Err(BusError::FdTableFull {
                    capacity: FD_TABLE_CAP,
                });
            }
        }
        let pool = self.pool()?;
        let offset = pool.reserve(frame.len() as u64)?;
        pool.commit(offset, frame);
        {
            let mut state = self.state.lock().expect("poisoned connection lock");
            if state.phase != Phase::Active {
                pool.cancel(offset);
                return Err(BusError::Disconnected);
            }
            if state.fd_table.len() + fds.len() > FD_TABLE_CAP {
                pool.cancel(offset);
                return Err(BusError::FdTableFull {
                    capacity: FD_TABLE_CAP,
                });
            }
            let mut fd_indices = Vec::with_capacity(fds.len());
            for fd in fds {
                state.fd_table.push(fd);
                fd_indices.push(state.fd_table.len() as u64 - 1);
            }
            state.mailbox.push_back(MailboxEntry {
                offset,
                size: frame.len() as u64,
                src_id,
                msg_id,
                cookie,
                memfds,
                fds: fd_indices,
            });
        }
        self.wake();
        Ok(())
    }

    pub(crate) fn mark_lossy(&self) {
        let mut state = self.state.lock().expect("poisoned connection lock");
        state.lossy = true;
        state.overflow_dropped += 1;
    }

    /// Tear the connection down: drain the mailbox, release names, notify
    /// match holders, and wake any blocked receiver exactly once.
    pub(crate) fn terminate(self: &Arc<Self>, cause: TerminationCause) {
        let drained = {
            let mut state = self.state.lock().expect("poisoned connection lock");
            if matches!(state.phase, Phase::Terminated(_)) {
                return;
            }
            state.phase = Phase::Terminated(cause);
            state.matches.clear();
            state.reply_waiters.clear();
            std::mem::take(&mut state.mailbox)
        };
        drop(drained);
        let id = self.id();
        if let Some(bus) = self.bus.upgrade() {
            if id != 0 {
                debug!(target: "waggle-bus", "connection {id} terminated ({cause:?})");
                bus.remove_connection(id);
                let names = bus.registry().names_of(id);
                let events = bus.registry().release_all(id);
                for event in events {
                    router::notify_by_id(&bus, event.target_id, event.record);
                }
                router::peer_gone(&bus, id, &names);
            }
        }
        if let Some(endpoint) = self.endpoint.upgrade() {
            endpoint.forget(self);
            endpoint.wait().notify_all();
        }
    }
}

/// Resolves payload-vector records against the sender's memory.
pub trait SenderMemory {
    /// Return the bytes at `address`/`length`, or `None` when the range is
    /// not mapped.
    fn read(&self, address: u64, length: u64) -> Option<&[u8]>;
}

/// The empty sender memory: no vector record resolves.
impl SenderMemory for () {
    fn read(&self, _address: u64, _length: u64) -> Option<&[u8]> {
        None
    }
}

/// Slice-backed sender memory keyed by caller-chosen addresses.
#[derive(Debug, Default)]
pub struct SliceMemory<'a> {
    segments: Vec<(u64, &'a [u8])>,
}

impl<'a> SliceMemory<'a> {
    /// Construct an empty memory map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `bytes` at `address`.
    #[must_use]
    pub fn with(mut self, address: u64, bytes: &'a [u8]) -> Self {
        self.segments.push((address, bytes));
        self
    }
}

impl SenderMemory for SliceMemory<'_> {
    fn read(&self, address: u64, length: u64) -> Option<&[u8]> {
        for (base, bytes) in &self.segments {
            let end = base.checked_add(bytes.len() as u64)?;
            if address >= *base && address.checked_add(length)? <= end {
                let from = (address - base) as usize;
                return Some(&bytes[from..from + length as usize]);
            }
        }
        None
    }
}

/// Client handle to a connection. Dropping the handle closes the
/// connection the way closing its backing descriptor would.
pub struct ConnectionHandle {
    conn: Arc<Connection>,
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.conn.id())
            .finish_non_exhaustive()
    }
}

impl ConnectionHandle {
    pub(crate) fn new(conn: Arc<Connection>) -> Self {
        Self { conn }
    }

    /// HELLO: size the receive pool, choose the metadata attach mask, and
    /// activate the connection. Returns the assigned connection id.
    pub fn hello(&self, pool_size: u64, attach: AttachMask) -> Result<u64, BusError> {
        if pool_size % 8 != 0 || !(POOL_MIN_BYTES..=POOL_MAX_BYTES).contains(&pool_size) {
            return Err(BusError::InvalidPoolSize { size: pool_size });
        }
        match self.conn.state.lock().expect("poisoned connection lock").phase {
            Phase::Unconnected => {}
            Phase::Active => return Err(BusError::HelloTwice),
            Phase::Terminated(_) => return Err(BusError::Disconnected),
        }
        let bus = self.conn.bus()?;
        if self.conn.pool.set(Pool::new(pool_size)).is_err() {
            return Err(BusError::HelloTwice);
        }
        let id = match bus.register_connection(&self.conn) {
            Ok(id) => id,
            Err(err) => {
                self.conn.terminate(TerminationCause::Cascade);
                return Err(err);
            }
        };
        self.conn.id.store(id, Ordering::Release);
        {
            let mut state = self.conn.state.lock().expect("poisoned connection lock");
            state.phase = Phase::Active;
            state.attach = attach;
        }
        debug!(target: "waggle-bus", "connection {id} active, pool {pool_size}");
        Ok(id)
    }

    /// BYE: graceful disconnect.
    pub fn bye(&self) -> Result<(), BusError> {
        self.conn.ensure_active()?;
        self.conn.terminate(TerminationCause::Local);
        Ok(())
    }

    /// Close the handle explicitly; equivalent to dropping it.
    pub fn close(&self) {
        self.conn.terminate(TerminationCause::Local);
    }

    /// Return the connection id assigned at HELLO, or 0 before it.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.conn.id()
    }

    /// Return whether deliveries to this connection have been dropped.
    #[must_use]
    pub fn is_lossy(&self) -> bool {
        self.conn.state.lock().expect("poisoned connection lock").lossy
    }

    /// SEND a framed message; payload-vector records fail without memory.
    pub fn send(&self, frame: &[u8]) -> Result<(), BusError> {
        router::send(&self.conn, frame, &())
    }

    /// SEND a framed message resolving payload vectors through `memory`.
    pub fn send_from(&self, frame: &[u8], memory: &dyn SenderMemory) -> Result<(), BusError> {
        router::send(&self.conn, frame, memory)
    }

    /// RECV: block until a message is delivered or the connection ends.
    pub fn recv(&self) -> Result<MsgDescriptor, BusError> {
        self.recv_inner(None)
    }

    /// RECV with an upper bound on the wait.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<MsgDescriptor, BusError> {
        let deadline = self.clock()?.now() + timeout;
        self.recv_inner(Some(deadline))
    }

    /// Non-blocking RECV.
    pub fn try_recv(&self) -> Result<Option<MsgDescriptor>, BusError> {
        match self.next_step()? {
            RecvStep::Deliver(descriptor) => Ok(Some(descriptor)),
            RecvStep::Expired(cookies) => {
                self.flush_expired(cookies);
                self.try_recv()
            }
            RecvStep::Overflow(count) => {
                self.flush_overflow(count);
                self.try_recv()
            }
            RecvStep::Wait(_) => Ok(None),
        }
    }

    fn clock(&self) -> Result<Arc<dyn crate::Clock>, BusError> {
        Ok(self.conn.bus()?.clock().clone())
    }

    fn recv_inner(&self, until: Option<Instant>) -> Result<MsgDescriptor, BusError> {
        let endpoint = self.conn.endpoint.upgrade().ok_or(BusError::Disconnected)?;
        loop {
            let seen = endpoint.wait().current();
            match self.next_step()? {
                RecvStep::Deliver(descriptor) => return Ok(descriptor),
                RecvStep::Expired(cookies) => self.flush_expired(cookies),
                RecvStep::Overflow(count) => self.flush_overflow(count),
                RecvStep::Wait(waiter_deadline) => {
                    let clock = self.clock()?;
                    let now = clock.now();
                    if let Some(limit) = until {
                        if now >= limit {
                            return Err(BusError::Timeout);
                        }
                    }
                    let deadline = match (until, waiter_deadline) {
                        (Some(a), Some(b)) => Some(a.min(b)),
                        (Some(a), None) => Some(a),
                        (None, b) => b,
                    };
                    endpoint.wait().wait_past(seen, deadline, now);
                }
            }
        }
    }

    fn next_step(&self) -> Result<RecvStep, BusError> {
        let now = self.clock()?.now();
        let mut state = self.conn.state.lock().expect("poisoned connection lock");
        match state.phase {
            Phase::Unconnected => return Err(BusError::NotActive),
            Phase::Terminated(TerminationCause::Local) => return Err(BusError::Canceled),
            Phase::Terminated(TerminationCause::Cascade) => return Err(BusError::Disconnected),
            Phase::Active => {}
        }
        if state.interrupted {
            state.interrupted = false;
            return Err(BusError::Interrupted);
        }
        let expired: Vec<u64> = {
            let (done, pending): (Vec<ReplyWaiter>, Vec<ReplyWaiter>) = state
                .reply_waiters
                .drain(..)
                .partition(|waiter| waiter.deadline <= now);
            state.reply_waiters = pending;
            done.into_iter().map(|waiter| waiter.cookie).collect()
        };
        if !expired.is_empty() {
            return Ok(RecvStep::Expired(expired));
        }
        // Flush the pending overflow indicator only once pool space exists,
        // otherwise the flush itself would fail and spin.
        if state.overflow_dropped > 0 {
            if let Some(pool) = self.conn.pool.get() {
                if pool.has_room(OVERFLOW_FRAME_HINT) {
                    let count = state.overflow_dropped;
                    state.overflow_dropped = 0;
                    return Ok(RecvStep::Overflow(count));
                }
            }
        }
        if let Some(entry) = state.mailbox.pop_front() {
            return Ok(RecvStep::Deliver(MsgDescriptor {
                offset: entry.offset,
                size: entry.size,
                src_id: entry.src_id,
                msg_id: entry.msg_id,
                cookie: entry.cookie,
                memfds: entry.memfds,
                fds: entry.fds,
            }));
        }
        let nearest = state
            .reply_waiters
            .iter()
            .map(|waiter| waiter.deadline)
            .min();
        Ok(RecvStep::Wait(nearest))
    }

    fn flush_expired(&self, cookies: Vec<u64>) {
        for cookie in cookies {
            debug!(target: "waggle-bus", "reply cookie {cookie} timed out");
            router::notify_conn(
                &self.conn,
                waggle_wire::Record::ReplyTimeout { cookie },
            );
        }
    }

    fn flush_overflow(&self, count: u64) {
        router::notify_overflow(&self.conn, count);
    }

    /// FREE a consumed pool slice.
    pub fn free(&self, offset: u64) -> Result<(), BusError> {
        self.conn.ensure_active()?;
        self.conn.pool()?.free(offset)
    }

    /// Run `f` over the framed bytes at a delivered offset.
    pub fn with_frame<R>(
        &self,
        offset: u64,
        f: impl FnOnce(&[u8]) -> R,
    ) -> Result<R, BusError> {
        self.conn.ensure_active()?;
        self.conn
            .pool()?
            .with_slice(offset, f)
            .ok_or(BusError::UnknownOffset { offset })
    }

    /// Parse the framed message at a delivered offset.
    pub fn read_message(&self, offset: u64) -> Result<Message, BusError> {
        self.with_frame(offset, |bytes| decode_message(bytes))?
            .map_err(BusError::from)
    }

    /// ADD_MATCH: install a broadcast subscription.
    pub fn add_match(&self, rule: MatchRule) -> Result<(), BusError> {
        self.conn.ensure_active()?;
        let bus = self.conn.bus()?;
        if let Some(width) = rule.mask.size_bytes() {
            if width != bus.bloom_size() {
                return Err(BusError::MatchBloomWidth {
                    have: width,
                    want: bus.bloom_size(),
                });
            }
        }
        let mut state = self.conn.state.lock().expect("poisoned connection lock");
        state.matches.push(rule);
        Ok(())
    }

    /// REMOVE_MATCH: drop every rule installed under `cookie`.
    pub fn remove_match(&self, cookie: u64) -> Result<(), BusError> {
        self.conn.ensure_active()?;
        let mut state = self.conn.state.lock().expect("poisoned connection lock");
        let before = state.matches.len();
        state.matches.retain(|rule| rule.cookie != cookie);
        if state.matches.len() == before {
            return Err(BusError::MatchNotFound { cookie });
        }
        Ok(())
    }

    /// REQUEST_NAME: acquire a well-known name, honoring policy OWN rules.
    pub fn request_name(&self, name: &str, flags: NameFlags) -> Result<NameStatus, BusError> {
        self.conn.ensure_active()?;
        let bus = self.conn.bus()?;
        let endpoint = self.conn.endpoint.upgrade().ok_or(BusError::Disconnected)?;
        if !effective_allows(
            bus.policy(),
            endpoint.policy().as_ref(),
            &self.conn.creds,
            PolicyVerb::Own,
            name,
        ) {
            return Err(BusError::PolicyDenied {
                verb: PolicyVerb::Own,
                name: name.to_owned(),
            });
        }
        let (status, events) = bus.registry().acquire(self.conn.id(), name, flags)?;
        for event in events {
            router::notify_by_id(&bus, event.target_id, event.record);
        }
        Ok(status)
    }

    /// RELEASE_NAME: give a name up, promoting any queued waiter.
    pub fn release_name(&self, name: &str) -> Result<(), BusError> {
        self.conn.ensure_active()?;
        let bus = self.conn.bus()?;
        let events = bus.registry().release(self.conn.id(), name)?;
        for event in events {
            router::notify_by_id(&bus, event.target_id, event.record);
        }
        Ok(())
    }

    /// Resolve a well-known name to its current owner's connection id,
    /// honoring wildcard entries.
    pub fn resolve_name(&self, name: &str) -> Result<u64, BusError> {
        self.conn.ensure_active()?;
        let bus = self.conn.bus()?;
        bus.registry()
            .lookup(name)
            .ok_or_else(|| BusError::NameNotFound {
                name: name.to_owned(),
            })
    }

    /// NAME_LIST: snapshot the registry, SEE-filtered on custom endpoints.
    pub fn list_names(&self, filter: &NameListFilter) -> Result<Vec<NameListEntry>, BusError> {
        self.conn.ensure_active()?;
        let bus = self.conn.bus()?;
        let endpoint = self.conn.endpoint.upgrade().ok_or(BusError::Disconnected)?;
        let mut entries = bus.registry().list(filter);
        if !endpoint.is_default() {
            entries.retain(|entry| {
                effective_allows(
                    bus.policy(),
                    endpoint.policy().as_ref(),
                    &self.conn.creds,
                    PolicyVerb::See,
                    &entry.name,
                )
            });
        }
        Ok(entries)
    }

    /// Interrupt a blocked RECV, the way a signal would.
    pub fn interrupt(&self) {
        {
            let mut state = self.conn.state.lock().expect("poisoned connection lock");
            state.interrupted = true;
        }
        if let Some(endpoint) = self.conn.endpoint.upgrade() {
            endpoint.wait().notify_all();
        }
    }
}

enum RecvStep {
    Deliver(MsgDescriptor),
    Expired(Vec<u64>),
    Overflow(u64),
    Wait(Option<Instant>),
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.conn.terminate(TerminationCause::Local);
    }
}

fn frame_src_id(frame: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&frame[24..32]);
    u64::from_ne_bytes(raw)
}
