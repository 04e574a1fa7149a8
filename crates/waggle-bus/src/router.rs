// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: SEND pipeline: validate, resolve, gate, materialize, enqueue.
// Author: Lukas Bower

use std::sync::Arc;
use std::time::Duration;

use log::{debug, trace};
use waggle_wire::{
    decode_message, encode_message, Message, Record, DST_ID_BROADCAST, DST_ID_NAME,
    MSG_FLAG_EXPECT_REPLY, PAYLOAD_KERNEL, SRC_ID_KERNEL,
};

use crate::bus::Bus;
use crate::connection::{Connection, ReplyWaiter, SenderMemory};
use crate::memfd::MemfdHandle;
use crate::metadata::{kernel_metadata, sender_metadata};
use crate::policy::{effective_allows, PolicyVerb};
use crate::{BusError, ErrorKind};

/// Payload records after resolution against the sender: vectors copied out
/// of sender memory, sealed objects attached, descriptors collected.
struct ResolvedPayload {
    records: Vec<Record>,
    memfds: Vec<MemfdHandle>,
    fds: Vec<u64>,
}

/// Handle SEND for a framed message.
pub(crate) fn send(
    conn: &Arc<Connection>,
    frame: &[u8],
    memory: &dyn SenderMemory,
) -> Result<(), BusError> {
    let mut msg = decode_message(frame)?;
    conn.ensure_active()?;
    let bus = conn.bus()?;
    let endpoint = conn.endpoint.upgrade().ok_or(BusError::Disconnected)?;
    let src_id = conn.id();
    msg.src_id = src_id;

    let expect_reply = msg.flags & MSG_FLAG_EXPECT_REPLY != 0;
    if expect_reply && msg.timeout_ns == 0 {
        return Err(BusError::ReplyWithoutDeadline);
    }
    validate_records(&msg)?;

    let sender_names = bus.registry().names_of(src_id);
    let ep_policy = endpoint.policy();

    match msg.dst_id {
        DST_ID_BROADCAST => {
            if msg.records.iter().any(|r| matches!(r, Record::Fd { .. })) {
                return Err(BusError::FdOverBroadcast);
            }
            if expect_reply {
                return Err(BusError::ReplyOverBroadcast);
            }
            broadcast(&bus, conn, &msg, memory, &sender_names, ep_policy.as_ref())
        }
        DST_ID_NAME => {
            let name = msg.dst_name().ok_or(BusError::NameRecordMissing)?.to_owned();
            let owner = bus
                .registry()
                .lookup(&name)
                .ok_or_else(|| BusError::NameNotFound { name: name.clone() })?;
            let dst = bus
                .lookup_connection(owner)
                .ok_or_else(|| BusError::NameNotFound { name: name.clone() })?;
            if !effective_allows(
                bus.policy(),
                ep_policy.as_ref(),
                &conn.creds,
                PolicyVerb::TalkTo,
                &name,
            ) {
                return Err(BusError::PolicyDenied {
                    verb: PolicyVerb::TalkTo,
                    name,
                });
            }
            unicast(&bus, conn, &dst, &msg, memory, &sender_names, expect_reply)
        }
        id => {
            let dst = bus
                .lookup_connection(id)
                .filter(|dst| dst.is_active())
                .ok_or(BusError::NoDestination { id })?;
            if bus.policy().is_some() || ep_policy.is_some() {
                let dst_names = bus.registry().names_of(id);
                let allowed = dst_names.iter().any(|name| {
                    effective_allows(
                        bus.policy(),
                        ep_policy.as_ref(),
                        &conn.creds,
                        PolicyVerb::TalkTo,
                        name,
                    )
                });
                if !allowed {
                    return Err(BusError::PolicyDenied {
                        verb: PolicyVerb::TalkTo,
                        name: dst_names.into_iter().next().unwrap_or_else(|| id.to_string()),
                    });
                }
            }
            unicast(&bus, conn, &dst, &msg, memory, &sender_names, expect_reply)
        }
    }
}

/// Reject record kinds clients may not submit, and kinds out of place for
/// the chosen destination.
fn validate_records(msg: &Message) -> Result<(), BusError> {
    for record in &msg.records {
        let label = match record {
            Record::Inline(_) | Record::Vec { .. } | Record::Memfd { .. } | Record::Fd { .. } => {
                continue
            }
            Record::Name(_) => {
                if msg.dst_id == DST_ID_NAME {
                    continue;
                }
                "destination name"
            }
            Record::Bloom(_) => {
                if msg.dst_id == DST_ID_BROADCAST {
                    continue;
                }
                "bloom filter"
            }
            Record::BloomMask(_) => "bloom mask",
            Record::Timestamp { .. }
            | Record::Creds { .. }
            | Record::Exe(_)
            | Record::Cmdline(_)
            | Record::Cgroup(_)
            | Record::Caps(_)
            | Record::Seclabel(_)
            | Record::Audit { .. }
            | Record::OwnedNames(_) => "metadata",
            Record::NameAcquired(_)
            | Record::NameLost(_)
            | Record::PeerGone { .. }
            | Record::ReplyTimeout { .. }
            | Record::Overflow { .. } => "notification",
        };
        return Err(BusError::RecordNotAllowed { kind: label });
    }
    Ok(())
}

fn unicast(
    bus: &Arc<Bus>,
    sender: &Arc<Connection>,
    dst: &Arc<Connection>,
    msg: &Message,
    memory: &dyn SenderMemory,
    sender_names: &[String],
    expect_reply: bool,
) -> Result<(), BusError> {
    // A reply must have its caller still waiting; the waiter is consumed
    // only once the delivery has landed.
    if msg.cookie_reply != 0 {
        let waiting = {
            let state = dst.state.lock().expect("poisoned connection lock");
            state
                .reply_waiters
                .iter()
                .any(|waiter| waiter.cookie == msg.cookie_reply && waiter.peer == msg.src_id)
        };
        if !waiting {
            return Err(BusError::ReplyOrphan {
                cookie: msg.cookie_reply,
            });
        }
    }

    let resolved = resolve_payload(bus, msg, memory)?;
    let metadata = sender_metadata(
        &sender.creds,
        sender_names,
        dst.attach_mask(),
        bus.clock(),
    );
    let frame = build_frame(msg, &resolved.records, metadata)?;
    let msg_id = bus.next_msg_id();
    dst.enqueue(&frame, msg_id, msg.cookie, resolved.memfds, resolved.fds)?;
    trace!(
        target: "waggle-bus",
        "msg {msg_id}: {} -> {} ({} bytes)",
        msg.src_id,
        dst.id(),
        frame.len()
    );

    if msg.cookie_reply != 0 {
        let mut state = dst.state.lock().expect("poisoned connection lock");
        state
            .reply_waiters
            .retain(|waiter| !(waiter.cookie == msg.cookie_reply && waiter.peer == msg.src_id));
    }
    if expect_reply {
        let deadline = bus.clock().now() + Duration::from_nanos(msg.timeout_ns);
        let mut state = sender.state.lock().expect("poisoned connection lock");
        state.reply_waiters.push(ReplyWaiter {
            cookie: msg.cookie,
            peer: dst.id(),
            deadline,
        });
    }
    Ok(())
}

fn broadcast(
    bus: &Arc<Bus>,
    sender: &Arc<Connection>,
    msg: &Message,
    memory: &dyn SenderMemory,
    sender_names: &[String],
    sender_ep_policy: Option<&crate::PolicySet>,
) -> Result<(), BusError> {
    let resolved = resolve_payload(bus, msg, memory)?;
    let bloom = msg.bloom();
    let msg_id = bus.next_msg_id();
    let recipients = bus.snapshot_connections();
    let policed = bus.policy().is_some() || sender_ep_policy.is_some();

    for dst in recipients {
        if Arc::ptr_eq(&dst, sender) || !dst.is_active() {
            continue;
        }
        let admitted = {
            let state = dst.state.lock().expect("poisoned connection lock");
            state
                .matches
                .iter()
                .any(|rule| rule.admits(msg.src_id, sender_names, bloom))
        };
        if !admitted {
            continue;
        }
        if policed {
            let dst_names = bus.registry().names_of(dst.id());
            let allowed = dst_names.iter().any(|name| {
                effective_allows(
                    bus.policy(),
                    sender_ep_policy,
                    &sender.creds,
                    PolicyVerb::TalkTo,
                    name,
                )
            });
            if !allowed {
                continue;
            }
        }
        // SEE runs against the recipient's endpoint; the default endpoint
        // grants it universally.
        let Some(dst_ep) = dst.endpoint.upgrade() else {
            continue;
        };
        if !dst_ep.is_default() && !sender_names.is_empty() {
            let dst_ep_policy = dst_ep.policy();
            let visible = sender_names.iter().any(|name| {
                effective_allows(
                    bus.policy(),
                    dst_ep_policy.as_ref(),
                    &dst.creds,
                    PolicyVerb::See,
                    name,
                )
            });
            if !visible {
                continue;
            }
        }
        let outcome = build_frame(
            msg,
            &resolved.records,
            sender_metadata(&sender.creds, sender_names, dst.attach_mask(), bus.clock()),
        )
        .and_then(|frame| {
            dst.enqueue(
                &frame,
                msg_id,
                msg.cookie,
                resolved.memfds.clone(),
                Vec::new(),
            )
        });
        match outcome {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::Capacity => {
                debug!(
                    target: "waggle-bus",
                    "broadcast {msg_id} dropped for {}: {err}",
                    dst.id()
                );
                dst.mark_lossy();
            }
            Err(_) => {}
        }
    }
    Ok(())
}

fn resolve_payload(
    bus: &Arc<Bus>,
    msg: &Message,
    memory: &dyn SenderMemory,
) -> Result<ResolvedPayload, BusError> {
    let mut records = Vec::with_capacity(msg.records.len());
    let mut memfds = Vec::new();
    let mut fds = Vec::new();
    for record in &msg.records {
        match record {
            Record::Vec { address, length } => {
                let bytes =
                    memory
                        .read(*address, *length)
                        .ok_or(BusError::VecUnresolved {
                            address: *address,
                            length: *length,
                        })?;
                records.push(Record::Inline(bytes.to_vec()));
            }
            Record::Memfd { id, .. } => {
                let object = bus
                    .memfds()
                    .resolve(*id)
                    .ok_or(BusError::MemfdUnknown { id: *id })?;
                if !object.is_sealed() {
                    return Err(BusError::MemfdNotSealed { id: *id });
                }
                let handle = MemfdHandle::attach(&object);
                records.push(Record::Memfd {
                    id: *id,
                    size: handle.size(),
                });
                memfds.push(handle);
            }
            Record::Fd { fd } => {
                fds.push(*fd);
                records.push(Record::Fd { fd: *fd });
            }
            other => records.push(other.clone()),
        }
    }
    Ok(ResolvedPayload {
        records,
        memfds,
        fds,
    })
}

fn build_frame(
    msg: &Message,
    resolved_records: &[Record],
    metadata: Vec<Record>,
) -> Result<Vec<u8>, BusError> {
    let mut records = resolved_records.to_vec();
    records.extend(metadata);
    let delivered = Message {
        flags: msg.flags,
        dst_id: msg.dst_id,
        src_id: msg.src_id,
        payload_type: msg.payload_type,
        cookie: msg.cookie,
        cookie_reply: msg.cookie_reply,
        timeout_ns: msg.timeout_ns,
        records,
    };
    Ok(encode_message(&delivered)?)
}

/// Deliver a core-synthesized notification to a connection. Synthetic
/// messages bypass policy but obey pool capacity; a drop marks the
/// connection lossy and owes it one overflow indicator.
pub(crate) fn notify_conn(conn: &Arc<Connection>, record: Record) {
    let Some(bus) = conn.bus.upgrade() else {
        return;
    };
    match deliver_synthetic(&bus, conn, record) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::Capacity => conn.mark_lossy(),
        Err(_) => {}
    }
}

/// Deliver the overflow indicator itself; on failure the pending count is
/// restored rather than the connection being marked lossy again.
pub(crate) fn notify_overflow(conn: &Arc<Connection>, count: u64) {
    let Some(bus) = conn.bus.upgrade() else {
        return;
    };
    if deliver_synthetic(&bus, conn, Record::Overflow { dropped: count }).is_err() {
        let mut state = conn.state.lock().expect("poisoned connection lock");
        state.overflow_dropped += count;
    }
}

/// Deliver a notification to whatever connection currently holds `id`.
pub(crate) fn notify_by_id(bus: &Arc<Bus>, id: u64, record: Record) {
    if let Some(conn) = bus.lookup_connection(id) {
        notify_conn(&conn, record);
    }
}

/// Tell every match holder watching `departed` that the peer is gone.
pub(crate) fn peer_gone(bus: &Arc<Bus>, departed: u64, departed_names: &[String]) {
    for conn in bus.snapshot_connections() {
        let watching = {
            let state = conn.state.lock().expect("poisoned connection lock");
            state
                .matches
                .iter()
                .any(|rule| rule.watches_peer(departed, departed_names))
        };
        if watching {
            notify_conn(&conn, Record::PeerGone { id: departed });
        }
    }
}

fn deliver_synthetic(
    bus: &Arc<Bus>,
    conn: &Arc<Connection>,
    record: Record,
) -> Result<(), BusError> {
    let mut records = vec![record];
    records.extend(kernel_metadata(conn.attach_mask(), bus.clock()));
    let msg = Message {
        flags: 0,
        dst_id: conn.id(),
        src_id: SRC_ID_KERNEL,
        payload_type: PAYLOAD_KERNEL,
        cookie: 0,
        cookie_reply: 0,
        timeout_ns: 0,
        records,
    };
    let frame = encode_message(&msg)?;
    let msg_id = bus.next_msg_id();
    match conn.enqueue(&frame, msg_id, 0, Vec::new(), Vec::new()) {
        Err(BusError::PoolFull { .. }) => Err(BusError::MailboxOverflow),
        other => other,
    }
}
