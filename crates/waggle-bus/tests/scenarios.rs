// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: End-to-end bus scenarios: unicast, names, broadcast, pools, memfd.
// Author: Lukas Bower
#![forbid(unsafe_code)]

use waggle_bus::{
    AttachMask, BusRef, BusSpec, ConnectionHandle, ControlHandle, EndpointRef, MatchRule,
    NameFlags, ProcessContext, Subsystem,
};
use waggle_wire::{
    BloomFilter, BloomMask, MessageBuilder, Record, HEADER_BYTES, RECORD_HEADER_BYTES,
};

const POOL: u64 = 64 * 1024;

fn setup(bus_name: &str) -> (Subsystem, ControlHandle, BusRef, EndpointRef) {
    let subsystem = Subsystem::new();
    let mut control = subsystem.open_control().expect("open control");
    let bus = control.make_bus(BusSpec::new(bus_name)).expect("make bus");
    let endpoint = bus.default_endpoint().expect("default endpoint");
    (subsystem, control, bus, endpoint)
}

fn open_active(endpoint: &EndpointRef, pool_size: u64) -> ConnectionHandle {
    let conn = endpoint.open(ProcessContext::root()).expect("open");
    conn.hello(pool_size, AttachMask::NONE).expect("hello");
    conn
}

fn match_all(cookie: u64) -> MatchRule {
    MatchRule {
        cookie,
        sender: None,
        mask: BloomMask::empty(),
    }
}

#[test]
fn s1_first_two_connections_exchange_bytes() {
    let (_subsystem, _control, _bus, endpoint) = setup("s1");
    let a = open_active(&endpoint, POOL);
    let b = open_active(&endpoint, POOL);
    assert_eq!(a.id(), 1);
    assert_eq!(b.id(), 2);

    let frame = MessageBuilder::unicast(2)
        .cookie(7)
        .inline(b"hi")
        .encode()
        .expect("encode");
    a.send(&frame).expect("send");

    let delivery = b.recv().expect("recv");
    assert_eq!(delivery.src_id, 1);
    let message = b.read_message(delivery.offset).expect("read");
    assert_eq!(message.inline_payload(), Some(&b"hi"[..]));
    assert_eq!(message.cookie, 7);
    b.free(delivery.offset).expect("free");
}

#[test]
fn s2_name_addressed_send_reaches_owner() {
    let (_subsystem, _control, _bus, endpoint) = setup("s2");
    let a = open_active(&endpoint, POOL);
    let b = open_active(&endpoint, POOL);

    b.request_name("org.foo", NameFlags::NONE).expect("request");
    assert_eq!(a.resolve_name("org.foo").expect("lookup"), 2);

    let frame = MessageBuilder::to_name("org.foo")
        .inline(b"to the owner")
        .encode()
        .expect("encode");
    a.send(&frame).expect("send");

    let delivery = b.recv().expect("recv");
    assert_eq!(delivery.src_id, a.id());
    let message = b.read_message(delivery.offset).expect("read");
    assert_eq!(message.dst_name(), Some("org.foo"));
    b.free(delivery.offset).expect("free");
}

#[test]
fn s3_broadcast_respects_bloom_masks() {
    let (_subsystem, _control, _bus, endpoint) = setup("s3");
    let a = open_active(&endpoint, POOL);
    let b = open_active(&endpoint, POOL);
    let c = open_active(&endpoint, POOL);

    let mut mask_b = BloomFilter::new(1, 64).expect("bloom");
    mask_b.set_bit(3);
    b.add_match(MatchRule {
        cookie: 1,
        sender: None,
        mask: BloomMask::from_entries(vec![mask_b]).expect("mask"),
    })
    .expect("match b");

    let mut mask_c = BloomFilter::new(1, 64).expect("bloom");
    mask_c.set_bit(5);
    c.add_match(MatchRule {
        cookie: 1,
        sender: None,
        mask: BloomMask::from_entries(vec![mask_c]).expect("mask"),
    })
    .expect("match c");

    let mut filter = BloomFilter::new(1, 64).expect("bloom");
    filter.set_bit(3);
    let frame = MessageBuilder::broadcast()
        .bloom(filter)
        .inline(b"bit three")
        .encode()
        .expect("encode");
    a.send(&frame).expect("send");

    let delivery = b.recv().expect("b receives");
    b.free(delivery.offset).expect("free");
    assert!(c.try_recv().expect("c mailbox").is_none(), "bit 5 mask");
}

#[test]
fn s4_pool_backpressure_fails_send_until_free() {
    let (_subsystem, _control, _bus, endpoint) = setup("s4");
    let a = open_active(&endpoint, POOL);
    let b = open_active(&endpoint, 4096);

    // Frame size: header + record header + payload = exactly 512 bytes, so
    // eight fills the 4 KiB pool to the brim.
    let payload = vec![0x42u8; (512 - HEADER_BYTES - RECORD_HEADER_BYTES) as usize];
    let frame = MessageBuilder::unicast(b.id())
        .inline(&payload)
        .encode()
        .expect("encode");
    assert_eq!(frame.len(), 512);

    for _ in 0..8 {
        a.send(&frame).expect("send fits");
    }
    let err = a.send(&frame).expect_err("pool exhausted");
    assert!(matches!(err, waggle_bus::BusError::PoolFull { .. }));

    let first = b.recv().expect("recv");
    b.free(first.offset).expect("free");
    a.send(&frame).expect("retry after free");
}

#[test]
fn s5_queued_waiter_inherits_name_on_disconnect() {
    let (_subsystem, _control, _bus, endpoint) = setup("s5");
    let _a = open_active(&endpoint, POOL);
    let b = open_active(&endpoint, POOL);
    let c = open_active(&endpoint, POOL);

    b.request_name("org.foo", NameFlags::NONE).expect("b owns");
    c.request_name("org.foo", NameFlags::QUEUE).expect("c queues");

    b.bye().expect("bye");

    let delivery = c.recv().expect("synthetic name-acquired");
    assert_eq!(delivery.src_id, 0, "kernel-sourced");
    let message = c.read_message(delivery.offset).expect("read");
    assert!(message
        .records
        .iter()
        .any(|record| matches!(record, Record::NameAcquired(name) if name == "org.foo")));
    c.free(delivery.offset).expect("free");

    assert_eq!(c.resolve_name("org.foo").expect("lookup"), c.id());
}

#[test]
fn s6_sealed_memfd_payload_travels_without_copy() {
    let (subsystem, _control, _bus, endpoint) = setup("s6");
    let a = open_active(&endpoint, POOL);
    let b = open_active(&endpoint, POOL);

    let memfd = subsystem.memfd_new(1 << 20).expect("memfd");
    let pattern: Vec<u8> = (0..1024u32).flat_map(|v| v.to_ne_bytes()).collect();
    for chunk in 0..256 {
        memfd
            .write(chunk * pattern.len() as u64, &pattern)
            .expect("fill");
    }
    memfd.seal();

    let frame = MessageBuilder::unicast(b.id())
        .memfd(memfd.id(), memfd.size())
        .encode()
        .expect("encode");
    a.send(&frame).expect("send");

    let delivery = b.recv().expect("recv");
    // The framed message carries a reference, not the megabyte.
    assert!(delivery.size < 256, "frame is {} bytes", delivery.size);
    let view = delivery.memfds[0].map_readonly().expect("map");
    assert_eq!(view.len(), 1 << 20);
    assert_eq!(&view.as_slice()[..pattern.len()], pattern.as_slice());

    assert!(matches!(
        memfd.write(0, b"late write"),
        Err(waggle_bus::BusError::WriteOnSealed)
    ));
    b.free(delivery.offset).expect("free");
}

#[test]
fn send_to_self_is_allowed() {
    let (_subsystem, _control, _bus, endpoint) = setup("selfsend");
    let a = open_active(&endpoint, POOL);
    let frame = MessageBuilder::unicast(a.id())
        .inline(b"echo")
        .encode()
        .expect("encode");
    a.send(&frame).expect("send to self");
    let delivery = a.recv().expect("recv own message");
    assert_eq!(delivery.src_id, a.id());
    a.free(delivery.offset).expect("free");
}

#[test]
fn broadcast_excludes_sender_even_with_match_all() {
    let (_subsystem, _control, _bus, endpoint) = setup("noself");
    let a = open_active(&endpoint, POOL);
    let b = open_active(&endpoint, POOL);
    a.add_match(match_all(9)).expect("match");
    b.add_match(match_all(9)).expect("match");

    let frame = MessageBuilder::broadcast()
        .inline(b"fan out")
        .encode()
        .expect("encode");
    a.send(&frame).expect("send");

    let delivery = b.recv().expect("b receives");
    b.free(delivery.offset).expect("free");
    assert!(a.try_recv().expect("a mailbox").is_none());
}

#[test]
fn fifo_holds_per_sender_receiver_pair() {
    let (_subsystem, _control, _bus, endpoint) = setup("fifo");
    let a = open_active(&endpoint, POOL);
    let b = open_active(&endpoint, POOL);

    for cookie in 1..=32u64 {
        let frame = MessageBuilder::unicast(b.id())
            .cookie(cookie)
            .inline(&cookie.to_ne_bytes())
            .encode()
            .expect("encode");
        a.send(&frame).expect("send");
    }
    let mut msg_ids = Vec::new();
    for expected in 1..=32u64 {
        let delivery = b.recv().expect("recv");
        assert_eq!(delivery.cookie, expected, "send order preserved");
        msg_ids.push(delivery.msg_id);
        b.free(delivery.offset).expect("free");
    }
    assert!(
        msg_ids.windows(2).all(|pair| pair[0] < pair[1]),
        "bus message ids are strictly monotonic"
    );
}

#[test]
fn descriptor_passing_duplicates_into_receiver_table() {
    let (_subsystem, _control, _bus, endpoint) = setup("fds");
    let a = open_active(&endpoint, POOL);
    let b = open_active(&endpoint, POOL);

    let frame = MessageBuilder::unicast(b.id())
        .fd(42)
        .fd(43)
        .inline(b"with descriptors")
        .encode()
        .expect("encode");
    a.send(&frame).expect("send");

    let delivery = b.recv().expect("recv");
    assert_eq!(delivery.fds.len(), 2);
    assert_ne!(delivery.fds[0], delivery.fds[1]);
    b.free(delivery.offset).expect("free");
}
