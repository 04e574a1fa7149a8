// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Validate payload materialization and record legality on SEND.
// Author: Lukas Bower
#![forbid(unsafe_code)]

use waggle_bus::{
    AttachMask, BusError, BusSpec, ConnectionHandle, ControlHandle, EndpointRef, ProcessContext,
    SliceMemory, Subsystem,
};
use waggle_wire::{MessageBuilder, Record};

const POOL: u64 = 16 * 1024;

fn setup() -> (Subsystem, ControlHandle, EndpointRef) {
    let subsystem = Subsystem::new();
    let mut control = subsystem.open_control().expect("control");
    let bus = control.make_bus(BusSpec::new("sendpath")).expect("make bus");
    let endpoint = bus.default_endpoint().expect("endpoint");
    (subsystem, control, endpoint)
}

fn open_active(endpoint: &EndpointRef) -> ConnectionHandle {
    let conn = endpoint.open(ProcessContext::root()).expect("open");
    conn.hello(POOL, AttachMask::NONE).expect("hello");
    conn
}

#[test]
fn vector_records_copy_once_into_the_pool() {
    let (_subsystem, _control, endpoint) = setup();
    let a = open_active(&endpoint);
    let b = open_active(&endpoint);

    let payload = b"scattered sender bytes".to_vec();
    let memory = SliceMemory::new().with(0x5000, &payload);
    let frame = MessageBuilder::unicast(b.id())
        .vec(0x5000, payload.len() as u64)
        .encode()
        .expect("encode");
    a.send_from(&frame, &memory).expect("send");

    let delivery = b.recv().expect("recv");
    let message = b.read_message(delivery.offset).expect("read");
    // The vector arrives materialized as inline bytes in the pool frame.
    assert_eq!(message.inline_payload(), Some(payload.as_slice()));
    assert!(!message
        .records
        .iter()
        .any(|record| matches!(record, Record::Vec { .. })));
    b.free(delivery.offset).expect("free");
}

#[test]
fn vector_into_the_middle_of_a_segment_resolves() {
    let (_subsystem, _control, endpoint) = setup();
    let a = open_active(&endpoint);
    let b = open_active(&endpoint);

    let segment: Vec<u8> = (0u8..=255).collect();
    let memory = SliceMemory::new().with(0x1000, &segment);
    let frame = MessageBuilder::unicast(b.id())
        .vec(0x1000 + 16, 8)
        .encode()
        .expect("encode");
    a.send_from(&frame, &memory).expect("send");

    let delivery = b.recv().expect("recv");
    let message = b.read_message(delivery.offset).expect("read");
    assert_eq!(message.inline_payload(), Some(&segment[16..24]));
    b.free(delivery.offset).expect("free");
}

#[test]
fn unresolved_vector_fails_the_send() {
    let (_subsystem, _control, endpoint) = setup();
    let a = open_active(&endpoint);
    let b = open_active(&endpoint);

    let frame = MessageBuilder::unicast(b.id())
        .vec(0xBAD0, 32)
        .encode()
        .expect("encode");
    assert!(matches!(
        a.send(&frame),
        Err(BusError::VecUnresolved {
            address: 0xBAD0,
            length: 32
        })
    ));
    assert!(b.try_recv().expect("mailbox").is_none());
}

#[test]
fn client_supplied_metadata_is_rejected() {
    let (_subsystem, _control, endpoint) = setup();
    let a = open_active(&endpoint);
    let b = open_active(&endpoint);

    let frame = MessageBuilder::unicast(b.id())
        .record(Record::Creds {
            uid: 0,
            gid: 0,
            pid: 1,
        })
        .encode()
        .expect("encode");
    assert!(matches!(
        a.send(&frame),
        Err(BusError::RecordNotAllowed { kind: "metadata" })
    ));

    let frame = MessageBuilder::unicast(b.id())
        .record(Record::PeerGone { id: 9 })
        .encode()
        .expect("encode");
    assert!(matches!(
        a.send(&frame),
        Err(BusError::RecordNotAllowed {
            kind: "notification"
        })
    ));
}

#[test]
fn name_record_requires_name_destination() {
    let (_subsystem, _control, endpoint) = setup();
    let a = open_active(&endpoint);
    let b = open_active(&endpoint);

    let frame = MessageBuilder::unicast(b.id())
        .record(Record::Name("org.bogus.dst".to_owned()))
        .inline(b"mixed up")
        .encode()
        .expect("encode");
    assert!(matches!(
        a.send(&frame),
        Err(BusError::RecordNotAllowed { .. })
    ));

    // And the converse: dst 0 with no name record at all.
    let mut message = MessageBuilder::unicast(0).inline(b"nameless").message();
    message.records.retain(|r| !matches!(r, Record::Name(_)));
    let frame = waggle_wire::encode_message(&message).expect("encode");
    assert!(matches!(a.send(&frame), Err(BusError::NameRecordMissing)));
}

#[test]
fn unknown_memfd_reference_fails() {
    let (_subsystem, _control, endpoint) = setup();
    let a = open_active(&endpoint);
    let b = open_active(&endpoint);

    let frame = MessageBuilder::unicast(b.id())
        .memfd(777, 4096)
        .encode()
        .expect("encode");
    assert!(matches!(
        a.send(&frame),
        Err(BusError::MemfdUnknown { id: 777 })
    ));
}

#[test]
fn unsealed_memfd_cannot_be_sent() {
    let (subsystem, _control, endpoint) = setup();
    let a = open_active(&endpoint);
    let b = open_active(&endpoint);

    let memfd = subsystem.memfd_new(4096).expect("memfd");
    memfd.write(0, b"still warm").expect("write");
    let frame = MessageBuilder::unicast(b.id())
        .memfd(memfd.id(), memfd.size())
        .encode()
        .expect("encode");
    assert!(matches!(
        a.send(&frame),
        Err(BusError::MemfdNotSealed { .. })
    ));
    memfd.seal();
    a.send(&frame).expect("sealed object sends");
}

#[test]
fn in_flight_reference_blocks_unseal_until_freed() {
    let (subsystem, _control, endpoint) = setup();
    let a = open_active(&endpoint);
    let b = open_active(&endpoint);

    let memfd = subsystem.memfd_new(64).expect("memfd");
    memfd.seal();
    let frame = MessageBuilder::unicast(b.id())
        .memfd(memfd.id(), memfd.size())
        .encode()
        .expect("encode");
    a.send(&frame).expect("send");

    assert!(matches!(
        memfd.unseal(),
        Err(BusError::UnsealShared { .. })
    ));

    let delivery = b.recv().expect("recv");
    b.free(delivery.offset).expect("free");
    drop(delivery);
    memfd.unseal().expect("sole reference again");
}
