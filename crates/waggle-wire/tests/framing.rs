// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Validate framed message encode/decode and framing rejection rules.
// Author: Lukas Bower
#![forbid(unsafe_code)]

use waggle_wire::{
    decode_message, encode_message, BloomFilter, Message, MessageBuilder, Record, WireError,
    DST_ID_BROADCAST, DST_ID_NAME, HEADER_BYTES, MSG_FLAG_EXPECT_REPLY, PAYLOAD_DBUS,
};

fn sample_message() -> Message {
    let mut bloom = BloomFilter::new(2, 64).expect("bloom");
    bloom.set_bit(3);
    bloom.set_bit(77);
    MessageBuilder::broadcast()
        .cookie(41)
        .inline(b"hello bus")
        .bloom(bloom)
        .record(Record::OwnedNames(vec![
            "org.example.svc".to_owned(),
            "org.example.aux".to_owned(),
        ]))
        .record(Record::Creds {
            uid: 1000,
            gid: 1000,
            pid: 4242,
        })
        .message()
}

#[test]
fn header_then_records_round_trip() {
    let message = sample_message();
    let frame = encode_message(&message).expect("encode");
    let parsed = decode_message(&frame).expect("decode");
    assert_eq!(parsed, message);
}

#[test]
fn name_addressed_message_round_trips() {
    let message = MessageBuilder::to_name("com.example.svc")
        .cookie(7)
        .expect_reply(1_000_000)
        .inline(b"ping")
        .message();
    let frame = encode_message(&message).expect("encode");
    let parsed = decode_message(&frame).expect("decode");
    assert_eq!(parsed.dst_id, DST_ID_NAME);
    assert_eq!(parsed.dst_name(), Some("com.example.svc"));
    assert_eq!(parsed.flags & MSG_FLAG_EXPECT_REPLY, MSG_FLAG_EXPECT_REPLY);
    assert_eq!(parsed.timeout_ns, 1_000_000);
    assert_eq!(parsed.inline_payload(), Some(&b"ping"[..]));
}

#[test]
fn every_record_offset_is_eight_aligned() {
    // Odd-length payloads force padding; walk the raw frame and check each
    // record boundary.
    let message = MessageBuilder::unicast(2)
        .inline(b"x")
        .inline(b"seven..")
        .record(Record::Name("a.b".to_owned()))
        .message();
    let frame = encode_message(&message).expect("encode");
    assert_eq!(frame.len() % 8, 0);
    let mut offset = HEADER_BYTES as usize;
    let mut seen = 0;
    while offset < frame.len() {
        assert_eq!(offset % 8, 0, "record at misaligned offset {offset}");
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&frame[offset..offset + 8]);
        let size = u64::from_ne_bytes(raw);
        // Declared size excludes padding.
        offset += ((size + 7) & !7) as usize;
        seen += 1;
    }
    assert_eq!(seen, 3);
    assert_eq!(offset, frame.len());
}

#[test]
fn truncated_frame_is_rejected() {
    let frame = encode_message(&sample_message()).expect("encode");
    let short = &frame[..frame.len() - 8];
    match decode_message(short) {
        Err(WireError::Truncated { .. }) => {}
        other => panic!("unexpected: {other:?}"),
    }
}

#[test]
fn misaligned_declared_size_is_rejected() {
    let mut frame = encode_message(&sample_message()).expect("encode");
    let bogus = (frame.len() as u64) - 3;
    frame[0..8].copy_from_slice(&bogus.to_ne_bytes());
    match decode_message(&frame) {
        Err(WireError::MisalignedFrame(size)) => assert_eq!(size, bogus),
        other => panic!("unexpected: {other:?}"),
    }
}

#[test]
fn unknown_record_kind_is_rejected() {
    let message = MessageBuilder::unicast(1).inline(b"payload").message();
    let mut frame = encode_message(&message).expect("encode");
    let kind_at = HEADER_BYTES as usize + 8;
    frame[kind_at..kind_at + 8].copy_from_slice(&0xDEAD_u64.to_ne_bytes());
    match decode_message(&frame) {
        Err(WireError::UnknownRecord(kind)) => assert_eq!(kind, 0xDEAD),
        other => panic!("unexpected: {other:?}"),
    }
}

#[test]
fn unknown_header_flags_are_rejected() {
    let mut message = sample_message();
    message.flags |= 1 << 40;
    assert!(matches!(
        encode_message(&message),
        Err(WireError::UnknownFlags(_))
    ));
}

#[test]
fn record_overrunning_frame_is_rejected() {
    let message = MessageBuilder::unicast(1).inline(b"abcdefgh").message();
    let mut frame = encode_message(&message).expect("encode");
    let size_at = HEADER_BYTES as usize;
    frame[size_at..size_at + 8].copy_from_slice(&1024u64.to_ne_bytes());
    match decode_message(&frame) {
        Err(WireError::RecordOverrun(offset)) => assert_eq!(offset, HEADER_BYTES),
        other => panic!("unexpected: {other:?}"),
    }
}

#[test]
fn fixed_layout_records_reject_bad_lengths() {
    // A creds record must be exactly 24 payload bytes; shrink it by writing
    // a smaller declared record size over an inline-free frame.
    let message = MessageBuilder::unicast(1)
        .record(Record::Creds {
            uid: 1,
            gid: 2,
            pid: 3,
        })
        .message();
    let mut frame = encode_message(&message).expect("encode");
    let size_at = HEADER_BYTES as usize;
    frame[size_at..size_at + 8].copy_from_slice(&32u64.to_ne_bytes());
    frame.truncate(frame.len() - 8);
    let declared = frame.len() as u64;
    frame[0..8].copy_from_slice(&declared.to_ne_bytes());
    match decode_message(&frame) {
        Err(WireError::RecordLength { declared, .. }) => assert_eq!(declared, 16),
        other => panic!("unexpected: {other:?}"),
    }
}

#[test]
fn payload_tag_is_the_dbus_constant() {
    assert_eq!(PAYLOAD_DBUS, u64::from_ne_bytes(*b"DBusDBus"));
    assert_eq!(sample_message().payload_type, PAYLOAD_DBUS);
}

#[test]
fn broadcast_and_name_destinations_use_reserved_ids() {
    assert_eq!(MessageBuilder::broadcast().message().dst_id, DST_ID_BROADCAST);
    assert_eq!(MessageBuilder::to_name("a.b").message().dst_id, DST_ID_NAME);
}
