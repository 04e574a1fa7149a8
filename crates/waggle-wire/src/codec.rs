// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Encode and decode framed bus messages without std dependencies.
// Author: Lukas Bower

//! Encode/decode helpers for framed bus messages.
//!
//! All multi-byte fields use host byte order. Records are padded to the
//! next multiple of 8; the declared record size excludes that padding, and
//! the declared frame size includes it.

use alloc::string::{String, ToString};
use alloc::vec::Vec;
use core::str;

use crate::bloom::{validate_bloom_size, BloomFilter};
use crate::types::*;

/// Encode a message into its framed wire representation.
pub fn encode_message(message: &Message) -> Result<Vec<u8>, WireError> {
    if message.flags & !MSG_FLAGS_KNOWN != 0 {
        return Err(WireError::UnknownFlags(message.flags & !MSG_FLAGS_KNOWN));
    }
    if message.records.len() > MAX_RECORDS {
        return Err(WireError::TooManyRecords(MAX_RECORDS));
    }
    let mut body = Vec::new();
    for record in &message.records {
        put_record(&mut body, record)?;
    }
    let size = HEADER_BYTES + body.len() as u64;
    if size > MAX_FRAME_BYTES {
        return Err(WireError::FrameTooLarge {
            size,
            limit: MAX_FRAME_BYTES,
        });
    }
    let mut frame = Vec::with_capacity(size as usize);
    frame.extend_from_slice(&size.to_ne_bytes());
    frame.extend_from_slice(&message.flags.to_ne_bytes());
    frame.extend_from_slice(&message.dst_id.to_ne_bytes());
    frame.extend_from_slice(&message.src_id.to_ne_bytes());
    frame.extend_from_slice(&message.payload_type.to_ne_bytes());
    frame.extend_from_slice(&message.cookie.to_ne_bytes());
    frame.extend_from_slice(&message.cookie_reply.to_ne_bytes());
    frame.extend_from_slice(&message.timeout_ns.to_ne_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Decode and validate a framed wire message.
pub fn decode_message(bytes: &[u8]) -> Result<Message, WireError> {
    if bytes.len() < HEADER_BYTES as usize {
        return Err(WireError::Truncated {
            declared: HEADER_BYTES,
            actual: bytes.len(),
        });
    }
    let size = get_u64(bytes, 0);
    if size < HEADER_BYTES || size % 8 != 0 {
        return Err(WireError::MisalignedFrame(size));
    }
    if size > MAX_FRAME_BYTES {
        return Err(WireError::FrameTooLarge {
            size,
            limit: MAX_FRAME_BYTES,
        });
    }
    if bytes.len() as u64 != size {
        return Err(WireError::Truncated {
            declared: size,
            actual: bytes.len(),
        });
    }
    let flags = get_u64(bytes, 8);
    if flags & !MSG_FLAGS_KNOWN != 0 {
        return Err(WireError::UnknownFlags(flags & !MSG_FLAGS_KNOWN));
    }
    let mut message = Message {
        flags,
        dst_id: get_u64(bytes, 16),
        src_id: get_u64(bytes, 24),
        payload_type: get_u64(bytes, 32),
        cookie: get_u64(bytes, 40),
        cookie_reply: get_u64(bytes, 48),
        timeout_ns: get_u64(bytes, 56),
        records: Vec::new(),
    };
    let mut offset = HEADER_BYTES;
    while offset < size {
        if size - offset < RECORD_HEADER_BYTES {
            return Err(WireError::RecordOverrun(offset));
        }
        let record_size = get_u64(bytes, offset as usize);
        if record_size < RECORD_HEADER_BYTES {
            return Err(WireError::RecordTooShort(record_size));
        }
        if record_size > size - offset {
            return Err(WireError::RecordOverrun(offset));
        }
        // size and offset are both multiples of 8, so the padded record
        // still fits.
        let padded = align8(record_size);
        let kind = get_u64(bytes, offset as usize + 8);
        let data_start = (offset + RECORD_HEADER_BYTES) as usize;
        let data = &bytes[data_start..(offset + record_size) as usize];
        message.records.push(parse_record(kind, data)?);
        if message.records.len() > MAX_RECORDS {
            return Err(WireError::TooManyRecords(MAX_RECORDS));
        }
        offset += padded;
    }
    Ok(message)
}

fn put_record(out: &mut Vec<u8>, record: &Record) -> Result<(), WireError> {
    let mut data = Vec::new();
    match record {
        Record::Inline(bytes) => data.extend_from_slice(bytes),
        Record::Vec { address, length } => {
            data.extend_from_slice(&address.to_ne_bytes());
            data.extend_from_slice(&length.to_ne_bytes());
        }
        Record::Memfd { id, size } => {
            data.extend_from_slice(&id.to_ne_bytes());
            data.extend_from_slice(&size.to_ne_bytes());
        }
        Record::Fd { fd } => data.extend_from_slice(&fd.to_ne_bytes()),
        Record::Name(name)
        | Record::Exe(name)
        | Record::Cmdline(name)
        | Record::Cgroup(name)
        | Record::Seclabel(name)
        | Record::NameAcquired(name)
        | Record::NameLost(name) => data.extend_from_slice(name.as_bytes()),
        Record::Bloom(filter) => put_bloom_entry(&mut data, filter),
        Record::BloomMask(entries) => {
            for entry in entries {
                put_bloom_entry(&mut data, entry);
            }
        }
        Record::Timestamp {
            monotonic_ns,
            realtime_ns,
        } => {
            data.extend_from_slice(&monotonic_ns.to_ne_bytes());
            data.extend_from_slice(&realtime_ns.to_ne_bytes());
        }
        Record::Creds { uid, gid, pid } => {
            data.extend_from_slice(&uid.to_ne_bytes());
            data.extend_from_slice(&gid.to_ne_bytes());
            data.extend_from_slice(&pid.to_ne_bytes());
        }
        Record::Caps(caps) => data.extend_from_slice(&caps.to_ne_bytes()),
        Record::Audit {
            loginuid,
            sessionid,
        } => {
            data.extend_from_slice(&loginuid.to_ne_bytes());
            data.extend_from_slice(&sessionid.to_ne_bytes());
        }
        Record::OwnedNames(names) => {
            for name in names {
                data.extend_from_slice(name.as_bytes());
                data.push(0);
            }
        }
        Record::PeerGone { id } => data.extend_from_slice(&id.to_ne_bytes()),
        Record::ReplyTimeout { cookie } => data.extend_from_slice(&cookie.to_ne_bytes()),
        Record::Overflow { dropped } => data.extend_from_slice(&dropped.to_ne_bytes()),
    }
    let size = RECORD_HEADER_BYTES + data.len() as u64;
    out.extend_from_slice(&size.to_ne_bytes());
    out.extend_from_slice(&(record.kind() as u64).to_ne_bytes());
    out.extend_from_slice(&data);
    for _ in 0..(align8(size) - size) {
        out.push(0);
    }
    Ok(())
}

fn parse_record(kind: u64, data: &[u8]) -> Result<Record, WireError> {
    let tag = RecordKind::try_from(kind)?;
    let fixed = |want: usize| {
        if data.len() == want {
            Ok(())
        } else {
            Err(WireError::RecordLength {
                kind,
                declared: data.len() as u64,
            })
        }
    };
    Ok(match tag {
        RecordKind::PayloadInline => Record::Inline(data.to_vec()),
        RecordKind::PayloadVec => {
            fixed(16)?;
            Record::Vec {
                address: get_u64(data, 0),
                length: get_u64(data, 8),
            }
        }
        RecordKind::PayloadMemfd => {
            fixed(16)?;
            Record::Memfd {
                id: get_u64(data, 0),
                size: get_u64(data, 8),
            }
        }
        RecordKind::Fd => {
            fixed(8)?;
            Record::Fd {
                fd: get_u64(data, 0),
            }
        }
        RecordKind::DstName => Record::Name(parse_string(data)?),
        RecordKind::Bloom => {
            let (filter, used) = parse_bloom_entry(data, kind)?;
            if used != data.len() {
                return Err(WireError::RecordLength {
                    kind,
                    declared: data.len() as u64,
                });
            }
            Record::Bloom(filter)
        }
        RecordKind::BloomMask => {
            let mut entries = Vec::new();
            let mut used = 0;
            while used < data.len() {
                let (entry, len) = parse_bloom_entry(&data[used..], kind)?;
                entries.push(entry);
                used += len;
            }
            Record::BloomMask(entries)
        }
        RecordKind::Timestamp => {
            fixed(16)?;
            Record::Timestamp {
                monotonic_ns: get_u64(data, 0),
                realtime_ns: get_u64(data, 8),
            }
        }
        RecordKind::Creds => {
            fixed(24)?;
            Record::Creds {
                uid: get_u64(data, 0),
                gid: get_u64(data, 8),
                pid: get_u64(data, 16),
            }
        }
        RecordKind::Exe => Record::Exe(parse_string(data)?),
        RecordKind::Cmdline => Record::Cmdline(parse_string(data)?),
        RecordKind::Cgroup => Record::Cgroup(parse_string(data)?),
        RecordKind::Caps => {
            fixed(8)?;
            Record::Caps(get_u64(data, 0))
        }
        RecordKind::Seclabel => Record::Seclabel(parse_string(data)?),
        RecordKind::Audit => {
            fixed(16)?;
            Record::Audit {
                loginuid: get_u64(data, 0),
                sessionid: get_u64(data, 8),
            }
        }
        RecordKind::OwnedNames => {
            let mut names = Vec::new();
            for chunk in data.split(|byte| *byte == 0) {
                if chunk.is_empty() {
                    continue;
                }
                names.push(
                    str::from_utf8(chunk)
                        .map_err(|_| WireError::InvalidUtf8)?
                        .to_string(),
                );
            }
            Record::OwnedNames(names)
        }
        RecordKind::NameAcquired => Record::NameAcquired(parse_string(data)?),
        RecordKind::NameLost => Record::NameLost(parse_string(data)?),
        RecordKind::PeerGone => {
            fixed(8)?;
            Record::PeerGone {
                id: get_u64(data, 0),
            }
        }
        RecordKind::ReplyTimeout => {
            fixed(8)?;
            Record::ReplyTimeout {
                cookie: get_u64(data, 0),
            }
        }
        RecordKind::Overflow => {
            fixed(8)?;
            Record::Overflow {
                dropped: get_u64(data, 0),
            }
        }
    })
}

fn put_bloom_entry(out: &mut Vec<u8>, filter: &BloomFilter) {
    out.extend_from_slice(&filter.generation().to_ne_bytes());
    out.extend_from_slice(&(filter.size_bytes() as u32).to_ne_bytes());
    for word in filter.words() {
        out.extend_from_slice(&word.to_ne_bytes());
    }
}

/// Parse one `generation | size_bytes | bits` bloom entry, returning the
/// entry and the bytes consumed.
fn parse_bloom_entry(data: &[u8], kind: u64) -> Result<(BloomFilter, usize), WireError> {
    if data.len() < 12 {
        return Err(WireError::RecordLength {
            kind,
            declared: data.len() as u64,
        });
    }
    let generation = get_u64(data, 0);
    let size_bytes = u32::from_ne_bytes([data[8], data[9], data[10], data[11]]) as u64;
    validate_bloom_size(size_bytes)?;
    let end = 12 + size_bytes as usize;
    if data.len() < end {
        return Err(WireError::RecordLength {
            kind,
            declared: data.len() as u64,
        });
    }
    let mut words = Vec::with_capacity((size_bytes / 8) as usize);
    let mut at = 12;
    while at < end {
        words.push(get_u64(data, at));
        at += 8;
    }
    let filter = BloomFilter::from_words(generation, words)?;
    Ok((filter, end))
}

fn parse_string(data: &[u8]) -> Result<String, WireError> {
    str::from_utf8(data)
        .map(ToString::to_string)
        .map_err(|_| WireError::InvalidUtf8)
}

fn get_u64(bytes: &[u8], offset: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_ne_bytes(raw)
}

/// Builder assembling a framed message record by record.
#[derive(Debug, Clone)]
pub struct MessageBuilder {
    message: Message,
}

impl MessageBuilder {
    /// Start a message addressed to a numeric connection id.
    #[must_use]
    pub fn unicast(dst_id: u64) -> Self {
        Self::with_dst(dst_id)
    }

    /// Start a message addressed to a well-known name.
    #[must_use]
    pub fn to_name(name: &str) -> Self {
        let mut builder = Self::with_dst(DST_ID_NAME);
        builder.message.records.push(Record::Name(name.to_string()));
        builder
    }

    /// Start a broadcast message.
    #[must_use]
    pub fn broadcast() -> Self {
        Self::with_dst(DST_ID_BROADCAST)
    }

    fn with_dst(dst_id: u64) -> Self {
        Self {
            message: Message {
                flags: 0,
                dst_id,
                src_id: 0,
                payload_type: PAYLOAD_DBUS,
                cookie: 0,
                cookie_reply: 0,
                timeout_ns: 0,
                records: Vec::new(),
            },
        }
    }

    /// Set the sender-chosen cookie.
    #[must_use]
    pub fn cookie(mut self, cookie: u64) -> Self {
        self.message.cookie = cookie;
        self
    }

    /// Mark the message as expecting a reply within `timeout_ns`.
    #[must_use]
    pub fn expect_reply(mut self, timeout_ns: u64) -> Self {
        self.message.flags |= MSG_FLAG_EXPECT_REPLY;
        self.message.timeout_ns = timeout_ns;
        self
    }

    /// Mark the message as a reply to an earlier cookie.
    #[must_use]
    pub fn reply_to(mut self, cookie: u64) -> Self {
        self.message.cookie_reply = cookie;
        self
    }

    /// Override the payload type tag.
    #[must_use]
    pub fn payload_type(mut self, tag: u64) -> Self {
        self.message.payload_type = tag;
        self
    }

    /// Append an inline payload record.
    #[must_use]
    pub fn inline(mut self, bytes: &[u8]) -> Self {
        self.message.records.push(Record::Inline(bytes.to_vec()));
        self
    }

    /// Append a payload vector reference into the sender's address space.
    #[must_use]
    pub fn vec(mut self, address: u64, length: u64) -> Self {
        self.message.records.push(Record::Vec { address, length });
        self
    }

    /// Append a sealed memory object reference.
    #[must_use]
    pub fn memfd(mut self, id: u64, size: u64) -> Self {
        self.message.records.push(Record::Memfd { id, size });
        self
    }

    /// Append a passed descriptor.
    #[must_use]
    pub fn fd(mut self, fd: u64) -> Self {
        self.message.records.push(Record::Fd { fd });
        self
    }

    /// Append a bloom filter record.
    #[must_use]
    pub fn bloom(mut self, filter: BloomFilter) -> Self {
        self.message.records.push(Record::Bloom(filter));
        self
    }

    /// Append an arbitrary record.
    #[must_use]
    pub fn record(mut self, record: Record) -> Self {
        self.message.records.push(record);
        self
    }

    /// Return the assembled message.
    #[must_use]
    pub fn message(self) -> Message {
        self.message
    }

    /// Encode the assembled message into frame bytes.
    pub fn encode(self) -> Result<Vec<u8>, WireError> {
        encode_message(&self.message)
    }
}
