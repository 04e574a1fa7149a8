// Author: Lukas Bower
// Purpose: Define waggle wire constants, header layout, and record model.
#![allow(clippy::module_name_repetitions)]

//! Data model for framed bus messages shared across codec callers.

use alloc::string::String;
use alloc::vec::Vec;

use crate::bloom::BloomFilter;

/// Byte length of the fixed message header.
pub const HEADER_BYTES: u64 = 64;

/// Byte length of a record header (`size` + `type`).
pub const RECORD_HEADER_BYTES: u64 = 16;

/// Upper bound on a single framed message, header included.
pub const MAX_FRAME_BYTES: u64 = 1 << 20;

/// Upper bound on the number of records carried by one message.
pub const MAX_RECORDS: usize = 128;

/// Destination id requesting resolution through an embedded name record.
pub const DST_ID_NAME: u64 = 0;

/// Destination id addressing every matching connection on the bus.
pub const DST_ID_BROADCAST: u64 = u64::MAX;

/// Source id stamped on core-synthesized messages.
pub const SRC_ID_KERNEL: u64 = 0;

/// Payload tag for opaque D-Bus payloads: the ASCII bytes `DBusDBus`.
pub const PAYLOAD_DBUS: u64 = u64::from_ne_bytes(*b"DBusDBus");

/// Payload tag for core-synthesized notification messages.
pub const PAYLOAD_KERNEL: u64 = 0;

/// Header flag: the sender expects a reply and tracks `timeout_ns`.
pub const MSG_FLAG_EXPECT_REPLY: u64 = 1 << 0;

/// Mask of header flags the core understands.
pub const MSG_FLAGS_KNOWN: u64 = MSG_FLAG_EXPECT_REPLY;

/// Round `value` up to the next multiple of 8.
#[must_use]
pub const fn align8(value: u64) -> u64 {
    (value + 7) & !7
}

/// Possible errors produced while encoding or decoding framed messages.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WireError {
    /// Input buffer was shorter than the declared frame length.
    #[error("truncated frame: declared {declared} have {actual}")]
    Truncated {
        /// Frame length declared in the header.
        declared: u64,
        /// Byte length actually supplied.
        actual: usize,
    },
    /// Declared frame size is not a multiple of 8 or below the header size.
    #[error("misaligned frame size {0}")]
    MisalignedFrame(u64),
    /// Declared frame size exceeds the frame ceiling.
    #[error("frame size {size} exceeds limit {limit}")]
    FrameTooLarge {
        /// Declared frame size.
        size: u64,
        /// Permitted maximum.
        limit: u64,
    },
    /// A record declared a size smaller than its own header.
    #[error("record size {0} below record header")]
    RecordTooShort(u64),
    /// A record does not fit in the remaining frame bytes.
    #[error("record overruns frame at offset {0}")]
    RecordOverrun(u64),
    /// Encountered an unknown record kind tag.
    #[error("unknown record kind {0}")]
    UnknownRecord(u64),
    /// Record payload length does not match its kind's fixed layout.
    #[error("record kind {kind} length mismatch: declared {declared}")]
    RecordLength {
        /// Offending record kind tag.
        kind: u64,
        /// Declared payload length.
        declared: u64,
    },
    /// Header flags contain bits the core does not understand.
    #[error("unknown header flags {0:#x}")]
    UnknownFlags(u64),
    /// Encountered malformed UTF-8 in a string record.
    #[error("invalid utf8 in string record")]
    InvalidUtf8,
    /// Bloom data fails the size rules (zero, unaligned, or oversized).
    #[error("invalid bloom size {0}")]
    InvalidBloomSize(u64),
    /// Too many records in one frame.
    #[error("record count exceeds {0}")]
    TooManyRecords(usize),
}

/// Record kind tags carried on the wire.
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    /// Payload bytes carried inline in the frame.
    PayloadInline = 0x01,
    /// Payload reference into the sender's address space.
    PayloadVec = 0x02,
    /// Reference to a sealed memory object.
    PayloadMemfd = 0x03,
    /// A passed descriptor.
    Fd = 0x04,
    /// Destination well-known name.
    DstName = 0x05,
    /// Bloom filter attached to a broadcast.
    Bloom = 0x06,
    /// Array of bloom mask entries, one per generation.
    BloomMask = 0x07,
    /// Metadata: send timestamps.
    Timestamp = 0x10,
    /// Metadata: sender credentials.
    Creds = 0x11,
    /// Metadata: sender executable path.
    Exe = 0x12,
    /// Metadata: sender command line.
    Cmdline = 0x13,
    /// Metadata: sender control-group path.
    Cgroup = 0x14,
    /// Metadata: sender capability bits.
    Caps = 0x15,
    /// Metadata: sender security label.
    Seclabel = 0x16,
    /// Metadata: sender audit ids.
    Audit = 0x17,
    /// Metadata: well-known names owned by the sender.
    OwnedNames = 0x18,
    /// Notification: the receiver acquired a well-known name.
    NameAcquired = 0x20,
    /// Notification: the receiver lost a well-known name.
    NameLost = 0x21,
    /// Notification: a peer connection disappeared.
    PeerGone = 0x22,
    /// Notification: an expected reply timed out.
    ReplyTimeout = 0x23,
    /// Notification: deliveries were dropped while the pool was full.
    Overflow = 0x24,
}

impl TryFrom<u64> for RecordKind {
    type Error = WireError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        use RecordKind::*;
        Ok(match value {
            0x01 => PayloadInline,
            0x02 => PayloadVec,
            0x03 => PayloadMemfd,
            0x04 => Fd,
            0x05 => DstName,
            0x06 => Bloom,
            0x07 => BloomMask,
            0x10 => Timestamp,
            0x11 => Creds,
            0x12 => Exe,
            0x13 => Cmdline,
            0x14 => Cgroup,
            0x15 => Caps,
            0x16 => Seclabel,
            0x17 => Audit,
            0x18 => OwnedNames,
            0x20 => NameAcquired,
            0x21 => NameLost,
            0x22 => PeerGone,
            0x23 => ReplyTimeout,
            0x24 => Overflow,
            other => return Err(WireError::UnknownRecord(other)),
        })
    }
}

/// One typed, length-prefixed record in a framed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    /// Payload bytes carried inline.
    Inline(Vec<u8>),
    /// Payload reference into the sender's address space, copied once into
    /// the receiver pool at delivery.
    Vec {
        /// Address in the sender's memory.
        address: u64,
        /// Byte length at that address.
        length: u64,
    },
    /// Reference to a sealed memory object, attached without copying.
    Memfd {
        /// Subsystem-wide sealed object id.
        id: u64,
        /// Sealed byte length.
        size: u64,
    },
    /// A passed descriptor, duplicated per recipient.
    Fd {
        /// Opaque descriptor token.
        fd: u64,
    },
    /// Destination well-known name for `dst_id == 0` sends.
    Name(String),
    /// Bloom filter attached to a broadcast.
    Bloom(BloomFilter),
    /// Bloom mask entries, one per generation, oldest first.
    BloomMask(Vec<BloomFilter>),
    /// Send timestamps stamped by the router.
    Timestamp {
        /// Monotonic clock at send, nanoseconds.
        monotonic_ns: u64,
        /// Realtime clock at send, nanoseconds since the epoch.
        realtime_ns: u64,
    },
    /// Sender credentials snapshot.
    Creds {
        /// Sender uid.
        uid: u64,
        /// Sender gid.
        gid: u64,
        /// Sender pid.
        pid: u64,
    },
    /// Sender executable path.
    Exe(String),
    /// Sender command line.
    Cmdline(String),
    /// Sender control-group path.
    Cgroup(String),
    /// Sender capability bits.
    Caps(u64),
    /// Sender security label.
    Seclabel(String),
    /// Sender audit ids.
    Audit {
        /// Audit login uid.
        loginuid: u64,
        /// Audit session id.
        sessionid: u64,
    },
    /// Well-known names owned by the sender at send time.
    OwnedNames(Vec<String>),
    /// Notification: a well-known name was acquired by the receiver.
    NameAcquired(String),
    /// Notification: a well-known name was lost by the receiver.
    NameLost(String),
    /// Notification: the identified peer connection disappeared.
    PeerGone {
        /// Departed connection id.
        id: u64,
    },
    /// Notification: an expected reply timed out.
    ReplyTimeout {
        /// Cookie of the send whose reply never arrived.
        cookie: u64,
    },
    /// Notification: deliveries were dropped while the pool was full.
    Overflow {
        /// Count of deliveries dropped since the last indicator.
        dropped: u64,
    },
}

impl Record {
    /// Return the wire kind tag for this record.
    #[must_use]
    pub fn kind(&self) -> RecordKind {
        match self {
            Record::Inline(_) => RecordKind::PayloadInline,
            Record::Vec { .. } => RecordKind::PayloadVec,
            Record::Memfd { .. } => RecordKind::PayloadMemfd,
            Record::Fd { .. } => RecordKind::Fd,
            Record::Name(_) => RecordKind::DstName,
            Record::Bloom(_) => RecordKind::Bloom,
            Record::BloomMask(_) => RecordKind::BloomMask,
            Record::Timestamp { .. } => RecordKind::Timestamp,
            Record::Creds { .. } => RecordKind::Creds,
            Record::Exe(_) => RecordKind::Exe,
            Record::Cmdline(_) => RecordKind::Cmdline,
            Record::Cgroup(_) => RecordKind::Cgroup,
            Record::Caps(_) => RecordKind::Caps,
            Record::Seclabel(_) => RecordKind::Seclabel,
            Record::Audit { .. } => RecordKind::Audit,
            Record::OwnedNames(_) => RecordKind::OwnedNames,
            Record::NameAcquired(_) => RecordKind::NameAcquired,
            Record::NameLost(_) => RecordKind::NameLost,
            Record::PeerGone { .. } => RecordKind::PeerGone,
            Record::ReplyTimeout { .. } => RecordKind::ReplyTimeout,
            Record::Overflow { .. } => RecordKind::Overflow,
        }
    }
}

/// A parsed framed message: header fields plus the record sequence.
///
/// The `size` header field is implied by the contents and recomputed on
/// encode; decode verifies it against the supplied buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Header flags.
    pub flags: u64,
    /// Destination connection id, [`DST_ID_NAME`], or [`DST_ID_BROADCAST`].
    pub dst_id: u64,
    /// Source connection id; [`SRC_ID_KERNEL`] for synthesized messages.
    pub src_id: u64,
    /// Payload type tag, normally [`PAYLOAD_DBUS`].
    pub payload_type: u64,
    /// Sender-chosen cookie identifying this message.
    pub cookie: u64,
    /// Cookie of the message this one replies to, or 0.
    pub cookie_reply: u64,
    /// Reply timeout in nanoseconds when [`MSG_FLAG_EXPECT_REPLY`] is set.
    pub timeout_ns: u64,
    /// Typed records, in wire order.
    pub records: Vec<Record>,
}

impl Message {
    /// Return the first inline payload record, if any.
    #[must_use]
    pub fn inline_payload(&self) -> Option<&[u8]> {
        self.records.iter().find_map(|record| match record {
            Record::Inline(bytes) => Some(bytes.as_slice()),
            _ => None,
        })
    }

    /// Return the embedded destination name record, if any.
    #[must_use]
    pub fn dst_name(&self) -> Option<&str> {
        self.records.iter().find_map(|record| match record {
            Record::Name(name) => Some(name.as_str()),
            _ => None,
        })
    }

    /// Return the attached bloom filter record, if any.
    #[must_use]
    pub fn bloom(&self) -> Option<&BloomFilter> {
        self.records.iter().find_map(|record| match record {
            Record::Bloom(filter) => Some(filter),
            _ => None,
        })
    }
}
