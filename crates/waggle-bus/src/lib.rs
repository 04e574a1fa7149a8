// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Public waggle bus-core interface: subsystem, errors, and clock.
// Author: Lukas Bower
#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! In-process message bus core in the shape of a kernel-resident bus: a
//! domain tree holding buses, buses holding endpoints, endpoints accepting
//! connections, and a router moving framed messages into per-connection
//! receive pools. Unicast addresses a numeric connection id or a well-known
//! name; broadcast fans out through versioned bloom subscriptions. Large
//! payloads travel either single-copy into the receiver pool or zero-copy
//! through sealed memory objects.

use std::fmt;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use thiserror::Error;
use waggle_wire::WireError;

mod bus;
mod connection;
mod control;
mod domain;
mod endpoint;
mod memfd;
mod metadata;
mod names;
mod policy;
mod pool;
mod router;

pub use bus::{BusRef, BusSpec};
pub use connection::{
    ConnectionHandle, MatchRule, MatchSender, MsgDescriptor, SenderMemory, SliceMemory,
    FD_TABLE_CAP, POOL_MAX_BYTES, POOL_MIN_BYTES,
};
pub use control::ControlHandle;
pub use domain::DomainRef;
pub use endpoint::{EndpointAccess, EndpointHandle, EndpointRef, EndpointSpec};
pub use memfd::{MemfdHandle, MemfdView, MEMFD_MAX_BYTES};
pub use metadata::{AttachMask, ProcessContext};
pub use names::{NameFlags, NameListEntry, NameListFilter, NameStatus};
pub use policy::{PolicyDecision, PolicyRule, PolicySet, PolicySubject, PolicyVerb};

use domain::{Domain, DomainDirectory};
use memfd::MemfdRegistry;

/// Broad classification of a bus error, mirroring the failure taxonomy the
/// core promises to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The caller handed the core something malformed or out of protocol.
    Usage,
    /// A bounded resource is exhausted.
    Capacity,
    /// A destination or name does not resolve.
    Lookup,
    /// Policy forbids the operation.
    Permission,
    /// The object is in the wrong state for the operation.
    State,
    /// The operation was cut short by cancellation or interruption.
    Interrupt,
}

/// Errors surfaced by bus-core operations.
#[derive(Debug, Error)]
pub enum BusError {
    /// Frame bytes failed wire validation.
    #[error("frame error: {0}")]
    Frame(#[from] WireError),
    /// HELLO was issued on an already active connection.
    #[error("connection already said hello")]
    HelloTwice,
    /// A connection operation was issued before HELLO.
    #[error("connection has not said hello")]
    NotActive,
    /// A control handle was used after its one-time transition.
    #[error("control handle already consumed")]
    HandleConsumed,
    /// Pool size outside the accepted bounds or misaligned.
    #[error("invalid pool size {size}")]
    InvalidPoolSize {
        /// Requested pool size in bytes.
        size: u64,
    },
    /// Sealed-object size outside the accepted bounds.
    #[error("invalid memfd size {size}")]
    InvalidMemfdSize {
        /// Requested object size in bytes.
        size: u64,
    },
    /// A write fell outside a sealed-object buffer.
    #[error("memfd write of {length} at {offset} exceeds size {size}")]
    MemfdBounds {
        /// Write offset.
        offset: u64,
        /// Write length.
        length: u64,
        /// Object size.
        size: u64,
    },
    /// A well-known name failed validation.
    #[error("invalid well-known name '{name}'")]
    NameInvalid {
        /// The offending name.
        name: String,
    },
    /// A record kind is not accepted from clients on this path.
    #[error("record not allowed here: {kind}")]
    RecordNotAllowed {
        /// Human-readable record kind label.
        kind: &'static str,
    },
    /// A name-addressed send carried no name record.
    #[error("destination id 0 requires a name record")]
    NameRecordMissing,
    /// A payload vector did not resolve through the sender memory.
    #[error("payload vector {length}@{address:#x} did not resolve")]
    VecUnresolved {
        /// Address in the sender's memory.
        address: u64,
        /// Declared byte length.
        length: u64,
    },
    /// A sealed-object reference named an unknown id.
    #[error("unknown memfd id {id}")]
    MemfdUnknown {
        /// The unresolved object id.
        id: u64,
    },
    /// Match mask width differs from the bus bloom width.
    #[error("match mask width {have} does not fit bus bloom width {want}")]
    MatchBloomWidth {
        /// Installed mask width in bytes.
        have: u64,
        /// Bus bloom width in bytes.
        want: u64,
    },
    /// FREE or a frame read named an offset with no delivered slice.
    #[error("no delivered slice at pool offset {offset}")]
    UnknownOffset {
        /// The unknown pool offset.
        offset: u64,
    },
    /// REMOVE_MATCH named a cookie with no installed rule.
    #[error("no match rule with cookie {cookie}")]
    MatchNotFound {
        /// The unknown rule cookie.
        cookie: u64,
    },
    /// RELEASE_NAME was issued by a connection not owning the name.
    #[error("connection does not own '{name}'")]
    NotNameOwner {
        /// The name that was not owned.
        name: String,
    },
    /// EXPECT_REPLY was set without a timeout.
    #[error("expected reply requires a timeout")]
    ReplyWithoutDeadline,
    /// Descriptor records are not deliverable over broadcast.
    #[error("descriptor records cannot be broadcast")]
    FdOverBroadcast,
    /// EXPECT_REPLY is not meaningful on broadcast.
    #[error("broadcasts cannot expect replies")]
    ReplyOverBroadcast,
    /// An endpoint with the requested name already exists on the bus.
    #[error("endpoint '{name}' already exists")]
    EndpointExists {
        /// The duplicate endpoint name.
        name: String,
    },
    /// A bus with the requested name already exists in the domain.
    #[error("bus '{name}' already exists")]
    BusExists {
        /// The duplicate bus name.
        name: String,
    },
    /// A sub-domain with the requested name already exists.
    #[error("domain '{name}' already exists")]
    DomainExists {
        /// The duplicate domain name.
        name: String,
    },
    /// The destination pool cannot hold the delivery.
    #[error("pool full: need {needed} of {capacity}")]
    PoolFull {
        /// Bytes the delivery needs.
        needed: u64,
        /// Pool capacity in bytes.
        capacity: u64,
    },
    /// The receiver descriptor table is at capacity.
    #[error("descriptor table full at {capacity}")]
    FdTableFull {
        /// Table capacity.
        capacity: usize,
    },
    /// A synthetic delivery was dropped for lack of pool space.
    #[error("mailbox overflow")]
    MailboxOverflow,
    /// No connection with the addressed id exists on the bus.
    #[error("no destination with id {id}")]
    NoDestination {
        /// The unresolved connection id.
        id: u64,
    },
    /// No owner exists for the addressed well-known name.
    #[error("name '{name}' not found")]
    NameNotFound {
        /// The unresolved name.
        name: String,
    },
    /// No endpoint with the given name exists on the bus.
    #[error("endpoint '{name}' not found")]
    EndpointNotFound {
        /// The unresolved endpoint name.
        name: String,
    },
    /// No domain is registered under the given path.
    #[error("domain '{path}' not found")]
    DomainNotFound {
        /// The unresolved slash-separated path.
        path: String,
    },
    /// Policy denied the operation.
    #[error("policy denied {verb} on '{name}'")]
    PolicyDenied {
        /// The denied verb.
        verb: PolicyVerb,
        /// The object name the check ran against.
        name: String,
    },
    /// The endpoint access triple denied the open.
    #[error("endpoint access denied")]
    OpenDenied,
    /// The object behind this handle has been disconnected.
    #[error("disconnected")]
    Disconnected,
    /// The name is owned and the acquire did not queue or replace.
    #[error("name '{name}' already taken")]
    NameTaken {
        /// The contested name.
        name: String,
    },
    /// A write hit a sealed memory object.
    #[error("write on sealed memory object")]
    WriteOnSealed,
    /// A send referenced a memory object that is not sealed.
    #[error("memfd {id} is not sealed")]
    MemfdNotSealed {
        /// The unsealed object id.
        id: u64,
    },
    /// Unseal was attempted while other references are live.
    #[error("cannot unseal with {refs} live references")]
    UnsealShared {
        /// Observed reference count.
        refs: usize,
    },
    /// A reply arrived with no caller waiting on its cookie.
    #[error("no caller waits for reply cookie {cookie}")]
    ReplyOrphan {
        /// The orphaned reply cookie.
        cookie: u64,
    },
    /// A bounded receive ran out of time.
    #[error("timed out")]
    Timeout,
    /// The connection was closed while blocked.
    #[error("canceled")]
    Canceled,
    /// The wait was interrupted.
    #[error("interrupted")]
    Interrupted,
}

impl BusError {
    /// Classify this error into the taxonomy the core documents.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        use BusError::*;
        match self {
            Frame(_) | HelloTwice | NotActive | HandleConsumed | InvalidPoolSize { .. }
            | InvalidMemfdSize { .. } | MemfdBounds { .. } | NameInvalid { .. }
            | RecordNotAllowed { .. } | NameRecordMissing | VecUnresolved { .. }
            | MemfdUnknown { .. } | UnknownOffset { .. } | MatchBloomWidth { .. }
            | MatchNotFound { .. } | NotNameOwner { .. } | ReplyWithoutDeadline
            | FdOverBroadcast | ReplyOverBroadcast => ErrorKind::Usage,
            PoolFull { .. } | FdTableFull { .. } | MailboxOverflow => ErrorKind::Capacity,
            NoDestination { .. } | NameNotFound { .. } | EndpointNotFound { .. }
            | DomainNotFound { .. } => ErrorKind::Lookup,
            PolicyDenied { .. } | OpenDenied => ErrorKind::Permission,
            Disconnected | NameTaken { .. } | EndpointExists { .. } | BusExists { .. }
            | DomainExists { .. } | WriteOnSealed | MemfdNotSealed { .. }
            | UnsealShared { .. } | ReplyOrphan { .. } | Timeout => ErrorKind::State,
            Canceled | Interrupted => ErrorKind::Interrupt,
        }
    }
}

/// Time source abstraction used for reply deadlines and metadata stamping.
pub trait Clock: Send + Sync {
    /// Return the current monotonic instant.
    fn now(&self) -> Instant;
    /// Return a monotonic nanosecond reading suitable for timestamps.
    fn monotonic_ns(&self) -> u64;
    /// Return the current realtime clock in nanoseconds since the epoch.
    fn realtime_ns(&self) -> u64;
}

/// System clock implementation backed by `Instant::now`.
#[derive(Debug)]
pub struct SystemClock {
    start: Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn monotonic_ns(&self) -> u64 {
        self.start.elapsed().as_nanos() as u64
    }

    fn realtime_ns(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64
    }
}

/// The process-wide bus subsystem: the root domain, the domain-name
/// directory, and the sealed-object table.
///
/// Tests instantiate a fresh subsystem each to avoid cross-test
/// interference; nothing in the crate is process-global.
#[derive(Clone)]
pub struct Subsystem {
    shared: Arc<SubsystemShared>,
}

pub(crate) struct SubsystemShared {
    memfds: Arc<MemfdRegistry>,
    directory: Arc<DomainDirectory>,
    root: Arc<Domain>,
}

impl fmt::Debug for Subsystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subsystem").finish_non_exhaustive()
    }
}

impl Subsystem {
    /// Start a subsystem with the system clock and a fresh root domain.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::default()))
    }

    /// Start a subsystem using the supplied clock (primarily for tests).
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let memfds = Arc::new(MemfdRegistry::new());
        let directory = Arc::new(DomainDirectory::new());
        let root = Domain::new_root(clock, memfds.clone(), &directory);
        Self {
            shared: Arc::new(SubsystemShared {
                memfds,
                directory,
                root,
            }),
        }
    }

    /// Open a control handle bound to the root domain.
    pub fn open_control(&self) -> Result<ControlHandle, BusError> {
        ControlHandle::open(self.shared.root.clone())
    }

    /// Look up a domain by its slash-separated path from the root and open
    /// a control handle bound to it.
    pub fn open_control_at(&self, path: &str) -> Result<ControlHandle, BusError> {
        let domain = self
            .shared
            .directory
            .find(path)
            .ok_or_else(|| BusError::DomainNotFound {
                path: path.to_owned(),
            })?;
        ControlHandle::open(domain)
    }

    /// Return a reference to the root domain.
    #[must_use]
    pub fn root(&self) -> DomainRef {
        DomainRef::new(self.shared.root.clone())
    }

    /// Create a new mutable memory object of `size` bytes.
    pub fn memfd_new(&self, size: u64) -> Result<MemfdHandle, BusError> {
        self.shared.memfds.create(size)
    }

    /// Shut the subsystem down: the root domain disconnects and every bus,
    /// endpoint, and connection beneath it cascades down with it.
    pub fn shutdown(&self) {
        Domain::disconnect(&self.shared.root);
    }
}

impl Default for Subsystem {
    fn default() -> Self {
        Self::new()
    }
}
