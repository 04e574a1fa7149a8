// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Bus endpoints: access gating, policy overlays, receiver wake-up.
// Author: Lukas Bower

use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::Instant;

use log::debug;

use crate::connection::{Connection, ConnectionHandle, TerminationCause};
use crate::policy::PolicySet;
use crate::{BusError, ProcessContext};

/// Name of the default endpoint every bus carries.
pub(crate) const DEFAULT_ENDPOINT: &str = "bus";

/// File-mode/uid/gid triple governing who may open an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointAccess {
    /// Permission bits in the usual rwx octal layout.
    pub mode: u32,
    /// Owning uid.
    pub uid: u32,
    /// Owning gid.
    pub gid: u32,
}

impl EndpointAccess {
    /// World-openable access.
    #[must_use]
    pub fn open_to_all() -> Self {
        Self {
            mode: 0o666,
            uid: 0,
            gid: 0,
        }
    }

    /// Access restricted to the owning uid (and root).
    #[must_use]
    pub fn owner_only(uid: u32, gid: u32) -> Self {
        Self {
            mode: 0o600,
            uid,
            gid,
        }
    }

    fn permits(&self, creds: &ProcessContext) -> bool {
        if creds.uid() == 0 {
            return true;
        }
        let class = if creds.uid() == self.uid {
            (self.mode >> 6) & 0o7
        } else if creds.gid() == self.gid {
            (self.mode >> 3) & 0o7
        } else {
            self.mode & 0o7
        };
        // Opening a bus endpoint needs both read and write.
        class & 0o6 == 0o6
    }
}

/// Parameters for EP_MAKE.
#[derive(Debug, Clone)]
pub struct EndpointSpec {
    /// Endpoint name; must differ from the default `bus`.
    pub name: String,
    /// Access triple for opens.
    pub access: EndpointAccess,
    /// Optional policy overlay; custom endpoints may only narrow.
    pub policy: Option<PolicySet>,
}

impl EndpointSpec {
    /// Construct a world-openable endpoint spec with no policy overlay.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            access: EndpointAccess::open_to_all(),
            policy: None,
        }
    }

    /// Set the access triple.
    #[must_use]
    pub fn access(mut self, access: EndpointAccess) -> Self {
        self.access = access;
        self
    }

    /// Install a policy overlay.
    #[must_use]
    pub fn policy(mut self, policy: PolicySet) -> Self {
        self.policy = Some(policy);
        self
    }
}

/// Wake-up primitive shared by every receiver blocked on an endpoint. The
/// sequence number pairs with a pre-wait snapshot so wake-ups between the
/// mailbox check and the wait are never lost.
pub(crate) struct WaitQueue {
    seq: Mutex<u64>,
    cv: Condvar,
}

impl WaitQueue {
    fn new() -> Self {
        Self {
            seq: Mutex::new(0),
            cv: Condvar::new(),
        }
    }

    pub(crate) fn current(&self) -> u64 {
        *self.seq.lock().expect("poisoned wait queue lock")
    }

    pub(crate) fn notify_all(&self) {
        {
            let mut seq = self.seq.lock().expect("poisoned wait queue lock");
            *seq = seq.wrapping_add(1);
        }
        self.cv.notify_all();
    }

    /// Block until the sequence moves past `seen` or `deadline` passes.
    pub(crate) fn wait_past(&self, seen: u64, deadline: Option<Instant>, now: Instant) {
        let mut seq = self.seq.lock().expect("poisoned wait queue lock");
        while *seq == seen {
            match deadline {
                Some(limit) => {
                    let Some(remaining) = limit.checked_duration_since(now) else {
                        return;
                    };
                    let (guard, result) = self
                        .cv
                        .wait_timeout(seq, remaining)
                        .expect("poisoned wait queue lock");
                    seq = guard;
                    if result.timed_out() {
                        return;
                    }
                }
                None => {
                    seq = self.cv.wait(seq).expect("poisoned wait queue lock");
                }
            }
        }
    }
}

pub(crate) struct EpState {
    pub(crate) disconnected: bool,
    pub(crate) connections: Vec<Weak<Connection>>,
}

/// An access point to a bus.
pub(crate) struct Endpoint {
    name: String,
    id: u64,
    bus: Weak<crate::bus::Bus>,
    access: EndpointAccess,
    policy: Mutex<Option<PolicySet>>,
    wait: WaitQueue,
    state: Mutex<EpState>,
}

impl Endpoint {
    pub(crate) fn new(
        bus: &Arc<crate::bus::Bus>,
        name: String,
        id: u64,
        access: EndpointAccess,
        policy: Option<PolicySet>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name,
            id,
            bus: Arc::downgrade(bus),
            access,
            policy: Mutex::new(policy),
            wait: WaitQueue::new(),
            state: Mutex::new(EpState {
                disconnected: false,
                connections: Vec::new(),
            }),
        })
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn is_default(&self) -> bool {
        self.name == DEFAULT_ENDPOINT
    }

    pub(crate) fn wait(&self) -> &WaitQueue {
        &self.wait
    }

    pub(crate) fn policy(&self) -> Option<PolicySet> {
        self.policy.lock().expect("poisoned endpoint lock").clone()
    }

    pub(crate) fn set_policy(&self, policy: Option<PolicySet>) {
        *self.policy.lock().expect("poisoned endpoint lock") = policy;
    }

    /// Open an unconnected connection, gated by the access triple.
    pub(crate) fn open(
        self: &Arc<Self>,
        creds: ProcessContext,
    ) -> Result<ConnectionHandle, BusError> {
        if !self.access.permits(&creds) {
            return Err(BusError::OpenDenied);
        }
        let bus = self.bus.upgrade().ok_or(BusError::Disconnected)?;
        let conn = {
            let mut state = self.state.lock().expect("poisoned endpoint lock");
            if state.disconnected {
                return Err(BusError::Disconnected);
            }
            let conn = Connection::new(&bus, self, creds);
            state.connections.push(Arc::downgrade(&conn));
            conn
        };
        Ok(ConnectionHandle::new(conn))
    }

    pub(crate) fn forget(&self, conn: &Arc<Connection>) {
        let mut state = self.state.lock().expect("poisoned endpoint lock");
        state
            .connections
            .retain(|entry| entry.upgrade().is_some_and(|live| !Arc::ptr_eq(&live, conn)));
    }

    /// Disconnect the endpoint: terminate every connection opened through it
    /// and wake any blocked receiver.
    pub(crate) fn disconnect(self: &Arc<Self>) {
        let connections = {
            let mut state = self.state.lock().expect("poisoned endpoint lock");
            if state.disconnected {
                return;
            }
            state.disconnected = true;
            std::mem::take(&mut state.connections)
        };
        debug!(target: "waggle-bus", "endpoint '{}' disconnecting", self.name);
        for conn in connections.into_iter().filter_map(|weak| weak.upgrade()) {
            conn.terminate(TerminationCause::Cascade);
        }
        self.wait.notify_all();
    }
}

/// Reference to an endpoint, used to open connections.
#[derive(Clone)]
pub struct EndpointRef {
    ep: Arc<Endpoint>,
}

impl std::fmt::Debug for EndpointRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointRef")
            .field("name", &self.ep.name())
            .finish_non_exhaustive()
    }
}

impl EndpointRef {
    pub(crate) fn new(ep: Arc<Endpoint>) -> Self {
        Self { ep }
    }

    /// Return the endpoint name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.ep.name()
    }

    /// Return the endpoint id on its bus.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.ep.id()
    }

    /// Open an unconnected connection as the given process.
    pub fn open(&self, creds: ProcessContext) -> Result<ConnectionHandle, BusError> {
        self.ep.open(creds)
    }
}

/// Owner handle to a custom endpoint created with EP_MAKE. Dropping it
/// destroys the endpoint and terminates its connections.
pub struct EndpointHandle {
    ep: Arc<Endpoint>,
}

impl std::fmt::Debug for EndpointHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointHandle")
            .field("name", &self.ep.name())
            .finish_non_exhaustive()
    }
}

impl EndpointHandle {
    pub(crate) fn new(ep: Arc<Endpoint>) -> Self {
        Self { ep }
    }

    /// Return a reference usable to open connections.
    #[must_use]
    pub fn endpoint(&self) -> EndpointRef {
        EndpointRef::new(self.ep.clone())
    }

    /// EP_POLICY_SET: replace the endpoint's policy overlay.
    pub fn set_policy(&self, policy: Option<PolicySet>) {
        self.ep.set_policy(policy);
    }
}

impl Drop for EndpointHandle {
    fn drop(&mut self) {
        if let Some(bus) = self.ep.bus.upgrade() {
            bus.remove_endpoint(self.ep.name());
        }
        self.ep.disconnect();
    }
}
