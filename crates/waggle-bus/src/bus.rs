// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Bus objects: id allocation, endpoints, connection table, registry.
// Author: Lukas Bower

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use log::{debug, info};
use waggle_wire::BLOOM_DEFAULT_BYTES;

use crate::connection::{Connection, TerminationCause};
use crate::domain::Domain;
use crate::endpoint::{
    Endpoint, EndpointAccess, EndpointHandle, EndpointRef, EndpointSpec, DEFAULT_ENDPOINT,
};
use crate::memfd::MemfdRegistry;
use crate::names::NameRegistry;
use crate::policy::PolicySet;
use crate::{BusError, Clock};

/// Parameters for MAKE_BUS.
#[derive(Debug, Clone)]
pub struct BusSpec {
    /// Bus name, unique within its domain.
    pub name: String,
    /// Opaque flag bits passed unchanged from creator to observers.
    pub flags: u64,
    /// Access triple of the default endpoint.
    pub access: EndpointAccess,
    /// Bloom bit-array width in bytes for broadcast filters.
    pub bloom_size: u64,
    /// Optional bus-level policy.
    pub policy: Option<PolicySet>,
}

impl BusSpec {
    /// Construct a world-openable bus spec with default bloom width.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            flags: 0,
            access: EndpointAccess::open_to_all(),
            bloom_size: BLOOM_DEFAULT_BYTES,
            policy: None,
        }
    }

    /// Set the opaque flag bits.
    #[must_use]
    pub fn flags(mut self, flags: u64) -> Self {
        self.flags = flags;
        self
    }

    /// Set the default endpoint access triple.
    #[must_use]
    pub fn access(mut self, access: EndpointAccess) -> Self {
        self.access = access;
        self
    }

    /// Set the bloom bit-array width in bytes.
    #[must_use]
    pub fn bloom_size(mut self, bloom_size: u64) -> Self {
        self.bloom_size = bloom_size;
        self
    }

    /// Install a bus-level policy.
    #[must_use]
    pub fn policy(mut self, policy: PolicySet) -> Self {
        self.policy = Some(policy);
        self
    }
}

pub(crate) struct BusState {
    disconnected: bool,
    ep_id_next: u64,
    conn_id_next: u64,
    msg_id_next: u64,
    connections: HashMap<u64, Arc<Connection>>,
    endpoints: Vec<Arc<Endpoint>>,
}

/// A named exchange inside one domain. Counters are u64, never reused, and
/// connection ids start at 1: 0 is reserved for the kernel source and
/// name-resolved destinations, all-ones for broadcast.
pub(crate) struct Bus {
    name: String,
    id: u64,
    flags: u64,
    bloom_size: u64,
    domain: Weak<Domain>,
    clock: Arc<dyn Clock>,
    memfds: Arc<MemfdRegistry>,
    policy: Option<PolicySet>,
    registry: NameRegistry,
    state: Mutex<BusState>,
}

impl Bus {
    pub(crate) fn new(
        domain: &Arc<Domain>,
        id: u64,
        spec: BusSpec,
        clock: Arc<dyn Clock>,
        memfds: Arc<MemfdRegistry>,
    ) -> Arc<Self> {
        let bus = Arc::new(Self {
            name: spec.name,
            id,
            flags: spec.flags,
            bloom_size: spec.bloom_size,
            domain: Arc::downgrade(domain),
            clock,
            memfds,
            policy: spec.policy,
            registry: NameRegistry::new(),
            state: Mutex::new(BusState {
                disconnected: false,
                ep_id_next: 1,
                conn_id_next: 1,
                msg_id_next: 1,
                connections: HashMap::new(),
                endpoints: Vec::new(),
            }),
        });
        let default = Endpoint::new(
            &bus,
            DEFAULT_ENDPOINT.to_owned(),
            1,
            spec.access,
            None,
        );
        {
            let mut state = bus.state.lock().expect("poisoned bus lock");
            state.ep_id_next = 2;
            state.endpoints.push(default);
        }
        info!(target: "waggle-bus", "bus '{}' created", bus.name);
        bus
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn flags(&self) -> u64 {
        self.flags
    }

    pub(crate) fn bloom_size(&self) -> u64 {
        self.bloom_size
    }

    pub(crate) fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub(crate) fn domain(&self) -> Option<Arc<Domain>> {
        self.domain.upgrade()
    }

    pub(crate) fn memfds(&self) -> &Arc<MemfdRegistry> {
        &self.memfds
    }

    pub(crate) fn policy(&self) -> Option<&PolicySet> {
        self.policy.as_ref()
    }

    pub(crate) fn registry(&self) -> &NameRegistry {
        &self.registry
    }

    pub(crate) fn endpoint(&self, name: &str) -> Result<Arc<Endpoint>, BusError> {
        let state = self.state.lock().expect("poisoned bus lock");
        if state.disconnected {
            return Err(BusError::Disconnected);
        }
        state
            .endpoints
            .iter()
            .find(|ep| ep.name() == name)
            .cloned()
            .ok_or_else(|| BusError::EndpointNotFound {
                name: name.to_owned(),
            })
    }

    pub(crate) fn make_endpoint(
        self: &Arc<Self>,
        spec: EndpointSpec,
    ) -> Result<Arc<Endpoint>, BusError> {
        let mut state = self.state.lock().expect("poisoned bus lock");
        if state.disconnected {
            return Err(BusError::Disconnected);
        }
        if spec.name == DEFAULT_ENDPOINT
            || state.endpoints.iter().any(|ep| ep.name() == spec.name)
        {
            return Err(BusError::EndpointExists { name: spec.name });
        }
        let id = state.ep_id_next;
        state.ep_id_next += 1;
        let ep = Endpoint::new(self, spec.name, id, spec.access, spec.policy);
        state.endpoints.push(ep.clone());
        Ok(ep)
    }

    pub(crate) fn remove_endpoint(&self, name: &str) {
        let mut state = self.state.lock().expect("poisoned bus lock");
        state.endpoints.retain(|ep| ep.name() != name);
    }

    /// Allocate the next connection id and enter the connection into the
    /// table. Ids increase strictly and are never reissued.
    pub(crate) fn register_connection(&self, conn: &Arc<Connection>) -> Result<u64, BusError> {
        let mut state = self.state.lock().expect("poisoned bus lock");
        if state.disconnected {
            return Err(BusError::Disconnected);
        }
        let id = state.conn_id_next;
        state.conn_id_next += 1;
        state.connections.insert(id, conn.clone());
        Ok(id)
    }

    pub(crate) fn remove_connection(&self, id: u64) {
        let mut state = self.state.lock().expect("poisoned bus lock");
        state.connections.remove(&id);
    }

    pub(crate) fn lookup_connection(&self, id: u64) -> Option<Arc<Connection>> {
        let state = self.state.lock().expect("poisoned bus lock");
        state.connections.get(&id).cloned()
    }

    /// Snapshot the connection table for broadcast fan-out; the bus lock is
    /// released before any per-recipient work.
    pub(crate) fn snapshot_connections(&self) -> Vec<Arc<Connection>> {
        let state = self.state.lock().expect("poisoned bus lock");
        state.connections.values().cloned().collect()
    }

    pub(crate) fn next_msg_id(&self) -> u64 {
        let mut state = self.state.lock().expect("poisoned bus lock");
        let id = state.msg_id_next;
        state.msg_id_next += 1;
        id
    }

    /// Disconnect the bus: every endpoint and connection within it goes
    /// down and blocked receivers wake.
    pub(crate) fn disconnect(self: &Arc<Self>) {
        let (endpoints, connections) = {
            let mut state = self.state.lock().expect("poisoned bus lock");
            if state.disconnected {
                return;
            }
            state.disconnected = true;
            (
                std::mem::take(&mut state.endpoints),
                std::mem::take(&mut state.connections),
            )
        };
        debug!(target: "waggle-bus", "bus '{}' disconnecting", self.name);
        for conn in connections.values() {
            conn.terminate(TerminationCause::Cascade);
        }
        for ep in &endpoints {
            ep.disconnect();
        }
    }
}

/// Reference to a bus, handed to its creator.
#[derive(Clone)]
pub struct BusRef {
    bus: Arc<Bus>,
}

impl std::fmt::Debug for BusRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusRef")
            .field("name", &self.bus.name())
            .finish_non_exhaustive()
    }
}

impl BusRef {
    pub(crate) fn new(bus: Arc<Bus>) -> Self {
        Self { bus }
    }

    /// Return the bus name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.bus.name()
    }

    /// Return the bus id within its domain.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.bus.id()
    }

    /// Return the opaque flag bits chosen at MAKE_BUS.
    #[must_use]
    pub fn flags(&self) -> u64 {
        self.bus.flags()
    }

    /// Return the default endpoint.
    pub fn default_endpoint(&self) -> Result<EndpointRef, BusError> {
        self.endpoint(DEFAULT_ENDPOINT)
    }

    /// Return the endpoint with the given name.
    pub fn endpoint(&self, name: &str) -> Result<EndpointRef, BusError> {
        Ok(EndpointRef::new(self.bus.endpoint(name)?))
    }

    /// EP_MAKE: create a custom endpoint carrying its own access triple and
    /// optional policy overlay.
    pub fn make_endpoint(&self, spec: EndpointSpec) -> Result<EndpointHandle, BusError> {
        Ok(EndpointHandle::new(self.bus.make_endpoint(spec)?))
    }
}
