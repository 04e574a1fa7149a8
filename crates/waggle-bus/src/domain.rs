// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Domain tree: bus containers, sub-domains, cascading teardown.
// Author: Lukas Bower

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use log::{debug, info};

use crate::bus::{Bus, BusSpec};
use crate::memfd::MemfdRegistry;
use crate::{BusError, Clock};

pub(crate) struct DomainState {
    disconnected: bool,
    bus_id_next: u64,
    buses: HashMap<String, Arc<Bus>>,
    children: HashMap<String, Arc<Domain>>,
}

/// A namespace of buses and sub-domains. The root domain exists from
/// subsystem start and only disconnects at shutdown; every other domain
/// lives and dies with its creator's control handle or an ancestor.
pub(crate) struct Domain {
    name: String,
    id: u64,
    path: String,
    parent: Weak<Domain>,
    clock: Arc<dyn Clock>,
    memfds: Arc<MemfdRegistry>,
    directory: Weak<DomainDirectory>,
    state: Mutex<DomainState>,
}

impl Domain {
    pub(crate) fn new_root(
        clock: Arc<dyn Clock>,
        memfds: Arc<MemfdRegistry>,
        directory: &Arc<DomainDirectory>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: String::new(),
            id: directory.next_id(),
            path: String::new(),
            parent: Weak::new(),
            clock,
            memfds,
            directory: Arc::downgrade(directory),
            state: Mutex::new(DomainState {
                disconnected: false,
                bus_id_next: 1,
                buses: HashMap::new(),
                children: HashMap::new(),
            }),
        })
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn parent(&self) -> Option<Arc<Domain>> {
        self.parent.upgrade()
    }

    pub(crate) fn is_disconnected(&self) -> bool {
        self.state.lock().expect("poisoned domain lock").disconnected
    }

    /// MAKE_BUS: create a bus owned by this domain.
    pub(crate) fn make_bus(self: &Arc<Self>, spec: BusSpec) -> Result<Arc<Bus>, BusError> {
        let mut state = self.state.lock().expect("poisoned domain lock");
        if state.disconnected {
            return Err(BusError::Disconnected);
        }
        if state.buses.contains_key(&spec.name) {
            return Err(BusError::BusExists { name: spec.name });
        }
        let id = state.bus_id_next;
        state.bus_id_next += 1;
        let name = spec.name.clone();
        let bus = Bus::new(self, id, spec, self.clock.clone(), self.memfds.clone());
        state.buses.insert(name, bus.clone());
        Ok(bus)
    }

    pub(crate) fn remove_bus(&self, name: &str) {
        let mut state = self.state.lock().expect("poisoned domain lock");
        state.buses.remove(name);
    }

    /// MAKE_DOMAIN: create a sub-domain.
    pub(crate) fn make_child(self: &Arc<Self>, name: &str) -> Result<Arc<Domain>, BusError> {
        let directory = self.directory.upgrade().ok_or(BusError::Disconnected)?;
        let mut state = self.state.lock().expect("poisoned domain lock");
        if state.disconnected {
            return Err(BusError::Disconnected);
        }
        if state.children.contains_key(name) {
            return Err(BusError::DomainExists {
                name: name.to_owned(),
            });
        }
        let path = if self.path.is_empty() {
            name.to_owned()
        } else {
            format!("{}/{name}", self.path)
        };
        let child = Arc::new(Self {
            name: name.to_owned(),
            id: directory.next_id(),
            path: path.clone(),
            parent: Arc::downgrade(self),
            clock: self.clock.clone(),
            memfds: self.memfds.clone(),
            directory: self.directory.clone(),
            state: Mutex::new(DomainState {
                disconnected: false,
                bus_id_next: 1,
                buses: HashMap::new(),
                children: HashMap::new(),
            }),
        });
        state.children.insert(name.to_owned(), child.clone());
        directory.register(path, &child);
        info!(target: "waggle-bus", "domain '{}' created", child.path);
        Ok(child)
    }

    pub(crate) fn remove_child(&self, name: &str) {
        let mut state = self.state.lock().expect("poisoned domain lock");
        state.children.remove(name);
    }

    /// Disconnect this domain and everything beneath it. Sub-domains go
    /// first, then buses; both see a fully marked parent.
    pub(crate) fn disconnect(self: &Arc<Self>) {
        let (children, buses) = {
            let mut state = self.state.lock().expect("poisoned domain lock");
            if state.disconnected {
                return;
            }
            state.disconnected = true;
            (
                std::mem::take(&mut state.children),
                std::mem::take(&mut state.buses),
            )
        };
        debug!(target: "waggle-bus", "domain '{}' disconnecting", self.path);
        for child in children.values() {
            child.disconnect();
        }
        for bus in buses.values() {
            bus.disconnect();
        }
        if let Some(directory) = self.directory.upgrade() {
            directory.unregister(&self.path);
        }
    }
}

/// Reference to a domain, used to open control handles against it.
#[derive(Clone)]
pub struct DomainRef {
    domain: Arc<Domain>,
}

impl std::fmt::Debug for DomainRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DomainRef")
            .field("name", &self.domain.name())
            .finish_non_exhaustive()
    }
}

impl DomainRef {
    pub(crate) fn new(domain: Arc<Domain>) -> Self {
        Self { domain }
    }

    /// Return the domain name; empty for the root.
    #[must_use]
    pub fn name(&self) -> &str {
        self.domain.name()
    }

    /// Return the subsystem-wide domain id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.domain.id()
    }

    /// Open a control handle bound to this domain.
    pub fn open_control(&self) -> Result<crate::ControlHandle, BusError> {
        crate::ControlHandle::open(self.domain.clone())
    }
}

/// Subsystem-wide table mapping slash-separated domain paths to domains.
pub(crate) struct DomainDirectory {
    state: Mutex<DirectoryState>,
}

struct DirectoryState {
    id_next: u64,
    entries: HashMap<String, Weak<Domain>>,
}

impl DomainDirectory {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(DirectoryState {
                id_next: 1,
                entries: HashMap::new(),
            }),
        }
    }

    fn next_id(&self) -> u64 {
        let mut state = self.state.lock().expect("poisoned domain directory lock");
        let id = state.id_next;
        state.id_next += 1;
        id
    }

    fn register(&self, path: String, domain: &Arc<Domain>) {
        let mut state = self.state.lock().expect("poisoned domain directory lock");
        state.entries.insert(path, Arc::downgrade(domain));
    }

    fn unregister(&self, path: &str) {
        let mut state = self.state.lock().expect("poisoned domain directory lock");
        state.entries.remove(path);
    }

    pub(crate) fn find(&self, path: &str) -> Option<Arc<Domain>> {
        let state = self.state.lock().expect("poisoned domain directory lock");
        state
            .entries
            .get(path)
            .and_then(Weak::upgrade)
            .filter(|domain| !domain.is_disconnected())
    }
}
