// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: One-shot control handles creating buses and sub-domains.
// Author: Lukas Bower

use std::fmt;
use std::sync::Arc;

use waggle_wire::BloomFilter;

use crate::bus::{Bus, BusRef, BusSpec};
use crate::domain::{Domain, DomainRef};
use crate::BusError;

/// The dynamic type of a control handle. The transition away from
/// `Undefined` happens at most once; afterwards the handle is inert except
/// for close.
enum HandleRole {
    Undefined,
    BusOwner(Arc<Bus>),
    DomainOwner(Arc<Domain>),
}

/// A control handle bound to a domain.
///
/// The handle creates exactly one bus or one sub-domain over its lifetime;
/// dropping it destroys the created object and everything beneath it. There
/// is no way to keep a bus alive without holding its creator handle.
pub struct ControlHandle {
    domain: Arc<Domain>,
    role: HandleRole,
}

impl fmt::Debug for ControlHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let role = match &self.role {
            HandleRole::Undefined => "undefined",
            HandleRole::BusOwner(_) => "bus-owner",
            HandleRole::DomainOwner(_) => "domain-owner",
        };
        f.debug_struct("ControlHandle")
            .field("domain", &self.domain.name())
            .field("role", &role)
            .finish()
    }
}

impl ControlHandle {
    pub(crate) fn open(domain: Arc<Domain>) -> Result<Self, BusError> {
        if domain.is_disconnected() {
            return Err(BusError::Disconnected);
        }
        Ok(Self {
            domain,
            role: HandleRole::Undefined,
        })
    }

    fn ensure_undefined(&self) -> Result<(), BusError> {
        match self.role {
            HandleRole::Undefined => Ok(()),
            _ => Err(BusError::HandleConsumed),
        }
    }

    /// MAKE_BUS: create a bus in the bound domain. The handle becomes the
    /// bus owner; dropping it destroys the bus.
    pub fn make_bus(&mut self, spec: BusSpec) -> Result<BusRef, BusError> {
        self.ensure_undefined()?;
        if spec.name.is_empty() || spec.name.contains('/') {
            return Err(BusError::NameInvalid {
                name: spec.name.clone(),
            });
        }
        // A zeroed probe filter validates the configured bloom width.
        BloomFilter::new(0, spec.bloom_size)?;
        let bus = self.domain.make_bus(spec)?;
        self.role = HandleRole::BusOwner(bus.clone());
        Ok(BusRef::new(bus))
    }

    /// MAKE_DOMAIN: create a sub-domain. The handle becomes the domain
    /// owner; dropping it destroys the sub-domain and its contents.
    pub fn make_domain(&mut self, name: &str) -> Result<DomainRef, BusError> {
        self.ensure_undefined()?;
        if name.is_empty()
            || !name
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
        {
            return Err(BusError::NameInvalid {
                name: name.to_owned(),
            });
        }
        let child = self.domain.make_child(name)?;
        self.role = HandleRole::DomainOwner(child.clone());
        Ok(DomainRef::new(child))
    }

    /// Close the handle, destroying whatever it created.
    pub fn close(self) {}
}

impl Drop for ControlHandle {
    fn drop(&mut self) {
        match std::mem::replace(&mut self.role, HandleRole::Undefined) {
            HandleRole::Undefined => {}
            HandleRole::BusOwner(bus) => {
                if let Some(domain) = bus.domain() {
                    domain.remove_bus(bus.name());
                }
                bus.disconnect();
            }
            HandleRole::DomainOwner(domain) => {
                if let Some(parent) = domain.parent() {
                    parent.remove_child(domain.name());
                }
                domain.disconnect();
            }
        }
    }
}
