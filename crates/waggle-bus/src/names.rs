// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Per-bus well-known-name registry with replacement and queueing.
// Author: Lukas Bower

use std::collections::{HashMap, VecDeque};
use std::ops::BitOr;
use std::sync::Mutex;

use serde::Serialize;
use waggle_wire::Record;

use crate::BusError;

const NAME_MAX_BYTES: usize = 255;

/// Flags accepted by NAME_ACQUIRE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NameFlags(u64);

impl NameFlags {
    /// No flags.
    pub const NONE: Self = Self(0);
    /// Boot a replaceable owner and take primacy.
    pub const REPLACE_EXISTING: Self = Self(1 << 0);
    /// Permit a later REPLACE_EXISTING acquire to boot this owner.
    pub const ALLOW_REPLACEMENT: Self = Self(1 << 1);
    /// Wait in the owner queue when the name is taken.
    pub const QUEUE: Self = Self(1 << 2);

    /// Return whether every bit of `other` is set.
    #[must_use]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for NameFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Outcome of a successful NAME_ACQUIRE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameStatus {
    /// The caller is now the primary owner.
    Acquired,
    /// The caller already owned the name; flags were updated.
    AlreadyOwner,
    /// The name is taken; the caller waits in the owner queue.
    InQueue,
}

/// Listing filter for NAME_LIST.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum NameListFilter {
    /// Every registered name.
    #[default]
    All,
    /// Names beginning with the given prefix.
    Prefix(String),
}

/// One row of a NAME_LIST snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NameListEntry {
    /// The registered name or wildcard pattern.
    pub name: String,
    /// Primary owner connection id.
    pub owner_id: u64,
    /// Whether the owner allows replacement.
    pub allows_replacement: bool,
    /// Count of queued waiters.
    pub queued: usize,
}

/// A synthetic notification owed to a connection after a registry change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct NameEvent {
    pub(crate) target_id: u64,
    pub(crate) record: Record,
}

#[derive(Debug, Clone, Copy)]
struct NameOwner {
    id: u64,
    flags: NameFlags,
}

struct NameEntry {
    owner: NameOwner,
    queue: VecDeque<NameOwner>,
}

/// Per-bus table from well-known name to primary owner plus waiters.
pub(crate) struct NameRegistry {
    state: Mutex<HashMap<String, NameEntry>>,
}

impl NameRegistry {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Acquire `name` for connection `id`. Returns the resulting status plus
    /// the notifications the change owes to other connections.
    pub(crate) fn acquire(
        &self,
        id: u64,
        name: &str,
        flags: NameFlags,
    ) -> Result<(NameStatus, Vec<NameEvent>), BusError> {
        validate_ownable_name(name)?;
        let mut table = self.state.lock().expect("poisoned name registry lock");
        let mut events = Vec::new();
        let Some(entry) = table.get_mut(name) else {
            table.insert(
                name.to_owned(),
                NameEntry {
                    owner: NameOwner { id, flags },
                    queue: VecDeque::new(),
                },
            );
            return Ok((NameStatus::Acquired, events));
        };
        if entry.owner.id == id {
            entry.owner.flags = flags;
            return Ok((NameStatus::AlreadyOwner, events));
        }
        let replaceable = entry.owner.flags.contains(NameFlags::ALLOW_REPLACEMENT);
        if flags.contains(NameFlags::REPLACE_EXISTING) && replaceable {
            // The booted owner waits at the head of the queue.
            let booted = entry.owner;
            entry.owner = NameOwner { id, flags };
            entry.queue.push_front(booted);
            events.push(NameEvent {
                target_id: booted.id,
                record: Record::NameLost(name.to_owned()),
            });
            events.push(NameEvent {
                target_id: id,
                record: Record::NameAcquired(name.to_owned()),
            });
            return Ok((NameStatus::Acquired, events));
        }
        if flags.contains(NameFlags::QUEUE) {
            if let Some(waiting) = entry.queue.iter_mut().find(|waiting| waiting.id == id) {
                waiting.flags = flags;
            } else {
                entry.queue.push_back(NameOwner { id, flags });
            }
            return Ok((NameStatus::InQueue, events));
        }
        Err(BusError::NameTaken {
            name: name.to_owned(),
        })
    }

    /// Release `name` held or waited on by connection `id`.
    pub(crate) fn release(&self, id: u64, name: &str) -> Result<Vec<NameEvent>, BusError> {
        let mut table = self.state.lock().expect("poisoned name registry lock");
        let Some(entry) = table.get_mut(name) else {
            return Err(BusError::NameNotFound {
                name: name.to_owned(),
            });
        };
        if entry.owner.id != id {
            let before = entry.queue.len();
            entry.queue.retain(|waiting| waiting.id != id);
            if entry.queue.len() == before {
                return Err(BusError::NotNameOwner {
                    name: name.to_owned(),
                });
            }
            return Ok(Vec::new());
        }
        let mut events = vec![NameEvent {
            target_id: id,
            record: Record::NameLost(name.to_owned()),
        }];
        if let Some(promoted) = entry.queue.pop_front() {
            entry.owner = promoted;
            events.push(NameEvent {
                target_id: promoted.id,
                record: Record::NameAcquired(name.to_owned()),
            });
        } else {
            table.remove(name);
        }
        Ok(events)
    }

    /// Drop every ownership and queue membership of a disconnecting
    /// connection, promoting queue heads as primaries.
    pub(crate) fn release_all(&self, id: u64) -> Vec<NameEvent> {
        let mut table = self.state.lock().expect("poisoned name registry lock");
        let mut events = Vec::new();
        table.retain(|name, entry| {
            entry.queue.retain(|waiting| waiting.id != id);
            if entry.owner.id != id {
                return true;
            }
            if let Some(promoted) = entry.queue.pop_front() {
                entry.owner = promoted;
                events.push(NameEvent {
                    target_id: promoted.id,
                    record: Record::NameAcquired(name.clone()),
                });
                true
            } else {
                false
            }
        });
        events
    }

    /// Resolve a name to its primary owner: an exact entry first, then the
    /// wildcard pattern covering the name with its last label ignored.
    pub(crate) fn lookup(&self, name: &str) -> Option<u64> {
        let table = self.state.lock().expect("poisoned name registry lock");
        if let Some(entry) = table.get(name) {
            return Some(entry.owner.id);
        }
        table
            .iter()
            .find(|(pattern, _)| wildcard_matches(pattern, name))
            .map(|(_, entry)| entry.owner.id)
    }

    /// Return the names currently owned by connection `id`.
    pub(crate) fn names_of(&self, id: u64) -> Vec<String> {
        let table = self.state.lock().expect("poisoned name registry lock");
        let mut names: Vec<String> = table
            .iter()
            .filter(|(_, entry)| entry.owner.id == id)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Snapshot the registry for NAME_LIST.
    pub(crate) fn list(&self, filter: &NameListFilter) -> Vec<NameListEntry> {
        let table = self.state.lock().expect("poisoned name registry lock");
        let mut entries: Vec<NameListEntry> = table
            .iter()
            .filter(|(name, _)| match filter {
                NameListFilter::All => true,
                NameListFilter::Prefix(prefix) => name.starts_with(prefix.as_str()),
            })
            .map(|(name, entry)| NameListEntry {
                name: name.clone(),
                owner_id: entry.owner.id,
                allows_replacement: entry.owner.flags.contains(NameFlags::ALLOW_REPLACEMENT),
                queued: entry.queue.len(),
            })
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries
    }
}

/// Match a stored wildcard pattern (`prefix.*`) against a concrete name by
/// ignoring the name's last label.
pub(crate) fn wildcard_matches(pattern: &str, name: &str) -> bool {
    let Some(prefix) = pattern.strip_suffix(".*") else {
        return false;
    };
    match name.rsplit_once('.') {
        Some((head, _last)) => head == prefix,
        None => false,
    }
}

/// Validate a concrete reverse-DNS name: at least two labels, label chars
/// `[A-Za-z0-9_-]`, bounded length.
pub(crate) fn validate_name(name: &str) -> Result<(), BusError> {
    let invalid = || BusError::NameInvalid {
        name: name.to_owned(),
    };
    if name.len() > NAME_MAX_BYTES || name.is_empty() {
        return Err(invalid());
    }
    let labels: Vec<&str> = name.split('.').collect();
    if labels.len() < 2 {
        return Err(invalid());
    }
    for label in labels {
        if label.is_empty()
            || !label
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
        {
            return Err(invalid());
        }
    }
    Ok(())
}

/// Validate a name a connection may own: a concrete name, or a wildcard
/// pattern whose final label is `*`.
pub(crate) fn validate_ownable_name(name: &str) -> Result<(), BusError> {
    match name.strip_suffix(".*") {
        Some(prefix) if !prefix.contains('*') => validate_name(&format!("{prefix}.x"))
            .map_err(|_| BusError::NameInvalid {
                name: name.to_owned(),
            }),
        Some(_) => Err(BusError::NameInvalid {
            name: name.to_owned(),
        }),
        None => validate_name(name),
    }
}
