// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Sealed memory objects for zero-copy payload transfer.
// Author: Lukas Bower

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::BusError;

/// Largest accepted sealed-object size in bytes.
pub const MEMFD_MAX_BYTES: u64 = 256 << 20;

/// A memory object is either still writable or frozen for sharing. Sealed
/// bytes live behind an `Arc` so read-only mappings stay valid without a
/// lock; the swap under the state mutex is the seal's release barrier.
enum MemfdState {
    Mutable(Vec<u8>),
    Sealed(Arc<Vec<u8>>),
}

pub(crate) struct Memfd {
    id: u64,
    /// Live references: handles plus in-flight message attachments. Mapped
    /// views are tracked separately through the sealed `Arc`.
    refs: AtomicUsize,
    state: Mutex<MemfdState>,
}

impl Memfd {
    fn size(&self) -> u64 {
        match &*self.state.lock().expect("poisoned memfd lock") {
            MemfdState::Mutable(buf) => buf.len() as u64,
            MemfdState::Sealed(buf) => buf.len() as u64,
        }
    }

    pub(crate) fn is_sealed(&self) -> bool {
        matches!(
            &*self.state.lock().expect("poisoned memfd lock"),
            MemfdState::Sealed(_)
        )
    }
}

/// Owner handle to a memory object. Cloning duplicates the reference the
/// way duplicating a descriptor would; the object retires when the last
/// handle and the last in-flight reference drop.
pub struct MemfdHandle {
    inner: Arc<Memfd>,
}

impl std::fmt::Debug for MemfdHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemfdHandle")
            .field("id", &self.inner.id)
            .field("sealed", &self.inner.is_sealed())
            .finish()
    }
}

impl MemfdHandle {
    pub(crate) fn adopt(inner: Arc<Memfd>) -> Self {
        // The reference this handle represents was already counted.
        Self { inner }
    }

    pub(crate) fn attach(inner: &Arc<Memfd>) -> Self {
        inner.refs.fetch_add(1, Ordering::AcqRel);
        Self {
            inner: inner.clone(),
        }
    }

    pub(crate) fn shared(&self) -> &Arc<Memfd> {
        &self.inner
    }

    /// Return the subsystem-wide object id carried in MEMFD records.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Return the object size in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.inner.size()
    }

    /// Return whether the object is sealed.
    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.inner.is_sealed()
    }

    /// Write bytes at `offset`. Fails once the object is sealed.
    pub fn write(&self, offset: u64, bytes: &[u8]) -> Result<(), BusError> {
        let mut state = self.inner.state.lock().expect("poisoned memfd lock");
        match &mut *state {
            MemfdState::Mutable(buf) => {
                let end = offset
                    .checked_add(bytes.len() as u64)
                    .filter(|end| *end <= buf.len() as u64)
                    .ok_or(BusError::MemfdBounds {
                        offset,
                        length: bytes.len() as u64,
                        size: buf.len() as u64,
                    })?;
                buf[offset as usize..end as usize].copy_from_slice(bytes);
                Ok(())
            }
            MemfdState::Sealed(_) => Err(BusError::WriteOnSealed),
        }
    }

    /// Atomically freeze the object. Sealing an already sealed object is a
    /// no-op; any mapping obtained afterwards observes all prior writes.
    pub fn seal(&self) {
        let mut state = self.inner.state.lock().expect("poisoned memfd lock");
        if let MemfdState::Mutable(buf) = &mut *state {
            let frozen = Arc::new(std::mem::take(buf));
            *state = MemfdState::Sealed(frozen);
        }
    }

    /// Map the sealed bytes read-only. Fails while the object is mutable.
    pub fn map_readonly(&self) -> Result<MemfdView, BusError> {
        let state = self.inner.state.lock().expect("poisoned memfd lock");
        match &*state {
            MemfdState::Sealed(buf) => Ok(MemfdView { data: buf.clone() }),
            MemfdState::Mutable(_) => Err(BusError::MemfdNotSealed { id: self.inner.id }),
        }
    }

    /// Thaw the object for writing again. Succeeds only when this handle is
    /// the sole live reference and no read-only mapping is outstanding.
    pub fn unseal(&self) -> Result<(), BusError> {
        let refs = self.inner.refs.load(Ordering::Acquire);
        if refs != 1 {
            return Err(BusError::UnsealShared { refs });
        }
        let mut state = self.inner.state.lock().expect("poisoned memfd lock");
        let sealed = match &mut *state {
            MemfdState::Sealed(buf) => buf.clone(),
            MemfdState::Mutable(_) => return Ok(()),
        };
        // Two Arcs exist here: the state's and our probe. Anything beyond
        // that is an outstanding mapping.
        if Arc::strong_count(&sealed) > 2 {
            return Err(BusError::UnsealShared {
                refs: Arc::strong_count(&sealed) - 1,
            });
        }
        drop(sealed);
        let MemfdState::Sealed(buf) = std::mem::replace(&mut *state, MemfdState::Mutable(Vec::new()))
        else {
            unreachable!("state checked sealed above");
        };
        let bytes = Arc::try_unwrap(buf).unwrap_or_else(|shared| (*shared).clone());
        *state = MemfdState::Mutable(bytes);
        Ok(())
    }
}

impl Clone for MemfdHandle {
    fn clone(&self) -> Self {
        Self::attach(&self.inner)
    }
}

impl Drop for MemfdHandle {
    fn drop(&mut self) {
        self.inner.refs.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Read-only mapping of a sealed memory object.
#[derive(Debug, Clone)]
pub struct MemfdView {
    data: Arc<Vec<u8>>,
}

impl MemfdView {
    /// Borrow the sealed bytes.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Return the mapped length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Return whether the mapping is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Subsystem-wide table of live memory objects, keyed by the id carried in
/// MEMFD wire records. Entries are weak; the table never keeps an object
/// alive on its own.
pub(crate) struct MemfdRegistry {
    state: Mutex<MemfdTable>,
}

struct MemfdTable {
    id_next: u64,
    entries: HashMap<u64, Weak<Memfd>>,
}

impl MemfdRegistry {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(MemfdTable {
                id_next: 1,
                entries: HashMap::new(),
            }),
        }
    }

    pub(crate) fn create(&self, size: u64) -> Result<MemfdHandle, BusError> {
        if size == 0 || size > MEMFD_MAX_BYTES {
            return Err(BusError::InvalidMemfdSize { size });
        }
        let mut table = self.state.lock().expect("poisoned memfd registry lock");
        table.entries.retain(|_, entry| entry.strong_count() > 0);
        let id = table.id_next;
        table.id_next += 1;
        let memfd = Arc::new(Memfd {
            id,
            refs: AtomicUsize::new(1),
            state: Mutex::new(MemfdState::Mutable(vec![0; size as usize])),
        });
        table.entries.insert(id, Arc::downgrade(&memfd));
        Ok(MemfdHandle::adopt(memfd))
    }

    pub(crate) fn resolve(&self, id: u64) -> Option<Arc<Memfd>> {
        let table = self.state.lock().expect("poisoned memfd registry lock");
        table.entries.get(&id).and_then(Weak::upgrade)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_seal_then_map_round_trips() {
        let registry = MemfdRegistry::new();
        let memfd = registry.create(16).expect("create");
        memfd.write(0, b"zero copy bytes!").expect("write");
        memfd.seal();
        let view = memfd.map_readonly().expect("map");
        assert_eq!(view.as_slice(), b"zero copy bytes!");
    }

    #[test]
    fn sealed_object_rejects_writes() {
        let registry = MemfdRegistry::new();
        let memfd = registry.create(8).expect("create");
        memfd.seal();
        assert!(matches!(
            memfd.write(0, b"late"),
            Err(BusError::WriteOnSealed)
        ));
    }

    #[test]
    fn map_requires_seal() {
        let registry = MemfdRegistry::new();
        let memfd = registry.create(8).expect("create");
        assert!(matches!(
            memfd.map_readonly(),
            Err(BusError::MemfdNotSealed { .. })
        ));
    }

    #[test]
    fn seal_then_unseal_single_ref_is_identity() {
        let registry = MemfdRegistry::new();
        let memfd = registry.create(4).expect("create");
        memfd.write(0, b"abcd").expect("write");
        memfd.seal();
        memfd.unseal().expect("unseal");
        memfd.seal();
        let view = memfd.map_readonly().expect("map");
        assert_eq!(view.as_slice(), b"abcd");
    }

    #[test]
    fn unseal_fails_while_shared() {
        let registry = MemfdRegistry::new();
        let memfd = registry.create(4).expect("create");
        memfd.seal();
        let duplicate = memfd.clone();
        assert!(matches!(
            memfd.unseal(),
            Err(BusError::UnsealShared { refs: 2 })
        ));
        drop(duplicate);
        memfd.unseal().expect("sole reference unseals");
    }

    #[test]
    fn unseal_fails_while_mapped() {
        let registry = MemfdRegistry::new();
        let memfd = registry.create(4).expect("create");
        memfd.seal();
        let view = memfd.map_readonly().expect("map");
        assert!(matches!(memfd.unseal(), Err(BusError::UnsealShared { .. })));
        drop(view);
        memfd.unseal().expect("unseal after view drops");
    }

    #[test]
    fn registry_retires_dropped_objects() {
        let registry = MemfdRegistry::new();
        let id = {
            let memfd = registry.create(8).expect("create");
            memfd.id()
        };
        assert!(registry.resolve(id).is_none());
    }

    #[test]
    fn out_of_bounds_writes_are_rejected() {
        let registry = MemfdRegistry::new();
        let memfd = registry.create(8).expect("create");
        assert!(matches!(
            memfd.write(4, b"too long"),
            Err(BusError::MemfdBounds { .. })
        ));
    }
}
