// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Per-connection receive pool arena written by the router.
// Author: Lukas Bower

use std::collections::BTreeMap;
use std::sync::Mutex;

use waggle_wire::align8;

use crate::BusError;

/// Per-connection arena the router writes framed deliveries into. The
/// receiver reads at delivered offsets and releases slices with `free`;
/// senders observe `POOL_FULL` instead of blocking when no gap fits.
pub(crate) struct Pool {
    state: Mutex<PoolState>,
}

struct PoolState {
    buf: Vec<u8>,
    slices: BTreeMap<u64, PoolSlice>,
}

struct PoolSlice {
    reserved: u64,
    committed: u64,
}

impl Pool {
    pub(crate) fn new(capacity: u64) -> Self {
        Self {
            state: Mutex::new(PoolState {
                buf: vec![0; capacity as usize],
                slices: BTreeMap::new(),
            }),
        }
    }

    /// Reserve `needed` bytes, rounded up to 8, in the first gap that fits.
    /// Reservations without intervening frees advance monotonically; frees
    /// open gaps that later reservations reclaim.
    pub(crate) fn reserve(&self, needed: u64) -> Result<u64, BusError> {
        let aligned = align8(needed.max(1));
        let mut state = self.state.lock().expect("poisoned pool lock");
        let capacity = state.buf.len() as u64;
        let offset = first_fit(&state.slices, capacity, aligned).ok_or(BusError::PoolFull {
            needed: aligned,
            capacity,
        })?;
        state.slices.insert(
            offset,
            PoolSlice {
                reserved: aligned,
                committed: 0,
            },
        );
        Ok(offset)
    }

    /// Copy a delivered frame into a reserved slice and publish its length.
    pub(crate) fn commit(&self, offset: u64, bytes: &[u8]) {
        let mut state = self.state.lock().expect("poisoned pool lock");
        let slice = state
            .slices
            .get_mut(&offset)
            .expect("commit of unreserved pool offset");
        assert!(
            bytes.len() as u64 <= slice.reserved,
            "commit exceeds reservation"
        );
        slice.committed = bytes.len() as u64;
        let start = offset as usize;
        state.buf[start..start + bytes.len()].copy_from_slice(bytes);
    }

    /// Drop a reservation that will not be committed.
    pub(crate) fn cancel(&self, offset: u64) {
        let mut state = self.state.lock().expect("poisoned pool lock");
        state.slices.remove(&offset);
    }

    /// Release a consumed slice back to the arena.
    pub(crate) fn free(&self, offset: u64) -> Result<(), BusError> {
        let mut state = self.state.lock().expect("poisoned pool lock");
        state
            .slices
            .remove(&offset)
            .map(|_| ())
            .ok_or(BusError::UnknownOffset { offset })
    }

    /// Run `f` over the committed bytes at `offset`.
    pub(crate) fn with_slice<R>(
        &self,
        offset: u64,
        f: impl FnOnce(&[u8]) -> R,
    ) -> Option<R> {
        let state = self.state.lock().expect("poisoned pool lock");
        let slice = state.slices.get(&offset)?;
        if slice.committed == 0 {
            return None;
        }
        let start = offset as usize;
        Some(f(&state.buf[start..start + slice.committed as usize]))
    }

    /// Return whether a reservation of `needed` bytes would currently fit.
    pub(crate) fn has_room(&self, needed: u64) -> bool {
        let aligned = align8(needed.max(1));
        let state = self.state.lock().expect("poisoned pool lock");
        first_fit(&state.slices, state.buf.len() as u64, aligned).is_some()
    }
}

fn first_fit(slices: &BTreeMap<u64, PoolSlice>, capacity: u64, needed: u64) -> Option<u64> {
    let mut cursor = 0;
    for (offset, slice) in slices {
        if offset - cursor >= needed {
            return Some(cursor);
        }
        cursor = offset + slice.reserved;
    }
    if capacity - cursor >= needed {
        Some(cursor)
    } else {
        None
    }
}
