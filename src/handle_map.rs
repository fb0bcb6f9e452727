// Copyright (c) Contributors to the tpm2-abrm project.
// Licensed under the MIT License.

//! Per-connection virtual↔physical transient-handle translation. A counter
//! seeded at `0xff` within the transient range, combined with the
//! handle-type byte, is used on every allocation; issued handles are
//! never recycled.

use std::collections::HashMap;

use crate::proto::constants::HR_RANGE_MASK;
use crate::proto::constants::HT_TRANSIENT;
use crate::proto::constants::HR_SHIFT;
use crate::proto::constants::TRANSIENT_COUNTER_START;

/// Default per-connection transient object capacity.
pub const MAX_ENTRIES_DEFAULT: usize = 27;
/// Hard ceiling on per-connection transient object capacity.
pub const MAX_ENTRIES_MAX: usize = 100;

/// One tracked transient object: the broker-issued virtual handle, the
/// handle the TPM currently has it loaded under (`0` if saved), and the
/// opaque context blob used to re-materialise it.
#[derive(Debug, Clone)]
pub struct HandleMapEntry {
    virtual_handle: u32,
    physical_handle: u32,
    context_blob: Vec<u8>,
}

impl HandleMapEntry {
    fn new(virtual_handle: u32, physical_handle: u32, context_blob: Vec<u8>) -> Self {
        Self {
            virtual_handle,
            physical_handle,
            context_blob,
        }
    }

    pub fn virtual_handle(&self) -> u32 {
        self.virtual_handle
    }

    pub fn physical_handle(&self) -> u32 {
        self.physical_handle
    }

    pub fn set_physical_handle(&mut self, handle: u32) {
        self.physical_handle = handle;
    }

    /// Clear the physical handle, marking the object as saved/not
    /// resident. Used after a successful `ContextSave` + `FlushContext`.
    pub fn clear_physical_handle(&mut self) {
        self.physical_handle = 0;
    }

    pub fn context_blob(&self) -> &[u8] {
        &self.context_blob
    }

    pub fn set_context_blob(&mut self, blob: Vec<u8>) {
        self.context_blob = blob;
    }

    /// True if the TPM currently has this object resident.
    pub fn is_loaded(&self) -> bool {
        self.physical_handle != 0
    }
}

/// A mapping from virtual transient handle to [`HandleMapEntry`], owned
/// exclusively by one [`crate::connection::Connection`].
#[derive(Debug)]
pub struct TransientHandleMap {
    entries: HashMap<u32, HandleMapEntry>,
    next_counter: u32,
    max_entries: usize,
    exhausted: bool,
}

impl TransientHandleMap {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: HashMap::new(),
            next_counter: TRANSIENT_COUNTER_START,
            max_entries: max_entries.min(MAX_ENTRIES_MAX),
            exhausted: false,
        }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(MAX_ENTRIES_DEFAULT)
    }

    /// Number of entries currently tracked.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True if inserting another entry would exceed this map's capacity.
    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.max_entries
    }

    /// Allocate the next virtual handle without inserting an entry for it.
    /// Returns `None` once the 24-bit transient counter range is
    /// exhausted; the caller must treat this as fatal for the owning
    /// connection, since handles are never recycled.
    fn next_vhandle(&mut self) -> Option<u32> {
        if self.exhausted {
            return None;
        }
        if self.next_counter & HR_RANGE_MASK != 0 {
            self.exhausted = true;
            return None;
        }
        let handle = ((HT_TRANSIENT as u32) << HR_SHIFT) | self.next_counter;
        self.next_counter = self.next_counter.wrapping_add(1);
        Some(handle)
    }

    /// Allocate a virtual handle for a freshly loaded object and insert
    /// its entry. Fails if the map is full or the handle space is
    /// exhausted.
    pub fn insert_new(
        &mut self,
        physical_handle: u32,
        context_blob: Vec<u8>,
    ) -> Result<u32, HandleMapError> {
        if self.is_full() {
            return Err(HandleMapError::Full);
        }
        let vhandle = self.next_vhandle().ok_or(HandleMapError::CounterExhausted)?;
        self.entries.insert(
            vhandle,
            HandleMapEntry::new(vhandle, physical_handle, context_blob),
        );
        Ok(vhandle)
    }

    pub fn get(&self, vhandle: u32) -> Option<&HandleMapEntry> {
        self.entries.get(&vhandle)
    }

    pub fn get_mut(&mut self, vhandle: u32) -> Option<&mut HandleMapEntry> {
        self.entries.get_mut(&vhandle)
    }

    /// Remove the tracked entry. The caller is responsible for having
    /// already flushed its physical side from the TPM, if any.
    pub fn remove(&mut self, vhandle: u32) -> Option<HandleMapEntry> {
        self.entries.remove(&vhandle)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&u32, &HandleMapEntry)> {
        self.entries.iter()
    }

    /// Virtual handles in ascending order, for `GetCapability(TPM_HANDLES)`.
    pub fn sorted_handles(&self) -> Vec<u32> {
        let mut handles: Vec<u32> = self.entries.keys().copied().collect();
        handles.sort_unstable();
        handles
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum HandleMapError {
    #[error("transient handle map is at capacity")]
    Full,
    #[error("transient handle counter exhausted")]
    CounterExhausted,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_handle_matches_spec() {
        let mut map = TransientHandleMap::with_default_capacity();
        let h = map.insert_new(0x8000_0000, vec![]).unwrap();
        assert_eq!(h, 0x8000_00ff);
    }

    #[test]
    fn handles_increase_monotonically_and_are_not_recycled() {
        let mut map = TransientHandleMap::with_default_capacity();
        let a = map.insert_new(1, vec![]).unwrap();
        let b = map.insert_new(2, vec![]).unwrap();
        assert!(b > a);
        map.remove(a);
        let c = map.insert_new(3, vec![]).unwrap();
        assert!(c > b, "removed handles must not be reused");
    }

    #[test]
    fn fullness_is_reported_before_counter_exhaustion() {
        let mut map = TransientHandleMap::new(2);
        map.insert_new(1, vec![]).unwrap();
        map.insert_new(2, vec![]).unwrap();
        assert!(map.is_full());
        assert_eq!(map.insert_new(3, vec![]), Err(HandleMapError::Full));
    }

    #[test]
    fn capacity_is_clamped_to_max() {
        let map = TransientHandleMap::new(1_000_000);
        assert_eq!(map.max_entries, MAX_ENTRIES_MAX);
    }

    #[test]
    fn counter_exhaustion_is_detected() {
        let mut map = TransientHandleMap::new(MAX_ENTRIES_MAX);
        map.next_counter = !HR_RANGE_MASK; // last valid 24-bit counter value
        assert!(map.insert_new(1, vec![]).is_ok());
        assert_eq!(
            map.insert_new(2, vec![]),
            Err(HandleMapError::CounterExhausted)
        );
    }

    #[test]
    fn physical_handle_round_trips_through_save_flush() {
        let mut map = TransientHandleMap::with_default_capacity();
        let h = map.insert_new(0x8000_0000, vec![1, 2, 3]).unwrap();
        let entry = map.get_mut(h).unwrap();
        assert!(entry.is_loaded());
        entry.clear_physical_handle();
        assert!(!entry.is_loaded());
        entry.set_physical_handle(0x8000_0001);
        assert!(entry.is_loaded());
    }
}
