// Copyright (c) Contributors to the tpm2-abrm project.
// Licensed under the MIT License.

//! Process-wide session table with the state machine and abandoned-session
//! queue. Accessed exclusively from the Resource Manager thread, so unlike
//! the Connection Table it carries no internal lock of its own.

use std::sync::Arc;

use parking_lot::Mutex;

/// Default per-connection session quota.
pub const MAX_SESSIONS_PER_CONN_DEFAULT: usize = 4;
/// Hard ceiling on per-connection session quota.
pub const MAX_SESSIONS_PER_CONN_MAX: usize = 64;
/// Default cap on the process-wide abandoned-session queue.
pub const MAX_ABANDONED_DEFAULT: usize = 4;
/// Hard ceiling on the abandoned-session queue.
pub const MAX_ABANDONED_MAX: usize = 4;

/// Lifecycle state of a [`SessionEntry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Resident in the TPM right now.
    Loaded,
    /// Saved by the Resource Manager; transparently reloadable.
    SavedRm,
    /// Saved at the client's explicit request; the client holds the blob.
    SavedClient,
    /// Owning client disconnected while `SavedClient`; abandoned, pending
    /// reclaim by any connection that presents the matching blob.
    SavedClientClosed,
}

/// One TPM authorisation/policy session tracked by the broker.
#[derive(Debug)]
pub struct SessionEntry {
    saved_handle: u32,
    connection_id: Option<u64>,
    state: SessionState,
    /// Last blob produced by a Resource-Manager-initiated `ContextSave`,
    /// ready for an immediate `ContextLoad`.
    context_rm: Vec<u8>,
    /// Blob last handed to the client as the result of a client-initiated
    /// `ContextSave`; returned verbatim if the client later reloads it.
    context_client: Vec<u8>,
}

impl SessionEntry {
    pub fn new(saved_handle: u32, connection_id: u64) -> Self {
        Self {
            saved_handle,
            connection_id: Some(connection_id),
            state: SessionState::Loaded,
            context_rm: Vec::new(),
            context_client: Vec::new(),
        }
    }

    pub fn saved_handle(&self) -> u32 {
        self.saved_handle
    }

    pub fn connection_id(&self) -> Option<u64> {
        self.connection_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn set_state(&mut self, state: SessionState) {
        self.state = state;
    }

    pub fn context_rm(&self) -> &[u8] {
        &self.context_rm
    }

    pub fn set_context_rm(&mut self, blob: Vec<u8>) {
        self.context_rm = blob;
    }

    pub fn context_client(&self) -> &[u8] {
        &self.context_client
    }

    pub fn set_context_client(&mut self, blob: Vec<u8>) {
        self.context_client = blob;
    }

    pub fn is_owned_by(&self, connection_id: u64) -> bool {
        self.connection_id == Some(connection_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SessionListError {
    #[error("connection has exceeded its session limit")]
    Full,
    #[error("no session tracked for handle {0:#010x}")]
    NotFound(u32),
    #[error("session {0:#010x} is not owned by the requesting connection")]
    NotOwner(u32),
    #[error("session {0:#010x} is not eligible for claim in its current state")]
    NotClaimable(u32),
}

/// Process-wide table of live sessions plus the FIFO abandoned queue.
///
/// Entries are held behind `Arc<Mutex<_>>` so the abandoned queue and the
/// main list can share the same entry without duplicating state.
#[derive(Debug, Default)]
pub struct SessionList {
    entries: Vec<Arc<Mutex<SessionEntry>>>,
    abandoned: std::collections::VecDeque<Arc<Mutex<SessionEntry>>>,
    max_per_connection: usize,
    max_abandoned: usize,
}

impl SessionList {
    pub fn new(max_per_connection: usize, max_abandoned: usize) -> Self {
        Self {
            entries: Vec::new(),
            abandoned: std::collections::VecDeque::new(),
            max_per_connection: max_per_connection.min(MAX_SESSIONS_PER_CONN_MAX),
            max_abandoned: max_abandoned.min(MAX_ABANDONED_MAX),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(MAX_SESSIONS_PER_CONN_DEFAULT, MAX_ABANDONED_DEFAULT)
    }

    fn count_for_connection(&self, connection_id: u64) -> usize {
        self.entries
            .iter()
            .filter(|e| e.lock().is_owned_by(connection_id))
            .count()
    }

    pub fn insert(&mut self, entry: SessionEntry) -> Result<Arc<Mutex<SessionEntry>>, SessionListError> {
        let connection_id = entry.connection_id;
        if let Some(id) = connection_id {
            if self.count_for_connection(id) >= self.max_per_connection {
                return Err(SessionListError::Full);
            }
        }
        let shared = Arc::new(Mutex::new(entry));
        self.entries.push(shared.clone());
        Ok(shared)
    }

    pub fn remove_by_handle(&mut self, handle: u32) -> Option<Arc<Mutex<SessionEntry>>> {
        let idx = self
            .entries
            .iter()
            .position(|e| e.lock().saved_handle == handle)?;
        Some(self.entries.remove(idx))
    }

    pub fn lookup_by_handle(&self, handle: u32) -> Option<Arc<Mutex<SessionEntry>>> {
        self.entries
            .iter()
            .find(|e| e.lock().saved_handle == handle)
            .cloned()
    }

    /// Find a session (main list or abandoned queue) whose `context_client`
    /// blob byte-for-byte matches `blob`, the only way this broker
    /// recognises an opaque client-held context.
    pub fn lookup_by_client_context(&self, blob: &[u8]) -> Option<Arc<Mutex<SessionEntry>>> {
        self.entries
            .iter()
            .chain(self.abandoned.iter())
            .find(|e| e.lock().context_client == blob)
            .cloned()
    }

    pub fn for_each(&self, mut cb: impl FnMut(&Arc<Mutex<SessionEntry>>)) {
        for e in &self.entries {
            cb(e);
        }
    }

    pub fn entries_owned_by(&self, connection_id: u64) -> Vec<Arc<Mutex<SessionEntry>>> {
        self.entries
            .iter()
            .filter(|e| e.lock().is_owned_by(connection_id))
            .cloned()
            .collect()
    }

    /// Orphan a session owned by `connection_id`: clear its owner, mark
    /// `SavedClientClosed`, and move it to the head of the abandoned queue.
    pub fn abandon(&mut self, connection_id: u64, handle: u32) -> Result<(), SessionListError> {
        let idx = self
            .entries
            .iter()
            .position(|e| e.lock().saved_handle == handle)
            .ok_or(SessionListError::NotFound(handle))?;
        {
            let entry = self.entries[idx].lock();
            if !entry.is_owned_by(connection_id) {
                return Err(SessionListError::NotOwner(handle));
            }
        }
        let shared = self.entries.remove(idx);
        {
            let mut entry = shared.lock();
            entry.connection_id = None;
            entry.state = SessionState::SavedClientClosed;
        }
        self.abandoned.push_front(shared);
        Ok(())
    }

    /// Adopt a session for `connection_id`. Succeeds either when the
    /// session is in the abandoned queue, or when it is in the main list
    /// in state `SavedClient`.
    pub fn claim(
        &mut self,
        handle: u32,
        connection_id: u64,
    ) -> Result<Arc<Mutex<SessionEntry>>, SessionListError> {
        if let Some(pos) = self
            .abandoned
            .iter()
            .position(|e| e.lock().saved_handle == handle)
        {
            let shared = self.abandoned.remove(pos).unwrap();
            {
                let mut entry = shared.lock();
                entry.state = SessionState::Loaded;
                entry.connection_id = Some(connection_id);
            }
            self.entries.push(shared.clone());
            return Ok(shared);
        }
        let shared = self
            .entries
            .iter()
            .find(|e| e.lock().saved_handle == handle)
            .cloned()
            .ok_or(SessionListError::NotFound(handle))?;
        {
            let mut entry = shared.lock();
            if entry.state != SessionState::SavedClient {
                return Err(SessionListError::NotClaimable(handle));
            }
            entry.state = SessionState::Loaded;
            entry.connection_id = Some(connection_id);
        }
        Ok(shared)
    }

    /// While the abandoned queue exceeds capacity, evict the oldest entry
    /// (the tail), invoking `flush_cb` so the caller can flush it from the
    /// TPM before it is dropped.
    pub fn prune_abandoned(&mut self, mut flush_cb: impl FnMut(u32)) {
        while self.abandoned.len() > self.max_abandoned {
            if let Some(evicted) = self.abandoned.pop_back() {
                flush_cb(evicted.lock().saved_handle);
            }
        }
    }

    pub fn abandoned_len(&self) -> usize {
        self.abandoned.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_connection_quota_is_enforced() {
        let mut list = SessionList::new(1, MAX_ABANDONED_DEFAULT);
        list.insert(SessionEntry::new(0x0200_0000, 1)).unwrap();
        assert_eq!(
            list.insert(SessionEntry::new(0x0200_0001, 1)),
            Err(SessionListError::Full)
        );
    }

    #[test]
    fn abandon_then_claim_by_different_connection() {
        let mut list = SessionList::with_defaults();
        let entry = list.insert(SessionEntry::new(0x0200_0000, 1)).unwrap();
        entry.lock().set_context_client(vec![0xaa, 0xbb]);
        entry.lock().set_state(SessionState::SavedClient);
        list.abandon(1, 0x0200_0000).unwrap();
        assert_eq!(list.abandoned_len(), 1);
        assert!(list.lookup_by_handle(0x0200_0000).is_none());

        let claimed = list.claim(0x0200_0000, 2).unwrap();
        assert_eq!(claimed.lock().connection_id(), Some(2));
        assert_eq!(claimed.lock().state(), SessionState::Loaded);
        assert_eq!(list.abandoned_len(), 0);
    }

    #[test]
    fn abandon_rejects_non_owner() {
        let mut list = SessionList::with_defaults();
        list.insert(SessionEntry::new(0x0200_0000, 1)).unwrap();
        assert_eq!(
            list.abandon(2, 0x0200_0000),
            Err(SessionListError::NotOwner(0x0200_0000))
        );
    }

    #[test]
    fn claim_of_saved_client_in_main_list_succeeds() {
        let mut list = SessionList::with_defaults();
        let entry = list.insert(SessionEntry::new(0x0200_0000, 1)).unwrap();
        entry.lock().set_state(SessionState::SavedClient);
        entry.lock().connection_id = None;
        let claimed = list.claim(0x0200_0000, 1).unwrap();
        assert_eq!(claimed.lock().state(), SessionState::Loaded);
    }

    #[test]
    fn prune_abandoned_evicts_oldest_beyond_cap() {
        let mut list = SessionList::new(MAX_SESSIONS_PER_CONN_DEFAULT, 1);
        for (i, handle) in [0x0200_0000u32, 0x0200_0001, 0x0200_0002]
            .into_iter()
            .enumerate()
        {
            list.insert(SessionEntry::new(handle, i as u64)).unwrap();
            list.abandon(i as u64, handle).unwrap();
        }
        let mut flushed = Vec::new();
        list.prune_abandoned(|h| flushed.push(h));
        // The two oldest abandoned sessions are evicted, leaving the cap.
        assert_eq!(flushed, vec![0x0200_0000, 0x0200_0001]);
        assert_eq!(list.abandoned_len(), 1);
    }
}
