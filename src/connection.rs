// Copyright (c) Contributors to the tpm2-abrm project.
// Licensed under the MIT License.

//! Live client connections and the table indexing them. Unlike the Session
//! List, the table is reached from the Command Source, the Resource
//! Manager, and the IPC front-end threads, so it is guarded by a single
//! mutex.

use std::collections::HashMap;
use std::os::unix::net::UnixStream;
use std::os::unix::io::AsRawFd;
use std::os::unix::io::RawFd;

use parking_lot::Mutex;

use crate::handle_map::TransientHandleMap;

/// Default connection table capacity.
pub const MAX_CONNECTIONS_DEFAULT: usize = 27;
/// Hard ceiling on connection table capacity.
pub const MAX_CONNECTIONS_MAX: usize = 100;

/// One client. `id` is the value handed back from `CreateConnection`; the
/// front-end recognises ownership by `id ^ pid` rather than `id` alone, to
/// defend against a different process guessing a live id.
pub struct Connection {
    id: u64,
    owner_pid: u32,
    stream: Mutex<UnixStream>,
    handle_map: Mutex<TransientHandleMap>,
}

impl Connection {
    pub fn new(id: u64, owner_pid: u32, stream: UnixStream, handle_map: TransientHandleMap) -> Self {
        Self {
            id,
            owner_pid,
            stream: Mutex::new(stream),
            handle_map: Mutex::new(handle_map),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// The value a client must present to prove ownership of this
    /// connection to `Cancel`/`SetLocality`.
    pub fn ownership_token(&self) -> u64 {
        self.id ^ self.owner_pid as u64
    }

    pub fn raw_fd(&self) -> RawFd {
        self.stream.lock().as_raw_fd()
    }

    pub fn try_clone_stream(&self) -> std::io::Result<UnixStream> {
        self.stream.lock().try_clone()
    }

    pub fn handle_map(&self) -> &Mutex<TransientHandleMap> {
        &self.handle_map
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionTableError {
    #[error("connection table is full")]
    Full,
}

/// Bounded `id -> Connection` and `fd -> Connection` index, shared between
/// the Command Source, Resource Manager, and IPC front-end threads.
#[derive(Default)]
pub struct ConnectionTable {
    inner: Mutex<ConnectionTableInner>,
}

#[derive(Default)]
struct ConnectionTableInner {
    by_id: HashMap<u64, std::sync::Arc<Connection>>,
    by_fd: HashMap<RawFd, std::sync::Arc<Connection>>,
    max_connections: usize,
}

impl ConnectionTable {
    pub fn new(max_connections: usize) -> Self {
        Self {
            inner: Mutex::new(ConnectionTableInner {
                by_id: HashMap::new(),
                by_fd: HashMap::new(),
                max_connections: max_connections.min(MAX_CONNECTIONS_MAX),
            }),
        }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(MAX_CONNECTIONS_DEFAULT)
    }

    pub fn insert(
        &self,
        connection: std::sync::Arc<Connection>,
    ) -> Result<(), ConnectionTableError> {
        let mut inner = self.inner.lock();
        if inner.by_id.len() >= inner.max_connections {
            return Err(ConnectionTableError::Full);
        }
        inner.by_fd.insert(connection.raw_fd(), connection.clone());
        inner.by_id.insert(connection.id(), connection);
        Ok(())
    }

    pub fn remove_by_id(&self, id: u64) -> Option<std::sync::Arc<Connection>> {
        let mut inner = self.inner.lock();
        let connection = inner.by_id.remove(&id)?;
        inner.by_fd.remove(&connection.raw_fd());
        Some(connection)
    }

    pub fn remove_by_fd(&self, fd: RawFd) -> Option<std::sync::Arc<Connection>> {
        let mut inner = self.inner.lock();
        let connection = inner.by_fd.remove(&fd)?;
        inner.by_id.remove(&connection.id());
        Some(connection)
    }

    pub fn get_by_id(&self, id: u64) -> Option<std::sync::Arc<Connection>> {
        self.inner.lock().by_id.get(&id).cloned()
    }

    pub fn get_by_fd(&self, fd: RawFd) -> Option<std::sync::Arc<Connection>> {
        self.inner.lock().by_fd.get(&fd).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().by_id.is_empty()
    }
}
