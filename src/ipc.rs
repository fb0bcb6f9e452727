// Copyright (c) Contributors to the tpm2-abrm project.
// Licensed under the MIT License.

//! The IPC front-end boundary. Production deployments expose this over
//! D-Bus or another system bus; this crate ships only a loopback backend
//! suited to local process use and integration tests, behind the same
//! trait a production backend would implement.

use std::os::unix::net::UnixStream;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::connection::Connection;
use crate::connection::ConnectionTable;
use crate::error::IpcError;
use crate::handle_map::TransientHandleMap;

/// A freshly accepted client: the end of the socket pair retained by the
/// broker, the end handed to the client, and the connection id.
pub struct Accepted {
    pub connection: Arc<Connection>,
    pub client_stream: UnixStream,
}

/// The IPC front-end contract: accept new clients and answer the two
/// out-of-band control methods every connection is entitled to call.
pub trait IpcFrontend: Send + Sync {
    /// Create a new connection, returning the broker's end plus the
    /// socket-pair peer handed to the client, with a fresh 64-bit id.
    fn create_connection(&self, owner_pid: u32) -> Result<Accepted, IpcError>;

    /// `Cancel(id)`. The original daemon's implementation returns
    /// "not implemented"; this preserves that behaviour, but still
    /// enforces that `token == id ^ pid` before answering.
    fn cancel(&self, id: u64, token: u64) -> Result<(), IpcError>;

    /// `SetLocality(id, locality)`, same ownership contract as `cancel`.
    fn set_locality(&self, id: u64, token: u64, locality: u8) -> Result<(), IpcError>;
}

/// Local-process IPC backend: `create_connection` allocates an OS
/// socket-pair directly rather than brokering one over a bus. Suited to
/// tests and single-host multi-process use.
pub struct LoopbackIpcFrontend {
    table: Arc<ConnectionTable>,
    next_id: AtomicU64,
    max_transients_per_conn: usize,
}

impl LoopbackIpcFrontend {
    pub fn new(table: Arc<ConnectionTable>, max_transients_per_conn: usize, seed: u64) -> Self {
        Self {
            table,
            next_id: AtomicU64::new(seed | 1),
            max_transients_per_conn,
        }
    }

    fn fresh_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn check_ownership(&self, id: u64, token: u64) -> Result<(), IpcError> {
        let conn = self.table.get_by_id(id).ok_or(IpcError::NotOwner)?;
        if conn.ownership_token() != token {
            return Err(IpcError::NotOwner);
        }
        Ok(())
    }
}

impl IpcFrontend for LoopbackIpcFrontend {
    fn create_connection(&self, owner_pid: u32) -> Result<Accepted, IpcError> {
        let (broker_end, client_end) =
            UnixStream::pair().map_err(|_| IpcError::ConnectionTableFull)?;
        let id = self.fresh_id();
        let handle_map = TransientHandleMap::new(self.max_transients_per_conn);
        let connection = Arc::new(Connection::new(id, owner_pid, broker_end, handle_map));
        self.table
            .insert(connection.clone())
            .map_err(|_| IpcError::ConnectionTableFull)?;
        Ok(Accepted {
            connection,
            client_stream: client_end,
        })
    }

    fn cancel(&self, id: u64, token: u64) -> Result<(), IpcError> {
        self.check_ownership(id, token)?;
        Err(IpcError::NotImplemented)
    }

    fn set_locality(&self, id: u64, token: u64, _locality: u8) -> Result<(), IpcError> {
        self.check_ownership(id, token)?;
        Err(IpcError::NotImplemented)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_connection_is_indexed_and_owner_token_matches() {
        let table = Arc::new(ConnectionTable::with_default_capacity());
        let fe = LoopbackIpcFrontend::new(table.clone(), 27, 1);
        let accepted = fe.create_connection(12345).unwrap();
        let conn = table.get_by_id(accepted.connection.id()).unwrap();
        assert_eq!(conn.ownership_token(), accepted.connection.id() ^ 12345);
    }

    #[test]
    fn cancel_validates_ownership_before_reporting_not_implemented() {
        let table = Arc::new(ConnectionTable::with_default_capacity());
        let fe = LoopbackIpcFrontend::new(table, 27, 1);
        let accepted = fe.create_connection(100).unwrap();
        let id = accepted.connection.id();
        assert_eq!(fe.cancel(id, id ^ 999), Err(IpcError::NotOwner));
        assert_eq!(fe.cancel(id, id ^ 100), Err(IpcError::NotImplemented));
    }

    #[test]
    fn create_connection_fails_when_table_full() {
        let table = Arc::new(ConnectionTable::new(1));
        let fe = LoopbackIpcFrontend::new(table, 27, 1);
        fe.create_connection(1).unwrap();
        assert_eq!(
            fe.create_connection(2).unwrap_err(),
            IpcError::ConnectionTableFull
        );
    }
}
