// Copyright (c) Contributors to the tpm2-abrm project.
// Licensed under the MIT License.

//! Scaffolding shared by the scenario tests: a `Harness` wiring a
//! [`ResourceManager`] against an in-memory [`SimulatorTcti`] and plain
//! connections, bypassing the Command Source / Response Sink threads so
//! tests can drive and observe one command at a time.

use std::sync::mpsc;
use std::sync::mpsc::Receiver;
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use crate::access_gate::TpmAccessGate;
use crate::command::CommandAttributes;
use crate::command::Tpm2Command;
use crate::connection::Connection;
use crate::connection::ConnectionTable;
use crate::handle_map::TransientHandleMap;
use crate::pipeline::message::InboundMessage;
use crate::pipeline::message::OutboundMessage;
use crate::pipeline::resource_manager::ResourceManager;
use crate::proto::CommandCode;
use crate::proto::Header;
use crate::session::SessionList;
use crate::tcti::sim::SimulatorHandle;
use crate::tcti::sim::SimulatorTcti;

pub const ONE_HANDLE_IN_ONE_OUT: fn() -> CommandAttributes =
    || CommandAttributes::new().with_c_handles(1).with_r_handle(true);
pub const ONE_HANDLE_IN: fn() -> CommandAttributes =
    || CommandAttributes::new().with_c_handles(1);
pub const NO_HANDLES: fn() -> CommandAttributes = CommandAttributes::new;

pub struct Harness {
    pub connections: Arc<ConnectionTable>,
    pub rm: ResourceManager<Sender<OutboundMessage>>,
    pub responses: Receiver<OutboundMessage>,
    pub sim: SimulatorHandle,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_max_sessions(crate::session::MAX_SESSIONS_PER_CONN_DEFAULT)
    }

    pub fn with_max_sessions(max_sessions_per_conn: usize) -> Self {
        let connections = Arc::new(ConnectionTable::with_default_capacity());
        let sessions = SessionList::new(max_sessions_per_conn, crate::session::MAX_ABANDONED_DEFAULT);
        let sim_tcti = SimulatorTcti::new();
        let sim = sim_tcti.handle();
        let tcti: Box<dyn crate::tcti::Tcti> = Box::new(sim_tcti);
        let access_gate = Arc::new(TpmAccessGate::new(tcti, Duration::from_secs(1)).unwrap());
        let (_command_tx, command_rx) = mpsc::channel::<InboundMessage>();
        let (response_tx, response_rx) = mpsc::channel::<OutboundMessage>();
        let rm = ResourceManager::new(
            connections.clone(),
            sessions,
            access_gate,
            command_rx,
            response_tx,
            max_sessions_per_conn,
            Arc::new(AtomicBool::new(false)),
        );
        Self {
            connections,
            rm,
            responses: response_rx,
            sim,
        }
    }

    /// Register a new connection with the given max-transients quota and
    /// return its id.
    pub fn new_connection(&self, id: u64, max_transients: usize) -> u64 {
        let (broker_end, _client_end) = std::os::unix::net::UnixStream::pair().unwrap();
        let conn = Arc::new(Connection::new(
            id,
            std::process::id(),
            broker_end,
            TransientHandleMap::new(max_transients),
        ));
        self.connections.insert(conn).unwrap();
        id
    }

    /// Submit one command and return the response the Resource Manager
    /// would have forwarded to the Response Sink.
    pub fn submit(&mut self, cmd: Tpm2Command) -> OutboundMessage {
        self.rm.handle_message(InboundMessage::Command(cmd));
        self.responses.recv().expect("resource manager produced no response")
    }

    pub fn remove_connection(&mut self, connection_id: u64) {
        self.connections.remove_by_id(connection_id);
        self.rm
            .handle_message(InboundMessage::ConnectionRemoved(connection_id));
    }
}

fn bare_command(connection_id: u64, code: CommandCode, attrs: CommandAttributes) -> Tpm2Command {
    let bytes = Header::emit(crate::proto::constants::TAG_NO_SESSIONS, crate::proto::constants::HEADER_SIZE as u32, code.0).to_vec();
    Tpm2Command::new(connection_id, bytes, attrs).unwrap()
}

pub fn create_primary_cmd(connection_id: u64) -> Tpm2Command {
    let mut bytes = Header::emit(
        crate::proto::constants::TAG_NO_SESSIONS,
        0,
        CommandCode::CREATE_PRIMARY.0,
    )
    .to_vec();
    bytes.extend_from_slice(&0x4000_0001u32.to_be_bytes()); // TPM_RH_OWNER
    let total = bytes.len() as u32;
    Header::set_size(&mut bytes, total);
    Tpm2Command::new(connection_id, bytes, ONE_HANDLE_IN_ONE_OUT()).unwrap()
}

pub fn flush_context_cmd(connection_id: u64, handle: u32) -> Tpm2Command {
    let mut bytes = Header::emit(
        crate::proto::constants::TAG_NO_SESSIONS,
        0,
        CommandCode::FLUSH_CONTEXT.0,
    )
    .to_vec();
    bytes.extend_from_slice(&handle.to_be_bytes());
    let total = bytes.len() as u32;
    Header::set_size(&mut bytes, total);
    Tpm2Command::new(connection_id, bytes, NO_HANDLES()).unwrap()
}

pub fn command_using_handle(connection_id: u64, code: CommandCode, handle: u32) -> Tpm2Command {
    let mut bytes = Header::emit(crate::proto::constants::TAG_NO_SESSIONS, 0, code.0).to_vec();
    bytes.extend_from_slice(&handle.to_be_bytes());
    let total = bytes.len() as u32;
    Header::set_size(&mut bytes, total);
    Tpm2Command::new(connection_id, bytes, ONE_HANDLE_IN()).unwrap()
}

pub fn context_save_cmd(connection_id: u64, handle: u32) -> Tpm2Command {
    command_using_handle(connection_id, CommandCode::CONTEXT_SAVE, handle)
}

pub fn context_load_cmd(connection_id: u64, blob: &[u8]) -> Tpm2Command {
    let mut bytes = Header::emit(
        crate::proto::constants::TAG_NO_SESSIONS,
        0,
        CommandCode::CONTEXT_LOAD.0,
    )
    .to_vec();
    bytes.extend_from_slice(blob);
    let total = bytes.len() as u32;
    Header::set_size(&mut bytes, total);
    Tpm2Command::new(connection_id, bytes, NO_HANDLES()).unwrap()
}

pub fn start_auth_session_cmd(connection_id: u64) -> Tpm2Command {
    let mut bytes = Header::emit(
        crate::proto::constants::TAG_NO_SESSIONS,
        0,
        CommandCode::START_AUTH_SESSION.0,
    )
    .to_vec();
    bytes.extend_from_slice(&0x4000_0007u32.to_be_bytes()); // TPM_RH_NULL tpmKey
    bytes.extend_from_slice(&0x4000_0007u32.to_be_bytes()); // TPM_RH_NULL bind
    let total = bytes.len() as u32;
    Header::set_size(&mut bytes, total);
    Tpm2Command::new(connection_id, bytes, CommandAttributes::new().with_c_handles(2).with_r_handle(true)).unwrap()
}

pub fn load_cmd(connection_id: u64, parent_vhandle: u32) -> Tpm2Command {
    let mut bytes = Header::emit(crate::proto::constants::TAG_NO_SESSIONS, 0, CommandCode::LOAD.0).to_vec();
    bytes.extend_from_slice(&parent_vhandle.to_be_bytes());
    bytes.extend_from_slice(&[0u8, 4]); // inPrivate size placeholder
    bytes.extend_from_slice(&[0u8, 4]); // inPublic size placeholder
    let total = bytes.len() as u32;
    Header::set_size(&mut bytes, total);
    Tpm2Command::new(connection_id, bytes, ONE_HANDLE_IN_ONE_OUT()).unwrap()
}

pub fn shutdown_cmd(connection_id: u64) -> Tpm2Command {
    bare_command(connection_id, CommandCode::SHUTDOWN, NO_HANDLES())
}
