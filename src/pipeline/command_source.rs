// Copyright (c) Contributors to the tpm2-abrm project.
// Licensed under the MIT License.

//! The Command Source: one thread, cooperatively multiplexing every live
//! client stream, framing TPM command buffers and enqueuing them for the
//! Resource Manager. GMainLoop-registered watch callbacks collapse here
//! into a single poll loop over non-blocking reads.

use std::collections::HashMap;
use std::io::Read;
use std::os::unix::io::RawFd;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::time::Duration;

use crate::command::CommandAttributes;
use crate::command::Tpm2Command;
use crate::connection::Connection;
use crate::connection::ConnectionTable;
use crate::pipeline::message::InboundMessage;
use crate::pipeline::message::Runnable;
use crate::pipeline::message::Sink;
use crate::proto::constants::DEFAULT_MAX_BUFFER_SIZE;
use crate::proto::constants::HEADER_SIZE;
use crate::proto::Header;

/// How long the poll loop sleeps between multiplexing passes when no
/// stream has data ready. Keeps CPU use bounded without an OS readiness
/// primitive.
const POLL_INTERVAL: Duration = Duration::from_millis(2);

/// A command buffer being assembled across multiple non-blocking reads.
#[derive(Default)]
struct PartialBuffer {
    bytes: Vec<u8>,
}

/// Resolves a command code to its `TPMA_CC` attributes. In production
/// this is the broker's cached `GetCapability(TPM_CAP_COMMANDS)` table; a
/// closure keeps the Command Source decoupled from how that table is
/// populated.
pub type AttributeLookup = Arc<dyn Fn(u32) -> CommandAttributes + Send + Sync>;

pub struct CommandSource<S: Sink<InboundMessage>> {
    connections: Arc<ConnectionTable>,
    new_connections: Receiver<Arc<Connection>>,
    outbound: S,
    attrs_for: AttributeLookup,
    max_buffer_size: usize,
    cancelled: Arc<AtomicBool>,
}

impl<S: Sink<InboundMessage>> CommandSource<S> {
    pub fn new(
        connections: Arc<ConnectionTable>,
        new_connections: Receiver<Arc<Connection>>,
        outbound: S,
        attrs_for: AttributeLookup,
        max_buffer_size: usize,
        cancelled: Arc<AtomicBool>,
    ) -> Self {
        Self {
            connections,
            new_connections,
            outbound,
            attrs_for,
            max_buffer_size: max_buffer_size.min(crate::proto::constants::MAX_BUFFER_SIZE_CEILING),
            cancelled,
        }
    }

    /// Attempt one non-blocking read from `conn`, appending to its partial
    /// buffer. Returns `Some(true)` if a complete command was extracted
    /// and enqueued, `Some(false)` if a read happened but no command
    /// completed yet, and `None` on EOF/error (caller must remove the
    /// connection).
    fn poll_connection(
        &self,
        fd: RawFd,
        conn: &Arc<Connection>,
        partial: &mut PartialBuffer,
    ) -> Option<bool> {
        let mut stream = conn.try_clone_stream().ok()?;
        let mut chunk = [0u8; 4096];
        match stream.read(&mut chunk) {
            Ok(0) => None, // EOF
            Ok(n) => {
                partial.bytes.extend_from_slice(&chunk[..n]);
                self.try_complete(fd, conn, partial);
                Some(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Some(false),
            Err(_) => None,
        }
    }

    fn try_complete(&self, _fd: RawFd, conn: &Arc<Connection>, partial: &mut PartialBuffer) {
        loop {
            if partial.bytes.len() < HEADER_SIZE {
                return;
            }
            let size = Header::size(&partial.bytes) as usize;
            if size < HEADER_SIZE || size > self.max_buffer_size {
                tracing::warn!(size, "command framing error, dropping connection");
                partial.bytes.clear();
                let _ = self
                    .outbound
                    .enqueue(InboundMessage::ConnectionRemoved(conn.id()));
                return;
            }
            if partial.bytes.len() < size {
                return;
            }
            let cmd_bytes: Vec<u8> = partial.bytes.drain(..size).collect();
            let code = Header::code(&cmd_bytes);
            let attrs = (self.attrs_for)(code);
            match Tpm2Command::new(conn.id(), cmd_bytes, attrs) {
                Ok(cmd) => {
                    let _ = self.outbound.enqueue(InboundMessage::Command(cmd));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "dropping malformed command");
                }
            }
        }
    }
}

impl<S: Sink<InboundMessage>> Runnable for CommandSource<S> {
    fn run(self) {
        let mut registered: HashMap<RawFd, (Arc<Connection>, PartialBuffer)> = HashMap::new();
        loop {
            if self.cancelled.load(Ordering::Acquire) {
                let _ = self.outbound.enqueue(InboundMessage::CheckCancel);
                return;
            }

            while let Ok(conn) = self.new_connections.try_recv() {
                if let Ok(stream) = conn.try_clone_stream() {
                    let _ = stream.set_nonblocking(true);
                }
                registered.insert(conn.raw_fd(), (conn, PartialBuffer::default()));
            }

            let mut dead = Vec::new();
            let mut any_activity = false;
            for (fd, (conn, partial)) in registered.iter_mut() {
                match self.poll_connection(*fd, conn, partial) {
                    Some(true) => any_activity = true,
                    Some(false) => {}
                    None => dead.push(*fd),
                }
            }

            for fd in dead {
                if let Some((conn, _)) = registered.remove(&fd) {
                    self.connections.remove_by_id(conn.id());
                    let _ = self
                        .outbound
                        .enqueue(InboundMessage::ConnectionRemoved(conn.id()));
                    tracing::debug!(id = conn.id(), "connection closed");
                }
            }

            if !any_activity {
                std::thread::sleep(POLL_INTERVAL);
            }
        }
    }
}

pub fn default_max_buffer_size() -> usize {
    DEFAULT_MAX_BUFFER_SIZE
}
