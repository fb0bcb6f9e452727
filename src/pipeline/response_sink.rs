// Copyright (c) Contributors to the tpm2-abrm project.
// Licensed under the MIT License.

//! The Response Sink: one thread, writing each response buffer in full
//! back to its originating connection.

use std::io::Write;
use std::sync::mpsc::Receiver;
use std::sync::Arc;

use crate::connection::ConnectionTable;
use crate::pipeline::message::OutboundMessage;
use crate::pipeline::message::Runnable;

pub struct ResponseSink {
    inbound: Receiver<OutboundMessage>,
    connections: Arc<ConnectionTable>,
}

impl ResponseSink {
    pub fn new(inbound: Receiver<OutboundMessage>, connections: Arc<ConnectionTable>) -> Self {
        Self {
            inbound,
            connections,
        }
    }

    fn write_full(mut stream: impl Write, buf: &[u8]) -> std::io::Result<()> {
        let mut written = 0;
        while written < buf.len() {
            written += stream.write(&buf[written..])?;
        }
        Ok(())
    }
}

impl Runnable for ResponseSink {
    fn run(self) {
        while let Ok(message) = self.inbound.recv() {
            match message {
                OutboundMessage::CheckCancel => return,
                OutboundMessage::Response {
                    connection_id,
                    response,
                } => {
                    let Some(conn) = self.connections.get_by_id(connection_id) else {
                        tracing::debug!(
                            id = connection_id,
                            "dropping response for connection that already closed"
                        );
                        continue;
                    };
                    let Ok(stream) = conn.try_clone_stream() else {
                        continue;
                    };
                    if let Err(e) = Self::write_full(stream, response.bytes()) {
                        tracing::warn!(id = connection_id, error = %e, "failed to write response");
                    }
                }
            }
        }
    }
}
