// Copyright (c) Contributors to the tpm2-abrm project.
// Licensed under the MIT License.

//! The Resource Manager: the single-threaded executor that virtualises
//! handles, swaps transient objects and sessions in and out of the TPM,
//! and recovers from context-counter exhaustion.
//!
//! Runs as one thread owning the [`crate::session::SessionList`] and every
//! connection's [`crate::handle_map::TransientHandleMap`] without internal
//! locking, since nothing else ever touches them.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::mpsc::Receiver;
use std::sync::Arc;

use crate::access_gate::TpmAccessGate;
use crate::command::Tpm2Command;
use crate::connection::ConnectionTable;
use crate::error::QuotaError;
use crate::pipeline::message::InboundMessage;
use crate::pipeline::message::OutboundMessage;
use crate::pipeline::message::Runnable;
use crate::pipeline::message::Sink;
use crate::proto::constants::is_session;
use crate::proto::constants::is_transient;
use crate::proto::constants::CAP_HANDLES;
use crate::proto::constants::CAP_TPM_PROPERTIES;
use crate::proto::constants::HT_TRANSIENT;
use crate::proto::constants::PT_CONTEXT_GAP_MAX;
use crate::proto::CommandCode;
use crate::proto::ResponseCode;
use crate::response::Tpm2Response;
use crate::session::SessionEntry;
use crate::session::SessionList;
use crate::session::SessionState;

/// Commands which, on success, hand the client a fresh transient-object
/// handle and so are subject to the per-connection transient-object quota.
fn creates_transient_object(code: CommandCode) -> bool {
    matches!(
        code,
        CommandCode::CREATE_PRIMARY | CommandCode::LOAD | CommandCode::LOAD_EXTERNAL
    )
}

pub struct ResourceManager<S: Sink<OutboundMessage>> {
    connections: Arc<ConnectionTable>,
    sessions: SessionList,
    access_gate: Arc<TpmAccessGate>,
    inbound: Receiver<InboundMessage>,
    outbound: S,
    max_sessions_per_conn: usize,
    cancelled: Arc<AtomicBool>,
}

/// Handles touched while executing one command, needed for the
/// post-processing save/flush pass.
#[derive(Default)]
struct CommandTouches {
    /// Virtual handles of transient objects this command loaded.
    loaded_transients: Vec<u32>,
    /// Physical session handles touched this command.
    touched_sessions: Vec<u32>,
    /// Session handles to drop from the session list after the command,
    /// because their authorisation did not set `continueSession`.
    sessions_to_drop: Vec<u32>,
}

impl<S: Sink<OutboundMessage>> ResourceManager<S> {
    pub fn new(
        connections: Arc<ConnectionTable>,
        sessions: SessionList,
        access_gate: Arc<TpmAccessGate>,
        inbound: Receiver<InboundMessage>,
        outbound: S,
        max_sessions_per_conn: usize,
        cancelled: Arc<AtomicBool>,
    ) -> Self {
        Self {
            connections,
            sessions,
            access_gate,
            inbound,
            outbound,
            max_sessions_per_conn,
            cancelled,
        }
    }

    fn reply(&self, connection_id: u64, response: Tpm2Response) {
        let _ = self.outbound.enqueue(OutboundMessage::Response {
            connection_id,
            response,
        });
    }

    fn handle_connection_removed(&mut self, connection_id: u64) {
        let owned = self.sessions.entries_owned_by(connection_id);
        for entry in owned {
            let (handle, state) = {
                let e = entry.lock();
                (e.saved_handle(), e.state())
            };
            match state {
                SessionState::SavedClient => {
                    if let Err(e) = self.sessions.abandon(connection_id, handle) {
                        tracing::error!(error = %e, "failed to abandon session on connection close");
                    }
                }
                SessionState::SavedRm => {
                    if let Err(e) = self.access_gate.flush_context(handle) {
                        tracing::warn!(handle = %format!("{handle:#010x}"), error = %e, "failed to flush saved session on connection close");
                    }
                    self.sessions.remove_by_handle(handle);
                }
                other => {
                    tracing::error!(
                        handle = %format!("{handle:#010x}"),
                        state = ?other,
                        "session in unexpected state during connection close"
                    );
                }
            }
        }
        let mut flushed = Vec::new();
        self.sessions.prune_abandoned(|h| flushed.push(h));
        for h in flushed {
            if let Err(e) = self.access_gate.flush_context(h) {
                tracing::warn!(handle = %format!("{h:#010x}"), error = %e, "failed to flush pruned abandoned session");
            }
        }
    }

    /// §4.7.1 step 1: local quota checks that never reach the TPM.
    fn check_quota(&self, conn: &crate::connection::Connection, cmd: &Tpm2Command) -> Result<(), QuotaError> {
        if creates_transient_object(cmd.code()) && conn.handle_map().lock().is_full() {
            return Err(QuotaError::TransientObjectLimit);
        }
        if cmd.code() == CommandCode::START_AUTH_SESSION {
            let owned = self
                .sessions
                .entries_owned_by(conn.id())
                .len();
            if owned >= self.max_sessions_per_conn {
                return Err(QuotaError::SessionLimit);
            }
        }
        Ok(())
    }

    /// §4.7.1 step 2: commands this broker fully virtualises locally,
    /// short-circuiting the TPM. Returns `Some(response)` when handled.
    fn try_virtualize_locally(
        &mut self,
        conn: &crate::connection::Connection,
        cmd: &Tpm2Command,
    ) -> Option<Tpm2Response> {
        match cmd.code() {
            CommandCode::FLUSH_CONTEXT => {
                let handle = cmd.flush_handle().ok()?;
                if is_transient(handle) {
                    let mut map = conn.handle_map().lock();
                    if map.get(handle).is_none() {
                        return Some(Tpm2Response::from_response_code(
                            ResponseCode::HANDLE_UNKNOWN,
                        ));
                    }
                    map.remove(handle);
                    return Some(Tpm2Response::from_response_code(ResponseCode::SUCCESS));
                }
                None // session FlushContext proceeds to the TPM in step 5
            }
            CommandCode::CONTEXT_SAVE => {
                let handle = cmd.handle(0).ok()?;
                if !is_session(handle) {
                    return None;
                }
                let entry = self.sessions.lookup_by_handle(handle)?;
                if !entry.lock().is_owned_by(conn.id()) {
                    return Some(Tpm2Response::from_response_code(
                        ResponseCode::NOT_PERMITTED,
                    ));
                }
                let blob = handle.to_be_bytes().to_vec();
                entry.lock().set_context_client(blob.clone());
                entry.lock().set_state(SessionState::SavedClient);
                Some(Tpm2Response::synthesize_context_save(&blob))
            }
            CommandCode::CONTEXT_LOAD => {
                let blob = &cmd.bytes()[crate::proto::constants::HEADER_SIZE..];
                let entry = self.sessions.lookup_by_client_context(blob)?;
                let handle = entry.lock().saved_handle();
                if !entry.lock().is_owned_by(conn.id()) {
                    self.sessions.claim(handle, conn.id()).ok()?;
                }
                // No TPM interaction happened here; leave the entry exactly
                // as a regular post-command save would, so the next command
                // touching it goes through the usual SavedRm -> ContextLoad
                // re-materialisation in virtualize_auth_area.
                entry.lock().set_state(SessionState::SavedRm);
                Some(Tpm2Response::synthesize_context_load(handle))
            }
            CommandCode::GET_CAPABILITY if cmd.cap() == CAP_HANDLES => {
                if (cmd.prop() >> crate::proto::constants::HR_SHIFT) as u8 != HT_TRANSIENT {
                    return None;
                }
                let handles = conn.handle_map().lock().sorted_handles();
                let max_count = cmd.prop_count() as usize;
                let more_data = handles.len() > max_count;
                let returned: Vec<u32> = handles.into_iter().take(max_count).collect();

                // TPMS_CAPABILITY_DATA: moreData(1) + capability(4) +
                // TPML_HANDLE { count(4) + handle(4) * count }.
                let mut bytes =
                    crate::proto::Header::emit(crate::proto::constants::TAG_NO_SESSIONS, 0, ResponseCode::SUCCESS.0)
                        .to_vec();
                bytes.push(more_data as u8);
                bytes.extend_from_slice(&CAP_HANDLES.to_be_bytes());
                bytes.extend_from_slice(&(returned.len() as u32).to_be_bytes());
                for h in &returned {
                    bytes.extend_from_slice(&h.to_be_bytes());
                }
                let total = bytes.len() as u32;
                crate::proto::Header::set_size(&mut bytes, total);
                Some(Tpm2Response::new(bytes, cmd.attrs()))
            }
            _ => None,
        }
    }

    /// §4.7.1 step 3: rewrite every transient handle in the handle area
    /// from virtual to physical, reloading saved objects as needed.
    fn virtualize_handle_area(
        &self,
        conn: &crate::connection::Connection,
        cmd: &mut Tpm2Command,
        touches: &mut CommandTouches,
    ) -> Result<(), crate::error::BrokerError> {
        for i in 0..cmd.handle_count() {
            let vhandle = cmd.handle(i)?;
            if !is_transient(vhandle) {
                continue;
            }
            let mut map = conn.handle_map().lock();
            let physical = {
                let entry = map
                    .get(vhandle)
                    .ok_or(crate::error::VirtError::UnknownVirtualHandle { handle: vhandle })?;
                entry.physical_handle()
            };
            let physical = if physical == 0 {
                let blob = map.get(vhandle).unwrap().context_blob().to_vec();
                let fresh = self.access_gate.context_load(&blob)?;
                map.get_mut(vhandle).unwrap().set_physical_handle(fresh);
                fresh
            } else {
                physical
            };
            drop(map);
            cmd.set_handle(i, physical)?;
            touches.loaded_transients.push(vhandle);
        }
        Ok(())
    }

    /// §4.7.1 step 4: rewrite every session handle in the authorisation
    /// area from the broker's tracked savedHandle, reloading `SAVED_RM`
    /// sessions as needed.
    fn virtualize_auth_area(
        &mut self,
        conn: &crate::connection::Connection,
        cmd: &Tpm2Command,
        touches: &mut CommandTouches,
    ) -> Result<(), crate::error::BrokerError> {
        let mut to_load = Vec::new();
        cmd.for_each_auth(|auth| {
            if is_session(auth.session_handle) {
                to_load.push((auth.session_handle, auth.continue_session));
            }
        })?;
        for (handle, continue_session) in to_load {
            let entry = self
                .sessions
                .lookup_by_handle(handle)
                .ok_or(crate::error::VirtError::UnknownVirtualHandle { handle })?;
            if !entry.lock().is_owned_by(conn.id()) {
                return Err(crate::error::VirtError::ForeignSession { handle }.into());
            }
            if entry.lock().state() == SessionState::SavedRm {
                let blob = entry.lock().context_rm().to_vec();
                self.access_gate.context_load(&blob)?;
                entry.lock().set_state(SessionState::Loaded);
            }
            touches.touched_sessions.push(handle);
            if !continue_session {
                touches.sessions_to_drop.push(handle);
            }
        }
        Ok(())
    }

    /// §4.7.1 step 5: submit to the TPM, transparently recovering from
    /// `TPM_RC_CONTEXT_GAP` by regapping every saved session and retrying
    /// exactly once.
    fn submit_with_gap_recovery(&self, cmd_bytes: &[u8], attrs: crate::command::CommandAttributes) -> Tpm2Response {
        let resp = self.access_gate.send_command(cmd_bytes, attrs);
        if resp.code() != ResponseCode::CONTEXT_GAP {
            return resp;
        }
        tracing::warn!("TPM_RC_CONTEXT_GAP, regapping saved sessions and retrying once");
        self.regap_saved_sessions();
        self.access_gate.send_command(cmd_bytes, attrs)
    }

    fn regap_saved_sessions(&self) {
        let mut saved = Vec::new();
        self.sessions.for_each(|e| {
            let entry = e.lock();
            if entry.state() == SessionState::SavedRm {
                saved.push(e.clone());
            }
        });
        for entry in saved {
            let blob = entry.lock().context_rm().to_vec();
            let physical = match self.access_gate.context_load(&blob) {
                Ok(h) => h,
                Err(e) => {
                    tracing::error!(error = %e, "regap: context_load failed");
                    continue;
                }
            };
            match self.access_gate.context_save(physical) {
                Ok(new_blob) => entry.lock().set_context_rm(new_blob),
                Err(e) => tracing::error!(error = %e, "regap: context_save failed"),
            }
        }
    }

    /// §4.7.1 step 6: classify a handle newly returned in the response.
    fn fixup_response_handle(
        &mut self,
        conn: &crate::connection::Connection,
        resp: &mut Tpm2Response,
        touches: &mut CommandTouches,
    ) {
        let Some(physical) = resp.handle() else {
            return;
        };
        if is_transient(physical) {
            let mut map = conn.handle_map().lock();
            match map.insert_new(physical, Vec::new()) {
                Ok(vhandle) => {
                    drop(map);
                    resp.set_handle(vhandle);
                    touches.loaded_transients.push(vhandle);
                }
                Err(e) => {
                    tracing::error!(error = %e, "failed to allocate virtual handle for response");
                    resp.set_code(ResponseCode::OBJECT_MEMORY);
                }
            }
        } else if is_session(physical) {
            let entry = SessionEntry::new(physical, conn.id());
            match self.sessions.insert(entry) {
                Ok(_) => touches.touched_sessions.push(physical),
                Err(e) => {
                    tracing::error!(error = %e, "failed to track new session");
                    resp.set_code(ResponseCode::SESSION_MEMORY);
                }
            }
        }
    }

    /// §4.7.1 step 7: save and flush everything touched this command so
    /// the TPM holds only what the *next* command needs.
    fn post_process(&mut self, conn: &crate::connection::Connection, cmd: &Tpm2Command, touches: CommandTouches) {
        if cmd.attrs().flushed() {
            let mut map = conn.handle_map().lock();
            for vhandle in &touches.loaded_transients {
                map.remove(*vhandle);
            }
        } else {
            let mut map = conn.handle_map().lock();
            for vhandle in &touches.loaded_transients {
                let Some(entry) = map.get(*vhandle) else {
                    continue;
                };
                let physical = entry.physical_handle();
                if physical == 0 {
                    continue;
                }
                match self.access_gate.context_save_then_flush(physical) {
                    Ok(blob) => {
                        let entry = map.get_mut(*vhandle).unwrap();
                        entry.set_context_blob(blob);
                        entry.clear_physical_handle();
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to save+flush transient object, retaining resident entry");
                    }
                }
            }
        }

        for handle in &touches.touched_sessions {
            if touches.sessions_to_drop.contains(handle) {
                if let Some(entry) = self.sessions.remove_by_handle(*handle) {
                    if let Err(e) = self.access_gate.flush_context(entry.lock().saved_handle()) {
                        tracing::warn!(error = %e, "failed to flush dropped session");
                    }
                }
                continue;
            }
            let Some(entry) = self.sessions.lookup_by_handle(*handle) else {
                continue;
            };
            if entry.lock().state() != SessionState::Loaded {
                continue;
            }
            match self.access_gate.context_save(*handle) {
                Ok(blob) => {
                    entry.lock().set_context_rm(blob);
                    entry.lock().set_state(SessionState::SavedRm);
                }
                Err(e) => {
                    tracing::error!(error = %e, "failed to save session, flushing and dropping");
                    let _ = self.access_gate.flush_context(*handle);
                    self.sessions.remove_by_handle(*handle);
                }
            }
        }
    }

    fn rewrite_context_gap_max(resp: &mut Tpm2Response) {
        // Rewrite TPM_PT_CONTEXT_GAP_MAX to u32::MAX wherever it appears
        // in a TPM_PROPERTIES capability response, to hide the broker's
        // internal regap handling from clients.
        let bytes = resp.bytes().to_vec();
        let body = &bytes[crate::proto::constants::HEADER_SIZE..];
        let mut i = 0;
        let mut out = bytes.clone();
        while i + 8 <= body.len() {
            let prop = u32::from_be_bytes(body[i..i + 4].try_into().unwrap());
            if prop == PT_CONTEXT_GAP_MAX {
                let off = crate::proto::constants::HEADER_SIZE + i + 4;
                out[off..off + 4].copy_from_slice(&u32::MAX.to_be_bytes());
            }
            i += 8;
        }
        *resp = Tpm2Response::new(out, resp.attrs());
    }

    fn process_command(&mut self, mut cmd: Tpm2Command) {
        let connection_id = cmd.connection_id();
        let Some(conn) = self.connections.get_by_id(connection_id) else {
            tracing::debug!(id = connection_id, "command for connection that already closed");
            return;
        };

        if let Err(e) = self.check_quota(&conn, &cmd) {
            self.reply(connection_id, Tpm2Response::from_response_code(e.response_code()));
            return;
        }

        if let Some(resp) = self.try_virtualize_locally(&conn, &cmd) {
            self.reply(connection_id, resp);
            return;
        }

        let is_get_capability_properties =
            cmd.code() == CommandCode::GET_CAPABILITY && cmd.cap() == CAP_TPM_PROPERTIES;

        let mut touches = CommandTouches::default();
        if let Err(e) = self.virtualize_handle_area(&conn, &mut cmd, &mut touches) {
            tracing::warn!(error = %e, "handle virtualisation failed");
            self.reply(
                connection_id,
                Tpm2Response::from_response_code(e.response_code().unwrap_or(ResponseCode::INTERNAL_ERROR)),
            );
            return;
        }
        if let Err(e) = self.virtualize_auth_area(&conn, &cmd, &mut touches) {
            tracing::warn!(error = %e, "auth virtualisation failed");
            self.reply(
                connection_id,
                Tpm2Response::from_response_code(e.response_code().unwrap_or(ResponseCode::INTERNAL_ERROR)),
            );
            return;
        }

        let mut resp = self.submit_with_gap_recovery(cmd.bytes(), cmd.attrs());
        self.fixup_response_handle(&conn, &mut resp, &mut touches);

        if is_get_capability_properties && resp.code().is_success() {
            Self::rewrite_context_gap_max(&mut resp);
        }

        self.post_process(&conn, &cmd, touches);
        self.reply(connection_id, resp);
    }
}

impl<S: Sink<OutboundMessage>> ResourceManager<S> {
    /// Handle one inbound message. Returns `false` once a shutdown
    /// message has been processed and the caller should stop. Exposed as
    /// `pub` (rather than folded entirely into [`Runnable::run`]) so
    /// scenario tests can drive the Resource Manager message-by-message
    /// without a live channel and thread.
    pub fn handle_message(&mut self, message: InboundMessage) -> bool {
        match message {
            InboundMessage::Command(cmd) => {
                self.process_command(cmd);
                true
            }
            InboundMessage::ConnectionRemoved(id) => {
                self.handle_connection_removed(id);
                true
            }
            InboundMessage::CheckCancel => {
                let _ = self.outbound.enqueue(OutboundMessage::CheckCancel);
                false
            }
        }
    }

    pub fn sessions(&self) -> &SessionList {
        &self.sessions
    }
}

impl<S: Sink<OutboundMessage>> Runnable for ResourceManager<S> {
    fn run(mut self) {
        while let Ok(message) = self.inbound.recv() {
            if self.cancelled.load(Ordering::Acquire) {
                let _ = self.outbound.enqueue(OutboundMessage::CheckCancel);
                return;
            }
            if !self.handle_message(message) {
                return;
            }
        }
    }
}
