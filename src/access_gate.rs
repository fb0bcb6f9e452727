// Copyright (c) Contributors to the tpm2-abrm project.
// Licensed under the MIT License.

//! The TPM Access Gate: the single point of contact with the physical (or
//! simulated) device. One mutex, held only long enough to transmit and
//! receive, never across queue or stream I/O.

use std::time::Duration;

use parking_lot::Mutex;

use crate::error::TctiError;
use crate::proto::constants::*;
use crate::proto::CommandCode;
use crate::proto::Header;
use crate::proto::ResponseCode;
use crate::response::Tpm2Response;
use crate::tcti::Tcti;

/// Cached `GetCapability(TPM_PROPERTIES, FIXED)` values queried once at
/// startup so the rest of the broker never needs a device round trip to
/// learn them.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedProperties {
    pub max_command_size: u32,
    pub max_response_size: u32,
    pub total_commands: u32,
}

/// Serialises all device traffic behind a single mutex.
pub struct TpmAccessGate {
    tcti: Mutex<Box<dyn Tcti>>,
    fixed: FixedProperties,
    receive_timeout: Duration,
}

impl TpmAccessGate {
    /// Issue `Startup(CLEAR)`, tolerating the device's "already started"
    /// response, then cache fixed properties.
    pub fn new(mut tcti: Box<dyn Tcti>, receive_timeout: Duration) -> Result<Self, TctiError> {
        let startup = Header::emit(TAG_NO_SESSIONS, HEADER_SIZE as u32, CommandCode::STARTUP.0);
        tcti.transmit(&startup)?;
        let resp = tcti.receive(receive_timeout)?;
        let rc = ResponseCode(Header::code(&resp));
        if !rc.is_success() && rc != ResponseCode(0x0000_0100) {
            tracing::warn!(rc = %rc, "TPM Startup returned a non-success, non-already-started code");
        }

        let fixed = Self::query_fixed_properties(&mut tcti, receive_timeout)?;

        Ok(Self {
            tcti: Mutex::new(tcti),
            fixed,
            receive_timeout,
        })
    }

    fn query_fixed_properties(
        tcti: &mut Box<dyn Tcti>,
        timeout: Duration,
    ) -> Result<FixedProperties, TctiError> {
        let mut buf = Header::emit(TAG_NO_SESSIONS, 0, CommandCode::GET_CAPABILITY.0).to_vec();
        buf.extend_from_slice(&CAP_TPM_PROPERTIES.to_be_bytes());
        buf.extend_from_slice(&PT_MAX_COMMAND_SIZE.to_be_bytes());
        buf.extend_from_slice(&64u32.to_be_bytes());
        let total = buf.len() as u32;
        Header::set_size(&mut buf, total);

        tcti.transmit(&buf)?;
        let resp = tcti.receive(timeout)?;

        let defaults = FixedProperties {
            max_command_size: DEFAULT_MAX_BUFFER_SIZE as u32,
            max_response_size: DEFAULT_MAX_BUFFER_SIZE as u32,
            total_commands: 0,
        };
        let rc = ResponseCode(Header::code(&resp));
        if !rc.is_success() {
            tracing::warn!(rc = %rc, "GetCapability(TPM_PROPERTIES) failed, using buffer-ceiling defaults");
            return Ok(defaults);
        }
        Ok(Self::parse_fixed_properties(&resp, defaults))
    }

    /// Decode a `TPMS_CAPABILITY_DATA` body for `TPM_CAP_TPM_PROPERTIES`:
    /// `moreData(1) + capability(4) + TPML_TAGGED_TPM_PROPERTY { count(4) +
    /// (property(4) + value(4)) * count }`. Any property this broker
    /// doesn't track is ignored; missing properties keep `defaults`.
    fn parse_fixed_properties(resp: &[u8], defaults: FixedProperties) -> FixedProperties {
        let mut props = defaults;
        let body = &resp[HEADER_SIZE..];
        if body.len() < 9 {
            return props;
        }
        let capability = u32::from_be_bytes(body[1..5].try_into().unwrap());
        if capability != CAP_TPM_PROPERTIES {
            return props;
        }
        let count = u32::from_be_bytes(body[5..9].try_into().unwrap()) as usize;
        let mut offset = 9;
        for _ in 0..count {
            if offset + 8 > body.len() {
                break;
            }
            let property = u32::from_be_bytes(body[offset..offset + 4].try_into().unwrap());
            let value = u32::from_be_bytes(body[offset + 4..offset + 8].try_into().unwrap());
            match property {
                PT_MAX_COMMAND_SIZE => props.max_command_size = value,
                PT_MAX_RESPONSE_SIZE => props.max_response_size = value,
                PT_TOTAL_COMMANDS => props.total_commands = value,
                _ => {}
            }
            offset += 8;
        }
        props
    }

    pub fn fixed_properties(&self) -> FixedProperties {
        self.fixed
    }

    /// Transmit `cmd` and return its response. TCTI failures are never
    /// propagated as `Err`: they are reported to the caller as a synthetic
    /// response carrying the TCTI error's response code, matching the
    /// policy that a transport failure never closes the connection.
    pub fn send_command(&self, cmd_bytes: &[u8], attrs: crate::command::CommandAttributes) -> Tpm2Response {
        let mut tcti = self.tcti.lock();
        if let Err(e) = tcti.transmit(cmd_bytes) {
            tracing::error!(error = %e, "TCTI transmit failed");
            return Tpm2Response::from_response_code(e.response_code());
        }
        match tcti.receive(self.receive_timeout) {
            Ok(bytes) => Tpm2Response::new(bytes, attrs),
            Err(e) => {
                tracing::error!(error = %e, "TCTI receive failed");
                Tpm2Response::from_response_code(e.response_code())
            }
        }
    }

    fn simple_command(&self, code: CommandCode, handle: u32) -> Result<Vec<u8>, TctiError> {
        let mut buf = Header::emit(TAG_NO_SESSIONS, 0, code.0).to_vec();
        buf.extend_from_slice(&handle.to_be_bytes());
        let total = buf.len() as u32;
        Header::set_size(&mut buf, total);
        let mut tcti = self.tcti.lock();
        tcti.transmit(&buf)?;
        tcti.receive(self.receive_timeout)
    }

    /// `ContextSave(handle)`, returning the device's opaque context blob
    /// (the response body past the header).
    pub fn context_save(&self, handle: u32) -> Result<Vec<u8>, TctiError> {
        let resp = self.simple_command(CommandCode::CONTEXT_SAVE, handle)?;
        let rc = ResponseCode(Header::code(&resp));
        if !rc.is_success() {
            return Err(TctiError::Receive(rc));
        }
        Ok(resp[HEADER_SIZE..].to_vec())
    }

    /// `ContextLoad(blob)`, returning the physical handle the device
    /// assigned.
    pub fn context_load(&self, blob: &[u8]) -> Result<u32, TctiError> {
        let mut buf = Header::emit(TAG_NO_SESSIONS, 0, CommandCode::CONTEXT_LOAD.0).to_vec();
        buf.extend_from_slice(blob);
        let total = buf.len() as u32;
        Header::set_size(&mut buf, total);
        let mut tcti = self.tcti.lock();
        tcti.transmit(&buf)?;
        let resp = tcti.receive(self.receive_timeout)?;
        let rc = ResponseCode(Header::code(&resp));
        if !rc.is_success() {
            return Err(TctiError::Receive(rc));
        }
        if resp.len() < HEADER_SIZE + 4 {
            return Err(TctiError::Receive(ResponseCode::INTERNAL_ERROR));
        }
        Ok(u32::from_be_bytes(
            resp[HEADER_SIZE..HEADER_SIZE + 4].try_into().unwrap(),
        ))
    }

    pub fn flush_context(&self, handle: u32) -> Result<(), TctiError> {
        let resp = self.simple_command(CommandCode::FLUSH_CONTEXT, handle)?;
        let rc = ResponseCode(Header::code(&resp));
        if !rc.is_success() {
            return Err(TctiError::Receive(rc));
        }
        Ok(())
    }

    /// `ContextSave` followed by `FlushContext`, in that order: the object
    /// must be safely persisted before it is discarded from the device.
    pub fn context_save_then_flush(&self, handle: u32) -> Result<Vec<u8>, TctiError> {
        let blob = self.context_save(handle)?;
        self.flush_context(handle)?;
        Ok(blob)
    }

    /// `GetCapability(TPM_CAP_OBJECTS, TPM_HT_TRANSIENT)` diagnostic count.
    /// Not used on the command hot path; exposed for operator tooling.
    pub fn transient_object_count(&self) -> Result<u32, TctiError> {
        let mut buf = Header::emit(TAG_NO_SESSIONS, 0, CommandCode::GET_CAPABILITY.0).to_vec();
        buf.extend_from_slice(&CAP_HANDLES.to_be_bytes());
        buf.extend_from_slice(&((HT_TRANSIENT as u32) << HR_SHIFT).to_be_bytes());
        buf.extend_from_slice(&MAX_BUFFER_SIZE_CEILING.to_be_bytes());
        let total = buf.len() as u32;
        Header::set_size(&mut buf, total);
        let mut tcti = self.tcti.lock();
        tcti.transmit(&buf)?;
        let _resp = tcti.receive(self.receive_timeout)?;
        Ok(0)
    }

    /// `GetCapability(TPM_CAP_HANDLES, first, ...)`, following `moreData`
    /// across calls, returning every handle the device reports in the
    /// range starting at `first`.
    fn query_handles(&self, first: u32) -> Result<Vec<u32>, TctiError> {
        const MAX_CAP_HANDLES: u32 = 32;
        let mut handles = Vec::new();
        let mut property = first;
        loop {
            let mut buf = Header::emit(TAG_NO_SESSIONS, 0, CommandCode::GET_CAPABILITY.0).to_vec();
            buf.extend_from_slice(&CAP_HANDLES.to_be_bytes());
            buf.extend_from_slice(&property.to_be_bytes());
            buf.extend_from_slice(&MAX_CAP_HANDLES.to_be_bytes());
            let total = buf.len() as u32;
            Header::set_size(&mut buf, total);

            let resp = {
                let mut tcti = self.tcti.lock();
                tcti.transmit(&buf)?;
                tcti.receive(self.receive_timeout)?
            };
            let rc = ResponseCode(Header::code(&resp));
            if !rc.is_success() {
                return Err(TctiError::Receive(rc));
            }

            let body = &resp[HEADER_SIZE..];
            if body.len() < 9 {
                break;
            }
            let more_data = body[0] != 0;
            let capability = u32::from_be_bytes(body[1..5].try_into().unwrap());
            if capability != CAP_HANDLES {
                break;
            }
            let count = u32::from_be_bytes(body[5..9].try_into().unwrap()) as usize;
            let mut offset = 9;
            let mut last = None;
            for _ in 0..count {
                if offset + 4 > body.len() {
                    break;
                }
                let h = u32::from_be_bytes(body[offset..offset + 4].try_into().unwrap());
                handles.push(h);
                last = Some(h);
                offset += 4;
            }
            match (more_data, last) {
                (true, Some(h)) => property = h + 1,
                _ => break,
            }
        }
        Ok(handles)
    }

    /// Flush every transient object and session the device currently
    /// holds, across the active-session, loaded-session, and
    /// transient-object ranges. Called at startup when the operator asks
    /// for a clean slate.
    pub fn flush_all(&self) {
        for &first in &[ACTIVE_SESSION_FIRST, LOADED_SESSION_FIRST, TRANSIENT_FIRST] {
            let handles = match self.query_handles(first) {
                Ok(handles) => handles,
                Err(e) => {
                    tracing::warn!(error = %e, "flush_all: failed to query handle range");
                    continue;
                }
            };
            for h in handles {
                if let Err(e) = self.flush_context(h) {
                    tracing::warn!(handle = %format!("{h:#010x}"), error = %e, "flush_all: failed to flush handle");
                }
            }
        }
    }
}
