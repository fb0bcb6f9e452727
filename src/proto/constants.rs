// Copyright (c) Contributors to the tpm2-abrm project.
// Licensed under the MIT License.

//! TPM 2.0 wire constants: handle ranges, command tags, command codes, and
//! the synthetic response-code layer this broker uses for errors it
//! generates itself rather than forwards from the device.
//!
//! Values follow TPM 2.0 Specification Part 2 ("Structures") unless noted.

/// Number of bits a handle's type byte is shifted by.
pub const HR_SHIFT: u32 = 24;

/// Mask isolating the handle-type byte once shifted into position.
pub const HR_RANGE_MASK: u32 = 0xff00_0000;

/// Handle-type byte for PCR handles.
pub const HT_PCR: u8 = 0x00;
/// Handle-type byte for NV index handles.
pub const HT_NV_INDEX: u8 = 0x01;
/// Handle-type byte for HMAC session handles.
pub const HT_HMAC_SESSION: u8 = 0x02;
/// Handle-type byte for policy session handles.
pub const HT_POLICY_SESSION: u8 = 0x03;
/// Handle-type byte for permanent (reserved) handles.
pub const HT_PERMANENT: u8 = 0x40;
/// Handle-type byte for transient object handles.
pub const HT_TRANSIENT: u8 = 0x80;
/// Handle-type byte for persistent object handles.
pub const HT_PERSISTENT: u8 = 0x81;

/// Base of the transient handle range (`0x8000_0000`).
pub const TRANSIENT_HANDLE_BASE: u32 = (HT_TRANSIENT as u32) << HR_SHIFT;

/// Initial counter value for a fresh `TransientHandleMap`; the first handle
/// issued is `TRANSIENT_HANDLE_BASE | (TRANSIENT_COUNTER_START + 1)` ==
/// `0x8000_00ff`.
pub const TRANSIENT_COUNTER_START: u32 = 0xff;

/// Returns the handle-type byte (upper byte) of a TPM handle.
pub const fn handle_type(handle: u32) -> u8 {
    (handle >> HR_SHIFT) as u8
}

/// True if `handle` falls in the transient object range.
pub const fn is_transient(handle: u32) -> bool {
    handle_type(handle) == HT_TRANSIENT
}

/// True if `handle` falls in either session range (HMAC or policy).
pub const fn is_session(handle: u32) -> bool {
    matches!(handle_type(handle), HT_HMAC_SESSION | HT_POLICY_SESSION)
}

/// `TPM_ST_NO_SESSIONS`: command/response carries no authorisation area.
pub const TAG_NO_SESSIONS: u16 = 0x8001;
/// `TPM_ST_SESSIONS`: command/response carries an authorisation area.
pub const TAG_SESSIONS: u16 = 0x8002;

/// Size in bytes of a TPM 2.0 command/response header.
pub const HEADER_SIZE: usize = 10;

/// Default ceiling on a single command/response buffer, matching the
/// original daemon's `BUF_MAX`.
pub const DEFAULT_MAX_BUFFER_SIZE: usize = 4096;

/// Hard ceiling on a single command/response buffer this broker will ever
/// accept, regardless of configuration.
pub const MAX_BUFFER_SIZE_CEILING: usize = 8192;

/// A TPM command code, represented as an open set of `u32` values so that
/// command codes this broker doesn't recognise still round-trip cleanly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandCode(pub u32);

impl CommandCode {
    pub const STARTUP: CommandCode = CommandCode(0x0000_0144);
    pub const SHUTDOWN: CommandCode = CommandCode(0x0000_0145);
    pub const CONTEXT_LOAD: CommandCode = CommandCode(0x0000_0161);
    pub const CONTEXT_SAVE: CommandCode = CommandCode(0x0000_0162);
    pub const FLUSH_CONTEXT: CommandCode = CommandCode(0x0000_0165);
    pub const LOAD_EXTERNAL: CommandCode = CommandCode(0x0000_0167);
    pub const CREATE_PRIMARY: CommandCode = CommandCode(0x0000_0131);
    pub const LOAD: CommandCode = CommandCode(0x0000_0157);
    pub const START_AUTH_SESSION: CommandCode = CommandCode(0x0000_0176);
    pub const GET_CAPABILITY: CommandCode = CommandCode(0x0000_017a);
}

impl From<u32> for CommandCode {
    fn from(value: u32) -> Self {
        CommandCode(value)
    }
}

impl std::fmt::Display for CommandCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// A TPM response code. Values `>= RESMGR_RC_LAYER` are synthesised by this
/// broker rather than returned by the device, following the
/// `RM_RC(rc) = TSS2_RESMGR_RC_LAYER + rc` layering convention TPM
/// resource managers use to keep their own codes out of the device's
/// response-code space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResponseCode(pub u32);

impl ResponseCode {
    pub const SUCCESS: ResponseCode = ResponseCode(0x0000_0000);
    /// `TPM_RC_CONTEXT_GAP`: the device's context-counter gap window is
    /// full; the resource manager must regap saved sessions and retry.
    pub const CONTEXT_GAP: ResponseCode = ResponseCode(0x0000_0901);
    /// `TPM_RC_HANDLE` for the first handle in the handle area, used when
    /// a `FlushContext` references a handle this broker doesn't manage.
    pub const HANDLE_UNKNOWN: ResponseCode = ResponseCode(0x0000_018b);

    /// Layer identifier this broker uses for its own synthetic codes.
    const RESMGR_RC_LAYER: u32 = 9 << 16;

    pub const OBJECT_MEMORY: ResponseCode =
        ResponseCode(Self::RESMGR_RC_LAYER | 0x0000_0002);
    pub const SESSION_MEMORY: ResponseCode =
        ResponseCode(Self::RESMGR_RC_LAYER | 0x0000_0003);
    pub const NOT_PERMITTED: ResponseCode =
        ResponseCode(Self::RESMGR_RC_LAYER | 0x0000_0004);
    pub const INTERNAL_ERROR: ResponseCode =
        ResponseCode(Self::RESMGR_RC_LAYER | 0x0000_0005);

    pub const fn is_success(self) -> bool {
        self.0 == Self::SUCCESS.0
    }
}

impl From<u32> for ResponseCode {
    fn from(value: u32) -> Self {
        ResponseCode(value)
    }
}

impl std::fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// `TPM_CAP_HANDLES`.
pub const CAP_HANDLES: u32 = 0x0000_0001;
/// `TPM_CAP_TPM_PROPERTIES`.
pub const CAP_TPM_PROPERTIES: u32 = 0x0000_0006;

/// First handle of the active-session range, for
/// `GetCapability(CAP_HANDLES)` queries.
pub const ACTIVE_SESSION_FIRST: u32 = (HT_HMAC_SESSION as u32) << HR_SHIFT;
/// First handle of the loaded-session range.
pub const LOADED_SESSION_FIRST: u32 = (HT_POLICY_SESSION as u32) << HR_SHIFT;
/// First handle of the transient-object range.
pub const TRANSIENT_FIRST: u32 = TRANSIENT_HANDLE_BASE;

/// `TPM_PT_CONTEXT_GAP_MAX`: the property this broker rewrites in
/// `GetCapability` responses to hide its internal regap handling.
pub const PT_CONTEXT_GAP_MAX: u32 = 0x0000_010f;
/// `TPM_PT_MAX_COMMAND_SIZE`.
pub const PT_MAX_COMMAND_SIZE: u32 = 0x0000_0111;
/// `TPM_PT_MAX_RESPONSE_SIZE`.
pub const PT_MAX_RESPONSE_SIZE: u32 = 0x0000_0112;
/// `TPM_PT_TOTAL_COMMANDS`.
pub const PT_TOTAL_COMMANDS: u32 = 0x0000_0120;

static_assertions::const_assert_eq!(TRANSIENT_HANDLE_BASE, 0x8000_0000);
