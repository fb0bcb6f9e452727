// Copyright (c) Contributors to the tpm2-abrm project.
// Licensed under the MIT License.

//! Error types for the broker, grouped by source. Each is a
//! `thiserror`-derived enum rather than an opaque `anyhow::Error`: callers
//! match on the concrete variant to decide the synthetic response code a
//! client sees and whether its connection survives.

use thiserror::Error;

use crate::proto::ResponseCode;

/// Malformed or out-of-bounds wire data. Always fatal to the connection
/// that produced it.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("buffer too short to contain a TPM header ({len} bytes)")]
    ShortBuffer { len: usize },
    #[error("declared size {size} is smaller than the TPM header")]
    SizeTooSmall { size: u32 },
    #[error("declared size {size} exceeds the maximum buffer size {max}")]
    SizeTooLarge { size: u32, max: usize },
    #[error("handle index {index} is out of bounds for a {count}-handle command")]
    HandleIndexOutOfBounds { index: u8, count: u8 },
    #[error("authorisation area size {declared} overruns the buffer")]
    AuthAreaOverrun { declared: u32 },
    #[error("command code {code:#010x} does not match the expected command")]
    WrongCommandCode { code: u32 },
}

impl ProtocolError {
    pub const fn response_code(self) -> ResponseCode {
        ResponseCode::INTERNAL_ERROR
    }
}

/// A per-connection quota (transient objects or sessions) has been
/// exhausted. The connection remains open; only the offending command
/// fails.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaError {
    #[error("connection has exceeded its transient object limit")]
    TransientObjectLimit,
    #[error("connection has exceeded its session limit")]
    SessionLimit,
}

impl QuotaError {
    pub const fn response_code(self) -> ResponseCode {
        match self {
            QuotaError::TransientObjectLimit => ResponseCode::OBJECT_MEMORY,
            QuotaError::SessionLimit => ResponseCode::SESSION_MEMORY,
        }
    }
}

/// A handle in a command refers to an object or session this broker does
/// not manage for the requesting connection, or a connection attempted to
/// operate on a handle owned by someone else.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum VirtError {
    #[error("virtual handle {handle:#010x} is not known to this connection")]
    UnknownVirtualHandle { handle: u32 },
    #[error("session handle {handle:#010x} is not owned by this connection")]
    ForeignSession { handle: u32 },
    #[error("no HandleMapEntry for transient handle {handle:#010x}")]
    NoEntry { handle: u32 },
}

impl VirtError {
    pub const fn response_code(self) -> ResponseCode {
        ResponseCode::NOT_PERMITTED
    }
}

/// A TCTI transmit/receive call failed. The connection remains open; the
/// device mutex has already been released by the time this is observed.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TctiError {
    #[error("TCTI transmit failed with rc {0}")]
    Transmit(ResponseCode),
    #[error("TCTI receive failed with rc {0}")]
    Receive(ResponseCode),
    #[error("TCTI receive timed out")]
    Timeout,
}

impl TctiError {
    pub const fn response_code(self) -> ResponseCode {
        match self {
            TctiError::Transmit(rc) | TctiError::Receive(rc) => rc,
            TctiError::Timeout => ResponseCode::INTERNAL_ERROR,
        }
    }
}

/// Errors from the IPC front-end boundary (`CreateConnection`, `Cancel`,
/// `SetLocality`).
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcError {
    #[error("connection table is full")]
    ConnectionTableFull,
    #[error("no connection with the given id is owned by the calling process")]
    NotOwner,
    #[error("method not implemented")]
    NotImplemented,
}

/// A condition that should never occur if the broker's invariants hold.
/// Encountering one means continuing would operate on inconsistent state;
/// the process aborts with diagnostics rather than risk corrupting the
/// TPM's resident set.
#[derive(Error, Debug, Clone)]
pub enum FatalError {
    #[error("failed to acquire the TPM access gate mutex: {0}")]
    MutexPoisoned(String),
    #[error("session {handle:#010x} was in unexpected state {state} during connection close")]
    UnexpectedSessionState { handle: u32, state: &'static str },
    #[error("invariant violated: {0}")]
    InvariantViolation(String),
}

/// The union of every error this broker's pipeline can produce while
/// handling a single command. Used internally by the Resource Manager to
/// decide what synthetic response (if any) to emit and whether the
/// connection should be closed.
#[derive(Error, Debug, Clone)]
pub enum BrokerError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Quota(#[from] QuotaError),
    #[error(transparent)]
    Virt(#[from] VirtError),
    #[error(transparent)]
    Tcti(#[from] TctiError),
    #[error(transparent)]
    Fatal(#[from] FatalError),
}

impl BrokerError {
    /// The response code a client should see for this error, or `None` if
    /// the error is fatal to the whole process rather than client-visible.
    pub fn response_code(&self) -> Option<ResponseCode> {
        match self {
            BrokerError::Protocol(e) => Some(e.response_code()),
            BrokerError::Quota(e) => Some(e.response_code()),
            BrokerError::Virt(e) => Some(e.response_code()),
            BrokerError::Tcti(e) => Some(e.response_code()),
            BrokerError::Fatal(_) => None,
        }
    }

    /// Whether the connection that triggered this error should be closed.
    pub fn closes_connection(&self) -> bool {
        matches!(self, BrokerError::Protocol(_) | BrokerError::Fatal(_))
    }
}
