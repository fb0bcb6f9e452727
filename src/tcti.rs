// Copyright (c) Contributors to the tpm2-abrm project.
// Licensed under the MIT License.

//! The TCTI (TPM Command Transmission Interface) boundary: a blocking
//! transmit/receive pair the [`crate::access_gate::TpmAccessGate`] drives
//! exactly once per command. No hardware or kernel backend is implemented
//! here; production deployments plug in their own [`Tcti`].

use std::time::Duration;

use crate::error::TctiError;

/// A TPM command transport. Implementations serialise their own access
/// internally if shared; the Access Gate additionally wraps every call in
/// its own mutex, so implementations need not be internally thread-safe
/// beyond `Send`.
pub trait Tcti: Send {
    /// Transmit one complete command buffer.
    fn transmit(&mut self, buf: &[u8]) -> Result<(), TctiError>;

    /// Block for up to `timeout` for one complete response buffer,
    /// returning its bytes.
    fn receive(&mut self, timeout: Duration) -> Result<Vec<u8>, TctiError>;
}
