// Copyright (c) Contributors to the tpm2-abrm project.
// Licensed under the MIT License.

//! Owned TPM command buffers with cached `TPMA_CC` attributes. Construction
//! is total and fallible; the only mutator is [`Tpm2Command::set_handle`],
//! used during handle-area virtualisation.

use bitfield_struct::bitfield;

use crate::error::ProtocolError;
use crate::proto::constants::HEADER_SIZE;
use crate::proto::CommandCode;
use crate::proto::Header;

/// `TPMA_CC`, the subset of fields this broker inspects: the handle count
/// and the flags governing post-command handle disposition.
#[bitfield(u32)]
pub struct CommandAttributes {
    #[bits(16)]
    pub command_index: u16,
    #[bits(6)]
    _reserved: u8,
    pub nv: bool,
    pub extensive: bool,
    pub flushed: bool,
    #[bits(3)]
    pub c_handles: u8,
    pub r_handle: bool,
    #[bits(3)]
    _reserved2: u8,
}

/// One command buffer, tagged with the connection it came from and the
/// cached attributes used to interpret its handle/auth areas.
#[derive(Debug, Clone)]
pub struct Tpm2Command {
    connection_id: u64,
    bytes: Vec<u8>,
    attrs: CommandAttributes,
}

/// One authorisation entry within a command's authorisation area.
#[derive(Debug, Clone, Copy)]
pub struct AuthEntry {
    /// Byte offset of this authorisation within the buffer.
    pub offset: usize,
    pub session_handle: u32,
    pub continue_session: bool,
}

impl Tpm2Command {
    pub fn new(
        connection_id: u64,
        bytes: Vec<u8>,
        attrs: CommandAttributes,
    ) -> Result<Self, ProtocolError> {
        Header::validate(&bytes)?;
        Ok(Self {
            connection_id,
            bytes,
            attrs,
        })
    }

    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn attrs(&self) -> CommandAttributes {
        self.attrs
    }

    pub fn tag(&self) -> u16 {
        Header::tag(&self.bytes)
    }

    pub fn size(&self) -> u32 {
        Header::size(&self.bytes)
    }

    pub fn code(&self) -> CommandCode {
        CommandCode(Header::code(&self.bytes))
    }

    pub fn has_auths(&self) -> bool {
        self.tag() == crate::proto::constants::TAG_SESSIONS
    }

    pub fn handle_count(&self) -> u8 {
        self.attrs.c_handles()
    }

    fn handle_offset(index: u8) -> usize {
        HEADER_SIZE + (index as usize) * 4
    }

    /// The handle at position `index` within the handle area.
    pub fn handle(&self, index: u8) -> Result<u32, ProtocolError> {
        if index >= self.handle_count() {
            return Err(ProtocolError::HandleIndexOutOfBounds {
                index,
                count: self.handle_count(),
            });
        }
        let off = Self::handle_offset(index);
        if off + 4 > self.bytes.len() {
            return Err(ProtocolError::HandleIndexOutOfBounds {
                index,
                count: self.handle_count(),
            });
        }
        Ok(u32::from_be_bytes(
            self.bytes[off..off + 4].try_into().unwrap(),
        ))
    }

    /// Rewrite the handle at `index` in place. Used to substitute a
    /// physical handle for the client's virtual one before dispatch.
    pub fn set_handle(&mut self, index: u8, handle: u32) -> Result<(), ProtocolError> {
        if index >= self.handle_count() {
            return Err(ProtocolError::HandleIndexOutOfBounds {
                index,
                count: self.handle_count(),
            });
        }
        let off = Self::handle_offset(index);
        if off + 4 > self.bytes.len() {
            return Err(ProtocolError::HandleIndexOutOfBounds {
                index,
                count: self.handle_count(),
            });
        }
        self.bytes[off..off + 4].copy_from_slice(&handle.to_be_bytes());
        Ok(())
    }

    fn handle_area_end(&self) -> usize {
        Self::handle_offset(self.handle_count())
    }

    /// Size in bytes of the authorisation area, read from the 4-byte
    /// length prefix that follows the handle area when [`Self::has_auths`].
    pub fn auths_size(&self) -> Result<u32, ProtocolError> {
        let off = self.handle_area_end();
        if off + 4 > self.bytes.len() {
            return Err(ProtocolError::AuthAreaOverrun { declared: 0 });
        }
        let size = u32::from_be_bytes(self.bytes[off..off + 4].try_into().unwrap());
        if off + 4 + size as usize > self.bytes.len() {
            return Err(ProtocolError::AuthAreaOverrun { declared: size });
        }
        Ok(size)
    }

    /// Iterate over authorisations, invoking `cb` for each one parsed.
    /// Stops cleanly (without error) if an entry's declared sizes would
    /// overrun the declared authorisation area.
    pub fn for_each_auth(&self, mut cb: impl FnMut(AuthEntry)) -> Result<(), ProtocolError> {
        if !self.has_auths() {
            return Ok(());
        }
        let auths_size = self.auths_size()?;
        let area_start = self.handle_area_end() + 4;
        let area_end = area_start + auths_size as usize;
        let mut off = area_start;
        while off < area_end {
            if off + 4 > area_end {
                break;
            }
            let session_handle = u32::from_be_bytes(self.bytes[off..off + 4].try_into().unwrap());
            let mut cursor = off + 4;
            if cursor + 2 > area_end {
                break;
            }
            let nonce_size = u16::from_be_bytes(self.bytes[cursor..cursor + 2].try_into().unwrap());
            cursor += 2 + nonce_size as usize;
            if cursor + 1 > area_end {
                break;
            }
            let session_attrs = self.bytes[cursor];
            cursor += 1;
            if cursor + 2 > area_end {
                break;
            }
            let hmac_size = u16::from_be_bytes(self.bytes[cursor..cursor + 2].try_into().unwrap());
            cursor += 2 + hmac_size as usize;
            if cursor > area_end {
                break;
            }
            cb(AuthEntry {
                offset: off,
                session_handle,
                continue_session: session_attrs & 0x01 != 0,
            });
            off = cursor;
        }
        Ok(())
    }

    fn param_area_start(&self) -> usize {
        if self.has_auths() {
            self.handle_area_end() + 4 + self.auths_size().unwrap_or(0) as usize
        } else {
            self.handle_area_end()
        }
    }

    /// `capability` parameter of a `GetCapability` command. Returns `0` and
    /// logs a warning if this is not a `GetCapability` command.
    pub fn cap(&self) -> u32 {
        self.get_capability_param(0).unwrap_or_else(|| {
            tracing::warn!(code = %self.code(), "cap() called on non-GetCapability command");
            0
        })
    }

    /// `property` parameter of a `GetCapability` command.
    pub fn prop(&self) -> u32 {
        self.get_capability_param(4).unwrap_or_else(|| {
            tracing::warn!(code = %self.code(), "prop() called on non-GetCapability command");
            0
        })
    }

    /// `propertyCount` parameter of a `GetCapability` command.
    pub fn prop_count(&self) -> u32 {
        self.get_capability_param(8).unwrap_or_else(|| {
            tracing::warn!(code = %self.code(), "prop_count() called on non-GetCapability command");
            0
        })
    }

    fn get_capability_param(&self, rel_off: usize) -> Option<u32> {
        if self.code() != CommandCode::GET_CAPABILITY {
            return None;
        }
        let start = self.param_area_start() + rel_off;
        if start + 4 > self.bytes.len() {
            return None;
        }
        Some(u32::from_be_bytes(
            self.bytes[start..start + 4].try_into().unwrap(),
        ))
    }

    /// The handle named in a `FlushContext` command's parameter area (not
    /// the handle area, which `FlushContext` leaves empty).
    pub fn flush_handle(&self) -> Result<u32, ProtocolError> {
        if self.code() != CommandCode::FLUSH_CONTEXT {
            return Err(ProtocolError::WrongCommandCode { code: self.code().0 });
        }
        let start = self.param_area_start();
        if start + 4 > self.bytes.len() {
            return Err(ProtocolError::AuthAreaOverrun { declared: 0 });
        }
        Ok(u32::from_be_bytes(
            self.bytes[start..start + 4].try_into().unwrap(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::constants::TAG_NO_SESSIONS;
    use crate::proto::constants::TAG_SESSIONS;

    fn attrs_with_handles(count: u8) -> CommandAttributes {
        CommandAttributes::new().with_c_handles(count)
    }

    fn flush_context_command(handle: u32) -> Tpm2Command {
        let mut bytes = Header::emit(TAG_NO_SESSIONS, 14, CommandCode::FLUSH_CONTEXT.0).to_vec();
        bytes.extend_from_slice(&handle.to_be_bytes());
        Tpm2Command::new(1, bytes, attrs_with_handles(0)).unwrap()
    }

    #[test]
    fn single_handle_round_trips() {
        let mut bytes = Header::emit(TAG_NO_SESSIONS, 14, 0x157).to_vec();
        bytes.extend_from_slice(&0x8000_00ffu32.to_be_bytes());
        let mut cmd = Tpm2Command::new(1, bytes, attrs_with_handles(1)).unwrap();
        assert_eq!(cmd.handle(0).unwrap(), 0x8000_00ff);
        cmd.set_handle(0, 0x8000_0001).unwrap();
        assert_eq!(cmd.handle(0).unwrap(), 0x8000_0001);
    }

    #[test]
    fn handle_out_of_bounds_is_rejected() {
        let bytes = Header::emit(TAG_NO_SESSIONS, HEADER_SIZE as u32, 0x157).to_vec();
        let cmd = Tpm2Command::new(1, bytes, attrs_with_handles(1)).unwrap();
        assert!(matches!(
            cmd.handle(0),
            Err(ProtocolError::HandleIndexOutOfBounds { .. })
        ));
    }

    #[test]
    fn flush_context_reads_parameter_handle_not_handle_area() {
        let cmd = flush_context_command(0x8000_0005);
        assert_eq!(cmd.flush_handle().unwrap(), 0x8000_0005);
    }

    #[test]
    fn flush_handle_rejects_wrong_command_code() {
        let bytes = Header::emit(TAG_NO_SESSIONS, HEADER_SIZE as u32, 0x145).to_vec();
        let cmd = Tpm2Command::new(1, bytes, attrs_with_handles(0)).unwrap();
        assert!(matches!(
            cmd.flush_handle(),
            Err(ProtocolError::WrongCommandCode { code: 0x145 })
        ));
    }

    #[test]
    fn single_auth_continue_session_bit_is_read() {
        let mut bytes = Header::emit(TAG_SESSIONS, 0, 0x157).to_vec();
        bytes.extend_from_slice(&0x8000_00ffu32.to_be_bytes()); // handle[0]
        let mut auth = Vec::new();
        auth.extend_from_slice(&0x0300_0000u32.to_be_bytes()); // session handle (password)
        auth.extend_from_slice(&0u16.to_be_bytes()); // nonce size
        auth.push(0x01); // attrs: continueSession set
        auth.extend_from_slice(&0u16.to_be_bytes()); // hmac size
        bytes.extend_from_slice(&(auth.len() as u32).to_be_bytes());
        bytes.extend_from_slice(&auth);
        let total = bytes.len() as u32;
        Header::set_size(&mut bytes, total);
        let cmd = Tpm2Command::new(1, bytes, attrs_with_handles(1)).unwrap();
        let mut seen = Vec::new();
        cmd.for_each_auth(|a| seen.push(a)).unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].session_handle, 0x0300_0000);
        assert!(seen[0].continue_session);
    }

    #[test]
    fn auth_iteration_stops_cleanly_on_truncated_entry() {
        let mut bytes = Header::emit(TAG_SESSIONS, 0, 0x157).to_vec();
        bytes.extend_from_slice(&0x8000_00ffu32.to_be_bytes());
        bytes.extend_from_slice(&6u32.to_be_bytes()); // declares 6 bytes, not enough for one entry
        bytes.extend_from_slice(&[0u8; 6]);
        let total = bytes.len() as u32;
        Header::set_size(&mut bytes, total);
        let cmd = Tpm2Command::new(1, bytes, attrs_with_handles(1)).unwrap();
        let mut seen = Vec::new();
        cmd.for_each_auth(|a| seen.push(a)).unwrap();
        assert!(seen.is_empty());
    }

    #[test]
    fn get_capability_params_are_parsed() {
        let mut bytes = Header::emit(TAG_NO_SESSIONS, 0, CommandCode::GET_CAPABILITY.0).to_vec();
        bytes.extend_from_slice(&crate::proto::constants::CAP_TPM_PROPERTIES.to_be_bytes());
        bytes.extend_from_slice(&crate::proto::constants::PT_MAX_COMMAND_SIZE.to_be_bytes());
        bytes.extend_from_slice(&1u32.to_be_bytes());
        let total = bytes.len() as u32;
        Header::set_size(&mut bytes, total);
        let cmd = Tpm2Command::new(1, bytes, attrs_with_handles(0)).unwrap();
        assert_eq!(cmd.cap(), crate::proto::constants::CAP_TPM_PROPERTIES);
        assert_eq!(cmd.prop(), crate::proto::constants::PT_MAX_COMMAND_SIZE);
        assert_eq!(cmd.prop_count(), 1);
    }
}
