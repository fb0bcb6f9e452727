// Copyright (c) Contributors to the tpm2-abrm project.
// Licensed under the MIT License.

//! Owned TPM response buffers, and the synthetic responses this broker
//! fabricates locally (quota failures, virtualised `ContextSave`/
//! `ContextLoad`, `FlushContext` acknowledgements) without round-tripping
//! to the device.

use crate::command::CommandAttributes;
use crate::proto::constants::HEADER_SIZE;
use crate::proto::constants::TAG_NO_SESSIONS;
use crate::proto::CommandCode;
use crate::proto::Header;
use crate::proto::ResponseCode;

/// One response buffer, tagged with the attributes of the command it
/// answers so [`Self::has_handle`] can be evaluated without a second
/// device round-trip.
#[derive(Debug, Clone)]
pub struct Tpm2Response {
    bytes: Vec<u8>,
    attrs: CommandAttributes,
}

impl Tpm2Response {
    pub fn new(bytes: Vec<u8>, attrs: CommandAttributes) -> Self {
        Self { bytes, attrs }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn tag(&self) -> u16 {
        Header::tag(&self.bytes)
    }

    pub fn size(&self) -> u32 {
        Header::size(&self.bytes)
    }

    pub fn code(&self) -> ResponseCode {
        ResponseCode(Header::code(&self.bytes))
    }

    pub fn set_code(&mut self, code: ResponseCode) {
        Header::set_code(&mut self.bytes, code.0);
    }

    /// True iff this response carries a fresh handle in its first four
    /// bytes past the header: the response is larger than header-only,
    /// the TPM reported success, and the command's `rHandle` bit is set.
    pub fn has_handle(&self) -> bool {
        self.code().is_success()
            && self.attrs.r_handle()
            && self.bytes.len() >= HEADER_SIZE + 4
    }

    pub fn handle(&self) -> Option<u32> {
        if !self.has_handle() {
            return None;
        }
        Some(u32::from_be_bytes(
            self.bytes[HEADER_SIZE..HEADER_SIZE + 4].try_into().unwrap(),
        ))
    }

    pub fn set_handle(&mut self, handle: u32) {
        if self.bytes.len() >= HEADER_SIZE + 4 {
            self.bytes[HEADER_SIZE..HEADER_SIZE + 4].copy_from_slice(&handle.to_be_bytes());
        }
    }

    /// Synthesise a bare header-only response carrying `code`, with no
    /// `rHandle` attribute so [`Self::has_handle`] is always false.
    pub fn from_response_code(code: ResponseCode) -> Self {
        let bytes = Header::emit(TAG_NO_SESSIONS, HEADER_SIZE as u32, code.0).to_vec();
        Self {
            bytes,
            attrs: CommandAttributes::new(),
        }
    }

    /// Synthesise a successful `ContextSave` response whose body is the
    /// session's opaque `context_client` blob, the blob the client will
    /// present back on a later `ContextLoad`.
    pub fn synthesize_context_save(context_client: &[u8]) -> Self {
        let mut bytes =
            Header::emit(TAG_NO_SESSIONS, 0, ResponseCode::SUCCESS.0).to_vec();
        bytes.extend_from_slice(context_client);
        let total = bytes.len() as u32;
        Header::set_size(&mut bytes, total);
        Self {
            bytes,
            attrs: CommandAttributes::new(),
        }
    }

    /// Synthesise a successful `ContextLoad` response whose body is the
    /// session's savedHandle, completing a virtualised reclaim without
    /// contacting the TPM.
    pub fn synthesize_context_load(saved_handle: u32) -> Self {
        let mut bytes =
            Header::emit(TAG_NO_SESSIONS, 0, ResponseCode::SUCCESS.0).to_vec();
        bytes.extend_from_slice(&saved_handle.to_be_bytes());
        let total = bytes.len() as u32;
        Header::set_size(&mut bytes, total);
        Self {
            bytes,
            attrs: CommandAttributes::new().with_r_handle(true),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn has_handle_requires_success_and_rhandle_attr_and_body() {
        let mut bytes = Header::emit(TAG_NO_SESSIONS, 14, CommandCode::CREATE_PRIMARY.0).to_vec();
        bytes.extend_from_slice(&0x8000_0000u32.to_be_bytes());
        let attrs = CommandAttributes::new().with_r_handle(true);
        let resp = Tpm2Response::new(bytes, attrs);
        assert!(resp.has_handle());
        assert_eq!(resp.handle(), Some(0x8000_0000));
    }

    #[test]
    fn has_handle_false_on_failure_response() {
        let resp = Tpm2Response::from_response_code(ResponseCode::OBJECT_MEMORY);
        assert!(!resp.has_handle());
        assert_eq!(resp.code(), ResponseCode::OBJECT_MEMORY);
    }

    #[test]
    fn synthesized_context_load_carries_saved_handle() {
        let resp = Tpm2Response::synthesize_context_load(0x0200_0000);
        assert!(resp.has_handle());
        assert_eq!(resp.handle(), Some(0x0200_0000));
        assert_eq!(resp.code(), ResponseCode::SUCCESS);
    }

    #[test]
    fn synthesized_context_save_carries_blob_in_body() {
        let resp = Tpm2Response::synthesize_context_save(&[1, 2, 3, 4]);
        assert_eq!(&resp.bytes()[HEADER_SIZE..], &[1, 2, 3, 4]);
    }
}
