// Copyright (c) Contributors to the tpm2-abrm project.
// Licensed under the MIT License.

//! TPM 2.0 wire-format building blocks: the header codec and shared
//! constants used by [`crate::command`] and [`crate::response`].

pub mod constants;
pub mod header;

pub use constants::CommandCode;
pub use constants::ResponseCode;
pub use header::Header;
