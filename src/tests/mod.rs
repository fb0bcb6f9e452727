// Copyright (c) Contributors to the tpm2-abrm project.
// Licensed under the MIT License.

//! End-to-end scenario tests driving the Resource Manager directly
//! against an in-process TPM simulator, bypassing the socket-based
//! Command Source and Response Sink stages.

pub mod mocks;

mod framing_tests;
mod context_gap_tests;
