// Copyright (c) Contributors to the tpm2-abrm project.
// Licensed under the MIT License.

//! S1: a header-only command with no handles round-trips through the
//! pipeline untouched.

use crate::pipeline::message::OutboundMessage;
use crate::proto::ResponseCode;
use crate::tests::mocks;

#[test]
fn shutdown_round_trips_with_no_virtualization() {
    let mut h = mocks::Harness::new();
    let conn = h.new_connection(1, crate::handle_map::MAX_ENTRIES_DEFAULT);

    let reply = h.submit(mocks::shutdown_cmd(conn));
    let OutboundMessage::Response { connection_id, response } = reply else {
        panic!("expected a Response message");
    };
    assert_eq!(connection_id, conn);
    assert_eq!(response.code(), ResponseCode::SUCCESS);
    assert!(!response.has_handle());
}
