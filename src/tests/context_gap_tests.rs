// Copyright (c) Contributors to the tpm2-abrm project.
// Licensed under the MIT License.

//! S4: a `TPM_RC_CONTEXT_GAP` response is transparently recovered from by
//! regapping every `SAVED_RM` session and retrying exactly once, never
//! surfacing the gap condition to the client.

use crate::pipeline::message::OutboundMessage;
use crate::proto::constants::HEADER_SIZE;
use crate::proto::constants::TAG_NO_SESSIONS;
use crate::proto::Header;
use crate::proto::ResponseCode;
use crate::session::SessionState;
use crate::tests::mocks;

fn unwrap_response(msg: OutboundMessage) -> crate::response::Tpm2Response {
    match msg {
        OutboundMessage::Response { response, .. } => response,
        OutboundMessage::CheckCancel => panic!("unexpected CheckCancel"),
    }
}

fn context_gap_response() -> Vec<u8> {
    Header::emit(TAG_NO_SESSIONS, HEADER_SIZE as u32, ResponseCode::CONTEXT_GAP.0).to_vec()
}

#[test]
fn context_gap_is_recovered_by_regapping_and_retrying_once() {
    let mut h = mocks::Harness::new();

    // Four separate connections, one saved session apiece; each ends up
    // SAVED_RM once its StartAuthSession command finishes post-processing.
    let mut original_blobs = Vec::new();
    for id in 1..=4u64 {
        let conn = h.new_connection(id, crate::handle_map::MAX_ENTRIES_DEFAULT);
        let resp = unwrap_response(h.submit(mocks::start_auth_session_cmd(conn)));
        let handle = resp.handle().unwrap();
        let entry = h.rm.sessions().lookup_by_handle(handle).unwrap();
        assert_eq!(entry.lock().state(), SessionState::SavedRm);
        original_blobs.push(entry.lock().context_rm().to_vec());
    }

    let conn5 = h.new_connection(5, crate::handle_map::MAX_ENTRIES_DEFAULT);
    h.sim.force_next_response(context_gap_response());

    let resp = unwrap_response(h.submit(mocks::start_auth_session_cmd(conn5)));
    assert_eq!(resp.code(), ResponseCode::SUCCESS);
    assert!(resp.has_handle());

    // Regapping reissued ContextSave for every SAVED_RM session, so each
    // one's stored blob changed even though the client never saw the gap.
    let mut unchanged = 0;
    for (id, original) in (1..=4u64).zip(original_blobs) {
        let conn = h.connections.get_by_id(id).unwrap();
        let owned = h.rm.sessions().entries_owned_by(conn.id());
        let entry = owned.first().unwrap();
        if entry.lock().context_rm() == original.as_slice() {
            unchanged += 1;
        }
    }
    assert_eq!(unchanged, 0, "every saved session should have been regapped");
}
