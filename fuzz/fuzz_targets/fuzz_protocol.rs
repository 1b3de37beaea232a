//! Fuzz target for wire parsing.
//!
//! Arbitrary bytes must not panic when decoded as API bodies or event stream
//! frames, or when checked as an agent id.

#![no_main]

use agentcast::protocol::{ConnectedEvent, OutputMessage, StartRequest, StopRequest};
use agentcast::server::validate_agent_id;
use agentcast::testing::SseFrame;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = serde_json::from_slice::<OutputMessage>(data);
    let _ = serde_json::from_slice::<StartRequest>(data);
    let _ = serde_json::from_slice::<StopRequest>(data);
    let _ = serde_json::from_slice::<ConnectedEvent>(data);

    if let Ok(s) = std::str::from_utf8(data) {
        if let Some(frame) = SseFrame::parse(s) {
            let _ = frame.message();
        }
        if let Ok(id) = validate_agent_id(s) {
            assert!(!id.is_empty());
            assert_eq!(id, id.trim());
        }
    }
});
