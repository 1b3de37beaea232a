//! Fuzz target for history buffering.
//!
//! Publishes arbitrary output into a small hub and checks the replay bounds
//! and ordering, then runs the same lines through a log view.

#![no_main]

use agentcast::client::LogView;
use agentcast::protocol::{OutputKind, OutputMessage};
use agentcast::server::OutputHub;
use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
struct Input {
    capacity: u8,
    replay: u8,
    lines: Vec<(u8, String)>,
    query: String,
}

fn kind(tag: u8) -> OutputKind {
    match tag % 4 {
        0 => OutputKind::Stdout,
        1 => OutputKind::Stderr,
        2 => OutputKind::System,
        _ => OutputKind::Error,
    }
}

fuzz_target!(|input: Input| {
    let hub = OutputHub::new(usize::from(input.capacity));
    let mut log = LogView::new(usize::from(input.capacity));

    for (tag, line) in &input.lines {
        let message = OutputMessage::new(kind(*tag), line.clone());
        hub.publish("fuzz", message.clone());
        log.push(message);
    }

    let replay = usize::from(input.replay);
    let history = hub.history("fuzz", replay);
    let expected = input
        .lines
        .len()
        .min(usize::from(input.capacity))
        .min(replay);
    assert_eq!(history.len(), expected);

    let tail = &input.lines[input.lines.len() - expected..];
    for (message, (_, line)) in history.iter().zip(tail) {
        assert_eq!(&message.data, line);
    }

    assert!(log.len() <= usize::from(input.capacity));
    let _ = log.search(&input.query);
    let _ = log.export_text();
});
