//! Stream client state machine tests against scripted transports.
//!
//! The clock is paused, so backoff delays elapse instantly and exactly.

use agentcast::client::{
    ChannelHandler, ConnectionState, StreamClient, StreamConfig, StreamError, StreamEvent,
    Transport, TransportEvent, TransportStream,
};
use agentcast::protocol::OutputMessage;
use futures::StreamExt;
use futures::channel::mpsc as live;
use futures::stream;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{Instant, timeout};

const WAIT: Duration = Duration::from_secs(120);
const URL: &str = "http://agents.test/agents/a1/stream";

/// What the transport does for one `open` call.
enum Script {
    Fail(StreamError),
    /// Emit the events, then stay open.
    Events(Vec<TransportEvent>),
    /// Emit the events, then end.
    Close(Vec<TransportEvent>),
    /// Forward whatever the test sends.
    Live(live::UnboundedReceiver<TransportEvent>),
}

/// Plays scripts in order; once they run out every open ends immediately.
struct ScriptedTransport {
    scripts: Mutex<VecDeque<Script>>,
    opens: Mutex<Vec<Instant>>,
}

impl ScriptedTransport {
    fn new(scripts: impl IntoIterator<Item = Script>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into_iter().collect()),
            opens: Mutex::new(Vec::new()),
        })
    }

    fn open_count(&self) -> usize {
        self.opens.lock().expect("lock").len()
    }

    fn open_offsets(&self, start: Instant) -> Vec<Duration> {
        self.opens
            .lock()
            .expect("lock")
            .iter()
            .map(|at| at.duration_since(start))
            .collect()
    }
}

impl Transport for ScriptedTransport {
    fn open(&self, _url: &str) -> Result<TransportStream, StreamError> {
        self.opens.lock().expect("lock").push(Instant::now());
        let script = self
            .scripts
            .lock()
            .expect("lock")
            .pop_front()
            .unwrap_or(Script::Close(Vec::new()));
        match script {
            Script::Fail(e) => Err(e),
            Script::Events(events) => Ok(stream::iter(events).chain(stream::pending()).boxed()),
            Script::Close(events) => Ok(stream::iter(events).boxed()),
            Script::Live(rx) => Ok(rx.boxed()),
        }
    }
}

fn spawn(transport: &Arc<ScriptedTransport>) -> (StreamClient, UnboundedReceiver<StreamEvent>) {
    let (handler, events) = ChannelHandler::new();
    let client = StreamClient::spawn(StreamConfig::new(URL), transport.clone(), handler);
    (client, events)
}

fn json(data: &str) -> TransportEvent {
    TransportEvent::data(serde_json::to_string(&OutputMessage::stdout(data)).expect("encode"))
}

async fn wait_for_state(client: &StreamClient, state: ConnectionState) {
    let mut watch = client.watch();
    timeout(WAIT, watch.wait_for(|s| s.state == state))
        .await
        .expect("timeout waiting for state")
        .expect("driver stopped");
}

/// Round-trips a command through the driver so everything queued before it
/// has been handled. Also clears the paused flag.
async fn settle(client: &StreamClient) {
    client.resume().await;
}

fn drain(events: &mut UnboundedReceiver<StreamEvent>) -> Vec<StreamEvent> {
    let mut drained = Vec::new();
    while let Ok(event) = events.try_recv() {
        drained.push(event);
    }
    drained
}

async fn next_message(events: &mut UnboundedReceiver<StreamEvent>) -> String {
    timeout(WAIT, async {
        loop {
            match events.recv().await {
                Some(StreamEvent::Message(message)) => return message.data,
                Some(_) => {}
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timeout waiting for message")
}

#[tokio::test(start_paused = true)]
async fn test_backoff_schedule_until_exhausted() {
    let transport = ScriptedTransport::new(Vec::<Script>::new());
    let (client, mut events) = spawn(&transport);
    let start = Instant::now();

    client.connect();
    wait_for_state(&client, ConnectionState::Error).await;

    let secs: Vec<u64> = transport
        .open_offsets(start)
        .iter()
        .map(Duration::as_secs)
        .collect();
    assert_eq!(secs, vec![0, 1, 3, 7, 15, 31]);

    let status = client.status();
    assert_eq!(status.reconnect_attempts, 5);
    assert!(!status.reconnect_pending);

    settle(&client).await;
    let drained = drain(&mut events);
    assert!(!drained.contains(&StreamEvent::Connected));
    assert_eq!(
        drained.last(),
        Some(&StreamEvent::Error(StreamError::ReconnectExhausted {
            attempts: 5
        }))
    );

    // No further attempts once exhausted.
    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(transport.open_count(), 6);
}

#[tokio::test(start_paused = true)]
async fn test_connect_after_exhaustion_starts_over() {
    let transport = ScriptedTransport::new(Vec::<Script>::new());
    let (client, _events) = spawn(&transport);

    client.connect();
    wait_for_state(&client, ConnectionState::Error).await;
    assert_eq!(transport.open_count(), 6);

    client.connect();
    let mut watch = client.watch();
    timeout(
        WAIT,
        watch.wait_for(|s| s.reconnect_pending && s.reconnect_attempts == 1),
    )
    .await
    .expect("timeout")
    .expect("driver stopped");
    assert_eq!(transport.open_count(), 7);
}

#[tokio::test(start_paused = true)]
async fn test_successful_open_resets_attempts() {
    let transport = ScriptedTransport::new([
        Script::Close(Vec::new()),
        Script::Close(Vec::new()),
        Script::Events(vec![TransportEvent::Open]),
    ]);
    let (client, mut events) = spawn(&transport);
    let start = Instant::now();

    client.connect();
    wait_for_state(&client, ConnectionState::Connected).await;

    let secs: Vec<u64> = transport
        .open_offsets(start)
        .iter()
        .map(Duration::as_secs)
        .collect();
    assert_eq!(secs, vec![0, 1, 3]);
    assert_eq!(client.status().reconnect_attempts, 0);

    settle(&client).await;
    assert!(drain(&mut events).contains(&StreamEvent::Connected));
}

#[tokio::test(start_paused = true)]
async fn test_open_failure_reports_error_then_retries() {
    let transport = ScriptedTransport::new([
        Script::Fail(StreamError::Open("connection refused".into())),
        Script::Events(vec![TransportEvent::Open]),
    ]);
    let (client, mut events) = spawn(&transport);

    client.connect();
    wait_for_state(&client, ConnectionState::Connected).await;
    settle(&client).await;

    assert_eq!(
        drain(&mut events),
        vec![
            StreamEvent::StateChanged(ConnectionState::Connecting),
            StreamEvent::StateChanged(ConnectionState::Error),
            StreamEvent::Error(StreamError::Open("connection refused".into())),
            StreamEvent::StateChanged(ConnectionState::Connecting),
            StreamEvent::StateChanged(ConnectionState::Connected),
            StreamEvent::Connected,
        ]
    );
    assert_eq!(transport.open_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_pause_buffers_and_resume_returns_in_order() {
    let (tx, rx) = live::unbounded();
    let transport = ScriptedTransport::new([Script::Live(rx)]);
    let (client, mut events) = spawn(&transport);

    tx.unbounded_send(TransportEvent::Open).expect("send");
    client.connect();
    wait_for_state(&client, ConnectionState::Connected).await;

    tx.unbounded_send(json("m1")).expect("send");
    assert_eq!(next_message(&mut events).await, "m1");

    client.pause();
    tx.unbounded_send(json("m2")).expect("send");
    tx.unbounded_send(json("m3")).expect("send");

    let mut watch = client.watch();
    timeout(WAIT, watch.wait_for(|s| s.paused && s.buffered == 2))
        .await
        .expect("timeout")
        .expect("driver stopped");
    assert!(
        !drain(&mut events)
            .iter()
            .any(|e| matches!(e, StreamEvent::Message(_)))
    );

    let held: Vec<String> = client
        .resume()
        .await
        .into_iter()
        .map(|m| m.data)
        .collect();
    assert_eq!(held, vec!["m2", "m3"]);
    assert_eq!(client.status().buffered, 0);

    tx.unbounded_send(json("m4")).expect("send");
    assert_eq!(next_message(&mut events).await, "m4");
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_is_idempotent() {
    let (tx, rx) = live::unbounded();
    let transport = ScriptedTransport::new([Script::Live(rx)]);
    let (client, mut events) = spawn(&transport);

    tx.unbounded_send(TransportEvent::Open).expect("send");
    client.connect();
    wait_for_state(&client, ConnectionState::Connected).await;
    settle(&client).await;
    drain(&mut events);

    client.disconnect();
    client.disconnect();
    settle(&client).await;

    assert_eq!(
        drain(&mut events),
        vec![
            StreamEvent::StateChanged(ConnectionState::Disconnected),
            StreamEvent::Disconnected,
            StreamEvent::Disconnected,
        ]
    );
    assert!(tx.is_closed());

    let status = client.status();
    assert_eq!(status.state, ConnectionState::Disconnected);
    assert!(!status.reconnect_pending);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(transport.open_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_connect_cancels_pending_reconnect() {
    let transport = ScriptedTransport::new([
        Script::Close(Vec::new()),
        Script::Events(vec![TransportEvent::Open]),
    ]);
    let (client, _events) = spawn(&transport);

    client.connect();
    let mut watch = client.watch();
    timeout(WAIT, watch.wait_for(|s| s.reconnect_pending))
        .await
        .expect("timeout")
        .expect("driver stopped");

    client.connect();
    wait_for_state(&client, ConnectionState::Connected).await;
    assert!(!client.status().reconnect_pending);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(transport.open_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_connect_while_connected_is_noop() {
    let transport = ScriptedTransport::new([Script::Events(vec![TransportEvent::Open])]);
    let (client, _events) = spawn(&transport);

    client.connect();
    wait_for_state(&client, ConnectionState::Connected).await;
    client.connect();
    settle(&client).await;

    assert_eq!(transport.open_count(), 1);
    assert_eq!(client.state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_non_json_frames_are_ignored() {
    let transport = ScriptedTransport::new([Script::Events(vec![
        TransportEvent::Open,
        TransportEvent::data("not json"),
        TransportEvent::data("{\"type\": 42}"),
        json("valid"),
    ])]);
    let (client, mut events) = spawn(&transport);

    client.connect();
    assert_eq!(next_message(&mut events).await, "valid");
    settle(&client).await;

    assert!(
        !drain(&mut events)
            .iter()
            .any(|e| matches!(e, StreamEvent::Error(_)))
    );
    assert_eq!(client.state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_transient_error_does_not_reconnect() {
    let transport = ScriptedTransport::new([Script::Events(vec![
        TransportEvent::Open,
        TransportEvent::Error {
            closed: false,
            message: "malformed chunk".into(),
        },
    ])]);
    let (client, mut events) = spawn(&transport);

    client.connect();
    wait_for_state(&client, ConnectionState::Error).await;
    settle(&client).await;

    assert!(drain(&mut events).contains(&StreamEvent::Error(StreamError::Transport(
        "malformed chunk".into()
    ))));
    let status = client.status();
    assert_eq!(status.reconnect_attempts, 0);
    assert!(!status.reconnect_pending);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(transport.open_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_closed_error_reconnects_without_on_error() {
    let transport = ScriptedTransport::new([
        Script::Close(vec![
            TransportEvent::Open,
            TransportEvent::closed("connection reset"),
        ]),
        Script::Events(vec![TransportEvent::Open]),
    ]);
    let (client, mut events) = spawn(&transport);

    client.connect();
    let mut watch = client.watch();
    timeout(WAIT, watch.wait_for(|s| s.reconnect_pending))
        .await
        .expect("timeout")
        .expect("driver stopped");
    assert_eq!(client.state(), ConnectionState::Disconnected);

    wait_for_state(&client, ConnectionState::Connected).await;
    settle(&client).await;
    assert!(
        !drain(&mut events)
            .iter()
            .any(|e| matches!(e, StreamEvent::Error(_)))
    );
    assert_eq!(transport.open_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_named_connected_event_marks_connected() {
    let transport = ScriptedTransport::new([Script::Events(vec![
        TransportEvent::named("connected", "{\"status\":\"running\",\"jobId\":\"job-1\"}"),
        TransportEvent::named("heartbeat", "{}"),
        json("after"),
    ])]);
    let (client, mut events) = spawn(&transport);

    client.connect();
    assert_eq!(next_message(&mut events).await, "after");
    assert_eq!(client.state(), ConnectionState::Connected);
}
