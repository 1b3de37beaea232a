//! Reconnecting stream client.
//!
//! [`StreamClient`] owns one logical subscription to one agent's output
//! stream. A driver task holds the connection state machine:
//!
//! ```text
//! disconnected --connect--> connecting --open--> connected
//!      ^                        |                    |
//!      |                        +--closed--+---------+
//!      |                                   v
//!      +--disconnect--  (any)        disconnected --backoff--> connecting
//!                                          |
//!                                   attempts exhausted --> error
//! ```
//!
//! Commands, transport events and the pending reconnect are multiplexed in a
//! biased `select!`, commands first, so `pause()` applies before the next
//! queued message is handled.

use super::transport::{Transport, TransportEvent, TransportStream};
use crate::protocol::OutputMessage;
use futures::StreamExt;
use std::future::pending;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Sleep;
use tracing::{debug, info, warn};

/// Connection state as seen by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    Connecting,
    Connected,
    #[default]
    Disconnected,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("failed to open stream: {0}")]
    Open(String),

    #[error("invalid stream URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("failed to reconnect after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },
}

/// Where to connect and how hard to retry.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub url: String,
    /// Delay before the first reconnect; doubled for every further attempt.
    pub reconnect_delay: Duration,
    pub max_reconnect_attempts: u32,
}

impl StreamConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_attempts: 5,
        }
    }

    /// Delay before reconnect attempt `attempt` (1-based).
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.reconnect_delay.saturating_mul(factor)
    }
}

/// Callbacks invoked from the driver task. Every method has a no-op default.
pub trait StreamHandler: Send + 'static {
    fn on_message(&mut self, _message: OutputMessage) {}
    fn on_connect(&mut self) {}
    fn on_disconnect(&mut self) {}
    fn on_error(&mut self, _error: &StreamError) {}
    fn on_state_change(&mut self, _state: ConnectionState) {}
}

/// Everything a [`ChannelHandler`] forwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Message(OutputMessage),
    Connected,
    Disconnected,
    Error(StreamError),
    StateChanged(ConnectionState),
}

/// Handler that forwards every callback into a channel.
#[derive(Debug)]
pub struct ChannelHandler {
    tx: mpsc::UnboundedSender<StreamEvent>,
}

impl ChannelHandler {
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<StreamEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn forward(&self, event: StreamEvent) {
        // Receiver gone means nobody is listening any more.
        self.tx.send(event).ok();
    }
}

impl StreamHandler for ChannelHandler {
    fn on_message(&mut self, message: OutputMessage) {
        self.forward(StreamEvent::Message(message));
    }

    fn on_connect(&mut self) {
        self.forward(StreamEvent::Connected);
    }

    fn on_disconnect(&mut self) {
        self.forward(StreamEvent::Disconnected);
    }

    fn on_error(&mut self, error: &StreamError) {
        self.forward(StreamEvent::Error(error.clone()));
    }

    fn on_state_change(&mut self, state: ConnectionState) {
        self.forward(StreamEvent::StateChanged(state));
    }
}

/// Snapshot of the driver's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClientStatus {
    pub state: ConnectionState,
    pub paused: bool,
    pub reconnect_attempts: u32,
    /// Messages held back while paused.
    pub buffered: usize,
    /// Whether a reconnect is scheduled.
    pub reconnect_pending: bool,
}

enum Command {
    Connect,
    Disconnect,
    Pause,
    Resume(oneshot::Sender<Vec<OutputMessage>>),
}

/// A scheduled reconnect. Dropping it cancels it.
struct ReconnectTimer {
    attempt: u32,
    sleep: Pin<Box<Sleep>>,
}

/// The connection state machine.
struct Core<H> {
    config: StreamConfig,
    transport: Arc<dyn Transport>,
    handler: H,
    state: ConnectionState,
    attempts: u32,
    paused: bool,
    buffer: Vec<OutputMessage>,
    stream: Option<TransportStream>,
    reconnect: Option<ReconnectTimer>,
    status_tx: watch::Sender<ClientStatus>,
}

impl<H: StreamHandler> Core<H> {
    fn publish_status(&self) {
        self.status_tx.send_replace(ClientStatus {
            state: self.state,
            paused: self.paused,
            reconnect_attempts: self.attempts,
            buffered: self.buffer.len(),
            reconnect_pending: self.reconnect.is_some(),
        });
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state == state {
            return;
        }
        debug!(from = ?self.state, to = ?state, "Connection state change");
        self.state = state;
        self.handler.on_state_change(state);
        self.publish_status();
    }

    fn apply(&mut self, command: Command) {
        match command {
            Command::Connect => self.connect(),
            Command::Disconnect => self.disconnect(),
            Command::Pause => {
                self.paused = true;
                self.publish_status();
            }
            Command::Resume(reply) => {
                self.paused = false;
                let buffered = std::mem::take(&mut self.buffer);
                self.publish_status();
                reply.send(buffered).ok();
            }
        }
    }

    fn connect(&mut self) {
        let live = matches!(
            self.state,
            ConnectionState::Connected | ConnectionState::Connecting
        );
        if live && self.stream.is_some() {
            return;
        }
        self.reconnect = None;
        self.attempts = 0;
        info!(url = %self.config.url, "Connecting");
        self.open();
    }

    fn open(&mut self) {
        self.stream = None;
        self.set_state(ConnectionState::Connecting);
        match self.transport.open(&self.config.url) {
            Ok(stream) => {
                self.stream = Some(stream);
                self.publish_status();
            }
            Err(e) => {
                warn!(url = %self.config.url, %e, "Failed to open stream");
                self.set_state(ConnectionState::Error);
                self.handler.on_error(&e);
                self.schedule_reconnect();
            }
        }
    }

    fn disconnect(&mut self) {
        self.reconnect = None;
        self.stream = None;
        self.attempts = 0;
        self.set_state(ConnectionState::Disconnected);
        self.handler.on_disconnect();
        self.publish_status();
    }

    fn handle(&mut self, event: Option<TransportEvent>) {
        match event {
            Some(TransportEvent::Open) => {
                info!(url = %self.config.url, "Connected");
                self.attempts = 0;
                self.set_state(ConnectionState::Connected);
                self.handler.on_connect();
                self.publish_status();
            }
            Some(TransportEvent::Message { event: Some(name), .. }) if name == "connected" => {
                self.set_state(ConnectionState::Connected);
            }
            Some(TransportEvent::Message { event: Some(name), .. }) => {
                debug!(%name, "Ignoring named event");
            }
            Some(TransportEvent::Message { event: None, data }) => {
                match serde_json::from_str::<OutputMessage>(&data) {
                    Ok(message) if self.paused => {
                        self.buffer.push(message);
                        self.publish_status();
                    }
                    Ok(message) => self.handler.on_message(message),
                    Err(e) => debug!(%e, "Ignoring non-JSON frame"),
                }
            }
            Some(TransportEvent::Error {
                closed: false,
                message,
            }) => {
                warn!(%message, "Stream error");
                self.set_state(ConnectionState::Error);
                self.handler.on_error(&StreamError::Transport(message));
            }
            Some(TransportEvent::Error {
                closed: true,
                message,
            }) => self.closed(&message),
            None => self.closed("stream ended"),
        }
    }

    fn closed(&mut self, reason: &str) {
        info!(%reason, "Connection closed");
        self.stream = None;
        self.set_state(ConnectionState::Disconnected);
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        if self.attempts < self.config.max_reconnect_attempts {
            self.attempts += 1;
            let delay = self.config.backoff(self.attempts);
            info!(attempt = self.attempts, ?delay, "Scheduling reconnect");
            self.reconnect = Some(ReconnectTimer {
                attempt: self.attempts,
                sleep: Box::pin(tokio::time::sleep(delay)),
            });
        } else {
            warn!(attempts = self.attempts, "Giving up on reconnecting");
            self.reconnect = None;
            self.set_state(ConnectionState::Error);
            self.handler.on_error(&StreamError::ReconnectExhausted {
                attempts: self.attempts,
            });
        }
        self.publish_status();
    }

    fn reconnect_due(&mut self) {
        if let Some(timer) = self.reconnect.take() {
            debug!(attempt = timer.attempt, "Reconnecting");
        }
        self.open();
    }
}

async fn next_event(stream: &mut Option<TransportStream>) -> Option<TransportEvent> {
    match stream {
        Some(stream) => stream.next().await,
        None => pending().await,
    }
}

async fn timer_elapsed(timer: &mut Option<ReconnectTimer>) {
    match timer {
        Some(timer) => timer.sleep.as_mut().await,
        None => pending().await,
    }
}

async fn drive<H: StreamHandler>(mut core: Core<H>, mut commands: mpsc::UnboundedReceiver<Command>) {
    loop {
        tokio::select! {
            biased;
            command = commands.recv() => match command {
                Some(command) => core.apply(command),
                None => break,
            },
            event = next_event(&mut core.stream) => core.handle(event),
            () = timer_elapsed(&mut core.reconnect) => core.reconnect_due(),
        }
    }
    debug!(url = %core.config.url, "Stream client stopped");
}

/// Handle to a running stream client.
///
/// Dropping the handle stops the driver and closes the connection.
pub struct StreamClient {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<ClientStatus>,
    task: JoinHandle<()>,
}

impl StreamClient {
    /// Start a client in the `disconnected` state. Call [`connect`](Self::connect)
    /// to open the stream.
    pub fn spawn<H: StreamHandler>(
        config: StreamConfig,
        transport: Arc<dyn Transport>,
        handler: H,
    ) -> Self {
        let (status_tx, status) = watch::channel(ClientStatus::default());
        let (commands, command_rx) = mpsc::unbounded_channel();
        let core = Core {
            config,
            transport,
            handler,
            state: ConnectionState::Disconnected,
            attempts: 0,
            paused: false,
            buffer: Vec::new(),
            stream: None,
            reconnect: None,
            status_tx,
        };
        let task = tokio::spawn(drive(core, command_rx));
        Self {
            commands,
            status,
            task,
        }
    }

    fn send(&self, command: Command) {
        // Fails only after the driver stopped, when there is nothing to do.
        self.commands.send(command).ok();
    }

    /// Open the stream. No-op while connected or connecting.
    pub fn connect(&self) {
        self.send(Command::Connect);
    }

    /// Close the stream and cancel any pending reconnect.
    pub fn disconnect(&self) {
        self.send(Command::Disconnect);
    }

    /// Hold back incoming messages until [`resume`](Self::resume).
    pub fn pause(&self) {
        self.send(Command::Pause);
    }

    /// Stop holding back messages and take the ones held so far, in arrival
    /// order.
    pub async fn resume(&self) -> Vec<OutputMessage> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Resume(tx));
        rx.await.unwrap_or_default()
    }

    #[must_use]
    pub fn status(&self) -> ClientStatus {
        *self.status.borrow()
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.status().state
    }

    /// Subscribe to status changes.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<ClientStatus> {
        self.status.clone()
    }
}

impl Drop for StreamClient {
    fn drop(&mut self) {
        self.task.abort();
    }
}
