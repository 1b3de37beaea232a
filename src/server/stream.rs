//! One client's output stream.
//!
//! A [`StreamSession`] walks through
//! `Accepting → StreamingHistory → StreamingLive → Closing → Closed`,
//! yielding one frame per step. The response body owns the session, so when
//! the client goes away hyper drops the body and with it the subscription and
//! the keep-alive timer.

use super::hub::{OutputHub, Subscription};
use super::status::StatusStore;
use crate::protocol::{ConnectedEvent, OutputMessage};
use axum::response::sse::Event;
use futures::Stream;
use std::collections::VecDeque;
use std::convert::Infallible;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Farewell sent to a client whose queue overflowed.
pub const LAGGED_NOTICE: &str = "Stream lagged behind, reconnect to resume";

/// Per-connection stream settings.
#[derive(Debug, Clone, Copy)]
pub struct StreamSettings {
    /// Messages replayed before going live.
    pub history_replay: usize,
    /// Interval between `: ping` comments.
    pub keep_alive: Duration,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            history_replay: 100,
            keep_alive: Duration::from_secs(30),
        }
    }
}

/// A frame before SSE encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// The `connected` control event.
    Connected(ConnectedEvent),
    /// An unnamed `data:` frame carrying an output message.
    Message(OutputMessage),
}

impl Frame {
    /// Encode as an SSE event with a JSON data line.
    pub fn to_event(&self) -> Result<Event, axum::Error> {
        match self {
            Self::Connected(connected) => Event::default().event("connected").json_data(connected),
            Self::Message(message) => Event::default().json_data(message),
        }
    }
}

/// Observable phase of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    Accepting,
    StreamingHistory,
    StreamingLive,
    Closing,
    Closed,
}

enum Phase {
    Accepting {
        connected: ConnectedEvent,
        replay: VecDeque<OutputMessage>,
        subscription: Subscription,
    },
    StreamingHistory {
        replay: VecDeque<OutputMessage>,
        subscription: Subscription,
    },
    StreamingLive {
        subscription: Subscription,
    },
    Closing {
        farewell: Option<OutputMessage>,
    },
    Closed,
}

/// State of one connected stream client.
pub struct StreamSession {
    agent_id: String,
    phase: Phase,
}

impl StreamSession {
    /// Look up the agent status, snapshot history and subscribe.
    pub fn open(
        agent_id: &str,
        hub: &OutputHub,
        status: &dyn StatusStore,
        settings: StreamSettings,
    ) -> Self {
        let record = status.get(agent_id);
        let (history, subscription) = hub.subscribe_with_history(agent_id, settings.history_replay);

        let mut replay = VecDeque::from(history);
        if !record.status.is_active() {
            replay.push_back(OutputMessage::system(format!(
                "Agent {agent_id} is not running. Waiting for it to start..."
            )));
        }

        info!(%agent_id, status = %record.status, replay = replay.len(), "Stream opened");
        Self {
            agent_id: agent_id.to_string(),
            phase: Phase::Accepting {
                connected: ConnectedEvent {
                    status: record.status,
                    job_id: record.job_id,
                },
                replay,
                subscription,
            },
        }
    }

    #[must_use]
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    #[must_use]
    pub const fn phase(&self) -> StreamPhase {
        match self.phase {
            Phase::Accepting { .. } => StreamPhase::Accepting,
            Phase::StreamingHistory { .. } => StreamPhase::StreamingHistory,
            Phase::StreamingLive { .. } => StreamPhase::StreamingLive,
            Phase::Closing { .. } => StreamPhase::Closing,
            Phase::Closed => StreamPhase::Closed,
        }
    }

    /// Stop streaming. The subscription is released now; `farewell`, if any,
    /// is the last frame yielded.
    pub fn close(&mut self, farewell: Option<String>) {
        if matches!(self.phase, Phase::Closed) {
            return;
        }
        self.phase = Phase::Closing {
            farewell: farewell.map(OutputMessage::error),
        };
    }

    /// The next frame, or `None` once closed.
    ///
    /// Cancel safe: dropping the future while waiting for live output loses
    /// nothing.
    pub async fn next_frame(&mut self) -> Option<Frame> {
        loop {
            if let Phase::StreamingLive { subscription } = &mut self.phase {
                if let Some(message) = subscription.recv().await {
                    return Some(Frame::Message(message));
                }
                if subscription.is_lagged() {
                    warn!(agent_id = %self.agent_id, "Stream fell behind live output");
                    self.close(Some(LAGGED_NOTICE.to_string()));
                    continue;
                }
                debug!(agent_id = %self.agent_id, "Subscription ended");
                self.phase = Phase::Closed;
                return None;
            }

            match std::mem::replace(&mut self.phase, Phase::Closed) {
                Phase::Accepting {
                    connected,
                    replay,
                    subscription,
                } => {
                    self.phase = Phase::StreamingHistory {
                        replay,
                        subscription,
                    };
                    return Some(Frame::Connected(connected));
                }
                Phase::StreamingHistory {
                    mut replay,
                    subscription,
                } => {
                    if let Some(message) = replay.pop_front() {
                        self.phase = Phase::StreamingHistory {
                            replay,
                            subscription,
                        };
                        return Some(Frame::Message(message));
                    }
                    self.phase = Phase::StreamingLive { subscription };
                }
                Phase::Closing { farewell } => return farewell.map(Frame::Message),
                Phase::StreamingLive { .. } | Phase::Closed => return None,
            }
        }
    }

    /// The next encoded SSE event, or `None` once closed.
    pub async fn next_event(&mut self) -> Option<Event> {
        loop {
            let frame = self.next_frame().await?;
            match frame.to_event() {
                Ok(event) => return Some(event),
                Err(e) if matches!(self.phase, Phase::Closed) => {
                    // The farewell itself failed; nothing left to say.
                    debug!(agent_id = %self.agent_id, %e, "Dropping farewell frame");
                }
                Err(e) => {
                    warn!(agent_id = %self.agent_id, %e, "Failed to encode frame");
                    self.close(Some(format!("Stream error: {e}")));
                }
            }
        }
    }

    /// Turn the session into an SSE body stream.
    pub fn into_stream(self) -> impl Stream<Item = Result<Event, Infallible>> + Send {
        futures::stream::unfold(self, |mut session| async move {
            session.next_event().await.map(|event| (Ok(event), session))
        })
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        debug!(agent_id = %self.agent_id, "Stream session dropped");
    }
}
