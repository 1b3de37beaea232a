//! Test framework for stream scenarios.
//!
//! Runs a real server on an ephemeral port and reads its event stream frame
//! by frame, keep-alive comments included:
//!
//! ```ignore
//! let harness = TestHarness::new().await?;
//! harness.hub().publish("a1", OutputMessage::stdout("hello"));
//!
//! let mut stream = harness.open_stream("a1").await?;
//! let connected = stream.next_frame(Duration::from_secs(5)).await?;
//! assert_eq!(connected.event.as_deref(), Some("connected"));
//! ```

use crate::client::Client;
use crate::config::ServerConfig;
use crate::protocol::{AgentStatus, OutputMessage};
use crate::server::{OutputHub, Server, StatusStore};
use reqwest::StatusCode;
use reqwest::header::ACCEPT;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Errors from the test framework.
#[derive(Debug, Error)]
pub enum TestError {
    #[error("timeout waiting for condition")]
    Timeout,

    #[error("failed to start server: {0}")]
    ServerStart(String),

    #[error("request failed: {0}")]
    RequestFailed(String),

    #[error("stream ended")]
    StreamEnded,
}

/// One parsed event stream frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseFrame {
    /// `event:` field, for named events.
    pub event: Option<String>,
    /// `data:` lines joined with `\n`.
    pub data: Option<String>,
    /// Comment text (`: ping` gives `ping`).
    pub comment: Option<String>,
}

impl SseFrame {
    /// Parse one frame (the text between blank-line separators).
    ///
    /// Returns `None` for a block without any field or comment.
    #[must_use]
    pub fn parse(block: &str) -> Option<Self> {
        let mut frame = Self::default();
        let mut data: Vec<&str> = Vec::new();
        for line in block.lines() {
            if let Some(comment) = line.strip_prefix(':') {
                frame.comment = Some(comment.trim_start().to_string());
                continue;
            }
            let (field, value) = line.split_once(':').unwrap_or((line, ""));
            let value = value.strip_prefix(' ').unwrap_or(value);
            match field {
                "event" => frame.event = Some(value.to_string()),
                "data" => data.push(value),
                _ => {}
            }
        }
        if !data.is_empty() {
            frame.data = Some(data.join("\n"));
        }
        (frame != Self::default()).then_some(frame)
    }

    #[must_use]
    pub fn is_comment(&self) -> bool {
        self.comment.is_some() && self.data.is_none()
    }

    /// Decode the data of an unnamed frame as an output message.
    #[must_use]
    pub fn message(&self) -> Option<OutputMessage> {
        if self.event.is_some() {
            return None;
        }
        serde_json::from_str(self.data.as_deref()?).ok()
    }
}

/// Reads raw frames from an event stream response.
pub struct FrameReader {
    response: reqwest::Response,
    buf: String,
}

impl FrameReader {
    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.response.status()
    }

    /// A response header as text.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.response.headers().get(name)?.to_str().ok()
    }

    /// Wait for the next complete frame.
    pub async fn next_frame(&mut self, timeout: Duration) -> Result<SseFrame, TestError> {
        let deadline = Instant::now() + timeout;
        loop {
            while let Some(end) = self.buf.find("\n\n") {
                let block: String = self.buf.drain(..end + 2).collect();
                if let Some(frame) = SseFrame::parse(&block) {
                    return Ok(frame);
                }
            }
            let chunk = tokio::time::timeout_at(deadline, self.response.chunk())
                .await
                .map_err(|_| TestError::Timeout)?
                .map_err(|e| TestError::RequestFailed(e.to_string()))?;
            match chunk {
                Some(bytes) => self
                    .buf
                    .push_str(&String::from_utf8_lossy(&bytes).replace("\r\n", "\n")),
                None => return Err(TestError::StreamEnded),
            }
        }
    }

    /// Skip keep-alive comments and return the next output message.
    pub async fn next_message(&mut self, timeout: Duration) -> Result<OutputMessage, TestError> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let frame = self.next_frame(remaining).await?;
            if let Some(message) = frame.message() {
                return Ok(message);
            }
        }
    }
}

/// Test harness that manages the server lifecycle.
pub struct TestHarness {
    server: Arc<Server>,
    addr: SocketAddr,
    client: Client,
    http: reqwest::Client,
    server_handle: JoinHandle<()>,
}

impl TestHarness {
    /// Start a server with default settings and an empty catalogue.
    pub async fn new() -> Result<Self, TestError> {
        Self::with_config(ServerConfig::default()).await
    }

    /// Start a server with the given settings. `config.bind` is ignored; the
    /// server listens on an ephemeral localhost port.
    pub async fn with_config(mut config: ServerConfig) -> Result<Self, TestError> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| TestError::ServerStart(e.to_string()))?;
        let addr = listener
            .local_addr()
            .map_err(|e| TestError::ServerStart(e.to_string()))?;
        config.bind = addr;

        let server = Arc::new(Server::new(config));
        let serving = Arc::clone(&server);
        let server_handle = tokio::spawn(async move {
            let _ = serving.serve(listener).await;
        });

        let client = Client::new(&format!("http://{addr}"))
            .map_err(|e| TestError::ServerStart(e.to_string()))?;
        Ok(Self {
            server,
            addr,
            client,
            http: reqwest::Client::new(),
            server_handle,
        })
    }

    #[must_use]
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    #[must_use]
    pub fn hub(&self) -> &OutputHub {
        &self.server.state().hub
    }

    #[must_use]
    pub fn status(&self) -> &dyn StatusStore {
        self.server.state().status.as_ref()
    }

    #[must_use]
    pub const fn client(&self) -> &Client {
        &self.client
    }

    /// Open an agent's event stream. The raw id is put into the path as is.
    pub async fn open_stream(&self, id: &str) -> Result<FrameReader, TestError> {
        let response = self
            .http
            .get(format!("{}/agents/{id}/stream", self.base_url()))
            .header(ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| TestError::RequestFailed(e.to_string()))?;
        Ok(FrameReader {
            response,
            buf: String::new(),
        })
    }

    /// Wait until `agent_id` has exactly `count` live subscribers.
    pub async fn wait_for_subscribers(
        &self,
        agent_id: &str,
        count: usize,
        timeout: Duration,
    ) -> Result<(), TestError> {
        self.wait_until(timeout, || self.hub().subscriber_count(agent_id) == count)
            .await
    }

    /// Wait until the agent reaches `status`.
    pub async fn wait_for_status(
        &self,
        agent_id: &str,
        status: AgentStatus,
        timeout: Duration,
    ) -> Result<(), TestError> {
        self.wait_until(timeout, || self.status().get(agent_id).status == status)
            .await
    }

    async fn wait_until(
        &self,
        timeout: Duration,
        mut condition: impl FnMut() -> bool,
    ) -> Result<(), TestError> {
        let deadline = Instant::now() + timeout;
        let poll_interval = Duration::from_millis(20);

        while Instant::now() < deadline {
            if condition() {
                return Ok(());
            }
            tokio::time::sleep(poll_interval).await;
        }
        if condition() {
            Ok(())
        } else {
            Err(TestError::Timeout)
        }
    }

    /// Shutdown the server gracefully.
    pub async fn shutdown(self) {
        self.server.shutdown();
        let _ = tokio::time::timeout(Duration::from_secs(5), self.server_handle).await;
    }
}
