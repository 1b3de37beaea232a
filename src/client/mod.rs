//! Client for the agentcast HTTP API.
//!
//! [`Client`] wraps the request/response routes; [`StreamClient`] follows an
//! agent's output stream and reconnects on its own.

pub mod log;
pub mod stream;
pub mod transport;

pub use log::{LogEntry, LogFilter, LogView};
pub use stream::{
    ChannelHandler, ClientStatus, ConnectionState, StreamClient, StreamConfig, StreamError,
    StreamEvent, StreamHandler,
};
pub use transport::{HttpTransport, Transport, TransportEvent, TransportStream};

use crate::protocol::{
    AgentInfo, AgentResponse, AgentsResponse, ErrorBody, HistoryResponse, OutputMessage,
    SendInputResponse, StartRequest, StartResponse, StopRequest, StopResponse,
};
use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::debug;

/// Errors that can occur in the client.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid server URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("request failed: {0}")]
    Request(#[source] reqwest::Error),

    #[error("failed to decode response: {0}")]
    Decode(#[source] reqwest::Error),

    #[error("server returned {status}: {message}")]
    Api {
        status: StatusCode,
        code: Option<String>,
        message: String,
    },
}

impl ClientError {
    /// The server's error code, if the server rejected the request.
    #[must_use]
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Api { code, .. } => code.as_deref(),
            _ => None,
        }
    }
}

/// Client for the agentcast server.
#[derive(Debug, Clone)]
pub struct Client {
    base_url: Url,
    http: reqwest::Client,
}

impl Client {
    /// Create a client for the server at `base_url` (e.g. `http://127.0.0.1:7433`).
    pub fn new(base_url: &str) -> Result<Self, ClientError> {
        let parsed = Url::parse(base_url).map_err(|e| ClientError::InvalidUrl {
            url: base_url.to_string(),
            reason: e.to_string(),
        })?;
        if parsed.cannot_be_a_base() {
            return Err(ClientError::InvalidUrl {
                url: base_url.to_string(),
                reason: "not a base URL".into(),
            });
        }
        Ok(Self {
            base_url: parsed,
            http: reqwest::Client::new(),
        })
    }

    #[must_use]
    pub const fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Build a URL from path segments. Segments are percent-encoded.
    pub fn url(&self, segments: &[&str]) -> Result<Url, ClientError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| ClientError::InvalidUrl {
                url: self.base_url.to_string(),
                reason: "not a base URL".into(),
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// URL of an agent's event stream.
    pub fn stream_url(&self, id: &str) -> Result<Url, ClientError> {
        self.url(&["agents", id, "stream"])
    }

    /// Check that the server answers.
    pub async fn health(&self) -> Result<(), ClientError> {
        let response = self
            .http
            .get(self.url(&["health"])?)
            .send()
            .await
            .map_err(ClientError::Request)?;
        decode::<serde_json::Value>(response).await.map(|_| ())
    }

    /// All agents in the catalogue.
    pub async fn list(&self) -> Result<Vec<AgentInfo>, ClientError> {
        let response = self
            .http
            .get(self.url(&["agents"])?)
            .send()
            .await
            .map_err(ClientError::Request)?;
        decode::<AgentsResponse>(response).await.map(|r| r.agents)
    }

    pub async fn get(&self, id: &str) -> Result<AgentInfo, ClientError> {
        let response = self
            .http
            .get(self.url(&["agents", id])?)
            .send()
            .await
            .map_err(ClientError::Request)?;
        decode::<AgentResponse>(response).await.map(|r| r.agent)
    }

    pub async fn start(&self, id: &str, request: &StartRequest) -> Result<StartResponse, ClientError> {
        let response = self
            .http
            .post(self.url(&["agents", id, "start"])?)
            .json(request)
            .send()
            .await
            .map_err(ClientError::Request)?;
        decode(response).await
    }

    pub async fn stop(&self, id: &str, force: bool) -> Result<StopResponse, ClientError> {
        let response = self
            .http
            .post(self.url(&["agents", id, "stop"])?)
            .json(&StopRequest { force })
            .send()
            .await
            .map_err(ClientError::Request)?;
        decode(response).await
    }

    /// Send one input line to a running agent.
    pub async fn send(&self, id: &str, command: &str) -> Result<SendInputResponse, ClientError> {
        debug!(%id, "Sending command");
        let response = self
            .http
            .post(self.stream_url(id)?)
            .json(&serde_json::json!({ "command": command }))
            .send()
            .await
            .map_err(ClientError::Request)?;
        decode(response).await
    }

    /// Buffered output of an agent, oldest first.
    pub async fn history(
        &self,
        id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<OutputMessage>, ClientError> {
        let mut url = self.url(&["agents", id, "output"])?;
        if let Some(limit) = limit {
            url.query_pairs_mut().append_pair("limit", &limit.to_string());
        }
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(ClientError::Request)?;
        decode::<HistoryResponse>(response).await.map(|r| r.messages)
    }

    /// Drop the buffered output of an agent.
    pub async fn clear(&self, id: &str) -> Result<(), ClientError> {
        let response = self
            .http
            .delete(self.url(&["agents", id, "output"])?)
            .send()
            .await
            .map_err(ClientError::Request)?;
        check(response).await.map(|_| ())
    }
}

/// Turn a non-success response into [`ClientError::Api`].
async fn check(response: reqwest::Response) -> Result<reqwest::Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let (code, message) = match serde_json::from_str::<ErrorBody>(&body) {
        Ok(err) => (err.code, err.error),
        Err(_) => (None, body),
    };
    Err(ClientError::Api {
        status,
        code,
        message,
    })
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ClientError> {
    check(response)
        .await?
        .json()
        .await
        .map_err(ClientError::Decode)
}
