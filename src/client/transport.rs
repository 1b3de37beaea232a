//! Event stream transports.
//!
//! A [`Transport`] turns a URL into a stream of [`TransportEvent`]s, the same
//! shape a browser event source reports: open, messages, errors.

use super::stream::StreamError;
use eventsource_stream::{EventStreamError, Eventsource};
use futures::StreamExt;
use futures::future::ready;
use futures::stream::{self, BoxStream};
use reqwest::Url;
use reqwest::header::ACCEPT;
use tracing::{debug, warn};

/// One observation from the underlying connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The connection is established.
    Open,
    /// A data frame. `event` is set for named events.
    Message { event: Option<String>, data: String },
    /// Something went wrong. `closed` means the connection is gone for good.
    Error { closed: bool, message: String },
}

impl TransportEvent {
    /// An unnamed data frame.
    pub fn data(data: impl Into<String>) -> Self {
        Self::Message {
            event: None,
            data: data.into(),
        }
    }

    /// A named event frame.
    pub fn named(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self::Message {
            event: Some(event.into()),
            data: data.into(),
        }
    }

    pub fn closed(message: impl Into<String>) -> Self {
        Self::Error {
            closed: true,
            message: message.into(),
        }
    }
}

pub type TransportStream = BoxStream<'static, TransportEvent>;

/// Opens event stream connections.
///
/// `open` may fail before any I/O happens (e.g. a malformed URL); everything
/// after that is reported through the returned stream. Dropping the stream
/// closes the connection.
pub trait Transport: Send + Sync {
    fn open(&self, url: &str) -> Result<TransportStream, StreamError>;
}

/// Server-sent events over HTTP.
#[derive(Debug, Clone, Default)]
pub struct HttpTransport {
    http: reqwest::Client,
}

impl HttpTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn with_client(http: reqwest::Client) -> Self {
        Self { http }
    }
}

impl Transport for HttpTransport {
    fn open(&self, url: &str) -> Result<TransportStream, StreamError> {
        let url = Url::parse(url).map_err(|e| StreamError::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        debug!(%url, "Opening event stream");

        let request = self.http.get(url).header(ACCEPT, "text/event-stream");
        let events = stream::once(async move { request.send().await })
            .flat_map(|result| -> TransportStream {
                match result.and_then(reqwest::Response::error_for_status) {
                    Ok(response) => {
                        let frames = response.bytes_stream().eventsource().map(|item| match item {
                            Ok(event) => {
                                let name = (!event.event.is_empty() && event.event != "message")
                                    .then_some(event.event);
                                TransportEvent::Message {
                                    event: name,
                                    data: event.data,
                                }
                            }
                            Err(EventStreamError::Transport(e)) => {
                                warn!(%e, "Event stream transport error");
                                TransportEvent::closed(e.to_string())
                            }
                            Err(e) => TransportEvent::Error {
                                closed: false,
                                message: e.to_string(),
                            },
                        });
                        stream::once(ready(TransportEvent::Open))
                            .chain(frames)
                            .chain(stream::once(ready(TransportEvent::closed(
                                "stream ended",
                            ))))
                            .boxed()
                    }
                    Err(e) => stream::once(ready(TransportEvent::closed(e.to_string()))).boxed(),
                }
            })
            .boxed();
        Ok(events)
    }
}
