//! The agentcast server.
//!
//! Owns the agent processes, their output buffers and the HTTP endpoint that
//! streams output to clients.

mod agent;
mod buffer;
mod hub;
mod manager;
mod routes;
mod status;
mod stream;

pub use agent::{Agent, STOP_GRACE};
pub use buffer::OutputBuffer;
pub use hub::{OutputHub, SUBSCRIBER_QUEUE, Subscription};
pub use manager::{AgentError, AgentManager};
pub use routes::{ApiError, router, validate_agent_id};
pub use status::{InMemoryStatusStore, StatusRecord, StatusStore};
pub use stream::{Frame, LAGGED_NOTICE, StreamPhase, StreamSession, StreamSettings};

use crate::config::ServerConfig;
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

/// Errors that can occur in the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[source] std::io::Error),
}

/// Shared state handed to every route.
#[derive(Clone)]
pub struct AppState {
    pub hub: OutputHub,
    pub status: Arc<dyn StatusStore>,
    pub manager: Arc<AgentManager>,
    pub settings: StreamSettings,
}

/// The agentcast server.
pub struct Server {
    config: ServerConfig,
    state: AppState,
    shutdown_tx: watch::Sender<bool>,
}

impl Server {
    /// Create a server with an in-memory status store.
    #[must_use]
    pub fn new(config: ServerConfig) -> Self {
        Self::with_status_store(config, Arc::new(InMemoryStatusStore::new()))
    }

    /// Create a server backed by the given status store.
    pub fn with_status_store(config: ServerConfig, status: Arc<dyn StatusStore>) -> Self {
        let hub = OutputHub::new(config.buffer_capacity);
        let manager = Arc::new(AgentManager::new(
            config.agents.clone(),
            hub.clone(),
            Arc::clone(&status),
        ));
        let settings = StreamSettings {
            history_replay: config.history_replay,
            keep_alive: config.keep_alive,
        };
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            state: AppState {
                hub,
                status,
                manager,
                settings,
            },
            shutdown_tx,
        }
    }

    #[must_use]
    pub const fn state(&self) -> &AppState {
        &self.state
    }

    #[must_use]
    pub fn router(&self) -> Router {
        router(self.state.clone())
    }

    /// Bind the configured address and serve until [`Server::shutdown`].
    pub async fn run(&self) -> Result<(), ServerError> {
        let addr = self.config.bind;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until [`Server::shutdown`].
    ///
    /// On shutdown every agent is sent SIGTERM and every open stream is
    /// closed, so graceful shutdown does not wait on idle clients.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        let addr = listener.local_addr().map_err(ServerError::Io)?;
        info!(%addr, agents = self.config.agents.agents.len(), "Server listening");

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let state = self.state.clone();
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                shutdown_rx.wait_for(|stop| *stop).await.ok();
                info!("Shutdown signal received");
                state.manager.stop_all().await;
                state.hub.close_all();
            })
            .await
            .map_err(ServerError::Io)?;

        info!("Server shut down");
        Ok(())
    }

    /// Request server shutdown.
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }
}
