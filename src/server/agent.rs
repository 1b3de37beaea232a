//! Running agent representation.

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Time between SIGTERM and the follow-up SIGKILL.
pub const STOP_GRACE: Duration = Duration::from_secs(5);

/// A launched agent process.
pub struct Agent {
    /// Catalogue id (e.g., "builder").
    pub id: String,
    /// Display name from the catalogue.
    pub name: String,
    /// Job id of this run (e.g., "rusty-nail-4821").
    pub job_id: String,
    /// Process id, if the process had not already been reaped at spawn.
    pub pid: Option<u32>,
    /// When the agent was started.
    pub started_at: Instant,
    /// Line-oriented stdin channel, drained by the writer task.
    input: mpsc::Sender<String>,
    /// Whether a stop was requested (exit is then not an error).
    pub stop_requested: bool,
    /// When SIGTERM was sent (for tracking the grace period).
    pub sigterm_sent_at: Option<Instant>,
}

impl Agent {
    #[must_use]
    pub fn new(
        id: String,
        name: String,
        job_id: String,
        pid: Option<u32>,
        input: mpsc::Sender<String>,
    ) -> Self {
        Self {
            id,
            name,
            job_id,
            pid,
            started_at: Instant::now(),
            input,
            stop_requested: false,
            sigterm_sent_at: None,
        }
    }

    /// A handle to the agent's input channel.
    #[must_use]
    pub fn input(&self) -> mpsc::Sender<String> {
        self.input.clone()
    }

    /// Send a signal to the process. A process that is already gone is not an
    /// error.
    pub fn signal(&self, sig: Signal) -> Result<(), Errno> {
        let Some(pid) = self.pid.and_then(|p| i32::try_from(p).ok()) else {
            return Ok(());
        };
        match signal::kill(Pid::from_raw(pid), sig) {
            Err(Errno::ESRCH) => Ok(()),
            other => other,
        }
    }

    /// Record that SIGTERM was sent.
    pub fn mark_stopping(&mut self) {
        self.stop_requested = true;
        self.sigterm_sent_at = Some(Instant::now());
    }

    /// Check if SIGKILL should be sent (SIGTERM grace period expired).
    #[must_use]
    pub fn should_sigkill(&self) -> bool {
        self.sigterm_sent_at
            .is_some_and(|sent_at| sent_at.elapsed() >= STOP_GRACE)
    }
}
