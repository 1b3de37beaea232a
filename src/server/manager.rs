//! Agent manager.
//!
//! Launches catalogue agents as child processes, pipes their stdout/stderr
//! into the [`OutputHub`], forwards input commands to stdin and keeps the
//! [`StatusStore`] in sync with the process lifecycle.

use super::agent::{Agent, STOP_GRACE};
use super::hub::OutputHub;
use super::status::{StatusRecord, StatusStore};
use crate::config::{AgentDefinition, AgentsConfig};
use crate::protocol::{AgentInfo, AgentStatus, OutputKind, OutputMessage, StartRequest};
use chrono::Utc;
use nix::errno::Errno;
use nix::sys::signal::Signal;
use std::collections::HashMap;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Pending input commands per agent.
const INPUT_QUEUE: usize = 64;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent not found: {0}")]
    NotFound(String),

    #[error("agent is disabled: {0}")]
    Disabled(String),

    #[error("missing required environment variable {var} for agent {id}")]
    MissingEnvironment { id: String, var: String },

    #[error("agent is already running: {id}")]
    AlreadyRunning { id: String, job_id: Option<String> },

    #[error("agent is already starting: {0}")]
    AlreadyStarting(String),

    #[error("agent is already stopped: {0}")]
    AlreadyStopped(String),

    #[error("agent is already stopping: {0}")]
    AlreadyStopping(String),

    #[error("agent {0} is not running")]
    NotRunning(String),

    #[error("input queue full for agent {0}")]
    InputQueueFull(String),

    #[error("failed to start agent {id}: {source}")]
    Spawn {
        id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to signal agent {id}: {source}")]
    Signal {
        id: String,
        #[source]
        source: Errno,
    },
}

type RunningAgents = Arc<Mutex<HashMap<String, Agent>>>;

/// Manages all agents of the catalogue.
pub struct AgentManager {
    catalogue: AgentsConfig,
    running: RunningAgents,
    hub: OutputHub,
    status: Arc<dyn StatusStore>,
}

impl AgentManager {
    /// Create a new agent manager.
    pub fn new(catalogue: AgentsConfig, hub: OutputHub, status: Arc<dyn StatusStore>) -> Self {
        Self {
            catalogue,
            running: Arc::new(Mutex::new(HashMap::new())),
            hub,
            status,
        }
    }

    /// Generate a job id for a new run.
    pub fn generate_job_id() -> String {
        names::Generator::with_naming(names::Name::Numbered)
            .next()
            .unwrap_or_else(|| format!("job-{}", Utc::now().timestamp_millis()))
    }

    /// All catalogue agents with their current status.
    pub fn list(&self) -> Vec<AgentInfo> {
        self.catalogue
            .agents
            .iter()
            .map(|(id, definition)| self.describe(id, definition))
            .collect()
    }

    /// One catalogue agent with its current status.
    pub fn get(&self, id: &str) -> Option<AgentInfo> {
        self.catalogue
            .agents
            .get(id)
            .map(|definition| self.describe(id, definition))
    }

    fn describe(&self, id: &str, definition: &AgentDefinition) -> AgentInfo {
        let record = self.status.get(id);
        AgentInfo {
            id: id.to_string(),
            name: definition.name.clone(),
            description: definition.description.clone(),
            enabled: definition.enabled,
            status: record.status,
            command: definition.command.clone(),
            args: definition.args.clone(),
            env_required: definition.env_required.clone(),
            current_job_id: record.job_id,
            started_at: record.started_at,
            last_error: record.last_error,
        }
    }

    /// Launch an agent. Returns the job id of the new run.
    pub async fn start(&self, id: &str, request: StartRequest) -> Result<String, AgentError> {
        let definition = self
            .catalogue
            .agents
            .get(id)
            .ok_or_else(|| AgentError::NotFound(id.to_string()))?;

        if !definition.enabled {
            return Err(AgentError::Disabled(id.to_string()));
        }

        if let Some(var) = definition.env_required.iter().find(|var| {
            !request.environment.contains_key(*var) && std::env::var_os(var).is_none()
        }) {
            return Err(AgentError::MissingEnvironment {
                id: id.to_string(),
                var: var.clone(),
            });
        }

        let mut running = self.running.lock().await;
        let current = self.status.get(id);
        match current.status {
            AgentStatus::Running => {
                return Err(AgentError::AlreadyRunning {
                    id: id.to_string(),
                    job_id: current.job_id,
                });
            }
            AgentStatus::Starting => return Err(AgentError::AlreadyStarting(id.to_string())),
            _ => {}
        }
        if let Some(agent) = running.get(id) {
            // Stop requested but the process has not exited yet.
            return Err(AgentError::AlreadyRunning {
                id: id.to_string(),
                job_id: Some(agent.job_id.clone()),
            });
        }

        self.status.set_status(id, AgentStatus::Starting);

        let mut command = Command::new(&definition.command);
        command
            .args(&definition.args)
            .envs(&request.environment)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = request
            .working_directory
            .as_ref()
            .or(definition.working_directory.as_ref())
        {
            command.current_dir(dir);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(source) => {
                let message = format!("Failed to start agent {}: {source}", definition.name);
                warn!(%id, %source, "Spawn failed");
                self.status.set(id, StatusRecord::failed(message.clone()));
                self.hub.publish(id, OutputMessage::error(message));
                return Err(AgentError::Spawn {
                    id: id.to_string(),
                    source,
                });
            }
        };

        let job_id = Self::generate_job_id();
        let pid = child.id();
        let (input_tx, input_rx) = mpsc::channel(INPUT_QUEUE);

        self.status
            .set(id, StatusRecord::running(job_id.clone(), Utc::now()));
        self.hub.publish(
            id,
            OutputMessage::system(format!(
                "Agent {} started (job {job_id})",
                definition.name
            )),
        );
        info!(%id, %job_id, ?pid, "Started agent");

        if let Some(stdin) = child.stdin.take() {
            tokio::spawn(write_input(id.to_string(), stdin, input_rx));
        }
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(forward_lines(
                self.hub.clone(),
                id.to_string(),
                stdout,
                OutputKind::Stdout,
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(forward_lines(
                self.hub.clone(),
                id.to_string(),
                stderr,
                OutputKind::Stderr,
            )));
        }

        running.insert(
            id.to_string(),
            Agent::new(
                id.to_string(),
                definition.name.clone(),
                job_id.clone(),
                pid,
                input_tx,
            ),
        );

        tokio::spawn(watch_exit(ExitWatch {
            id: id.to_string(),
            name: definition.name.clone(),
            job_id: job_id.clone(),
            child,
            readers,
            running: Arc::clone(&self.running),
            hub: self.hub.clone(),
            status: Arc::clone(&self.status),
        }));

        Ok(job_id)
    }

    /// Stop an agent with SIGTERM (or SIGKILL when `force` is set).
    ///
    /// Without `force`, SIGKILL follows if the process is still alive after
    /// [`STOP_GRACE`].
    pub async fn stop(&self, id: &str, force: bool) -> Result<(), AgentError> {
        if !self.catalogue.agents.contains_key(id) {
            return Err(AgentError::NotFound(id.to_string()));
        }

        let mut running = self.running.lock().await;
        if self.status.get(id).status == AgentStatus::Stopping && !force {
            return Err(AgentError::AlreadyStopping(id.to_string()));
        }
        let Some(agent) = running.get_mut(id) else {
            return Err(AgentError::AlreadyStopped(id.to_string()));
        };

        let sig = if force { Signal::SIGKILL } else { Signal::SIGTERM };
        agent.signal(sig).map_err(|source| AgentError::Signal {
            id: id.to_string(),
            source,
        })?;
        agent.mark_stopping();
        self.status.set_status(id, AgentStatus::Stopping);
        info!(%id, job_id = %agent.job_id, ?sig, "Sent stop signal");

        if !force {
            let running = Arc::clone(&self.running);
            let id = id.to_string();
            let job_id = agent.job_id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(STOP_GRACE).await;
                let running = running.lock().await;
                if let Some(agent) = running.get(&id)
                    && agent.job_id == job_id
                    && agent.should_sigkill()
                {
                    warn!(%id, %job_id, "Agent ignored SIGTERM, sending SIGKILL");
                    agent.signal(Signal::SIGKILL).ok();
                }
            });
        }

        Ok(())
    }

    /// Forward a command line to the agent's stdin.
    ///
    /// Never waits on the agent: a full input queue is an error.
    pub async fn send_input(&self, id: &str, command: String) -> Result<(), AgentError> {
        let input = {
            let running = self.running.lock().await;
            running.get(id).map(Agent::input)
        };
        let Some(input) = input else {
            return Err(AgentError::NotRunning(id.to_string()));
        };
        input.try_send(command).map_err(|e| match e {
            TrySendError::Full(_) => {
                warn!(%id, "Input queue full");
                AgentError::InputQueueFull(id.to_string())
            }
            TrySendError::Closed(_) => AgentError::NotRunning(id.to_string()),
        })?;
        debug!(%id, "Forwarded input");
        Ok(())
    }

    /// Send SIGTERM to every running agent.
    pub async fn stop_all(&self) {
        let mut running = self.running.lock().await;
        for agent in running.values_mut() {
            if let Err(e) = agent.signal(Signal::SIGTERM) {
                warn!(id = %agent.id, %e, "Failed to stop agent");
            }
            agent.mark_stopping();
            self.status.set_status(&agent.id, AgentStatus::Stopping);
        }
    }

    /// Whether a process is currently attached to `id`.
    pub async fn is_running(&self, id: &str) -> bool {
        self.running.lock().await.contains_key(id)
    }
}

/// Publish every line of a child pipe as an output message.
async fn forward_lines<R>(hub: OutputHub, id: String, pipe: R, kind: OutputKind)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(pipe);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&line);
                let text = text.trim_end_matches(['\n', '\r']);
                hub.publish(&id, OutputMessage::new(kind, text));
            }
            Err(e) => {
                warn!(%id, ?kind, %e, "Pipe read error");
                break;
            }
        }
    }
}

/// Drain the input channel into the child's stdin, one line per command.
async fn write_input(id: String, mut stdin: ChildStdin, mut rx: mpsc::Receiver<String>) {
    while let Some(command) = rx.recv().await {
        let mut line = command.into_bytes();
        line.push(b'\n');
        if let Err(e) = stdin.write_all(&line).await {
            warn!(%id, %e, "Failed to write to agent stdin");
            break;
        }
        if let Err(e) = stdin.flush().await {
            warn!(%id, %e, "Failed to flush agent stdin");
            break;
        }
    }
}

struct ExitWatch {
    id: String,
    name: String,
    job_id: String,
    child: Child,
    readers: Vec<JoinHandle<()>>,
    running: RunningAgents,
    hub: OutputHub,
    status: Arc<dyn StatusStore>,
}

fn exit_notice(name: &str, status: ExitStatus) -> String {
    status.code().map_or_else(
        || format!("Agent {name} was terminated by a signal"),
        |code| format!("Agent {name} exited with code {code}"),
    )
}

/// Wait for the process, then record how it ended.
async fn watch_exit(mut watch: ExitWatch) {
    let exit = watch.child.wait().await;
    // Let the readers flush the final lines before the exit notice.
    for reader in watch.readers.drain(..) {
        reader.await.ok();
    }

    let id = watch.id.as_str();
    let mut running = watch.running.lock().await;
    let stop_requested = match running.get(id) {
        Some(agent) if agent.job_id == watch.job_id => {
            let requested = agent.stop_requested;
            running.remove(id);
            requested
        }
        _ => false,
    };

    match exit {
        Ok(status) if status.success() || stop_requested => {
            let notice = exit_notice(&watch.name, status);
            info!(%id, job_id = %watch.job_id, %status, "Agent exited");
            watch.status.set(id, StatusRecord::default());
            watch.hub.publish(id, OutputMessage::system(notice));
        }
        Ok(status) => {
            let notice = exit_notice(&watch.name, status);
            warn!(%id, job_id = %watch.job_id, %status, "Agent failed");
            watch.status.set(id, StatusRecord::failed(notice.clone()));
            watch.hub.publish(id, OutputMessage::error(notice));
        }
        Err(e) => {
            let notice = format!("Failed to wait for agent {}: {e}", watch.name);
            warn!(%id, %e, "Wait failed");
            watch.status.set(id, StatusRecord::failed(notice.clone()));
            watch.hub.publish(id, OutputMessage::error(notice));
        }
    }
}
