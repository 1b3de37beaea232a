//! Agent status lookup.
//!
//! The stream endpoint and the agent manager share status through the
//! [`StatusStore`] trait so a deployment can swap the in-process map for an
//! external store.

use crate::protocol::AgentStatus;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

/// Current run state of one agent.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StatusRecord {
    pub status: AgentStatus,
    pub job_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl StatusRecord {
    #[must_use]
    pub fn running(job_id: String, started_at: DateTime<Utc>) -> Self {
        Self {
            status: AgentStatus::Running,
            job_id: Some(job_id),
            started_at: Some(started_at),
            last_error: None,
        }
    }

    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: AgentStatus::Error,
            last_error: Some(message.into()),
            ..Self::default()
        }
    }
}

/// Status storage keyed by agent id.
pub trait StatusStore: Send + Sync {
    /// Status of an agent; unknown agents are `Stopped`.
    fn get(&self, agent_id: &str) -> StatusRecord;

    fn set(&self, agent_id: &str, record: StatusRecord);

    /// Change only the status field, keeping job and error details.
    fn set_status(&self, agent_id: &str, status: AgentStatus) {
        let mut record = self.get(agent_id);
        record.status = status;
        self.set(agent_id, record);
    }
}

/// Process-local status map. Lost on restart.
#[derive(Debug, Default)]
pub struct InMemoryStatusStore {
    records: RwLock<HashMap<String, StatusRecord>>,
}

impl InMemoryStatusStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl StatusStore for InMemoryStatusStore {
    fn get(&self, agent_id: &str) -> StatusRecord {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(agent_id)
            .cloned()
            .unwrap_or_default()
    }

    fn set(&self, agent_id: &str, record: StatusRecord) {
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(agent_id.to_string(), record);
    }
}
