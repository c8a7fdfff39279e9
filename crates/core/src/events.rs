use crate::types::*;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// An event in an execution's event log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub run_id: RunId,
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
}

impl Event {
    pub fn new(run_id: RunId, event_type: EventType) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            run_id,
            timestamp: Utc::now(),
            event_type,
        }
    }
}

/// Types of events emitted while a plan executes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventType {
    // Run lifecycle events
    RunStarted {
        workflow: String,
        nodes: usize,
    },
    RunCompleted {
        duration_ms: u64,
    },
    RunFailed {
        error: String,
        duration_ms: u64,
    },
    RunCancelled {
        reason: String,
    },

    // Node lifecycle events
    NodeScheduled {
        node: NodeId,
        name: String,
        parent: Option<NodeId>,
    },
    NodeStarted {
        node: NodeId,
        name: String,
        category: NodeCategory,
    },
    NodeResolved {
        node: NodeId,
        name: String,
    },
    NodeFailed {
        node: NodeId,
        name: String,
        error: String,
    },

    // Graph growth events
    DynamicExpanded {
        node: NodeId,
        name: String,
        invocations: usize,
        depth: usize,
    },
    BranchSelected {
        node: NodeId,
        conditional: String,
        case: String,
    },
}

/// Event log writer trait
#[async_trait::async_trait]
pub trait EventLog: Send + Sync {
    /// Append an event to the log
    async fn append(&self, event: Event) -> anyhow::Result<()>;

    /// Get all events for a run
    async fn get_run_events(&self, run_id: RunId) -> anyhow::Result<Vec<Event>>;

    /// Get events for a run within a time range
    async fn get_run_events_range(
        &self,
        run_id: RunId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> anyhow::Result<Vec<Event>>;
}

/// Event log kept in memory for the lifetime of the process
#[derive(Default)]
pub struct MemoryEventLog {
    events: RwLock<Vec<Event>>,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.events.read().await.len()
    }
}

#[async_trait::async_trait]
impl EventLog for MemoryEventLog {
    async fn append(&self, event: Event) -> anyhow::Result<()> {
        tracing::trace!(run_id = %event.run_id, "event {:?}", event.event_type);
        self.events.write().await.push(event);
        Ok(())
    }

    async fn get_run_events(&self, run_id: RunId) -> anyhow::Result<Vec<Event>> {
        let events = self.events.read().await;
        Ok(events.iter().filter(|e| e.run_id == run_id).cloned().collect())
    }

    async fn get_run_events_range(
        &self,
        run_id: RunId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> anyhow::Result<Vec<Event>> {
        let all_events = self.get_run_events(run_id).await?;
        Ok(all_events
            .into_iter()
            .filter(|e| e.timestamp >= start && e.timestamp <= end)
            .collect())
    }
}
