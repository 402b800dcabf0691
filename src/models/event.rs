// Events emitted while a process instance's tree changes

//! # Execution Events
//!
//! Trees buffer one [`ExecutionEvent`] per observable change and hand them out
//! when the command that caused them finishes. Ended executions stay in the
//! arena until their `ExecutionEnded` event has been drained, so listeners see
//! ends in the order they happened.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::execution::{AsyncMarker, SuspensionState};
use super::ids::{ActivityId, ExecutionId};
use super::variable::ValueType;

/// What happened
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventType {
    ExecutionCreated {
        parent: Option<ExecutionId>,
        is_scope: bool,
        is_concurrent: bool,
    },
    ExecutionEnded {
        activity: Option<ActivityId>,
    },
    ActivityMarkerMoved {
        from: Option<ActivityId>,
        to: Option<ActivityId>,
        async_marker: Option<AsyncMarker>,
    },
    VariableCreated {
        name: String,
        value_type: ValueType,
    },
    VariableUpdated {
        name: String,
        revision: u32,
        previous_type: ValueType,
        value_type: ValueType,
    },
    VariableDeleted {
        name: String,
    },
    SuspensionChanged {
        state: SuspensionState,
        nodes: usize,
    },
    InstanceDeleted {
        reason: Option<String>,
    },
}

/// One change to one execution of one process instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionEvent {
    pub id: Uuid,
    pub process_instance_id: Uuid,
    pub execution_id: ExecutionId,
    pub event_type: EventType,

    /// Who triggered the change, when a management operation knows it
    pub actor: Option<String>,

    pub timestamp: DateTime<Utc>,
}

impl ExecutionEvent {
    pub fn new(
        process_instance_id: Uuid,
        execution_id: ExecutionId,
        event_type: EventType,
        timestamp: DateTime<Utc>,
    ) -> Self {
        ExecutionEvent {
            id: Uuid::new_v4(),
            process_instance_id,
            execution_id,
            event_type,
            actor: None,
            timestamp,
        }
    }

    pub fn with_actor(mut self, actor: Option<String>) -> Self {
        self.actor = actor;
        self
    }
}
