// Execution node - one node of the physical process-instance tree

//! # Execution Nodes
//!
//! An [`ExecutionNode`] is the unit of the execution tree. The tree of one
//! process instance is an arena of nodes keyed by [`ExecutionId`]; nodes only
//! ever refer to each other by id:
//!
//! - a child stores its parent's id
//! - a parent stores the ordered ids of its children
//!
//! Each node carries two independent state machines:
//!
//! ```text
//! lifecycle:   ACTIVE ──end──> ENDED
//! suspension:  ACTIVE <──suspend/activate──> SUSPENDED
//! ```
//!
//! A suspended node is still lifecycle-ACTIVE; it merely refuses
//! lifecycle-affecting operations until it is activated again.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::dependent::{DependentEntityKind, DependentEntityRef};
use super::ids::{ActivityId, ExecutionId};
use super::variable::VariableStore;

/// Whether an execution is still part of the tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleState {
    Active,
    Ended,
}

/// Whether an execution accepts lifecycle-affecting operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SuspensionState {
    Active,
    Suspended,
}

impl SuspensionState {
    pub fn is_suspended(&self) -> bool {
        matches!(self, SuspensionState::Suspended)
    }
}

impl std::fmt::Display for SuspensionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SuspensionState::Active => f.write_str("active"),
            SuspensionState::Suspended => f.write_str("suspended"),
        }
    }
}

/// Async continuation an execution is currently waiting in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AsyncMarker {
    /// About to execute the activity
    Before,
    /// About to leave the activity
    After,
}

/// One node of the execution tree
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionNode {
    pub id: ExecutionId,

    /// `None` only for the root of a process instance
    pub parent: Option<ExecutionId>,

    /// Child ids in creation order
    pub children: Vec<ExecutionId>,

    /// Scopes own a variable store; non-scopes delegate to their nearest scope
    pub is_scope: bool,

    /// One of several parallel siblings under a shared non-scope parent
    pub is_concurrent: bool,

    /// Model element this node is currently at
    pub activity: Option<ActivityId>,

    pub async_marker: Option<AsyncMarker>,

    pub lifecycle: LifecycleState,

    pub suspension: SuspensionState,

    /// Set on the node a suspend was requested for, not on inherited nodes
    #[serde(default)]
    pub suspended_directly: bool,

    /// False while dependent-entity callbacks for the current suspension
    /// state have not all succeeded
    #[serde(default = "default_true")]
    pub dependents_synced: bool,

    /// Tasks, jobs and external-task locks bound to this node
    #[serde(default)]
    pub dependents: Vec<DependentEntityRef>,

    /// Present exactly when `is_scope` is true
    pub variables: Option<VariableStore>,

    /// Position in the tree's creation order, used for deterministic ordering
    pub sequence: u64,

    pub created_at: DateTime<Utc>,

    pub ended_at: Option<DateTime<Utc>>,
}

fn default_true() -> bool {
    true
}

impl ExecutionNode {
    pub(crate) fn new(
        id: ExecutionId,
        parent: Option<ExecutionId>,
        is_scope: bool,
        is_concurrent: bool,
        suspension: SuspensionState,
        sequence: u64,
        now: DateTime<Utc>,
    ) -> Self {
        ExecutionNode {
            id,
            parent,
            children: Vec::new(),
            is_scope,
            is_concurrent,
            activity: None,
            async_marker: None,
            lifecycle: LifecycleState::Active,
            suspension,
            suspended_directly: false,
            dependents_synced: true,
            dependents: Vec::new(),
            variables: if is_scope { Some(VariableStore::new()) } else { None },
            sequence,
            created_at: now,
            ended_at: None,
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn is_active(&self) -> bool {
        self.lifecycle == LifecycleState::Active
    }

    pub fn is_ended(&self) -> bool {
        self.lifecycle == LifecycleState::Ended
    }

    pub fn is_suspended(&self) -> bool {
        self.suspension.is_suspended()
    }

    /// Whether this node currently represents a transition rather than a
    /// settled activity
    pub fn is_transitioning(&self) -> bool {
        self.async_marker.is_some()
    }

    pub fn activity_id(&self) -> Option<&str> {
        self.activity.as_ref().map(|a| a.as_str())
    }

    /// Whether any dependent entity of `kind` is bound to this node
    pub fn has_dependents_of(&self, kind: DependentEntityKind) -> bool {
        self.dependents.iter().any(|d| d.kind == kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_nodes_own_a_store() {
        let now = Utc::now();
        let scope = ExecutionNode::new(ExecutionId::new(), None, true, false, SuspensionState::Active, 0, now);
        let plain = ExecutionNode::new(
            ExecutionId::new(),
            Some(scope.id),
            false,
            true,
            SuspensionState::Active,
            1,
            now,
        );

        assert!(scope.variables.is_some());
        assert!(plain.variables.is_none());
        assert!(scope.is_root());
        assert!(!plain.is_root());
    }

    #[test]
    fn test_dependents_lookup_by_kind() {
        let mut node = ExecutionNode::new(ExecutionId::new(), None, true, false, SuspensionState::Active, 0, Utc::now());
        node.dependents.push(DependentEntityRef::task("t1"));

        assert!(node.has_dependents_of(DependentEntityKind::Task));
        assert!(!node.has_dependents_of(DependentEntityKind::Job));
    }
}
