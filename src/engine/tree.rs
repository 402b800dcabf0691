// Execution tree - arena of execution nodes for one process instance

//! # Execution Tree
//!
//! [`ExecutionTree`] owns every [`ExecutionNode`] of one process instance in a
//! single arena keyed by [`ExecutionId`]. Parent and child links are ids, so
//! ownership runs in one direction only and a snapshot of the tree is just a
//! clone of the map.
//!
//! ## Structural operations
//!
//! | Operation | Fails with |
//! |---|---|
//! | [`create_child`](ExecutionTree::create_child) | `InvalidTreeOperation` if the parent is not ACTIVE |
//! | [`end`](ExecutionTree::end) | `InvalidTreeOperation` if ENDED or ACTIVE children remain, `SuspendedEntityInteraction` if suspended |
//! | [`move_activity_marker`](ExecutionTree::move_activity_marker) | `InvalidTreeOperation` if ENDED |
//! | [`delete_cascade`](ExecutionTree::delete_cascade) | never guarded; used only for instance deletion |
//!
//! Every operation validates all of its preconditions before it touches the
//! arena, so a failed call leaves the tree exactly as it was.
//!
//! ## Revision counter
//!
//! Each structural change bumps [`revision`](ExecutionTree::revision). The
//! projector compares revisions before and after reading to detect a tree
//! that changed underneath it.
//!
//! The tree does no locking of its own. Callers serialize writers per process
//! instance; `RuntimeService` does so with one mutex per instance.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::engine::suspension::{ensure_permitted, GuardedOperation};
use crate::models::{
    ActivityId, AsyncMarker, Clock, DependentEntityKind, DependentEntityRef, EventType,
    ExecutionEvent, ExecutionId, ExecutionNode, LifecycleState, ProcessDefinitionRef,
    SuspensionState, SystemClock, ValueHandle,
};
use crate::{ProcessEngineError, Result};

fn default_clock() -> Arc<dyn Clock> {
    Arc::new(SystemClock)
}

/// The execution tree of one process instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionTree {
    process_instance_id: Uuid,

    definition: ProcessDefinitionRef,

    business_key: Option<String>,

    root: ExecutionId,

    nodes: HashMap<ExecutionId, ExecutionNode>,

    revision: u64,

    next_sequence: u64,

    created_at: DateTime<Utc>,

    /// Events of the command in progress, drained by the caller
    #[serde(skip)]
    pending_events: Vec<ExecutionEvent>,

    /// Serializer handles no slot refers to any more, drained by the caller
    #[serde(skip)]
    released_handles: Vec<ValueHandle>,

    #[serde(skip, default = "default_clock")]
    clock: Arc<dyn Clock>,
}

impl ExecutionTree {
    /// Start a new process instance: a tree holding only its root scope
    pub fn start(
        definition: ProcessDefinitionRef,
        business_key: Option<String>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let now = clock.now();
        let root_id = ExecutionId::new();
        let root = ExecutionNode::new(root_id, None, true, false, SuspensionState::Active, 0, now);

        let mut nodes = HashMap::new();
        nodes.insert(root_id, root);

        let mut tree = ExecutionTree {
            process_instance_id: root_id.as_uuid(),
            definition,
            business_key,
            root: root_id,
            nodes,
            revision: 1,
            next_sequence: 1,
            created_at: now,
            pending_events: Vec::new(),
            released_handles: Vec::new(),
            clock,
        };
        tree.record(
            root_id,
            EventType::ExecutionCreated { parent: None, is_scope: true, is_concurrent: false },
        );
        debug!(process_instance = %tree.process_instance_id, definition = %tree.definition.id, "started process instance");
        tree
    }

    pub fn process_instance_id(&self) -> Uuid {
        self.process_instance_id
    }

    pub fn definition(&self) -> &ProcessDefinitionRef {
        &self.definition
    }

    pub fn business_key(&self) -> Option<&str> {
        self.business_key.as_deref()
    }

    pub fn root_id(&self) -> ExecutionId {
        self.root
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Replace the clock, e.g. after loading a snapshot
    pub fn set_clock(&mut self, clock: Arc<dyn Clock>) {
        self.clock = clock;
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Whether the process instance itself has ended
    pub fn is_ended(&self) -> bool {
        self.nodes.get(&self.root).map_or(true, |r| r.is_ended())
    }

    /// Suspension state of the process instance (its root)
    pub fn suspension_state(&self) -> SuspensionState {
        self.nodes
            .get(&self.root)
            .map_or(SuspensionState::Active, |r| r.suspension)
    }

    pub fn node(&self, id: &ExecutionId) -> Option<&ExecutionNode> {
        self.nodes.get(id)
    }

    /// Like [`node`](Self::node) but treats a missing id as an error
    pub fn get(&self, id: &ExecutionId) -> Result<&ExecutionNode> {
        self.nodes
            .get(id)
            .ok_or_else(|| ProcessEngineError::ExecutionNotFound { id: id.to_string() })
    }

    pub(crate) fn get_mut(&mut self, id: &ExecutionId) -> Result<&mut ExecutionNode> {
        self.nodes
            .get_mut(id)
            .ok_or_else(|| ProcessEngineError::ExecutionNotFound { id: id.to_string() })
    }

    /// Every node still in the arena (including retained ENDED ones), in
    /// creation order
    pub fn nodes(&self) -> Vec<&ExecutionNode> {
        let mut all: Vec<&ExecutionNode> = self.nodes.values().collect();
        all.sort_by_key(|n| n.sequence);
        all
    }

    /// ACTIVE nodes in creation order
    pub fn active_nodes(&self) -> Vec<&ExecutionNode> {
        self.nodes().into_iter().filter(|n| n.is_active()).collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Ids of `id` and all its descendants, parents before children
    pub fn subtree(&self, id: &ExecutionId) -> Result<Vec<ExecutionId>> {
        self.get(id)?;
        let mut ordered = Vec::new();
        let mut stack = vec![*id];
        while let Some(current) = stack.pop() {
            ordered.push(current);
            if let Some(node) = self.nodes.get(&current) {
                // reversed so the first child is visited first
                stack.extend(node.children.iter().rev().copied());
            }
        }
        Ok(ordered)
    }

    /// Ancestors of `id`, nearest first, excluding `id` itself
    pub fn ancestors(&self, id: &ExecutionId) -> Result<Vec<ExecutionId>> {
        let mut chain = Vec::new();
        let mut current = self.get(id)?.parent;
        while let Some(parent_id) = current {
            chain.push(parent_id);
            current = self.get(&parent_id)?.parent;
        }
        Ok(chain)
    }

    /// The nearest scope at or above `id`, which owns the variables `id` sees
    /// as local.
    pub fn owning_scope(&self, id: &ExecutionId) -> Result<ExecutionId> {
        let mut current = self.get(id)?;
        loop {
            if current.is_scope {
                return Ok(current.id);
            }
            match current.parent {
                Some(parent_id) => current = self.get(&parent_id)?,
                // only reachable through a corrupted snapshot: roots are scopes
                None => {
                    return Err(ProcessEngineError::InvalidTreeOperation {
                        execution: current.id.to_string(),
                        reason: "no scope execution on path to root".to_string(),
                    })
                }
            }
        }
    }

    /// The scopes whose stores `id` can read, nearest first
    pub fn scope_chain(&self, id: &ExecutionId) -> Result<Vec<ExecutionId>> {
        let mut chain = vec![self.owning_scope(id)?];
        for ancestor in self.ancestors(&chain[0])? {
            if self.get(&ancestor)?.is_scope {
                chain.push(ancestor);
            }
        }
        Ok(chain)
    }

    /// Spawn a child execution.
    ///
    /// The child inherits the parent's suspension state, so a branch spawned
    /// inside a suspended subtree is born suspended.
    pub fn create_child(
        &mut self,
        parent: &ExecutionId,
        is_scope: bool,
        is_concurrent: bool,
    ) -> Result<ExecutionId> {
        let parent_node = self.get(parent)?;
        if !parent_node.is_active() {
            return Err(ProcessEngineError::InvalidTreeOperation {
                execution: parent.to_string(),
                reason: "cannot create a child under an ended execution".to_string(),
            });
        }
        let suspension = parent_node.suspension;

        let id = ExecutionId::new();
        let sequence = self.next_sequence;
        let child = ExecutionNode::new(
            id,
            Some(*parent),
            is_scope,
            is_concurrent,
            suspension,
            sequence,
            self.now(),
        );

        self.next_sequence += 1;
        self.nodes.insert(id, child);
        self.get_mut(parent)?.children.push(id);
        self.revision += 1;

        self.record(
            id,
            EventType::ExecutionCreated { parent: Some(*parent), is_scope, is_concurrent },
        );
        debug!(execution = %id, parent = %parent, is_scope, is_concurrent, "created child execution");
        Ok(id)
    }

    /// End an execution whose children have all ended.
    ///
    /// The node stays in the arena as ENDED until [`purge_ended`](Self::purge_ended),
    /// but is detached from its parent immediately.
    pub fn end(&mut self, id: &ExecutionId) -> Result<()> {
        let node = self.get(id)?;
        if node.is_ended() {
            return Err(ProcessEngineError::InvalidTreeOperation {
                execution: id.to_string(),
                reason: "execution has already ended".to_string(),
            });
        }
        ensure_permitted(node, GuardedOperation::EndExecution)?;

        let active_children = node
            .children
            .iter()
            .filter(|c| self.nodes.get(c).map_or(false, |n| n.is_active()))
            .count();
        if active_children > 0 {
            return Err(ProcessEngineError::InvalidTreeOperation {
                execution: id.to_string(),
                reason: format!("{} child execution(s) are still active", active_children),
            });
        }

        self.mark_ended(id)?;
        self.revision += 1;
        debug!(execution = %id, "ended execution");
        Ok(())
    }

    /// Move the activity marker of an ACTIVE execution
    pub fn move_activity_marker(
        &mut self,
        id: &ExecutionId,
        activity: Option<ActivityId>,
        async_marker: Option<AsyncMarker>,
    ) -> Result<()> {
        let node = self.get_mut(id)?;
        if node.is_ended() {
            return Err(ProcessEngineError::InvalidTreeOperation {
                execution: id.to_string(),
                reason: "cannot move the activity marker of an ended execution".to_string(),
            });
        }

        let from = std::mem::replace(&mut node.activity, activity.clone());
        node.async_marker = async_marker;
        self.revision += 1;

        debug!(execution = %id, from = ?from, to = ?activity, marker = ?async_marker, "moved activity marker");
        self.record(*id, EventType::ActivityMarkerMoved { from, to: activity, async_marker });
        Ok(())
    }

    /// End `id` and its whole subtree, deepest first, ignoring suspension.
    ///
    /// This is the bulk removal used when a process instance is deleted;
    /// normal completion goes through [`end`](Self::end). Returns the ended
    /// ids in the order they were ended.
    pub fn delete_cascade(&mut self, id: &ExecutionId) -> Result<Vec<ExecutionId>> {
        let mut order: Vec<ExecutionId> = self
            .subtree(id)?
            .into_iter()
            .filter(|n| self.nodes.get(n).map_or(false, |node| node.is_active()))
            .collect();
        // preorder reversed: every child precedes its parent
        order.reverse();

        for execution in &order {
            self.mark_ended(execution)?;
        }
        if !order.is_empty() {
            self.revision += 1;
        }
        debug!(execution = %id, ended = order.len(), "cascade-deleted subtree");
        Ok(order)
    }

    /// Bind a task, job or external-task lock to an execution
    pub fn attach_dependent(&mut self, id: &ExecutionId, dependent: DependentEntityRef) -> Result<()> {
        let node = self.get_mut(id)?;
        if node.is_ended() {
            return Err(ProcessEngineError::InvalidTreeOperation {
                execution: id.to_string(),
                reason: "cannot attach a dependent entity to an ended execution".to_string(),
            });
        }
        if !node.dependents.contains(&dependent) {
            node.dependents.push(dependent);
        }
        Ok(())
    }

    /// Unbind a dependent entity; returns whether it was bound
    pub fn detach_dependent(
        &mut self,
        id: &ExecutionId,
        kind: DependentEntityKind,
        entity_id: &str,
    ) -> Result<bool> {
        let node = self.get_mut(id)?;
        let before = node.dependents.len();
        node.dependents.retain(|d| !(d.kind == kind && d.id == entity_id));
        Ok(node.dependents.len() != before)
    }

    /// Take the events recorded since the last drain
    pub fn drain_events(&mut self) -> Vec<ExecutionEvent> {
        std::mem::take(&mut self.pending_events)
    }

    /// Drop ENDED nodes that were retained for event ordering.
    ///
    /// The root is never purged, so an ended instance can still be inspected.
    pub fn purge_ended(&mut self) -> usize {
        let root = self.root;
        let purged: Vec<ExecutionId> = self
            .nodes
            .values()
            .filter(|node| node.id != root && node.is_ended())
            .map(|node| node.id)
            .collect();
        for id in &purged {
            if let Some(node) = self.nodes.remove(id) {
                let handles = node
                    .variables
                    .iter()
                    .flat_map(|store| store.iter())
                    .filter_map(|slot| slot.value.value_handle().cloned());
                self.released_handles.extend(handles);
            }
        }
        purged.len()
    }

    /// Drop all transient variables (end of command)
    pub fn clear_transient_variables(&mut self) -> usize {
        let mut cleared = 0;
        for store in self.nodes.values_mut().filter_map(|n| n.variables.as_mut()) {
            let handles: Vec<ValueHandle> = store
                .iter()
                .filter(|slot| slot.transient)
                .filter_map(|slot| slot.value.value_handle().cloned())
                .collect();
            self.released_handles.extend(handles);
            cleared += store.clear_transient();
        }
        cleared
    }

    /// Every serializer handle still referenced by a variable slot
    pub fn value_handles(&self) -> Vec<ValueHandle> {
        self.nodes
            .values()
            .filter_map(|n| n.variables.as_ref())
            .flat_map(|store| store.iter())
            .filter_map(|slot| slot.value.value_handle().cloned())
            .collect()
    }

    /// Take the handles displaced since the last drain; the caller releases
    /// them from the value serializer once the command has committed
    pub fn drain_released_handles(&mut self) -> Vec<ValueHandle> {
        std::mem::take(&mut self.released_handles)
    }

    pub(crate) fn release_handle(&mut self, handle: ValueHandle) {
        self.released_handles.push(handle);
    }

    /// A copy suitable for persistence: no transient variables, no buffered
    /// events
    pub fn snapshot(&self) -> ExecutionTree {
        let mut copy = self.clone();
        copy.pending_events.clear();
        copy.clear_transient_variables();
        copy.released_handles.clear();
        copy
    }

    pub(crate) fn record(&mut self, execution: ExecutionId, event_type: EventType) {
        let event = ExecutionEvent::new(self.process_instance_id, execution, event_type, self.now());
        self.pending_events.push(event);
    }

    pub(crate) fn record_with_actor(
        &mut self,
        execution: ExecutionId,
        event_type: EventType,
        actor: Option<String>,
    ) {
        let event = ExecutionEvent::new(self.process_instance_id, execution, event_type, self.now())
            .with_actor(actor);
        self.pending_events.push(event);
    }

    fn mark_ended(&mut self, id: &ExecutionId) -> Result<()> {
        let now = self.now();
        let node = self.get_mut(id)?;
        node.lifecycle = LifecycleState::Ended;
        node.ended_at = Some(now);
        node.dependents.clear();
        let parent = node.parent;
        let activity = node.activity.clone();

        if let Some(parent_id) = parent {
            if let Some(parent_node) = self.nodes.get_mut(&parent_id) {
                parent_node.children.retain(|c| c != id);
            }
        }
        self.record(*id, EventType::ExecutionEnded { activity });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FixedClock, TypedValue};

    fn tree() -> ExecutionTree {
        ExecutionTree::start(
            ProcessDefinitionRef::new("order", 1),
            Some("order-42".to_string()),
            Arc::new(FixedClock::new(Utc::now())),
        )
    }

    #[test]
    fn test_start_creates_root_scope() {
        let tree = tree();
        let root = tree.get(&tree.root_id()).unwrap();

        assert!(root.is_root());
        assert!(root.is_scope);
        assert!(root.variables.is_some());
        assert_eq!(tree.process_instance_id(), root.id.as_uuid());
        assert_eq!(tree.business_key(), Some("order-42"));
    }

    #[test]
    fn test_create_child_links_both_directions() {
        let mut tree = tree();
        let root = tree.root_id();
        let child = tree.create_child(&root, false, false).unwrap();

        assert_eq!(tree.get(&child).unwrap().parent, Some(root));
        assert_eq!(tree.get(&root).unwrap().children, vec![child]);
        assert_eq!(tree.owning_scope(&child).unwrap(), root);
    }

    #[test]
    fn test_create_child_under_ended_parent_fails() {
        let mut tree = tree();
        let root = tree.root_id();
        let child = tree.create_child(&root, true, false).unwrap();
        tree.end(&child).unwrap();

        let err = tree.create_child(&child, false, false).unwrap_err();
        assert!(matches!(err, ProcessEngineError::InvalidTreeOperation { .. }));
    }

    #[test]
    fn test_end_requires_children_to_end_first() {
        let mut tree = tree();
        let root = tree.root_id();
        let branch = tree.create_child(&root, false, false).unwrap();
        let leaf = tree.create_child(&branch, true, false).unwrap();

        let err = tree.end(&branch).unwrap_err();
        assert!(matches!(err, ProcessEngineError::InvalidTreeOperation { .. }));
        // the failed call left the tree untouched
        assert!(tree.get(&branch).unwrap().is_active());

        tree.end(&leaf).unwrap();
        tree.end(&branch).unwrap();
        assert!(tree.get(&root).unwrap().children.is_empty());
        assert!(tree.get(&branch).unwrap().is_ended());
    }

    #[test]
    fn test_end_twice_fails() {
        let mut tree = tree();
        let root = tree.root_id();
        let child = tree.create_child(&root, false, false).unwrap();
        tree.end(&child).unwrap();

        assert!(matches!(
            tree.end(&child),
            Err(ProcessEngineError::InvalidTreeOperation { .. })
        ));
    }

    #[test]
    fn test_move_activity_marker() {
        let mut tree = tree();
        let root = tree.root_id();
        let revision = tree.revision();

        tree.move_activity_marker(&root, Some(ActivityId::from("review")), Some(AsyncMarker::Before))
            .unwrap();

        let node = tree.get(&root).unwrap();
        assert_eq!(node.activity_id(), Some("review"));
        assert_eq!(node.async_marker, Some(AsyncMarker::Before));
        assert!(tree.revision() > revision);
    }

    #[test]
    fn test_delete_cascade_ends_children_first() {
        let mut tree = tree();
        let root = tree.root_id();
        let a = tree.create_child(&root, true, false).unwrap();
        let b = tree.create_child(&a, false, false).unwrap();

        let order = tree.delete_cascade(&root).unwrap();
        assert_eq!(order, vec![b, a, root]);
        assert!(tree.is_ended());
    }

    #[test]
    fn test_purge_keeps_root_and_active_nodes() {
        let mut tree = tree();
        let root = tree.root_id();
        let a = tree.create_child(&root, false, true).unwrap();
        let b = tree.create_child(&root, false, true).unwrap();
        tree.end(&a).unwrap();

        assert_eq!(tree.purge_ended(), 1);
        assert!(tree.node(&a).is_none());
        assert!(tree.node(&b).is_some());
    }

    #[test]
    fn test_events_are_buffered_in_order() {
        let mut tree = tree();
        let root = tree.root_id();
        let child = tree.create_child(&root, false, false).unwrap();
        tree.end(&child).unwrap();

        let events = tree.drain_events();
        assert_eq!(events.len(), 3);
        assert!(matches!(events[0].event_type, EventType::ExecutionCreated { parent: None, .. }));
        assert!(matches!(events[2].event_type, EventType::ExecutionEnded { .. }));
        assert!(tree.drain_events().is_empty());
    }

    #[test]
    fn test_scope_chain_skips_non_scopes() {
        let mut tree = tree();
        let root = tree.root_id();
        let sub = tree.create_child(&root, true, false).unwrap();
        let plain = tree.create_child(&sub, false, false).unwrap();
        let inner = tree.create_child(&plain, true, false).unwrap();

        assert_eq!(tree.scope_chain(&inner).unwrap(), vec![inner, sub, root]);
        assert_eq!(tree.scope_chain(&plain).unwrap(), vec![sub, root]);
    }

    #[test]
    fn test_snapshot_round_trip_drops_transient_variables() {
        let mut tree = tree();
        let root = tree.root_id();
        tree.set_variable_local(&root, "kept", TypedValue::from(1)).unwrap();
        tree.set_variable_transient(&root, "scratch", TypedValue::from(2)).unwrap();

        let json = serde_json::to_string(&tree.snapshot()).unwrap();
        let restored: ExecutionTree = serde_json::from_str(&json).unwrap();

        assert!(restored.get_variable_local(&root, "kept").unwrap().is_some());
        assert!(restored.get_variable_local(&root, "scratch").unwrap().is_none());
        assert_eq!(restored.revision(), tree.revision());
    }
}
