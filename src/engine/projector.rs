// Instance tree projector - builds the activity instance tree from executions

//! # Activity Instance Projection
//!
//! [`InstanceTreeProjector::project`] walks the execution tree of one process
//! instance and compacts it into an [`ActivityInstanceTree`]:
//!
//! | Execution | Projected as |
//! |---|---|
//! | root | the process-level activity instance (id = process instance id) |
//! | carries an async marker | a [`TransitionInstance`] under the enclosing activity instance |
//! | scope with an activity | an activity instance; its children project underneath it |
//! | non-scope with an activity | a leaf activity instance; its children stay at the current level |
//! | no activity (concurrency only) | merged into the enclosing instance's `execution_ids` |
//!
//! Concurrent siblings each get their own instance, even when they sit at
//! the same activity, and children are visited in creation order.
//!
//! ## Reading a tree that may change
//!
//! The projector never holds the tree for the whole walk. It reads through a
//! [`TreeSnapshotSource`], one node at a time, and every read reports the
//! revision it saw. If the revision moves, a child is missing, a child points
//! at a different parent, or an ENDED node is still linked, the projection is
//! abandoned with `InconsistentTreeSnapshot`. Callers retry by projecting
//! again; a partial result is never returned.

use std::sync::{Arc, RwLock};

use tracing::{debug, warn};
use uuid::Uuid;

use crate::engine::tree::ExecutionTree;
use crate::models::{
    ActivityId, ActivityInstance, ActivityInstanceTree, AsyncMarker, ExecutionId, TransitionInstance,
};
use crate::{ProcessEngineError, Result};

/// Tree-level facts read once at the start of a projection
#[derive(Debug, Clone, PartialEq)]
pub struct TreeHeader {
    pub process_instance_id: Uuid,
    pub definition_id: String,
    pub root: ExecutionId,
    pub revision: u64,
}

/// The parts of one execution the projector needs, copied out of the tree
#[derive(Debug, Clone, PartialEq)]
pub struct NodeView {
    pub id: ExecutionId,
    pub parent: Option<ExecutionId>,
    pub children: Vec<ExecutionId>,
    pub is_scope: bool,
    pub is_concurrent: bool,
    pub activity: Option<ActivityId>,
    pub async_marker: Option<AsyncMarker>,
    pub ended: bool,
}

/// Something the projector can read an execution tree from
pub trait TreeSnapshotSource {
    fn header(&self) -> Result<TreeHeader>;

    /// Read one node, together with the tree revision at the time of the read
    fn read_node(&self, id: &ExecutionId) -> Result<(u64, Option<NodeView>)>;
}

fn view_of(tree: &ExecutionTree, id: &ExecutionId) -> Option<NodeView> {
    tree.node(id).map(|n| NodeView {
        id: n.id,
        parent: n.parent,
        children: n.children.clone(),
        is_scope: n.is_scope,
        is_concurrent: n.is_concurrent,
        activity: n.activity.clone(),
        async_marker: n.async_marker,
        ended: n.is_ended(),
    })
}

fn header_of(tree: &ExecutionTree) -> TreeHeader {
    TreeHeader {
        process_instance_id: tree.process_instance_id(),
        definition_id: tree.definition().id.clone(),
        root: tree.root_id(),
        revision: tree.revision(),
    }
}

impl TreeSnapshotSource for ExecutionTree {
    fn header(&self) -> Result<TreeHeader> {
        Ok(header_of(self))
    }

    fn read_node(&self, id: &ExecutionId) -> Result<(u64, Option<NodeView>)> {
        Ok((self.revision(), view_of(self, id)))
    }
}

/// An execution tree shared between a writer and concurrent readers
#[derive(Debug, Clone)]
pub struct SharedExecutionTree {
    inner: Arc<RwLock<ExecutionTree>>,
}

impl SharedExecutionTree {
    pub fn new(tree: ExecutionTree) -> Self {
        SharedExecutionTree { inner: Arc::new(RwLock::new(tree)) }
    }

    /// Run `f` under the read lock
    pub fn read<R>(&self, f: impl FnOnce(&ExecutionTree) -> R) -> Result<R> {
        let guard = self
            .inner
            .read()
            .map_err(|_| ProcessEngineError::Internal("execution tree lock poisoned".to_string()))?;
        Ok(f(&guard))
    }

    /// Run `f` under the write lock
    pub fn write<R>(&self, f: impl FnOnce(&mut ExecutionTree) -> R) -> Result<R> {
        let mut guard = self
            .inner
            .write()
            .map_err(|_| ProcessEngineError::Internal("execution tree lock poisoned".to_string()))?;
        Ok(f(&mut guard))
    }
}

impl TreeSnapshotSource for SharedExecutionTree {
    fn header(&self) -> Result<TreeHeader> {
        self.read(header_of)
    }

    fn read_node(&self, id: &ExecutionId) -> Result<(u64, Option<NodeView>)> {
        self.read(|tree| (tree.revision(), view_of(tree, id)))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct InstanceTreeProjector;

struct Walk<'a, S: TreeSnapshotSource + ?Sized> {
    source: &'a S,
    header: TreeHeader,
    activities: Vec<ActivityInstance>,
    transitions: Vec<TransitionInstance>,
}

impl InstanceTreeProjector {
    pub fn new() -> Self {
        InstanceTreeProjector
    }

    /// Project the whole process instance
    pub fn project<S: TreeSnapshotSource + ?Sized>(&self, source: &S) -> Result<ActivityInstanceTree> {
        let header = source.header()?;
        let mut walk = Walk {
            source,
            header: header.clone(),
            activities: Vec::new(),
            transitions: Vec::new(),
        };

        let root = walk.read(&header.root)?;
        if root.ended {
            return Err(ProcessEngineError::InvalidTreeOperation {
                execution: header.root.to_string(),
                reason: "process instance has ended".to_string(),
            });
        }

        walk.activities.push(ActivityInstance {
            id: header.process_instance_id.to_string(),
            parent_activity_instance_id: None,
            process_instance_id: header.process_instance_id,
            process_definition_id: header.definition_id.clone(),
            activity_id: ActivityId::new(&header.definition_id),
            execution_ids: vec![root.id],
            child_activity_instance_ids: Vec::new(),
            child_transition_instance_ids: Vec::new(),
            incident_ids: Vec::new(),
        });

        // the root's own activity runs directly in the process instance
        match (&root.activity, root.async_marker) {
            (_, Some(marker)) => walk.push_transition(0, &root, marker),
            (Some(activity), None) => {
                walk.push_activity(0, &root, activity);
            }
            (None, None) => {}
        }
        for child in &root.children {
            walk.visit(child, &root.id, 0)?;
        }

        let (observed, _) = source.read_node(&header.root)?;
        walk.check_revision(observed, "tree changed while projecting")?;

        debug!(
            process_instance = %header.process_instance_id,
            revision = header.revision,
            activity_instances = walk.activities.len(),
            transition_instances = walk.transitions.len(),
            "projected activity instance tree"
        );
        Ok(ActivityInstanceTree::new(
            header.process_instance_id,
            header.revision,
            walk.activities,
            walk.transitions,
        ))
    }

    /// Project, re-reading up to `retries` more times on `InconsistentTreeSnapshot`
    pub fn project_with_retry<S: TreeSnapshotSource + ?Sized>(
        &self,
        source: &S,
        retries: u32,
    ) -> Result<ActivityInstanceTree> {
        let mut attempt = 0;
        loop {
            match self.project(source) {
                Err(e @ ProcessEngineError::InconsistentTreeSnapshot { .. }) if attempt < retries => {
                    attempt += 1;
                    warn!(attempt, error = %e, "re-projecting after inconsistent snapshot");
                }
                other => return other,
            }
        }
    }
}

impl<'a, S: TreeSnapshotSource + ?Sized> Walk<'a, S> {
    fn read(&self, id: &ExecutionId) -> Result<NodeView> {
        let (observed, view) = self.source.read_node(id)?;
        self.check_revision(observed, "tree changed while projecting")?;
        view.ok_or_else(|| self.inconsistent(observed, format!("execution {} is missing", id)))
    }

    fn check_revision(&self, observed: u64, detail: &str) -> Result<()> {
        if observed != self.header.revision {
            return Err(self.inconsistent(observed, detail.to_string()));
        }
        Ok(())
    }

    fn inconsistent(&self, observed: u64, detail: String) -> ProcessEngineError {
        ProcessEngineError::InconsistentTreeSnapshot {
            expected: self.header.revision,
            observed,
            detail,
        }
    }

    fn visit(&mut self, id: &ExecutionId, expected_parent: &ExecutionId, parent_ai: usize) -> Result<()> {
        let node = self.read(id)?;
        if node.parent != Some(*expected_parent) {
            return Err(self.inconsistent(
                self.header.revision,
                format!("execution {} is linked under {} but names {:?} as parent", id, expected_parent, node.parent),
            ));
        }
        if node.ended {
            return Err(self.inconsistent(
                self.header.revision,
                format!("ended execution {} is still linked under {}", id, expected_parent),
            ));
        }

        let children_parent = match (&node.activity, node.async_marker) {
            (_, Some(marker)) => {
                self.push_transition(parent_ai, &node, marker);
                parent_ai
            }
            (Some(activity), None) if node.is_scope => self.push_activity(parent_ai, &node, activity),
            (Some(activity), None) => {
                self.push_activity(parent_ai, &node, activity);
                parent_ai
            }
            (None, None) => {
                self.activities[parent_ai].execution_ids.push(node.id);
                parent_ai
            }
        };

        for child in &node.children {
            self.visit(child, &node.id, children_parent)?;
        }
        Ok(())
    }

    fn push_activity(&mut self, parent_ai: usize, node: &NodeView, activity: &ActivityId) -> usize {
        let id = format!("{}:{}", activity, node.id);
        let parent_id = self.activities[parent_ai].id.clone();
        self.activities[parent_ai].child_activity_instance_ids.push(id.clone());
        self.activities.push(ActivityInstance {
            id,
            parent_activity_instance_id: Some(parent_id),
            process_instance_id: self.header.process_instance_id,
            process_definition_id: self.header.definition_id.clone(),
            activity_id: activity.clone(),
            execution_ids: vec![node.id],
            child_activity_instance_ids: Vec::new(),
            child_transition_instance_ids: Vec::new(),
            incident_ids: Vec::new(),
        });
        self.activities.len() - 1
    }

    fn push_transition(&mut self, parent_ai: usize, node: &NodeView, marker: AsyncMarker) {
        let id = node.id.to_string();
        let parent_id = self.activities[parent_ai].id.clone();
        self.activities[parent_ai].child_transition_instance_ids.push(id.clone());
        self.transitions.push(TransitionInstance {
            id,
            parent_activity_instance_id: parent_id,
            process_instance_id: self.header.process_instance_id,
            process_definition_id: self.header.definition_id.clone(),
            activity_id: node.activity.clone(),
            execution_id: node.id,
            async_marker: marker,
            incident_ids: Vec::new(),
        });
    }
}
