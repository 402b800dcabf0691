// Projected, read-only view of a process instance

//! # Activity Instance Tree
//!
//! The physical execution tree is an implementation detail of how the
//! interpreter walks a model. Users ask a different question: *which
//! activities are running right now, and inside which scopes?* The answer is
//! an [`ActivityInstanceTree`], derived on demand by the projector:
//!
//! - an [`ActivityInstance`] is one settled occurrence of an activity; it may
//!   compact several executions
//! - a [`TransitionInstance`] is an execution parked in an async continuation
//!   before or after an activity
//!
//! These types are never stored. The tree keeps its instances in two flat
//! vectors (root activity instance first) and links them by id, which keeps
//! lookups by activity and incident attachment simple.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::execution::AsyncMarker;
use super::ids::{ActivityId, ExecutionId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityInstance {
    pub id: String,

    /// `None` only for the process-instance level activity instance
    pub parent_activity_instance_id: Option<String>,

    pub process_instance_id: Uuid,

    pub process_definition_id: String,

    /// Activity id; the definition id for the process-instance level
    pub activity_id: ActivityId,

    /// Executions compacted into this instance, the owning one first
    pub execution_ids: Vec<ExecutionId>,

    pub child_activity_instance_ids: Vec<String>,

    pub child_transition_instance_ids: Vec<String>,

    pub incident_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionInstance {
    /// Same as the execution id: an execution runs at most one transition
    pub id: String,

    pub parent_activity_instance_id: String,

    pub process_instance_id: Uuid,

    pub process_definition_id: String,

    pub activity_id: Option<ActivityId>,

    pub execution_id: ExecutionId,

    pub async_marker: AsyncMarker,

    pub incident_ids: Vec<String>,
}

/// Either kind of projected instance, as returned by lookups
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProjectedInstance<'a> {
    Activity(&'a ActivityInstance),
    Transition(&'a TransitionInstance),
}

impl<'a> ProjectedInstance<'a> {
    pub fn id(&self) -> &'a str {
        match self {
            ProjectedInstance::Activity(a) => &a.id,
            ProjectedInstance::Transition(t) => &t.id,
        }
    }

    pub fn is_transition(&self) -> bool {
        matches!(self, ProjectedInstance::Transition(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityInstanceTree {
    pub process_instance_id: Uuid,

    /// Tree revision the projection was taken at
    pub revision: u64,

    activity_instances: Vec<ActivityInstance>,

    transition_instances: Vec<TransitionInstance>,
}

impl ActivityInstanceTree {
    pub(crate) fn new(
        process_instance_id: Uuid,
        revision: u64,
        activity_instances: Vec<ActivityInstance>,
        transition_instances: Vec<TransitionInstance>,
    ) -> Self {
        ActivityInstanceTree {
            process_instance_id,
            revision,
            activity_instances,
            transition_instances,
        }
    }

    /// The process-instance level activity instance
    pub fn root(&self) -> &ActivityInstance {
        &self.activity_instances[0]
    }

    pub fn activity_instances(&self) -> &[ActivityInstance] {
        &self.activity_instances
    }

    pub fn transition_instances(&self) -> &[TransitionInstance] {
        &self.transition_instances
    }

    pub fn activity_instance(&self, id: &str) -> Option<&ActivityInstance> {
        self.activity_instances.iter().find(|a| a.id == id)
    }

    pub fn transition_instance(&self, id: &str) -> Option<&TransitionInstance> {
        self.transition_instances.iter().find(|t| t.id == id)
    }

    /// Child activity instances of `parent`, in projection order
    pub fn child_activity_instances<'a>(
        &'a self,
        parent: &'a ActivityInstance,
    ) -> impl Iterator<Item = &'a ActivityInstance> + 'a {
        parent
            .child_activity_instance_ids
            .iter()
            .filter_map(move |id| self.activity_instance(id))
    }

    /// Child transition instances of `parent`, in projection order
    pub fn child_transition_instances<'a>(
        &'a self,
        parent: &'a ActivityInstance,
    ) -> impl Iterator<Item = &'a TransitionInstance> + 'a {
        parent
            .child_transition_instance_ids
            .iter()
            .filter_map(move |id| self.transition_instance(id))
    }

    /// Every activity and transition instance positioned at `activity_id`
    pub fn find_by_activity(&self, activity_id: &str) -> Vec<ProjectedInstance<'_>> {
        let activities = self
            .activity_instances
            .iter()
            .filter(|a| a.activity_id.as_str() == activity_id)
            .map(ProjectedInstance::Activity);
        let transitions = self
            .transition_instances
            .iter()
            .filter(|t| t.activity_id.as_ref().map(|a| a.as_str()) == Some(activity_id))
            .map(ProjectedInstance::Transition);
        activities.chain(transitions).collect()
    }

    /// Attach an incident to every instance positioned at `activity_id`.
    ///
    /// Returns how many instances received it.
    pub fn attach_incident(&mut self, activity_id: &str, incident_id: &str) -> usize {
        let mut attached = 0;
        for instance in self
            .activity_instances
            .iter_mut()
            .filter(|a| a.activity_id.as_str() == activity_id)
        {
            instance.incident_ids.push(incident_id.to_string());
            attached += 1;
        }
        for instance in self
            .transition_instances
            .iter_mut()
            .filter(|t| t.activity_id.as_ref().map(|a| a.as_str()) == Some(activity_id))
        {
            instance.incident_ids.push(incident_id.to_string());
            attached += 1;
        }
        attached
    }

    pub fn len(&self) -> usize {
        self.activity_instances.len() + self.transition_instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
