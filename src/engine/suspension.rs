// Suspension controller - cascading ACTIVE/SUSPENDED state machine

//! # Suspension
//!
//! Suspension freezes a subtree of a process instance. A suspended execution
//! is still part of the tree and still readable, but refuses every
//! lifecycle-affecting operation until it is activated again.
//!
//! ## Guard policy
//!
//! [`GuardedOperation`] lists every operation the runtime knows about, split
//! into two classes:
//!
//! - **lifecycle-affecting** (complete a task, fire a timer, claim, signal,
//!   start-before/after, end an execution, ...): rejected on a suspended
//!   execution with `SuspendedEntityInteraction`
//! - **data-only** (set/remove variables, comments, attachments, priority):
//!   always allowed, so administrators can inspect and correct a suspended
//!   instance without resuming it
//!
//! [`ensure_permitted`] is the single place that decides.
//!
//! ## Cascade
//!
//! `suspend(root)` and `activate(root)` run in three steps:
//!
//! 1. every ACTIVE execution in the subtree gets its new flag, in one pass
//!    over the tree ([`SuspensionController::apply`])
//! 2. the [`DependentEntityRegistry`] is called once per (execution, kind)
//!    that has dependents ([`SuspensionController::notify`])
//! 3. executions whose callbacks all succeeded are marked synchronized
//!    ([`SuspensionController::settle`])
//!
//! Flags are never rolled back when a callback fails. The cascade reports
//! `CascadeFailed` and the unsynchronized executions stay marked, so calling
//! `suspend` again re-runs just the callbacks that are still outstanding.
//! With nothing outstanding, suspending a suspended subtree (or activating an
//! active one) is a no-op.
//!
//! ```text
//!   suspend(R)        flags: R,C1,C2 -> SUSPENDED       callbacks: C1/task fails
//!   suspend(R) again  flags: unchanged                  callbacks: C1/task only
//!   suspend(R) again  no-op
//! ```
//!
//! The split lets a caller holding the tree behind a lock release it while
//! the (possibly slow) callbacks run; `RuntimeService` does exactly that and
//! keeps the per-instance writer lock for the whole cascade.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::engine::tree::ExecutionTree;
use crate::models::{
    CommandContext, DependentEntityKind, DependentEntityRef, EventType, ExecutionId,
    ExecutionNode, SuspensionState,
};
use crate::{ProcessEngineError, Result};

/// Operations the guard knows how to classify
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardedOperation {
    // task service
    CompleteTask,
    ClaimTask,
    SetAssignee,
    SetOwner,
    AddCandidateUser,
    AddCandidateGroup,
    DeleteCandidateUser,
    DeleteCandidateGroup,
    AddIdentityLink,
    DeleteIdentityLink,
    SubmitTaskForm,
    CreateSubTask,

    // jobs and external tasks
    FireTimer,
    ExecuteJob,
    LockExternalTask,
    CompleteExternalTask,

    // runtime service
    Signal,
    CorrelateMessage,
    StartBeforeActivity,
    StartAfterActivity,
    EndExecution,

    // data-only
    SetVariable,
    RemoveVariable,
    AddComment,
    AddAttachment,
    SetPriority,
}

impl GuardedOperation {
    pub fn is_lifecycle_affecting(&self) -> bool {
        !matches!(
            self,
            GuardedOperation::SetVariable
                | GuardedOperation::RemoveVariable
                | GuardedOperation::AddComment
                | GuardedOperation::AddAttachment
                | GuardedOperation::SetPriority
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            GuardedOperation::CompleteTask => "complete task",
            GuardedOperation::ClaimTask => "claim task",
            GuardedOperation::SetAssignee => "set assignee",
            GuardedOperation::SetOwner => "set owner",
            GuardedOperation::AddCandidateUser => "add candidate user",
            GuardedOperation::AddCandidateGroup => "add candidate group",
            GuardedOperation::DeleteCandidateUser => "delete candidate user",
            GuardedOperation::DeleteCandidateGroup => "delete candidate group",
            GuardedOperation::AddIdentityLink => "add identity link",
            GuardedOperation::DeleteIdentityLink => "delete identity link",
            GuardedOperation::SubmitTaskForm => "submit task form",
            GuardedOperation::CreateSubTask => "create sub-task",
            GuardedOperation::FireTimer => "fire timer",
            GuardedOperation::ExecuteJob => "execute job",
            GuardedOperation::LockExternalTask => "lock external task",
            GuardedOperation::CompleteExternalTask => "complete external task",
            GuardedOperation::Signal => "signal",
            GuardedOperation::CorrelateMessage => "correlate message",
            GuardedOperation::StartBeforeActivity => "start before activity",
            GuardedOperation::StartAfterActivity => "start after activity",
            GuardedOperation::EndExecution => "end execution",
            GuardedOperation::SetVariable => "set variable",
            GuardedOperation::RemoveVariable => "remove variable",
            GuardedOperation::AddComment => "add comment",
            GuardedOperation::AddAttachment => "add attachment",
            GuardedOperation::SetPriority => "set priority",
        }
    }
}

impl std::fmt::Display for GuardedOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reject `operation` if it is lifecycle-affecting and `node` is suspended
pub fn ensure_permitted(node: &ExecutionNode, operation: GuardedOperation) -> Result<()> {
    if operation.is_lifecycle_affecting() && node.is_suspended() {
        return Err(ProcessEngineError::SuspendedEntityInteraction {
            operation: operation.to_string(),
            execution: node.id.to_string(),
        });
    }
    Ok(())
}

impl ExecutionTree {
    /// Run the guard against execution `id`
    pub fn ensure_permitted(&self, id: &ExecutionId, operation: GuardedOperation) -> Result<()> {
        ensure_permitted(self.get(id)?, operation)
    }
}

/// What a dependent-entity callback did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallbackOutcome {
    /// This many entities changed state
    Applied(usize),
    /// No entity of that kind needed a change
    NothingToDo,
}

/// Mirrors an execution's suspension state onto the tasks, jobs and
/// external-task locks bound to it. Implementations must be idempotent.
#[async_trait]
pub trait DependentEntityRegistry: Send + Sync {
    async fn on_suspend(&self, kind: DependentEntityKind, execution: ExecutionId) -> Result<CallbackOutcome>;

    async fn on_activate(&self, kind: DependentEntityKind, execution: ExecutionId) -> Result<CallbackOutcome>;
}

/// Flags applied by [`SuspensionController::apply`] and the callbacks still owed
#[derive(Debug, Clone, PartialEq)]
pub struct CascadePlan {
    pub root: ExecutionId,
    pub state: SuspensionState,
    /// Executions whose flag changed in this cascade
    pub changed: Vec<ExecutionId>,
    /// (execution, kind) pairs to call back, in subtree order
    pub callbacks: Vec<(ExecutionId, DependentEntityKind)>,
}

impl CascadePlan {
    /// Nothing changed and nothing is owed
    pub fn is_noop(&self) -> bool {
        self.changed.is_empty() && self.callbacks.is_empty()
    }
}

/// Result of one callback in the notify step
#[derive(Debug)]
pub struct CallbackResult {
    pub execution: ExecutionId,
    pub kind: DependentEntityKind,
    pub outcome: Result<CallbackOutcome>,
}

/// Summary of a completed cascade
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CascadeReport {
    pub root: ExecutionId,
    pub state: SuspensionState,
    pub changed_executions: usize,
    pub entities_applied: usize,
    pub callbacks_nothing_to_do: usize,
    /// True when the call only re-ran callbacks owed by an earlier cascade
    pub retried: bool,
}

#[derive(Clone)]
pub struct SuspensionController {
    registry: Arc<dyn DependentEntityRegistry>,
}

impl SuspensionController {
    pub fn new(registry: Arc<dyn DependentEntityRegistry>) -> Self {
        SuspensionController { registry }
    }

    /// Suspend `root` and its subtree
    pub async fn suspend(
        &self,
        tree: &mut ExecutionTree,
        root: &ExecutionId,
        ctx: &CommandContext,
    ) -> Result<CascadeReport> {
        self.cascade(tree, root, SuspensionState::Suspended, ctx).await
    }

    /// Activate `root` and its subtree
    pub async fn activate(
        &self,
        tree: &mut ExecutionTree,
        root: &ExecutionId,
        ctx: &CommandContext,
    ) -> Result<CascadeReport> {
        self.cascade(tree, root, SuspensionState::Active, ctx).await
    }

    async fn cascade(
        &self,
        tree: &mut ExecutionTree,
        root: &ExecutionId,
        state: SuspensionState,
        ctx: &CommandContext,
    ) -> Result<CascadeReport> {
        let plan = Self::apply(tree, root, state, ctx)?;
        let results = self.notify(&plan).await;
        Self::settle(tree, &plan, results)
    }

    /// Step 1: set the flags on the whole subtree.
    ///
    /// Fails without changing anything if `root` has ended, or when
    /// activating below an ancestor that was itself suspended.
    pub fn apply(
        tree: &mut ExecutionTree,
        root: &ExecutionId,
        state: SuspensionState,
        ctx: &CommandContext,
    ) -> Result<CascadePlan> {
        let root_node = tree.get(root)?;
        if root_node.is_ended() {
            return Err(ProcessEngineError::InvalidTreeOperation {
                execution: root.to_string(),
                reason: format!("cannot change the suspension state of an ended execution to {}", state),
            });
        }
        if state == SuspensionState::Active {
            for ancestor in tree.ancestors(root)? {
                let node = tree.get(&ancestor)?;
                if node.suspended_directly && node.is_suspended() {
                    return Err(ProcessEngineError::InvalidTreeOperation {
                        execution: root.to_string(),
                        reason: format!("suspended through ancestor {}; activate that execution instead", ancestor),
                    });
                }
            }
        }

        let subtree: Vec<ExecutionId> = tree
            .subtree(root)?
            .into_iter()
            .filter(|id| tree.node(id).map_or(false, |n| n.is_active()))
            .collect();

        // nodes already in `state` keep their sync flag so owed callbacks survive
        let mut changed = Vec::new();
        for id in &subtree {
            let node = tree.get_mut(id)?;
            if node.suspension != state {
                node.suspension = state;
                node.dependents_synced = node.dependents.is_empty();
                changed.push(*id);
            }
            if !state.is_suspended() {
                node.suspended_directly = false;
            }
        }
        if state.is_suspended() {
            tree.get_mut(root)?.suspended_directly = true;
        }

        let mut callbacks = Vec::new();
        for id in &subtree {
            let node = tree.get(id)?;
            if node.dependents_synced {
                continue;
            }
            for kind in DependentEntityKind::ALL {
                if node.has_dependents_of(kind) {
                    callbacks.push((*id, kind));
                }
            }
        }

        if !changed.is_empty() {
            tree.record_with_actor(
                *root,
                EventType::SuspensionChanged { state, nodes: changed.len() },
                ctx.actor.clone(),
            );
            info!(
                process_instance = %tree.process_instance_id(),
                root = %root,
                state = %state,
                executions = changed.len(),
                actor = ?ctx.actor,
                "changed suspension state"
            );
        } else if !callbacks.is_empty() {
            info!(root = %root, state = %state, callbacks = callbacks.len(), "retrying outstanding dependent callbacks");
        } else {
            debug!(root = %root, state = %state, "suspension state already applied");
        }

        Ok(CascadePlan { root: *root, state, changed, callbacks })
    }

    /// Step 2: call the registry for every owed (execution, kind).
    ///
    /// Every callback is attempted; failures do not stop the others.
    pub async fn notify(&self, plan: &CascadePlan) -> Vec<CallbackResult> {
        let mut results = Vec::with_capacity(plan.callbacks.len());
        for (execution, kind) in &plan.callbacks {
            let outcome = if plan.state.is_suspended() {
                self.registry.on_suspend(*kind, *execution).await
            } else {
                self.registry.on_activate(*kind, *execution).await
            };
            if let Err(e) = &outcome {
                warn!(execution = %execution, kind = %kind, state = %plan.state, error = %e, "dependent entity callback failed");
            }
            results.push(CallbackResult { execution: *execution, kind: *kind, outcome });
        }
        results
    }

    /// Step 3: mark executions whose callbacks all succeeded as synchronized
    pub fn settle(
        tree: &mut ExecutionTree,
        plan: &CascadePlan,
        results: Vec<CallbackResult>,
    ) -> Result<CascadeReport> {
        let mut failed: HashSet<ExecutionId> = HashSet::new();
        let mut failures = Vec::new();
        let mut entities_applied = 0;
        let mut callbacks_nothing_to_do = 0;

        for result in results {
            match result.outcome {
                Ok(CallbackOutcome::Applied(n)) => entities_applied += n,
                Ok(CallbackOutcome::NothingToDo) => callbacks_nothing_to_do += 1,
                Err(e) => {
                    failed.insert(result.execution);
                    failures.push(format!("{} {}: {}", result.kind, result.execution, e));
                }
            }
        }

        let called: HashSet<ExecutionId> = plan.callbacks.iter().map(|(id, _)| *id).collect();
        for id in called.difference(&failed) {
            if let Some(node) = tree.node(id) {
                // a later cascade may have flipped the state again
                if node.is_active() && node.suspension == plan.state {
                    tree.get_mut(id)?.dependents_synced = true;
                }
            }
        }

        if !failures.is_empty() {
            return Err(ProcessEngineError::CascadeFailed {
                root: plan.root.to_string(),
                state: plan.state.to_string(),
                failures,
            });
        }

        Ok(CascadeReport {
            root: plan.root,
            state: plan.state,
            changed_executions: plan.changed.len(),
            entities_applied,
            callbacks_nothing_to_do,
            retried: plan.changed.is_empty() && !plan.callbacks.is_empty(),
        })
    }
}

/// One recorded registry call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCallback {
    pub kind: DependentEntityKind,
    pub execution: ExecutionId,
    pub state: SuspensionState,
}

#[derive(Debug, Clone)]
struct EntityRecord {
    kind: DependentEntityKind,
    execution: ExecutionId,
    suspended: bool,
}

/// In-memory registry of dependent entities.
///
/// Tracks the suspension state of every registered entity, records each call
/// it receives, and can be told to fail all calls for one kind.
#[derive(Debug, Default)]
pub struct InMemoryDependentEntities {
    entities: DashMap<String, EntityRecord>,
    failing: DashMap<DependentEntityKind, String>,
    calls: Mutex<Vec<RecordedCallback>>,
}

impl InMemoryDependentEntities {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an entity and bind it to `execution` in the tree.
    ///
    /// The entity starts in the execution's current suspension state.
    pub fn attach(
        &self,
        tree: &mut ExecutionTree,
        execution: &ExecutionId,
        entity: DependentEntityRef,
    ) -> Result<()> {
        let suspended = tree.get(execution)?.is_suspended();
        tree.attach_dependent(execution, entity.clone())?;
        self.entities.insert(
            entity.id,
            EntityRecord { kind: entity.kind, execution: *execution, suspended },
        );
        Ok(())
    }

    /// Make every call for `kind` fail until [`recover`](Self::recover)
    pub fn fail_kind(&self, kind: DependentEntityKind, reason: &str) {
        self.failing.insert(kind, reason.to_string());
    }

    pub fn recover(&self, kind: DependentEntityKind) {
        self.failing.remove(&kind);
    }

    pub fn is_suspended(&self, entity_id: &str) -> Option<bool> {
        self.entities.get(entity_id).map(|e| e.suspended)
    }

    pub fn calls(&self) -> Vec<RecordedCallback> {
        match self.calls.lock() {
            Ok(calls) => calls.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Entity counts per kind, for summaries
    pub fn counts(&self) -> BTreeMap<DependentEntityKind, usize> {
        let mut counts = BTreeMap::new();
        for entry in self.entities.iter() {
            *counts.entry(entry.kind).or_insert(0) += 1;
        }
        counts
    }

    fn mirror(
        &self,
        kind: DependentEntityKind,
        execution: ExecutionId,
        state: SuspensionState,
    ) -> Result<CallbackOutcome> {
        self.calls
            .lock()
            .map_err(|_| ProcessEngineError::Internal("callback log lock poisoned".to_string()))?
            .push(RecordedCallback { kind, execution, state });

        if let Some(reason) = self.failing.get(&kind) {
            return Err(ProcessEngineError::DependentEntityFailure {
                kind: kind.to_string(),
                execution: execution.to_string(),
                reason: reason.value().clone(),
            });
        }

        let suspended = state.is_suspended();
        let mut applied = 0;
        for mut entry in self.entities.iter_mut() {
            if entry.kind == kind && entry.execution == execution && entry.suspended != suspended {
                entry.suspended = suspended;
                applied += 1;
            }
        }
        Ok(if applied == 0 { CallbackOutcome::NothingToDo } else { CallbackOutcome::Applied(applied) })
    }
}

#[async_trait]
impl DependentEntityRegistry for InMemoryDependentEntities {
    async fn on_suspend(&self, kind: DependentEntityKind, execution: ExecutionId) -> Result<CallbackOutcome> {
        self.mirror(kind, execution, SuspensionState::Suspended)
    }

    async fn on_activate(&self, kind: DependentEntityKind, execution: ExecutionId) -> Result<CallbackOutcome> {
        self.mirror(kind, execution, SuspensionState::Active)
    }
}
