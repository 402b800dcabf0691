// Runtime service - many process instances behind one facade

//! # Runtime Service
//!
//! [`RuntimeService`] is what an interpreter or an admin tool talks to. It
//! keeps every live [`ExecutionTree`] in a `DashMap` and gives each instance
//! its own `tokio::sync::Mutex` as the single-writer lock:
//!
//! - commands ([`execute`](RuntimeService::execute)), cascades and deletion
//!   take the writer lock, so nothing lifecycle-affecting is admitted while a
//!   cascade on the same instance is in flight
//! - projections and reads skip the writer lock and read the shared tree
//!   node by node; they can run while a command is in progress and retry on
//!   `InconsistentTreeSnapshot`
//!
//! After every successful command the service drains the tree's events,
//! drops transient variables and ENDED executions, persists a snapshot and
//! then publishes the events. A command that fails leaves the tree as it was
//! before the command started.

use std::sync::Arc;

use dashmap::DashMap;
use futures::future::join_all;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::engine::events::EventBus;
use crate::engine::projector::{InstanceTreeProjector, SharedExecutionTree};
use crate::engine::serializer::{InMemoryValueSerializer, ValueSerializer};
use crate::engine::storage::ProcessInstanceStorage;
use crate::engine::suspension::{CascadeReport, DependentEntityRegistry, SuspensionController};
use crate::engine::tree::ExecutionTree;
use crate::models::{
    ActivityInstanceTree, Clock, CommandContext, EventType, ExecutionEvent, ExecutionId,
    ProcessDefinitionRef, SuspensionState, SystemClock, ValueHandle,
};
use crate::{ProcessEngineError, Result};

#[derive(Clone)]
struct LiveInstance {
    writer: Arc<Mutex<()>>,
    tree: SharedExecutionTree,
}

impl LiveInstance {
    fn new(tree: ExecutionTree) -> Self {
        LiveInstance { writer: Arc::new(Mutex::new(())), tree: SharedExecutionTree::new(tree) }
    }
}

/// Outcome of a suspend/activate over several process instances
#[derive(Debug, Default)]
pub struct BatchReport {
    pub succeeded: Vec<(Uuid, CascadeReport)>,
    pub failed: Vec<(Uuid, ProcessEngineError)>,
}

impl BatchReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct RuntimeService {
    config: EngineConfig,
    instances: DashMap<Uuid, LiveInstance>,
    storage: Arc<dyn ProcessInstanceStorage>,
    controller: SuspensionController,
    projector: InstanceTreeProjector,
    events: EventBus,
    serializer: Arc<dyn ValueSerializer>,
    clock: Arc<dyn Clock>,
}

impl RuntimeService {
    pub fn new(
        config: EngineConfig,
        storage: Arc<dyn ProcessInstanceStorage>,
        registry: Arc<dyn DependentEntityRegistry>,
    ) -> Self {
        let events = EventBus::with_capacity(config.event_buffer);
        RuntimeService {
            config,
            instances: DashMap::new(),
            storage,
            controller: SuspensionController::new(registry),
            projector: InstanceTreeProjector::new(),
            events,
            serializer: Arc::new(InMemoryValueSerializer::new()),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_serializer(mut self, serializer: Arc<dyn ValueSerializer>) -> Self {
        self.serializer = serializer;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn serializer(&self) -> &dyn ValueSerializer {
        self.serializer.as_ref()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.events.subscribe()
    }

    /// A command context on the service clock
    pub fn context(&self) -> CommandContext {
        CommandContext::new(self.clock.clone())
    }

    /// Ids of the instances currently held in memory
    pub fn live_instances(&self) -> Vec<Uuid> {
        self.instances.iter().map(|e| *e.key()).collect()
    }

    /// Start a process instance and return its id
    pub async fn start_process_instance(
        &self,
        definition: ProcessDefinitionRef,
        business_key: Option<String>,
        ctx: &CommandContext,
    ) -> Result<Uuid> {
        let tree = ExecutionTree::start(definition, business_key, self.clock.clone());
        let id = tree.process_instance_id();
        let live = LiveInstance::new(tree);
        self.instances.insert(id, live.clone());

        let _writer = live.writer.lock().await;
        self.commit(&live, ctx).await?;
        info!(process_instance = %id, actor = ?ctx.actor, "started process instance");
        Ok(id)
    }

    /// Run an interpreter command against one instance.
    ///
    /// The command holds the instance's writer lock. If it returns an error
    /// the tree is restored to its state before the command.
    pub async fn execute<F, R>(&self, process_instance_id: &Uuid, ctx: &CommandContext, command: F) -> Result<R>
    where
        F: FnOnce(&mut ExecutionTree, &dyn ValueSerializer) -> Result<R>,
    {
        let live = self.live(process_instance_id).await?;
        let _writer = live.writer.lock().await;

        let serializer = self.serializer.as_ref();
        let outcome = live.tree.write(|tree| {
            let before = tree.clone();
            let result = command(tree, serializer);
            if result.is_err() {
                *tree = before;
            }
            result
        })?;
        let value = outcome?;
        self.commit(&live, ctx).await?;
        Ok(value)
    }

    /// Read-only access to the live tree
    pub async fn with_tree<F, R>(&self, process_instance_id: &Uuid, read: F) -> Result<R>
    where
        F: FnOnce(&ExecutionTree) -> R,
    {
        let live = self.live(process_instance_id).await?;
        live.tree.read(read)
    }

    pub async fn suspend_process_instance(&self, process_instance_id: &Uuid, ctx: &CommandContext) -> Result<CascadeReport> {
        self.cascade(process_instance_id, None, SuspensionState::Suspended, ctx).await
    }

    pub async fn activate_process_instance(&self, process_instance_id: &Uuid, ctx: &CommandContext) -> Result<CascadeReport> {
        self.cascade(process_instance_id, None, SuspensionState::Active, ctx).await
    }

    /// Suspend one execution's subtree inside an instance
    pub async fn suspend_execution(
        &self,
        process_instance_id: &Uuid,
        execution: &ExecutionId,
        ctx: &CommandContext,
    ) -> Result<CascadeReport> {
        self.cascade(process_instance_id, Some(*execution), SuspensionState::Suspended, ctx).await
    }

    pub async fn activate_execution(
        &self,
        process_instance_id: &Uuid,
        execution: &ExecutionId,
        ctx: &CommandContext,
    ) -> Result<CascadeReport> {
        self.cascade(process_instance_id, Some(*execution), SuspensionState::Active, ctx).await
    }

    /// Suspend every running instance of one definition version
    pub async fn suspend_by_definition_id(&self, definition_id: &str, ctx: &CommandContext) -> Result<BatchReport> {
        let ids = self.running_instances(self.storage.list_by_definition_id(definition_id).await?);
        Ok(self.batch(ids, SuspensionState::Suspended, ctx).await)
    }

    pub async fn activate_by_definition_id(&self, definition_id: &str, ctx: &CommandContext) -> Result<BatchReport> {
        let ids = self.running_instances(self.storage.list_by_definition_id(definition_id).await?);
        Ok(self.batch(ids, SuspensionState::Active, ctx).await)
    }

    /// Suspend every running instance of every version of a definition key
    pub async fn suspend_by_definition_key(&self, definition_key: &str, ctx: &CommandContext) -> Result<BatchReport> {
        let ids = self.running_instances(self.storage.list_by_definition_key(definition_key).await?);
        Ok(self.batch(ids, SuspensionState::Suspended, ctx).await)
    }

    pub async fn activate_by_definition_key(&self, definition_key: &str, ctx: &CommandContext) -> Result<BatchReport> {
        let ids = self.running_instances(self.storage.list_by_definition_key(definition_key).await?);
        Ok(self.batch(ids, SuspensionState::Active, ctx).await)
    }

    /// End the whole tree regardless of suspension and forget the instance
    pub async fn delete_process_instance(
        &self,
        process_instance_id: &Uuid,
        reason: Option<String>,
        ctx: &CommandContext,
    ) -> Result<Vec<ExecutionId>> {
        let live = self.live(process_instance_id).await?;
        let _writer = live.writer.lock().await;

        let actor = ctx.actor.clone();
        let (ended, mut events, released) = live.tree.write(|tree| -> Result<_> {
            let root = tree.root_id();
            let ended = tree.delete_cascade(&root)?;
            tree.record_with_actor(root, EventType::InstanceDeleted { reason: reason.clone() }, actor);
            let mut released = tree.drain_released_handles();
            released.extend(tree.value_handles());
            Ok((ended, tree.drain_events(), released))
        })??;
        stamp_actor(&mut events, ctx);

        self.instances.remove(process_instance_id);
        self.storage.delete(process_instance_id).await?;
        self.release(&released);
        self.events.publish_all(events);
        info!(process_instance = %process_instance_id, executions = ended.len(), reason = ?reason, "deleted process instance");
        Ok(ended)
    }

    /// Project the activity instance tree, retrying inconsistent snapshots
    pub async fn activity_instance_tree(&self, process_instance_id: &Uuid) -> Result<ActivityInstanceTree> {
        let live = self.live(process_instance_id).await?;
        self.projector.project_with_retry(&live.tree, self.config.projection_retries)
    }

    async fn cascade(
        &self,
        process_instance_id: &Uuid,
        execution: Option<ExecutionId>,
        state: SuspensionState,
        ctx: &CommandContext,
    ) -> Result<CascadeReport> {
        let live = self.live(process_instance_id).await?;
        let _writer = live.writer.lock().await;

        let plan = live.tree.write(|tree| {
            let root = execution.unwrap_or_else(|| tree.root_id());
            SuspensionController::apply(tree, &root, state, ctx)
        })??;
        if plan.is_noop() {
            return live.tree.write(|tree| SuspensionController::settle(tree, &plan, Vec::new()))?;
        }

        // callbacks run without the tree lock; the writer lock is still held
        let results = self.controller.notify(&plan).await;
        let report = live.tree.write(|tree| SuspensionController::settle(tree, &plan, results))?;

        self.commit(&live, ctx).await?;
        report
    }

    async fn batch(&self, ids: Vec<Uuid>, state: SuspensionState, ctx: &CommandContext) -> BatchReport {
        let outcomes = join_all(
            ids.iter().map(|id| self.cascade(id, None, state, ctx)),
        )
        .await;

        let mut report = BatchReport::default();
        for (id, outcome) in ids.into_iter().zip(outcomes) {
            match outcome {
                Ok(cascade) => report.succeeded.push((id, cascade)),
                Err(e) => {
                    warn!(process_instance = %id, state = %state, error = %e, "batch cascade failed for instance");
                    report.failed.push((id, e));
                }
            }
        }
        info!(
            state = %state,
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            "applied suspension state to instances"
        );
        report
    }

    fn running_instances(&self, trees: Vec<ExecutionTree>) -> Vec<Uuid> {
        trees
            .into_iter()
            .filter(|t| !t.is_ended())
            .map(|t| t.process_instance_id())
            .collect()
    }

    /// The live instance, loading it from storage when it is not in memory
    async fn live(&self, process_instance_id: &Uuid) -> Result<LiveInstance> {
        if let Some(live) = self.instances.get(process_instance_id) {
            return Ok(live.clone());
        }
        let mut tree = self
            .storage
            .get(process_instance_id)
            .await?
            .ok_or_else(|| ProcessEngineError::ProcessInstanceNotFound { id: process_instance_id.to_string() })?;
        tree.set_clock(self.clock.clone());
        let live = self
            .instances
            .entry(*process_instance_id)
            .or_insert_with(|| LiveInstance::new(tree))
            .clone();
        Ok(live)
    }

    /// End-of-command housekeeping: drain, clean up, persist, publish
    async fn commit(&self, live: &LiveInstance, ctx: &CommandContext) -> Result<()> {
        let retain = self.config.retain_ended_executions;
        let (mut events, released, snapshot) = live.tree.write(|tree| {
            let events = tree.drain_events();
            tree.clear_transient_variables();
            if !retain {
                tree.purge_ended();
            }
            (events, tree.drain_released_handles(), tree.snapshot())
        })?;
        stamp_actor(&mut events, ctx);

        self.storage.save(snapshot).await?;
        self.release(&released);
        self.events.publish_all(events);
        Ok(())
    }

    fn release(&self, handles: &[ValueHandle]) {
        for handle in handles {
            self.serializer.release(handle);
        }
        if !handles.is_empty() {
            debug!(handles = handles.len(), "released serialized values");
        }
    }
}

fn stamp_actor(events: &mut [ExecutionEvent], ctx: &CommandContext) {
    for event in events.iter_mut().filter(|e| e.actor.is_none()) {
        event.actor = ctx.actor.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::storage::InMemoryStorage;
    use crate::engine::suspension::InMemoryDependentEntities;
    use crate::models::{ActivityId, DependentEntityKind, DependentEntityRef, TypedValue};
    use serde_json::json;

    fn service() -> (RuntimeService, Arc<InMemoryStorage>, Arc<InMemoryDependentEntities>) {
        let storage = Arc::new(InMemoryStorage::new());
        let registry = Arc::new(InMemoryDependentEntities::new());
        let service = RuntimeService::new(EngineConfig::default(), storage.clone(), registry.clone());
        (service, storage, registry)
    }

    #[tokio::test]
    async fn test_start_persists_and_publishes() {
        let (service, storage, _) = service();
        let mut events = service.subscribe();
        let ctx = service.context().with_actor("alice");

        let id = service
            .start_process_instance(ProcessDefinitionRef::new("invoice", 1), None, &ctx)
            .await
            .unwrap();

        assert!(storage.get(&id).await.unwrap().is_some());
        let created = events.recv().await.unwrap();
        assert_eq!(created.process_instance_id, id);
        assert_eq!(created.actor.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn test_failed_command_restores_tree() {
        let (service, _, _) = service();
        let ctx = service.context();
        let id = service
            .start_process_instance(ProcessDefinitionRef::new("invoice", 1), None, &ctx)
            .await
            .unwrap();

        let result = service
            .execute(&id, &ctx, |tree, _| {
                let root = tree.root_id();
                tree.create_child(&root, false, false)?;
                // ending the root with an active child is rejected
                tree.end(&root)
            })
            .await;
        assert!(matches!(result, Err(ProcessEngineError::InvalidTreeOperation { .. })));

        let children = service.with_tree(&id, |t| t.get(&t.root_id()).map(|r| r.children.len())).await.unwrap().unwrap();
        assert_eq!(children, 0);
    }

    #[tokio::test]
    async fn test_transient_variables_do_not_outlive_the_command() {
        let (service, _, _) = service();
        let ctx = service.context();
        let id = service
            .start_process_instance(ProcessDefinitionRef::new("invoice", 1), None, &ctx)
            .await
            .unwrap();

        let seen = service
            .execute(&id, &ctx, |tree, _| {
                let root = tree.root_id();
                tree.set_variable_transient(&root, "scratch", TypedValue::from(1))?;
                Ok(tree.get_variable(&root, "scratch")?.is_some())
            })
            .await
            .unwrap();
        assert!(seen);

        let after = service
            .with_tree(&id, |t| t.get_variable(&t.root_id(), "scratch").map(|s| s.is_some()))
            .await
            .unwrap()
            .unwrap();
        assert!(!after);
    }

    #[tokio::test]
    async fn test_suspend_by_definition_key_covers_all_versions() {
        let (service, _, registry) = service();
        let ctx = service.context();
        let v1 = service
            .start_process_instance(ProcessDefinitionRef::new("invoice", 1), None, &ctx)
            .await
            .unwrap();
        let v2 = service
            .start_process_instance(ProcessDefinitionRef::new("invoice", 2), None, &ctx)
            .await
            .unwrap();
        let other = service
            .start_process_instance(ProcessDefinitionRef::new("order", 1), None, &ctx)
            .await
            .unwrap();

        service
            .execute(&v2, &ctx, |tree, _| {
                let root = tree.root_id();
                let task = tree.create_child(&root, false, false)?;
                tree.move_activity_marker(&task, Some(ActivityId::from("approve")), None)?;
                tree.attach_dependent(&task, DependentEntityRef::task("approve-1"))
            })
            .await
            .unwrap();

        let report = service.suspend_by_definition_key("invoice", &ctx).await.unwrap();
        assert!(report.is_complete());
        assert_eq!(report.succeeded.len(), 2);

        for id in [v1, v2] {
            let suspended = service.with_tree(&id, |t| t.suspension_state()).await.unwrap();
            assert_eq!(suspended, SuspensionState::Suspended);
        }
        let untouched = service.with_tree(&other, |t| t.suspension_state()).await.unwrap();
        assert_eq!(untouched, SuspensionState::Active);

        let calls = registry.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].kind, DependentEntityKind::Task);

        let report = service.activate_by_definition_id("invoice:1", &ctx).await.unwrap();
        assert_eq!(report.succeeded.len(), 1);
        let state = service.with_tree(&v1, |t| t.suspension_state()).await.unwrap();
        assert_eq!(state, SuspensionState::Active);
    }

    #[tokio::test]
    async fn test_instances_reload_from_storage() {
        let storage = Arc::new(InMemoryStorage::new());
        let registry = Arc::new(InMemoryDependentEntities::new());
        let first = RuntimeService::new(EngineConfig::default(), storage.clone(), registry.clone());
        let ctx = first.context();
        let id = first
            .start_process_instance(ProcessDefinitionRef::new("invoice", 1), None, &ctx)
            .await
            .unwrap();
        first
            .execute(&id, &ctx, |tree, _| {
                let root = tree.root_id();
                tree.set_variable_local(&root, "amount", TypedValue::from(10))
            })
            .await
            .unwrap();

        let second = RuntimeService::new(EngineConfig::default(), storage, registry);
        let amount = second
            .with_tree(&id, |t| t.get_variable(&t.root_id(), "amount").map(|s| s.map(|s| s.value.clone())))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(amount, Some(TypedValue::from(10)));
    }

    #[tokio::test]
    async fn test_delete_ignores_suspension_and_forgets_instance() {
        let (service, storage, _) = service();
        let ctx = service.context();
        let id = service
            .start_process_instance(ProcessDefinitionRef::new("invoice", 1), None, &ctx)
            .await
            .unwrap();
        service
            .execute(&id, &ctx, |tree, _| {
                let root = tree.root_id();
                tree.create_child(&root, true, false).map(|_| ())
            })
            .await
            .unwrap();
        service.suspend_process_instance(&id, &ctx).await.unwrap();

        let ended = service
            .delete_process_instance(&id, Some("cancelled".to_string()), &ctx)
            .await
            .unwrap();
        assert_eq!(ended.len(), 2);
        assert!(storage.get(&id).await.unwrap().is_none());
        assert!(matches!(
            service.activity_instance_tree(&id).await,
            Err(ProcessEngineError::ProcessInstanceNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_failed_cascade_is_persisted_and_retried() {
        let (service, storage, registry) = service();
        let ctx = service.context().with_actor("ops");
        let id = service
            .start_process_instance(ProcessDefinitionRef::new("invoice", 1), None, &ctx)
            .await
            .unwrap();
        let attach = registry.clone();
        let task = service
            .execute(&id, &ctx, move |tree, _| {
                let root = tree.root_id();
                let task = tree.create_child(&root, false, false)?;
                attach.attach(tree, &task, DependentEntityRef::task("review-1"))?;
                Ok(task)
            })
            .await
            .unwrap();
        registry.fail_kind(DependentEntityKind::Task, "task service down");

        let err = service.suspend_process_instance(&id, &ctx).await.unwrap_err();
        assert!(matches!(err, ProcessEngineError::CascadeFailed { .. }));
        assert!(err.is_retryable());

        // the flags were persisted even though the callback failed
        let stored = storage.get(&id).await.unwrap().unwrap();
        assert_eq!(stored.suspension_state(), SuspensionState::Suspended);
        assert!(!stored.get(&task).unwrap().dependents_synced);
        assert_eq!(registry.is_suspended("review-1"), Some(false));

        registry.recover(DependentEntityKind::Task);
        let calls = registry.calls().len();
        let report = service.suspend_process_instance(&id, &ctx).await.unwrap();
        assert!(report.retried);
        assert_eq!(report.changed_executions, 0);
        assert_eq!(registry.calls().len(), calls + 1);
        assert_eq!(registry.is_suspended("review-1"), Some(true));

        let stored = storage.get(&id).await.unwrap().unwrap();
        assert!(stored.get(&task).unwrap().dependents_synced);

        // nothing is owed any more
        let report = service.suspend_process_instance(&id, &ctx).await.unwrap();
        assert!(!report.retried);
        assert_eq!(registry.calls().len(), calls + 1);
    }

    #[tokio::test]
    async fn test_serialized_values_are_released_with_their_slots() {
        let serializer = Arc::new(InMemoryValueSerializer::new());
        let service = RuntimeService::new(
            EngineConfig::default(),
            Arc::new(InMemoryStorage::new()),
            Arc::new(InMemoryDependentEntities::new()),
        )
        .with_serializer(serializer.clone());
        let ctx = service.context();
        let id = service
            .start_process_instance(ProcessDefinitionRef::new("invoice", 1), None, &ctx)
            .await
            .unwrap();

        for version in 1..=2 {
            service
                .execute(&id, &ctx, |tree, values| {
                    let root = tree.root_id();
                    tree.set_object_variable_local(&root, "doc", "doc", &json!({ "v": version }), values)
                        .map(|_| ())
                })
                .await
                .unwrap();
        }
        assert_eq!(serializer.len(), 1);

        service
            .execute(&id, &ctx, |tree, _| {
                let root = tree.root_id();
                tree.remove_variable(&root, "doc").map(|_| ())
            })
            .await
            .unwrap();
        assert!(serializer.is_empty());

        // an ended scope gives its values back when it is purged
        service
            .execute(&id, &ctx, |tree, values| {
                let root = tree.root_id();
                let sub = tree.create_child(&root, true, false)?;
                tree.set_object_variable_local(&sub, "draft", "doc", &json!([1, 2]), values)?;
                tree.set_object_variable_local(&root, "kept", "doc", &json!("x"), values)?;
                tree.end(&sub)
            })
            .await
            .unwrap();
        assert_eq!(serializer.len(), 1);

        service.delete_process_instance(&id, None, &ctx).await.unwrap();
        assert!(serializer.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_instance() {
        let (service, _, _) = service();
        let err = service
            .suspend_process_instance(&Uuid::new_v4(), &service.context())
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessEngineError::ProcessInstanceNotFound { .. }));
    }
}
