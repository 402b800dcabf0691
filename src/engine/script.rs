// Replay scripts - JSON scenarios driven through the runtime service

//! # Replay Scripts
//!
//! A [`ReplayScript`] is a JSON document describing one process instance and
//! a list of steps to apply to it, the way an interpreter would. The admin
//! CLI replays scripts to reproduce and inspect tree states.
//!
//! Executions are referred to by alias; `"root"` is always defined.
//!
//! ```json
//! {
//!   "definition": { "key": "invoice", "version": 1 },
//!   "actor": "demo",
//!   "steps": [
//!     { "op": "create_child", "alias": "c", "parent": "root" },
//!     { "op": "move", "execution": "c", "activity": "approve" },
//!     { "op": "set_variable", "execution": "c", "name": "amount", "value": 120 },
//!     { "op": "suspend" },
//!     { "op": "end", "execution": "c" }
//!   ]
//! }
//! ```
//!
//! A failing step is recorded and replay carries on with the next one, so a
//! script can show both the rejected operation and what follows it.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::engine::predicate::VariableCondition;
use crate::engine::runtime::RuntimeService;
use crate::engine::storage::InMemoryStorage;
use crate::engine::suspension::{GuardedOperation, InMemoryDependentEntities};
use crate::models::{
    ActivityId, ActivityInstanceTree, AsyncMarker, DependentEntityKind, DependentEntityRef,
    ExecutionId, ProcessDefinitionRef, SuspensionState, TypedValue,
};
use crate::{ProcessEngineError, Result};

pub const ROOT_ALIAS: &str = "root";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptDefinition {
    pub key: String,
    #[serde(default = "default_version")]
    pub version: u32,
}

fn default_version() -> u32 {
    1
}

fn root_alias() -> String {
    ROOT_ALIAS.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayScript {
    pub definition: ScriptDefinition,
    #[serde(default)]
    pub business_key: Option<String>,
    #[serde(default)]
    pub actor: Option<String>,
    pub steps: Vec<ScriptStep>,
}

impl ReplayScript {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ScriptStep {
    #[serde(alias = "create")]
    CreateChild {
        alias: String,
        #[serde(default = "root_alias")]
        parent: String,
        #[serde(default)]
        scope: bool,
        #[serde(default)]
        concurrent: bool,
    },
    End {
        execution: String,
    },
    #[serde(alias = "move_activity_marker")]
    Move {
        execution: String,
        #[serde(default)]
        activity: Option<String>,
        #[serde(default)]
        async_marker: Option<AsyncMarker>,
    },
    SetVariable {
        #[serde(default = "root_alias")]
        execution: String,
        name: String,
        value: serde_json::Value,
        #[serde(default)]
        local: bool,
        #[serde(default)]
        transient: bool,
    },
    RemoveVariable {
        #[serde(default = "root_alias")]
        execution: String,
        name: String,
        #[serde(default)]
        local: bool,
    },
    Attach {
        execution: String,
        kind: DependentEntityKind,
        id: String,
    },
    Suspend {
        #[serde(default = "root_alias")]
        execution: String,
    },
    Activate {
        #[serde(default = "root_alias")]
        execution: String,
    },
    /// Run the suspension guard for an operation
    Guard {
        execution: String,
        operation: GuardedOperation,
    },
    Query {
        #[serde(default = "root_alias")]
        execution: String,
        condition: VariableCondition,
    },
}

impl ScriptStep {
    pub fn describe(&self) -> String {
        match self {
            ScriptStep::CreateChild { alias, parent, scope, concurrent } => format!(
                "create {}{}child '{}' under '{}'",
                if *scope { "scope " } else { "" },
                if *concurrent { "concurrent " } else { "" },
                alias,
                parent
            ),
            ScriptStep::End { execution } => format!("end '{}'", execution),
            ScriptStep::Move { execution, activity, async_marker } => format!(
                "move '{}' to {}{}",
                execution,
                activity.as_deref().unwrap_or("<none>"),
                async_marker.map(|m| format!(" ({:?})", m)).unwrap_or_default()
            ),
            ScriptStep::SetVariable { execution, name, value, local, transient } => format!(
                "set{}{} '{}' = {} on '{}'",
                if *local { " local" } else { "" },
                if *transient { " transient" } else { "" },
                name,
                value,
                execution
            ),
            ScriptStep::RemoveVariable { execution, name, local } => format!(
                "remove{} '{}' on '{}'",
                if *local { " local" } else { "" },
                name,
                execution
            ),
            ScriptStep::Attach { execution, kind, id } => format!("attach {} '{}' to '{}'", kind, id, execution),
            ScriptStep::Suspend { execution } => format!("suspend '{}'", execution),
            ScriptStep::Activate { execution } => format!("activate '{}'", execution),
            ScriptStep::Guard { execution, operation } => format!("{} on '{}'", operation, execution),
            ScriptStep::Query { execution, condition } => {
                format!("query '{}' {} on '{}'", condition.name, condition.predicate.name(), execution)
            }
        }
    }
}

/// What one step did
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub index: usize,
    pub description: String,
    /// Extra result text, e.g. a query answer
    pub detail: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayReport {
    pub process_instance_id: Uuid,
    pub suspension: SuspensionState,
    pub steps: Vec<StepRecord>,
    /// `None` when the instance ended during the replay
    pub activity_instances: Option<ActivityInstanceTree>,
    pub variables: Vec<(String, String)>,
}

impl ReplayReport {
    pub fn failed_steps(&self) -> usize {
        self.steps.iter().filter(|s| s.error.is_some()).count()
    }
}

/// Replays scripts against a private in-memory runtime
pub struct ScriptRunner {
    service: RuntimeService,
    registry: Arc<InMemoryDependentEntities>,
}

impl ScriptRunner {
    pub fn new(config: EngineConfig) -> Self {
        let registry = Arc::new(InMemoryDependentEntities::new());
        let service = RuntimeService::new(config, Arc::new(InMemoryStorage::new()), registry.clone());
        ScriptRunner { service, registry }
    }

    pub fn service(&self) -> &RuntimeService {
        &self.service
    }

    pub async fn replay(&self, script: &ReplayScript) -> Result<ReplayReport> {
        let mut ctx = self.service.context();
        ctx.actor = script.actor.clone();

        let definition = ProcessDefinitionRef::new(script.definition.key.clone(), script.definition.version);
        let id = self
            .service
            .start_process_instance(definition, script.business_key.clone(), &ctx)
            .await?;
        let root = self.service.with_tree(&id, |t| t.root_id()).await?;

        let mut aliases = HashMap::new();
        aliases.insert(ROOT_ALIAS.to_string(), root);

        let mut steps = Vec::with_capacity(script.steps.len());
        for (index, step) in script.steps.iter().enumerate() {
            let outcome = self.apply(&id, step, &mut aliases, &ctx).await;
            debug!(index, step = %step.describe(), ok = outcome.is_ok(), "replayed step");
            let (detail, error) = match outcome {
                Ok(detail) => (detail, None),
                Err(e) => (None, Some(e.to_string())),
            };
            steps.push(StepRecord { index, description: step.describe(), detail, error });
        }

        let suspension = self.service.with_tree(&id, |t| t.suspension_state()).await?;
        let activity_instances = match self.service.activity_instance_tree(&id).await {
            Ok(tree) => Some(tree),
            Err(ProcessEngineError::InvalidTreeOperation { .. }) => None,
            Err(e) => return Err(e),
        };
        let variables = self
            .service
            .with_tree(&id, |t| {
                t.get_variables_local(&root).map(|vars| {
                    vars.into_iter()
                        .map(|(name, slot)| (name, slot.value.display_value()))
                        .collect::<Vec<_>>()
                })
            })
            .await??;

        Ok(ReplayReport { process_instance_id: id, suspension, steps, activity_instances, variables })
    }

    async fn apply(
        &self,
        id: &Uuid,
        step: &ScriptStep,
        aliases: &mut HashMap<String, ExecutionId>,
        ctx: &crate::models::CommandContext,
    ) -> Result<Option<String>> {
        match step {
            ScriptStep::CreateChild { alias, parent, scope, concurrent } => {
                let parent = resolve(aliases, parent)?;
                let (scope, concurrent) = (*scope, *concurrent);
                let child = self
                    .service
                    .execute(id, ctx, move |tree, _| tree.create_child(&parent, scope, concurrent))
                    .await?;
                aliases.insert(alias.clone(), child);
                Ok(Some(child.to_string()))
            }
            ScriptStep::End { execution } => {
                let execution = resolve(aliases, execution)?;
                self.service.execute(id, ctx, move |tree, _| tree.end(&execution)).await?;
                Ok(None)
            }
            ScriptStep::Move { execution, activity, async_marker } => {
                let execution = resolve(aliases, execution)?;
                let activity = activity.as_deref().map(ActivityId::from);
                let marker = *async_marker;
                self.service
                    .execute(id, ctx, move |tree, _| tree.move_activity_marker(&execution, activity, marker))
                    .await?;
                Ok(None)
            }
            ScriptStep::SetVariable { execution, name, value, local, transient } => {
                let execution = resolve(aliases, execution)?;
                let update = self
                    .service
                    .execute(id, ctx, |tree, serializer| match TypedValue::from_json(value) {
                        Some(typed) if *transient => tree.set_variable_transient(&execution, name, typed),
                        Some(typed) if *local => tree.set_variable_local(&execution, name, typed),
                        Some(typed) => tree.set_variable(&execution, name, typed),
                        None => tree.set_object_variable_local(&execution, name, "json", value, serializer),
                    })
                    .await?;
                Ok(Some(format!("revision {} ({})", update.revision, update.new_type)))
            }
            ScriptStep::RemoveVariable { execution, name, local } => {
                let execution = resolve(aliases, execution)?;
                let removed = self
                    .service
                    .execute(id, ctx, |tree, _| {
                        if *local {
                            tree.remove_variable_local(&execution, name)
                        } else {
                            tree.remove_variable(&execution, name)
                        }
                    })
                    .await?;
                Ok(Some(if removed.is_some() { "removed" } else { "not present" }.to_string()))
            }
            ScriptStep::Attach { execution, kind, id: entity_id } => {
                let execution = resolve(aliases, execution)?;
                let entity = DependentEntityRef { kind: *kind, id: entity_id.clone() };
                let registry = self.registry.clone();
                self.service
                    .execute(id, ctx, move |tree, _| registry.attach(tree, &execution, entity))
                    .await?;
                Ok(None)
            }
            ScriptStep::Suspend { execution } => {
                let execution = resolve(aliases, execution)?;
                let report = self.service.suspend_execution(id, &execution, ctx).await?;
                Ok(Some(format!("{} execution(s) changed", report.changed_executions)))
            }
            ScriptStep::Activate { execution } => {
                let execution = resolve(aliases, execution)?;
                let report = self.service.activate_execution(id, &execution, ctx).await?;
                Ok(Some(format!("{} execution(s) changed", report.changed_executions)))
            }
            ScriptStep::Guard { execution, operation } => {
                let execution = resolve(aliases, execution)?;
                let operation = *operation;
                self.service
                    .with_tree(id, |tree| tree.ensure_permitted(&execution, operation))
                    .await??;
                Ok(Some("permitted".to_string()))
            }
            ScriptStep::Query { execution, condition } => {
                let execution = resolve(aliases, execution)?;
                let matched = self
                    .service
                    .with_tree(id, |tree| tree.variable_matches(&execution, condition))
                    .await??;
                Ok(Some(if matched { "match" } else { "no match" }.to_string()))
            }
        }
    }
}

fn resolve(aliases: &HashMap<String, ExecutionId>, alias: &str) -> Result<ExecutionId> {
    aliases
        .get(alias)
        .copied()
        .ok_or_else(|| ProcessEngineError::InvalidInput(format!("unknown execution alias '{}'", alias)))
}
