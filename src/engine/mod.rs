// Process runtime engine
// Operations over the domain models in `models`

//! # Engine Module
//!
//! - `tree`: the execution tree arena and its structural operations
//! - `variables`: scoped variable resolution, implemented on the tree
//! - `predicate`: variable predicates for the query layer
//! - `serializer`: value serialization collaborator for object variables
//! - `suspension`: guard policy and the cascading suspension controller
//! - `projector`: activity instance projection over a snapshot source
//! - `events`: broadcast bus for execution events
//! - `storage`: snapshot persistence
//! - `runtime`: the multi-instance facade
//! - `script`: JSON replay scripts used by the admin CLI

pub mod events;
pub mod predicate;
pub mod projector;
pub mod runtime;
pub mod script;
pub mod serializer;
pub mod storage;
pub mod suspension;
pub mod tree;
pub mod variables;

#[cfg(test)]
mod tests;

pub use events::EventBus;
pub use predicate::{VariableCondition, VariablePredicate};
pub use projector::{InstanceTreeProjector, NodeView, SharedExecutionTree, TreeHeader, TreeSnapshotSource};
pub use runtime::{BatchReport, RuntimeService};
pub use script::{ReplayReport, ReplayScript, ScriptRunner, ScriptStep};
pub use serializer::{InMemoryValueSerializer, ValueSerializer};
pub use storage::{InMemoryStorage, ProcessInstanceStorage};
pub use suspension::{
    ensure_permitted, CallbackOutcome, CascadePlan, CascadeReport, DependentEntityRegistry,
    GuardedOperation, InMemoryDependentEntities, SuspensionController,
};
pub use tree::ExecutionTree;
pub use variables::VariableInstance;
