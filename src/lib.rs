// Process Runtime - execution core of a BPMN process engine
// Execution trees, scoped variables, cascading suspension and activity instance projection

//! # Process Runtime Library
//!
//! The runtime core a BPMN interpreter sits on. The interpreter itself (model
//! parsing, deciding what runs next) lives elsewhere; this crate owns the
//! state it manipulates and the rules that state obeys.
//!
//! ## Core Components
//!
//! ### Execution Tree
//! [`ExecutionTree`] is the physical tree of one process instance: an arena
//! of [`ExecutionNode`]s linked by id. The interpreter creates and ends
//! children and moves activity markers; every structural call is
//! all-or-nothing.
//!
//! ### Scoped Variables
//! Scope executions own a [`VariableStore`]. Reads walk the scope chain
//! nearest-first, `set` updates the nearest existing binding, `*_local`
//! operations never leave the owning scope. [`VariablePredicate`]s test slots
//! by declared type and keep "absent" and "holds null" apart.
//!
//! ### Suspension
//! [`SuspensionController`] suspends or activates a subtree, then mirrors the
//! new state onto dependent tasks, jobs and external-task locks through a
//! [`DependentEntityRegistry`]. Lifecycle-affecting operations on suspended
//! executions are rejected; data-only ones are not.
//!
//! ### Projection
//! [`InstanceTreeProjector`] turns the physical tree into the logical
//! [`ActivityInstanceTree`] users ask about, failing closed when the tree
//! changes mid-read.
//!
//! ### Runtime Facade
//! [`RuntimeService`] ties it together for many instances: one writer lock
//! per instance, event publishing, snapshot persistence and the
//! "all instances of a definition" suspension operations.
//!
//! ```rust
//! use process_runtime::{ExecutionTree, ProcessDefinitionRef, SystemClock, TypedValue};
//! use std::sync::Arc;
//!
//! let mut tree = ExecutionTree::start(ProcessDefinitionRef::new("invoice", 1), None, Arc::new(SystemClock));
//! let root = tree.root_id();
//! tree.set_variable_local(&root, "amount", TypedValue::from(120)).unwrap();
//! let branch = tree.create_child(&root, false, false).unwrap();
//! assert_eq!(tree.get_variable(&branch, "amount").unwrap().unwrap().value, TypedValue::from(120));
//! ```

pub mod config;
pub mod engine;
pub mod models;

pub use config::EngineConfig;

pub use models::{
    ActivityId, ActivityInstance, ActivityInstanceTree, AsyncMarker, Clock, CommandContext,
    DependentEntityKind, DependentEntityRef, EventType, ExecutionEvent, ExecutionId, ExecutionNode,
    FixedClock, LifecycleState, ObjectValue, ProcessDefinitionRef, ProjectedInstance,
    SuspensionState, SystemClock, TransitionInstance, TypedValue, ValueHandle, ValueType,
    VariableSlot, VariableStore, VariableUpdate,
};

pub use engine::{
    ensure_permitted, CallbackOutcome, CascadeReport, DependentEntityRegistry, EventBus,
    ExecutionTree, GuardedOperation, InMemoryDependentEntities, InMemoryStorage,
    InMemoryValueSerializer, InstanceTreeProjector, ProcessInstanceStorage, RuntimeService,
    SharedExecutionTree, SuspensionController, TreeSnapshotSource, ValueSerializer,
    VariableCondition, VariableInstance, VariablePredicate,
};

/// Errors raised by the process runtime
#[derive(Debug, thiserror::Error)]
pub enum ProcessEngineError {
    /// A structural precondition was violated; a bug in the calling interpreter
    #[error("Invalid tree operation on execution {execution}: {reason}")]
    InvalidTreeOperation { execution: String, reason: String },

    /// A lifecycle-affecting operation hit a suspended execution
    #[error("Cannot {operation} on execution {execution}: it is suspended")]
    SuspendedEntityInteraction { operation: String, execution: String },

    #[error("Unsupported comparison in {predicate}: {reason}")]
    UnsupportedComparison { predicate: String, reason: String },

    /// The tree changed while it was being projected; project again
    #[error("Inconsistent tree snapshot (expected revision {expected}, observed {observed}): {detail}")]
    InconsistentTreeSnapshot { expected: u64, observed: u64, detail: String },

    #[error("Cannot deserialize variable {variable}: {reason}")]
    Deserialization { variable: String, reason: String },

    /// Flags were applied but some dependent-entity callbacks failed
    #[error("Cascade to {state} from execution {root} incomplete: {}", .failures.join("; "))]
    CascadeFailed { root: String, state: String, failures: Vec<String> },

    /// A dependent-entity service rejected a suspension callback
    #[error("Dependent {kind} callback for execution {execution} failed: {reason}")]
    DependentEntityFailure { kind: String, execution: String, reason: String },

    #[error("Execution not found: {id}")]
    ExecutionNotFound { id: String },

    #[error("Process instance not found: {id}")]
    ProcessInstanceNotFound { id: String },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Storage error: {0}")]
    Storage(#[from] anyhow::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ::config::ConfigError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ProcessEngineError {
    /// Whether the caller may simply run the same operation again
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProcessEngineError::InconsistentTreeSnapshot { .. } | ProcessEngineError::CascadeFailed { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, ProcessEngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        let snapshot = ProcessEngineError::InconsistentTreeSnapshot {
            expected: 3,
            observed: 4,
            detail: "moved".to_string(),
        };
        assert!(snapshot.is_retryable());
        assert!(!ProcessEngineError::InvalidInput("x".to_string()).is_retryable());
    }

    #[test]
    fn test_cascade_failure_message_lists_failures() {
        let err = ProcessEngineError::CascadeFailed {
            root: "r".to_string(),
            state: "suspended".to_string(),
            failures: vec!["task a: down".to_string(), "job b: down".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "Cascade to suspended from execution r incomplete: task a: down; job b: down"
        );
    }
}
