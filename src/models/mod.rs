// Core domain models for the process runtime
// These are plain data structures; the operations live in `engine`

//! # Domain Models Module
//!
//! Plain, serializable data for one process instance:
//!
//! - `ids`: execution, activity and definition identifiers
//! - `execution`: the execution node and its lifecycle/suspension states
//! - `variable`: typed values, slots and the per-scope variable store
//! - `dependent`: tasks, jobs and external-task locks bound to executions
//! - `activity_instance`: the projected activity/transition instance tree
//! - `event`: change events buffered by the tree
//! - `context`: injected clock and actor context

pub mod activity_instance;
pub mod context;
pub mod dependent;
pub mod event;
pub mod execution;
pub mod ids;
pub mod variable;

pub use activity_instance::{ActivityInstance, ActivityInstanceTree, ProjectedInstance, TransitionInstance};
pub use context::{Clock, CommandContext, FixedClock, SystemClock};
pub use dependent::{DependentEntityKind, DependentEntityRef};
pub use event::{EventType, ExecutionEvent};
pub use execution::{AsyncMarker, ExecutionNode, LifecycleState, SuspensionState};
pub use ids::{ActivityId, ExecutionId, ProcessDefinitionRef};
pub use variable::{
    ObjectValue, TypedValue, ValueHandle, ValueType, VariableSlot, VariableStore, VariableUpdate,
};
