// Identifiers for execution nodes, model activities and process definitions

//! # Identifiers
//!
//! The execution tree never holds references between nodes. Every link is an
//! id that is resolved through the tree's arena, so the id types here are the
//! only "pointers" in the model:
//!
//! - [`ExecutionId`]: stable identity of one execution node, never reused
//! - [`ActivityId`]: model element an execution is currently positioned at
//! - [`ProcessDefinitionRef`]: which deployed definition an instance runs
//!
//! The root execution of a process instance shares its UUID with the process
//! instance, so `process_instance_id == root.id.as_uuid()`.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of a single execution node.
///
/// Generated once when the node is created and never reused, even after the
/// node has ended and been purged from the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExecutionId(pub Uuid);

impl ExecutionId {
    /// Generate a fresh random id
    pub fn new() -> Self {
        ExecutionId(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for ExecutionId {
    fn from(id: Uuid) -> Self {
        ExecutionId(id)
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// **Model activity** - the element of the process model an execution is "at"
///
/// The runtime never interprets activity ids; they are opaque strings chosen
/// by whoever deployed the model ("userTask", "approveInvoice", "subProcess").
///
/// ```rust
/// # use process_runtime::ActivityId;
/// let a = ActivityId::from("approve");
/// assert_eq!(a.as_str(), "approve");
/// assert_eq!(a, ActivityId::new("approve"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActivityId(pub String);

impl ActivityId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn new<S: Into<String>>(name: S) -> Self {
        ActivityId(name.into())
    }
}

impl From<&str> for ActivityId {
    fn from(s: &str) -> Self {
        ActivityId(s.to_string())
    }
}

impl From<String> for ActivityId {
    fn from(s: String) -> Self {
        ActivityId(s)
    }
}

impl std::fmt::Display for ActivityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Reference to the deployed process definition an instance executes.
///
/// Suspension "by definition id" and "by definition key" are resolved against
/// these fields; the key stays stable across versions while the id does not.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessDefinitionRef {
    /// Version-specific id, e.g. `invoice:3:8f1c...`
    pub id: String,

    /// Key shared by every version of the definition, e.g. `invoice`
    pub key: String,

    pub version: u32,
}

impl ProcessDefinitionRef {
    pub fn new<K: Into<String>>(key: K, version: u32) -> Self {
        let key = key.into();
        ProcessDefinitionRef {
            id: format!("{}:{}", key, version),
            key,
            version,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_ids_are_unique() {
        let a = ExecutionId::new();
        let b = ExecutionId::new();
        assert_ne!(a, b);
        assert_eq!(ExecutionId::from(a.as_uuid()), a);
    }

    #[test]
    fn test_activity_id_conversions() {
        let from_str = ActivityId::from("task");
        let from_string = ActivityId::from("task".to_string());
        assert_eq!(from_str, from_string);
        assert_eq!(format!("{}", from_str), "task");
    }

    #[test]
    fn test_definition_ref_id_includes_version() {
        let def = ProcessDefinitionRef::new("invoice", 2);
        assert_eq!(def.id, "invoice:2");
        assert_eq!(def.key, "invoice");
        assert_eq!(def.version, 2);
    }
}
