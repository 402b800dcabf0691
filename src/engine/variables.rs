// Scoped variable resolution over the execution tree

//! # Scoped Variables
//!
//! Every scope execution owns one [`VariableStore`]; non-scope executions own
//! none and read and write through their nearest scope. Lookups walk the
//! scope chain upward:
//!
//! ```text
//! root (scope)        x = 1, y = "a"
//!  └─ sub (scope)     x = 5              get(leaf, "x") -> 5 (sub shadows root)
//!      └─ leaf                           get(leaf, "y") -> "a" (found on root)
//! ```
//!
//! ## Local vs. scoped operations
//!
//! - `*_local` operations target the owning scope's store only.
//! - [`set_variable`](ExecutionTree::set_variable) updates the nearest
//!   existing binding wherever it lives and only creates a new local slot when
//!   no scope on the chain has one, so it never shadows silently.
//! - [`remove_variable`](ExecutionTree::remove_variable) removes the nearest
//!   binding; removing a missing variable is a no-op.
//!
//! Variable writes are data-only: they are allowed on suspended executions
//! and refused only for ENDED ones.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::engine::serializer::ValueSerializer;
use crate::engine::suspension::{ensure_permitted, GuardedOperation};
use crate::engine::tree::ExecutionTree;
use crate::models::{
    EventType, ExecutionId, ObjectValue, TypedValue, ValueType, VariableSlot, VariableStore,
    VariableUpdate,
};
use crate::{ProcessEngineError, Result};

/// A resolved variable as handed to the read side.
///
/// When the value was materialized and the serializer failed, the failure is
/// carried in `error_message` instead of failing the whole read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableInstance {
    pub name: String,
    pub scope: ExecutionId,
    pub value: TypedValue,
    pub value_type: ValueType,
    pub revision: u32,
    pub transient: bool,
    pub materialized: Option<serde_json::Value>,
    pub error_message: Option<String>,
}

impl ExecutionTree {
    /// Read `name` from the owning scope of `node` only
    pub fn get_variable_local(&self, node: &ExecutionId, name: &str) -> Result<Option<&VariableSlot>> {
        let scope = self.owning_scope(node)?;
        Ok(self.store(&scope)?.get(name))
    }

    /// Read `name` from the nearest scope on the chain that has it
    pub fn get_variable(&self, node: &ExecutionId, name: &str) -> Result<Option<&VariableSlot>> {
        Ok(self.find_variable(node, name)?.map(|(_, slot)| slot))
    }

    /// Like [`get_variable`](Self::get_variable) but also names the scope the
    /// slot was found in
    pub fn find_variable(
        &self,
        node: &ExecutionId,
        name: &str,
    ) -> Result<Option<(ExecutionId, &VariableSlot)>> {
        for scope in self.scope_chain(node)? {
            if let Some(slot) = self.store(&scope)?.get(name) {
                return Ok(Some((scope, slot)));
            }
        }
        Ok(None)
    }

    /// All variables visible from `node`; nearer scopes shadow farther ones
    pub fn get_variables(&self, node: &ExecutionId) -> Result<BTreeMap<String, &VariableSlot>> {
        let mut visible = BTreeMap::new();
        for scope in self.scope_chain(node)? {
            for slot in self.store(&scope)?.iter() {
                visible.entry(slot.name.clone()).or_insert(slot);
            }
        }
        Ok(visible)
    }

    pub fn get_variables_local(&self, node: &ExecutionId) -> Result<BTreeMap<String, &VariableSlot>> {
        let scope = self.owning_scope(node)?;
        Ok(self
            .store(&scope)?
            .iter()
            .map(|slot| (slot.name.clone(), slot))
            .collect())
    }

    /// Write into the owning scope of `node`, creating the slot if needed
    pub fn set_variable_local(
        &mut self,
        node: &ExecutionId,
        name: &str,
        value: TypedValue,
    ) -> Result<VariableUpdate> {
        self.ensure_writable(node, GuardedOperation::SetVariable)?;
        let scope = self.owning_scope(node)?;
        self.write_slot(scope, name, value, false)
    }

    /// Write a transient slot into the owning scope of `node`.
    ///
    /// Transient slots are readable for the rest of the command but never
    /// appear in snapshots.
    pub fn set_variable_transient(
        &mut self,
        node: &ExecutionId,
        name: &str,
        value: TypedValue,
    ) -> Result<VariableUpdate> {
        self.ensure_writable(node, GuardedOperation::SetVariable)?;
        let scope = self.owning_scope(node)?;
        self.write_slot(scope, name, value, true)
    }

    /// Update the nearest existing binding of `name`, or create a local one
    pub fn set_variable(
        &mut self,
        node: &ExecutionId,
        name: &str,
        value: TypedValue,
    ) -> Result<VariableUpdate> {
        self.ensure_writable(node, GuardedOperation::SetVariable)?;
        let (scope, transient) = self.write_target(node, name)?;
        self.write_slot(scope, name, value, transient)
    }

    /// Scoped write of several variables.
    ///
    /// Every target is resolved before anything is written, so a rejected
    /// name leaves all stores unchanged.
    pub fn set_variables<I>(&mut self, node: &ExecutionId, variables: I) -> Result<Vec<VariableUpdate>>
    where
        I: IntoIterator<Item = (String, TypedValue)>,
    {
        self.ensure_writable(node, GuardedOperation::SetVariable)?;
        let mut planned = Vec::new();
        for (name, value) in variables {
            let (scope, transient) = self.write_target(node, &name)?;
            planned.push((scope, name, value, transient));
        }
        planned
            .into_iter()
            .map(|(scope, name, value, transient)| self.write_slot(scope, &name, value, transient))
            .collect()
    }

    pub fn set_variables_local<I>(&mut self, node: &ExecutionId, variables: I) -> Result<Vec<VariableUpdate>>
    where
        I: IntoIterator<Item = (String, TypedValue)>,
    {
        self.ensure_writable(node, GuardedOperation::SetVariable)?;
        let scope = self.owning_scope(node)?;
        let planned: Vec<(String, TypedValue)> = variables.into_iter().collect();
        {
            let store = self.store(&scope)?;
            if let Some((name, _)) = planned
                .iter()
                .find(|(name, _)| store.get(name).map_or(false, |slot| slot.transient))
            {
                return Err(ProcessEngineError::InvalidInput(format!(
                    "Cannot set transient variable with name '{}' to non-transient variable and vice versa",
                    name
                )));
            }
        }
        planned
            .into_iter()
            .map(|(name, value)| self.write_slot(scope, &name, value, false))
            .collect()
    }

    /// Remove the nearest binding of `name`; a missing name is a no-op
    pub fn remove_variable(&mut self, node: &ExecutionId, name: &str) -> Result<Option<VariableSlot>> {
        self.ensure_writable(node, GuardedOperation::RemoveVariable)?;
        let scope = match self.find_variable(node, name)? {
            Some((scope, _)) => scope,
            None => return Ok(None),
        };
        self.remove_slot(scope, name)
    }

    /// Remove `name` from the owning scope only
    pub fn remove_variable_local(&mut self, node: &ExecutionId, name: &str) -> Result<Option<VariableSlot>> {
        self.ensure_writable(node, GuardedOperation::RemoveVariable)?;
        let scope = self.owning_scope(node)?;
        self.remove_slot(scope, name)
    }

    pub fn remove_variables<'a, I>(&mut self, node: &ExecutionId, names: I) -> Result<Vec<VariableSlot>>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut removed = Vec::new();
        for name in names {
            if let Some(slot) = self.remove_variable(node, name)? {
                removed.push(slot);
            }
        }
        Ok(removed)
    }

    /// Serialize `value` through `serializer` and store the handle as a local
    /// object variable
    pub fn set_object_variable_local(
        &mut self,
        node: &ExecutionId,
        name: &str,
        type_name: &str,
        value: &serde_json::Value,
        serializer: &dyn ValueSerializer,
    ) -> Result<VariableUpdate> {
        self.ensure_writable(node, GuardedOperation::SetVariable)?;
        let handle = serializer.serialize(type_name, value)?;
        let object = ObjectValue { type_name: type_name.to_string(), handle };
        self.set_variable_local(node, name, TypedValue::Object(Some(object)))
    }

    /// Materialize a serialized (object or bytes) variable.
    ///
    /// Fails with `Deserialization` when the serializer cannot produce the
    /// value. Primitive variables are returned as their JSON rendering.
    pub fn get_object_variable(
        &self,
        node: &ExecutionId,
        name: &str,
        serializer: &dyn ValueSerializer,
    ) -> Result<Option<serde_json::Value>> {
        let slot = match self.get_variable(node, name)? {
            Some(slot) => slot,
            None => return Ok(None),
        };
        materialize(&slot.name, &slot.value, serializer)
    }

    /// Resolve `name` into a [`VariableInstance`], optionally materializing
    /// serialized values. Deserialization failures are attached to the
    /// instance rather than returned.
    pub fn variable_instance(
        &self,
        node: &ExecutionId,
        name: &str,
        serializer: Option<&dyn ValueSerializer>,
    ) -> Result<Option<VariableInstance>> {
        let (scope, slot) = match self.find_variable(node, name)? {
            Some(found) => found,
            None => return Ok(None),
        };

        let (materialized, error_message) = match serializer {
            Some(serializer) if slot.value.is_serialized() => {
                match materialize(&slot.name, &slot.value, serializer) {
                    Ok(value) => (value, None),
                    Err(e) => (None, Some(e.to_string())),
                }
            }
            _ => (None, None),
        };

        Ok(Some(VariableInstance {
            name: slot.name.clone(),
            scope,
            value: slot.value.clone(),
            value_type: slot.value_type,
            revision: slot.revision,
            transient: slot.transient,
            materialized,
            error_message,
        }))
    }

    fn store(&self, scope: &ExecutionId) -> Result<&VariableStore> {
        self.get(scope)?
            .variables
            .as_ref()
            .ok_or_else(|| missing_store(scope))
    }

    fn ensure_writable(&self, node: &ExecutionId, operation: GuardedOperation) -> Result<()> {
        let execution = self.get(node)?;
        if execution.is_ended() {
            return Err(ProcessEngineError::InvalidTreeOperation {
                execution: node.to_string(),
                reason: "cannot change variables of an ended execution".to_string(),
            });
        }
        ensure_permitted(execution, operation)
    }

    /// Scope a scoped write lands in, and whether the existing slot is transient
    fn write_target(&self, node: &ExecutionId, name: &str) -> Result<(ExecutionId, bool)> {
        match self.find_variable(node, name)? {
            Some((scope, slot)) => Ok((scope, slot.transient)),
            None => Ok((self.owning_scope(node)?, false)),
        }
    }

    fn write_slot(
        &mut self,
        scope: ExecutionId,
        name: &str,
        value: TypedValue,
        transient: bool,
    ) -> Result<VariableUpdate> {
        let now = self.now();
        let store = self
            .get_mut(&scope)?
            .variables
            .as_mut()
            .ok_or_else(|| missing_store(&scope))?;
        let displaced = store
            .get(name)
            .and_then(|slot| slot.value.value_handle())
            .filter(|old| value.value_handle() != Some(*old))
            .cloned();
        let update = store.put(scope, name, value, transient, now)?;
        if let Some(handle) = displaced {
            self.release_handle(handle);
        }

        let event = match update.previous_type {
            None => EventType::VariableCreated { name: name.to_string(), value_type: update.new_type },
            Some(previous_type) => EventType::VariableUpdated {
                name: name.to_string(),
                revision: update.revision,
                previous_type,
                value_type: update.new_type,
            },
        };
        self.record(scope, event);
        debug!(scope = %scope, variable = name, revision = update.revision, "wrote variable");
        Ok(update)
    }

    fn remove_slot(&mut self, scope: ExecutionId, name: &str) -> Result<Option<VariableSlot>> {
        let removed = self
            .get_mut(&scope)?
            .variables
            .as_mut()
            .ok_or_else(|| missing_store(&scope))?
            .remove(name);
        if let Some(slot) = &removed {
            if let Some(handle) = slot.value.value_handle() {
                self.release_handle(handle.clone());
            }
            self.record(scope, EventType::VariableDeleted { name: name.to_string() });
            debug!(scope = %scope, variable = name, "removed variable");
        }
        Ok(removed)
    }
}

fn missing_store(scope: &ExecutionId) -> ProcessEngineError {
    ProcessEngineError::InvalidTreeOperation {
        execution: scope.to_string(),
        reason: "scope execution has no variable store".to_string(),
    }
}

fn materialize(
    name: &str,
    value: &TypedValue,
    serializer: &dyn ValueSerializer,
) -> Result<Option<serde_json::Value>> {
    let handle = match value {
        TypedValue::Object(Some(object)) => &object.handle,
        TypedValue::Bytes(Some(handle)) => handle,
        other if other.is_null() => return Ok(None),
        other => return Ok(Some(primitive_json(other))),
    };
    serializer
        .deserialize(handle)
        .map(Some)
        .map_err(|e| ProcessEngineError::Deserialization {
            variable: name.to_string(),
            reason: e.to_string(),
        })
}

fn primitive_json(value: &TypedValue) -> serde_json::Value {
    match value {
        TypedValue::Boolean(Some(v)) => serde_json::Value::from(*v),
        TypedValue::Integer(Some(v)) => serde_json::Value::from(*v),
        TypedValue::Long(Some(v)) => serde_json::Value::from(*v),
        TypedValue::Double(Some(v)) => serde_json::Value::from(*v),
        TypedValue::String(Some(v)) => serde_json::Value::from(v.as_str()),
        TypedValue::Date(Some(v)) => serde_json::Value::from(v.to_rfc3339()),
        _ => serde_json::Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::serializer::InMemoryValueSerializer;
    use crate::models::{FixedClock, ProcessDefinitionRef};
    use chrono::Utc;
    use serde_json::json;
    use std::sync::Arc;

    fn tree() -> ExecutionTree {
        ExecutionTree::start(
            ProcessDefinitionRef::new("vars", 1),
            None,
            Arc::new(FixedClock::new(Utc::now())),
        )
    }

    #[test]
    fn test_non_scope_child_reads_parent_scope() {
        let mut tree = tree();
        let root = tree.root_id();
        tree.set_variable_local(&root, "x", TypedValue::from(1)).unwrap();
        let child = tree.create_child(&root, false, false).unwrap();

        let slot = tree.get_variable(&child, "x").unwrap().unwrap();
        assert_eq!(slot.value, TypedValue::from(1));

        // non-scope child shares its scope's store, so local reads see it too
        assert!(tree.get_variable_local(&child, "x").unwrap().is_some());
    }

    #[test]
    fn test_scoped_set_updates_existing_binding() {
        let mut tree = tree();
        let root = tree.root_id();
        tree.set_variable_local(&root, "x", TypedValue::from(1)).unwrap();
        let sub = tree.create_child(&root, true, false).unwrap();

        let update = tree.set_variable(&sub, "x", TypedValue::from(2)).unwrap();
        assert_eq!(update.scope, root);
        assert_eq!(update.revision, 2);
        assert!(tree.get_variable_local(&sub, "x").unwrap().is_none());
        assert_eq!(
            tree.get_variable_local(&root, "x").unwrap().unwrap().value,
            TypedValue::from(2)
        );
    }

    #[test]
    fn test_local_set_shadows_without_touching_parent() {
        let mut tree = tree();
        let root = tree.root_id();
        tree.set_variable_local(&root, "x", TypedValue::from(1)).unwrap();
        let sub = tree.create_child(&root, true, false).unwrap();

        tree.set_variable_local(&sub, "x", TypedValue::from("shadow")).unwrap();

        assert_eq!(tree.get_variable(&sub, "x").unwrap().unwrap().value, TypedValue::from("shadow"));
        assert_eq!(tree.get_variable(&root, "x").unwrap().unwrap().value, TypedValue::from(1));

        let visible = tree.get_variables(&sub).unwrap();
        assert_eq!(visible["x"].value, TypedValue::from("shadow"));
    }

    #[test]
    fn test_set_without_binding_creates_local_slot() {
        let mut tree = tree();
        let root = tree.root_id();
        let sub = tree.create_child(&root, true, false).unwrap();

        let update = tree.set_variable(&sub, "fresh", TypedValue::from(true)).unwrap();
        assert!(update.created());
        assert_eq!(update.scope, sub);
        assert!(tree.get_variable(&root, "fresh").unwrap().is_none());
    }

    #[test]
    fn test_type_change_is_reported() {
        let mut tree = tree();
        let root = tree.root_id();
        tree.set_variable_local(&root, "v", TypedValue::from(7)).unwrap();
        let update = tree.set_variable_local(&root, "v", TypedValue::from("seven")).unwrap();

        assert!(update.type_changed());
        assert_eq!(update.previous_type, Some(ValueType::Integer));
        assert_eq!(tree.get_variable(&root, "v").unwrap().unwrap().value_type, ValueType::String);
    }

    #[test]
    fn test_typed_null_slot_is_not_absent() {
        let mut tree = tree();
        let root = tree.root_id();
        tree.set_variable_local(&root, "maybe", TypedValue::String(None)).unwrap();

        let slot = tree.get_variable(&root, "maybe").unwrap().unwrap();
        assert!(slot.value.is_null());
        assert_eq!(slot.value_type, ValueType::String);
        assert!(tree.get_variable(&root, "never").unwrap().is_none());
    }

    #[test]
    fn test_remove_mirrors_resolution_and_ignores_missing() {
        let mut tree = tree();
        let root = tree.root_id();
        tree.set_variable_local(&root, "x", TypedValue::from(1)).unwrap();
        let sub = tree.create_child(&root, true, false).unwrap();
        tree.set_variable_local(&sub, "x", TypedValue::from(2)).unwrap();

        // removes the shadowing slot first, then the outer one
        tree.remove_variable(&sub, "x").unwrap();
        assert_eq!(tree.get_variable(&sub, "x").unwrap().unwrap().value, TypedValue::from(1));
        tree.remove_variable(&sub, "x").unwrap();
        assert!(tree.get_variable(&sub, "x").unwrap().is_none());

        assert!(tree.remove_variable(&sub, "x").unwrap().is_none());
        assert!(tree.remove_variable_local(&sub, "nothing").unwrap().is_none());
    }

    #[test]
    fn test_batch_set_is_all_or_nothing() {
        let mut tree = tree();
        let root = tree.root_id();
        tree.set_variable_transient(&root, "t", TypedValue::from(1)).unwrap();

        let err = tree
            .set_variables_local(
                &root,
                vec![
                    ("a".to_string(), TypedValue::from(1)),
                    ("t".to_string(), TypedValue::from(2)),
                ],
            )
            .unwrap_err();
        assert!(matches!(err, ProcessEngineError::InvalidInput(_)));
        assert!(tree.get_variable(&root, "a").unwrap().is_none());
    }

    #[test]
    fn test_writes_to_ended_execution_fail() {
        let mut tree = tree();
        let root = tree.root_id();
        let child = tree.create_child(&root, true, false).unwrap();
        tree.end(&child).unwrap();

        let err = tree.set_variable_local(&child, "x", TypedValue::from(1)).unwrap_err();
        assert!(matches!(err, ProcessEngineError::InvalidTreeOperation { .. }));
    }

    #[test]
    fn test_object_variables_round_trip_through_serializer() {
        let serializer = InMemoryValueSerializer::new();
        let mut tree = tree();
        let root = tree.root_id();
        let invoice = json!({"amount": 120, "currency": "EUR"});

        tree.set_object_variable_local(&root, "invoice", "invoice", &invoice, &serializer)
            .unwrap();

        let slot = tree.get_variable(&root, "invoice").unwrap().unwrap();
        assert_eq!(slot.value_type, ValueType::Object);
        assert_eq!(
            tree.get_object_variable(&root, "invoice", &serializer).unwrap(),
            Some(invoice)
        );
    }

    #[test]
    fn test_overwrite_and_remove_hand_back_displaced_handles() {
        let serializer = InMemoryValueSerializer::new();
        let mut tree = tree();
        let root = tree.root_id();

        tree.set_object_variable_local(&root, "doc", "doc", &json!({"v": 1}), &serializer).unwrap();
        let first = tree.value_handles();
        tree.set_object_variable_local(&root, "doc", "doc", &json!({"v": 2}), &serializer).unwrap();
        assert_eq!(tree.drain_released_handles(), first);

        // a primitive overwrite displaces the remaining handle too
        let second = tree.value_handles();
        tree.set_variable_local(&root, "doc", TypedValue::from("plain")).unwrap();
        assert_eq!(tree.drain_released_handles(), second);
        assert!(tree.value_handles().is_empty());

        tree.set_object_variable_local(&root, "doc", "doc", &json!([1]), &serializer).unwrap();
        let third = tree.value_handles();
        tree.remove_variable(&root, "doc").unwrap();
        assert_eq!(tree.drain_released_handles(), third);
        assert!(tree.drain_released_handles().is_empty());
    }

    #[test]
    fn test_deserialization_failure_is_deferred_to_reads() {
        let serializer = InMemoryValueSerializer::new();
        let mut tree = tree();
        let root = tree.root_id();
        tree.set_object_variable_local(&root, "blob", "blob", &json!([1, 2, 3]), &serializer)
            .unwrap();

        let handle = match &tree.get_variable(&root, "blob").unwrap().unwrap().value {
            TypedValue::Object(Some(object)) => object.handle.clone(),
            other => panic!("unexpected value {:?}", other),
        };
        serializer.corrupt(&handle);

        // the slot is still there and still typed
        let instance = tree.variable_instance(&root, "blob", Some(&serializer)).unwrap().unwrap();
        assert_eq!(instance.value_type, ValueType::Object);
        assert!(instance.error_message.is_some());
        assert!(instance.materialized.is_none());

        // materialized reads surface the failure
        let err = tree.get_object_variable(&root, "blob", &serializer).unwrap_err();
        assert!(matches!(err, ProcessEngineError::Deserialization { .. }));

        // other variables are unaffected
        tree.set_variable_local(&root, "other", TypedValue::from(1)).unwrap();
    }
}
