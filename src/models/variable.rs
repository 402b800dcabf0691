// Typed variable values and the slots that hold them

//! # Variable Models
//!
//! A process variable is a named, typed slot inside the store of a scope
//! execution. This module defines the value side of that:
//!
//! - [`ValueType`]: the declared type tag recorded on every write
//! - [`TypedValue`]: a value together with its type; every typed variant may
//!   hold `None`, which is a *typed null* (e.g. a string variable set to null)
//! - [`ObjectValue`]: a non-primitive value that only exists here as an opaque
//!   [`ValueHandle`] produced by the value serializer
//! - [`VariableSlot`]: value + type tag + revision counter
//! - [`VariableUpdate`]: what a write did, used for events and type-change
//!   detection
//!
//! ## Typed null vs. absent
//!
//! `TypedValue::String(None)` is a slot that exists and holds null. An absent
//! variable has no slot at all and is represented as `Option::None` by every
//! lookup. The predicate module relies on that distinction.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::ExecutionId;
use crate::{ProcessEngineError, Result};

/// Declared type of a variable slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Null,
    Boolean,
    Integer,
    Long,
    Double,
    String,
    Date,
    Bytes,
    Object,
}

impl ValueType {
    /// Integer and Long compare as one integral family
    pub fn is_integral(&self) -> bool {
        matches!(self, ValueType::Integer | ValueType::Long)
    }

    /// Types that support ordering predicates
    pub fn is_orderable(&self) -> bool {
        matches!(
            self,
            ValueType::Integer | ValueType::Long | ValueType::Double | ValueType::String | ValueType::Date
        )
    }

    /// Whether values of `self` and `other` may be compared at all
    pub fn is_compatible_with(&self, other: &ValueType) -> bool {
        self == other || (self.is_integral() && other.is_integral())
    }

    pub fn name(&self) -> &'static str {
        match self {
            ValueType::Null => "null",
            ValueType::Boolean => "boolean",
            ValueType::Integer => "integer",
            ValueType::Long => "long",
            ValueType::Double => "double",
            ValueType::String => "string",
            ValueType::Date => "date",
            ValueType::Bytes => "bytes",
            ValueType::Object => "object",
        }
    }
}

impl std::fmt::Display for ValueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Opaque reference to a serialized value owned by the value serializer
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ValueHandle(pub Uuid);

impl ValueHandle {
    pub fn new() -> Self {
        ValueHandle(Uuid::new_v4())
    }
}

impl Default for ValueHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ValueHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A non-primitive value in serialized form.
///
/// Only the handle and the declared object type are kept. Two object values
/// are equal when they point at the same handle; the content is never
/// inspected here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectValue {
    /// Application-level type name, e.g. `"invoice"` or `"application/json"`
    pub type_name: String,

    pub handle: ValueHandle,
}

/// A variable value tagged with its declared type.
///
/// Every typed variant carries an `Option`; `None` is a typed null.
/// `TypedValue::Null` is the untyped null.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum TypedValue {
    Null,
    Boolean(Option<bool>),
    Integer(Option<i32>),
    Long(Option<i64>),
    Double(Option<f64>),
    String(Option<String>),
    Date(Option<DateTime<Utc>>),
    Bytes(Option<ValueHandle>),
    Object(Option<ObjectValue>),
}

impl TypedValue {
    pub fn value_type(&self) -> ValueType {
        match self {
            TypedValue::Null => ValueType::Null,
            TypedValue::Boolean(_) => ValueType::Boolean,
            TypedValue::Integer(_) => ValueType::Integer,
            TypedValue::Long(_) => ValueType::Long,
            TypedValue::Double(_) => ValueType::Double,
            TypedValue::String(_) => ValueType::String,
            TypedValue::Date(_) => ValueType::Date,
            TypedValue::Bytes(_) => ValueType::Bytes,
            TypedValue::Object(_) => ValueType::Object,
        }
    }

    /// True for the untyped null and for every typed null
    pub fn is_null(&self) -> bool {
        match self {
            TypedValue::Null => true,
            TypedValue::Boolean(v) => v.is_none(),
            TypedValue::Integer(v) => v.is_none(),
            TypedValue::Long(v) => v.is_none(),
            TypedValue::Double(v) => v.is_none(),
            TypedValue::String(v) => v.is_none(),
            TypedValue::Date(v) => v.is_none(),
            TypedValue::Bytes(v) => v.is_none(),
            TypedValue::Object(v) => v.is_none(),
        }
    }

    /// Whether the value lives behind the value serializer
    pub fn is_serialized(&self) -> bool {
        matches!(self, TypedValue::Bytes(_) | TypedValue::Object(_))
    }

    /// Serializer handle this value refers to, if any
    pub fn value_handle(&self) -> Option<&ValueHandle> {
        match self {
            TypedValue::Bytes(Some(handle)) => Some(handle),
            TypedValue::Object(Some(object)) => Some(&object.handle),
            _ => None,
        }
    }

    /// Integral view used by predicates (Integer and Long)
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            TypedValue::Integer(Some(v)) => Some(i64::from(*v)),
            TypedValue::Long(Some(v)) => Some(*v),
            _ => None,
        }
    }

    /// Convert a plain JSON scalar into a typed value.
    ///
    /// Integers that fit 32 bits become `Integer`, larger ones `Long`.
    /// Arrays and objects return `None`: they are not primitives and must be
    /// stored through the value serializer as [`ObjectValue`]s.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Null => Some(TypedValue::Null),
            serde_json::Value::Bool(b) => Some(TypedValue::Boolean(Some(*b))),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    match i32::try_from(i) {
                        Ok(small) => Some(TypedValue::Integer(Some(small))),
                        Err(_) => Some(TypedValue::Long(Some(i))),
                    }
                } else {
                    n.as_f64().map(|f| TypedValue::Double(Some(f)))
                }
            }
            serde_json::Value::String(s) => Some(TypedValue::String(Some(s.clone()))),
            serde_json::Value::Array(_) | serde_json::Value::Object(_) => None,
        }
    }

    /// Human-readable rendering for logs and the admin CLI
    pub fn display_value(&self) -> String {
        match self {
            TypedValue::Null => "null".to_string(),
            TypedValue::Boolean(Some(v)) => v.to_string(),
            TypedValue::Integer(Some(v)) => v.to_string(),
            TypedValue::Long(Some(v)) => v.to_string(),
            TypedValue::Double(Some(v)) => v.to_string(),
            TypedValue::String(Some(v)) => format!("\"{}\"", v),
            TypedValue::Date(Some(v)) => v.to_rfc3339(),
            TypedValue::Bytes(Some(h)) => format!("<bytes {}>", h),
            TypedValue::Object(Some(o)) => format!("<{} {}>", o.type_name, o.handle),
            other => format!("null ({})", other.value_type()),
        }
    }
}

impl From<bool> for TypedValue {
    fn from(v: bool) -> Self {
        TypedValue::Boolean(Some(v))
    }
}

impl From<i32> for TypedValue {
    fn from(v: i32) -> Self {
        TypedValue::Integer(Some(v))
    }
}

impl From<i64> for TypedValue {
    fn from(v: i64) -> Self {
        TypedValue::Long(Some(v))
    }
}

impl From<f64> for TypedValue {
    fn from(v: f64) -> Self {
        TypedValue::Double(Some(v))
    }
}

impl From<&str> for TypedValue {
    fn from(v: &str) -> Self {
        TypedValue::String(Some(v.to_string()))
    }
}

impl From<String> for TypedValue {
    fn from(v: String) -> Self {
        TypedValue::String(Some(v))
    }
}

impl From<DateTime<Utc>> for TypedValue {
    fn from(v: DateTime<Utc>) -> Self {
        TypedValue::Date(Some(v))
    }
}

/// One named slot in a variable store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableSlot {
    pub name: String,

    pub value: TypedValue,

    /// Declared type, refreshed from the runtime type of every write
    pub value_type: ValueType,

    /// Incremented on every write, starting at 1 for the creating write
    pub revision: u32,

    /// Transient slots are readable but never persisted
    #[serde(default)]
    pub transient: bool,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl VariableSlot {
    pub fn new(name: &str, value: TypedValue, transient: bool, now: DateTime<Utc>) -> Self {
        VariableSlot {
            name: name.to_string(),
            value_type: value.value_type(),
            value,
            revision: 1,
            transient,
            created_at: now,
            updated_at: now,
        }
    }

    /// Overwrite the value, bump the revision and return the previous type tag
    pub fn write(&mut self, value: TypedValue, now: DateTime<Utc>) -> ValueType {
        let previous = self.value_type;
        self.value_type = value.value_type();
        self.value = value;
        self.revision += 1;
        self.updated_at = now;
        previous
    }
}

/// Outcome of a variable write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableUpdate {
    pub name: String,

    /// Scope execution whose store received the write
    pub scope: ExecutionId,

    pub revision: u32,

    /// `None` when the write created the slot
    pub previous_type: Option<ValueType>,

    pub new_type: ValueType,
}

impl VariableUpdate {
    pub fn created(&self) -> bool {
        self.previous_type.is_none()
    }

    /// True when an existing slot changed its declared type (e.g. integer -> string)
    pub fn type_changed(&self) -> bool {
        matches!(self.previous_type, Some(previous) if previous != self.new_type)
    }
}

/// The variables owned by one scope execution, keyed by name.
///
/// Only local operations live here; walking ancestor scopes is the job of the
/// execution tree, which owns every store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VariableStore {
    slots: BTreeMap<String, VariableSlot>,
}

impl VariableStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&VariableSlot> {
        self.slots.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.slots.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Slots in name order
    pub fn iter(&self) -> impl Iterator<Item = &VariableSlot> {
        self.slots.values()
    }

    /// Create or overwrite the slot for `name`.
    ///
    /// An existing slot cannot switch between transient and persistent.
    pub fn put(
        &mut self,
        scope: ExecutionId,
        name: &str,
        value: TypedValue,
        transient: bool,
        now: DateTime<Utc>,
    ) -> Result<VariableUpdate> {
        match self.slots.get_mut(name) {
            Some(slot) => {
                if slot.transient != transient {
                    return Err(ProcessEngineError::InvalidInput(format!(
                        "Cannot set transient variable with name '{}' to non-transient variable and vice versa",
                        name
                    )));
                }
                let previous = slot.write(value, now);
                Ok(VariableUpdate {
                    name: name.to_string(),
                    scope,
                    revision: slot.revision,
                    previous_type: Some(previous),
                    new_type: slot.value_type,
                })
            }
            None => {
                let slot = VariableSlot::new(name, value, transient, now);
                let update = VariableUpdate {
                    name: name.to_string(),
                    scope,
                    revision: slot.revision,
                    previous_type: None,
                    new_type: slot.value_type,
                };
                self.slots.insert(name.to_string(), slot);
                Ok(update)
            }
        }
    }

    /// Remove a slot; removing a missing name is a no-op
    pub fn remove(&mut self, name: &str) -> Option<VariableSlot> {
        self.slots.remove(name)
    }

    /// Drop every transient slot (end of command)
    pub fn clear_transient(&mut self) -> usize {
        let before = self.slots.len();
        self.slots.retain(|_, slot| !slot.transient);
        before - self.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_typed_null_keeps_its_type() {
        let v = TypedValue::String(None);
        assert!(v.is_null());
        assert_eq!(v.value_type(), ValueType::String);
        assert!(TypedValue::Null.is_null());
        assert!(!TypedValue::from("x").is_null());
    }

    #[test]
    fn test_from_json_scalars() {
        assert_eq!(TypedValue::from_json(&json!(5)), Some(TypedValue::Integer(Some(5))));
        assert_eq!(
            TypedValue::from_json(&json!(10_000_000_000i64)),
            Some(TypedValue::Long(Some(10_000_000_000)))
        );
        assert_eq!(TypedValue::from_json(&json!(1.5)), Some(TypedValue::Double(Some(1.5))));
        assert_eq!(TypedValue::from_json(&json!(null)), Some(TypedValue::Null));
        assert_eq!(TypedValue::from_json(&json!({"a": 1})), None);
    }

    #[test]
    fn test_slot_write_tracks_revision_and_type() {
        let now = Utc::now();
        let mut slot = VariableSlot::new("amount", TypedValue::from(1), false, now);
        assert_eq!(slot.revision, 1);

        let previous = slot.write(TypedValue::from("one"), now);
        assert_eq!(previous, ValueType::Integer);
        assert_eq!(slot.value_type, ValueType::String);
        assert_eq!(slot.revision, 2);
    }

    #[test]
    fn test_store_rejects_transient_switch() {
        let scope = ExecutionId::new();
        let mut store = VariableStore::new();
        let update = store.put(scope, "x", TypedValue::from(1), false, Utc::now()).unwrap();
        assert!(update.created());

        let err = store.put(scope, "x", TypedValue::from(2), true, Utc::now()).unwrap_err();
        assert!(matches!(err, ProcessEngineError::InvalidInput(_)));

        store.put(scope, "t", TypedValue::from(true), true, Utc::now()).unwrap();
        assert_eq!(store.clear_transient(), 1);
        assert!(store.contains("x"));
        assert!(!store.contains("t"));
    }

    #[test]
    fn test_integral_family_compatibility() {
        assert!(ValueType::Integer.is_compatible_with(&ValueType::Long));
        assert!(!ValueType::Integer.is_compatible_with(&ValueType::Double));
        assert!(!ValueType::Boolean.is_orderable());
    }
}
