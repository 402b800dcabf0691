// Value serialization collaborator for object and bytes variables

//! # Value Serializer
//!
//! Non-primitive variable values never live inside a variable store. They are
//! handed to a [`ValueSerializer`], which returns an opaque [`ValueHandle`];
//! the slot keeps only that handle plus the declared type. Reading the value
//! back in materialized form goes through [`ValueSerializer::deserialize`],
//! and that is the only place a deserialization failure can surface.
//!
//! [`InMemoryValueSerializer`] keeps serialized payloads in a `DashMap`. It is
//! what the runtime uses by default and what tests use to simulate a broken
//! payload via [`corrupt`](InMemoryValueSerializer::corrupt).

use dashmap::DashMap;
use tracing::warn;

use crate::models::ValueHandle;
use crate::{ProcessEngineError, Result};

pub trait ValueSerializer: Send + Sync {
    /// Store `value` and return the handle that now refers to it
    fn serialize(&self, type_name: &str, value: &serde_json::Value) -> Result<ValueHandle>;

    /// Produce the value behind `handle`
    fn deserialize(&self, handle: &ValueHandle) -> Result<serde_json::Value>;

    /// Forget the value behind `handle`; unknown handles are ignored
    fn release(&self, handle: &ValueHandle);
}

#[derive(Debug, Clone)]
struct StoredValue {
    type_name: String,
    payload: Vec<u8>,
}

#[derive(Debug, Default)]
pub struct InMemoryValueSerializer {
    values: DashMap<ValueHandle, StoredValue>,
}

impl InMemoryValueSerializer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Declared type name stored with `handle`
    pub fn type_name(&self, handle: &ValueHandle) -> Option<String> {
        self.values.get(handle).map(|v| v.type_name.clone())
    }

    /// Overwrite the payload behind `handle` with bytes that are not JSON.
    /// Returns false for unknown handles.
    pub fn corrupt(&self, handle: &ValueHandle) -> bool {
        match self.values.get_mut(handle) {
            Some(mut stored) => {
                stored.payload = vec![0xff, 0x00, 0xfe];
                true
            }
            None => false,
        }
    }
}

impl ValueSerializer for InMemoryValueSerializer {
    fn serialize(&self, type_name: &str, value: &serde_json::Value) -> Result<ValueHandle> {
        let payload = serde_json::to_vec(value)?;
        let handle = ValueHandle::new();
        self.values.insert(
            handle.clone(),
            StoredValue { type_name: type_name.to_string(), payload },
        );
        Ok(handle)
    }

    fn deserialize(&self, handle: &ValueHandle) -> Result<serde_json::Value> {
        let stored = self.values.get(handle).ok_or_else(|| ProcessEngineError::Deserialization {
            variable: handle.to_string(),
            reason: "no serialized value for handle".to_string(),
        })?;
        serde_json::from_slice(&stored.payload).map_err(|e| {
            warn!(handle = %handle, type_name = %stored.type_name, error = %e, "failed to deserialize value");
            ProcessEngineError::Deserialization {
                variable: handle.to_string(),
                reason: e.to_string(),
            }
        })
    }

    fn release(&self, handle: &ValueHandle) {
        self.values.remove(handle);
    }
}
