// Storage abstraction for process instance snapshots

//! # Storage Abstraction Layer
//!
//! The runtime keeps live trees in memory and persists a snapshot of a tree
//! after every command through [`ProcessInstanceStorage`]. Snapshots are
//! plain [`ExecutionTree`] values with transient variables and buffered
//! events stripped (see [`ExecutionTree::snapshot`]).
//!
//! - **ProcessInstanceStorage trait**: the interface every backend implements
//! - **InMemoryStorage**: default implementation for development and tests
//!
//! All operations are async so that network or database backends fit the same
//! trait; the in-memory implementation never awaits.

use std::collections::HashMap;
use std::sync::RwLock;

use uuid::Uuid;

use crate::engine::tree::ExecutionTree;
use crate::{ProcessEngineError, Result};

/// Persistence for execution tree snapshots, keyed by process instance id
#[async_trait::async_trait]
pub trait ProcessInstanceStorage: Send + Sync {
    /// Create or replace the snapshot of one process instance
    async fn save(&self, tree: ExecutionTree) -> Result<()>;

    async fn get(&self, process_instance_id: &Uuid) -> Result<Option<ExecutionTree>>;

    async fn list(&self) -> Result<Vec<ExecutionTree>>;

    /// Instances of one definition version, e.g. `"invoice:2"`
    async fn list_by_definition_id(&self, definition_id: &str) -> Result<Vec<ExecutionTree>>;

    /// Instances of every version of a definition key
    async fn list_by_definition_key(&self, definition_key: &str) -> Result<Vec<ExecutionTree>>;

    /// Returns whether a snapshot was removed
    async fn delete(&self, process_instance_id: &Uuid) -> Result<bool>;
}

/// In-memory snapshot storage.
///
/// Not persistent and not shared across processes.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    instances: RwLock<HashMap<Uuid, ExecutionTree>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn filtered<F>(&self, keep: F) -> Result<Vec<ExecutionTree>>
    where
        F: Fn(&ExecutionTree) -> bool,
    {
        let instances = self.instances.read().map_err(poisoned)?;
        let mut found: Vec<ExecutionTree> = instances.values().filter(|t| keep(t)).cloned().collect();
        found.sort_by_key(|t| t.created_at());
        Ok(found)
    }
}

fn poisoned<T>(_: std::sync::PoisonError<T>) -> ProcessEngineError {
    ProcessEngineError::Storage(anyhow::anyhow!("in-memory storage lock poisoned"))
}

#[async_trait::async_trait]
impl ProcessInstanceStorage for InMemoryStorage {
    async fn save(&self, tree: ExecutionTree) -> Result<()> {
        let mut instances = self.instances.write().map_err(poisoned)?;
        instances.insert(tree.process_instance_id(), tree);
        Ok(())
    }

    async fn get(&self, process_instance_id: &Uuid) -> Result<Option<ExecutionTree>> {
        let instances = self.instances.read().map_err(poisoned)?;
        Ok(instances.get(process_instance_id).cloned())
    }

    async fn list(&self) -> Result<Vec<ExecutionTree>> {
        self.filtered(|_| true)
    }

    async fn list_by_definition_id(&self, definition_id: &str) -> Result<Vec<ExecutionTree>> {
        self.filtered(|t| t.definition().id == definition_id)
    }

    async fn list_by_definition_key(&self, definition_key: &str) -> Result<Vec<ExecutionTree>> {
        self.filtered(|t| t.definition().key == definition_key)
    }

    async fn delete(&self, process_instance_id: &Uuid) -> Result<bool> {
        let mut instances = self.instances.write().map_err(poisoned)?;
        Ok(instances.remove(process_instance_id).is_some())
    }
}
