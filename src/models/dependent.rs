// Dependent entities whose suspension mirrors their execution

use serde::{Deserialize, Serialize};

/// The fixed set of entity kinds that follow an execution's suspension state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependentEntityKind {
    /// User task
    Task,
    /// Timer or async-continuation job
    Job,
    /// Lock held by an external-task worker
    ExternalTask,
}

impl DependentEntityKind {
    /// Cascade order: tasks, then jobs, then external-task locks
    pub const ALL: [DependentEntityKind; 3] = [
        DependentEntityKind::Task,
        DependentEntityKind::Job,
        DependentEntityKind::ExternalTask,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DependentEntityKind::Task => "task",
            DependentEntityKind::Job => "job",
            DependentEntityKind::ExternalTask => "external_task",
        }
    }
}

impl std::fmt::Display for DependentEntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A dependent entity bound to one execution
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DependentEntityRef {
    pub kind: DependentEntityKind,
    pub id: String,
}

impl DependentEntityRef {
    pub fn task<S: Into<String>>(id: S) -> Self {
        DependentEntityRef { kind: DependentEntityKind::Task, id: id.into() }
    }

    pub fn job<S: Into<String>>(id: S) -> Self {
        DependentEntityRef { kind: DependentEntityKind::Job, id: id.into() }
    }

    pub fn external_task<S: Into<String>>(id: S) -> Self {
        DependentEntityRef { kind: DependentEntityKind::ExternalTask, id: id.into() }
    }
}
