// Explicit clock and actor context threaded through engine calls

//! # Command Context
//!
//! Nothing in the runtime reads the wall clock or "the current user" from
//! global state. Trees receive a [`Clock`] when they are created, and
//! management operations take a [`CommandContext`] naming the actor on whose
//! behalf they run. Tests swap in a [`FixedClock`] to get deterministic
//! timestamps.

use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, Utc};

/// Source of "now" for timestamps on nodes, slots and events
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to
#[derive(Debug)]
pub struct FixedClock {
    current: RwLock<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(at: DateTime<Utc>) -> Self {
        FixedClock { current: RwLock::new(at) }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        if let Ok(mut current) = self.current.write() {
            *current = at;
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut current) = self.current.write() {
            *current += by;
        }
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        // A poisoned lock still holds the last value that was written
        match self.current.read() {
            Ok(current) => *current,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

/// Who is running a command, and against which clock
#[derive(Debug, Clone)]
pub struct CommandContext {
    /// Authenticated user or system component, recorded on emitted events
    pub actor: Option<String>,

    pub clock: Arc<dyn Clock>,
}

impl CommandContext {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        CommandContext { actor: None, clock }
    }

    pub fn system() -> Self {
        Self::new(Arc::new(SystemClock))
    }

    pub fn with_actor<S: Into<String>>(mut self, actor: S) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}
