//! Per-operation non-overlap guard.
//!
//! `RunLocks` covers one process. A [`RunLease`] comes from the store and
//! covers every process sharing it.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Named pipeline operations. Both collection flavours share one key since
/// they upsert the same rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Collect,
    Reconcile,
    Purge,
}

impl Operation {
    pub const fn as_str(self) -> &'static str {
        match self {
            Operation::Collect => "collect",
            Operation::Reconcile => "reconcile",
            Operation::Purge => "purge",
        }
    }

    /// Name of the store-wide lock for this operation.
    pub fn lock_key(self) -> String {
        format!("tender:{}", self.as_str())
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunLocks {
    slots: Arc<Mutex<HashMap<Operation, Arc<AsyncMutex<()>>>>>,
}

/// Held for the duration of a run; dropping it releases the operation.
#[derive(Debug)]
pub struct RunGuard {
    pub operation: Operation,
    _guard: OwnedMutexGuard<()>,
}

/// Store-wide claim on an operation; whatever backs it is released on drop.
pub struct RunLease {
    pub operation: Operation,
    _held: Box<dyn Send>,
}

impl RunLease {
    pub fn new(operation: Operation, held: impl Send + 'static) -> Self {
        Self {
            operation,
            _held: Box::new(held),
        }
    }
}

impl fmt::Debug for RunLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunLease")
            .field("operation", &self.operation)
            .finish_non_exhaustive()
    }
}

impl RunLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails immediately instead of queueing behind a run in progress.
    pub fn try_acquire(&self, operation: Operation) -> Option<RunGuard> {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            slots.entry(operation).or_default().clone()
        };
        slot.try_lock_owned().ok().map(|guard| RunGuard {
            operation,
            _guard: guard,
        })
    }

    pub fn is_running(&self, operation: Operation) -> bool {
        let slots = self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        slots
            .get(&operation)
            .is_some_and(|slot| slot.try_lock().is_err())
    }
}
