//! Import lock.
//!
//! While a full-dataset import (or a load with migrations) runs, ordinary
//! saves are refused. The lock is only ever held through an [`ImportGuard`],
//! so it is released on every exit path, including errors and panics.

use crate::error::{Result, StrataError};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

#[derive(Debug, Clone, Default)]
pub struct ImportLock {
    held: Arc<AtomicBool>,
    generation: Arc<AtomicU64>,
}

impl ImportLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the lock, failing if another import holds it.
    pub fn acquire(&self) -> Result<ImportGuard> {
        self.held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| StrataError::ImportAlreadyRunning)?;
        self.generation.fetch_add(1, Ordering::AcqRel);
        tracing::debug!("Import lock acquired");
        Ok(ImportGuard {
            held: Arc::clone(&self.held),
        })
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }

    /// Number of times the lock has been taken. A writer that sees this change
    /// while waiting knows an import ran in between.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }
}

/// Proof of holding the import lock; releases it on drop.
#[derive(Debug)]
#[must_use = "the import lock is released as soon as the guard is dropped"]
pub struct ImportGuard {
    held: Arc<AtomicBool>,
}

impl Drop for ImportGuard {
    fn drop(&mut self) {
        self.held.store(false, Ordering::Release);
        tracing::debug!("Import lock released");
    }
}
