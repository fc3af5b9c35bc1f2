//! Reader/writer guarded operation slot, one per subprocessor.
//!
//! Readers (real-time apply, UI) use the `try_*` accessors and treat
//! contention as "nothing to apply this cycle". Writers replace the whole
//! [`OperationState`] in one assignment, so a reader never sees a mixing
//! matrix from one run paired with an unmixing matrix from another.

use std::path::PathBuf;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{IcaError, Result};
use crate::operation::IcaOperation;

/// Operation plus the display value shown next to it (the solver config path
/// of the run that produced it).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OperationState {
    pub operation: IcaOperation,
    pub config_path: Option<PathBuf>,
}

impl OperationState {
    pub fn new(operation: IcaOperation, config_path: Option<PathBuf>) -> Self {
        Self {
            operation,
            config_path,
        }
    }
}

#[derive(Debug, Default)]
pub struct SynchronizedOperation {
    state: RwLock<OperationState>,
}

impl SynchronizedOperation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Non-blocking read of the full state.
    pub fn try_read(&self) -> Option<RwLockReadGuard<'_, OperationState>> {
        self.state.try_read()
    }

    /// Blocking read. Never call from the real-time thread.
    pub fn read(&self) -> RwLockReadGuard<'_, OperationState> {
        self.state.read()
    }

    /// Blocking write. Never call from the real-time thread.
    pub fn write(&self) -> RwLockWriteGuard<'_, OperationState> {
        self.state.write()
    }

    pub fn try_write(&self) -> Option<RwLockWriteGuard<'_, OperationState>> {
        self.state.try_write()
    }

    /// Blocking swap.
    pub fn install(&self, next: OperationState) {
        *self.state.write() = next;
    }

    /// Back to no-op, waiting for readers to drain.
    pub fn reset(&self) {
        *self.state.write() = OperationState::default();
    }

    /// Back to no-op if the lock is free; returns whether it happened.
    pub fn try_reset(&self) -> bool {
        match self.state.try_write() {
            Some(mut guard) => {
                *guard = OperationState::default();
                true
            }
            None => false,
        }
    }

    pub fn config_path(&self) -> Option<PathBuf> {
        self.state.read().config_path.clone()
    }

    /// Clone of the current state.
    pub fn snapshot(&self) -> OperationState {
        self.state.read().clone()
    }

    /// UI component toggle.
    pub fn set_component_rejected(&self, component: usize, rejected: bool) -> Result<()> {
        let mut guard = self.state.write();
        if guard.operation.is_noop() {
            return Err(IcaError::NoOperation);
        }
        guard.operation.set_rejected(component, rejected)
    }

    /// Reset to no-op when the operation addresses channels beyond
    /// `available`. Returns `true` if it was discarded.
    pub fn discard_if_needs_more_than(&self, available: usize) -> bool {
        let mut guard = self.state.write();
        if guard.operation.is_noop() || guard.operation.required_channels() <= available {
            return false;
        }
        *guard = OperationState::default();
        true
    }
}
