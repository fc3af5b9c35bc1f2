//! The ICA transformation applied to one subprocessor.
//!
//! An [`IcaOperation`] is replaced wholesale whenever training finishes or a
//! previous run is loaded; only its rejected-component set is edited in
//! place. Sharing across threads goes through [`SynchronizedOperation`].

pub mod matrix;
pub mod sync;

use std::collections::BTreeSet;

use tracing::warn;

use crate::error::{IcaError, Result};

pub use matrix::Matrix;
pub use sync::{OperationState, SynchronizedOperation};

/// Mixing/unmixing pair over a subset of a subprocessor's channels.
///
/// Invariants:
/// - no-op iff `enabled_channels` is empty;
/// - both matrices are `n × n` with `n = enabled_channels.len()`;
/// - `unmixing = mixing⁻¹`;
/// - every rejected component index is `< n`.
#[derive(Debug, Clone, PartialEq)]
pub struct IcaOperation {
    enabled_channels: Vec<usize>,
    mixing: Matrix,
    unmixing: Matrix,
    rejected: BTreeSet<usize>,
}

impl Default for IcaOperation {
    fn default() -> Self {
        Self::noop()
    }
}

impl IcaOperation {
    /// The operation that applies nothing.
    pub fn noop() -> Self {
        Self {
            enabled_channels: Vec::new(),
            mixing: Matrix::zeros(0, 0),
            unmixing: Matrix::zeros(0, 0),
            rejected: BTreeSet::new(),
        }
    }

    /// Build from an unmixing matrix; mixing is its inverse. The selection
    /// defaults to rejecting component 0.
    ///
    /// `enabled_channels` are indices into the subprocessor's channel list.
    pub fn from_unmixing(enabled_channels: Vec<usize>, unmixing: Matrix) -> Result<Self> {
        check_shape(&enabled_channels, &unmixing)?;
        let mixing = matrix::invert(&unmixing)?;
        Ok(Self::assemble(enabled_channels, mixing, unmixing))
    }

    /// Build from a previously persisted pair without recomputing the inverse.
    pub fn from_matrices(
        enabled_channels: Vec<usize>,
        mixing: Matrix,
        unmixing: Matrix,
    ) -> Result<Self> {
        check_shape(&enabled_channels, &mixing)?;
        check_shape(&enabled_channels, &unmixing)?;
        Ok(Self::assemble(enabled_channels, mixing, unmixing))
    }

    fn assemble(enabled_channels: Vec<usize>, mixing: Matrix, unmixing: Matrix) -> Self {
        Self {
            enabled_channels,
            mixing,
            unmixing,
            rejected: BTreeSet::from([0]),
        }
    }

    pub fn is_noop(&self) -> bool {
        self.enabled_channels.is_empty()
    }

    pub fn num_components(&self) -> usize {
        self.enabled_channels.len()
    }

    pub fn enabled_channels(&self) -> &[usize] {
        &self.enabled_channels
    }

    /// Smallest subprocessor channel count this operation can run on.
    pub fn required_channels(&self) -> usize {
        self.enabled_channels.iter().max().map_or(0, |&m| m + 1)
    }

    pub fn mixing(&self) -> &Matrix {
        &self.mixing
    }

    pub fn unmixing(&self) -> &Matrix {
        &self.unmixing
    }

    pub fn rejected_components(&self) -> &BTreeSet<usize> {
        &self.rejected
    }

    pub fn is_rejected(&self, component: usize) -> bool {
        self.rejected.contains(&component)
    }

    /// Toggle one component's membership in the rejected set.
    pub fn set_rejected(&mut self, component: usize, rejected: bool) -> Result<()> {
        if component >= self.num_components() {
            return Err(IcaError::InvalidComponent {
                index: component,
                available: self.num_components(),
            });
        }
        if rejected {
            self.rejected.insert(component);
        } else {
            self.rejected.remove(&component);
        }
        Ok(())
    }

    /// Replace the rejected set. Out-of-range indices fall back to
    /// rejecting component 0; returns `false` when that happened.
    pub fn set_rejected_components(&mut self, components: impl IntoIterator<Item = usize>) -> bool {
        let n = self.num_components();
        let requested: BTreeSet<usize> = components.into_iter().collect();
        if let Some(&bad) = requested.iter().find(|&&c| c >= n) {
            warn!(
                component = bad,
                components = n,
                "rejected component out of range; rejecting component 0 instead"
            );
            self.rejected = if n > 0 { BTreeSet::from([0]) } else { BTreeSet::new() };
            return false;
        }
        self.rejected = requested;
        true
    }
}

fn check_shape(enabled: &[usize], m: &Matrix) -> Result<()> {
    let n = enabled.len();
    if m.nrows() != n || m.ncols() != n {
        return Err(IcaError::SolverConfig(format!(
            "matrix is {}x{} but {} channels are enabled",
            m.nrows(),
            m.ncols(),
            n
        )));
    }
    Ok(())
}
