//! Errors and soft-failure warnings of the batch-fusion pass.

use std::fmt;

use quilt_graph::{GraphError, OpId, Shape, TensorId};
use serde::Serialize;

/// Fatal errors. Any of these aborts the pass.
#[derive(Debug, thiserror::Error)]
pub enum FusionError {
    /// The axis configuration does not describe a rank-4 layout.
    #[error("invalid fusion axes: {0}")]
    InvalidAxes(String),

    /// A tile count of zero was requested.
    #[error("tile count must be at least 1")]
    InvalidTileCount,

    /// A context table was read before the tensor or operation was recorded.
    #[error("{what} {id} has no entry in the {table} table")]
    LookupViolation {
        /// Table name.
        table: &'static str,
        /// "tensor" or "operation".
        what: &'static str,
        /// Handle that was looked up.
        id: String,
    },

    /// A write-once table was written twice for the same key.
    #[error("{key} was inserted twice into the {table} table")]
    DuplicateEntry {
        /// Table name.
        table: &'static str,
        /// Offending key.
        key: String,
    },

    /// Gap inference kept raising gaps past the configured limit.
    #[error("gap inference did not converge within {limit} backward passes")]
    FixpointDiverged {
        /// The configured cap.
        limit: usize,
    },

    /// A rewritten operator produced an unexpected shape.
    #[error("fused tensor for {tensor:?} has shape {found}, expected {expected}")]
    CanvasMismatch {
        /// Cloned-graph tensor being rewritten.
        tensor: TensorId,
        /// Shape predicted by gap inference.
        expected: Shape,
        /// Shape the fused graph produced.
        found: Shape,
    },

    /// The IR rejected a tensor or operation.
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// The configuration file is not valid TOML for [`FusionOptions`](crate::FusionOptions).
    #[error("TOML error: {0}")]
    Config(#[from] toml::de::Error),

    /// The configuration file could not be read.
    #[error("cannot read {path}: {source}")]
    Io {
        /// File path.
        path: String,
        /// Underlying error.
        source: std::io::Error,
    },
}

impl FusionError {
    pub(crate) fn missing_tensor(table: &'static str, tensor: TensorId) -> Self {
        Self::LookupViolation {
            table,
            what: "tensor",
            id: format!("{tensor:?}"),
        }
    }

    pub(crate) fn missing_op(table: &'static str, op: OpId) -> Self {
        Self::LookupViolation {
            table,
            what: "operation",
            id: format!("{op:?}"),
        }
    }
}

/// Result type for the pass.
pub type FusionResult<T> = Result<T, FusionError>;

/// Soft failures. The pass continues, leaving the affected region unfused
/// or incomplete.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "warning", rename_all = "snake_case")]
pub enum FusionWarning {
    /// An operator outside the supported set was skipped, along with
    /// everything downstream of it.
    UnsupportedOperator {
        /// Source-graph operation.
        op: OpId,
        /// Its kind.
        kind: &'static str,
    },
    /// Inputs of a binary or concat operator could not share one canvas
    /// layout; the operator runs on de-fused data.
    UnbalancedBranches {
        /// Cloned-graph operation.
        op: OpId,
        /// Its kind.
        kind: &'static str,
        /// Why the branches disagree.
        reason: String,
    },
}

impl fmt::Display for FusionWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedOperator { op, kind } => {
                write!(f, "unsupported operator {kind} {op:?} skipped")
            }
            Self::UnbalancedBranches { op, kind, reason } => {
                write!(f, "unbalanced branches at {kind} {op:?}: {reason}")
            }
        }
    }
}
