//! Tensor dataflow graph IR for quilt.
//!
//! A [`Graph`] owns two arenas: tensors and operations. Every tensor carries
//! a [`TensorSpec`] (dtype, shape, attribute, optional quantization) and,
//! for constants, little-endian element data. Operations are typed by
//! [`OpKind`], reference their inputs and outputs by [`TensorId`], and are
//! shape-checked when they are bound.
//!
//! # Overview
//!
//! ```text
//! create_tensor / create_constant     add_op / emit
//!            |                             |
//!            v                             v
//!   IndexVec<TensorId, Tensor>  <-->  IndexVec<OpId, Operation>
//!        producer / consumers edges kept in sync
//! ```
//!
//! Handles are only meaningful within the graph that created them. Passes
//! that move between graphs keep explicit handle-to-handle maps.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::missing_errors_doc)]

mod dtype;
mod format;
mod graph;
mod op;
mod shape;

pub use dtype::{DType, Quantization};
pub use format::{GraphDef, OpDef, TensorDef};
pub use graph::{Graph, Operation, Tensor, TensorAttr, TensorSpec};
pub use op::{
    window_output, ActivationKind, BinaryKind, Conv2dParams, DataLayout, OpKind, PadParams,
    Pool2dParams, PoolKind, ReduceKind,
};
pub use shape::Shape;

pub use quilt_index::Idx;

quilt_index::define_index! {
    /// Handle of a tensor within one [`Graph`].
    pub struct TensorId;

    /// Handle of an operation within one [`Graph`].
    pub struct OpId;
}

/// Errors raised while building, checking or loading a graph.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum GraphError {
    /// A handle does not belong to this graph.
    #[error("unknown tensor {0:?}")]
    UnknownTensor(TensorId),

    /// An operation handle does not belong to this graph.
    #[error("unknown operation {0:?}")]
    UnknownOp(OpId),

    /// A tensor was bound as the output of a second operation.
    #[error("tensor {0:?} already has a producer")]
    AlreadyProduced(TensorId),

    /// Inputs and constants cannot be produced by an operation.
    #[error("tensor {0:?} is a graph input or constant and cannot be an operation output")]
    NotWritable(TensorId),

    /// Operation parameters or input shapes are invalid.
    #[error("{op}: {message}")]
    InvalidOp {
        /// Operation kind name.
        op: &'static str,
        /// What went wrong.
        message: String,
    },

    /// The declared output shape disagrees with shape inference.
    #[error("{op}: output shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch {
        /// Operation kind name.
        op: &'static str,
        /// The inferred shape.
        expected: Shape,
        /// The declared shape.
        got: Shape,
    },

    /// Constant data does not match the tensor's byte size.
    #[error("constant data has {got} bytes, expected {expected}")]
    DataSize {
        /// Bytes required by the spec.
        expected: usize,
        /// Bytes supplied.
        got: usize,
    },

    /// A graph file could not be parsed.
    #[error("invalid graph file: {0}")]
    Format(String),
}

/// Result type for graph operations.
pub type GraphResult<T> = Result<T, GraphError>;

pub(crate) fn invalid(op: &'static str, message: impl Into<String>) -> GraphError {
    GraphError::InvalidOp {
        op,
        message: message.into(),
    }
}
