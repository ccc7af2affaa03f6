//! Core intermediate representation and pass abstractions for flowgraph.
//!
//! This crate provides the foundational abstractions the pass crate builds on:
//! - Arena-backed graph IR (`Module`, `Function`, `Region`, `Operation`, `Value`)
//! - Typed attributes and the tensor type lattice
//! - Op-kind registry with per-kind traits and shape functions
//! - The `Pass` trait

pub mod attr;
pub mod broadcast;
pub mod context;
pub mod ir;
pub mod pass;
pub mod registry;
pub mod types;

// Re-export commonly used types
pub use attr::{Attribute, Attributes};
pub use broadcast::broadcast_shape;
pub use context::ShapeCtx;
pub use ir::{
    Execution, FuncRef, Function, Module, NewOp, OpForm, OpId, Operation, Region, RegionId,
    RegionOwner, Value, ValueDef, ValueId,
};
pub use pass::Pass;
pub use registry::{OpDescriptor, OpRegistry, ShapeFn};
pub use types::{DataType, Dim, Shape, TensorData, TensorType, TensorValue};

/// Result type using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for flowgraph operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The IR violates (or a rewrite would violate) a structural invariant.
    #[error("Structural violation: {0}")]
    StructuralViolation(String),

    /// An operation is in a form the pass cannot handle.
    #[error("Unsupported form: {0}")]
    UnsupportedForm(String),

    /// A handle does not refer to a live entity.
    #[error("Invalid graph structure: {0}")]
    InvalidGraph(String),

    #[error("Attribute error: {0}")]
    Attribute(String),

    #[error("Shape inference error: {0}")]
    ShapeInference(String),

    #[error("Unknown pass: {0}")]
    UnknownPass(String),

    #[error("Invalid option '{option}': {message}")]
    InvalidOption { option: String, message: String },

    #[error("Pass '{pass}' failed: {source}")]
    PassFailed {
        pass: String,
        #[source]
        source: Box<Error>,
    },
}
