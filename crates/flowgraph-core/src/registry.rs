//! Op-kind registry.

use crate::context::ShapeCtx;
use crate::types::TensorType;
use crate::Result;
use std::collections::HashMap;

/// Shape function: computes result types from the operation's context.
///
/// The returned list must have one entry per result. Entries may be less
/// refined than the current types; callers only ever meet them in.
pub type ShapeFn = fn(&ShapeCtx) -> Result<Vec<TensorType>>;

/// Static traits of an op kind.
#[derive(Clone, Default)]
pub struct OpDescriptor {
    /// No side effects: may be moved, merged or dropped when unused.
    pub stateless: bool,

    /// Invokes a function (used for call-strictness checks).
    pub call: bool,

    /// Computes result types from operand types.
    pub shape_fn: Option<ShapeFn>,

    /// Attribute declaring the single result's shape (e.g. `Placeholder.shape`).
    pub shape_attr: Option<&'static str>,

    /// Attribute declaring the single result's dtype (e.g. `Placeholder.dtype`).
    pub dtype_attr: Option<&'static str>,
}

impl OpDescriptor {
    /// A side-effect-free op kind.
    pub fn stateless() -> Self {
        Self {
            stateless: true,
            ..Default::default()
        }
    }

    /// An op kind with side effects.
    pub fn stateful() -> Self {
        Self::default()
    }

    /// Mark the kind as a function call.
    pub fn call(mut self) -> Self {
        self.call = true;
        self
    }

    /// Attach a shape function.
    pub fn with_shape_fn(mut self, shape_fn: ShapeFn) -> Self {
        self.shape_fn = Some(shape_fn);
        self
    }

    /// Declare the attributes carrying the result's shape and dtype.
    pub fn with_type_attrs(mut self, shape_attr: &'static str, dtype_attr: &'static str) -> Self {
        self.shape_attr = Some(shape_attr);
        self.dtype_attr = Some(dtype_attr);
        self
    }
}

impl std::fmt::Debug for OpDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpDescriptor")
            .field("stateless", &self.stateless)
            .field("call", &self.call)
            .field("shape_fn", &self.shape_fn.is_some())
            .field("shape_attr", &self.shape_attr)
            .field("dtype_attr", &self.dtype_attr)
            .finish()
    }
}

/// Registry of op kinds.
///
/// Maps kind tags (e.g., "Add", "MatMul") to their descriptors. Kinds that are
/// not registered are treated conservatively: stateful, not a call, and
/// without a shape function.
///
/// # Example
///
/// ```ignore
/// let mut registry = OpRegistry::new();
/// registry
///     .register("Relu", OpDescriptor::stateless().with_shape_fn(unary_shape))
///     .register("Print", OpDescriptor::stateful());
/// ```
#[derive(Debug, Clone, Default)]
pub struct OpRegistry {
    /// Map from kind tag to descriptor.
    descriptors: HashMap<String, OpDescriptor>,
}

impl OpRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an op kind, replacing any previous descriptor.
    ///
    /// Returns `self` for method chaining.
    pub fn register(&mut self, kind: &str, descriptor: OpDescriptor) -> &mut Self {
        self.descriptors.insert(kind.to_string(), descriptor);
        self
    }

    /// Look up a descriptor by kind.
    pub fn get(&self, kind: &str) -> Option<&OpDescriptor> {
        self.descriptors.get(kind)
    }

    /// Check if a kind is registered.
    pub fn contains(&self, kind: &str) -> bool {
        self.descriptors.contains_key(kind)
    }

    /// Get the number of registered kinds.
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Iterate over all registered kind names.
    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.descriptors.keys().map(|s| s.as_str())
    }

    /// Check whether a kind is known to be side-effect free.
    pub fn is_stateless(&self, kind: &str) -> bool {
        self.get(kind).is_some_and(|d| d.stateless)
    }

    /// Check whether a kind is a registered call kind.
    pub fn is_call(&self, kind: &str) -> bool {
        self.get(kind).is_some_and(|d| d.call)
    }

    /// Shape function for a kind, if any.
    pub fn shape_fn(&self, kind: &str) -> Option<ShapeFn> {
        self.get(kind).and_then(|d| d.shape_fn)
    }
}
