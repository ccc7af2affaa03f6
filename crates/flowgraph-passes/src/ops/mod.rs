//! Standard op-kind table.
//!
//! Shape functions are grouped in families:
//! - **Elementwise**: unary kinds that keep their operand type, and binary
//!   kinds with NumPy-style broadcasting
//! - **Tensor**: Const, Placeholder, Cast, Shape, Reshape, MatMul

mod elementwise;
mod tensor;

pub use elementwise::{binary_broadcast_shape, unary_shape};
pub use tensor::{
    cast_shape, const_shape, matmul_shape, placeholder_shape, reshape_shape, shape_of_shape,
};

use flowgraph_core::ir::{RETURN_KIND, YIELD_KIND};
use flowgraph_core::{OpDescriptor, OpRegistry};

/// Unary kinds whose result type equals the operand type.
pub const UNARY_KINDS: &[&str] = &[
    "Identity", "Relu", "Relu6", "Elu", "Sigmoid", "Tanh", "Neg", "Softplus", "Exp", "_MklSwish",
    "_MklFusedMish",
];

/// Binary kinds with broadcasting.
pub const BINARY_KINDS: &[&str] = &["Add", "AddV2", "Sub", "Mul", "Div", "Maximum", "BiasAdd"];

/// Returns an op registry pre-populated with the standard op kinds.
///
/// Custom kinds can be added to the returned registry via
/// `registry.register(kind, descriptor)`.
pub fn standard_registry() -> OpRegistry {
    let mut registry = OpRegistry::new();

    for kind in UNARY_KINDS {
        registry.register(kind, OpDescriptor::stateless().with_shape_fn(unary_shape));
    }
    for kind in BINARY_KINDS {
        registry.register(
            kind,
            OpDescriptor::stateless().with_shape_fn(binary_broadcast_shape),
        );
    }

    registry
        .register("Const", OpDescriptor::stateless().with_shape_fn(const_shape))
        .register("Cast", OpDescriptor::stateless().with_shape_fn(cast_shape))
        .register("Shape", OpDescriptor::stateless().with_shape_fn(shape_of_shape))
        .register("Reshape", OpDescriptor::stateless().with_shape_fn(reshape_shape))
        .register("MatMul", OpDescriptor::stateless().with_shape_fn(matmul_shape))
        .register(
            "_FusedMatMul",
            OpDescriptor::stateless().with_shape_fn(matmul_shape),
        )
        .register("Conv2D", OpDescriptor::stateless())
        .register("_FusedConv2D", OpDescriptor::stateless())
        .register(
            "Placeholder",
            OpDescriptor::stateful()
                .with_shape_fn(placeholder_shape)
                .with_type_attrs("shape", "dtype"),
        )
        .register("NoOp", OpDescriptor::stateless());

    // Calls
    registry
        .register("PartitionedCall", OpDescriptor::stateless().call())
        .register("StatefulPartitionedCall", OpDescriptor::stateful().call());

    // Control flow
    for kind in ["StatelessIf", "StatelessCase", "StatelessWhile"] {
        registry.register(kind, OpDescriptor::stateless());
    }
    for kind in [
        "If",
        "Case",
        "While",
        "IfRegion",
        "CaseRegion",
        "WhileRegion",
        RETURN_KIND,
        YIELD_KIND,
    ] {
        registry.register(kind, OpDescriptor::stateful());
    }

    registry
}
