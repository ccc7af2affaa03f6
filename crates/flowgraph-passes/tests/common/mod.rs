//! Common test utilities for pass tests.
//!
//! Small builders for modules so each test reads as a description of the
//! graph it starts from.

#![allow(dead_code)]

use flowgraph_core::ir::RETURN_KIND;
use flowgraph_core::{
    DataType, Module, NewOp, OpId, RegionId, Shape, TensorData, TensorType, TensorValue, ValueId,
};

// Re-export types commonly used in tests
pub use flowgraph_passes::ops::standard_registry;
pub use flowgraph_passes::{PassOptions, PassPipeline, PipelineConfig};

/// Install a tracing subscriber once per test binary.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_target(false)
        .with_test_writer()
        .try_init();
}

/// `f32` tensor type with a static shape.
pub fn f32_tensor(dims: &[usize]) -> TensorType {
    TensorType::fixed(DataType::F32, dims)
}

/// Add a named `Placeholder` whose declared type lives in its attributes.
///
/// The result type starts out unknown, the way an importer leaves it.
pub fn placeholder(module: &mut Module, name: &str, dtype: DataType, shape: Shape) -> ValueId {
    let graph = module.graph();
    let op = module
        .append_op(
            graph,
            NewOp::new("Placeholder")
                .name(name)
                .attr("dtype", dtype)
                .attr("shape", shape)
                .result(TensorType::unknown()),
        )
        .unwrap();
    module.result(op, 0).unwrap()
}

/// Add a typed `Placeholder` without declaring attributes.
pub fn input(module: &mut Module, name: &str, ty: TensorType) -> ValueId {
    let graph = module.graph();
    let op = module
        .append_op(graph, NewOp::new("Placeholder").name(name).result(ty))
        .unwrap();
    module.result(op, 0).unwrap()
}

/// Add an `f32` vector `Const` to `region`.
pub fn constant(
    module: &mut Module,
    region: RegionId,
    name: &str,
    values: Vec<f32>,
) -> (OpId, ValueId) {
    let value = TensorValue::vector(TensorData::F32(values));
    let ty = value.tensor_type();
    let op = module
        .append_op(
            region,
            NewOp::new("Const").name(name).attr("value", value).result(ty),
        )
        .unwrap();
    (op, module.result(op, 0).unwrap())
}

/// Add a single-result op of `kind` with the given operands.
pub fn node(
    module: &mut Module,
    region: RegionId,
    kind: &str,
    name: &str,
    operands: &[ValueId],
    ty: TensorType,
) -> (OpId, ValueId) {
    let op = module
        .append_op(
            region,
            NewOp::new(kind)
                .name(name)
                .operands(operands.iter().copied())
                .result(ty),
        )
        .unwrap();
    (op, module.result(op, 0).unwrap())
}

/// Add a function returning `body(args)`.
pub fn function(
    module: &mut Module,
    name: &str,
    arg_types: Vec<TensorType>,
    result_types: Vec<TensorType>,
    body: impl FnOnce(&mut Module, RegionId, &[ValueId]) -> Vec<ValueId>,
) -> RegionId {
    let region = module.add_function(name, arg_types, result_types).unwrap();
    let args = module.function_args(name).unwrap().to_vec();
    let returned = body(module, region, &args);
    module
        .append_op(region, NewOp::new(RETURN_KIND).operands(returned))
        .unwrap();
    region
}

/// Kinds of the ops directly in `region`, in order.
pub fn kinds(module: &Module, region: RegionId) -> Vec<String> {
    module
        .region(region)
        .unwrap()
        .ops()
        .iter()
        .map(|&op| module.op(op).unwrap().kind.clone())
        .collect()
}

/// Number of ops of `kind` anywhere in the module.
pub fn count_kind(module: &Module, kind: &str) -> usize {
    module
        .all_ops()
        .into_iter()
        .filter(|&op| module.op(op).unwrap().kind == kind)
        .count()
}
