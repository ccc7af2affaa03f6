//! End-to-end pipelines over an imported-style graph.

mod common;

use anyhow::Context;
use common::{PassOptions, PassPipeline, PipelineConfig, init_tracing, node, placeholder};
use flowgraph_core::attr::{INPUT_SHAPES_ATTR, OUTPUT_SHAPES_ATTR, SHARDING_ATTR};
use flowgraph_core::{
    Attribute, DataType, Error, Module, NewOp, OpRegistry, Pass, Result, Shape, TensorData,
    TensorType, TensorValue,
};
use flowgraph_passes::ops::standard_registry;
use flowgraph_passes::passes::REPLICATED;

/// `y = Relu(BiasAdd(MatMul(x, w), b))` with types only in attributes.
fn dense_layer() -> Module {
    let mut module = Module::new();
    let graph = module.graph();
    let x = placeholder(&mut module, "x", DataType::F32, Shape::fixed(&[2, 3]));

    let weights = TensorValue::new(TensorData::F32(vec![0.5; 6]), vec![3, 2]).unwrap();
    let w = module
        .append_op(
            graph,
            NewOp::new("Const")
                .name("w")
                .attr("value", weights)
                .result(TensorType::unknown()),
        )
        .unwrap();
    let w = module.result(w, 0).unwrap();
    let bias = module
        .append_op(
            graph,
            NewOp::new("Const")
                .name("b")
                .attr("value", TensorValue::vector(TensorData::F32(vec![0.0, 1.0])))
                .result(TensorType::unknown()),
        )
        .unwrap();
    let bias = module.result(bias, 0).unwrap();

    let unknown = TensorType::unknown();
    let (_, mm) = node(&mut module, graph, "MatMul", "mm", &[x, w], unknown.clone());
    let (_, biased) = node(&mut module, graph, "BiasAdd", "ba", &[mm, bias], unknown.clone());
    let (relu, _) = node(&mut module, graph, "Relu", "y", &[biased], unknown);
    module
        .op_mut(relu)
        .unwrap()
        .attrs
        .set(OUTPUT_SHAPES_ATTR, Attribute::Shapes(vec![Shape::fixed(&[2, 2])]));
    module
}

#[test]
fn test_import_to_export_pipeline() -> anyhow::Result<()> {
    init_tracing();
    let mut module = dense_layer();

    let pipeline = PipelineConfig::new()
        .pass("consolidate-attributes", PassOptions::new())
        .pass("shape-inference", PassOptions::new())
        .pass("remapper", PassOptions::new())
        .pass("topo-sort", PassOptions::new())
        .pass(
            "graph-to-func",
            PassOptions::new().with("feeds", "x").with("fetches", "y"),
        )
        .pass("prepare-attributes-for-export", PassOptions::new())
        .pass("auto-sharding", PassOptions::new())
        .build()?;
    assert_eq!(pipeline.len(), 7);
    assert!(pipeline.run(&mut module, &standard_registry())?);

    assert!(module.region(module.graph())?.ops().is_empty());

    let main = module.function("main").context("main function missing")?;
    assert_eq!(
        main.result_types,
        vec![TensorType::fixed(DataType::F32, &[2, 2])]
    );
    assert_eq!(
        main.attrs.get_shapes(INPUT_SHAPES_ATTR)?,
        &[Shape::fixed(&[2, 3])]
    );
    assert_eq!(main.arg_attrs[0].get_str(SHARDING_ATTR)?, REPLICATED);
    assert_eq!(main.result_attrs[0].get_str(SHARDING_ATTR)?, REPLICATED);

    let body = main.body();
    let arg = module.function_args("main")?[0];
    assert_eq!(
        module.value_type(arg)?,
        &TensorType::fixed(DataType::F32, &[2, 3])
    );
    assert_eq!(
        common::kinds(&module, body),
        vec!["Const", "Const", "_FusedMatMul", "return"]
    );

    let fused = module
        .find_op_by_name(body, "y")
        .context("fused op missing")?;
    let fused = module.op(fused)?;
    assert_eq!(fused.operands()[0], arg);
    assert_eq!(
        fused.attrs.get_strings("fused_ops")?,
        &["BiasAdd".to_string(), "Relu".to_string()]
    );
    assert!(fused.attrs.contains(OUTPUT_SHAPES_ATTR));
    Ok(())
}

#[test]
fn test_pipeline_config_errors() {
    init_tracing();
    let unknown = PipelineConfig::new()
        .pass("topo-sort", PassOptions::new())
        .pass("inline-everything", PassOptions::new())
        .build();
    assert!(matches!(unknown, Err(Error::UnknownPass(name)) if name == "inline-everything"));

    let malformed = PipelineConfig::new()
        .pass("dedupe-and-hoist-constant", PassOptions::new().with("max-size", "ten"))
        .build();
    assert!(matches!(malformed, Err(Error::InvalidOption { .. })));
}

/// Leaves a function without its terminator.
struct BreakingPass;

impl Pass for BreakingPass {
    fn name(&self) -> &str {
        "breaking"
    }

    fn run(&self, module: &mut Module, _registry: &OpRegistry) -> Result<bool> {
        module.add_function("broken", vec![], vec![TensorType::unknown()])?;
        Ok(true)
    }
}

#[test]
fn test_verification_catches_malformed_output() {
    init_tracing();
    let mut pipeline = PassPipeline::new();
    pipeline.add_pass(BreakingPass);

    let err = pipeline
        .run(&mut Module::new(), &standard_registry())
        .unwrap_err();
    assert!(matches!(err, Error::PassFailed { ref pass, .. } if pass == "breaking"));

    pipeline.set_verify_each(false);
    assert!(pipeline.run(&mut Module::new(), &standard_registry()).unwrap());
}
