//! Attribute handling, constant dedupe and ordering passes.

mod common;

use common::{
    PassOptions, PipelineConfig, constant, f32_tensor, function, init_tracing, input, kinds, node,
    placeholder, standard_registry,
};
use flowgraph_core::attr::OUTPUT_SHAPES_ATTR;
use flowgraph_core::{Attribute, DataType, Module, NewOp, Shape, TensorType, ValueId};
use flowgraph_passes::{
    ConsolidateAttributesPass, DropOutputShapesAttrPass, Pass, PrepareAttributesForExportPass,
    TopoSortPass,
};

#[test]
fn test_drop_output_shapes_honours_skip() {
    init_tracing();
    let mut module = Module::new();
    let graph = module.graph();
    let x = input(&mut module, "x", f32_tensor(&[3]));
    let (konst, c) = constant(&mut module, graph, "c", vec![1.0, 2.0, 3.0]);
    let (add, _) = node(&mut module, graph, "Add", "add", &[x, c], f32_tensor(&[3]));
    for op in [konst, add] {
        let shapes = Attribute::Shapes(vec![Shape::fixed(&[3])]);
        module.op_mut(op).unwrap().attrs.set(OUTPUT_SHAPES_ATTR, shapes);
    }

    let pipeline = PipelineConfig::new()
        .pass("drop-output-shapes-attr", PassOptions::new().with("skip", "Const"))
        .build()
        .unwrap();
    assert!(pipeline.run(&mut module, &standard_registry()).unwrap());

    assert!(module.op(konst).unwrap().attrs.contains(OUTPUT_SHAPES_ATTR));
    assert!(!module.op(add).unwrap().attrs.contains(OUTPUT_SHAPES_ATTR));

    let again = DropOutputShapesAttrPass::with_skip(["Const"]);
    assert!(!again.run(&mut module, &standard_registry()).unwrap());
}

#[test]
fn test_consolidate_round_trip_is_stable() {
    init_tracing();
    let mut module = Module::new();
    let graph = module.graph();
    let x = placeholder(&mut module, "x", DataType::F32, Shape::fixed(&[2, 2]));
    let (relu, _) = node(&mut module, graph, "Relu", "relu", &[x], TensorType::unknown());
    let shapes = Attribute::Shapes(vec![Shape::fixed(&[2, 2])]);
    module.op_mut(relu).unwrap().attrs.set(OUTPUT_SHAPES_ATTR, shapes);

    let registry = standard_registry();
    let consolidate = ConsolidateAttributesPass::new();
    consolidate.run(&mut module, &registry).unwrap();
    let snapshot: Vec<TensorType> = (0..module.value_count())
        .map(|i| module.value_type(ValueId(i)).unwrap().clone())
        .collect();
    let attrs_after_first: Vec<_> = module
        .all_ops()
        .into_iter()
        .map(|op| module.op(op).unwrap().attrs.clone())
        .collect();

    PrepareAttributesForExportPass::new()
        .run(&mut module, &registry)
        .unwrap();
    assert!(module.op(relu).unwrap().attrs.contains(OUTPUT_SHAPES_ATTR));

    consolidate.run(&mut module, &registry).unwrap();
    let types: Vec<TensorType> = (0..module.value_count())
        .map(|i| module.value_type(ValueId(i)).unwrap().clone())
        .collect();
    let attrs: Vec<_> = module
        .all_ops()
        .into_iter()
        .map(|op| module.op(op).unwrap().attrs.clone())
        .collect();
    assert_eq!(types, snapshot);
    assert_eq!(attrs, attrs_after_first);
    assert_eq!(
        module.value_type(x).unwrap(),
        &TensorType::fixed(DataType::F32, &[2, 2])
    );
}

#[test]
fn test_consolidate_conflict_aborts_pipeline() {
    init_tracing();
    let mut module = Module::new();
    let graph = module.graph();
    let x = placeholder(&mut module, "x", DataType::F32, Shape::fixed(&[4]));
    let x_op = module.value(x).unwrap().defining_op().unwrap();
    let shapes = Attribute::Shapes(vec![Shape::fixed(&[5])]);
    module.op_mut(x_op).unwrap().attrs.set(OUTPUT_SHAPES_ATTR, shapes);
    node(&mut module, graph, "Relu", "relu", &[x], TensorType::unknown());

    let pipeline = PipelineConfig::new()
        .pass("consolidate-attributes", PassOptions::new())
        .pass("shape-inference", PassOptions::new())
        .build()
        .unwrap();
    let err = pipeline.run(&mut module, &standard_registry()).unwrap_err();
    assert!(err.to_string().contains("consolidate-attributes"));
    assert_eq!(module.value_type(x).unwrap(), &TensorType::unknown());
}

#[test]
fn test_duplicate_constants_collapse_to_one() {
    init_tracing();
    let mut module = Module::new();
    let graph = module.graph();
    let x = input(&mut module, "x", f32_tensor(&[2]));
    let (_, c1) = constant(&mut module, graph, "c1", vec![1.0, 2.0]);
    let (a, _) = node(&mut module, graph, "Mul", "a", &[x, c1], f32_tensor(&[2]));
    let (_, c2) = constant(&mut module, graph, "c2", vec![1.0, 2.0]);
    let (b, _) = node(&mut module, graph, "Mul", "b", &[x, c2], f32_tensor(&[2]));
    let (_, big) = constant(&mut module, graph, "big", vec![0.0; 16]);
    let (_, big2) = constant(&mut module, graph, "big2", vec![0.0; 16]);
    node(&mut module, graph, "Add", "sum", &[big, big2], f32_tensor(&[16]));

    let pipeline = PipelineConfig::new()
        .pass("dedupe-and-hoist-constant", PassOptions::new())
        .pass("topo-sort", PassOptions::new())
        .build()
        .unwrap();
    assert!(pipeline.run(&mut module, &standard_registry()).unwrap());

    let rep = module.op(a).unwrap().operands()[1];
    assert_eq!(module.op(b).unwrap().operands()[1], rep);
    // Over the size threshold: both kept.
    let consts = kinds(&module, graph)
        .iter()
        .filter(|k| k.as_str() == "Const")
        .count();
    assert_eq!(consts, 3);
    assert_eq!(kinds(&module, graph)[0], "Const");
}

#[test]
fn test_constants_feeding_calls_are_kept_apart() {
    init_tracing();
    let build = || {
        let mut module = Module::new();
        function(
            &mut module,
            "callee",
            vec![f32_tensor(&[1])],
            vec![f32_tensor(&[1])],
            |_, _, args| vec![args[0]],
        );
        let graph = module.graph();
        let (_, c1) = constant(&mut module, graph, "c1", vec![1.0]);
        let (_, c2) = constant(&mut module, graph, "c2", vec![1.0]);
        module
            .append_op(
                graph,
                NewOp::new("PartitionedCall")
                    .operands([c1])
                    .func("f", "callee")
                    .result(f32_tensor(&[1])),
            )
            .unwrap();
        node(&mut module, graph, "Neg", "neg", &[c2], f32_tensor(&[1]));
        module
    };
    let count_consts = |module: &Module| {
        kinds(module, module.graph())
            .iter()
            .filter(|k| k.as_str() == "Const")
            .count()
    };

    let mut module = build();
    PipelineConfig::new()
        .pass("dedupe-and-hoist-constant", PassOptions::new())
        .build()
        .unwrap()
        .run(&mut module, &standard_registry())
        .unwrap();
    assert_eq!(count_consts(&module), 2);

    let mut module = build();
    PipelineConfig::new()
        .pass(
            "dedupe-and-hoist-constant",
            PassOptions::new().with("assume-strict-calls", "true"),
        )
        .build()
        .unwrap()
        .run(&mut module, &standard_registry())
        .unwrap();
    assert_eq!(count_consts(&module), 1);
}

#[test]
fn test_topo_sort_orders_producers_first() {
    init_tracing();
    let mut module = Module::new();
    let graph = module.graph();
    let x = input(&mut module, "x", f32_tensor(&[2]));
    let (neg, neg_out) = node(&mut module, graph, "Neg", "neg", &[x], f32_tensor(&[2]));
    let (relu, _) = node(&mut module, graph, "Relu", "relu", &[neg_out], f32_tensor(&[2]));
    // Put the consumer first.
    module.move_op_before(relu, neg).unwrap();

    let pass = TopoSortPass::new();
    assert!(pass.run(&mut module, &standard_registry()).unwrap());
    assert!(module.position(neg).unwrap() < module.position(relu).unwrap());
    assert!(!pass.run(&mut module, &standard_registry()).unwrap());
}
