//! Transformation passes over the dataflow graph IR.
//!
//! Each pass implements [`flowgraph_core::Pass`] and mutates a
//! [`flowgraph_core::Module`] in place, reporting whether it changed
//! anything. Passes are sequenced by a [`PassPipeline`], either assembled in
//! code or built by name from a [`PipelineConfig`]:
//!
//! | name                              | pass                                |
//! |-----------------------------------|-------------------------------------|
//! | `topo-sort`                       | [`TopoSortPass`]                    |
//! | `dedupe-and-hoist-constant`       | [`DedupeAndHoistConstantPass`]      |
//! | `drop-output-shapes-attr`         | [`DropOutputShapesAttrPass`]        |
//! | `graph-to-func`                   | [`GraphToFuncPass`]                 |
//! | `functional-to-region`            | [`FunctionalToRegionPass`]          |
//! | `control-flow-sink`               | [`ControlFlowSinkPass`]             |
//! | `remapper`                        | [`RemapperPass`]                    |
//! | `consolidate-attributes`          | [`ConsolidateAttributesPass`]       |
//! | `prepare-attributes-for-export`   | [`PrepareAttributesForExportPass`]  |
//! | `eliminate-passthrough-iter-args` | [`EliminatePassthroughIterArgsPass`]|
//! | `shape-inference`                 | [`ShapeInferencePass`]              |
//! | `auto-sharding`                   | [`AutoShardingPass`]                |
//!
//! # Example
//!
//! ```
//! use flowgraph_core::{DataType, Module, NewOp, TensorType};
//! use flowgraph_passes::{ops::standard_registry, PassOptions, PipelineConfig};
//!
//! # fn main() -> flowgraph_core::Result<()> {
//! let mut module = Module::new();
//! let graph = module.graph();
//! let x = module.append_op(
//!     graph,
//!     NewOp::new("Placeholder")
//!         .name("x")
//!         .attr("dtype", DataType::F32)
//!         .result(TensorType::unknown()),
//! )?;
//! let x = module.result(x, 0)?;
//! module.append_op(graph, NewOp::new("Relu").name("y").operands([x]).result(TensorType::unknown()))?;
//!
//! let pipeline = PipelineConfig::new()
//!     .pass("shape-inference", PassOptions::new())
//!     .pass("graph-to-func", PassOptions::new().with("feeds", "x").with("fetches", "y"))
//!     .build()?;
//! pipeline.run(&mut module, &standard_registry())?;
//!
//! assert!(module.function("main").is_some());
//! # Ok(())
//! # }
//! ```

pub mod ops;
pub mod options;
pub mod passes;

pub use options::{PassOptions, PipelineConfig};
pub use passes::{
    AutoShardingPass, ConsolidateAttributesPass, ControlFlowSinkPass, DedupeAndHoistConstantPass,
    DedupeOptions, DropOutputShapesAttrPass, EliminatePassthroughIterArgsPass,
    FunctionalToRegionPass, GraphToFuncOptions, GraphToFuncPass, PrepareAttributesForExportPass,
    RemapperOptions, RemapperPass, ShapeInferenceOptions, ShapeInferencePass, TopoSortPass,
};

// Re-export commonly used types from flowgraph-core
pub use flowgraph_core::{Error, Module, OpRegistry, Pass, Result};

/// Names accepted by [`create_pass`], in no particular order.
pub const PASS_NAMES: &[&str] = &[
    "topo-sort",
    "dedupe-and-hoist-constant",
    "drop-output-shapes-attr",
    "graph-to-func",
    "functional-to-region",
    "control-flow-sink",
    "remapper",
    "consolidate-attributes",
    "prepare-attributes-for-export",
    "eliminate-passthrough-iter-args",
    "shape-inference",
    "auto-sharding",
];

/// An ordered sequence of passes.
///
/// Passes run in insertion order. The first failing pass stops the pipeline
/// and its error is returned wrapped in [`Error::PassFailed`]. With
/// verification enabled (the default) the module is checked after every pass
/// and a pass leaving a malformed module counts as failed.
pub struct PassPipeline {
    passes: Vec<Box<dyn Pass>>,
    verify_each: bool,
}

impl PassPipeline {
    /// Create an empty pipeline.
    pub fn new() -> Self {
        Self {
            passes: Vec::new(),
            verify_each: true,
        }
    }

    /// Append a pass.
    ///
    /// Returns a mutable reference to self for method chaining.
    pub fn add_pass(&mut self, pass: impl Pass + 'static) -> &mut Self {
        self.passes.push(Box::new(pass));
        self
    }

    /// Append an already boxed pass.
    pub fn add_boxed(&mut self, pass: Box<dyn Pass>) -> &mut Self {
        self.passes.push(pass);
        self
    }

    pub fn len(&self) -> usize {
        self.passes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.passes.is_empty()
    }

    /// Names of the passes, in run order.
    pub fn pass_names(&self) -> Vec<&str> {
        self.passes.iter().map(|p| p.name()).collect()
    }

    /// Enable or disable verification after each pass.
    pub fn set_verify_each(&mut self, verify_each: bool) -> &mut Self {
        self.verify_each = verify_each;
        self
    }

    /// Run every pass in order. Returns whether any pass changed the module.
    #[tracing::instrument(skip_all, fields(num_passes = self.passes.len()))]
    pub fn run(&self, module: &mut Module, registry: &OpRegistry) -> Result<bool> {
        let mut changed = false;
        for pass in &self.passes {
            let _span = tracing::debug_span!("pass", name = pass.name()).entered();
            let wrap = |source: Error| Error::PassFailed {
                pass: pass.name().to_string(),
                source: Box::new(source),
            };

            let pass_changed = pass.run(module, registry).map_err(wrap)?;
            if self.verify_each {
                module.verify().map_err(wrap)?;
            }
            tracing::debug!(changed = pass_changed, "pass finished");
            changed |= pass_changed;
        }
        Ok(changed)
    }
}

impl Default for PassPipeline {
    fn default() -> Self {
        Self::new()
    }
}

/// Build a pass from its registered name and a by-name option map.
///
/// # Errors
///
/// Returns [`Error::UnknownPass`] for unrecognised names and
/// [`Error::InvalidOption`] for unknown or malformed options.
pub fn create_pass(name: &str, options: &PassOptions) -> Result<Box<dyn Pass>> {
    let no_options = || options.expect_only(name, &[]);
    let pass: Box<dyn Pass> = match name {
        "topo-sort" => {
            no_options()?;
            Box::new(TopoSortPass::new())
        }
        "dedupe-and-hoist-constant" => Box::new(DedupeAndHoistConstantPass::with_options(
            DedupeOptions::from_options(options)?,
        )),
        "drop-output-shapes-attr" => Box::new(DropOutputShapesAttrPass::from_options(options)?),
        "graph-to-func" => Box::new(GraphToFuncPass::new(GraphToFuncOptions::from_options(
            options,
        )?)),
        "functional-to-region" => {
            no_options()?;
            Box::new(FunctionalToRegionPass::new())
        }
        "control-flow-sink" => {
            no_options()?;
            Box::new(ControlFlowSinkPass::new())
        }
        "remapper" => Box::new(RemapperPass::new(RemapperOptions::from_options(options)?)),
        "consolidate-attributes" => {
            no_options()?;
            Box::new(ConsolidateAttributesPass::new())
        }
        "prepare-attributes-for-export" => {
            no_options()?;
            Box::new(PrepareAttributesForExportPass::new())
        }
        "eliminate-passthrough-iter-args" => {
            no_options()?;
            Box::new(EliminatePassthroughIterArgsPass::new())
        }
        "shape-inference" => Box::new(ShapeInferencePass::with_options(
            ShapeInferenceOptions::from_options(options)?,
        )),
        "auto-sharding" => {
            no_options()?;
            Box::new(AutoShardingPass::new())
        }
        other => return Err(Error::UnknownPass(other.to_string())),
    };
    Ok(pass)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoOpPass;

    impl Pass for NoOpPass {
        fn name(&self) -> &str {
            "noop"
        }

        fn run(&self, _module: &mut Module, _registry: &OpRegistry) -> Result<bool> {
            Ok(false)
        }
    }

    struct FailingPass;

    impl Pass for FailingPass {
        fn name(&self) -> &str {
            "failing"
        }

        fn run(&self, _module: &mut Module, _registry: &OpRegistry) -> Result<bool> {
            Err(Error::UnsupportedForm("always".to_string()))
        }
    }

    #[test]
    fn test_pipeline_add_pass() {
        let mut pipeline = PassPipeline::new();
        assert!(pipeline.is_empty());
        pipeline.add_pass(NoOpPass).add_pass(TopoSortPass::new());
        assert_eq!(pipeline.len(), 2);
        assert_eq!(pipeline.pass_names(), vec!["noop", "topo-sort"]);
    }

    #[test]
    fn test_pipeline_stops_at_first_failure() {
        let mut pipeline = PassPipeline::new();
        pipeline.add_pass(FailingPass).add_pass(NoOpPass);

        let err = pipeline
            .run(&mut Module::new(), &OpRegistry::new())
            .unwrap_err();
        match err {
            Error::PassFailed { pass, source } => {
                assert_eq!(pass, "failing");
                assert!(matches!(*source, Error::UnsupportedForm(_)));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_create_every_named_pass() {
        for &name in PASS_NAMES {
            let pass = create_pass(name, &PassOptions::new()).unwrap();
            assert_eq!(pass.name(), name);
        }
    }

    #[test]
    fn test_create_pass_rejects_unknown() {
        assert!(matches!(
            create_pass("inline", &PassOptions::new()),
            Err(Error::UnknownPass(_))
        ));
        assert!(matches!(
            create_pass("topo-sort", &PassOptions::new().with("max-size", "3")),
            Err(Error::InvalidOption { .. })
        ));
    }
}
