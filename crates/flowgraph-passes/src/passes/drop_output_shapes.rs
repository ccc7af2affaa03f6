//! Removes the unregistered `_output_shapes` attribute.

use crate::options::PassOptions;
use flowgraph_core::attr::OUTPUT_SHAPES_ATTR;
use flowgraph_core::{Module, OpRegistry, Pass, Result};
use std::collections::HashSet;
use tracing::debug;

/// Pass that drops `_output_shapes` from every op whose kind is not skipped.
#[derive(Default)]
pub struct DropOutputShapesAttrPass {
    skip: HashSet<String>,
}

impl DropOutputShapesAttrPass {
    /// Create a pass that processes every op kind.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a pass that leaves the given op kinds untouched.
    pub fn with_skip<I, S>(skip: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            skip: skip.into_iter().map(Into::into).collect(),
        }
    }

    /// Read options from a by-name map.
    pub fn from_options(opts: &PassOptions) -> Result<Self> {
        opts.expect_only("drop-output-shapes-attr", &["skip"])?;
        Ok(Self::with_skip(opts.get_list("skip")))
    }
}

impl Pass for DropOutputShapesAttrPass {
    fn name(&self) -> &str {
        "drop-output-shapes-attr"
    }

    fn run(&self, module: &mut Module, _registry: &OpRegistry) -> Result<bool> {
        let mut dropped = 0usize;
        for op in module.all_ops() {
            let node = module.op_mut(op)?;
            if self.skip.contains(&node.kind) {
                continue;
            }
            if node.attrs.remove(OUTPUT_SHAPES_ATTR).is_some() {
                dropped += 1;
            }
        }

        debug!(dropped, "dropped output shape attributes");
        Ok(dropped > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowgraph_core::{Attribute, NewOp, Shape};

    #[test]
    fn test_drops_attribute_except_skipped_kinds() {
        let mut module = Module::new();
        let graph = module.graph();
        let shapes = Attribute::Shapes(vec![Shape::fixed(&[1])]);
        let a = module
            .append_op(
                graph,
                NewOp::new("NoOp").attr(OUTPUT_SHAPES_ATTR, shapes.clone()),
            )
            .unwrap();
        let b = module
            .append_op(graph, NewOp::new("Keep").attr(OUTPUT_SHAPES_ATTR, shapes))
            .unwrap();

        let pass = DropOutputShapesAttrPass::with_skip(["Keep"]);
        assert!(pass.run(&mut module, &OpRegistry::new()).unwrap());
        assert!(!module.op(a).unwrap().attrs.contains(OUTPUT_SHAPES_ATTR));
        assert!(module.op(b).unwrap().attrs.contains(OUTPUT_SHAPES_ATTR));

        // Idempotent
        assert!(!pass.run(&mut module, &OpRegistry::new()).unwrap());
    }
}
