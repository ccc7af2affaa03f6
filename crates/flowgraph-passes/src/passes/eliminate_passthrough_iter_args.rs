//! Removes loop-carried values that a loop body passes through unchanged.

use flowgraph_core::{Module, OpId, OpRegistry, Pass, Result};
use tracing::{debug, trace};

/// Pass that drops passthrough iteration arguments of `WhileRegion` ops.
///
/// Slot `i` is a passthrough when the body's `yield` operand `i` is the
/// body's own argument `i`. Its value never changes, so every use of the
/// slot (inside cond, inside body, and of the loop result) can read the
/// pre-loop operand directly.
pub struct EliminatePassthroughIterArgsPass;

impl EliminatePassthroughIterArgsPass {
    /// Create a new pass.
    pub fn new() -> Self {
        Self
    }

    /// Passthrough slots of a well-formed `WhileRegion`, highest first.
    fn passthrough_slots(module: &Module, op: OpId) -> Result<Vec<usize>> {
        let node = module.op(op)?;
        let [cond, body] = node.regions() else {
            return Ok(Vec::new());
        };
        let num_slots = node.operands().len();
        let (cond_args, body_args) = (module.region(*cond)?.args(), module.region(*body)?.args());
        let Some(term) = module.terminator(*body) else {
            return Ok(Vec::new());
        };
        let yielded = module.op(term)?.operands();
        if cond_args.len() != num_slots
            || body_args.len() != num_slots
            || yielded.len() != num_slots
            || node.results().len() != num_slots
        {
            trace!(op = node.display_name(), "malformed loop signature; skipped");
            return Ok(Vec::new());
        }

        Ok((0..num_slots)
            .rev()
            .filter(|&i| yielded[i] == body_args[i])
            .collect())
    }

    fn remove_slot(module: &mut Module, op: OpId, slot: usize) -> Result<()> {
        let node = module.op(op)?;
        let (cond, body) = (node.regions()[0], node.regions()[1]);
        let init = node.operands()[slot];
        let result = node.results()[slot];
        let cond_arg = module.region(cond)?.args()[slot];
        let body_arg = module.region(body)?.args()[slot];

        module.replace_all_uses_with(body_arg, init)?;
        module.replace_all_uses_with(cond_arg, init)?;
        module.replace_all_uses_with(result, init)?;

        if let Some(term) = module.terminator(body) {
            module.remove_operand(term, slot)?;
        }
        module.remove_region_arg(cond, slot)?;
        module.remove_region_arg(body, slot)?;
        module.remove_operand(op, slot)?;
        module.remove_result(op, slot)?;
        Ok(())
    }
}

impl Pass for EliminatePassthroughIterArgsPass {
    fn name(&self) -> &str {
        "eliminate-passthrough-iter-args"
    }

    fn run(&self, module: &mut Module, _registry: &OpRegistry) -> Result<bool> {
        let mut removed = 0usize;
        for op in module.all_ops() {
            if module.op(op)?.kind != "WhileRegion" {
                continue;
            }
            for slot in Self::passthrough_slots(module, op)? {
                trace!(op = module.op(op)?.display_name(), slot, "removing passthrough slot");
                Self::remove_slot(module, op, slot)?;
                removed += 1;
            }
        }

        debug!(removed, "passthrough iteration arguments eliminated");
        Ok(removed > 0)
    }
}

impl Default for EliminatePassthroughIterArgsPass {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowgraph_core::ir::YIELD_KIND;
    use flowgraph_core::{DataType, Execution, NewOp, TensorType, ValueId};

    fn f32s() -> TensorType {
        TensorType::fixed(DataType::F32, &[2])
    }

    /// WhileRegion(a, b): cond yields Any(a'), body yields (Neg(a'), b').
    fn build() -> (Module, OpId, ValueId, ValueId) {
        let mut module = Module::new();
        let graph = module.graph();
        let a = module
            .append_op(graph, NewOp::new("Placeholder").result(f32s()))
            .unwrap();
        let b = module
            .append_op(graph, NewOp::new("Placeholder").result(f32s()))
            .unwrap();
        let (a, b) = (module.result(a, 0).unwrap(), module.result(b, 0).unwrap());
        let w = module
            .append_op(
                graph,
                NewOp::new("WhileRegion").operands([a, b]).results([f32s(), f32s()]),
            )
            .unwrap();

        let cond = module.add_op_region(w, Execution::Repeated).unwrap();
        let ca = module.add_region_arg(cond, f32s()).unwrap();
        let cb = module.add_region_arg(cond, f32s()).unwrap();
        let any = module
            .append_op(
                cond,
                NewOp::new("Any")
                    .operands([ca, cb])
                    .result(TensorType::fixed(DataType::Bool, &[])),
            )
            .unwrap();
        let any_out = module.result(any, 0).unwrap();
        module
            .append_op(cond, NewOp::new(YIELD_KIND).operands([any_out]))
            .unwrap();

        let body = module.add_op_region(w, Execution::Repeated).unwrap();
        let ba = module.add_region_arg(body, f32s()).unwrap();
        let bb = module.add_region_arg(body, f32s()).unwrap();
        let neg = module
            .append_op(body, NewOp::new("Neg").operands([ba]).result(f32s()))
            .unwrap();
        let neg_out = module.result(neg, 0).unwrap();
        module
            .append_op(body, NewOp::new(YIELD_KIND).operands([neg_out, bb]))
            .unwrap();

        (module, w, a, b)
    }

    #[test]
    fn test_removes_passthrough_slot() {
        let (mut module, w, a, b) = build();
        let graph = module.graph();
        let second = module.result(w, 1).unwrap();
        let user = module
            .append_op(graph, NewOp::new("Identity").operands([second]).result(f32s()))
            .unwrap();

        let pass = EliminatePassthroughIterArgsPass::new();
        assert!(pass.run(&mut module, &OpRegistry::new()).unwrap());

        let node = module.op(w).unwrap();
        assert_eq!(node.operands(), &[a]);
        assert_eq!(node.results().len(), 1);
        assert_eq!(module.op(user).unwrap().operands(), &[b]);
        for &region in node.regions() {
            assert_eq!(module.region(region).unwrap().args().len(), 1);
        }
        let body = node.regions()[1];
        let term = module.terminator(body).unwrap();
        assert_eq!(module.op(term).unwrap().operands().len(), 1);
        assert!(module.verify().is_ok());

        // Idempotent
        assert!(!pass.run(&mut module, &OpRegistry::new()).unwrap());
    }
}
