//! Functional to region control-flow conversion.
//!
//! `If`/`Case`/`While` ops reference their branches and loop body by function
//! name. This pass inlines copies of those functions as owned regions:
//! - `If`, `StatelessIf` → `IfRegion` (`then_branch`, `else_branch`)
//! - `Case`, `StatelessCase` → `CaseRegion` (`branches`)
//! - `While`, `StatelessWhile` → `WhileRegion` (`cond`, `body`)
//!
//! Branch regions capture the op's data operands directly; loop regions
//! receive the loop-carried values as region arguments.

use flowgraph_core::ir::YIELD_KIND;
use flowgraph_core::{
    Error, Execution, Module, OpForm, OpId, OpRegistry, Pass, RegionId, Result, ValueId,
};
use std::collections::HashMap;
use tracing::{debug, trace};

/// Upper bound on conversion sweeps (each sweep handles one level of nesting
/// introduced by copied callee bodies).
const MAX_SWEEPS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flavor {
    /// Branches see operands `1..` by capture; operand 0 selects the branch.
    Branch,
    /// Cond and body take every operand as a region argument.
    Loop,
}

#[derive(Debug)]
struct Conversion {
    op: OpId,
    region_kind: &'static str,
    flavor: Flavor,
    callees: Vec<String>,
}

/// Pass converting functional control flow to region form.
pub struct FunctionalToRegionPass;

impl FunctionalToRegionPass {
    /// Create a new conversion pass.
    pub fn new() -> Self {
        Self
    }

    fn callee<'m>(module: &'m Module, op: OpId, role: &str) -> Result<Vec<&'m str>> {
        let node = module.op(op)?;
        let names: Vec<&str> = node
            .func_refs()
            .iter()
            .filter(|r| r.role == role)
            .map(|r| r.func.as_str())
            .collect();
        if names.is_empty() {
            return Err(Error::StructuralViolation(format!(
                "{} op '{}' has no '{}' function",
                node.kind,
                node.display_name(),
                role
            )));
        }
        Ok(names)
    }

    /// Validate one candidate and describe its conversion.
    fn plan(module: &Module, op: OpId) -> Result<Option<Conversion>> {
        let node = module.op(op)?;
        if !matches!(node.form(), OpForm::Functional(_)) {
            return Ok(None);
        }
        let (region_kind, flavor, roles): (_, _, &[&str]) = match node.kind.as_str() {
            "If" | "StatelessIf" => (
                "IfRegion",
                Flavor::Branch,
                &["then_branch", "else_branch"][..],
            ),
            "Case" | "StatelessCase" => ("CaseRegion", Flavor::Branch, &["branches"][..]),
            "While" | "StatelessWhile" => ("WhileRegion", Flavor::Loop, &["cond", "body"][..]),
            _ => return Ok(None),
        };

        let num_operands = node.operands().len();
        let num_results = node.results().len();
        let unsupported = |what: String| {
            Error::UnsupportedForm(format!(
                "{} op '{}': {}",
                node.kind,
                node.display_name(),
                what
            ))
        };

        let (expected_args, carried) = match flavor {
            Flavor::Branch => {
                if num_operands == 0 {
                    return Err(unsupported("missing branch selector operand".to_string()));
                }
                (num_operands - 1, None)
            }
            Flavor::Loop => {
                if num_results != num_operands {
                    return Err(unsupported(format!(
                        "{} results for {} loop-carried operands",
                        num_results, num_operands
                    )));
                }
                (num_operands, Some(num_operands))
            }
        };

        let mut callees = Vec::new();
        for role in roles {
            for name in Self::callee(module, op, role)? {
                let func = module.function(name).ok_or_else(|| {
                    Error::StructuralViolation(format!(
                        "{} op '{}' references unknown function '{}'",
                        node.kind,
                        node.display_name(),
                        name
                    ))
                })?;
                if module.region_is_within(node.parent(), func.body()) {
                    return Err(unsupported(format!("recursive reference to '{}'", name)));
                }
                if module.terminator(func.body()).is_none() {
                    return Err(Error::StructuralViolation(format!(
                        "Function '{}' has no terminator",
                        name
                    )));
                }
                let num_args = module.region(func.body())?.args().len();
                if num_args != expected_args {
                    return Err(unsupported(format!(
                        "'{}' takes {} arguments, op supplies {}",
                        name, num_args, expected_args
                    )));
                }
                let expected_results = match (*role, carried) {
                    ("cond", Some(_)) => 1,
                    (_, Some(n)) => n,
                    (_, None) => num_results,
                };
                if func.result_types.len() != expected_results {
                    return Err(unsupported(format!(
                        "'{}' returns {} values, expected {}",
                        name,
                        func.result_types.len(),
                        expected_results
                    )));
                }
                callees.push(name.to_string());
            }
        }

        Ok(Some(Conversion {
            op,
            region_kind,
            flavor,
            callees,
        }))
    }

    fn apply(module: &mut Module, conversion: Conversion) -> Result<()> {
        let op = conversion.op;
        let operands = module.op(op)?.operands().to_vec();
        trace!(
            op = module.op(op)?.display_name(),
            kind = conversion.region_kind,
            "converting to region form"
        );

        module.set_form(op, OpForm::Plain)?;
        module.op_mut(op)?.kind = conversion.region_kind.to_string();

        for callee in &conversion.callees {
            let (body, params) = {
                let func = module.function(callee).ok_or_else(|| {
                    Error::StructuralViolation(format!("Function '{}' disappeared", callee))
                })?;
                (func.body(), module.region(func.body())?.args().to_vec())
            };

            let (region, inputs): (RegionId, Vec<ValueId>) = match conversion.flavor {
                Flavor::Branch => (
                    module.add_op_region(op, Execution::Once)?,
                    operands[1..].to_vec(),
                ),
                Flavor::Loop => {
                    let region = module.add_op_region(op, Execution::Repeated)?;
                    let mut args = Vec::with_capacity(operands.len());
                    for &v in &operands {
                        let ty = module.value_type(v)?.clone();
                        args.push(module.add_region_arg(region, ty)?);
                    }
                    (region, args)
                }
            };

            let mut mapping: HashMap<ValueId, ValueId> =
                params.into_iter().zip(inputs).collect();
            module.clone_region_into(body, region, &mut mapping)?;

            let terminator = module.terminator(region).ok_or_else(|| {
                Error::StructuralViolation(format!("Copy of '{}' lost its terminator", callee))
            })?;
            module.op_mut(terminator)?.kind = YIELD_KIND.to_string();
        }

        if conversion.flavor == Flavor::Branch {
            module.set_operands(op, vec![operands[0]])?;
        }
        Ok(())
    }
}

impl Pass for FunctionalToRegionPass {
    fn name(&self) -> &str {
        "functional-to-region"
    }

    fn run(&self, module: &mut Module, _registry: &OpRegistry) -> Result<bool> {
        let mut converted = 0usize;

        for sweep in 0..MAX_SWEEPS {
            // Validate every candidate before touching the module.
            let mut plans = Vec::new();
            for op in module.all_ops() {
                if let Some(plan) = Self::plan(module, op)? {
                    plans.push(plan);
                }
            }
            if plans.is_empty() {
                break;
            }
            if sweep + 1 == MAX_SWEEPS {
                debug!(remaining = plans.len(), "sweep limit reached");
            }
            for plan in plans {
                Self::apply(module, plan)?;
                converted += 1;
            }
        }

        debug!(converted, "functional control flow converted");
        Ok(converted > 0)
    }
}

impl Default for FunctionalToRegionPass {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowgraph_core::ir::RETURN_KIND;
    use flowgraph_core::{DataType, NewOp, TensorType};

    fn f32s() -> TensorType {
        TensorType::fixed(DataType::F32, &[2])
    }

    /// `name(x) = kind(x)` as a function.
    fn unary_function(module: &mut Module, name: &str, kind: &str) {
        let body = module.add_function(name, vec![f32s()], vec![f32s()]).unwrap();
        let arg = module.function_args(name).unwrap()[0];
        let op = module
            .append_op(body, NewOp::new(kind).operands([arg]).result(f32s()))
            .unwrap();
        let out = module.result(op, 0).unwrap();
        module
            .append_op(body, NewOp::new(RETURN_KIND).operands([out]))
            .unwrap();
    }

    fn inputs(module: &mut Module) -> (ValueId, ValueId) {
        let graph = module.graph();
        let p = module
            .append_op(
                graph,
                NewOp::new("Placeholder").result(TensorType::fixed(DataType::Bool, &[])),
            )
            .unwrap();
        let x = module
            .append_op(graph, NewOp::new("Placeholder").result(f32s()))
            .unwrap();
        (module.result(p, 0).unwrap(), module.result(x, 0).unwrap())
    }

    #[test]
    fn test_if_becomes_if_region() {
        let mut module = Module::new();
        unary_function(&mut module, "then_fn", "Neg");
        unary_function(&mut module, "else_fn", "Relu");
        let (p, x) = inputs(&mut module);
        let graph = module.graph();
        let if_op = module
            .append_op(
                graph,
                NewOp::new("If")
                    .operands([p, x])
                    .result(f32s())
                    .func("then_branch", "then_fn")
                    .func("else_branch", "else_fn"),
            )
            .unwrap();

        let pass = FunctionalToRegionPass::new();
        assert!(pass.run(&mut module, &OpRegistry::new()).unwrap());

        let node = module.op(if_op).unwrap();
        assert_eq!(node.kind, "IfRegion");
        assert_eq!(node.operands(), &[p]);
        assert_eq!(node.regions().len(), 2);

        let then_region = node.regions()[0];
        let ops = module.region(then_region).unwrap().ops().to_vec();
        let neg = module.op(ops[0]).unwrap();
        assert_eq!(neg.kind, "Neg");
        assert_eq!(neg.operands(), &[x]);
        assert_eq!(module.op(ops[1]).unwrap().kind, YIELD_KIND);

        assert!(module.function("then_fn").is_some());
        assert!(module.verify().is_ok());

        // Already in region form
        assert!(!pass.run(&mut module, &OpRegistry::new()).unwrap());
    }

    #[test]
    fn test_case_gets_one_region_per_branch() {
        let mut module = Module::new();
        let kinds = ["Neg", "Relu", "Exp"];
        for (i, kind) in kinds.iter().enumerate() {
            unary_function(&mut module, &format!("branch_{i}"), kind);
        }
        let graph = module.graph();
        let index = module
            .append_op(
                graph,
                NewOp::new("Placeholder").result(TensorType::fixed(DataType::I32, &[])),
            )
            .unwrap();
        let index = module.result(index, 0).unwrap();
        let (_, x) = inputs(&mut module);
        let case_op = module
            .append_op(
                graph,
                NewOp::new("StatelessCase")
                    .operands([index, x])
                    .result(f32s())
                    .func("branches", "branch_0")
                    .func("branches", "branch_1")
                    .func("branches", "branch_2"),
            )
            .unwrap();

        let pass = FunctionalToRegionPass::new();
        assert!(pass.run(&mut module, &OpRegistry::new()).unwrap());

        let node = module.op(case_op).unwrap();
        assert_eq!(node.kind, "CaseRegion");
        assert_eq!(node.operands(), &[index]);
        assert!(node.func_refs().is_empty());
        let regions = node.regions().to_vec();
        assert_eq!(regions.len(), kinds.len());
        for (region, kind) in regions.into_iter().zip(kinds) {
            let r = module.region(region).unwrap();
            assert_eq!(r.execution(), Execution::Once);
            assert!(r.args().is_empty());
            let ops = r.ops().to_vec();
            let first = module.op(ops[0]).unwrap();
            assert_eq!(first.kind, kind);
            assert_eq!(first.operands(), &[x]);
            assert_eq!(module.op(ops[1]).unwrap().kind, YIELD_KIND);
        }
        assert!(module.verify().is_ok());
        assert!(!pass.run(&mut module, &OpRegistry::new()).unwrap());
    }

    #[test]
    fn test_while_gets_region_arguments() {
        let mut module = Module::new();
        unary_function(&mut module, "body_fn", "Neg");
        let cond = module
            .add_function("cond_fn", vec![f32s()], vec![TensorType::unknown()])
            .unwrap();
        let arg = module.function_args("cond_fn").unwrap()[0];
        let c = module
            .append_op(
                cond,
                NewOp::new("Any").operands([arg]).result(TensorType::unknown()),
            )
            .unwrap();
        let c_out = module.result(c, 0).unwrap();
        module
            .append_op(cond, NewOp::new(RETURN_KIND).operands([c_out]))
            .unwrap();

        let (_, x) = inputs(&mut module);
        let graph = module.graph();
        let while_op = module
            .append_op(
                graph,
                NewOp::new("While")
                    .operands([x])
                    .result(f32s())
                    .func("cond", "cond_fn")
                    .func("body", "body_fn"),
            )
            .unwrap();

        FunctionalToRegionPass::new()
            .run(&mut module, &OpRegistry::new())
            .unwrap();

        let node = module.op(while_op).unwrap();
        assert_eq!(node.kind, "WhileRegion");
        assert_eq!(node.operands(), &[x]);
        for &region in node.regions() {
            let r = module.region(region).unwrap();
            assert_eq!(r.args().len(), 1);
            assert_eq!(r.execution(), Execution::Repeated);
        }
        assert!(module.verify().is_ok());
    }

    #[test]
    fn test_arity_mismatch_is_unsupported() {
        let mut module = Module::new();
        unary_function(&mut module, "then_fn", "Neg");
        unary_function(&mut module, "else_fn", "Neg");
        let (p, x) = inputs(&mut module);
        let graph = module.graph();
        module
            .append_op(
                graph,
                NewOp::new("If")
                    .operands([p, x, x])
                    .result(f32s())
                    .func("then_branch", "then_fn")
                    .func("else_branch", "else_fn"),
            )
            .unwrap();

        let result = FunctionalToRegionPass::new().run(&mut module, &OpRegistry::new());
        assert!(matches!(result, Err(Error::UnsupportedForm(_))));
    }

    #[test]
    fn test_unknown_callee_is_structural_violation() {
        let mut module = Module::new();
        let (p, x) = inputs(&mut module);
        let graph = module.graph();
        module
            .append_op(
                graph,
                NewOp::new("StatelessIf")
                    .operands([p, x])
                    .result(f32s())
                    .func("then_branch", "nope")
                    .func("else_branch", "nope"),
            )
            .unwrap();

        let result = FunctionalToRegionPass::new().run(&mut module, &OpRegistry::new());
        assert!(matches!(result, Err(Error::StructuralViolation(_))));
    }
}
