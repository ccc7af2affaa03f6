//! Automatic sharding.
//!
//! The pass itself only owns the pass-manager contract; choosing shardings is
//! delegated to a [`ShardingSolver`].

use flowgraph_core::attr::SHARDING_ATTR;
use flowgraph_core::{Module, OpRegistry, Pass, Result};
use tracing::debug;

/// Sharding annotation meaning "full copy on every device".
pub const REPLICATED: &str = "{replicated}";

/// Strategy that assigns shardings to a module.
pub trait ShardingSolver: Send + Sync {
    /// Solver name for logging.
    fn name(&self) -> &str;

    /// Rewrite sharding annotations. Returns whether anything changed.
    fn solve(&self, module: &mut Module) -> Result<bool>;
}

/// Solver that replicates every function argument and result that has no
/// sharding annotation yet. Existing annotations are left alone.
pub struct ReplicateSolver;

impl ShardingSolver for ReplicateSolver {
    fn name(&self) -> &str {
        "replicate"
    }

    fn solve(&self, module: &mut Module) -> Result<bool> {
        let names: Vec<String> = module
            .functions()
            .iter()
            .map(|f| f.name().to_string())
            .collect();

        let mut stamped = 0usize;
        for name in names {
            let Some(func) = module.function_mut(&name) else {
                continue;
            };
            for attrs in func.arg_attrs.iter_mut().chain(func.result_attrs.iter_mut()) {
                if !attrs.contains(SHARDING_ATTR) {
                    attrs.set(SHARDING_ATTR, REPLICATED);
                    stamped += 1;
                }
            }
        }
        Ok(stamped > 0)
    }
}

/// Pass that runs a [`ShardingSolver`] over the module.
pub struct AutoShardingPass {
    solver: Box<dyn ShardingSolver>,
}

impl AutoShardingPass {
    /// Create a pass using the replicating solver.
    pub fn new() -> Self {
        Self::with_solver(Box::new(ReplicateSolver))
    }

    pub fn with_solver(solver: Box<dyn ShardingSolver>) -> Self {
        Self { solver }
    }
}

impl Pass for AutoShardingPass {
    fn name(&self) -> &str {
        "auto-sharding"
    }

    fn run(&self, module: &mut Module, _registry: &OpRegistry) -> Result<bool> {
        let changed = self.solver.solve(module)?;
        debug!(solver = self.solver.name(), changed, "auto sharding complete");
        Ok(changed)
    }
}

impl Default for AutoShardingPass {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowgraph_core::ir::RETURN_KIND;
    use flowgraph_core::{DataType, Error, NewOp, TensorType};

    fn module_with_function() -> Module {
        let mut module = Module::new();
        let ty = TensorType::fixed(DataType::F32, &[4]);
        let body = module
            .add_function("main", vec![ty.clone(), ty.clone()], vec![ty])
            .unwrap();
        let arg = module.function_args("main").unwrap()[0];
        module
            .append_op(body, NewOp::new(RETURN_KIND).operands([arg]))
            .unwrap();
        module
    }

    #[test]
    fn test_replicates_unannotated_signature() {
        let mut module = module_with_function();
        let func = module.function_mut("main").unwrap();
        func.arg_attrs[1].set(SHARDING_ATTR, "{maximal device=0}");

        let pass = AutoShardingPass::new();
        assert!(pass.run(&mut module, &OpRegistry::new()).unwrap());

        let func = module.function("main").unwrap();
        assert_eq!(func.arg_attrs[0].get_str(SHARDING_ATTR).unwrap(), REPLICATED);
        assert_eq!(
            func.arg_attrs[1].get_str(SHARDING_ATTR).unwrap(),
            "{maximal device=0}"
        );
        assert_eq!(func.result_attrs[0].get_str(SHARDING_ATTR).unwrap(), REPLICATED);

        assert!(!pass.run(&mut module, &OpRegistry::new()).unwrap());
    }

    struct FailingSolver;

    impl ShardingSolver for FailingSolver {
        fn name(&self) -> &str {
            "failing"
        }

        fn solve(&self, _module: &mut Module) -> Result<bool> {
            Err(Error::UnsupportedForm("no mesh".to_string()))
        }
    }

    #[test]
    fn test_solver_failure_propagates() {
        let mut module = module_with_function();
        let pass = AutoShardingPass::with_solver(Box::new(FailingSolver));
        assert!(pass.run(&mut module, &OpRegistry::new()).is_err());
    }
}
