//! Converts the top-level graph into a named function.

use crate::options::PassOptions;
use flowgraph_core::ir::RETURN_KIND;
use flowgraph_core::{Error, Module, NewOp, OpId, OpRegistry, Pass, Result, ValueId};
use std::collections::HashMap;
use tracing::{debug, trace};

/// Options for [`GraphToFuncPass`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphToFuncOptions {
    /// Values that become function arguments (`op` or `op:index`).
    pub feeds: Vec<String>,

    /// Values that become function results (`op` or `op:index`).
    pub fetches: Vec<String>,

    /// Ops that become control results of the function.
    pub control_rets: Vec<String>,

    /// Name of the created function.
    pub func_name: String,
}

impl Default for GraphToFuncOptions {
    fn default() -> Self {
        Self {
            feeds: Vec::new(),
            fetches: Vec::new(),
            control_rets: Vec::new(),
            func_name: "main".to_string(),
        }
    }
}

impl GraphToFuncOptions {
    /// Read options from a by-name map.
    pub fn from_options(opts: &PassOptions) -> Result<Self> {
        opts.expect_only(
            "graph-to-func",
            &["feeds", "fetches", "control-rets", "func-name"],
        )?;
        Ok(Self {
            feeds: opts.get_list("feeds"),
            fetches: opts.get_list("fetches"),
            control_rets: opts.get_list("control-rets"),
            func_name: opts
                .get("func-name")
                .map(str::to_string)
                .unwrap_or_else(|| "main".to_string()),
        })
    }
}

/// Pass that turns the top-level graph into a function.
///
/// All names are resolved before anything is modified; an unresolved name
/// leaves the module unchanged.
pub struct GraphToFuncPass {
    options: GraphToFuncOptions,
}

impl GraphToFuncPass {
    /// Create a pass with the given options.
    pub fn new(options: GraphToFuncOptions) -> Self {
        Self { options }
    }

    /// Split `op:index` into its parts (`op` alone means index 0).
    fn parse_ref(entry: &str) -> Result<(&str, usize)> {
        match entry.rsplit_once(':') {
            Some((name, index)) => {
                let index = index.parse::<usize>().map_err(|e| Error::InvalidOption {
                    option: entry.to_string(),
                    message: format!("bad result index: {}", e),
                })?;
                Ok((name, index))
            }
            None => Ok((entry, 0)),
        }
    }

    fn resolve_op(module: &Module, name: &str) -> Result<OpId> {
        module
            .find_op_by_name(module.graph(), name)
            .ok_or_else(|| {
                Error::StructuralViolation(format!("No op named '{}' in the graph", name))
            })
    }

    fn resolve_value(module: &Module, entry: &str) -> Result<ValueId> {
        let (name, index) = Self::parse_ref(entry)?;
        let op = Self::resolve_op(module, name)?;
        module.result(op, index).map_err(|_| {
            Error::StructuralViolation(format!("Op '{}' has no result {}", name, index))
        })
    }
}

impl Pass for GraphToFuncPass {
    fn name(&self) -> &str {
        "graph-to-func"
    }

    fn run(&self, module: &mut Module, _registry: &OpRegistry) -> Result<bool> {
        let opts = &self.options;

        // Resolve everything up front.
        if module.function(&opts.func_name).is_some() {
            return Err(Error::StructuralViolation(format!(
                "Function '{}' already exists",
                opts.func_name
            )));
        }
        let feeds = opts
            .feeds
            .iter()
            .map(|f| Self::resolve_value(module, f))
            .collect::<Result<Vec<_>>>()?;
        let fetches = opts
            .fetches
            .iter()
            .map(|f| Self::resolve_value(module, f))
            .collect::<Result<Vec<_>>>()?;
        let control_rets = opts
            .control_rets
            .iter()
            .map(|name| Self::resolve_op(module, name))
            .collect::<Result<Vec<_>>>()?;

        let graph = module.graph();

        // Feeds become arguments.
        let mut replaced: HashMap<ValueId, ValueId> = HashMap::new();
        for &feed in &feeds {
            if replaced.contains_key(&feed) {
                continue;
            }
            let ty = module.value_type(feed)?.clone();
            let arg = module.add_region_arg(graph, ty)?;
            module.replace_all_uses_with(feed, arg)?;
            replaced.insert(feed, arg);
        }
        for &feed in &feeds {
            let Some(op) = module.value(feed)?.defining_op() else {
                continue;
            };
            if !module.contains_op(op) {
                continue;
            }
            let node = module.op(op)?;
            let unused = node
                .results()
                .iter()
                .all(|&r| module.value(r).is_ok_and(|v| !v.has_uses()));
            let detached = node.control_deps().is_empty()
                && module.control_dependents(op).is_empty()
                && !control_rets.contains(&op);
            if unused && detached {
                trace!(op = node.display_name(), "erasing fed op");
                module.erase_op(op)?;
            }
        }

        let results: Vec<ValueId> = fetches
            .iter()
            .map(|v| *replaced.get(v).unwrap_or(v))
            .collect();
        let result_types = results
            .iter()
            .map(|&v| module.value_type(v).cloned())
            .collect::<Result<Vec<_>>>()?;

        let body = module.graph_into_function(opts.func_name.clone(), result_types)?;
        let mut ret = NewOp::new(RETURN_KIND).operands(results);
        for op in control_rets {
            ret = ret.control_dep(op);
        }
        module.append_op(body, ret)?;

        debug!(
            func = %opts.func_name,
            num_args = feeds.len(),
            num_results = opts.fetches.len(),
            "converted graph to function"
        );
        Ok(true)
    }
}

impl Default for GraphToFuncPass {
    fn default() -> Self {
        Self::new(GraphToFuncOptions::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowgraph_core::{DataType, TensorType};

    fn build() -> Module {
        let mut module = Module::new();
        let graph = module.graph();
        let ty = TensorType::fixed(DataType::F32, &[2]);
        let x = module
            .append_op(graph, NewOp::new("Placeholder").name("x").result(ty.clone()))
            .unwrap();
        let x_out = module.result(x, 0).unwrap();
        module
            .append_op(
                graph,
                NewOp::new("Neg").name("neg").operands([x_out]).result(ty),
            )
            .unwrap();
        module
    }

    #[test]
    fn test_parse_ref() {
        assert_eq!(GraphToFuncPass::parse_ref("a").unwrap(), ("a", 0));
        assert_eq!(GraphToFuncPass::parse_ref("a:2").unwrap(), ("a", 2));
        assert!(GraphToFuncPass::parse_ref("a:x").is_err());
    }

    #[test]
    fn test_feed_and_fetch() {
        let mut module = build();
        let pass = GraphToFuncPass::new(GraphToFuncOptions {
            feeds: vec!["x".into()],
            fetches: vec!["neg:0".into()],
            ..Default::default()
        });
        assert!(pass.run(&mut module, &OpRegistry::new()).unwrap());

        let func = module.function("main").unwrap();
        assert_eq!(func.result_types.len(), 1);
        let args = module.function_args("main").unwrap();
        assert_eq!(args.len(), 1);

        let body = module.region(func.body()).unwrap();
        let kinds: Vec<_> = body
            .ops()
            .iter()
            .map(|&op| module.op(op).unwrap().kind.clone())
            .collect();
        assert_eq!(kinds, vec!["Neg", RETURN_KIND]);
        assert!(module.region(module.graph()).unwrap().ops().is_empty());
        assert!(module.verify().is_ok());
    }

    #[test]
    fn test_unknown_fetch_leaves_module_unchanged() {
        let mut module = build();
        let pass = GraphToFuncPass::new(GraphToFuncOptions {
            fetches: vec!["missing".into()],
            ..Default::default()
        });
        let result = pass.run(&mut module, &OpRegistry::new());
        assert!(matches!(result, Err(Error::StructuralViolation(_))));
        assert!(module.functions().is_empty());
        assert_eq!(module.region(module.graph()).unwrap().ops().len(), 2);
    }
}
