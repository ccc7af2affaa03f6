//! Shape inference pass.
//!
//! Worklist-driven propagation of result types. Every op starts on the
//! worklist; an op is re-queued whenever one of its operand types is refined,
//! and is evaluated at most `max_iterations` times. Types only ever move down
//! the lattice (meet), so propagation terminates.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::options::PassOptions;
use flowgraph_core::{
    Module, OpId, OpRegistry, Pass, RegionId, Result, ShapeCtx, TensorType, ValueId,
};
use tracing::{debug, trace};

/// Options for [`ShapeInferencePass`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapeInferenceOptions {
    /// Producer version of the graph, 0 if unknown.
    pub graph_version: u32,
    /// Maximum number of evaluations per op.
    pub max_iterations: usize,
}

impl Default for ShapeInferenceOptions {
    fn default() -> Self {
        Self {
            graph_version: 0,
            max_iterations: 32,
        }
    }
}

impl ShapeInferenceOptions {
    /// Parse from a by-name option map.
    pub fn from_options(opts: &PassOptions) -> Result<Self> {
        opts.expect_only("shape-inference", &["graph-version", "max-iterations"])?;
        let defaults = Self::default();
        Ok(Self {
            graph_version: opts
                .get_u32("graph-version")?
                .unwrap_or(defaults.graph_version),
            max_iterations: opts
                .get_usize("max-iterations")?
                .unwrap_or(defaults.max_iterations),
        })
    }
}

/// Pass that refines result types using registered shape functions.
///
/// Region-form control flow is handled here rather than in the registry:
/// `IfRegion`/`CaseRegion` results are the join of what each branch yields,
/// `WhileRegion` results (and its region arguments) the join of the loop
/// inits and what the body yields. Call ops take the result types of the
/// function they reference.
pub struct ShapeInferencePass {
    options: ShapeInferenceOptions,
}

#[derive(Default)]
struct Worklist {
    queue: VecDeque<OpId>,
    queued: HashSet<OpId>,
}

impl Worklist {
    fn push(&mut self, op: OpId) {
        if self.queued.insert(op) {
            self.queue.push_back(op);
        }
    }

    fn pop(&mut self) -> Option<OpId> {
        let op = self.queue.pop_front()?;
        self.queued.remove(&op);
        Some(op)
    }
}

impl ShapeInferencePass {
    /// Create a new shape inference pass with default options.
    pub fn new() -> Self {
        Self::with_options(ShapeInferenceOptions::default())
    }

    pub fn with_options(options: ShapeInferenceOptions) -> Self {
        Self { options }
    }

    /// Compute result types for `op`, `None` if nothing can be said.
    fn infer_op(
        &self,
        module: &Module,
        registry: &OpRegistry,
        op: OpId,
    ) -> Result<Option<Vec<TensorType>>> {
        let node = module.op(op)?;
        let num_results = node.results().len();
        if num_results == 0 {
            return Ok(None);
        }

        let inferred = match node.kind.as_str() {
            "IfRegion" | "CaseRegion" => {
                let mut joined: Option<Vec<TensorType>> = None;
                for &region in node.regions() {
                    let Some(types) = yielded_types(module, region, num_results)? else {
                        return Ok(None);
                    };
                    joined = Some(match joined {
                        None => types,
                        Some(acc) => acc.iter().zip(&types).map(|(a, b)| a.join(b)).collect(),
                    });
                }
                joined
            }
            "WhileRegion" => self.loop_types(module, op)?,
            _ if !node.func_refs().is_empty() || module.function(&node.kind).is_some() => {
                call_types(module, op)?
            }
            kind => {
                let Some(shape_fn) = registry.shape_fn(kind) else {
                    return Ok(None);
                };
                let ctx = ShapeCtx::new(node, module, self.options.graph_version);
                match shape_fn(&ctx) {
                    Ok(types) => Some(types),
                    Err(e) => {
                        trace!(op = node.display_name(), error = %e, "shape function failed");
                        None
                    }
                }
            }
        };

        Ok(inferred.filter(|types| {
            let ok = types.len() == num_results;
            if !ok {
                trace!(
                    op = node.display_name(),
                    inferred = types.len(),
                    results = num_results,
                    "inferred type count mismatch"
                );
            }
            ok
        }))
    }

    /// Join of the loop inits and the body yields, per slot.
    fn loop_types(&self, module: &Module, op: OpId) -> Result<Option<Vec<TensorType>>> {
        let node = module.op(op)?;
        let [_, body] = node.regions() else {
            return Ok(None);
        };
        let slots = node.operands().len();
        let Some(yielded) = yielded_types(module, *body, slots)? else {
            return Ok(None);
        };
        let mut types = Vec::with_capacity(slots);
        for (&init, carried) in node.operands().iter().zip(&yielded) {
            types.push(module.value_type(init)?.join(carried));
        }
        Ok(Some(types))
    }

    /// Refine the region arguments of a `WhileRegion`. Returns the arguments
    /// whose type changed.
    fn refine_loop_args(&self, module: &mut Module, op: OpId) -> Result<Vec<ValueId>> {
        let Some(types) = self.loop_types(module, op)? else {
            return Ok(Vec::new());
        };
        let mut changed = Vec::new();
        for region in module.op(op)?.regions().to_vec() {
            let args = module.region(region)?.args().to_vec();
            if args.len() != types.len() {
                continue;
            }
            for (arg, ty) in args.into_iter().zip(&types) {
                if refine(module, arg, ty)? {
                    changed.push(arg);
                }
            }
        }
        Ok(changed)
    }

    /// Queue everything that reads `value`. Terminators stand in for the op
    /// owning their region.
    fn enqueue_users(module: &Module, value: ValueId, worklist: &mut Worklist) -> Result<()> {
        for &user in module.value(value)?.users() {
            let node = module.op(user)?;
            if !node.is_terminator() {
                worklist.push(user);
            } else if let Some(owner) = module.parent_op(node.parent()) {
                worklist.push(owner);
            }
        }
        Ok(())
    }
}

/// Types yielded by the terminator of `region`, if it yields `expected` values.
fn yielded_types(
    module: &Module,
    region: RegionId,
    expected: usize,
) -> Result<Option<Vec<TensorType>>> {
    let Some(term) = module.terminator(region) else {
        return Ok(None);
    };
    let operands = module.op(term)?.operands();
    if operands.len() != expected {
        return Ok(None);
    }
    operands
        .iter()
        .map(|&v| module.value_type(v).cloned())
        .collect::<Result<Vec<_>>>()
        .map(Some)
}

/// Result types of the function a call op references.
fn call_types(module: &Module, op: OpId) -> Result<Option<Vec<TensorType>>> {
    let node = module.op(op)?;
    let name = match node.func_refs() {
        [] => node.kind.as_str(),
        [single] => single.func.as_str(),
        _ => return Ok(None),
    };
    Ok(module.function(name).map(|f| f.result_types.clone()))
}

/// Meet the type of `value` with `inferred`. Returns whether it changed.
fn refine(module: &mut Module, value: ValueId, inferred: &TensorType) -> Result<bool> {
    let current = module.value_type(value)?;
    match current.meet(inferred) {
        Some(refined) if &refined != current => {
            trace!(value = value.index(), from = %current, to = %refined, "refined");
            module.set_value_type(value, refined)?;
            Ok(true)
        }
        Some(_) => Ok(false),
        None => {
            trace!(
                value = value.index(),
                current = %current,
                inferred = %inferred,
                "incompatible inferred type ignored"
            );
            Ok(false)
        }
    }
}

impl Pass for ShapeInferencePass {
    fn name(&self) -> &str {
        "shape-inference"
    }

    fn run(&self, module: &mut Module, registry: &OpRegistry) -> Result<bool> {
        let mut worklist = Worklist::default();
        for op in module.all_ops() {
            worklist.push(op);
        }

        let mut visits: HashMap<OpId, usize> = HashMap::new();
        let mut refined = 0usize;
        let mut exhausted = 0usize;

        while let Some(op) = worklist.pop() {
            if !module.contains_op(op) {
                continue;
            }
            let count = visits.entry(op).or_default();
            *count += 1;
            if *count > self.options.max_iterations {
                exhausted += 1;
                continue;
            }

            if module.op(op)?.kind == "WhileRegion" {
                for arg in self.refine_loop_args(module, op)? {
                    refined += 1;
                    Self::enqueue_users(module, arg, &mut worklist)?;
                }
            }

            let Some(types) = self.infer_op(module, registry, op)? else {
                continue;
            };
            let results = module.op(op)?.results().to_vec();
            for (value, ty) in results.into_iter().zip(&types) {
                if refine(module, value, ty)? {
                    refined += 1;
                    Self::enqueue_users(module, value, &mut worklist)?;
                }
            }
        }

        if exhausted > 0 {
            debug!(exhausted, "iteration limit reached for some ops");
        }
        debug!(refined, "shape inference complete");
        Ok(refined > 0)
    }
}

impl Default for ShapeInferencePass {
    fn default() -> Self {
        Self::new()
    }
}
