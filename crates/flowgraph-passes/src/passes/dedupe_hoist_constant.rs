//! Constant deduplication and hoisting pass.
//!
//! Merges structurally identical small constants within a region and moves the
//! survivors to the top of the region.

use crate::options::PassOptions;
use flowgraph_core::{Module, OpForm, OpId, OpRegistry, Pass, RegionId, Result};
use std::collections::HashSet;
use tracing::{debug, trace};

/// Options for [`DedupeAndHoistConstantPass`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DedupeOptions {
    /// Constants with more elements than this are left alone.
    pub max_size: usize,

    /// Treat every call as strict (only runs once all operands are available).
    pub assume_strict_calls: bool,
}

impl Default for DedupeOptions {
    fn default() -> Self {
        Self {
            max_size: 10,
            assume_strict_calls: false,
        }
    }
}

impl DedupeOptions {
    /// Read options from a by-name map.
    pub fn from_options(opts: &PassOptions) -> Result<Self> {
        opts.expect_only(
            "dedupe-and-hoist-constant",
            &["max-size", "assume-strict-calls"],
        )?;
        let defaults = Self::default();
        Ok(Self {
            max_size: opts.get_usize("max-size")?.unwrap_or(defaults.max_size),
            assume_strict_calls: opts
                .get_bool("assume-strict-calls")?
                .unwrap_or(defaults.assume_strict_calls),
        })
    }
}

/// Pass that deduplicates and hoists constants.
///
/// A constant is a `Const` op with no operands, no control dependencies and a
/// `value` of at most `max_size` elements. Two constants are identical when
/// kind, result types and all attributes except the instance name match.
///
/// With non-strict calls, a merged constant could change when a callee
/// observes it. Unless `assume_strict_calls` is set, constants that
/// (transitively) feed a call are skipped, and so are all regions of every
/// function some call refers to.
///
/// Merging is per region: identical constants in a nested region and in its
/// enclosing region are kept apart.
pub struct DedupeAndHoistConstantPass {
    options: DedupeOptions,
}

impl DedupeAndHoistConstantPass {
    /// Create a pass with default options.
    pub fn new() -> Self {
        Self::with_options(DedupeOptions::default())
    }

    /// Create a pass with the given options.
    pub fn with_options(options: DedupeOptions) -> Self {
        Self { options }
    }

    fn is_candidate(&self, module: &Module, op: OpId) -> bool {
        let Ok(node) = module.op(op) else {
            return false;
        };
        node.kind == "Const"
            && node.operands().is_empty()
            && node.control_deps().is_empty()
            && node.results().len() == 1
            && matches!(node.form(), OpForm::Plain)
            && node
                .attrs
                .get_tensor("value")
                .is_ok_and(|v| v.num_elements() <= self.options.max_size)
    }

    /// Ops that invoke other computation.
    fn is_call(module: &Module, registry: &OpRegistry, op: OpId) -> bool {
        module.op(op).is_ok_and(|node| {
            registry.is_call(&node.kind)
                || module.function(&node.kind).is_some()
                || !node.func_refs().is_empty()
        })
    }

    /// Bodies of every function named by a call, by `FuncRef` or by kind.
    fn callee_bodies(module: &Module, registry: &OpRegistry) -> Result<Vec<RegionId>> {
        let mut names = HashSet::new();
        for op in module.all_ops() {
            if !Self::is_call(module, registry, op) {
                continue;
            }
            let node = module.op(op)?;
            names.extend(node.func_refs().iter().map(|r| r.func.clone()));
            if module.function(&node.kind).is_some() {
                names.insert(node.kind.clone());
            }
        }
        Ok(module
            .functions()
            .iter()
            .filter(|f| names.contains(f.name()))
            .map(|f| f.body())
            .collect())
    }

    /// Check whether any call is reachable from `op` along data uses.
    ///
    /// Values yielded out of a region continue through the owning op's results.
    fn feeds_call(module: &Module, registry: &OpRegistry, op: OpId) -> Result<bool> {
        let mut visited = HashSet::new();
        let mut stack = vec![op];
        while let Some(current) = stack.pop() {
            if !visited.insert(current) {
                continue;
            }
            if current != op && Self::is_call(module, registry, current) {
                return Ok(true);
            }
            let node = module.op(current)?;
            let mut results = node.results().to_vec();
            if node.is_terminator()
                && let Some(parent) = module.parent_op(node.parent())
            {
                results.extend_from_slice(module.op(parent)?.results());
            }
            for value in results {
                stack.extend(module.value(value)?.users().iter().copied());
            }
        }
        Ok(false)
    }

    fn dedupe_region(
        &self,
        module: &mut Module,
        registry: &OpRegistry,
        region: RegionId,
        gate_calls: bool,
    ) -> Result<bool> {
        let mut candidates = Vec::new();
        for &op in module.region(region)?.ops() {
            if !self.is_candidate(module, op) {
                continue;
            }
            if gate_calls && Self::feeds_call(module, registry, op)? {
                trace!(op = module.op(op)?.display_name(), "constant feeds a call; skipped");
                continue;
            }
            candidates.push(op);
        }
        if candidates.is_empty() {
            return Ok(false);
        }

        let mut representatives: Vec<OpId> = Vec::new();
        let mut duplicates: Vec<(OpId, OpId)> = Vec::new();
        for &op in &candidates {
            let found = representatives
                .iter()
                .copied()
                .find(|&rep| Self::identical(module, rep, op));
            match found {
                Some(rep) => duplicates.push((op, rep)),
                None => representatives.push(op),
            }
        }

        let mut changed = false;
        for (dup, rep) in duplicates {
            trace!(
                duplicate = module.op(dup)?.display_name(),
                representative = module.op(rep)?.display_name(),
                "merging constant"
            );
            let (old, new) = (module.result(dup, 0)?, module.result(rep, 0)?);
            module.replace_all_uses_with(old, new)?;
            module.replace_control_dependent_edges(dup, rep)?;
            module.erase_op(dup)?;
            changed = true;
        }

        for (index, &rep) in representatives.iter().enumerate() {
            if module.position(rep)? != index {
                module.move_op(rep, region, index)?;
                changed = true;
            }
        }

        Ok(changed)
    }

    fn identical(module: &Module, a: OpId, b: OpId) -> bool {
        let (Ok(x), Ok(y)) = (module.op(a), module.op(b)) else {
            return false;
        };
        let types_match = x
            .results()
            .iter()
            .zip(y.results())
            .all(|(&u, &v)| module.value_type(u).ok() == module.value_type(v).ok());
        x.kind == y.kind && x.attrs == y.attrs && types_match
    }
}

impl Pass for DedupeAndHoistConstantPass {
    fn name(&self) -> &str {
        "dedupe-and-hoist-constant"
    }

    fn run(&self, module: &mut Module, registry: &OpRegistry) -> Result<bool> {
        let has_calls = module
            .all_ops()
            .into_iter()
            .any(|op| Self::is_call(module, registry, op));
        let gate_calls = has_calls && !self.options.assume_strict_calls;

        let callee_bodies = if gate_calls {
            Self::callee_bodies(module, registry)?
        } else {
            Vec::new()
        };

        let mut changed = false;
        for region in module.regions() {
            if callee_bodies
                .iter()
                .any(|&body| module.region_is_within(region, body))
            {
                trace!(?region, "region belongs to a called function; skipped");
                continue;
            }
            changed |= self.dedupe_region(module, registry, region, gate_calls)?;
        }

        debug!(changed, gate_calls, "constant dedupe complete");
        Ok(changed)
    }
}

impl Default for DedupeAndHoistConstantPass {
    fn default() -> Self {
        Self::new()
    }
}
