//! Sinks pure operations into the conditional branch that uses them.

use flowgraph_core::{Module, OpForm, OpId, OpRegistry, Pass, RegionId, Result};
use tracing::{debug, trace};

/// Pass that moves side-effect-free ops into the single branch using them.
///
/// Only singly-executed regions are sink targets, so work is never moved into
/// a loop. An op is sunk when it is registered stateless, has no nested
/// regions, no control dependencies in either direction, and every use of
/// its results lies inside the same branch of one region-form op of its own
/// region. It lands immediately before the first op of that branch that
/// (transitively) uses it.
pub struct ControlFlowSinkPass;

impl ControlFlowSinkPass {
    /// Create a new sink pass.
    pub fn new() -> Self {
        Self
    }

    fn is_movable(module: &Module, registry: &OpRegistry, op: OpId) -> Result<bool> {
        let node = module.op(op)?;
        Ok(registry.is_stateless(&node.kind)
            && !node.is_terminator()
            && matches!(node.form(), OpForm::Plain)
            && node.control_deps().is_empty()
            && !node.results().is_empty()
            && module.control_dependents(op).is_empty())
    }

    /// Find the insertion point for `op`: the first op of a single branch of
    /// `holder` that uses it. `None` if uses are spread or escape the branch.
    fn sink_target(module: &Module, op: OpId, holder: OpId) -> Result<Option<OpId>> {
        let branches = module.op(holder)?.regions();
        if branches.is_empty()
            || branches
                .iter()
                .any(|&r| module.region(r).map_or(true, |r| !r.is_singly_executed()))
        {
            return Ok(None);
        }

        let mut branch: Option<RegionId> = None;
        let mut users = Vec::new();
        for &result in module.op(op)?.results() {
            users.extend_from_slice(module.value(result)?.users());
        }
        if users.is_empty() {
            return Ok(None);
        }

        for &user in &users {
            let user_region = module.op(user)?.parent();
            let Some(&found) = branches
                .iter()
                .find(|&&b| module.region_is_within(user_region, b))
            else {
                return Ok(None);
            };
            match branch {
                Some(b) if b != found => return Ok(None),
                _ => branch = Some(found),
            }
        }

        let Some(branch) = branch else {
            return Ok(None);
        };
        let first = module
            .region(branch)?
            .ops()
            .iter()
            .copied()
            .find(|&candidate| {
                users
                    .iter()
                    .any(|&u| module.ancestor_in(branch, u) == Some(candidate))
            });
        Ok(first)
    }

    fn sink_region(module: &mut Module, registry: &OpRegistry, region: RegionId) -> Result<bool> {
        let mut changed = false;
        let ops = module.region(region)?.ops().to_vec();
        let holders: Vec<OpId> = ops
            .iter()
            .copied()
            .filter(|&op| module.op(op).is_ok_and(|n| !n.regions().is_empty()))
            .collect();
        if holders.is_empty() {
            return Ok(false);
        }

        // Consumers are visited before their producers so whole chains move.
        for &op in ops.iter().rev() {
            if !module.contains_op(op) || !Self::is_movable(module, registry, op)? {
                continue;
            }
            let Some(user) = module
                .op(op)?
                .results()
                .first()
                .and_then(|&r| module.value(r).ok())
                .and_then(|v| v.users().first().copied())
            else {
                continue;
            };
            let Some(holder) = module.ancestor_in(region, user) else {
                continue;
            };
            if !holders.contains(&holder) {
                continue;
            }
            if let Some(anchor) = Self::sink_target(module, op, holder)? {
                trace!(
                    op = module.op(op)?.display_name(),
                    into = module.op(holder)?.display_name(),
                    "sinking op"
                );
                module.move_op_before(op, anchor)?;
                changed = true;
            }
        }
        Ok(changed)
    }
}

impl Pass for ControlFlowSinkPass {
    fn name(&self) -> &str {
        "control-flow-sink"
    }

    fn run(&self, module: &mut Module, registry: &OpRegistry) -> Result<bool> {
        let mut changed = false;
        loop {
            let mut round = false;
            for region in module.regions() {
                round |= Self::sink_region(module, registry, region)?;
            }
            if !round {
                break;
            }
            changed = true;
        }

        debug!(changed, "control flow sink complete");
        Ok(changed)
    }
}

impl Default for ControlFlowSinkPass {
    fn default() -> Self {
        Self::new()
    }
}
