//! Topological sort pass.
//!
//! Reorders the operations of every region so producers precede consumers.
//! Control edges may form cycles (e.g. through loop back-edges); these are
//! collapsed into strongly connected components that are placed as units.

use flowgraph_core::{Error, Module, OpId, OpRegistry, Pass, RegionId, Result};
use petgraph::algo::{is_cyclic_directed, tarjan_scc};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dep {
    Data,
    Control,
}

/// Pass that topologically sorts every region.
///
/// Uses nested inside an operation's regions count as uses by that
/// operation. Terminators stay last. Among ready operations the one that came
/// first in the original order is emitted first, so an already sorted region
/// is left untouched.
pub struct TopoSortPass;

impl TopoSortPass {
    /// Create a new topological sort pass.
    pub fn new() -> Self {
        Self
    }

    /// Compute the sorted order of a region, or `None` if it is already sorted.
    fn sorted_order(module: &Module, region: RegionId) -> Result<Option<Vec<OpId>>> {
        let ops = module.region(region)?.ops();
        let terminator = module.terminator(region);
        let body: Vec<OpId> = ops
            .iter()
            .copied()
            .filter(|&op| Some(op) != terminator)
            .collect();
        if body.len() < 2 {
            return Ok(None);
        }

        let index: HashMap<OpId, usize> = body.iter().enumerate().map(|(i, &op)| (op, i)).collect();

        let mut deps = DiGraph::<usize, Dep>::with_capacity(body.len(), 0);
        let mut data = DiGraph::<usize, ()>::with_capacity(body.len(), 0);
        for i in 0..body.len() {
            deps.add_node(i);
            data.add_node(i);
        }

        for (consumer, &op) in body.iter().enumerate() {
            let mut users = vec![op];
            for &nested in module.op(op)?.regions() {
                users.extend(module.walk_ops(nested));
            }

            for user in users {
                let node = module.op(user)?;
                for &operand in node.operands() {
                    let Some(def) = module.value(operand)?.defining_op() else {
                        continue;
                    };
                    let producer = module.ancestor_in(region, def).and_then(|p| index.get(&p));
                    let Some(&producer) = producer else {
                        continue;
                    };
                    if producer == consumer && user != op {
                        // Defined and used inside the same op's regions.
                        continue;
                    }
                    let (a, b) = (NodeIndex::new(producer), NodeIndex::new(consumer));
                    deps.update_edge(a, b, Dep::Data);
                    data.update_edge(a, b, ());
                }
                for &dep in node.control_deps() {
                    let Some(&source) = module.ancestor_in(region, dep).and_then(|p| index.get(&p))
                    else {
                        continue;
                    };
                    if source == consumer {
                        continue;
                    }
                    let (a, b) = (NodeIndex::new(source), NodeIndex::new(consumer));
                    if deps.find_edge(a, b).is_none() {
                        deps.add_edge(a, b, Dep::Control);
                    }
                }
            }
        }

        let self_loop = data.edge_references().any(|e| e.source() == e.target());
        if self_loop || is_cyclic_directed(&data) {
            return Err(Error::StructuralViolation(format!(
                "Region {:?} contains a cycle made only of data edges",
                region
            )));
        }

        // Components of the full graph, placed with a min-original-index priority.
        let components = tarjan_scc(&deps);
        let mut component_of = vec![0usize; body.len()];
        for (k, members) in components.iter().enumerate() {
            for member in members {
                component_of[member.index()] = k;
            }
        }
        let mut successors = vec![Vec::new(); components.len()];
        let mut indegree = vec![0usize; components.len()];
        for edge in deps.edge_references() {
            let (a, b) = (
                component_of[edge.source().index()],
                component_of[edge.target().index()],
            );
            if a != b {
                successors[a].push(b);
                indegree[b] += 1;
            }
        }
        let first_index: Vec<usize> = components
            .iter()
            .map(|members| members.iter().map(|m| m.index()).min().unwrap_or(0))
            .collect();

        let mut ready: BinaryHeap<Reverse<(usize, usize)>> = (0..components.len())
            .filter(|&k| indegree[k] == 0)
            .map(|k| Reverse((first_index[k], k)))
            .collect();

        let mut order = Vec::with_capacity(ops.len());
        while let Some(Reverse((_, k))) = ready.pop() {
            for i in Self::order_component(&data, &components[k]) {
                order.push(body[i]);
            }
            for &next in &successors[k] {
                indegree[next] -= 1;
                if indegree[next] == 0 {
                    ready.push(Reverse((first_index[next], next)));
                }
            }
        }
        order.extend(terminator);

        if order.as_slice() == ops {
            Ok(None)
        } else {
            Ok(Some(order))
        }
    }

    /// Order the members of one component by data edges only.
    fn order_component(data: &DiGraph<usize, ()>, members: &[NodeIndex]) -> Vec<usize> {
        if let [single] = members {
            return vec![single.index()];
        }

        let member_set: HashSet<NodeIndex> = members.iter().copied().collect();
        let mut indegree: HashMap<NodeIndex, usize> = members.iter().map(|&m| (m, 0)).collect();
        for &m in members {
            for next in data.neighbors(m) {
                if member_set.contains(&next)
                    && let Some(d) = indegree.get_mut(&next)
                {
                    *d += 1;
                }
            }
        }

        let mut ready: BinaryHeap<Reverse<usize>> = members
            .iter()
            .filter(|m| indegree[m] == 0)
            .map(|m| Reverse(m.index()))
            .collect();
        let mut out = Vec::with_capacity(members.len());
        while let Some(Reverse(i)) = ready.pop() {
            out.push(i);
            for next in data.neighbors(NodeIndex::new(i)) {
                if let Some(d) = indegree.get_mut(&next) {
                    *d -= 1;
                    if *d == 0 {
                        ready.push(Reverse(next.index()));
                    }
                }
            }
        }
        out
    }
}

impl Pass for TopoSortPass {
    fn name(&self) -> &str {
        "topo-sort"
    }

    fn run(&self, module: &mut Module, _registry: &OpRegistry) -> Result<bool> {
        // Compute every region's order first so a failure leaves the module untouched.
        let mut plans = Vec::new();
        for region in module.regions() {
            if let Some(order) = Self::sorted_order(module, region)? {
                plans.push((region, order));
            }
        }

        let changed = !plans.is_empty();
        for (region, order) in plans {
            trace!(?region, num_ops = order.len(), "reordering region");
            module.reorder_region(region, order)?;
        }

        debug!(changed, "topological sort complete");
        Ok(changed)
    }
}

impl Default for TopoSortPass {
    fn default() -> Self {
        Self::new()
    }
}
