//! Intermediate representation for dataflow graphs.
//!
//! A [`Module`] is the arena that owns every entity:
//! - **Operations** live in a `petgraph::StableGraph` so their ids stay valid
//!   while other operations are erased. The petgraph edge set is unused; data
//!   and control dependencies are stored on the operations themselves.
//! - **Values** live in a side-table indexed by [`ValueId`]. Each value is the
//!   result of one operation or an argument of one region, and records the
//!   operations consuming it.
//! - **Regions** live in a side-table indexed by [`RegionId`]. A region is an
//!   ordered list of operations plus its arguments.
//!
//! Regions may reference values defined in enclosing regions. Loop-carried
//! values flow through region arguments instead of cyclic data edges.

use crate::attr::Attributes;
use crate::types::TensorType;
use crate::{Error, Result};
use petgraph::graph::NodeIndex;
use petgraph::stable_graph::StableGraph;
use std::collections::{HashMap, HashSet};

/// Kind tag of the terminator ending a function body.
pub const RETURN_KIND: &str = "return";

/// Kind tag of the terminator ending a control-flow region.
pub const YIELD_KIND: &str = "yield";

/// Identifier of an operation (backed by petgraph's stable node index).
pub type OpId = NodeIndex;

/// Identifier of a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(pub usize);

impl ValueId {
    /// Get the underlying index.
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Identifier of a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegionId(pub usize);

impl RegionId {
    /// Get the underlying index.
    pub fn index(&self) -> usize {
        self.0
    }
}

// ──────────────────────────────── Value ──────────────────────────────────

/// Where a value comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueDef {
    /// The `index`-th result of an operation.
    Result { op: OpId, index: usize },

    /// The `index`-th argument of a region.
    Argument { region: RegionId, index: usize },
}

/// A typed value shared by all of its consumers.
#[derive(Debug, Clone)]
pub struct Value {
    ty: TensorType,
    def: ValueDef,
    /// One entry per operand slot referencing this value.
    users: Vec<OpId>,
}

impl Value {
    /// The value's type.
    pub fn ty(&self) -> &TensorType {
        &self.ty
    }

    /// The value's definition point.
    pub fn def(&self) -> ValueDef {
        self.def
    }

    /// Operations consuming the value (one entry per operand slot).
    pub fn users(&self) -> &[OpId] {
        &self.users
    }

    /// Check whether anything consumes the value.
    pub fn has_uses(&self) -> bool {
        !self.users.is_empty()
    }

    /// The defining operation, if this is an operation result.
    pub fn defining_op(&self) -> Option<OpId> {
        match self.def {
            ValueDef::Result { op, .. } => Some(op),
            ValueDef::Argument { .. } => None,
        }
    }
}

// ──────────────────────────────── Region ─────────────────────────────────

/// How often a region runs per invocation of its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Execution {
    /// At most once (graphs, function bodies, conditional branches).
    Once,
    /// Zero, one or many times (loop condition and body).
    Repeated,
}

/// What owns a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionOwner {
    /// The module's top-level graph.
    Graph,
    /// A function body.
    Function,
    /// A region-form operation.
    Op(OpId),
    /// No longer attached to anything.
    Detached,
}

/// An ordered list of operations plus block arguments.
#[derive(Debug, Clone)]
pub struct Region {
    ops: Vec<OpId>,
    args: Vec<ValueId>,
    owner: RegionOwner,
    execution: Execution,
}

impl Region {
    /// Operations in order.
    pub fn ops(&self) -> &[OpId] {
        &self.ops
    }

    /// Block arguments.
    pub fn args(&self) -> &[ValueId] {
        &self.args
    }

    /// Region owner.
    pub fn owner(&self) -> RegionOwner {
        self.owner
    }

    /// Execution classification.
    pub fn execution(&self) -> Execution {
        self.execution
    }

    /// Check whether the region runs at most once per owner invocation.
    pub fn is_singly_executed(&self) -> bool {
        self.execution == Execution::Once
    }
}

// ─────────────────────────────── Operation ───────────────────────────────

/// A reference from a functional control-flow op to a callee function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FuncRef {
    /// Role of the callee (`then_branch`, `body`, `branches`, ...).
    pub role: String,

    /// Callee function name.
    pub func: String,
}

impl FuncRef {
    pub fn new(role: impl Into<String>, func: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            func: func.into(),
        }
    }
}

/// Structural form of an operation.
///
/// Functional and region forms are mutually exclusive by construction.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum OpForm {
    /// No nested computation.
    #[default]
    Plain,

    /// Nested computation referenced by function name.
    Functional(Vec<FuncRef>),

    /// Nested computation inlined as owned regions.
    Regions(Vec<RegionId>),
}

/// A single operation instance.
#[derive(Debug, Clone)]
pub struct Operation {
    /// Instance name (may be empty).
    pub name: String,

    /// Operation kind (e.g., "Add", "Const", "IfRegion").
    pub kind: String,

    /// Attributes.
    pub attrs: Attributes,

    operands: Vec<ValueId>,
    results: Vec<ValueId>,
    control_deps: Vec<OpId>,
    form: OpForm,
    parent: RegionId,
}

impl Operation {
    /// Data operands.
    pub fn operands(&self) -> &[ValueId] {
        &self.operands
    }

    /// Results.
    pub fn results(&self) -> &[ValueId] {
        &self.results
    }

    /// Control dependencies (sources that must run first).
    pub fn control_deps(&self) -> &[OpId] {
        &self.control_deps
    }

    /// Structural form.
    pub fn form(&self) -> &OpForm {
        &self.form
    }

    /// Owned regions (empty unless in region form).
    pub fn regions(&self) -> &[RegionId] {
        match &self.form {
            OpForm::Regions(regions) => regions,
            _ => &[],
        }
    }

    /// Referenced callees (empty unless in functional form).
    pub fn func_refs(&self) -> &[FuncRef] {
        match &self.form {
            OpForm::Functional(refs) => refs,
            _ => &[],
        }
    }

    /// Region containing this operation.
    pub fn parent(&self) -> RegionId {
        self.parent
    }

    /// Check whether this op ends a region.
    pub fn is_terminator(&self) -> bool {
        self.kind == RETURN_KIND || self.kind == YIELD_KIND
    }

    /// Name for diagnostics.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            "<unnamed>"
        } else {
            &self.name
        }
    }
}

// ─────────────────────────────── Function ────────────────────────────────

/// A named function with a single body region.
#[derive(Debug, Clone)]
pub struct Function {
    name: String,
    body: RegionId,

    /// Declared result types.
    pub result_types: Vec<TensorType>,

    /// Per-argument attributes (parallel to the body's arguments).
    pub arg_attrs: Vec<Attributes>,

    /// Per-result attributes (parallel to `result_types`).
    pub result_attrs: Vec<Attributes>,

    /// Function attributes.
    pub attrs: Attributes,
}

impl Function {
    /// Function name (unique within its module).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Body region.
    pub fn body(&self) -> RegionId {
        self.body
    }
}

// ──────────────────────────────── NewOp ──────────────────────────────────

/// Description of an operation to create.
#[derive(Debug, Clone, Default)]
pub struct NewOp {
    pub name: String,
    pub kind: String,
    pub operands: Vec<ValueId>,
    pub result_types: Vec<TensorType>,
    pub control_deps: Vec<OpId>,
    pub attrs: Attributes,
    pub func_refs: Vec<FuncRef>,
}

impl NewOp {
    /// Start describing an op of the given kind.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            ..Default::default()
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn operands(mut self, operands: impl IntoIterator<Item = ValueId>) -> Self {
        self.operands.extend(operands);
        self
    }

    pub fn result(mut self, ty: TensorType) -> Self {
        self.result_types.push(ty);
        self
    }

    pub fn results(mut self, types: impl IntoIterator<Item = TensorType>) -> Self {
        self.result_types.extend(types);
        self
    }

    pub fn control_dep(mut self, dep: OpId) -> Self {
        self.control_deps.push(dep);
        self
    }

    pub fn attr(
        mut self,
        name: impl Into<String>,
        value: impl Into<crate::attr::Attribute>,
    ) -> Self {
        self.attrs.set(name, value);
        self
    }

    pub fn attrs(mut self, attrs: Attributes) -> Self {
        self.attrs = attrs;
        self
    }

    /// Reference a callee function (makes the op functional-form).
    pub fn func(mut self, role: impl Into<String>, func: impl Into<String>) -> Self {
        self.func_refs.push(FuncRef::new(role, func));
        self
    }
}

// ──────────────────────────────── Module ─────────────────────────────────

/// Top-level container: functions plus one top-level graph region.
pub struct Module {
    ops: StableGraph<Operation, ()>,
    values: Vec<Value>,
    regions: Vec<Region>,
    functions: Vec<Function>,
    graph: RegionId,
}

impl Module {
    /// Create an empty module with an empty top-level graph.
    pub fn new() -> Self {
        let mut module = Self {
            ops: StableGraph::new(),
            values: Vec::new(),
            regions: Vec::new(),
            functions: Vec::new(),
            graph: RegionId(0),
        };
        module.graph = module.new_region(RegionOwner::Graph, Execution::Once);
        module
    }

    // ── Regions ──

    fn new_region(&mut self, owner: RegionOwner, execution: Execution) -> RegionId {
        let id = RegionId(self.regions.len());
        self.regions.push(Region {
            ops: Vec::new(),
            args: Vec::new(),
            owner,
            execution,
        });
        id
    }

    /// The top-level graph region.
    pub fn graph(&self) -> RegionId {
        self.graph
    }

    /// Get a region.
    pub fn region(&self, id: RegionId) -> Result<&Region> {
        self.regions
            .get(id.index())
            .ok_or_else(|| Error::InvalidGraph(format!("Region {:?} not found", id)))
    }

    fn region_mut(&mut self, id: RegionId) -> Result<&mut Region> {
        self.regions
            .get_mut(id.index())
            .ok_or_else(|| Error::InvalidGraph(format!("Region {:?} not found", id)))
    }

    /// Append a block argument to a region.
    pub fn add_region_arg(&mut self, region: RegionId, ty: TensorType) -> Result<ValueId> {
        let index = self.region(region)?.args.len();
        let value = self.new_value(ty, ValueDef::Argument { region, index });
        self.region_mut(region)?.args.push(value);
        Ok(value)
    }

    /// Remove an unused block argument, shifting the following ones down.
    pub fn remove_region_arg(&mut self, region: RegionId, index: usize) -> Result<()> {
        let arg = *self.region(region)?.args.get(index).ok_or_else(|| {
            Error::InvalidGraph(format!("Region {:?} has no argument {}", region, index))
        })?;
        if self.value(arg)?.has_uses() {
            return Err(Error::StructuralViolation(format!(
                "Cannot remove argument {} of region {:?}: it still has uses",
                index, region
            )));
        }
        let args = {
            let r = self.region_mut(region)?;
            r.args.remove(index);
            r.args.clone()
        };
        for (i, value) in args.into_iter().enumerate().skip(index) {
            self.values[value.index()].def = ValueDef::Argument { region, index: i };
        }
        Ok(())
    }

    /// Create a new region owned by `op`, switching the op to region form.
    ///
    /// Fails if the op is in functional form.
    pub fn add_op_region(&mut self, op: OpId, execution: Execution) -> Result<RegionId> {
        if matches!(self.op(op)?.form, OpForm::Functional(_)) {
            return Err(Error::UnsupportedForm(format!(
                "Operation '{}' is in functional form; cannot attach a region",
                self.op(op)?.display_name()
            )));
        }
        let region = self.new_region(RegionOwner::Op(op), execution);
        let node = self.op_mut(op)?;
        match &mut node.form {
            OpForm::Regions(regions) => regions.push(region),
            form => *form = OpForm::Regions(vec![region]),
        }
        Ok(region)
    }

    /// The operation owning a region, if any.
    pub fn parent_op(&self, region: RegionId) -> Option<OpId> {
        match self.regions.get(region.index())?.owner {
            RegionOwner::Op(op) => Some(op),
            _ => None,
        }
    }

    /// Last op of a region if it is a terminator.
    pub fn terminator(&self, region: RegionId) -> Option<OpId> {
        let last = *self.regions.get(region.index())?.ops.last()?;
        self.ops
            .node_weight(last)
            .filter(|op| op.is_terminator())
            .map(|_| last)
    }

    /// All attached regions in pre-order: the graph, then every function body,
    /// each followed by its nested regions.
    pub fn regions(&self) -> Vec<RegionId> {
        let mut out = Vec::new();
        let mut roots = vec![self.graph];
        roots.extend(self.functions.iter().map(|f| f.body));
        for root in roots {
            self.collect_regions(root, &mut out);
        }
        out
    }

    fn collect_regions(&self, region: RegionId, out: &mut Vec<RegionId>) {
        out.push(region);
        for &op in &self.regions[region.index()].ops {
            if let Some(node) = self.ops.node_weight(op) {
                for &nested in node.regions() {
                    self.collect_regions(nested, out);
                }
            }
        }
    }

    /// All operations in a region and its nested regions, in pre-order.
    pub fn walk_ops(&self, region: RegionId) -> Vec<OpId> {
        let mut out = Vec::new();
        self.collect_ops(region, &mut out);
        out
    }

    fn collect_ops(&self, region: RegionId, out: &mut Vec<OpId>) {
        let Some(r) = self.regions.get(region.index()) else {
            return;
        };
        for &op in &r.ops {
            out.push(op);
            if let Some(node) = self.ops.node_weight(op) {
                for &nested in node.regions() {
                    self.collect_ops(nested, out);
                }
            }
        }
    }

    /// All operations attached to the module (graph and function bodies).
    pub fn all_ops(&self) -> Vec<OpId> {
        let mut out = self.walk_ops(self.graph);
        for func in &self.functions {
            self.collect_ops(func.body, &mut out);
        }
        out
    }

    /// Find the ancestor of `op` (or `op` itself) that lives directly in `region`.
    pub fn ancestor_in(&self, region: RegionId, op: OpId) -> Option<OpId> {
        let mut current = op;
        loop {
            let parent = self.ops.node_weight(current)?.parent;
            if parent == region {
                return Some(current);
            }
            current = self.parent_op(parent)?;
        }
    }

    /// Check whether `inner` is `outer` or nested (transitively) inside it.
    pub fn region_is_within(&self, inner: RegionId, outer: RegionId) -> bool {
        let mut current = inner;
        loop {
            if current == outer {
                return true;
            }
            match self.parent_op(current).and_then(|op| self.ops.node_weight(op)) {
                Some(node) => current = node.parent,
                None => return false,
            }
        }
    }

    /// Find an op directly in `region` by instance name.
    pub fn find_op_by_name(&self, region: RegionId, name: &str) -> Option<OpId> {
        self.regions
            .get(region.index())?
            .ops
            .iter()
            .copied()
            .find(|&op| self.ops.node_weight(op).is_some_and(|n| n.name == name))
    }

    // ── Functions ──

    /// Functions in insertion order.
    pub fn functions(&self) -> &[Function] {
        &self.functions
    }

    /// Look up a function by name.
    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }

    /// Look up a function by name, mutably.
    pub fn function_mut(&mut self, name: &str) -> Option<&mut Function> {
        self.functions.iter_mut().find(|f| f.name == name)
    }

    /// Function owning the given body region.
    pub fn function_by_body(&self, body: RegionId) -> Option<&Function> {
        self.functions.iter().find(|f| f.body == body)
    }

    /// Argument values of a function.
    pub fn function_args(&self, name: &str) -> Result<&[ValueId]> {
        let func = self
            .function(name)
            .ok_or_else(|| Error::InvalidGraph(format!("Function '{}' not found", name)))?;
        Ok(&self.regions[func.body.index()].args)
    }

    /// Declare a new function with an empty body and return the body region.
    pub fn add_function(
        &mut self,
        name: impl Into<String>,
        arg_types: Vec<TensorType>,
        result_types: Vec<TensorType>,
    ) -> Result<RegionId> {
        let name = name.into();
        self.check_function_name(&name)?;
        let body = self.new_region(RegionOwner::Function, Execution::Once);
        for ty in arg_types {
            self.add_region_arg(body, ty)?;
        }
        self.push_function(name, body, result_types);
        Ok(body)
    }

    /// Turn the current top-level graph into the body of a new function.
    ///
    /// The module receives a fresh, empty top-level graph.
    pub fn graph_into_function(
        &mut self,
        name: impl Into<String>,
        result_types: Vec<TensorType>,
    ) -> Result<RegionId> {
        let name = name.into();
        self.check_function_name(&name)?;
        let body = self.graph;
        self.region_mut(body)?.owner = RegionOwner::Function;
        self.graph = self.new_region(RegionOwner::Graph, Execution::Once);
        self.push_function(name, body, result_types);
        Ok(body)
    }

    fn check_function_name(&self, name: &str) -> Result<()> {
        if self.function(name).is_some() {
            return Err(Error::StructuralViolation(format!(
                "Function '{}' already exists",
                name
            )));
        }
        Ok(())
    }

    fn push_function(&mut self, name: String, body: RegionId, result_types: Vec<TensorType>) {
        let num_args = self.regions[body.index()].args.len();
        let num_results = result_types.len();
        self.functions.push(Function {
            name,
            body,
            result_types,
            arg_attrs: vec![Attributes::new(); num_args],
            result_attrs: vec![Attributes::new(); num_results],
            attrs: Attributes::new(),
        });
    }

    // ── Values ──

    fn new_value(&mut self, ty: TensorType, def: ValueDef) -> ValueId {
        let id = ValueId(self.values.len());
        self.values.push(Value {
            ty,
            def,
            users: Vec::new(),
        });
        id
    }

    /// Get a value.
    pub fn value(&self, id: ValueId) -> Result<&Value> {
        self.values
            .get(id.index())
            .ok_or_else(|| Error::InvalidGraph(format!("Value {:?} not found", id)))
    }

    /// Type of a value.
    pub fn value_type(&self, id: ValueId) -> Result<&TensorType> {
        Ok(&self.value(id)?.ty)
    }

    /// Overwrite a value's type.
    pub fn set_value_type(&mut self, id: ValueId, ty: TensorType) -> Result<()> {
        self.values
            .get_mut(id.index())
            .ok_or_else(|| Error::InvalidGraph(format!("Value {:?} not found", id)))?
            .ty = ty;
        Ok(())
    }

    /// Number of values ever created (including dead ones).
    pub fn value_count(&self) -> usize {
        self.values.len()
    }

    /// Redirect every use of `old` to `new`.
    pub fn replace_all_uses_with(&mut self, old: ValueId, new: ValueId) -> Result<()> {
        self.value(new)?;
        if old == new {
            return Ok(());
        }
        let users = std::mem::take(&mut self.values[old.index()].users);
        let mut seen = HashSet::new();
        for &user in &users {
            if !seen.insert(user) {
                continue;
            }
            if let Some(node) = self.ops.node_weight_mut(user) {
                for operand in node.operands.iter_mut().filter(|v| **v == old) {
                    *operand = new;
                }
            }
        }
        self.values[new.index()].users.extend(users);
        Ok(())
    }

    // ── Operations ──

    /// Get an operation.
    pub fn op(&self, id: OpId) -> Result<&Operation> {
        self.ops
            .node_weight(id)
            .ok_or_else(|| Error::InvalidGraph(format!("Operation {:?} not found", id)))
    }

    /// Get an operation mutably (name, kind and attributes are editable).
    pub fn op_mut(&mut self, id: OpId) -> Result<&mut Operation> {
        self.ops
            .node_weight_mut(id)
            .ok_or_else(|| Error::InvalidGraph(format!("Operation {:?} not found", id)))
    }

    /// Check whether an op exists.
    pub fn contains_op(&self, id: OpId) -> bool {
        self.ops.contains_node(id)
    }

    /// Number of live operations.
    pub fn op_count(&self) -> usize {
        self.ops.node_count()
    }

    /// The `index`-th result of an op.
    pub fn result(&self, op: OpId, index: usize) -> Result<ValueId> {
        let node = self.op(op)?;
        node.results.get(index).copied().ok_or_else(|| {
            Error::InvalidGraph(format!(
                "Operation '{}' has no result {}",
                node.display_name(),
                index
            ))
        })
    }

    /// Append a new op at the end of a region.
    pub fn append_op(&mut self, region: RegionId, op: NewOp) -> Result<OpId> {
        let index = self.region(region)?.ops.len();
        self.insert_op(region, index, op)
    }

    /// Insert a new op immediately before `anchor`.
    pub fn insert_op_before(&mut self, anchor: OpId, op: NewOp) -> Result<OpId> {
        let region = self.op(anchor)?.parent;
        let index = self.position(anchor)?;
        self.insert_op(region, index, op)
    }

    /// Insert a new op at `index` in a region.
    pub fn insert_op(&mut self, region: RegionId, index: usize, op: NewOp) -> Result<OpId> {
        if index > self.region(region)?.ops.len() {
            return Err(Error::InvalidGraph(format!(
                "Insertion index {} out of bounds for region {:?}",
                index, region
            )));
        }
        for &operand in &op.operands {
            self.value(operand)?;
        }
        for &dep in &op.control_deps {
            self.op(dep)?;
        }

        let mut control_deps = Vec::with_capacity(op.control_deps.len());
        for dep in op.control_deps {
            if !control_deps.contains(&dep) {
                control_deps.push(dep);
            }
        }
        let form = if op.func_refs.is_empty() {
            OpForm::Plain
        } else {
            OpForm::Functional(op.func_refs)
        };

        let id = self.ops.add_node(Operation {
            name: op.name,
            kind: op.kind,
            attrs: op.attrs,
            operands: op.operands,
            results: Vec::new(),
            control_deps,
            form,
            parent: region,
        });

        let results: Vec<ValueId> = op
            .result_types
            .into_iter()
            .enumerate()
            .map(|(i, ty)| self.new_value(ty, ValueDef::Result { op: id, index: i }))
            .collect();

        let operands = self.ops[id].operands.clone();
        for operand in operands {
            self.values[operand.index()].users.push(id);
        }
        self.ops[id].results = results;
        self.region_mut(region)?.ops.insert(index, id);
        Ok(id)
    }

    /// Position of an op within its parent region.
    pub fn position(&self, op: OpId) -> Result<usize> {
        let parent = self.op(op)?.parent;
        self.region(parent)?
            .ops
            .iter()
            .position(|&o| o == op)
            .ok_or_else(|| {
                Error::InvalidGraph(format!("Operation {:?} missing from its region", op))
            })
    }

    /// Ops that list `op` as a control dependency.
    pub fn control_dependents(&self, op: OpId) -> Vec<OpId> {
        self.ops
            .node_indices()
            .filter(|&id| self.ops[id].control_deps.contains(&op))
            .collect()
    }

    /// Add a control dependency; returns `false` if it was already present.
    pub fn add_control_dep(&mut self, op: OpId, dep: OpId) -> Result<bool> {
        self.op(dep)?;
        let node = self.op_mut(op)?;
        if node.control_deps.contains(&dep) {
            return Ok(false);
        }
        node.control_deps.push(dep);
        Ok(true)
    }

    /// Replace an op's control dependencies (deduplicated, order kept).
    pub fn set_control_deps(&mut self, op: OpId, deps: Vec<OpId>) -> Result<()> {
        for &dep in &deps {
            self.op(dep)?;
        }
        let mut unique = Vec::with_capacity(deps.len());
        for dep in deps {
            if !unique.contains(&dep) {
                unique.push(dep);
            }
        }
        self.op_mut(op)?.control_deps = unique;
        Ok(())
    }

    /// Redirect control edges from `old` to `new` on every dependent.
    pub fn replace_control_dependent_edges(&mut self, old: OpId, new: OpId) -> Result<()> {
        self.op(new)?;
        for dependent in self.control_dependents(old) {
            let mut deps = self.ops[dependent].control_deps.clone();
            for dep in deps.iter_mut().filter(|d| **d == old) {
                *dep = new;
            }
            if dependent == new {
                deps.retain(|&d| d != new);
            }
            self.set_control_deps(dependent, deps)?;
        }
        Ok(())
    }

    /// Replace operand `index` of `op`.
    pub fn set_operand(&mut self, op: OpId, index: usize, value: ValueId) -> Result<()> {
        self.value(value)?;
        let node = self.op_mut(op)?;
        let slot = node.operands.get_mut(index).ok_or_else(|| {
            Error::InvalidGraph(format!("Operation {:?} has no operand {}", op, index))
        })?;
        let old = std::mem::replace(slot, value);
        self.unregister_use(old, op);
        self.values[value.index()].users.push(op);
        Ok(())
    }

    /// Replace the whole operand list of `op`.
    pub fn set_operands(&mut self, op: OpId, operands: Vec<ValueId>) -> Result<()> {
        for &v in &operands {
            self.value(v)?;
        }
        let old = std::mem::replace(&mut self.op_mut(op)?.operands, operands.clone());
        for v in old {
            self.unregister_use(v, op);
        }
        for v in operands {
            self.values[v.index()].users.push(op);
        }
        Ok(())
    }

    /// Remove operand `index` of `op`.
    pub fn remove_operand(&mut self, op: OpId, index: usize) -> Result<()> {
        let node = self.op_mut(op)?;
        if index >= node.operands.len() {
            return Err(Error::InvalidGraph(format!(
                "Operation {:?} has no operand {}",
                op, index
            )));
        }
        let old = node.operands.remove(index);
        self.unregister_use(old, op);
        Ok(())
    }

    fn unregister_use(&mut self, value: ValueId, op: OpId) {
        if let Some(v) = self.values.get_mut(value.index())
            && let Some(pos) = v.users.iter().position(|&u| u == op)
        {
            v.users.remove(pos);
        }
    }

    /// Remove an unused result of `op`, shifting the following ones down.
    pub fn remove_result(&mut self, op: OpId, index: usize) -> Result<()> {
        let value = self.result(op, index)?;
        if self.value(value)?.has_uses() {
            return Err(Error::StructuralViolation(format!(
                "Cannot remove result {} of '{}': it still has uses",
                index,
                self.op(op)?.display_name()
            )));
        }
        let node = self.op_mut(op)?;
        node.results.remove(index);
        let results = node.results.clone();
        for (i, v) in results.into_iter().enumerate().skip(index) {
            self.values[v.index()].def = ValueDef::Result { op, index: i };
        }
        Ok(())
    }

    /// Switch an op to plain or functional form, discarding owned regions.
    pub fn set_form(&mut self, op: OpId, form: OpForm) -> Result<()> {
        if matches!(form, OpForm::Regions(_)) {
            return Err(Error::UnsupportedForm(
                "Region form is installed through add_op_region".to_string(),
            ));
        }
        let old = std::mem::replace(&mut self.op_mut(op)?.form, form);
        if let OpForm::Regions(regions) = old {
            for region in regions {
                self.drop_region(region);
            }
        }
        Ok(())
    }

    /// Erase an op whose results are unused.
    ///
    /// Ops that had a control dependency on the erased op inherit its own
    /// control dependencies, so ordering constraints survive the erasure.
    pub fn erase_op(&mut self, op: OpId) -> Result<()> {
        let node = self.op(op)?;
        for (i, &result) in node.results.iter().enumerate() {
            if self.values[result.index()].has_uses() {
                return Err(Error::StructuralViolation(format!(
                    "Cannot erase '{}' ({}): result {} still has uses",
                    node.display_name(),
                    node.kind,
                    i
                )));
            }
        }

        let inherited = node.control_deps.clone();
        for dependent in self.control_dependents(op) {
            let mut deps = self.ops[dependent].control_deps.clone();
            deps.retain(|&d| d != op);
            deps.extend(inherited.iter().copied().filter(|&d| d != dependent));
            self.set_control_deps(dependent, deps)?;
        }

        self.detach(op)?;
        self.destroy(op);
        Ok(())
    }

    /// Remove an op from its parent region's list (it stays in the arena).
    fn detach(&mut self, op: OpId) -> Result<()> {
        let position = self.position(op)?;
        let parent = self.op(op)?.parent;
        self.region_mut(parent)?.ops.remove(position);
        Ok(())
    }

    /// Free an op, its nested regions and its operand uses.
    fn destroy(&mut self, op: OpId) {
        let Some(node) = self.ops.remove_node(op) else {
            return;
        };
        for operand in node.operands {
            self.unregister_use(operand, op);
        }
        if let OpForm::Regions(regions) = node.form {
            for region in regions {
                self.drop_region(region);
            }
        }
    }

    fn drop_region(&mut self, region: RegionId) {
        let ops = std::mem::take(&mut self.regions[region.index()].ops);
        for op in ops.into_iter().rev() {
            self.destroy(op);
        }
        self.regions[region.index()].owner = RegionOwner::Detached;
    }

    /// Move `op` to position `index` of `region` in one step.
    ///
    /// `index` is interpreted after the op has been detached from its
    /// current position.
    pub fn move_op(&mut self, op: OpId, region: RegionId, index: usize) -> Result<()> {
        self.region(region)?;
        self.detach(op)?;
        let target = self.region_mut(region)?;
        let index = index.min(target.ops.len());
        target.ops.insert(index, op);
        self.ops[op].parent = region;
        Ok(())
    }

    /// Move `op` immediately before `anchor`, possibly into another region.
    pub fn move_op_before(&mut self, op: OpId, anchor: OpId) -> Result<()> {
        if op == anchor {
            return Ok(());
        }
        let region = self.op(anchor)?.parent;
        self.detach(op)?;
        let index = self.position(anchor)?;
        self.region_mut(region)?.ops.insert(index, op);
        self.ops[op].parent = region;
        Ok(())
    }

    /// Reorder a region's ops. `order` must be a permutation of the current ops.
    pub fn reorder_region(&mut self, region: RegionId, order: Vec<OpId>) -> Result<()> {
        let current: HashSet<OpId> = self.region(region)?.ops.iter().copied().collect();
        let proposed: HashSet<OpId> = order.iter().copied().collect();
        if current != proposed || order.len() != current.len() {
            return Err(Error::InvalidGraph(format!(
                "Reordering of region {:?} is not a permutation of its ops",
                region
            )));
        }
        self.region_mut(region)?.ops = order;
        Ok(())
    }

    /// Deep-copy the ops of `src` to the end of `dst`.
    ///
    /// `mapping` translates values referenced by the copied ops; callers seed
    /// it (e.g. callee arguments to call operands) and it is extended with
    /// every copied result and nested region argument. Values missing from
    /// the mapping are referenced as-is.
    pub fn clone_region_into(
        &mut self,
        src: RegionId,
        dst: RegionId,
        mapping: &mut HashMap<ValueId, ValueId>,
    ) -> Result<()> {
        let mut op_mapping = HashMap::new();
        self.clone_region_ops(src, dst, mapping, &mut op_mapping)
    }

    fn clone_region_ops(
        &mut self,
        src: RegionId,
        dst: RegionId,
        mapping: &mut HashMap<ValueId, ValueId>,
        op_mapping: &mut HashMap<OpId, OpId>,
    ) -> Result<()> {
        let ops = self.region(src)?.ops.clone();
        for old in ops {
            let node = self.op(old)?.clone();
            let new_op = NewOp {
                name: node.name.clone(),
                kind: node.kind.clone(),
                operands: node
                    .operands
                    .iter()
                    .map(|v| *mapping.get(v).unwrap_or(v))
                    .collect(),
                result_types: node
                    .results
                    .iter()
                    .map(|&v| self.values[v.index()].ty.clone())
                    .collect(),
                control_deps: node
                    .control_deps
                    .iter()
                    .map(|d| *op_mapping.get(d).unwrap_or(d))
                    .collect(),
                attrs: node.attrs.clone(),
                func_refs: node.func_refs().to_vec(),
            };
            let new = self.append_op(dst, new_op)?;
            op_mapping.insert(old, new);
            for (i, &result) in node.results.iter().enumerate() {
                mapping.insert(result, self.ops[new].results[i]);
            }
            for &nested in node.regions() {
                let execution = self.region(nested)?.execution;
                let new_region = self.add_op_region(new, execution)?;
                for arg in self.region(nested)?.args.clone() {
                    let ty = self.values[arg.index()].ty.clone();
                    let new_arg = self.add_region_arg(new_region, ty)?;
                    mapping.insert(arg, new_arg);
                }
                self.clone_region_ops(nested, new_region, mapping, op_mapping)?;
            }
        }
        Ok(())
    }

    // ── Verification ──

    /// Check the module's structural invariants.
    pub fn verify(&self) -> Result<()> {
        let mut names = HashSet::new();
        for func in &self.functions {
            if !names.insert(func.name.as_str()) {
                return Err(Error::StructuralViolation(format!(
                    "Duplicate function name '{}'",
                    func.name
                )));
            }
            let num_args = self.region(func.body)?.args.len();
            if func.arg_attrs.len() != num_args || func.result_attrs.len() != func.result_types.len()
            {
                return Err(Error::StructuralViolation(format!(
                    "Function '{}' attribute lists do not match its signature",
                    func.name
                )));
            }
            let term = self.terminator(func.body).ok_or_else(|| {
                Error::StructuralViolation(format!("Function '{}' has no terminator", func.name))
            })?;
            let yielded = self.ops[term].operands.len();
            if yielded != func.result_types.len() {
                return Err(Error::StructuralViolation(format!(
                    "Function '{}' returns {} values but declares {} results",
                    func.name,
                    yielded,
                    func.result_types.len()
                )));
            }
        }

        for region in self.regions() {
            let r = self.region(region)?;
            for (i, &arg) in r.args.iter().enumerate() {
                if self.value(arg)?.def != (ValueDef::Argument { region, index: i }) {
                    return Err(Error::StructuralViolation(format!(
                        "Argument {} of region {:?} has a stale definition",
                        i, region
                    )));
                }
            }
            for (pos, &op) in r.ops.iter().enumerate() {
                let node = self.op(op)?;
                if node.parent != region {
                    return Err(Error::StructuralViolation(format!(
                        "Operation '{}' has a stale parent link",
                        node.display_name()
                    )));
                }
                if node.is_terminator() && pos + 1 != r.ops.len() {
                    return Err(Error::StructuralViolation(format!(
                        "Terminator '{}' is not the last op of its region",
                        node.kind
                    )));
                }
                for &operand in &node.operands {
                    let live = match self.value(operand)?.def {
                        ValueDef::Result { op, .. } => self.ops.contains_node(op),
                        ValueDef::Argument { region, .. } => {
                            self.region(region)?.owner != RegionOwner::Detached
                        }
                    };
                    if !live {
                        return Err(Error::StructuralViolation(format!(
                            "Operation '{}' ({}) uses a value whose producer was erased",
                            node.display_name(),
                            node.kind
                        )));
                    }
                }
                for &dep in &node.control_deps {
                    if !self.ops.contains_node(dep) {
                        return Err(Error::StructuralViolation(format!(
                            "Operation '{}' has a control dependency on an erased op",
                            node.display_name()
                        )));
                    }
                }
                for &nested in node.regions() {
                    if self.region(nested)?.owner != RegionOwner::Op(op) {
                        return Err(Error::StructuralViolation(format!(
                            "Region {:?} is not owned by '{}'",
                            nested,
                            node.display_name()
                        )));
                    }
                    if self.terminator(nested).is_none() {
                        return Err(Error::StructuralViolation(format!(
                            "Region {:?} of '{}' has no terminator",
                            nested,
                            node.display_name()
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

impl Default for Module {
    fn default() -> Self {
        Self::new()
    }
}
