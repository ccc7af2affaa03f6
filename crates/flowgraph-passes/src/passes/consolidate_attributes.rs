//! Moves type information between attributes and value types.
//!
//! Importers carry shapes in unregistered attributes (`_output_shapes`,
//! `_input_shapes`) and in per-kind declaration attributes such as
//! `Placeholder.shape`. [`ConsolidateAttributesPass`] folds them into value
//! types and drops them; [`PrepareAttributesForExportPass`] writes them back
//! from the types.

use flowgraph_core::attr::{INPUT_SHAPES_ATTR, OUTPUT_SHAPES_ATTR};
use flowgraph_core::{
    Attribute, Attributes, Error, Module, OpRegistry, Pass, Result, Shape, TensorType, ValueId,
};
use std::collections::HashMap;
use tracing::{debug, trace};

/// Shapes carried by an attribute, accepting a single shape or a list.
fn shapes_of(attr: &Attribute, what: &str) -> Result<Vec<Shape>> {
    match attr {
        Attribute::Shapes(shapes) => Ok(shapes.clone()),
        Attribute::Shape(shape) => Ok(vec![shape.clone()]),
        _ => Err(Error::StructuralViolation(format!(
            "{} does not hold shapes",
            what
        ))),
    }
}

/// Accumulated refinements, checked before anything is written.
#[derive(Default)]
struct Refinements {
    values: HashMap<ValueId, TensorType>,
    results: HashMap<(usize, usize), TensorType>,
}

impl Refinements {
    fn refine(
        current: &TensorType,
        info: &TensorType,
        what: &dyn Fn() -> String,
    ) -> Result<TensorType> {
        current.meet(info).ok_or_else(|| {
            Error::StructuralViolation(format!(
                "{}: {} conflicts with {}",
                what(),
                info,
                current
            ))
        })
    }

    fn value(
        &mut self,
        module: &Module,
        value: ValueId,
        info: TensorType,
        what: &dyn Fn() -> String,
    ) -> Result<()> {
        let current = match self.values.get(&value) {
            Some(ty) => ty.clone(),
            None => module.value_type(value)?.clone(),
        };
        let refined = Self::refine(&current, &info, what)?;
        self.values.insert(value, refined);
        Ok(())
    }

    fn function_result(
        &mut self,
        current: &TensorType,
        key: (usize, usize),
        info: TensorType,
        what: &dyn Fn() -> String,
    ) -> Result<()> {
        let current = self.results.get(&key).cloned().unwrap_or_else(|| current.clone());
        let refined = Self::refine(&current, &info, what)?;
        self.results.insert(key, refined);
        Ok(())
    }
}

/// Pass that folds shape attributes into value types.
///
/// Conflicting information is reported before the module is modified.
pub struct ConsolidateAttributesPass;

impl ConsolidateAttributesPass {
    /// Create a new consolidation pass.
    pub fn new() -> Self {
        Self
    }

    fn collect(module: &Module, registry: &OpRegistry) -> Result<Refinements> {
        let mut plan = Refinements::default();

        for op in module.all_ops() {
            let node = module.op(op)?;
            let name = || format!("'{}' ({})", node.display_name(), node.kind);

            if let Some(attr) = node.attrs.get(OUTPUT_SHAPES_ATTR) {
                let shapes = shapes_of(attr, &format!("{} {}", name(), OUTPUT_SHAPES_ATTR))?;
                if shapes.len() != node.results().len() {
                    return Err(Error::StructuralViolation(format!(
                        "{} lists {} output shapes for {} results",
                        name(),
                        shapes.len(),
                        node.results().len()
                    )));
                }
                for (&result, shape) in node.results().iter().zip(shapes) {
                    let info = TensorType { dtype: None, shape };
                    plan.value(module, result, info, &name)?;
                }
            }

            let Some(desc) = registry.get(&node.kind) else {
                continue;
            };
            let [result] = node.results() else {
                continue;
            };
            let mut info = TensorType::unknown();
            if let Some(key) = desc.shape_attr
                && let Some(attr) = node.attrs.get(key)
            {
                info.shape = match attr {
                    Attribute::Shape(shape) => shape.clone(),
                    _ => {
                        return Err(Error::StructuralViolation(format!(
                            "{} attribute '{}' is not a shape",
                            name(),
                            key
                        )));
                    }
                };
            }
            if let Some(key) = desc.dtype_attr
                && node.attrs.contains(key)
            {
                info.dtype = Some(node.attrs.get_type(key).map_err(|e| {
                    Error::StructuralViolation(format!("{}: {}", name(), e))
                })?);
            }
            plan.value(module, *result, info, &name)?;
        }

        for (f, func) in module.functions().iter().enumerate() {
            let args = module.region(func.body())?.args();
            let name = || format!("function '{}'", func.name());

            if let Some(attr) = func.attrs.get(INPUT_SHAPES_ATTR) {
                let shapes = shapes_of(attr, &format!("{} {}", name(), INPUT_SHAPES_ATTR))?;
                if shapes.len() != args.len() {
                    return Err(Error::StructuralViolation(format!(
                        "{} lists {} input shapes for {} arguments",
                        name(),
                        shapes.len(),
                        args.len()
                    )));
                }
                for (&arg, shape) in args.iter().zip(shapes) {
                    plan.value(module, arg, TensorType { dtype: None, shape }, &name)?;
                }
            }

            for (&arg, attrs) in args.iter().zip(&func.arg_attrs) {
                if let Some(attr) = attrs.get(OUTPUT_SHAPES_ATTR) {
                    for shape in shapes_of(attr, &format!("{} argument", name()))? {
                        plan.value(module, arg, TensorType { dtype: None, shape }, &name)?;
                    }
                }
            }

            let results = func.result_types.iter().zip(&func.result_attrs);
            for (i, (current, attrs)) in results.enumerate() {
                if let Some(attr) = attrs.get(OUTPUT_SHAPES_ATTR) {
                    for shape in shapes_of(attr, &format!("{} result", name()))? {
                        let info = TensorType { dtype: None, shape };
                        plan.function_result(current, (f, i), info, &name)?;
                    }
                }
            }
        }

        Ok(plan)
    }
}

impl Pass for ConsolidateAttributesPass {
    fn name(&self) -> &str {
        "consolidate-attributes"
    }

    fn run(&self, module: &mut Module, registry: &OpRegistry) -> Result<bool> {
        let plan = Self::collect(module, registry)?;
        let mut changed = false;

        for (value, ty) in plan.values {
            if module.value_type(value)? != &ty {
                trace!(?value, %ty, "refined value type");
                module.set_value_type(value, ty)?;
                changed = true;
            }
        }

        for op in module.all_ops() {
            let kind = module.op(op)?.kind.clone();
            let desc = registry.get(&kind);
            let node = module.op_mut(op)?;
            changed |= node.attrs.remove(OUTPUT_SHAPES_ATTR).is_some();
            if node.results().len() == 1
                && let Some(desc) = desc
            {
                for key in [desc.shape_attr, desc.dtype_attr].into_iter().flatten() {
                    changed |= node.attrs.remove(key).is_some();
                }
            }
        }

        let names: Vec<String> = module.functions().iter().map(|f| f.name().to_string()).collect();
        for (f, name) in names.iter().enumerate() {
            let Some(func) = module.function_mut(name) else {
                continue;
            };
            for (i, ty) in func.result_types.iter_mut().enumerate() {
                if let Some(refined) = plan.results.get(&(f, i))
                    && refined != ty
                {
                    *ty = refined.clone();
                    changed = true;
                }
            }
            changed |= func.attrs.remove(INPUT_SHAPES_ATTR).is_some();
            for attrs in func.arg_attrs.iter_mut().chain(func.result_attrs.iter_mut()) {
                changed |= attrs.remove(OUTPUT_SHAPES_ATTR).is_some();
            }
        }

        debug!(changed, "attributes consolidated");
        Ok(changed)
    }
}

impl Default for ConsolidateAttributesPass {
    fn default() -> Self {
        Self::new()
    }
}

/// Pass that re-materializes shape attributes from refined types.
///
/// Value types are not changed.
pub struct PrepareAttributesForExportPass;

impl PrepareAttributesForExportPass {
    /// Create a new export preparation pass.
    pub fn new() -> Self {
        Self
    }

    fn set_if_changed(attrs: &mut Attributes, key: &str, value: Attribute) -> bool {
        if attrs.get(key) == Some(&value) {
            return false;
        }
        attrs.set(key, value);
        true
    }
}

impl Pass for PrepareAttributesForExportPass {
    fn name(&self) -> &str {
        "prepare-attributes-for-export"
    }

    fn run(&self, module: &mut Module, registry: &OpRegistry) -> Result<bool> {
        let mut changed = false;

        for op in module.all_ops() {
            let node = module.op(op)?;
            let types = node
                .results()
                .iter()
                .map(|&v| module.value_type(v).cloned())
                .collect::<Result<Vec<_>>>()?;
            let desc = registry.get(&node.kind).cloned();

            let node = module.op_mut(op)?;
            if types.iter().any(|t| t.shape.is_ranked()) {
                let attr = Attribute::Shapes(types.iter().map(|t| t.shape.clone()).collect());
                changed |= Self::set_if_changed(&mut node.attrs, OUTPUT_SHAPES_ATTR, attr);
            }
            if let (Some(desc), [ty]) = (desc, types.as_slice()) {
                if let Some(key) = desc.shape_attr
                    && ty.shape.is_ranked()
                {
                    let attr = Attribute::Shape(ty.shape.clone());
                    changed |= Self::set_if_changed(&mut node.attrs, key, attr);
                }
                if let (Some(key), Some(dtype)) = (desc.dtype_attr, ty.dtype) {
                    changed |= Self::set_if_changed(&mut node.attrs, key, Attribute::Type(dtype));
                }
            }
        }

        let names: Vec<String> = module.functions().iter().map(|f| f.name().to_string()).collect();
        for name in names {
            let arg_types = module
                .function_args(&name)?
                .iter()
                .map(|&v| module.value_type(v).cloned())
                .collect::<Result<Vec<_>>>()?;
            let Some(func) = module.function_mut(&name) else {
                continue;
            };

            if arg_types.iter().any(|t| t.shape.is_ranked()) {
                let shapes = arg_types.iter().map(|t| t.shape.clone()).collect();
                let attr = Attribute::Shapes(shapes);
                changed |= Self::set_if_changed(&mut func.attrs, INPUT_SHAPES_ATTR, attr);
            }
            for (ty, attrs) in arg_types.iter().zip(func.arg_attrs.iter_mut()) {
                if ty.shape.is_ranked() {
                    changed |= Self::set_if_changed(
                        attrs,
                        OUTPUT_SHAPES_ATTR,
                        Attribute::Shapes(vec![ty.shape.clone()]),
                    );
                }
            }
            for (ty, attrs) in func.result_types.iter().zip(func.result_attrs.iter_mut()) {
                if ty.shape.is_ranked() {
                    changed |= Self::set_if_changed(
                        attrs,
                        OUTPUT_SHAPES_ATTR,
                        Attribute::Shapes(vec![ty.shape.clone()]),
                    );
                }
            }
        }

        debug!(changed, "attributes prepared for export");
        Ok(changed)
    }
}

impl Default for PrepareAttributesForExportPass {
    fn default() -> Self {
        Self::new()
    }
}
