//! Context passed to shape functions.
//!
//! Provides read-only access to the operation being inferred, its operand
//! types, statically known operand values and its attributes.

use crate::attr::Attributes;
use crate::ir::{Module, Operation, ValueDef};
use crate::types::{DataType, Shape, TensorData, TensorType, TensorValue};
use crate::{Error, Result};

/// Context for shape inference of a single operation.
pub struct ShapeCtx<'a> {
    /// The operation being processed.
    pub op: &'a Operation,

    /// The module containing the operation.
    pub module: &'a Module,

    graph_version: u32,
}

impl<'a> ShapeCtx<'a> {
    /// Create a new shape context.
    ///
    /// A `graph_version` of 0 means unknown (treated as latest).
    pub fn new(op: &'a Operation, module: &'a Module, graph_version: u32) -> Self {
        Self {
            op,
            module,
            graph_version,
        }
    }

    /// Producer version of the graph, 0 if unknown.
    pub fn graph_version(&self) -> u32 {
        self.graph_version
    }

    /// Get the number of operands.
    pub fn operand_count(&self) -> usize {
        self.op.operands().len()
    }

    /// Get the number of results.
    pub fn result_count(&self) -> usize {
        self.op.results().len()
    }

    /// Get the type of an operand.
    pub fn operand_type(&self, index: usize) -> Result<&TensorType> {
        let value = self.op.operands().get(index).ok_or_else(|| {
            Error::ShapeInference(format!(
                "{} operand {} not found",
                self.op.kind, index
            ))
        })?;
        self.module.value_type(*value)
    }

    /// Get the shape of an operand.
    pub fn operand_shape(&self, index: usize) -> Result<&Shape> {
        Ok(&self.operand_type(index)?.shape)
    }

    /// Get the element type of an operand, if known.
    pub fn operand_dtype(&self, index: usize) -> Result<Option<DataType>> {
        Ok(self.operand_type(index)?.dtype)
    }

    /// Get the statically known value of an operand.
    ///
    /// Known values come from `Const` producers and from `Shape` ops whose
    /// input has a fully static shape. Returns `None` otherwise.
    pub fn operand_value(&self, index: usize) -> Option<TensorValue> {
        let value = self.module.value(*self.op.operands().get(index)?).ok()?;
        let ValueDef::Result { op, .. } = value.def() else {
            return None;
        };
        let producer = self.module.op(op).ok()?;
        match producer.kind.as_str() {
            "Const" => producer.attrs.get_tensor("value").ok().cloned(),
            "Shape" => {
                let input = *producer.operands().first()?;
                let dims = self.module.value_type(input).ok()?.shape.as_static()?;
                // Dimensions that don't fit the element type leave the value unknown.
                let data = match producer.attrs.get_type("out_type") {
                    Ok(DataType::I32) => TensorData::I32(
                        dims.iter()
                            .map(|&d| i32::try_from(d).ok())
                            .collect::<Option<_>>()?,
                    ),
                    _ => TensorData::I64(
                        dims.iter()
                            .map(|&d| i64::try_from(d).ok())
                            .collect::<Option<_>>()?,
                    ),
                };
                Some(TensorValue::vector(data))
            }
            _ => None,
        }
    }

    /// Get the current type of a result.
    pub fn result_type(&self, index: usize) -> Result<&TensorType> {
        let value = self.op.results().get(index).ok_or_else(|| {
            Error::ShapeInference(format!("{} result {} not found", self.op.kind, index))
        })?;
        self.module.value_type(*value)
    }

    /// Attributes of the operation.
    pub fn attrs(&self) -> &Attributes {
        &self.op.attrs
    }

    // --- Attribute accessors ---

    /// Get a bool attribute, defaulting to `false` when absent.
    pub fn attr_flag(&self, key: &str) -> bool {
        self.op.attrs.bool_or(key, false)
    }

    /// Get a dtype attribute.
    pub fn attr_type(&self, key: &str) -> Result<DataType> {
        self.op.attrs.get_type(key)
    }

    /// Get a shape attribute.
    pub fn attr_shape(&self, key: &str) -> Result<&Shape> {
        self.op.attrs.get_shape(key)
    }

    /// Get a tensor attribute.
    pub fn attr_tensor(&self, key: &str) -> Result<&TensorValue> {
        self.op.attrs.get_tensor(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::NewOp;

    #[test]
    fn test_operand_value_from_const_and_shape() {
        let mut module = Module::new();
        let graph = module.graph();
        let value = TensorValue::vector(TensorData::I64(vec![3, 2]));
        let c = module
            .append_op(
                graph,
                NewOp::new("Const")
                    .attr("value", value.clone())
                    .result(value.tensor_type()),
            )
            .unwrap();
        let x = module
            .append_op(
                graph,
                NewOp::new("Placeholder").result(TensorType::fixed(DataType::F32, &[4, 5])),
            )
            .unwrap();
        let c_out = module.result(c, 0).unwrap();
        let x_out = module.result(x, 0).unwrap();
        let shape = module
            .append_op(
                graph,
                NewOp::new("Shape")
                    .operands([x_out])
                    .result(TensorType::unknown()),
            )
            .unwrap();
        let shape_out = module.result(shape, 0).unwrap();
        let user = module
            .append_op(
                graph,
                NewOp::new("Pair")
                    .operands([c_out, shape_out, x_out])
                    .result(TensorType::unknown()),
            )
            .unwrap();

        let op = module.op(user).unwrap();
        let ctx = ShapeCtx::new(op, &module, 0);
        assert_eq!(ctx.operand_value(0), Some(value));
        assert_eq!(
            ctx.operand_value(1),
            Some(TensorValue::vector(TensorData::I64(vec![4, 5])))
        );
        assert_eq!(ctx.operand_value(2), None);
        assert_eq!(ctx.operand_dtype(2).unwrap(), Some(DataType::F32));
        assert!(ctx.operand_type(3).is_err());
    }

    #[test]
    fn test_shape_value_unknown_when_dims_overflow_i32() {
        let mut module = Module::new();
        let graph = module.graph();
        let x = module
            .append_op(
                graph,
                NewOp::new("Placeholder")
                    .result(TensorType::fixed(DataType::F32, &[1 << 33, 1])),
            )
            .unwrap();
        let x_out = module.result(x, 0).unwrap();
        let mut shape_out = Vec::new();
        for out_type in [DataType::I32, DataType::I64] {
            let shape = module
                .append_op(
                    graph,
                    NewOp::new("Shape")
                        .operands([x_out])
                        .attr("out_type", out_type)
                        .result(TensorType::unknown()),
                )
                .unwrap();
            shape_out.push(module.result(shape, 0).unwrap());
        }
        let user = module
            .append_op(
                graph,
                NewOp::new("Pair")
                    .operands(shape_out)
                    .result(TensorType::unknown()),
            )
            .unwrap();

        let ctx = ShapeCtx::new(module.op(user).unwrap(), &module, 0);
        assert_eq!(ctx.operand_value(0), None);
        assert_eq!(
            ctx.operand_value(1),
            Some(TensorValue::vector(TensorData::I64(vec![1 << 33, 1])))
        );
    }
}
