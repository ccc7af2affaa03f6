//! Elementwise shape functions.

use flowgraph_core::{Error, Result, ShapeCtx, TensorType, broadcast_shape};

/// Result type equals the first operand's type.
pub fn unary_shape(ctx: &ShapeCtx) -> Result<Vec<TensorType>> {
    Ok(vec![ctx.operand_type(0)?.clone()])
}

/// Result shape is the broadcast of both operand shapes.
///
/// The dtype is taken from whichever operand knows it; operands disagreeing
/// on dtype are rejected.
pub fn binary_broadcast_shape(ctx: &ShapeCtx) -> Result<Vec<TensorType>> {
    if ctx.operand_count() < 2 {
        return Err(Error::ShapeInference(format!(
            "{} requires two operands",
            ctx.op.kind
        )));
    }

    let lhs = ctx.operand_type(0)?;
    let rhs = ctx.operand_type(1)?;

    let dtype = match (lhs.dtype, rhs.dtype) {
        (Some(a), Some(b)) if a != b => {
            return Err(Error::ShapeInference(format!(
                "{} operands disagree on dtype: {:?} vs {:?}",
                ctx.op.kind, a, b
            )));
        }
        (a, b) => a.or(b),
    };

    Ok(vec![TensorType {
        dtype,
        shape: broadcast_shape(&lhs.shape, &rhs.shape)?,
    }])
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowgraph_core::{DataType, Dim, Module, NewOp, Shape};

    fn infer(kind: &str, operands: &[TensorType]) -> Result<Vec<TensorType>> {
        let mut module = Module::new();
        let graph = module.graph();
        let mut values = Vec::new();
        for ty in operands {
            let op = module
                .append_op(graph, NewOp::new("Placeholder").result(ty.clone()))
                .unwrap();
            values.push(module.result(op, 0).unwrap());
        }
        let op = module
            .append_op(
                graph,
                NewOp::new(kind).operands(values).result(TensorType::unknown()),
            )
            .unwrap();
        let ctx = ShapeCtx::new(module.op(op).unwrap(), &module, 0);
        if kind == "Relu" {
            unary_shape(&ctx)
        } else {
            binary_broadcast_shape(&ctx)
        }
    }

    #[test]
    fn test_unary_keeps_type() {
        let ty = TensorType::fixed(DataType::F32, &[2, 3]);
        assert_eq!(infer("Relu", &[ty.clone()]).unwrap(), vec![ty]);
    }

    #[test]
    fn test_binary_broadcasts() {
        let a = TensorType::fixed(DataType::F32, &[4, 3]);
        let b = TensorType::new(DataType::F32, Shape::Ranked(vec![Dim::Dynamic]));
        let out = infer("Add", &[a, b]).unwrap();
        assert_eq!(out, vec![TensorType::fixed(DataType::F32, &[4, 3])]);
    }

    #[test]
    fn test_binary_dtype_conflict() {
        let a = TensorType::fixed(DataType::F32, &[2]);
        let b = TensorType::fixed(DataType::I32, &[2]);
        assert!(infer("Mul", &[a, b]).is_err());
    }
}
