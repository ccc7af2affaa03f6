//! Shape functions for tensor construction and manipulation kinds.

use flowgraph_core::{DataType, Dim, Error, Result, Shape, ShapeCtx, TensorType};

/// Graph versions below this treat a scalar `Placeholder` shape as unknown.
const SCALAR_SHAPE_MEANS_UNKNOWN_BEFORE: u32 = 21;

/// `Const`: the type of its `value` attribute.
pub fn const_shape(ctx: &ShapeCtx) -> Result<Vec<TensorType>> {
    Ok(vec![ctx.attr_tensor("value")?.tensor_type()])
}

/// `Placeholder`: declared by its `dtype` and `shape` attributes.
pub fn placeholder_shape(ctx: &ShapeCtx) -> Result<Vec<TensorType>> {
    let dtype = ctx.attr_type("dtype").ok();
    let mut shape = ctx.attr_shape("shape").cloned().unwrap_or_default();

    // Older producers wrote an empty shape when the shape was unknown.
    let version = ctx.graph_version();
    if version != 0 && version < SCALAR_SHAPE_MEANS_UNKNOWN_BEFORE && shape.rank() == Some(0) {
        shape = Shape::Unranked;
    }

    Ok(vec![TensorType { dtype, shape }])
}

/// `Cast`: operand shape with the `DstT` element type.
pub fn cast_shape(ctx: &ShapeCtx) -> Result<Vec<TensorType>> {
    Ok(vec![TensorType {
        dtype: ctx.attr_type("DstT").ok(),
        shape: ctx.operand_shape(0)?.clone(),
    }])
}

/// `Shape`: a vector holding the operand's rank.
pub fn shape_of_shape(ctx: &ShapeCtx) -> Result<Vec<TensorType>> {
    let dtype = ctx.attr_type("out_type").unwrap_or(DataType::I64);
    let len = match ctx.operand_shape(0)?.rank() {
        Some(rank) => Dim::Static(rank),
        None => Dim::Dynamic,
    };
    Ok(vec![TensorType::new(dtype, Shape::Ranked(vec![len]))])
}

/// `Reshape`: target shape from the statically known shape operand.
///
/// A single `-1` entry is resolved when the input's element count is known.
/// Without a known shape value, the rank still follows from a static-length
/// shape operand.
pub fn reshape_shape(ctx: &ShapeCtx) -> Result<Vec<TensorType>> {
    let dtype = ctx.operand_dtype(0)?;

    let Some(target) = ctx.operand_value(1) else {
        let shape = match ctx.operand_shape(1)?.as_static().as_deref() {
            Some([rank]) => Shape::Ranked(vec![Dim::Dynamic; *rank]),
            _ => Shape::Unranked,
        };
        return Ok(vec![TensorType { dtype, shape }]);
    };

    let target = target.data.to_i64_vec().ok_or_else(|| {
        Error::ShapeInference("Reshape shape operand must be an integer tensor".to_string())
    })?;

    if target.iter().filter(|&&d| d == -1).count() > 1 {
        return Err(Error::ShapeInference(format!(
            "Reshape shape {:?} has more than one -1",
            target
        )));
    }

    let mut dims = Vec::with_capacity(target.len());
    for &d in &target {
        match d {
            -1 => dims.push(Dim::Dynamic),
            d if d >= 0 => dims.push(Dim::Static(d as usize)),
            d => {
                return Err(Error::ShapeInference(format!(
                    "Reshape shape dimension {} is invalid",
                    d
                )));
            }
        }
    }

    if let (Some(infer_at), Some(total)) = (
        target.iter().position(|&d| d == -1),
        ctx.operand_shape(0)?.num_elements(),
    ) {
        let known = target
            .iter()
            .filter(|&&d| d >= 0)
            .try_fold(1usize, |acc, &d| acc.checked_mul(d as usize))
            .ok_or_else(|| {
                Error::ShapeInference(format!("Reshape shape {:?} overflows", target))
            })?;
        if known == 0 || total % known != 0 {
            return Err(Error::ShapeInference(format!(
                "Cannot reshape {} elements into {:?}",
                total, target
            )));
        }
        dims[infer_at] = Dim::Static(total / known);
    }

    Ok(vec![TensorType {
        dtype,
        shape: Shape::Ranked(dims),
    }])
}

/// `MatMul` (and fused variants): rank-2 contraction honouring
/// `transpose_a` / `transpose_b`.
pub fn matmul_shape(ctx: &ShapeCtx) -> Result<Vec<TensorType>> {
    if ctx.operand_count() < 2 {
        return Err(Error::ShapeInference(format!(
            "{} requires two operands",
            ctx.op.kind
        )));
    }

    let a = ctx.operand_type(0)?;
    let b = ctx.operand_type(1)?;
    let dtype = a.dtype.or(b.dtype);

    let rows = match a.shape.dims() {
        Some([r, c]) => Some(if ctx.attr_flag("transpose_a") { *c } else { *r }),
        Some(dims) => {
            return Err(Error::ShapeInference(format!(
                "{} expects rank-2 operands, got rank {}",
                ctx.op.kind,
                dims.len()
            )));
        }
        None => None,
    };
    let cols = match b.shape.dims() {
        Some([r, c]) => Some(if ctx.attr_flag("transpose_b") { *r } else { *c }),
        Some(dims) => {
            return Err(Error::ShapeInference(format!(
                "{} expects rank-2 operands, got rank {}",
                ctx.op.kind,
                dims.len()
            )));
        }
        None => None,
    };

    Ok(vec![TensorType {
        dtype,
        shape: Shape::Ranked(vec![
            rows.unwrap_or(Dim::Dynamic),
            cols.unwrap_or(Dim::Dynamic),
        ]),
    }])
}
