//! Broadcasting shape helper for elementwise shape functions.

use crate::types::{Dim, Shape};
use crate::{Error, Result};

/// Compute the NumPy-style broadcast of two shapes.
///
/// Shapes are aligned from the rightmost dimension; missing leading
/// dimensions count as 1. A dynamic dimension broadcast against 1 stays
/// dynamic, and against a static size `n > 1` resolves to `n`. Unranked
/// inputs give an unranked result.
///
/// # Example
///
/// ```text
/// broadcast_shape([2, 3, 4], [3, 4]) -> [2, 3, 4]
/// broadcast_shape([?, 1],    [5])    -> [?, 5]
/// broadcast_shape([2, 3],    *)      -> *
/// ```
pub fn broadcast_shape(a: &Shape, b: &Shape) -> Result<Shape> {
    let (Some(a_dims), Some(b_dims)) = (a.dims(), b.dims()) else {
        return Ok(Shape::Unranked);
    };

    let max_rank = a_dims.len().max(b_dims.len());
    let mut result = Vec::with_capacity(max_rank);

    for i in 0..max_rank {
        let da = if i < max_rank - a_dims.len() {
            Dim::Static(1)
        } else {
            a_dims[i - (max_rank - a_dims.len())]
        };
        let db = if i < max_rank - b_dims.len() {
            Dim::Static(1)
        } else {
            b_dims[i - (max_rank - b_dims.len())]
        };

        let dim = match (da, db) {
            (Dim::Static(x), Dim::Static(y)) if x == y => Dim::Static(x),
            (Dim::Static(1), d) | (d, Dim::Static(1)) => d,
            (Dim::Dynamic, Dim::Static(n)) | (Dim::Static(n), Dim::Dynamic) => Dim::Static(n),
            (Dim::Dynamic, Dim::Dynamic) => Dim::Dynamic,
            (Dim::Static(_), Dim::Static(_)) => {
                return Err(Error::ShapeInference(format!(
                    "Cannot broadcast shapes {} and {} at dimension {i}",
                    a, b
                )));
            }
        };
        result.push(dim);
    }

    Ok(Shape::Ranked(result))
}
