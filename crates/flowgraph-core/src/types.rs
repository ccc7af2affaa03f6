//! Core types for tensor element types, shapes, and constant values.
//!
//! Tensor types form a refinement lattice: the opaque type (unknown dtype,
//! unranked) is the top element, and every refinement adds information
//! (a dtype, a rank, a static dimension). Passes only ever move a value's type
//! downwards in this lattice.

use crate::{Error, Result};
use std::fmt;

/// Element data types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    F16,
    F32,
    F64,
    I8,
    I32,
    I64,
    U8,
    Bool,
    String,
    Resource,
    Variant,
}

impl DataType {
    /// Parse a TensorFlow-style dtype name (`DT_FLOAT`, `float32`, ...).
    pub fn from_name(name: &str) -> Option<Self> {
        let ty = match name {
            "DT_HALF" | "f16" | "float16" => DataType::F16,
            "DT_FLOAT" | "f32" | "float32" => DataType::F32,
            "DT_DOUBLE" | "f64" | "float64" => DataType::F64,
            "DT_INT8" | "i8" | "int8" => DataType::I8,
            "DT_INT32" | "i32" | "int32" => DataType::I32,
            "DT_INT64" | "i64" | "int64" => DataType::I64,
            "DT_UINT8" | "u8" | "uint8" => DataType::U8,
            "DT_BOOL" | "bool" => DataType::Bool,
            "DT_STRING" | "string" => DataType::String,
            "DT_RESOURCE" | "resource" => DataType::Resource,
            "DT_VARIANT" | "variant" => DataType::Variant,
            _ => return None,
        };
        Some(ty)
    }
}

/// A single dimension of a ranked shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dim {
    /// Known at compile time.
    Static(usize),
    /// Unknown size.
    Dynamic,
}

impl Dim {
    /// Get the static size if known.
    pub fn as_static(&self) -> Option<usize> {
        match self {
            Dim::Static(n) => Some(*n),
            Dim::Dynamic => None,
        }
    }

    fn meet(self, other: Dim) -> Option<Dim> {
        match (self, other) {
            (Dim::Dynamic, d) | (d, Dim::Dynamic) => Some(d),
            (Dim::Static(a), Dim::Static(b)) if a == b => Some(Dim::Static(a)),
            _ => None,
        }
    }

    fn join(self, other: Dim) -> Dim {
        if self == other { self } else { Dim::Dynamic }
    }
}

impl fmt::Display for Dim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dim::Static(n) => write!(f, "{n}"),
            Dim::Dynamic => write!(f, "?"),
        }
    }
}

/// Tensor shape: either unranked or a list of (possibly unknown) dimensions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum Shape {
    /// Rank is unknown.
    #[default]
    Unranked,

    /// Rank is known; individual dimensions may still be dynamic.
    Ranked(Vec<Dim>),
}

impl Shape {
    /// A fully static shape.
    pub fn fixed(dims: &[usize]) -> Self {
        Shape::Ranked(dims.iter().map(|&d| Dim::Static(d)).collect())
    }

    /// A scalar (rank 0) shape.
    pub fn scalar() -> Self {
        Shape::Ranked(Vec::new())
    }

    /// Check if the rank is known.
    pub fn is_ranked(&self) -> bool {
        matches!(self, Shape::Ranked(_))
    }

    /// Number of dimensions, if known.
    pub fn rank(&self) -> Option<usize> {
        match self {
            Shape::Ranked(dims) => Some(dims.len()),
            Shape::Unranked => None,
        }
    }

    /// Dimensions, if ranked.
    pub fn dims(&self) -> Option<&[Dim]> {
        match self {
            Shape::Ranked(dims) => Some(dims),
            Shape::Unranked => None,
        }
    }

    /// Get static dimensions if every dimension is known.
    pub fn as_static(&self) -> Option<Vec<usize>> {
        self.dims()?.iter().map(Dim::as_static).collect()
    }

    /// Number of elements, if the shape is fully static.
    ///
    /// Returns `None` when the count does not fit in `usize`.
    pub fn num_elements(&self) -> Option<usize> {
        self.as_static()?
            .iter()
            .try_fold(1usize, |acc, &d| acc.checked_mul(d))
    }

    /// Greatest lower bound: the most specific shape compatible with both.
    ///
    /// Returns `None` when the shapes contradict each other.
    pub fn meet(&self, other: &Shape) -> Option<Shape> {
        match (self, other) {
            (Shape::Unranked, s) | (s, Shape::Unranked) => Some(s.clone()),
            (Shape::Ranked(a), Shape::Ranked(b)) => {
                if a.len() != b.len() {
                    return None;
                }
                a.iter()
                    .zip(b)
                    .map(|(x, y)| x.meet(*y))
                    .collect::<Option<Vec<_>>>()
                    .map(Shape::Ranked)
            }
        }
    }

    /// Least upper bound: the most specific shape describing both.
    pub fn join(&self, other: &Shape) -> Shape {
        match (self, other) {
            (Shape::Ranked(a), Shape::Ranked(b)) if a.len() == b.len() => {
                Shape::Ranked(a.iter().zip(b).map(|(x, y)| x.join(*y)).collect())
            }
            _ => Shape::Unranked,
        }
    }

    /// Check that `self` carries at least the information of `other`.
    pub fn refines(&self, other: &Shape) -> bool {
        self.meet(other).as_ref() == Some(self)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Shape::Unranked => write!(f, "*"),
            Shape::Ranked(dims) => {
                write!(f, "[")?;
                for (i, d) in dims.iter().enumerate() {
                    if i > 0 {
                        write!(f, "x")?;
                    }
                    write!(f, "{d}")?;
                }
                write!(f, "]")
            }
        }
    }
}

/// Type of a value: element type plus shape, each of which may be unknown.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct TensorType {
    /// Element type, if known.
    pub dtype: Option<DataType>,

    /// Shape (possibly unranked).
    pub shape: Shape,
}

impl TensorType {
    /// The opaque type: nothing known.
    pub fn unknown() -> Self {
        Self::default()
    }

    /// A type with a known dtype and shape.
    pub fn new(dtype: DataType, shape: Shape) -> Self {
        Self {
            dtype: Some(dtype),
            shape,
        }
    }

    /// A type with a known dtype and unknown rank.
    pub fn unranked(dtype: DataType) -> Self {
        Self::new(dtype, Shape::Unranked)
    }

    /// A fully static type.
    pub fn fixed(dtype: DataType, dims: &[usize]) -> Self {
        Self::new(dtype, Shape::fixed(dims))
    }

    /// Check whether this type carries more than the opaque form.
    pub fn is_refined(&self) -> bool {
        self.dtype.is_some() || self.shape.is_ranked()
    }

    /// Greatest lower bound of two types, `None` if they contradict.
    pub fn meet(&self, other: &TensorType) -> Option<TensorType> {
        let dtype = match (self.dtype, other.dtype) {
            (Some(a), Some(b)) if a != b => return None,
            (a, b) => a.or(b),
        };
        Some(TensorType {
            dtype,
            shape: self.shape.meet(&other.shape)?,
        })
    }

    /// Least upper bound of two types.
    pub fn join(&self, other: &TensorType) -> TensorType {
        TensorType {
            dtype: if self.dtype == other.dtype {
                self.dtype
            } else {
                None
            },
            shape: self.shape.join(&other.shape),
        }
    }

    /// Check that `self` is at least as specific as `other`.
    pub fn refines(&self, other: &TensorType) -> bool {
        self.meet(other).as_ref() == Some(self)
    }
}

impl fmt::Display for TensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.dtype {
            Some(dtype) => write!(f, "tensor<{}{:?}>", self.shape, dtype),
            None => write!(f, "tensor<{}?>", self.shape),
        }
    }
}

/// Raw tensor data for constant values.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    I64(Vec<i64>),
    I32(Vec<i32>),
    F32(Vec<f32>),
    Bool(Vec<bool>),
    U8(Vec<u8>),
}

impl TensorData {
    /// Get the number of elements in this tensor data.
    pub fn len(&self) -> usize {
        match self {
            TensorData::I64(v) => v.len(),
            TensorData::I32(v) => v.len(),
            TensorData::F32(v) => v.len(),
            TensorData::Bool(v) => v.len(),
            TensorData::U8(v) => v.len(),
        }
    }

    /// Check if this tensor data is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get the data type of the elements.
    pub fn dtype(&self) -> DataType {
        match self {
            TensorData::I64(_) => DataType::I64,
            TensorData::I32(_) => DataType::I32,
            TensorData::F32(_) => DataType::F32,
            TensorData::Bool(_) => DataType::Bool,
            TensorData::U8(_) => DataType::U8,
        }
    }

    /// Interpret integer data as `i64` values.
    pub fn to_i64_vec(&self) -> Option<Vec<i64>> {
        match self {
            TensorData::I64(v) => Some(v.clone()),
            TensorData::I32(v) => Some(v.iter().map(|&x| x as i64).collect()),
            TensorData::U8(v) => Some(v.iter().map(|&x| x as i64).collect()),
            _ => None,
        }
    }
}

/// A tensor value known at compile time (the payload of `Const` ops).
///
/// Only small tensors are meant to be inspected by passes; the numeric
/// evaluator that produces larger folded values lives outside this crate.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorValue {
    /// The raw tensor data.
    pub data: TensorData,

    /// The shape of the tensor.
    pub shape: Vec<usize>,
}

impl TensorValue {
    /// Create a value, checking that the data length matches the shape.
    pub fn new(data: TensorData, shape: Vec<usize>) -> Result<Self> {
        let expected = shape
            .iter()
            .try_fold(1usize, |acc, &d| acc.checked_mul(d))
            .ok_or_else(|| Error::Attribute(format!("Shape {:?} is too large", shape)))?;
        if data.len() != expected {
            return Err(Error::Attribute(format!(
                "Data length {} doesn't match shape {:?} (product = {})",
                data.len(),
                shape,
                expected
            )));
        }
        Ok(Self { data, shape })
    }

    /// Create a scalar value (shape = []).
    pub fn scalar(data: TensorData) -> Result<Self> {
        Self::new(data, Vec::new())
    }

    /// Create a 1-D value from its data.
    pub fn vector(data: TensorData) -> Self {
        let len = data.len();
        Self {
            data,
            shape: vec![len],
        }
    }

    /// Element type.
    pub fn dtype(&self) -> DataType {
        self.data.dtype()
    }

    /// Number of elements.
    pub fn num_elements(&self) -> usize {
        self.data.len()
    }

    /// The fully static type of this value.
    pub fn tensor_type(&self) -> TensorType {
        TensorType::fixed(self.dtype(), &self.shape)
    }
}
