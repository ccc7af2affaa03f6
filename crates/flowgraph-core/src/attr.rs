//! Typed attribute store attached to operations, functions, arguments and results.
//!
//! Attribute names starting with `_` are *unregistered*: they carry advisory
//! or derivable information (inferred shapes, colocation hints) and any pass
//! may add, read or drop them without affecting correctness.

use crate::types::{DataType, Shape, TensorValue};
use crate::{Error, Result};
use std::collections::BTreeMap;

/// Unregistered attribute carrying inferred result shapes (one per result).
pub const OUTPUT_SHAPES_ATTR: &str = "_output_shapes";

/// Unregistered function attribute carrying argument shapes (one per argument).
pub const INPUT_SHAPES_ATTR: &str = "_input_shapes";

/// Unregistered attribute carrying an XLA sharding annotation.
pub const SHARDING_ATTR: &str = "_XlaSharding";

/// Check whether an attribute name follows the unregistered convention.
pub fn is_unregistered(name: &str) -> bool {
    name.starts_with('_')
}

/// Attribute value types.
#[derive(Debug, Clone, PartialEq)]
pub enum Attribute {
    Bool(bool),
    Int(i64),
    Float(f32),
    String(String),
    Type(DataType),
    Shape(Shape),
    Shapes(Vec<Shape>),
    Tensor(TensorValue),
    Ints(Vec<i64>),
    Strings(Vec<String>),
    List(Vec<Attribute>),
}

impl Attribute {
    /// Short name of the variant, for error messages.
    fn kind(&self) -> &'static str {
        match self {
            Attribute::Bool(_) => "bool",
            Attribute::Int(_) => "int",
            Attribute::Float(_) => "float",
            Attribute::String(_) => "string",
            Attribute::Type(_) => "type",
            Attribute::Shape(_) => "shape",
            Attribute::Shapes(_) => "shape list",
            Attribute::Tensor(_) => "tensor",
            Attribute::Ints(_) => "int list",
            Attribute::Strings(_) => "string list",
            Attribute::List(_) => "list",
        }
    }
}

impl From<bool> for Attribute {
    fn from(v: bool) -> Self {
        Attribute::Bool(v)
    }
}

impl From<i64> for Attribute {
    fn from(v: i64) -> Self {
        Attribute::Int(v)
    }
}

impl From<&str> for Attribute {
    fn from(v: &str) -> Self {
        Attribute::String(v.to_string())
    }
}

impl From<String> for Attribute {
    fn from(v: String) -> Self {
        Attribute::String(v)
    }
}

impl From<DataType> for Attribute {
    fn from(v: DataType) -> Self {
        Attribute::Type(v)
    }
}

impl From<Shape> for Attribute {
    fn from(v: Shape) -> Self {
        Attribute::Shape(v)
    }
}

impl From<TensorValue> for Attribute {
    fn from(v: TensorValue) -> Self {
        Attribute::Tensor(v)
    }
}

/// An ordered set of named attributes.
///
/// Iteration order is by name, so two attribute sets compare equal regardless
/// of the order in which their entries were inserted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Attributes {
    entries: BTreeMap<String, Attribute>,
}

impl Attributes {
    /// Create an empty attribute set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set an attribute, returning the previous value.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Attribute>) -> Option<Attribute> {
        self.entries.insert(name.into(), value.into())
    }

    /// Get an attribute.
    pub fn get(&self, name: &str) -> Option<&Attribute> {
        self.entries.get(name)
    }

    /// Remove an attribute, returning it if it was present.
    pub fn remove(&mut self, name: &str) -> Option<Attribute> {
        self.entries.remove(name)
    }

    /// Check if an attribute exists.
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Number of attributes.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the set is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over `(name, value)` pairs in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Attribute)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Drop every unregistered attribute.
    pub fn retain_registered(&mut self) {
        self.entries.retain(|k, _| !is_unregistered(k));
    }

    // --- Typed accessors ---

    fn require(&self, name: &str) -> Result<&Attribute> {
        self.get(name)
            .ok_or_else(|| Error::Attribute(format!("Missing attribute: {}", name)))
    }

    fn mismatch(name: &str, expected: &str, actual: &Attribute) -> Error {
        Error::Attribute(format!(
            "Attribute {} is not a {} (found {})",
            name,
            expected,
            actual.kind()
        ))
    }

    /// Get a bool attribute.
    pub fn get_bool(&self, name: &str) -> Result<bool> {
        match self.require(name)? {
            Attribute::Bool(v) => Ok(*v),
            other => Err(Self::mismatch(name, "bool", other)),
        }
    }

    /// Get a bool attribute, or a default when absent or mistyped.
    pub fn bool_or(&self, name: &str, default: bool) -> bool {
        self.get_bool(name).unwrap_or(default)
    }

    /// Get an int attribute.
    pub fn get_int(&self, name: &str) -> Result<i64> {
        match self.require(name)? {
            Attribute::Int(v) => Ok(*v),
            other => Err(Self::mismatch(name, "int", other)),
        }
    }

    /// Get a string attribute.
    pub fn get_str(&self, name: &str) -> Result<&str> {
        match self.require(name)? {
            Attribute::String(v) => Ok(v.as_str()),
            other => Err(Self::mismatch(name, "string", other)),
        }
    }

    /// Get a dtype attribute.
    ///
    /// String values naming a dtype are accepted, since importers sometimes
    /// keep the textual form.
    pub fn get_type(&self, name: &str) -> Result<DataType> {
        match self.require(name)? {
            Attribute::Type(v) => Ok(*v),
            Attribute::String(s) => DataType::from_name(s)
                .ok_or_else(|| Error::Attribute(format!("Unknown dtype '{}' in {}", s, name))),
            other => Err(Self::mismatch(name, "type", other)),
        }
    }

    /// Get a shape attribute.
    pub fn get_shape(&self, name: &str) -> Result<&Shape> {
        match self.require(name)? {
            Attribute::Shape(v) => Ok(v),
            other => Err(Self::mismatch(name, "shape", other)),
        }
    }

    /// Get a shape-list attribute.
    pub fn get_shapes(&self, name: &str) -> Result<&[Shape]> {
        match self.require(name)? {
            Attribute::Shapes(v) => Ok(v.as_slice()),
            other => Err(Self::mismatch(name, "shape list", other)),
        }
    }

    /// Get a tensor attribute.
    pub fn get_tensor(&self, name: &str) -> Result<&TensorValue> {
        match self.require(name)? {
            Attribute::Tensor(v) => Ok(v),
            other => Err(Self::mismatch(name, "tensor", other)),
        }
    }

    /// Get an int-list attribute.
    pub fn get_ints(&self, name: &str) -> Result<&[i64]> {
        match self.require(name)? {
            Attribute::Ints(v) => Ok(v.as_slice()),
            other => Err(Self::mismatch(name, "int list", other)),
        }
    }

    /// Get a string-list attribute.
    pub fn get_strings(&self, name: &str) -> Result<&[String]> {
        match self.require(name)? {
            Attribute::Strings(v) => Ok(v.as_slice()),
            other => Err(Self::mismatch(name, "string list", other)),
        }
    }
}

impl<K: Into<String>, V: Into<Attribute>> FromIterator<(K, V)> for Attributes {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut attrs = Attributes::new();
        for (k, v) in iter {
            attrs.set(k, v);
        }
        attrs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_accessors() {
        let mut attrs = Attributes::new();
        attrs.set("transpose_a", true);
        attrs.set("T", DataType::F32);
        attrs.set("DstT", "DT_INT32");
        attrs.set(OUTPUT_SHAPES_ATTR, Attribute::Shapes(vec![Shape::fixed(&[2])]));

        assert!(attrs.get_bool("transpose_a").unwrap());
        assert_eq!(attrs.get_type("T").unwrap(), DataType::F32);
        assert_eq!(attrs.get_type("DstT").unwrap(), DataType::I32);
        assert_eq!(attrs.get_shapes(OUTPUT_SHAPES_ATTR).unwrap().len(), 1);
        assert!(attrs.get_int("transpose_a").is_err());
        assert!(attrs.get_int("missing").is_err());
        assert!(!attrs.bool_or("transpose_b", false));
    }

    #[test]
    fn test_insertion_order_does_not_matter() {
        let a: Attributes = [("x", 1i64), ("y", 2i64)].into_iter().collect();
        let b: Attributes = [("y", 2i64), ("x", 1i64)].into_iter().collect();
        assert_eq!(a, b);
    }

    #[test]
    fn test_retain_registered() {
        let mut attrs = Attributes::new();
        attrs.set("dtype", DataType::F32);
        attrs.set("_class", "loc:@x");
        attrs.retain_registered();
        assert!(attrs.contains("dtype"));
        assert!(!attrs.contains("_class"));
        assert!(is_unregistered(OUTPUT_SHAPES_ATTR));
    }
}
