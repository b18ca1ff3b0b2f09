//! Relation schemes: ordered `(name, type)` pairs.
//!
//! Names are unique within one scheme. Concatenating two schemes (the
//! output of a join or cross product) suffixes `1` onto a clashing name
//! until it is unique again.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Attribute type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Int64,
    Float64,
    String,
    Bool,
}

impl DataType {
    pub fn is_numeric(self) -> bool {
        matches!(self, DataType::Int64 | DataType::Float64)
    }

    /// Type name used in generated code
    pub fn code_name(self) -> &'static str {
        match self {
            DataType::Int64 => "int64",
            DataType::Float64 => "float64",
            // strings are interned into an index and carried as ids
            DataType::String => "string_id",
            DataType::Bool => "bool",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::Int64 => "int",
            DataType::Float64 => "float",
            DataType::String => "string",
            DataType::Bool => "bool",
        };
        write!(f, "{name}")
    }
}

/// Output shape of an operator
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Scheme {
    attributes: Vec<(String, DataType)>,
}

impl Scheme {
    /// Build a scheme, renaming clashing names
    pub fn new(attributes: Vec<(String, DataType)>) -> Self {
        let mut scheme = Scheme::default();
        for (name, data_type) in attributes {
            scheme.push(name, data_type);
        }
        scheme
    }

    pub fn from_pairs(attributes: &[(&str, DataType)]) -> Self {
        Self::new(
            attributes
                .iter()
                .map(|(name, t)| ((*name).to_string(), *t))
                .collect(),
        )
    }

    /// Append an attribute, suffixing `1` to the name while it clashes
    pub fn push(&mut self, name: impl Into<String>, data_type: DataType) {
        let mut name = name.into();
        while self.position(&name).is_some() {
            name.push('1');
        }
        self.attributes.push((name, data_type));
    }

    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, DataType)> {
        self.attributes.iter()
    }

    pub fn name(&self, position: usize) -> Option<&str> {
        self.attributes.get(position).map(|(n, _)| n.as_str())
    }

    pub fn data_type(&self, position: usize) -> Option<DataType> {
        self.attributes.get(position).map(|(_, t)| *t)
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.attributes.iter().position(|(n, _)| n == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.attributes.iter().map(|(n, _)| n.as_str()).collect()
    }

    pub fn types(&self) -> Vec<DataType> {
        self.attributes.iter().map(|(_, t)| *t).collect()
    }

    /// Join/cross-product scheme: `self` followed by `other`
    pub fn concat(&self, other: &Scheme) -> Scheme {
        let mut out = self.clone();
        for (name, data_type) in &other.attributes {
            out.push(name.clone(), *data_type);
        }
        out
    }

    /// Same arity and same types in the same order; names are ignored
    pub fn compatible(&self, other: &Scheme) -> bool {
        self.len() == other.len() && self.types() == other.types()
    }

    /// Scheme of the attributes at `positions`, in that order
    pub fn project(&self, positions: &[usize]) -> Option<Scheme> {
        let mut out = Scheme::default();
        for &p in positions {
            let (name, data_type) = self.attributes.get(p)?;
            out.push(name.clone(), *data_type);
        }
        Some(out)
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, (name, data_type)) in self.attributes.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{name}:{data_type}")?;
        }
        write!(f, ")")
    }
}
