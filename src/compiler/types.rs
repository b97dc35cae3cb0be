//! Expression types assigned by the checker.

use std::fmt;

use crate::metrics::ValueType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Type {
    /// Untyped: statements and expressions with no value.
    #[default]
    None,
    Bool,
    Int,
    Float,
    String,
    /// A regular expression usable as a match condition.
    Pattern,
    /// Poisoned by an earlier error; suppresses cascading diagnostics.
    Error,
}

impl Type {
    pub fn is_numeric(self) -> bool {
        matches!(self, Type::Int | Type::Float)
    }

    /// Int, Float or String: anything that can be stored or compared.
    pub fn is_scalar(self) -> bool {
        matches!(self, Type::Int | Type::Float | Type::String)
    }

    /// Usable as a condition.
    pub fn is_condition(self) -> bool {
        matches!(self, Type::Bool | Type::Pattern)
    }
}

impl From<ValueType> for Type {
    fn from(v: ValueType) -> Self {
        match v {
            ValueType::Int => Type::Int,
            ValueType::Float => Type::Float,
            ValueType::String => Type::String,
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Type::None => "none",
            Type::Bool => "bool",
            Type::Int => "int",
            Type::Float => "float",
            Type::String => "string",
            Type::Pattern => "pattern",
            Type::Error => "error",
        };
        f.write_str(s)
    }
}
