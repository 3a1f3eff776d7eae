use crate::{
    schema::FieldKind,
    tensor::{same_contents, Tensor},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// request id -> sequence ids
pub type IdMap = BTreeMap<String, Vec<u64>>;

/// A single entry of a broadcast map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    Tensor(#[serde(with = "crate::tensor::wire")] Tensor),
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    StrList(Vec<String>),
    IdMap(IdMap),
}

impl Value {
    pub fn kind(&self) -> FieldKind {
        match self {
            Value::Tensor(_) => FieldKind::Tensor,
            Value::Int(_) => FieldKind::Int,
            Value::Float(_) => FieldKind::Float,
            Value::Bool(_) => FieldKind::Bool,
            Value::Str(_) => FieldKind::Str,
            Value::StrList(_) => FieldKind::StrList,
            Value::IdMap(_) => FieldKind::IdMap,
        }
    }
}

// tensors compare by contents
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Tensor(a), Value::Tensor(b)) => same_contents(a, b),
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::StrList(a), Value::StrList(b)) => a == b,
            (Value::IdMap(a), Value::IdMap(b)) => a == b,
            _ => false,
        }
    }
}

/// Why [`FromValue::from_value`] turned a value down.
#[derive(Debug)]
pub enum Rejected {
    /// Another kind of value; handed back untouched.
    WrongKind(Value),
    /// Right kind, but the target type can't hold it.
    OutOfRange(i64),
}

/// Typed extraction out of a [`Value`].
pub trait FromValue: Sized {
    const KIND: FieldKind;
    fn from_value(v: Value) -> Result<Self, Rejected>;
}

macro_rules! value_conv {
    ($t:ty, $variant:ident) => {
        impl From<$t> for Value {
            fn from(v: $t) -> Self {
                Value::$variant(v)
            }
        }

        impl FromValue for $t {
            const KIND: FieldKind = FieldKind::$variant;

            fn from_value(v: Value) -> Result<Self, Rejected> {
                match v {
                    Value::$variant(x) => Ok(x),
                    other => Err(Rejected::WrongKind(other)),
                }
            }
        }
    };
}

value_conv!(Tensor, Tensor);
value_conv!(i64, Int);
value_conv!(f64, Float);
value_conv!(bool, Bool);
value_conv!(String, Str);
value_conv!(Vec<String>, StrList);
value_conv!(IdMap, IdMap);

impl From<usize> for Value {
    fn from(v: usize) -> Self {
        Value::Int(v as i64)
    }
}

impl FromValue for usize {
    const KIND: FieldKind = FieldKind::Int;

    fn from_value(v: Value) -> Result<Self, Rejected> {
        match v {
            Value::Int(x) => usize::try_from(x).map_err(|_| Rejected::OutOfRange(x)),
            other => Err(Rejected::WrongKind(other)),
        }
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}
