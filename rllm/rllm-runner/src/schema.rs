//! Explicit field schemas for broadcastable records.
//!
//! Every record that crosses a broadcast boundary declares its fields once,
//! as a constant [`RecordSchema`]. Extraction walks that list: declared fields
//! are popped out of the incoming map and kind-checked, everything else is
//! left for the next stage (or ignored).

use crate::{
    errors::RunnerError,
    value::{FromValue, Rejected, Value},
    HashMap, TensorDict,
};
use anyhow::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldKind {
    Tensor,
    Int,
    Float,
    Bool,
    Str,
    StrList,
    IdMap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    pub required: bool,
}

impl FieldSpec {
    pub const fn required(name: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            kind,
            required: true,
        }
    }

    pub const fn optional(name: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            kind,
            required: false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RecordSchema {
    pub name: &'static str,
    pub fields: &'static [FieldSpec],
}

impl RecordSchema {
    pub fn field_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.fields.iter().map(|f| f.name)
    }

    pub fn required_fields(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.fields.iter().filter(|f| f.required).map(|f| f.name)
    }
}

/// A record with a declared schema that can flatten itself into a
/// [`TensorDict`] and be rebuilt from the fields extracted for it.
pub trait Record: Sized + Send + 'static {
    const SCHEMA: RecordSchema;

    /// Write every present field; only names from `SCHEMA` may be used.
    fn write_fields(&self, dict: &mut TensorDict);

    /// Build the record from its extracted fields. `dict` is the rest of the
    /// working map, where nested records built by earlier stages live.
    fn from_fields(fields: FieldSet, dict: &mut TensorDict) -> Result<Self>;
}

/// Fields popped out of a map for one record, already kind-checked.
#[derive(Debug)]
pub struct FieldSet {
    record: &'static str,
    values: HashMap<&'static str, Value>,
}

impl FieldSet {
    pub(crate) fn new(record: &'static str) -> Self {
        Self {
            record,
            values: HashMap::default(),
        }
    }

    pub(crate) fn insert(&mut self, field: &'static str, value: Value) {
        self.values.insert(field, value);
    }

    pub fn record(&self) -> &'static str {
        self.record
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn optional<T: FromValue>(&mut self, field: &'static str) -> Result<Option<T>> {
        match self.values.remove(field) {
            None => Ok(None),
            Some(v) => match T::from_value(v) {
                Ok(x) => Ok(Some(x)),
                Err(Rejected::WrongKind(v)) => Err(RunnerError::FieldType {
                    record: self.record,
                    field,
                    expected: T::KIND,
                    found: v.kind(),
                }
                .into()),
                Err(Rejected::OutOfRange(value)) => Err(RunnerError::FieldRange {
                    record: self.record,
                    field,
                    value,
                }
                .into()),
            },
        }
    }

    pub fn required<T: FromValue>(&mut self, field: &'static str) -> Result<T> {
        match self.optional(field)? {
            Some(x) => Ok(x),
            None => Err(RunnerError::MissingField {
                record: self.record,
                field,
            }
            .into()),
        }
    }
}
