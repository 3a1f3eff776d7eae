use crate::{
    errors::RunnerError,
    schema::{FieldSet, RecordSchema},
    value::Value,
    Device, HashMap,
};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::{any::Any, collections::BTreeMap, fmt::Debug};

/// The flat, string-keyed map that crosses a broadcast boundary.
///
/// Only `values` is serialized. While a record is being rebuilt, nested
/// records produced by earlier extraction stages are parked in a typed side
/// table under well-known keys; they never leave the process.
#[derive(Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TensorDict {
    values: BTreeMap<String, Value>,
    #[serde(skip)]
    records: HashMap<&'static str, Box<dyn Any + Send>>,
}

impl TensorDict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.values.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(|k| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn extend(&mut self, other: TensorDict) {
        self.values.extend(other.values);
    }

    /// Move every tensor value onto `device`.
    pub fn to_device(self, device: &Device) -> Result<Self> {
        let mut values = BTreeMap::new();
        for (k, v) in self.values {
            let v = match v {
                Value::Tensor(t) => Value::Tensor(t.to_device(device)?),
                other => other,
            };
            values.insert(k, v);
        }
        Ok(Self {
            values,
            records: self.records,
        })
    }

    /// Nest `other` under `prefix`: every key `k` becomes `{prefix}{k}`.
    pub fn extend_prefixed(&mut self, prefix: &str, other: TensorDict) {
        for (k, v) in other.values {
            self.values.insert(format!("{}{}", prefix, k), v);
        }
    }

    /// Pop every key starting with `prefix`, returned with the prefix
    /// stripped.
    pub fn split_prefixed(&mut self, prefix: &str) -> TensorDict {
        let keys = self
            .values
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect::<Vec<_>>();
        let mut r = TensorDict::new();
        for k in keys {
            if let Some(v) = self.values.remove(&k) {
                r.values.insert(k[prefix.len()..].to_string(), v);
            }
        }
        r
    }

    /// Pop the fields declared by `schema`.
    ///
    /// Unknown keys stay in the map. Fails on the first required field that
    /// is absent and on any declared field with the wrong kind.
    pub fn pop_fields(&mut self, schema: &RecordSchema) -> Result<FieldSet> {
        let mut fields = FieldSet::new(schema.name);
        for spec in schema.fields {
            match self.values.remove(spec.name) {
                Some(v) => {
                    if v.kind() != spec.kind {
                        return Err(RunnerError::FieldType {
                            record: schema.name,
                            field: spec.name,
                            expected: spec.kind,
                            found: v.kind(),
                        }
                        .into());
                    }
                    fields.insert(spec.name, v);
                }
                None if spec.required => {
                    return Err(RunnerError::MissingField {
                        record: schema.name,
                        field: spec.name,
                    }
                    .into());
                }
                None => {}
            }
        }
        log::trace!("{}: extracted {} fields", schema.name, fields.len());
        Ok(fields)
    }

    pub fn insert_record<T: Any + Send>(&mut self, key: &'static str, record: T) {
        self.records.insert(key, Box::new(record));
    }

    pub fn has_record(&self, key: &str) -> bool {
        self.records.contains_key(key)
    }

    pub fn take_record<T: Any + Send>(&mut self, key: &'static str) -> Result<Option<T>> {
        match self.records.remove(key) {
            None => Ok(None),
            Some(b) => match b.downcast::<T>() {
                Ok(r) => Ok(Some(*r)),
                Err(_) => Err(RunnerError::RecordType { key }.into()),
            },
        }
    }
}

// nested records are local to one reconstruction pass and are not cloned
impl Clone for TensorDict {
    fn clone(&self) -> Self {
        Self {
            values: self.values.clone(),
            records: HashMap::default(),
        }
    }
}

impl PartialEq for TensorDict {
    fn eq(&self, other: &Self) -> bool {
        self.values == other.values
    }
}

impl Debug for TensorDict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut d = f.debug_struct("TensorDict");
        d.field("values", &self.values);
        if !self.records.is_empty() {
            d.field("records", &self.records.keys().collect::<Vec<_>>());
        }
        d.finish()
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for TensorDict {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut r = Self::new();
        for (k, v) in iter {
            r.insert(k, v);
        }
        r
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        schema::{FieldKind, FieldSpec},
        Tensor,
    };

    const SCHEMA: RecordSchema = RecordSchema {
        name: "Point",
        fields: &[
            FieldSpec::required("a", FieldKind::Int),
            FieldSpec::optional("b", FieldKind::Tensor),
        ],
    };

    #[test]
    fn pop_leaves_unknown_keys() {
        let mut d = TensorDict::new();
        d.insert("a", 1usize);
        d.insert("zzz", "extra");
        let mut f = d.pop_fields(&SCHEMA).unwrap();
        assert_eq!(f.required::<i64>("a").unwrap(), 1);
        assert!(f.optional::<Tensor>("b").unwrap().is_none());
        assert_eq!(d.keys().collect::<Vec<_>>(), vec!["zzz"]);
    }

    #[test]
    fn pop_checks_kind() {
        let mut d = TensorDict::new();
        d.insert("a", true);
        let err = d.pop_fields(&SCHEMA).unwrap_err();
        assert_eq!(
            RunnerError::from_anyhow(&err),
            Some(&RunnerError::FieldType {
                record: "Point",
                field: "a",
                expected: FieldKind::Int,
                found: FieldKind::Bool,
            })
        );
    }

    #[test]
    fn negative_count_is_out_of_range() {
        let mut d = TensorDict::new();
        d.insert("a", -3i64);
        let mut f = d.pop_fields(&SCHEMA).unwrap();
        let err = f.required::<usize>("a").unwrap_err();
        assert_eq!(
            RunnerError::from_anyhow(&err),
            Some(&RunnerError::FieldRange {
                record: "Point",
                field: "a",
                value: -3,
            })
        );
        assert_eq!(
            format!("{}", err),
            "Point: field 'a' is out of range: -3"
        );
    }

    #[test]
    fn prefixed_keys_split_back_out() {
        let mut inner = TensorDict::new();
        inner.insert("a", 1usize);
        inner.insert("b", "x");
        let mut d = TensorDict::new();
        d.insert("a", 2usize);
        d.extend_prefixed("step.", inner.clone());
        assert_eq!(d.len(), 3);

        assert_eq!(d.split_prefixed("step."), inner);
        assert_eq!(d.keys().collect::<Vec<_>>(), vec!["a"]);
        assert!(d.split_prefixed("step.").is_empty());
    }

    #[test]
    fn tensors_move_and_compare_by_contents() {
        let t = crate::tensor::from_vec1(vec![1u32, 2, 3], &Device::Cpu).unwrap();
        let mut d = TensorDict::new();
        d.insert("t", t.clone());
        let d = d.to_device(&Device::Cpu).unwrap();
        assert_eq!(d.get("t"), Some(&Value::Tensor(t)));
        let other = crate::tensor::from_vec1(vec![1i64, 2, 3], &Device::Cpu).unwrap();
        assert_ne!(d.get("t"), Some(&Value::Tensor(other)));
    }

    #[test]
    fn records_are_typed() {
        let mut d = TensorDict::new();
        d.insert_record("x", 5u32);
        assert!(d.take_record::<String>("x").is_err());
        d.insert_record("x", 5u32);
        assert_eq!(d.take_record::<u32>("x").unwrap(), Some(5));
        assert_eq!(d.take_record::<u32>("x").unwrap(), None);
    }
}
