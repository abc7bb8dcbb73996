//! Typed accessors over untrusted JSON.
//!
//! Client payloads are read field by field; every accessor returns `None`
//! when the field is missing or has the wrong type instead of failing.

use serde_json::{Map, Value};

pub trait Loose {
    fn field(&self, key: &str) -> Option<&Value>;

    fn str_field(&self, key: &str) -> Option<&str> {
        self.field(key).and_then(Value::as_str)
    }

    /// String field that is present and not empty.
    fn text_field(&self, key: &str) -> Option<&str> {
        self.str_field(key).filter(|s| !s.is_empty())
    }

    fn bool_field(&self, key: &str) -> Option<bool> {
        self.field(key).and_then(Value::as_bool)
    }

    /// Finite number field.
    fn number_field(&self, key: &str) -> Option<f64> {
        self.field(key)
            .and_then(Value::as_f64)
            .filter(|n| n.is_finite())
    }

    fn u64_field(&self, key: &str) -> Option<u64> {
        self.field(key).and_then(Value::as_u64)
    }

    fn array_field(&self, key: &str) -> Option<&Vec<Value>> {
        self.field(key).and_then(Value::as_array)
    }

    fn object_field(&self, key: &str) -> Option<&Map<String, Value>> {
        self.field(key).and_then(Value::as_object)
    }

    /// Walk nested objects: `path(&["text", "format", "type"])`.
    fn path(&self, keys: &[&str]) -> Option<&Value> {
        let (first, rest) = keys.split_first()?;
        rest.iter()
            .try_fold(self.field(first)?, |value, key| value.get(*key))
    }
}

impl Loose for Value {
    fn field(&self, key: &str) -> Option<&Value> {
        self.as_object()?.get(key)
    }
}

impl Loose for Map<String, Value> {
    fn field(&self, key: &str) -> Option<&Value> {
        self.get(key)
    }
}

/// True for model ids that the upstream cannot stream.
pub fn is_reasoning_model(model: &str) -> bool {
    model.starts_with("o1") || model.starts_with("o3")
}
