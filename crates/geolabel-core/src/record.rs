//! Endpoint records.

use std::ops::{Deref, DerefMut};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{EnrichError, EnrichResult};

/// One endpoint entry: an arbitrary JSON object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(Map<String, Value>);

impl Record {
    /// String value of `field`, if present and a string.
    pub fn str_field(&self, field: &str) -> Option<&str> {
        self.0.get(field).and_then(Value::as_str)
    }

    /// Identity used in log lines: the label field, else the address field.
    pub fn display_name<'a>(&'a self, label_field: &str, address_field: &str) -> &'a str {
        self.str_field(label_field)
            .or_else(|| self.str_field(address_field))
            .unwrap_or("<unnamed>")
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }
}

impl Deref for Record {
    type Target = Map<String, Value>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for Record {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl From<Map<String, Value>> for Record {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl TryFrom<Value> for Record {
    type Error = EnrichError;

    fn try_from(value: Value) -> EnrichResult<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(EnrichError::config(format!(
                "record must be a JSON object, got {}",
                type_name(&other)
            ))),
        }
    }
}

impl From<Record> for Value {
    fn from(record: Record) -> Self {
        Value::Object(record.0)
    }
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
