use std::fmt;

use indexmap::IndexMap;
use serde_json::Value as Json;

use crate::error::Result;

pub type Map<K, V> = IndexMap<K, V>;
pub type Tags = Map<String, Value>;

/// Plain data: everything that can be stored or sent over the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<Value>),
    Dict(Map<String, Value>),
    Tagged(Box<TaggedValue>),
}

/// A value carrying provenance tags. Tags ride along through row-wise
/// transformations until an op strips them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaggedValue {
    pub tags: Tags,
    pub value: Value,
}

impl Value {
    pub fn tagged(tags: Tags, value: Value) -> Value {
        value.with_tags(&tags)
    }

    pub fn is_null(&self) -> bool {
        matches!(self.untagged(), Value::Null)
    }

    pub fn untagged(&self) -> &Value {
        match self {
            Value::Tagged(t) => t.value.untagged(),
            v => v,
        }
    }

    pub fn into_untagged(self) -> Value {
        match self {
            Value::Tagged(t) => t.value.into_untagged(),
            v => v,
        }
    }

    pub fn tags(&self) -> Option<&Tags> {
        match self {
            Value::Tagged(t) => Some(&t.tags),
            _ => None,
        }
    }

    /// Wraps the value with `tags`. Existing tags are kept; on key
    /// collision the incoming tag wins.
    pub fn with_tags(self, tags: &Tags) -> Value {
        if tags.is_empty() {
            return self;
        }
        match self {
            Value::Tagged(mut t) => {
                for (k, v) in tags {
                    t.tags.insert(k.clone(), v.clone());
                }
                Value::Tagged(t)
            }
            value => Value::Tagged(Box::new(TaggedValue {
                tags: tags.clone(),
                value,
            })),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self.untagged() {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self.untagged() {
            Value::Int(i) => Some(*i),
            Value::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self.untagged() {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self.untagged() {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self.untagged() {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    /// Field lookup on a dict row. Missing keys and non-dicts give `Null`.
    pub fn pick(&self, key: &str) -> Value {
        match self {
            Value::Tagged(t) => t.value.pick(key).with_tags(&t.tags),
            Value::Dict(d) => d.get(key).cloned().unwrap_or(Value::Null),
            _ => Value::Null,
        }
    }

    /// Predicate truthiness used by filters.
    pub fn truthy(&self) -> bool {
        self.as_bool().unwrap_or(false)
    }

    /// Hashable identity for grouping. Tags never take part in the key, and
    /// integral floats share a key with the equal int.
    pub fn group_key(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(&self.numeric_normal())?)
    }

    fn numeric_normal(&self) -> Value {
        match self.untagged() {
            Value::Float(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => {
                Value::Int(*f as i64)
            }
            Value::List(items) => Value::List(items.iter().map(Value::numeric_normal).collect()),
            Value::Dict(fields) => Value::Dict(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.numeric_normal()))
                    .collect(),
            ),
            v => v.clone(),
        }
    }

    pub fn from_json(json: &Json) -> Value {
        match json {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Bool(*b),
            Json::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Json::String(s) => Value::String(s.clone()),
            Json::Array(arr) => Value::List(arr.iter().map(Value::from_json).collect()),
            Json::Object(obj) => {
                if obj.len() == 2 {
                    if let (Some(Json::Object(tags)), Some(inner)) =
                        (obj.get("_tag"), obj.get("_value"))
                    {
                        let tags = tags
                            .iter()
                            .map(|(k, v)| (k.clone(), Value::from_json(v)))
                            .collect();
                        return Value::tagged(tags, Value::from_json(inner));
                    }
                }
                Value::Dict(
                    obj.iter()
                        .map(|(k, v)| (k.clone(), Value::from_json(v)))
                        .collect(),
                )
            }
        }
    }

    /// Plain JSON as the JS client expects it; tags become `_tag`/`_value`.
    pub fn to_json(&self) -> Json {
        match self {
            Value::Null => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Int(i) => Json::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            Value::String(s) => Json::String(s.clone()),
            Value::List(l) => Json::Array(l.iter().map(Value::to_json).collect()),
            Value::Dict(d) => Json::Object(
                d.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
            Value::Tagged(t) => {
                let mut obj = serde_json::Map::new();
                obj.insert(
                    "_tag".to_owned(),
                    Json::Object(
                        t.tags
                            .iter()
                            .map(|(k, v)| (k.clone(), v.to_json()))
                            .collect(),
                    ),
                );
                obj.insert("_value".to_owned(), t.value.to_json());
                Json::Object(obj)
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::List(v)
    }
}

/// Builds a `Value::Dict` keeping insertion order.
#[macro_export]
macro_rules! row {
    ($($key: expr => $val: expr),* $(,)?) => {{
        let mut map = $crate::ram::types::Map::new();
        $(
            map.insert(String::from($key), $crate::ram::types::Value::from($val));
        )*
        $crate::ram::types::Value::Dict(map)
    }};
}
