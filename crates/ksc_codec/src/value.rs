//! Typed-value document tree.
//!
//! The KSC API mixes plain JSON values with `{ "type": T, "value": V }`
//! wrappers for fields whose type the server cannot infer (64-bit integers,
//! binary blobs, dates, nested parameter containers). [`Value`] models both
//! forms explicitly so a wrapper received from the server is sent back with
//! the same tag, and a plain value is never given a tag it did not have.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::de::{Deserialize, Deserializer};
use serde::ser::{Serialize, SerializeMap, SerializeSeq, Serializer};
use serde_json::{Map, Number};

/// Wire spelling of the nested parameters tag.
pub const TAG_PARAMS: &str = "params";
/// Wire spelling of the array tag.
pub const TAG_ARRAY: &str = "array";
/// Wire spelling of the 64-bit integer tag.
pub const TAG_LONG: &str = "long";
/// Wire spelling of the 32-bit integer tag.
pub const TAG_INT: &str = "int";
/// Wire spelling of the string tag.
pub const TAG_STRING: &str = "string";
/// Wire spelling of the boolean tag.
pub const TAG_BOOL: &str = "bool";
/// Wire spelling of the binary tag.
pub const TAG_BINARY: &str = "binary";
/// Wire spelling of the date-time tag.
pub const TAG_DATETIME: &str = "DateTime";

/// A dynamic KSC document value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// JSON `null`.
    Null,
    /// Plain boolean.
    Bool(bool),
    /// Plain integer. The API documents every "int" as 64-bit signed.
    Int(i64),
    /// Non-integral number. The API does not produce these; they are kept
    /// only so an unknown field survives a round-trip.
    Float(f64),
    /// Plain string.
    String(String),
    /// Plain array.
    Array(Vec<Value>),
    /// Plain object.
    Params(Params),
    /// A `{ "type": ..., "value": ... }` wrapper.
    Tagged(Tagged),
}

/// The payload of a `{ "type": ..., "value": ... }` wrapper.
#[derive(Debug, Clone, PartialEq)]
pub enum Tagged {
    /// `"params"`: nested parameter container.
    Params(Params),
    /// `"array"`: array whose items may themselves be tagged.
    Array(Vec<Value>),
    /// `"long"`: 64-bit signed integer.
    Long(i64),
    /// `"int"`: integer the server declares as 32-bit.
    Int(i64),
    /// `"string"`.
    String(String),
    /// `"bool"`.
    Bool(bool),
    /// `"binary"`: bytes, base64 on the wire.
    Binary(Vec<u8>),
    /// `"DateTime"`: ISO-8601 UTC timestamp, kept verbatim.
    DateTime(String),
}

impl Tagged {
    /// Returns the wire spelling of this wrapper's tag.
    pub fn tag(&self) -> &'static str {
        match self {
            Tagged::Params(_) => TAG_PARAMS,
            Tagged::Array(_) => TAG_ARRAY,
            Tagged::Long(_) => TAG_LONG,
            Tagged::Int(_) => TAG_INT,
            Tagged::String(_) => TAG_STRING,
            Tagged::Bool(_) => TAG_BOOL,
            Tagged::Binary(_) => TAG_BINARY,
            Tagged::DateTime(_) => TAG_DATETIME,
        }
    }

    fn value_json(&self) -> serde_json::Value {
        match self {
            Tagged::Params(p) => p.to_json(),
            Tagged::Array(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Tagged::Long(n) | Tagged::Int(n) => serde_json::Value::from(*n),
            Tagged::String(s) | Tagged::DateTime(s) => serde_json::Value::String(s.clone()),
            Tagged::Bool(b) => serde_json::Value::Bool(*b),
            Tagged::Binary(bytes) => serde_json::Value::String(BASE64.encode(bytes)),
        }
    }

    /// Recognizes a wrapper from its tag and raw value.
    ///
    /// Returns `None` when the tag is unknown or the value does not have the
    /// shape the tag requires; the caller then keeps the object as plain
    /// parameters so nothing is lost.
    fn recognize(tag: &str, value: &serde_json::Value) -> Option<Tagged> {
        match (tag, value) {
            (TAG_PARAMS, serde_json::Value::Object(map)) => {
                Some(Tagged::Params(Params::from_json_map(map.clone())))
            }
            (TAG_ARRAY, serde_json::Value::Array(items)) => Some(Tagged::Array(
                items.iter().cloned().map(Value::from).collect(),
            )),
            (TAG_LONG, serde_json::Value::Number(n)) => n.as_i64().map(Tagged::Long),
            (TAG_INT, serde_json::Value::Number(n)) => n.as_i64().map(Tagged::Int),
            (TAG_STRING, serde_json::Value::String(s)) => Some(Tagged::String(s.clone())),
            (TAG_BOOL, serde_json::Value::Bool(b)) => Some(Tagged::Bool(*b)),
            (TAG_BINARY, serde_json::Value::String(s)) => {
                BASE64.decode(s.as_bytes()).ok().map(Tagged::Binary)
            }
            (TAG_DATETIME, serde_json::Value::String(s)) => Some(Tagged::DateTime(s.clone())),
            _ => None,
        }
    }
}

impl Value {
    /// Wraps a 64-bit integer in a `"long"` tag.
    pub fn long(n: i64) -> Self {
        Value::Tagged(Tagged::Long(n))
    }

    /// Wraps bytes in a `"binary"` tag.
    pub fn binary(bytes: impl Into<Vec<u8>>) -> Self {
        Value::Tagged(Tagged::Binary(bytes.into()))
    }

    /// Wraps an ISO-8601 timestamp in a `"DateTime"` tag.
    pub fn datetime(iso: impl Into<String>) -> Self {
        Value::Tagged(Tagged::DateTime(iso.into()))
    }

    /// Wraps parameters in a `"params"` tag.
    pub fn tagged_params(params: Params) -> Self {
        Value::Tagged(Tagged::Params(params))
    }

    /// Wraps items in an `"array"` tag.
    pub fn tagged_array(items: Vec<Value>) -> Self {
        Value::Tagged(Tagged::Array(items))
    }

    /// Check if this value is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Returns the tag if this value is a wrapper.
    pub fn tag(&self) -> Option<&'static str> {
        match self {
            Value::Tagged(t) => Some(t.tag()),
            _ => None,
        }
    }

    /// Get this value as a boolean, looking through a `"bool"` tag.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) | Value::Tagged(Tagged::Bool(b)) => Some(*b),
            _ => None,
        }
    }

    /// Get this value as an integer, looking through `"long"` and `"int"` tags.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(n) | Value::Tagged(Tagged::Long(n)) | Value::Tagged(Tagged::Int(n)) => {
                Some(*n)
            }
            _ => None,
        }
    }

    /// Get this value as a string, looking through `"string"` and `"DateTime"` tags.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s)
            | Value::Tagged(Tagged::String(s))
            | Value::Tagged(Tagged::DateTime(s)) => Some(s),
            _ => None,
        }
    }

    /// Get this value as bytes, if it is a `"binary"` wrapper.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Tagged(Tagged::Binary(b)) => Some(b),
            _ => None,
        }
    }

    /// Get this value as parameters, looking through a `"params"` tag.
    pub fn as_params(&self) -> Option<&Params> {
        match self {
            Value::Params(p) | Value::Tagged(Tagged::Params(p)) => Some(p),
            _ => None,
        }
    }

    /// Consumes this value into parameters, looking through a `"params"` tag.
    pub fn into_params(self) -> Option<Params> {
        match self {
            Value::Params(p) | Value::Tagged(Tagged::Params(p)) => Some(p),
            _ => None,
        }
    }

    /// Get this value as an array, looking through an `"array"` tag.
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(a) | Value::Tagged(Tagged::Array(a)) => Some(a),
            _ => None,
        }
    }

    /// Consumes this value into its items, looking through an `"array"` tag.
    pub fn into_array(self) -> Option<Vec<Value>> {
        match self {
            Value::Array(a) | Value::Tagged(Tagged::Array(a)) => Some(a),
            _ => None,
        }
    }

    /// Converts this value to a `serde_json::Value`, keeping every tag.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(n) => serde_json::Value::from(*n),
            Value::Float(f) => Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Params(p) => p.to_json(),
            Value::Tagged(t) => {
                let mut map = Map::new();
                map.insert("type".into(), serde_json::Value::String(t.tag().into()));
                map.insert("value".into(), t.value_json());
                serde_json::Value::Object(map)
            }
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or_default()),
            },
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => {
                if map.len() == 2 {
                    if let (Some(serde_json::Value::String(tag)), Some(inner)) =
                        (map.get("type"), map.get("value"))
                    {
                        if let Some(tagged) = Tagged::recognize(tag, inner) {
                            return Value::Tagged(tagged);
                        }
                    }
                }
                Value::Params(Params::from_json_map(map))
            }
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Int(i64::from(n))
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Value::Int(i64::from(n))
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Params> for Value {
    fn from(p: Params) -> Self {
        Value::Params(p)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

impl From<Tagged> for Value {
    fn from(t: Tagged) -> Self {
        Value::Tagged(t)
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Int(n) => serializer.serialize_i64(*n),
            Value::Float(f) => serializer.serialize_f64(*f),
            Value::String(s) => serializer.serialize_str(s),
            Value::Array(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Value::Params(p) => p.serialize(serializer),
            Value::Tagged(_) => self.to_json().serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        serde_json::Value::deserialize(deserializer).map(Value::from)
    }
}

/// An ordered parameter container (a JSON object).
///
/// Keys keep the order in which they were inserted, which is the order they
/// are written to the wire.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Params {
    entries: Vec<(String, Value)>,
}

impl Params {
    /// Creates an empty container.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    /// Inserts a value. An existing key keeps its position and is overwritten.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, slot)) => Some(std::mem::replace(slot, value)),
            None => {
                self.entries.push((key, value));
                None
            }
        }
    }

    /// Looks up a key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Looks up a key mutably.
    pub fn get_mut(&mut self, key: &str) -> Option<&mut Value> {
        self.entries
            .iter_mut()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// Removes a key, preserving the order of the remaining entries.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let index = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(index).1)
    }

    /// Returns true if the key is present.
    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if there are no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Iterates keys in insertion order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    /// Gets a string field.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    /// Gets an integer field.
    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(Value::as_i64)
    }

    /// Gets a boolean field.
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(Value::as_bool)
    }

    /// Gets a nested parameters field.
    pub fn get_params(&self, key: &str) -> Option<&Params> {
        self.get(key).and_then(Value::as_params)
    }

    /// Gets an array field.
    pub fn get_array(&self, key: &str) -> Option<&[Value]> {
        self.get(key).and_then(Value::as_array)
    }

    /// Converts to a JSON object.
    pub fn to_json(&self) -> serde_json::Value {
        let mut map = Map::new();
        for (k, v) in &self.entries {
            map.insert(k.clone(), v.to_json());
        }
        serde_json::Value::Object(map)
    }

    /// Builds from a JSON object, recognizing typed wrappers at every level.
    pub fn from_json_map(map: Map<String, serde_json::Value>) -> Self {
        Self {
            entries: map.into_iter().map(|(k, v)| (k, Value::from(v))).collect(),
        }
    }
}

impl FromIterator<(String, Value)> for Params {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        let mut params = Params::new();
        for (k, v) in iter {
            params.insert(k, v);
        }
        params
    }
}

impl IntoIterator for Params {
    type Item = (String, Value);
    type IntoIter = std::vec::IntoIter<(String, Value)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl Serialize for Params {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (k, v) in &self.entries {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Params {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let map = Map::<String, serde_json::Value>::deserialize(deserializer)?;
        Ok(Params::from_json_map(map))
    }
}
