//! Wire codec
//!
//! Converts the in-memory value graph to and from JSON text. Plain data maps
//! onto JSON scalars, arrays and objects. References and callback descriptors
//! travel as single-key tagged records (`{"$ref": ..}`, `{"$callback": ..}`),
//! and ordinary maps that happen to use `$`-prefixed keys are escaped as
//! `{"$map": ..}` so the two can never be confused.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

const REF_TAG: &str = "$ref";
const CALLBACK_TAG: &str = "$callback";
const MAP_TAG: &str = "$map";

/// String-keyed mapping of values
pub type Map = BTreeMap<String, Value>;

/// Errors raised while encoding or decoding wire text
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CodecError {
    #[error("Failed to encode payload: {0}")]
    Encode(String),

    #[error("Failed to decode payload: {0}")]
    Decode(String),

    #[error("Cannot encode non-finite float {0}")]
    NonFiniteFloat(f64),

    #[error("Malformed tagged record `{tag}`: {reason}")]
    MalformedTag { tag: &'static str, reason: String },
}

/// Identifier of a server-side object store entry
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheId(String);

impl CacheId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random id; never reused by another server instance
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CacheId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for CacheId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Client-local identifier of a registered callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallbackId(pub u64);

impl fmt::Display for CallbackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cb-{}", self.0)
    }
}

/// Opaque handle to an object held by the server that issued it
///
/// `function_name` is only set for function references, in which case
/// `cache_result` says whether calling the function yields another
/// reference instead of inlined data.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Reference {
    pub cache_id: CacheId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_result: Option<bool>,
}

impl Reference {
    /// Reference to a cached data object
    pub fn data(cache_id: CacheId) -> Self {
        Self {
            cache_id,
            function_name: None,
            cache_result: None,
        }
    }

    /// Reference to a cached function
    pub fn function(cache_id: CacheId, function_name: impl Into<String>, cache_result: bool) -> Self {
        Self {
            cache_id,
            function_name: Some(function_name.into()),
            cache_result: Some(cache_result),
        }
    }

    pub fn is_function(&self) -> bool {
        self.function_name.is_some()
    }

    /// Whether invoking this function reference returns a reference
    pub fn caches_result(&self) -> bool {
        self.cache_result.unwrap_or(false)
    }
}

/// In-memory value graph exchanged between client and server
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Map(Map),
    Reference(Reference),
    Callback(CallbackId),
}

impl Value {
    /// Convert into plain JSON, tagging references and escaping `$` maps
    pub fn to_json(&self) -> Result<serde_json::Value, CodecError> {
        use serde_json::Value as Json;

        Ok(match self {
            Value::Null => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Int(i) => Json::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(Json::Number)
                .ok_or(CodecError::NonFiniteFloat(*f))?,
            Value::Str(s) => Json::String(s.clone()),
            Value::List(items) => Json::Array(
                items
                    .iter()
                    .map(Value::to_json)
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            Value::Map(map) => {
                let mut object = serde_json::Map::with_capacity(map.len());
                for (key, value) in map {
                    object.insert(key.clone(), value.to_json()?);
                }
                if map.keys().any(|k| k.starts_with('$')) {
                    tagged(MAP_TAG, Json::Object(object))
                } else {
                    Json::Object(object)
                }
            }
            Value::Reference(reference) => tagged(
                REF_TAG,
                serde_json::to_value(reference).map_err(|e| CodecError::Encode(e.to_string()))?,
            ),
            Value::Callback(id) => tagged(CALLBACK_TAG, Json::from(id.0)),
        })
    }

    /// Convert plain JSON back into a value graph
    pub fn from_json(json: serde_json::Value) -> Result<Self, CodecError> {
        use serde_json::Value as Json;

        Ok(match json {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Bool(b),
            Json::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Json::String(s) => Value::Str(s),
            Json::Array(items) => Value::List(
                items
                    .into_iter()
                    .map(Value::from_json)
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            Json::Object(object) => {
                if object.len() == 1 {
                    if let Some((key, inner)) = object.iter().next() {
                        match key.as_str() {
                            REF_TAG => {
                                let reference = serde_json::from_value(inner.clone()).map_err(
                                    |e| CodecError::MalformedTag {
                                        tag: REF_TAG,
                                        reason: e.to_string(),
                                    },
                                )?;
                                return Ok(Value::Reference(reference));
                            }
                            CALLBACK_TAG => {
                                let id = inner.as_u64().ok_or_else(|| CodecError::MalformedTag {
                                    tag: CALLBACK_TAG,
                                    reason: format!("expected an unsigned integer, got {inner}"),
                                })?;
                                return Ok(Value::Callback(CallbackId(id)));
                            }
                            MAP_TAG => {
                                let Json::Object(escaped) = inner.clone() else {
                                    return Err(CodecError::MalformedTag {
                                        tag: MAP_TAG,
                                        reason: format!("expected an object, got {inner}"),
                                    });
                                };
                                return Ok(Value::Map(map_from_json(escaped)?));
                            }
                            _ => {}
                        }
                    }
                }
                Value::Map(map_from_json(object)?)
            }
        })
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Numeric view; integers widen to floats
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&Map> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_reference(&self) -> Option<&Reference> {
        match self {
            Value::Reference(reference) => Some(reference),
            _ => None,
        }
    }

    /// Build a list from anything convertible into values
    pub fn list<T: Into<Value>>(items: impl IntoIterator<Item = T>) -> Self {
        Value::List(items.into_iter().map(Into::into).collect())
    }
}

fn tagged(tag: &str, inner: serde_json::Value) -> serde_json::Value {
    let mut object = serde_json::Map::with_capacity(1);
    object.insert(tag.to_string(), inner);
    serde_json::Value::Object(object)
}

fn map_from_json(object: serde_json::Map<String, serde_json::Value>) -> Result<Map, CodecError> {
    object
        .into_iter()
        .map(|(key, value)| Ok((key, Value::from_json(value)?)))
        .collect()
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json()
            .map_err(serde::ser::Error::custom)?
            .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let json = serde_json::Value::deserialize(deserializer)?;
        Value::from_json(json).map_err(serde::de::Error::custom)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<u32> for Value {
    fn from(i: u32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::list(items)
    }
}

impl From<Map> for Value {
    fn from(map: Map) -> Self {
        Value::Map(map)
    }
}

impl From<Reference> for Value {
    fn from(reference: Reference) -> Self {
        Value::Reference(reference)
    }
}

impl From<CallbackId> for Value {
    fn from(id: CallbackId) -> Self {
        Value::Callback(id)
    }
}

/// Encode any serializable protocol type to wire text
pub fn encode<T: Serialize>(value: &T) -> Result<String, CodecError> {
    serde_json::to_string(value).map_err(|e| CodecError::Encode(e.to_string()))
}

/// Decode wire text; malformed input is an error, never a panic
pub fn decode<T: DeserializeOwned>(text: &str) -> Result<T, CodecError> {
    serde_json::from_str(text).map_err(|e| CodecError::Decode(e.to_string()))
}
