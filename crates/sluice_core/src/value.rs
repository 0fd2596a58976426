//! Dynamic value model
//!
//! [`DynamicValue`] is the one currency exchanged between hosts, pumps and
//! scripts. It is a closed set of kinds: anything a script holds that is not
//! one of these (functions, coroutine handles...) has no representation here.

use chrono::{DateTime, SecondsFormat, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Insertion-ordered string-keyed map of values.
pub type ValueMap = IndexMap<String, DynamicValue>;

static UNDEFINED: DynamicValue = DynamicValue::Undefined;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum DynamicValue {
    #[default]
    Undefined,
    Boolean(bool),
    Integer(i32),
    Real(f64),
    String(String),
    Binary(Vec<u8>),
    Uuid(Uuid),
    Timestamp(DateTime<Utc>),
    Uri(String),
    Array(Vec<DynamicValue>),
    Map(ValueMap),
}

impl DynamicValue {
    pub fn empty_array() -> Self {
        DynamicValue::Array(Vec::new())
    }

    pub fn empty_map() -> Self {
        DynamicValue::Map(ValueMap::new())
    }

    pub fn array<I, V>(items: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<DynamicValue>,
    {
        DynamicValue::Array(items.into_iter().map(Into::into).collect())
    }

    pub fn map<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<DynamicValue>,
    {
        DynamicValue::Map(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    pub fn uri(uri: impl Into<String>) -> Self {
        DynamicValue::Uri(uri.into())
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, DynamicValue::Undefined)
    }

    pub fn is_defined(&self) -> bool {
        !self.is_undefined()
    }

    /// Short lowercase name of the kind, for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            DynamicValue::Undefined => "undefined",
            DynamicValue::Boolean(_) => "boolean",
            DynamicValue::Integer(_) => "integer",
            DynamicValue::Real(_) => "real",
            DynamicValue::String(_) => "string",
            DynamicValue::Binary(_) => "binary",
            DynamicValue::Uuid(_) => "uuid",
            DynamicValue::Timestamp(_) => "timestamp",
            DynamicValue::Uri(_) => "uri",
            DynamicValue::Array(_) => "array",
            DynamicValue::Map(_) => "map",
        }
    }

    /// Element count for containers, 0 for scalars.
    pub fn len(&self) -> usize {
        match self {
            DynamicValue::Array(items) => items.len(),
            DynamicValue::Map(entries) => entries.len(),
            _ => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Array element, or Undefined when out of range or not an array.
    pub fn at(&self, index: usize) -> &DynamicValue {
        match self {
            DynamicValue::Array(items) => items.get(index).unwrap_or(&UNDEFINED),
            _ => &UNDEFINED,
        }
    }

    /// Map entry, or Undefined when absent or not a map.
    pub fn get(&self, key: &str) -> &DynamicValue {
        match self {
            DynamicValue::Map(entries) => entries.get(key).unwrap_or(&UNDEFINED),
            _ => &UNDEFINED,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            DynamicValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i32> {
        match self {
            DynamicValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_real(&self) -> Option<f64> {
        match self {
            DynamicValue::Real(r) => Some(*r),
            DynamicValue::Integer(i) => Some(f64::from(*i)),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            DynamicValue::String(s) | DynamicValue::Uri(s) => Some(s),
            _ => None,
        }
    }

    /// Lossy string rendering of a scalar.
    ///
    /// Undefined, binary and containers render as the empty string.
    pub fn to_string_lossy(&self) -> String {
        match self {
            DynamicValue::Undefined
            | DynamicValue::Binary(_)
            | DynamicValue::Array(_)
            | DynamicValue::Map(_) => String::new(),
            DynamicValue::Boolean(b) => b.to_string(),
            DynamicValue::Integer(i) => i.to_string(),
            DynamicValue::Real(r) => r.to_string(),
            DynamicValue::String(s) | DynamicValue::Uri(s) => s.clone(),
            DynamicValue::Uuid(u) => u.hyphenated().to_string(),
            DynamicValue::Timestamp(t) => format_timestamp(t),
        }
    }

    /// JSON rendering. Binary becomes an array of byte values; uuid,
    /// timestamp and uri become strings.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as Json;
        match self {
            DynamicValue::Undefined => Json::Null,
            DynamicValue::Boolean(b) => Json::Bool(*b),
            DynamicValue::Integer(i) => Json::from(*i),
            DynamicValue::Real(r) => serde_json::Number::from_f64(*r)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            DynamicValue::Binary(bytes) => Json::from(bytes.clone()),
            DynamicValue::String(_)
            | DynamicValue::Uri(_)
            | DynamicValue::Uuid(_)
            | DynamicValue::Timestamp(_) => Json::String(self.to_string_lossy()),
            DynamicValue::Array(items) => Json::Array(items.iter().map(Self::to_json).collect()),
            DynamicValue::Map(entries) => Json::Object(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }
}

/// RFC 3339 with a `Z` suffix and only as many fractional digits as needed.
pub fn format_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

impl From<serde_json::Value> for DynamicValue {
    fn from(json: serde_json::Value) -> Self {
        use serde_json::Value as Json;
        match json {
            Json::Null => DynamicValue::Undefined,
            Json::Bool(b) => DynamicValue::Boolean(b),
            Json::Number(n) => match n.as_i64().and_then(|i| i32::try_from(i).ok()) {
                Some(i) => DynamicValue::Integer(i),
                None => DynamicValue::Real(n.as_f64().unwrap_or(f64::NAN)),
            },
            Json::String(s) => DynamicValue::String(s),
            Json::Array(items) => DynamicValue::Array(items.into_iter().map(Into::into).collect()),
            Json::Object(entries) => DynamicValue::Map(
                entries.into_iter().map(|(k, v)| (k, v.into())).collect(),
            ),
        }
    }
}

impl fmt::Display for DynamicValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DynamicValue::Undefined => f.write_str("!"),
            DynamicValue::Binary(bytes) => write!(f, "b({})", bytes.len()),
            DynamicValue::Uuid(u) => write!(f, "u{u}"),
            DynamicValue::Timestamp(t) => write!(f, "d\"{}\"", format_timestamp(t)),
            DynamicValue::Uri(u) => write!(f, "l\"{u}\""),
            DynamicValue::Array(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            DynamicValue::Map(entries) => {
                f.write_str("{")?;
                for (i, (key, value)) in entries.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{key:?}:{value}")?;
                }
                f.write_str("}")
            }
            scalar => write!(f, "{}", scalar.to_json()),
        }
    }
}

impl From<bool> for DynamicValue {
    fn from(value: bool) -> Self {
        DynamicValue::Boolean(value)
    }
}

impl From<i32> for DynamicValue {
    fn from(value: i32) -> Self {
        DynamicValue::Integer(value)
    }
}

impl From<f64> for DynamicValue {
    fn from(value: f64) -> Self {
        DynamicValue::Real(value)
    }
}

impl From<&str> for DynamicValue {
    fn from(value: &str) -> Self {
        DynamicValue::String(value.to_string())
    }
}

impl From<String> for DynamicValue {
    fn from(value: String) -> Self {
        DynamicValue::String(value)
    }
}

impl From<Vec<u8>> for DynamicValue {
    fn from(value: Vec<u8>) -> Self {
        DynamicValue::Binary(value)
    }
}

impl From<Uuid> for DynamicValue {
    fn from(value: Uuid) -> Self {
        DynamicValue::Uuid(value)
    }
}

impl From<DateTime<Utc>> for DynamicValue {
    fn from(value: DateTime<Utc>) -> Self {
        DynamicValue::Timestamp(value)
    }
}

impl From<Vec<DynamicValue>> for DynamicValue {
    fn from(value: Vec<DynamicValue>) -> Self {
        DynamicValue::Array(value)
    }
}

impl From<ValueMap> for DynamicValue {
    fn from(value: ValueMap) -> Self {
        DynamicValue::Map(value)
    }
}

impl<T: Into<DynamicValue>> From<Option<T>> for DynamicValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or_default()
    }
}
