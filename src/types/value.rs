// src/types/value.rs

use serde_json::{json, Map, Number, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::geopoint::{ParseGeoPoint, ParsePolygon};
use crate::object::ParseObject;
use crate::types::{FileField, ParseDate, ParseRelation, Pointer};

/// An attribute value as stored on a [`ParseObject`].
///
/// Nested entities only appear when the attribute was named in a query's
/// `include` paths; otherwise references stay as [`Pointer`]s.
#[derive(Debug, Clone, PartialEq)]
pub enum ParseValue {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
    Date(ParseDate),
    /// Base64 payload of a `Bytes` attribute.
    Bytes(String),
    Pointer(Pointer),
    Object(Arc<ParseObject>),
    Relation(ParseRelation),
    GeoPoint(ParseGeoPoint),
    Polygon(ParsePolygon),
    File(FileField),
    Array(Vec<ParseValue>),
    Map(BTreeMap<String, ParseValue>),
}

impl ParseValue {
    /// Decodes a wire value. `{"__type":"Object"}` payloads are downgraded to pointers;
    /// the materializer handles included paths before reaching here.
    pub fn from_json(value: &Value) -> ParseValue {
        match value {
            Value::Null => ParseValue::Null,
            Value::Bool(b) => ParseValue::Bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => ParseValue::Integer(i),
                None => ParseValue::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Value::String(s) => ParseValue::String(s.clone()),
            Value::Array(items) => ParseValue::Array(items.iter().map(ParseValue::from_json).collect()),
            Value::Object(map) => Self::from_json_map(map),
        }
    }

    fn from_json_map(map: &Map<String, Value>) -> ParseValue {
        let typed = match map.get("__type").and_then(Value::as_str) {
            Some("Date") => ParseDate::from_json(&Value::Object(map.clone())).map(ParseValue::Date),
            Some("Pointer") | Some("Object") => {
                let class_name = map.get("className").and_then(Value::as_str);
                let object_id = map.get("objectId").and_then(Value::as_str);
                match (class_name, object_id) {
                    (Some(c), Some(id)) => Some(ParseValue::Pointer(Pointer::new(c, id))),
                    _ => None,
                }
            }
            Some("Relation") => map
                .get("className")
                .and_then(Value::as_str)
                .map(|c| ParseValue::Relation(ParseRelation::new(c))),
            Some("GeoPoint") => ParseGeoPoint::from_json(&Value::Object(map.clone())).map(ParseValue::GeoPoint),
            Some("Polygon") => ParsePolygon::from_json(&Value::Object(map.clone())).map(ParseValue::Polygon),
            Some("File") => map.get("name").and_then(Value::as_str).map(|name| {
                ParseValue::File(FileField::new(
                    name,
                    map.get("url").and_then(Value::as_str).map(str::to_string),
                ))
            }),
            Some("Bytes") => map
                .get("base64")
                .and_then(Value::as_str)
                .map(|b| ParseValue::Bytes(b.to_string())),
            _ => None,
        };
        typed.unwrap_or_else(|| {
            ParseValue::Map(
                map.iter()
                    .map(|(k, v)| (k.clone(), ParseValue::from_json(v)))
                    .collect(),
            )
        })
    }

    /// Wire encoding. Nested entities are written as pointers.
    pub fn to_json(&self) -> Value {
        match self {
            ParseValue::Null => Value::Null,
            ParseValue::Bool(b) => Value::Bool(*b),
            ParseValue::Integer(i) => Value::Number((*i).into()),
            ParseValue::Float(f) => Number::from_f64(*f).map(Value::Number).unwrap_or(Value::Null),
            ParseValue::String(s) => Value::String(s.clone()),
            ParseValue::Date(d) => d.to_json(),
            ParseValue::Bytes(b) => json!({ "__type": "Bytes", "base64": b }),
            ParseValue::Pointer(p) => p.to_json(),
            ParseValue::Object(obj) => match obj.object_id() {
                Some(id) => Pointer::new(obj.class_name(), id).to_json(),
                None => Value::Null,
            },
            ParseValue::Relation(r) => json!({ "__type": "Relation", "className": r.class_name }),
            ParseValue::GeoPoint(g) => g.to_json(),
            ParseValue::Polygon(p) => p.to_json(),
            ParseValue::File(f) => json!({ "__type": "File", "name": f.name, "url": f.url }),
            ParseValue::Array(items) => Value::Array(items.iter().map(ParseValue::to_json).collect()),
            ParseValue::Map(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, ParseValue::Null)
    }

    pub fn is_number(&self) -> bool {
        matches!(self, ParseValue::Integer(_) | ParseValue::Float(_))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParseValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ParseValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParseValue::Integer(i) => Some(*i as f64),
            ParseValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParseValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[ParseValue]> {
        match self {
            ParseValue::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Arc<ParseObject>> {
        match self {
            ParseValue::Object(obj) => Some(obj),
            _ => None,
        }
    }

    /// The referenced entity, whether held as a pointer or as an included object.
    pub fn as_pointer(&self) -> Option<Pointer> {
        match self {
            ParseValue::Pointer(p) => Some(p.clone()),
            ParseValue::Object(obj) => obj.to_pointer().ok(),
            _ => None,
        }
    }

    /// Numeric sum used by increment ops; integer stays integer when both sides are.
    pub(crate) fn add_number(&self, other: &ParseValue) -> Option<ParseValue> {
        match (self, other) {
            (ParseValue::Integer(a), ParseValue::Integer(b)) => Some(ParseValue::Integer(a.saturating_add(*b))),
            _ => Some(ParseValue::Float(self.as_f64()? + other.as_f64()?)),
        }
    }
}

impl From<bool> for ParseValue {
    fn from(v: bool) -> Self {
        ParseValue::Bool(v)
    }
}

impl From<i32> for ParseValue {
    fn from(v: i32) -> Self {
        ParseValue::Integer(v as i64)
    }
}

impl From<i64> for ParseValue {
    fn from(v: i64) -> Self {
        ParseValue::Integer(v)
    }
}

impl From<u32> for ParseValue {
    fn from(v: u32) -> Self {
        ParseValue::Integer(v as i64)
    }
}

impl From<f64> for ParseValue {
    fn from(v: f64) -> Self {
        ParseValue::Float(v)
    }
}

impl From<&str> for ParseValue {
    fn from(v: &str) -> Self {
        ParseValue::String(v.to_string())
    }
}

impl From<String> for ParseValue {
    fn from(v: String) -> Self {
        ParseValue::String(v)
    }
}

impl From<&String> for ParseValue {
    fn from(v: &String) -> Self {
        ParseValue::String(v.clone())
    }
}

impl From<ParseDate> for ParseValue {
    fn from(v: ParseDate) -> Self {
        ParseValue::Date(v)
    }
}

impl From<Pointer> for ParseValue {
    fn from(v: Pointer) -> Self {
        ParseValue::Pointer(v)
    }
}

impl From<ParseGeoPoint> for ParseValue {
    fn from(v: ParseGeoPoint) -> Self {
        ParseValue::GeoPoint(v)
    }
}

impl From<ParsePolygon> for ParseValue {
    fn from(v: ParsePolygon) -> Self {
        ParseValue::Polygon(v)
    }
}

impl From<FileField> for ParseValue {
    fn from(v: FileField) -> Self {
        ParseValue::File(v)
    }
}

impl From<Value> for ParseValue {
    fn from(v: Value) -> Self {
        ParseValue::from_json(&v)
    }
}

impl<T: Into<ParseValue>> From<Vec<T>> for ParseValue {
    fn from(items: Vec<T>) -> Self {
        ParseValue::Array(items.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<ParseValue>> From<Option<T>> for ParseValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(ParseValue::Null)
    }
}
