// src/query/constraint.rs

use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

use crate::error::ParseError;
use crate::geopoint::ParseGeoPoint;
use crate::query::compiler::CompiledQuery;
use crate::types::ParseValue;

/// One end of a range constraint.
#[derive(Debug, Clone, PartialEq)]
pub struct Bound {
    pub value: ParseValue,
    pub inclusive: bool,
}

/// Lower and upper bounds on one attribute, merged into a single record.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Range {
    pub lower: Option<Bound>,
    pub upper: Option<Bound>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TextSearch {
    pub term: String,
    pub language: Option<String>,
    pub case_sensitive: Option<bool>,
    pub diacritic_sensitive: Option<bool>,
}

impl TextSearch {
    pub fn new(term: impl Into<String>) -> Self {
        TextSearch {
            term: term.into(),
            language: None,
            case_sensitive: None,
            diacritic_sensitive: None,
        }
    }
}

/// A non-equality predicate on one attribute path.
#[derive(Debug, Clone, PartialEq)]
pub enum Constraint {
    NotEqual(ParseValue),
    Range(Range),
    ContainedIn(Vec<ParseValue>),
    NotContainedIn(Vec<ParseValue>),
    ContainsAll(Vec<ParseValue>),
    Exists(bool),
    Regex {
        pattern: String,
        modifiers: Option<String>,
    },
    Text(TextSearch),
    Near {
        point: ParseGeoPoint,
        /// Radians.
        max_distance: Option<f64>,
    },
    WithinBox {
        south_west: ParseGeoPoint,
        north_east: ParseGeoPoint,
    },
    WithinPolygon(Vec<ParseGeoPoint>),
    PolygonContains(ParseGeoPoint),
    MatchesQuery(Box<CompiledQuery>),
    DoesNotMatchQuery(Box<CompiledQuery>),
    MatchesKeyInQuery {
        key: String,
        query: Box<CompiledQuery>,
    },
    DoesNotMatchKeyInQuery {
        key: String,
        query: Box<CompiledQuery>,
    },
}

/// Which operator slot a constraint occupies on its key. A later constraint
/// in the same slot replaces the earlier one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Slot {
    NotEqual,
    Range,
    ContainedIn,
    NotContainedIn,
    ContainsAll,
    Exists,
    Regex,
    Text,
    Near,
    WithinBox,
    WithinPolygon,
    PolygonContains,
    MatchesQuery,
    DoesNotMatchQuery,
    MatchesKeyInQuery,
    DoesNotMatchKeyInQuery,
}

impl Constraint {
    pub fn slot(&self) -> Slot {
        match self {
            Constraint::NotEqual(_) => Slot::NotEqual,
            Constraint::Range(_) => Slot::Range,
            Constraint::ContainedIn(_) => Slot::ContainedIn,
            Constraint::NotContainedIn(_) => Slot::NotContainedIn,
            Constraint::ContainsAll(_) => Slot::ContainsAll,
            Constraint::Exists(_) => Slot::Exists,
            Constraint::Regex { .. } => Slot::Regex,
            Constraint::Text(_) => Slot::Text,
            Constraint::Near { .. } => Slot::Near,
            Constraint::WithinBox { .. } => Slot::WithinBox,
            Constraint::WithinPolygon(_) => Slot::WithinPolygon,
            Constraint::PolygonContains(_) => Slot::PolygonContains,
            Constraint::MatchesQuery(_) => Slot::MatchesQuery,
            Constraint::DoesNotMatchQuery(_) => Slot::DoesNotMatchQuery,
            Constraint::MatchesKeyInQuery { .. } => Slot::MatchesKeyInQuery,
            Constraint::DoesNotMatchKeyInQuery { .. } => Slot::DoesNotMatchKeyInQuery,
        }
    }

    pub fn is_proximity(&self) -> bool {
        matches!(self, Constraint::Near { .. })
    }

    pub fn is_geo(&self) -> bool {
        matches!(
            self,
            Constraint::Near { .. }
                | Constraint::WithinBox { .. }
                | Constraint::WithinPolygon(_)
                | Constraint::PolygonContains(_)
        )
    }

    /// Writes this constraint's operators into the key's operator document.
    pub(crate) fn render_into(&self, ops: &mut Map<String, Value>) {
        fn values(items: &[ParseValue]) -> Value {
            Value::Array(items.iter().map(ParseValue::to_json).collect())
        }

        match self {
            Constraint::NotEqual(v) => {
                ops.insert("$ne".into(), v.to_json());
            }
            Constraint::Range(range) => {
                if let Some(lower) = &range.lower {
                    let op = if lower.inclusive { "$gte" } else { "$gt" };
                    ops.insert(op.into(), lower.value.to_json());
                }
                if let Some(upper) = &range.upper {
                    let op = if upper.inclusive { "$lte" } else { "$lt" };
                    ops.insert(op.into(), upper.value.to_json());
                }
            }
            Constraint::ContainedIn(items) => {
                ops.insert("$in".into(), values(items));
            }
            Constraint::NotContainedIn(items) => {
                ops.insert("$nin".into(), values(items));
            }
            Constraint::ContainsAll(items) => {
                ops.insert("$all".into(), values(items));
            }
            Constraint::Exists(flag) => {
                ops.insert("$exists".into(), Value::Bool(*flag));
            }
            Constraint::Regex { pattern, modifiers } => {
                ops.insert("$regex".into(), Value::String(pattern.clone()));
                if let Some(m) = modifiers {
                    ops.insert("$options".into(), Value::String(m.clone()));
                }
            }
            Constraint::Text(search) => {
                let mut params = Map::new();
                params.insert("$term".into(), Value::String(search.term.clone()));
                if let Some(lang) = &search.language {
                    params.insert("$language".into(), Value::String(lang.clone()));
                }
                if let Some(cs) = search.case_sensitive {
                    params.insert("$caseSensitive".into(), Value::Bool(cs));
                }
                if let Some(ds) = search.diacritic_sensitive {
                    params.insert("$diacriticSensitive".into(), Value::Bool(ds));
                }
                ops.insert("$text".into(), json!({ "$search": params }));
            }
            Constraint::Near { point, max_distance } => {
                ops.insert("$nearSphere".into(), point.to_json());
                if let Some(d) = max_distance {
                    ops.insert("$maxDistance".into(), json!(d));
                }
            }
            Constraint::WithinBox {
                south_west,
                north_east,
            } => {
                ops.insert(
                    "$within".into(),
                    json!({ "$box": [south_west.to_json(), north_east.to_json()] }),
                );
            }
            Constraint::WithinPolygon(points) => {
                let points: Vec<Value> = points.iter().map(ParseGeoPoint::to_json).collect();
                ops.insert("$geoWithin".into(), json!({ "$polygon": points }));
            }
            Constraint::PolygonContains(point) => {
                ops.insert("$geoIntersects".into(), json!({ "$point": point.to_json() }));
            }
            Constraint::MatchesQuery(query) => {
                ops.insert("$inQuery".into(), query.to_json());
            }
            Constraint::DoesNotMatchQuery(query) => {
                ops.insert("$notInQuery".into(), query.to_json());
            }
            Constraint::MatchesKeyInQuery { key, query } => {
                ops.insert("$select".into(), json!({ "key": key, "query": query.to_json() }));
            }
            Constraint::DoesNotMatchKeyInQuery { key, query } => {
                ops.insert("$dontSelect".into(), json!({ "key": key, "query": query.to_json() }));
            }
        }
    }
}

/// Everything constrained on one attribute path.
#[derive(Debug, Clone, PartialEq)]
pub enum KeyConstraint {
    Equal(ParseValue),
    Operators(BTreeMap<Slot, Constraint>),
}

impl KeyConstraint {
    pub fn render(&self) -> Value {
        match self {
            KeyConstraint::Equal(v) => v.to_json(),
            KeyConstraint::Operators(ops) => {
                let mut doc = Map::new();
                for constraint in ops.values() {
                    constraint.render_into(&mut doc);
                }
                Value::Object(doc)
            }
        }
    }

    pub fn constraints(&self) -> impl Iterator<Item = &Constraint> {
        let ops = match self {
            KeyConstraint::Operators(ops) => Some(ops.values()),
            KeyConstraint::Equal(_) => None,
        };
        ops.into_iter().flatten()
    }
}

/// Checks an attribute path: non-empty dot-separated segments, no operator
/// prefix, no whitespace.
pub fn validate_path(key: &str) -> Result<(), ParseError> {
    if key.is_empty() {
        return Err(ParseError::InvalidConstraint(
            "attribute path cannot be empty".to_string(),
        ));
    }
    for segment in key.split('.') {
        if segment.is_empty() {
            return Err(ParseError::InvalidConstraint(format!(
                "attribute path '{}' has an empty segment",
                key
            )));
        }
        if segment.starts_with('$') {
            return Err(ParseError::InvalidConstraint(format!(
                "attribute path '{}' cannot start a segment with '$'",
                key
            )));
        }
        if segment.chars().any(char::is_whitespace) {
            return Err(ParseError::InvalidConstraint(format!(
                "attribute path '{}' contains whitespace",
                key
            )));
        }
    }
    Ok(())
}
