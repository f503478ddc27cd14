// src/query/compiler.rs

use serde_json::{json, Map, Value};

use crate::error::ParseError;
use crate::query::ParseQuery;

/// Result cap applied when the caller never called `limit`.
pub const DEFAULT_LIMIT: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Limit {
    /// Server default cap of [`DEFAULT_LIMIT`].
    #[default]
    Default,
    Count(usize),
    /// No cap, sent as `-1`.
    Unlimited,
}

impl Limit {
    /// The cap in effect, `None` when unlimited.
    pub fn effective(&self) -> Option<usize> {
        match self {
            Limit::Default => Some(DEFAULT_LIMIT),
            Limit::Count(n) => Some(*n),
            Limit::Unlimited => None,
        }
    }

    pub fn is_explicit(&self) -> bool {
        !matches!(self, Limit::Default)
    }

    fn wire_value(&self) -> i64 {
        match self.effective() {
            Some(n) => n as i64,
            None => -1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    pub key: String,
    pub direction: SortDirection,
}

impl SortKey {
    fn render(&self) -> String {
        match self.direction {
            SortDirection::Ascending => self.key.clone(),
            SortDirection::Descending => format!("-{}", self.key),
        }
    }
}

/// The canonical, transport-ready form of a query.
///
/// Compilation is pure: the same builder calls always yield an equal value and
/// byte-identical [`to_params`](CompiledQuery::to_params) output. Keys inside
/// the `where` document are kept sorted.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledQuery {
    pub class_name: String,
    pub where_clause: Map<String, Value>,
    pub order: Vec<SortKey>,
    pub keys: Vec<String>,
    pub include: Vec<String>,
    pub skip: usize,
    pub limit: Limit,
}

impl CompiledQuery {
    pub fn order_string(&self) -> Option<String> {
        if self.order.is_empty() {
            return None;
        }
        Some(
            self.order
                .iter()
                .map(SortKey::render)
                .collect::<Vec<_>>()
                .join(","),
        )
    }

    pub fn where_json(&self) -> String {
        Value::Object(self.where_clause.clone()).to_string()
    }

    /// REST query parameters in a fixed order.
    pub fn to_params(&self) -> Vec<(String, String)> {
        let mut params = Vec::new();
        if !self.where_clause.is_empty() {
            params.push(("where".to_string(), self.where_json()));
        }
        params.push(("limit".to_string(), self.limit.wire_value().to_string()));
        if self.skip > 0 {
            params.push(("skip".to_string(), self.skip.to_string()));
        }
        if let Some(order) = self.order_string() {
            params.push(("order".to_string(), order));
        }
        if !self.include.is_empty() {
            params.push(("include".to_string(), self.include.join(",")));
        }
        if !self.keys.is_empty() {
            params.push(("keys".to_string(), self.keys.join(",")));
        }
        params
    }

    /// Document form used when embedding this query inside another one.
    pub fn to_json(&self) -> Value {
        let mut doc = Map::new();
        doc.insert("className".into(), Value::String(self.class_name.clone()));
        doc.insert("where".into(), Value::Object(self.where_clause.clone()));
        if self.limit.is_explicit() {
            doc.insert("limit".into(), json!(self.limit.wire_value()));
        }
        if self.skip > 0 {
            doc.insert("skip".into(), json!(self.skip));
        }
        if let Some(order) = self.order_string() {
            doc.insert("order".into(), Value::String(order));
        }
        if !self.keys.is_empty() {
            doc.insert("keys".into(), Value::String(self.keys.join(",")));
        }
        if !self.include.is_empty() {
            doc.insert("include".into(), Value::String(self.include.join(",")));
        }
        Value::Object(doc)
    }

    /// The query document of a live-query subscribe frame.
    pub fn to_live_query(&self) -> Value {
        let mut doc = Map::new();
        doc.insert("className".into(), Value::String(self.class_name.clone()));
        doc.insert("where".into(), Value::Object(self.where_clause.clone()));
        if !self.keys.is_empty() {
            doc.insert("keys".into(), json!(self.keys));
        }
        Value::Object(doc)
    }
}

fn check_geo_shape(query: &ParseQuery) -> Result<(), ParseError> {
    let mut proximity = 0;
    let mut other_geo = 0;
    for constraint in query.constraints.values().flat_map(|k| k.constraints()) {
        if constraint.is_proximity() {
            proximity += 1;
        } else if constraint.is_geo() {
            other_geo += 1;
        }
    }
    if proximity > 1 {
        return Err(ParseError::UnsupportedQueryShape(
            "only one proximity constraint is allowed per query".to_string(),
        ));
    }
    if proximity == 1 && other_geo > 0 {
        return Err(ParseError::UnsupportedQueryShape(
            "a proximity constraint cannot be combined with other geo constraints".to_string(),
        ));
    }
    Ok(())
}

fn has_proximity(query: &ParseQuery) -> bool {
    query
        .constraints
        .values()
        .flat_map(|k| k.constraints())
        .any(|c| c.is_proximity())
        || query.or.iter().chain(query.and.iter()).any(has_proximity)
}

fn compile_where(query: &ParseQuery) -> Result<Map<String, Value>, ParseError> {
    check_geo_shape(query)?;

    let mut doc = Map::new();
    for (key, constraint) in &query.constraints {
        doc.insert(key.clone(), constraint.render());
    }

    if let Some((parent, key)) = &query.related_to {
        doc.insert(
            "$relatedTo".into(),
            json!({ "object": parent.to_json(), "key": key }),
        );
    }

    for (op, branches) in [("$or", &query.or), ("$and", &query.and)] {
        if branches.is_empty() {
            continue;
        }
        let mut compiled = Vec::with_capacity(branches.len());
        for branch in branches {
            if has_proximity(branch) {
                return Err(ParseError::UnsupportedQueryShape(format!(
                    "proximity constraints are not allowed inside {}",
                    op
                )));
            }
            compiled.push(Value::Object(compile_where(branch)?));
        }
        doc.insert(op.to_string(), Value::Array(compiled));
    }
    Ok(doc)
}

pub(crate) fn compile(query: &ParseQuery) -> Result<CompiledQuery, ParseError> {
    Ok(CompiledQuery {
        class_name: query.class_name.clone(),
        where_clause: compile_where(query)?,
        order: query.order.clone(),
        keys: query.keys.iter().cloned().collect(),
        include: query.include.iter().cloned().collect(),
        skip: query.skip,
        limit: query.limit,
    })
}
