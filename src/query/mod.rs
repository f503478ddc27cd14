// src/query/mod.rs

pub mod compiler;
pub mod constraint;
pub mod cursor;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

use crate::client::Parse;
use crate::error::ParseError;
use crate::geopoint::{ParseGeoPoint, ParsePolygon};
use crate::live_query::{LiveQueryClient, Subscription};
use crate::materializer::Materializer;
use crate::object::ParseObject;
use crate::registry::{decode_as, Decoded, ParseClass};
use crate::requests::{Method, RestRequest};
use crate::types::{ParseValue, Pointer};

pub use compiler::{CompiledQuery, Limit, SortDirection, SortKey, DEFAULT_LIMIT};
pub use constraint::{Bound, Constraint, KeyConstraint, Range, Slot, TextSearch};
pub use cursor::{EachOptions, QueryCursor};

/// A query against one Parse class, built with chained predicate calls.
///
/// Predicates validate their attribute path and return
/// `Result<&mut Self, ParseError>`; pagination, ordering and projection calls
/// return `&mut Self`. Clone a base query to reuse it.
///
/// ```rust
/// use parse_live::ParseQuery;
/// # fn main() -> Result<(), parse_live::ParseError> {
/// let mut query = ParseQuery::new("GameScore");
/// query
///     .greater_than("score", 1000)?
///     .less_than("score", 3000)?
///     .equal_to("cheatMode", false)?
///     .descending("score")
///     .limit(10);
/// let compiled = query.compile()?;
/// assert_eq!(compiled.where_json(), r#"{"cheatMode":false,"score":{"$gt":1000,"$lt":3000}}"#);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ParseQuery {
    pub(crate) class_name: String,
    pub(crate) constraints: BTreeMap<String, KeyConstraint>,
    pub(crate) related_to: Option<(Pointer, String)>,
    pub(crate) or: Vec<ParseQuery>,
    pub(crate) and: Vec<ParseQuery>,
    pub(crate) order: Vec<SortKey>,
    pub(crate) keys: BTreeSet<String>,
    pub(crate) include: BTreeSet<String>,
    pub(crate) skip: usize,
    pub(crate) limit: Limit,
    pub(crate) use_master_key: bool,
}

impl ParseQuery {
    pub fn new(class_name: &str) -> Self {
        Self {
            class_name: class_name.to_string(),
            constraints: BTreeMap::new(),
            related_to: None,
            or: Vec::new(),
            and: Vec::new(),
            order: Vec::new(),
            keys: BTreeSet::new(),
            include: BTreeSet::new(),
            skip: 0,
            limit: Limit::Default,
            use_master_key: false,
        }
    }

    fn compose(queries: &[ParseQuery], op: &str) -> Result<ParseQuery, ParseError> {
        let Some(first) = queries.first() else {
            return Err(ParseError::InvalidConstraint(format!(
                "{} needs at least one query",
                op
            )));
        };
        if let Some(other) = queries.iter().find(|q| q.class_name != first.class_name) {
            return Err(ParseError::InvalidConstraint(format!(
                "{} over different classes ({} and {})",
                op, first.class_name, other.class_name
            )));
        }
        let mut composed = ParseQuery::new(&first.class_name);
        match op {
            "$or" => composed.or = queries.to_vec(),
            _ => composed.and = queries.to_vec(),
        }
        Ok(composed)
    }

    /// A query matching objects that match any of `queries`.
    pub fn or(queries: &[ParseQuery]) -> Result<ParseQuery, ParseError> {
        Self::compose(queries, "$or")
    }

    /// A query matching objects that match all of `queries`.
    pub fn and(queries: &[ParseQuery]) -> Result<ParseQuery, ParseError> {
        Self::compose(queries, "$and")
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn uses_master_key(&self) -> bool {
        self.use_master_key
    }

    pub fn set_master_key(&mut self, use_key: bool) -> &mut Self {
        self.use_master_key = use_key;
        self
    }

    /// The constraints currently held for `key`.
    pub fn constraint(&self, key: &str) -> Option<&KeyConstraint> {
        self.constraints.get(key)
    }

    // Replaces whatever was constrained on `key` with an equality.
    fn add_equality(&mut self, key: &str, value: ParseValue) -> Result<&mut Self, ParseError> {
        constraint::validate_path(key)?;
        self.constraints
            .insert(key.to_string(), KeyConstraint::Equal(value));
        Ok(self)
    }

    // Adds an operator constraint; the same operator on the same key overwrites,
    // and an earlier equality on the key is dropped.
    fn add_constraint(&mut self, key: &str, constraint: Constraint) -> Result<&mut Self, ParseError> {
        constraint::validate_path(key)?;
        let entry = self
            .constraints
            .entry(key.to_string())
            .or_insert_with(|| KeyConstraint::Operators(BTreeMap::new()));
        if let KeyConstraint::Equal(_) = entry {
            *entry = KeyConstraint::Operators(BTreeMap::new());
        }
        if let KeyConstraint::Operators(ops) = entry {
            ops.insert(constraint.slot(), constraint);
        }
        Ok(self)
    }

    fn add_bound(&mut self, key: &str, bound: Bound, lower: bool) -> Result<&mut Self, ParseError> {
        let mut range = match self.constraints.get(key) {
            Some(KeyConstraint::Operators(ops)) => match ops.get(&Slot::Range) {
                Some(Constraint::Range(range)) => range.clone(),
                _ => Range::default(),
            },
            _ => Range::default(),
        };
        if lower {
            range.lower = Some(bound);
        } else {
            range.upper = Some(bound);
        }
        self.add_constraint(key, Constraint::Range(range))
    }

    /// Adds a constraint to the query that a field must be equal to a specified value.
    pub fn equal_to(&mut self, key: &str, value: impl Into<ParseValue>) -> Result<&mut Self, ParseError> {
        self.add_equality(key, value.into())
    }

    /// Adds a constraint that a field must not be equal to a specified value.
    pub fn not_equal_to(&mut self, key: &str, value: impl Into<ParseValue>) -> Result<&mut Self, ParseError> {
        self.add_constraint(key, Constraint::NotEqual(value.into()))
    }

    /// Adds a constraint that a field must be strictly greater than `value`.
    ///
    /// A lower bound merges with an existing upper bound on the same key.
    ///
    /// # Arguments
    /// * `key` - The field (or dotted path) to compare.
    /// * `value` - A number, string or date to compare against.
    pub fn greater_than(&mut self, key: &str, value: impl Into<ParseValue>) -> Result<&mut Self, ParseError> {
        let bound = Bound {
            value: value.into(),
            inclusive: false,
        };
        self.add_bound(key, bound, true)
    }

    /// Like [`greater_than`](Self::greater_than), with the bound included.
    pub fn greater_than_or_equal_to(
        &mut self,
        key: &str,
        value: impl Into<ParseValue>,
    ) -> Result<&mut Self, ParseError> {
        let bound = Bound {
            value: value.into(),
            inclusive: true,
        };
        self.add_bound(key, bound, true)
    }

    /// Adds a constraint that a field must be strictly less than `value`.
    ///
    /// # Arguments
    /// * `key` - The field (or dotted path) to compare.
    /// * `value` - A number, string or date to compare against.
    pub fn less_than(&mut self, key: &str, value: impl Into<ParseValue>) -> Result<&mut Self, ParseError> {
        let bound = Bound {
            value: value.into(),
            inclusive: false,
        };
        self.add_bound(key, bound, false)
    }

    /// Like [`less_than`](Self::less_than), with the bound included.
    pub fn less_than_or_equal_to(
        &mut self,
        key: &str,
        value: impl Into<ParseValue>,
    ) -> Result<&mut Self, ParseError> {
        let bound = Bound {
            value: value.into(),
            inclusive: true,
        };
        self.add_bound(key, bound, false)
    }

    /// Adds a constraint that a field's value must be one of `values`.
    ///
    /// # Arguments
    /// * `key` - The field to check.
    /// * `values` - The accepted values. An empty list matches nothing.
    pub fn contained_in<V: Into<ParseValue>>(
        &mut self,
        key: &str,
        values: impl IntoIterator<Item = V>,
    ) -> Result<&mut Self, ParseError> {
        let values = values.into_iter().map(Into::into).collect();
        self.add_constraint(key, Constraint::ContainedIn(values))
    }

    /// Adds a constraint that a field's value must not be any of `values`.
    pub fn not_contained_in<V: Into<ParseValue>>(
        &mut self,
        key: &str,
        values: impl IntoIterator<Item = V>,
    ) -> Result<&mut Self, ParseError> {
        let values = values.into_iter().map(Into::into).collect();
        self.add_constraint(key, Constraint::NotContainedIn(values))
    }

    /// For array fields: every given value must be present.
    pub fn contains_all<V: Into<ParseValue>>(
        &mut self,
        key: &str,
        values: impl IntoIterator<Item = V>,
    ) -> Result<&mut Self, ParseError> {
        let values = values.into_iter().map(Into::into).collect();
        self.add_constraint(key, Constraint::ContainsAll(values))
    }

    /// The field must be set.
    pub fn exists(&mut self, key: &str) -> Result<&mut Self, ParseError> {
        self.add_constraint(key, Constraint::Exists(true))
    }

    /// The field must be unset.
    pub fn does_not_exist(&mut self, key: &str) -> Result<&mut Self, ParseError> {
        self.add_constraint(key, Constraint::Exists(false))
    }

    /// Matches a regular expression. `modifiers` may combine `i`, `m`, `s`, `x`, `u`.
    pub fn matches(
        &mut self,
        key: &str,
        pattern: &str,
        modifiers: Option<&str>,
    ) -> Result<&mut Self, ParseError> {
        if let Some(mods) = modifiers {
            if let Some(bad) = mods.chars().find(|c| !"imsxu".contains(*c)) {
                return Err(ParseError::InvalidConstraint(format!(
                    "unsupported regex modifier '{}'",
                    bad
                )));
            }
        }
        regex::Regex::new(pattern).map_err(|e| {
            ParseError::InvalidConstraint(format!("invalid regex '{}': {}", pattern, e))
        })?;
        self.add_constraint(
            key,
            Constraint::Regex {
                pattern: pattern.to_string(),
                modifiers: modifiers.filter(|m| !m.is_empty()).map(str::to_string),
            },
        )
    }

    /// String prefix match. `prefix` is escaped, so it is matched literally.
    pub fn starts_with(&mut self, key: &str, prefix: &str) -> Result<&mut Self, ParseError> {
        self.matches(key, &format!("^{}", regex::escape(prefix)), None)
    }

    /// String suffix match. `suffix` is matched literally.
    pub fn ends_with(&mut self, key: &str, suffix: &str) -> Result<&mut Self, ParseError> {
        self.matches(key, &format!("{}$", regex::escape(suffix)), None)
    }

    /// Substring match.
    pub fn contains(&mut self, key: &str, substring: &str) -> Result<&mut Self, ParseError> {
        self.matches(key, &regex::escape(substring), None)
    }

    /// Full-text search; needs a text index on the field server-side.
    pub fn full_text(&mut self, key: &str, search: TextSearch) -> Result<&mut Self, ParseError> {
        if search.term.trim().is_empty() {
            return Err(ParseError::InvalidConstraint(
                "full-text search term cannot be empty".to_string(),
            ));
        }
        self.add_constraint(key, Constraint::Text(search))
    }

    /// Orders results by distance from `point`, nearest first.
    pub fn near(&mut self, key: &str, point: ParseGeoPoint) -> Result<&mut Self, ParseError> {
        self.add_constraint(
            key,
            Constraint::Near {
                point,
                max_distance: None,
            },
        )
    }

    /// Matches points within `max_distance` radians of `point`, nearest first.
    ///
    /// # Arguments
    /// * `key` - A geo point field.
    /// * `point` - The centre of the search.
    /// * `max_distance` - Finite and non-negative, in radians.
    pub fn within_radians(
        &mut self,
        key: &str,
        point: ParseGeoPoint,
        max_distance: f64,
    ) -> Result<&mut Self, ParseError> {
        if !(max_distance.is_finite() && max_distance >= 0.0) {
            return Err(ParseError::InvalidConstraint(format!(
                "invalid max distance {}",
                max_distance
            )));
        }
        self.add_constraint(
            key,
            Constraint::Near {
                point,
                max_distance: Some(max_distance),
            },
        )
    }

    /// [`within_radians`](Self::within_radians) with the distance in kilometers.
    pub fn within_kilometers(
        &mut self,
        key: &str,
        point: ParseGeoPoint,
        max_distance: f64,
    ) -> Result<&mut Self, ParseError> {
        self.within_radians(key, point, ParseGeoPoint::kilometers_to_radians(max_distance))
    }

    /// [`within_radians`](Self::within_radians) with the distance in miles.
    pub fn within_miles(
        &mut self,
        key: &str,
        point: ParseGeoPoint,
        max_distance: f64,
    ) -> Result<&mut Self, ParseError> {
        self.within_radians(key, point, ParseGeoPoint::miles_to_radians(max_distance))
    }

    /// Matches points inside the box spanned by two corners.
    ///
    /// # Arguments
    /// * `key` - A geo point field.
    /// * `south_west` - The lower-left corner.
    /// * `north_east` - The upper-right corner; must not be south of `south_west`.
    pub fn within_geo_box(
        &mut self,
        key: &str,
        south_west: ParseGeoPoint,
        north_east: ParseGeoPoint,
    ) -> Result<&mut Self, ParseError> {
        if south_west.latitude > north_east.latitude {
            return Err(ParseError::InvalidConstraint(
                "south-west corner must be south of the north-east corner".to_string(),
            ));
        }
        self.add_constraint(
            key,
            Constraint::WithinBox {
                south_west,
                north_east,
            },
        )
    }

    /// Matches points inside `polygon`. Cannot be combined with a proximity constraint.
    pub fn within_polygon(&mut self, key: &str, polygon: &ParsePolygon) -> Result<&mut Self, ParseError> {
        self.add_constraint(key, Constraint::WithinPolygon(polygon.vertices().to_vec()))
    }

    /// For polygon fields: the stored polygon must contain `point`.
    pub fn polygon_contains(&mut self, key: &str, point: ParseGeoPoint) -> Result<&mut Self, ParseError> {
        self.add_constraint(key, Constraint::PolygonContains(point))
    }

    /// The pointer at `key` must reference an object matched by `query`.
    pub fn matches_query(&mut self, key: &str, query: &ParseQuery) -> Result<&mut Self, ParseError> {
        let compiled = query.compile()?;
        self.add_constraint(key, Constraint::MatchesQuery(Box::new(compiled)))
    }

    /// The pointer at `key` must not reference any object matched by `query`.
    pub fn does_not_match_query(&mut self, key: &str, query: &ParseQuery) -> Result<&mut Self, ParseError> {
        let compiled = query.compile()?;
        self.add_constraint(key, Constraint::DoesNotMatchQuery(Box::new(compiled)))
    }

    /// The value at `key` must equal `query_key` of some object matched by `query`.
    pub fn matches_key_in_query(
        &mut self,
        key: &str,
        query_key: &str,
        query: &ParseQuery,
    ) -> Result<&mut Self, ParseError> {
        constraint::validate_path(query_key)?;
        let compiled = query.compile()?;
        self.add_constraint(
            key,
            Constraint::MatchesKeyInQuery {
                key: query_key.to_string(),
                query: Box::new(compiled),
            },
        )
    }

    /// The value at `key` must not equal `query_key` of any object matched by `query`.
    ///
    /// # Arguments
    /// * `key` - The field on this query's class.
    /// * `query_key` - The field read from the inner query's results.
    /// * `query` - The inner query, compiled immediately.
    pub fn does_not_match_key_in_query(
        &mut self,
        key: &str,
        query_key: &str,
        query: &ParseQuery,
    ) -> Result<&mut Self, ParseError> {
        constraint::validate_path(query_key)?;
        let compiled = query.compile()?;
        self.add_constraint(
            key,
            Constraint::DoesNotMatchKeyInQuery {
                key: query_key.to_string(),
                query: Box::new(compiled),
            },
        )
    }

    /// Restricts results to members of the relation `key` on `parent`.
    pub fn related_to(&mut self, parent: &Pointer, key: &str) -> Result<&mut Self, ParseError> {
        constraint::validate_path(key)?;
        if parent.object_id.is_empty() {
            return Err(ParseError::InvalidConstraint(
                "relation parent must have an objectId".to_string(),
            ));
        }
        self.related_to = Some((parent.clone(), key.to_string()));
        Ok(self)
    }

    // --- Pagination and Sorting ---

    /// Sets the maximum number of results; any negative value removes the cap.
    pub fn limit(&mut self, count: isize) -> &mut Self {
        self.limit = if count < 0 {
            Limit::Unlimited
        } else {
            Limit::Count(count as usize)
        };
        self
    }

    /// Skips the first `count` results.
    pub fn skip(&mut self, count: usize) -> &mut Self {
        self.skip = count;
        self
    }

    /// Sorts by `key` ascending, replacing any existing order.
    pub fn ascending(&mut self, key: &str) -> &mut Self {
        self.order.clear();
        self.add_ascending(key)
    }

    /// Sorts by `key` descending, replacing any existing order.
    pub fn descending(&mut self, key: &str) -> &mut Self {
        self.order.clear();
        self.add_descending(key)
    }

    fn push_sort(&mut self, key: &str, direction: SortDirection) -> &mut Self {
        self.order.retain(|s| s.key != key);
        self.order.push(SortKey {
            key: key.to_string(),
            direction,
        });
        self
    }

    /// Appends an ascending sort key after the existing ones.
    pub fn add_ascending(&mut self, key: &str) -> &mut Self {
        self.push_sort(key, SortDirection::Ascending)
    }

    /// Appends a descending sort key after the existing ones.
    pub fn add_descending(&mut self, key: &str) -> &mut Self {
        self.push_sort(key, SortDirection::Descending)
    }

    /// Includes nested objects for the given pointer paths (dot notation).
    pub fn include(&mut self, keys_to_include: &[&str]) -> &mut Self {
        self.include
            .extend(keys_to_include.iter().map(|k| k.to_string()));
        self
    }

    /// Restricts the attributes returned.
    pub fn select(&mut self, keys_to_select: &[&str]) -> &mut Self {
        self.keys
            .extend(keys_to_select.iter().map(|k| k.to_string()));
        self
    }

    /// Compiles the query into its canonical wire form.
    pub fn compile(&self) -> Result<CompiledQuery, ParseError> {
        compiler::compile(self)
    }

    // --- Execution Methods ---

    fn find_request(&self, compiled: &CompiledQuery) -> RestRequest {
        RestRequest::new(Method::GET, format!("classes/{}", compiled.class_name))
            .with_params(compiled.to_params())
            .with_master_key(self.use_master_key)
    }

    /// Runs one find request for an already compiled query and materializes the page.
    pub(crate) async fn fetch_page(
        &self,
        client: &Parse,
        compiled: &CompiledQuery,
    ) -> Result<Vec<ParseObject>, ParseError> {
        let response = client.execute(self.find_request(compiled)).await?;
        Materializer::new(&compiled.include).materialize_results(&compiled.class_name, &response)
    }

    /// Retrieves the objects matching this query (one request).
    pub async fn find(&self, client: &Parse) -> Result<Vec<ParseObject>, ParseError> {
        let compiled = self.compile()?;
        self.fetch_page(client, &compiled).await
    }

    /// Like [`find`](ParseQuery::find), decoding each result as `T`.
    pub async fn find_as<T: ParseClass>(&self, client: &Parse) -> Result<Vec<T>, ParseError> {
        self.find(client)
            .await?
            .iter()
            .map(decode_as::<T>)
            .collect()
    }

    /// Like [`find`](ParseQuery::find), passing each result through the
    /// client's [`ClassRegistry`](crate::ClassRegistry).
    pub async fn find_decoded(&self, client: &Parse) -> Result<Vec<Decoded>, ParseError> {
        self.find(client)
            .await?
            .into_iter()
            .map(|object| client.registry().decode(object))
            .collect()
    }

    pub async fn first(&self, client: &Parse) -> Result<Option<ParseObject>, ParseError> {
        let mut compiled = self.compile()?;
        compiled.limit = Limit::Count(1);
        Ok(self.fetch_page(client, &compiled).await?.into_iter().next())
    }

    /// Fetches one object by id; other constraints are ignored, `include` and
    /// `select` still apply.
    pub async fn get(&self, object_id: &str, client: &Parse) -> Result<ParseObject, ParseError> {
        if object_id.is_empty() {
            return Err(ParseError::InvalidInput(
                "Object ID cannot be empty".to_string(),
            ));
        }
        let compiled = self.compile()?;
        let mut params = Vec::new();
        if !compiled.include.is_empty() {
            params.push(("include".to_string(), compiled.include.join(",")));
        }
        if !compiled.keys.is_empty() {
            params.push(("keys".to_string(), compiled.keys.join(",")));
        }
        let request = RestRequest::new(
            Method::GET,
            format!("classes/{}/{}", compiled.class_name, object_id),
        )
        .with_params(params)
        .with_master_key(self.use_master_key);
        let record = client.execute(request).await?;
        Materializer::new(&compiled.include).materialize(&compiled.class_name, &record)
    }

    /// Counts matching objects without returning them.
    pub async fn count(&self, client: &Parse) -> Result<u64, ParseError> {
        let mut compiled = self.compile()?;
        compiled.limit = Limit::Count(0);
        compiled.skip = 0;
        compiled.order.clear();
        compiled.include.clear();
        let mut request = self.find_request(&compiled);
        request.params.push(("count".to_string(), "1".to_string()));
        let response: CountResponse = client.execute_as(request).await?;
        Ok(response.count)
    }

    /// Distinct values of `key` among matching objects. Requires the master key.
    pub async fn distinct<T: DeserializeOwned>(&self, key: &str, client: &Parse) -> Result<Vec<T>, ParseError> {
        constraint::validate_path(key)?;
        let compiled = self.compile()?;
        let mut params = vec![("distinct".to_string(), key.to_string())];
        if !compiled.where_clause.is_empty() {
            params.push(("where".to_string(), compiled.where_json()));
        }
        let request = RestRequest::new(Method::GET, format!("aggregate/{}", compiled.class_name))
            .with_params(params)
            .with_master_key(true);
        let response: FindResponse<T> = client.execute_as(request).await?;
        Ok(response.results)
    }

    /// Runs an aggregation pipeline over the class. Requires the master key.
    pub async fn aggregate<T: DeserializeOwned>(
        &self,
        pipeline: Vec<Value>,
        client: &Parse,
    ) -> Result<Vec<T>, ParseError> {
        if pipeline.is_empty() {
            return Err(ParseError::InvalidInput(
                "aggregate pipeline cannot be empty".to_string(),
            ));
        }
        let params = vec![("pipeline".to_string(), Value::Array(pipeline).to_string())];
        let request = RestRequest::new(Method::GET, format!("aggregate/{}", self.class_name))
            .with_params(params)
            .with_master_key(true);
        let response: FindResponse<T> = client.execute_as(request).await?;
        Ok(response.results)
    }

    /// A lazy cursor over every matching object, fetched in batches.
    pub fn each(&self, client: &Parse, options: EachOptions) -> Result<QueryCursor, ParseError> {
        QueryCursor::new(client.clone(), self, options)
    }

    /// Subscribes to live changes of objects matching this query.
    pub fn subscribe(&self, live: &LiveQueryClient) -> Result<Subscription, ParseError> {
        live.subscribe(self)
    }
}

#[derive(Debug, Deserialize)]
struct FindResponse<T> {
    results: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct CountResponse {
    count: u64,
}
