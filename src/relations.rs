// src/relations.rs

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::client::Parse;
use crate::error::ParseError;
use crate::object::ParseObject;
use crate::op::FieldOp;
use crate::query::{constraint, ParseQuery};
use crate::requests::{Method, RestRequest};
use crate::types::{ParseDate, ParseValue, Pointer};

/// A many-to-many edge set keyed by `(parent, key, target class)`.
///
/// A `Relation` never owns its targets. Membership is changed either through
/// pending ops on the parent ([`ParseObject::add_relation`]) or immediately
/// with [`Relation::add`] / [`Relation::remove`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relation {
    parent: Pointer,
    key: String,
    target_class: Option<String>,
}

impl Relation {
    pub fn new(parent: Pointer, key: &str, target_class: Option<&str>) -> Result<Self, ParseError> {
        constraint::validate_path(key)?;
        Ok(Relation {
            parent,
            key: key.to_string(),
            target_class: target_class.map(str::to_string),
        })
    }

    pub fn parent(&self) -> &Pointer {
        &self.parent
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// The target class, once known from the server schema or a pending op.
    pub fn target_class(&self) -> Option<&str> {
        self.target_class.as_deref()
    }

    pub fn with_target_class(mut self, target_class: &str) -> Self {
        self.target_class = Some(target_class.to_string());
        self
    }

    /// A query over the members of this relation.
    pub fn query(&self) -> Result<ParseQuery, ParseError> {
        let Some(target) = self.target_class.as_deref() else {
            return Err(ParseError::InvalidInput(format!(
                "target class of relation '{}' is unknown",
                self.key
            )));
        };
        let mut query = ParseQuery::new(target);
        query.related_to(&self.parent, &self.key)?;
        Ok(query)
    }

    /// Adds `targets` to the relation right away.
    ///
    /// Returns the parent's new `updatedAt`. Usually needs the master key or a
    /// session allowed to write the parent.
    pub async fn add(&mut self, client: &Parse, targets: &[Pointer]) -> Result<ParseDate, ParseError> {
        self.update(client, targets, true).await
    }

    /// Removes `targets` from the relation right away.
    pub async fn remove(&mut self, client: &Parse, targets: &[Pointer]) -> Result<ParseDate, ParseError> {
        self.update(client, targets, false).await
    }

    async fn update(
        &mut self,
        client: &Parse,
        targets: &[Pointer],
        adding: bool,
    ) -> Result<ParseDate, ParseError> {
        let Some(first) = targets.first() else {
            return Err(ParseError::InvalidInput(
                "relation targets cannot be empty".to_string(),
            ));
        };
        if targets.iter().any(|p| p.class_name != first.class_name) {
            return Err(ParseError::InvalidInput(
                "relation targets must all belong to one class".to_string(),
            ));
        }
        if let Some(known) = &self.target_class {
            if known != &first.class_name {
                return Err(ParseError::InvalidInput(format!(
                    "relation '{}' holds {} objects, not {}",
                    self.key, known, first.class_name
                )));
            }
        }

        let (added, removed) = if adding {
            (targets.to_vec(), Vec::new())
        } else {
            (Vec::new(), targets.to_vec())
        };
        let op = FieldOp::Relation {
            target_class: first.class_name.clone(),
            added,
            removed,
        };
        let mut body = Map::new();
        body.insert(self.key.clone(), op.encode());

        #[derive(Deserialize)]
        struct UpdateResponse {
            #[serde(rename = "updatedAt")]
            updated_at: String,
        }

        let endpoint = format!(
            "classes/{}/{}",
            self.parent.class_name, self.parent.object_id
        );
        let response: UpdateResponse = client
            .execute_as(RestRequest::new(Method::PUT, endpoint).with_body(Value::Object(body)))
            .await?;

        self.target_class = Some(first.class_name.clone());
        Ok(ParseDate::new(response.updated_at))
    }
}

impl ParseObject {
    /// The relation stored at `key`. The object must be saved.
    ///
    /// The target class comes from the server value at `key` or, failing that,
    /// from a pending relation op; it stays unknown otherwise.
    pub fn relation(&self, key: &str) -> Result<Relation, ParseError> {
        let parent = self.to_pointer()?;
        let target_class = match (self.server_value(key), self.op(key)) {
            (Some(ParseValue::Relation(rel)), _) => Some(rel.class_name.as_str()),
            (_, Some(FieldOp::Relation { target_class, .. })) => Some(target_class.as_str()),
            (Some(other), _) => {
                return Err(ParseError::InvalidInput(format!(
                    "'{}' holds {:?}, not a relation",
                    key, other
                )))
            }
            _ => None,
        };
        Relation::new(parent, key, target_class)
    }
}
