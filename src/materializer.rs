// src/materializer.rs

use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use crate::acl::ParseACL;
use crate::error::ParseError;
use crate::object::{ParseObject, ServerMetadata};
use crate::types::{ParseDate, ParseValue};

/// Turns raw server records into [`ParseObject`]s.
///
/// One materializer covers one response batch: nested objects reached through
/// include paths are shared (same `Arc`) whenever they carry the same
/// `(className, objectId)`. The first occurrence in the batch wins.
#[derive(Debug, Default)]
pub struct Materializer {
    include: BTreeSet<String>,
    identity: HashMap<(String, String), Arc<ParseObject>>,
}

impl Materializer {
    /// `include_paths` uses dot notation; every prefix of a path is included too.
    pub fn new<S: AsRef<str>>(include_paths: impl IntoIterator<Item = S>) -> Self {
        let mut include = BTreeSet::new();
        for path in include_paths {
            let path = path.as_ref();
            if path == "*" {
                include.insert("*".to_string());
                continue;
            }
            let mut prefix = String::new();
            for segment in path.split('.').filter(|s| !s.is_empty()) {
                if !prefix.is_empty() {
                    prefix.push('.');
                }
                prefix.push_str(segment);
                include.insert(prefix.clone());
            }
        }
        Materializer {
            include,
            identity: HashMap::new(),
        }
    }

    fn is_included(&self, path: &str) -> bool {
        self.include.contains(path) || (self.include.contains("*") && !path.contains('.'))
    }

    /// Materializes one top-level record of `class_name`.
    pub fn materialize(&mut self, class_name: &str, record: &Value) -> Result<ParseObject, ParseError> {
        let Some(fields) = record.as_object() else {
            return Err(ParseError::UnexpectedResponse(format!(
                "expected a {} record, got {}",
                class_name, record
            )));
        };
        self.materialize_fields(class_name, fields, "")
    }

    /// Materializes a `{"results": [...]}` page.
    pub fn materialize_results(
        &mut self,
        class_name: &str,
        response: &Value,
    ) -> Result<Vec<ParseObject>, ParseError> {
        let results = response
            .get("results")
            .and_then(Value::as_array)
            .ok_or_else(|| {
                ParseError::UnexpectedResponse(format!("missing results array in {}", response))
            })?;
        results
            .iter()
            .map(|record| self.materialize(class_name, record))
            .collect()
    }

    fn materialize_fields(
        &mut self,
        class_name: &str,
        fields: &Map<String, Value>,
        path_prefix: &str,
    ) -> Result<ParseObject, ParseError> {
        let mut metadata = ServerMetadata::default();
        let mut data = BTreeMap::new();

        for (key, value) in fields {
            match key.as_str() {
                "objectId" => metadata.object_id = value.as_str().map(str::to_string),
                "createdAt" => metadata.created_at = ParseDate::from_json(value),
                "updatedAt" => metadata.updated_at = ParseDate::from_json(value),
                "ACL" => metadata.acl = Some(ParseACL::from_json(value)?),
                "className" | "__type" => {}
                _ => {
                    let path = if path_prefix.is_empty() {
                        key.clone()
                    } else {
                        format!("{}.{}", path_prefix, key)
                    };
                    data.insert(key.clone(), self.decode_value(&path, value)?);
                }
            }
        }

        Ok(ParseObject::from_server(class_name, metadata, data))
    }

    fn decode_value(&mut self, path: &str, value: &Value) -> Result<ParseValue, ParseError> {
        if !self.is_included(path) {
            return Ok(ParseValue::from_json(value));
        }
        match value {
            Value::Object(map) if map.get("__type").and_then(Value::as_str) == Some("Object") => {
                self.decode_nested(path, map)
            }
            Value::Array(items) => items
                .iter()
                .map(|item| self.decode_value(path, item))
                .collect::<Result<Vec<_>, _>>()
                .map(ParseValue::Array),
            _ => Ok(ParseValue::from_json(value)),
        }
    }

    fn decode_nested(&mut self, path: &str, map: &Map<String, Value>) -> Result<ParseValue, ParseError> {
        let class_name = map
            .get("className")
            .and_then(Value::as_str)
            .ok_or_else(|| ParseError::UnexpectedResponse(format!("included object at '{}' has no className", path)))?
            .to_string();
        let object_id = map.get("objectId").and_then(Value::as_str).map(str::to_string);

        if let Some(id) = &object_id {
            if let Some(existing) = self.identity.get(&(class_name.clone(), id.clone())) {
                return Ok(ParseValue::Object(Arc::clone(existing)));
            }
        }

        let nested = Arc::new(self.materialize_fields(&class_name, map, path)?);
        if let Some(id) = object_id {
            self.identity.insert((class_name, id), Arc::clone(&nested));
        }
        Ok(ParseValue::Object(nested))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Pointer;
    use serde_json::json;

    fn team(id: &str, name: &str) -> Value {
        json!({"__type": "Object", "className": "Team", "objectId": id, "name": name})
    }

    #[test]
    fn splits_reserved_fields_and_stays_clean() {
        let mut m = Materializer::new(Vec::<String>::new());
        let obj = m
            .materialize(
                "GameScore",
                &json!({
                    "objectId": "g1",
                    "createdAt": "2024-01-01T00:00:00.000Z",
                    "updatedAt": "2024-01-02T00:00:00.000Z",
                    "ACL": {"*": {"read": true}},
                    "score": 10
                }),
            )
            .unwrap();
        assert_eq!(obj.object_id(), Some("g1"));
        assert!(obj.acl().unwrap().public_read_access());
        assert_eq!(obj.keys(), vec!["score".to_string()]);
        assert!(!obj.is_dirty());
    }

    #[test]
    fn pointer_stays_pointer_unless_included() {
        let record = json!({"objectId": "g1", "team": team("t1", "Reds")});

        let plain = Materializer::new(Vec::<String>::new())
            .materialize("GameScore", &record)
            .unwrap();
        assert_eq!(plain.get("team"), Some(ParseValue::Pointer(Pointer::new("Team", "t1"))));

        let included = Materializer::new(["team"]).materialize("GameScore", &record).unwrap();
        let nested = included.get("team").unwrap();
        let nested = nested.as_object().unwrap();
        assert_eq!(nested.get_as::<String>("name").as_deref(), Some("Reds"));
    }

    #[test]
    fn nested_include_paths_include_prefixes() {
        let record = json!({
            "objectId": "g1",
            "team": {
                "__type": "Object", "className": "Team", "objectId": "t1",
                "coach": {"__type": "Object", "className": "Coach", "objectId": "c1", "name": "Ann"},
                "owner": {"__type": "Object", "className": "Owner", "objectId": "o1"}
            }
        });
        let obj = Materializer::new(["team.coach"]).materialize("GameScore", &record).unwrap();
        let team = obj.get("team").unwrap();
        let team = team.as_object().unwrap();
        assert!(team.get("coach").unwrap().as_object().is_some());
        assert_eq!(team.get("owner"), Some(ParseValue::Pointer(Pointer::new("Owner", "o1"))));
    }

    #[test]
    fn same_entity_in_one_batch_shares_identity() {
        let response = json!({"results": [
            {"objectId": "g1", "team": team("t1", "Reds")},
            {"objectId": "g2", "team": team("t1", "Reds (stale)")}
        ]});
        let objs = Materializer::new(["team"])
            .materialize_results("GameScore", &response)
            .unwrap();
        let a = objs[0].get("team").unwrap();
        let b = objs[1].get("team").unwrap();
        assert!(Arc::ptr_eq(a.as_object().unwrap(), b.as_object().unwrap()));
        assert_eq!(
            b.as_object().unwrap().get_as::<String>("name").as_deref(),
            Some("Reds")
        );
    }

    #[test]
    fn rejects_non_object_records() {
        let err = Materializer::default().materialize("A", &json!([1])).unwrap_err();
        assert!(matches!(err, ParseError::UnexpectedResponse(_)));
    }
}
