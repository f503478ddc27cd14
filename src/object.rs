// src/object.rs

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::acl::ParseACL;
use crate::client::Parse;
use crate::error::ParseError;
use crate::materializer::Materializer;
use crate::op::FieldOp;
use crate::requests::{Method, RestRequest};
use crate::types::{ParseDate, ParseValue, Pointer};

/// Attribute names owned by the server; they never appear in the attribute bag.
pub const RESERVED_KEYS: [&str; 6] = ["objectId", "createdAt", "updatedAt", "ACL", "className", "__type"];

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(0);

fn next_client_id() -> String {
    format!("c{}", NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed) + 1)
}

pub(crate) fn validate_class_name(class_name: &str) -> Result<(), ParseError> {
    if class_name.is_empty() {
        return Err(ParseError::InvalidClassName(
            "Class name cannot be empty".to_string(),
        ));
    }
    if !class_name
        .chars()
        .next()
        .is_some_and(|c| c.is_alphabetic() || c == '_')
    {
        return Err(ParseError::InvalidClassName(format!(
            "'{}' must start with a letter or underscore",
            class_name
        )));
    }
    if !class_name.chars().all(|c| c.is_alphanumeric() || c == '_') {
        return Err(ParseError::InvalidClassName(format!(
            "'{}' can only contain letters, numbers, or underscores",
            class_name
        )));
    }
    Ok(())
}

fn validate_attribute(key: &str) -> Result<(), ParseError> {
    if key.is_empty() {
        return Err(ParseError::InvalidInput("attribute name cannot be empty".to_string()));
    }
    if RESERVED_KEYS.contains(&key) {
        return Err(ParseError::InvalidInput(format!(
            "'{}' is managed by the server and cannot be modified",
            key
        )));
    }
    Ok(())
}

/// A Parse entity: server state plus pending local operations.
///
/// The server state (`server_data`) only changes through materialization,
/// a successful [`save`](ParseObject::save), or [`fetch`](ParseObject::fetch).
/// Local mutations accumulate as one [`FieldOp`] per attribute until then.
#[derive(Debug, Clone, PartialEq)]
pub struct ParseObject {
    class_name: String,
    object_id: Option<String>,
    client_id: String,
    created_at: Option<ParseDate>,
    updated_at: Option<ParseDate>,
    acl: Option<ParseACL>,
    acl_dirty: bool,
    server_data: BTreeMap<String, ParseValue>,
    pending: BTreeMap<String, FieldOp>,
}

#[derive(Debug, Default)]
pub(crate) struct ServerMetadata {
    pub object_id: Option<String>,
    pub created_at: Option<ParseDate>,
    pub updated_at: Option<ParseDate>,
    pub acl: Option<ParseACL>,
}

impl ParseObject {
    /// A new, unsaved object identified only by its client id.
    pub fn new(class_name: &str) -> Self {
        ParseObject {
            class_name: class_name.to_string(),
            object_id: None,
            client_id: next_client_id(),
            created_at: None,
            updated_at: None,
            acl: None,
            acl_dirty: false,
            server_data: BTreeMap::new(),
            pending: BTreeMap::new(),
        }
    }

    /// A reference to an existing object whose attributes have not been fetched.
    pub fn create_without_data(class_name: &str, object_id: &str) -> Self {
        let mut object = Self::new(class_name);
        object.object_id = Some(object_id.to_string());
        object
    }

    pub(crate) fn from_server(
        class_name: &str,
        metadata: ServerMetadata,
        server_data: BTreeMap<String, ParseValue>,
    ) -> Self {
        let mut object = Self::new(class_name);
        object.object_id = metadata.object_id;
        object.created_at = metadata.created_at;
        object.updated_at = metadata.updated_at;
        object.acl = metadata.acl;
        object.server_data = server_data;
        object
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn object_id(&self) -> Option<&str> {
        self.object_id.as_deref()
    }

    /// Process-local identity, stable for the life of this instance and its clones.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn created_at(&self) -> Option<&ParseDate> {
        self.created_at.as_ref()
    }

    pub fn updated_at(&self) -> Option<&ParseDate> {
        self.updated_at.as_ref()
    }

    pub fn acl(&self) -> Option<&ParseACL> {
        self.acl.as_ref()
    }

    pub fn set_acl(&mut self, acl: ParseACL) -> &mut Self {
        self.acl = Some(acl);
        self.acl_dirty = true;
        self
    }

    pub fn is_new(&self) -> bool {
        self.object_id.is_none()
    }

    pub fn to_pointer(&self) -> Result<Pointer, ParseError> {
        self.object_id
            .as_ref()
            .map(|id| Pointer::new(self.class_name.clone(), id.clone()))
            .ok_or_else(|| {
                ParseError::InvalidInput(format!(
                    "unsaved {} object ({}) has no pointer",
                    self.class_name, self.client_id
                ))
            })
    }

    // --- Reads ---

    /// The attribute value as it would be after pending ops are saved.
    pub fn get(&self, key: &str) -> Option<ParseValue> {
        match self.pending.get(key) {
            Some(op) => op.apply_to(self.server_data.get(key)),
            None => self.server_data.get(key).cloned(),
        }
    }

    /// [`get`](ParseObject::get) decoded into any deserializable type.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get(key)
            .and_then(|v| serde_json::from_value(v.to_json()).ok())
    }

    /// The last value acknowledged by the server, ignoring pending ops.
    pub fn server_value(&self, key: &str) -> Option<&ParseValue> {
        self.server_data.get(key)
    }

    pub fn has(&self, key: &str) -> bool {
        self.get(key).is_some_and(|v| !v.is_null())
    }

    /// Attribute names with a value after pending ops, in key order.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .server_data
            .keys()
            .chain(self.pending.keys())
            .filter(|k| self.get(k).is_some())
            .cloned()
            .collect();
        keys.sort();
        keys.dedup();
        keys
    }

    // --- Mutations ---

    fn record(&mut self, key: &str, op: FieldOp) -> Result<&mut Self, ParseError> {
        validate_attribute(key)?;
        let merged = match self.pending.get(key) {
            Some(previous) => op.merge_onto(previous)?,
            None => op,
        };
        self.pending.insert(key.to_string(), merged);
        Ok(self)
    }

    pub fn set(&mut self, key: &str, value: impl Into<ParseValue>) -> Result<&mut Self, ParseError> {
        self.record(key, FieldOp::Set(value.into()))
    }

    pub fn unset(&mut self, key: &str) -> Result<&mut Self, ParseError> {
        self.record(key, FieldOp::Unset)
    }

    pub fn increment(&mut self, key: &str, amount: impl Into<ParseValue>) -> Result<&mut Self, ParseError> {
        let amount = amount.into();
        if !amount.is_number() {
            return Err(ParseError::InvalidInput(format!(
                "cannot increment '{}' by a non-numeric amount",
                key
            )));
        }
        self.record(key, FieldOp::Increment(amount))
    }

    pub fn decrement(&mut self, key: &str, amount: i64) -> Result<&mut Self, ParseError> {
        let Some(negated) = amount.checked_neg() else {
            return Err(ParseError::InvalidInput(format!(
                "cannot decrement '{}' by {}",
                key, amount
            )));
        };
        self.increment(key, negated)
    }

    pub fn add<V: Into<ParseValue>>(
        &mut self,
        key: &str,
        items: impl IntoIterator<Item = V>,
    ) -> Result<&mut Self, ParseError> {
        self.record(key, FieldOp::Add(items.into_iter().map(Into::into).collect()))
    }

    pub fn add_unique<V: Into<ParseValue>>(
        &mut self,
        key: &str,
        items: impl IntoIterator<Item = V>,
    ) -> Result<&mut Self, ParseError> {
        self.record(key, FieldOp::AddUnique(items.into_iter().map(Into::into).collect()))
    }

    pub fn remove<V: Into<ParseValue>>(
        &mut self,
        key: &str,
        items: impl IntoIterator<Item = V>,
    ) -> Result<&mut Self, ParseError> {
        self.record(key, FieldOp::Remove(items.into_iter().map(Into::into).collect()))
    }

    fn relation_op(
        &mut self,
        key: &str,
        targets: &[Pointer],
        adding: bool,
    ) -> Result<&mut Self, ParseError> {
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
        let (added, removed) = if adding {
            (targets.to_vec(), Vec::new())
        } else {
            (Vec::new(), targets.to_vec())
        };
        self.record(
            key,
            FieldOp::Relation {
                target_class: first.class_name.clone(),
                added,
                removed,
            },
        )
    }

    pub fn add_relation(&mut self, key: &str, targets: &[Pointer]) -> Result<&mut Self, ParseError> {
        self.relation_op(key, targets, true)
    }

    pub fn remove_relation(&mut self, key: &str, targets: &[Pointer]) -> Result<&mut Self, ParseError> {
        self.relation_op(key, targets, false)
    }

    // --- Dirty state ---

    pub fn dirty(&self, key: &str) -> bool {
        self.pending.contains_key(key) || (key == "ACL" && self.acl_dirty)
    }

    pub fn is_dirty(&self) -> bool {
        !self.pending.is_empty() || self.acl_dirty || self.is_new()
    }

    pub fn dirty_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.pending.keys().cloned().collect();
        if self.acl_dirty {
            keys.push("ACL".to_string());
            keys.sort();
        }
        keys
    }

    /// The pending op for `key`, if any.
    pub fn op(&self, key: &str) -> Option<&FieldOp> {
        self.pending.get(key)
    }

    /// Discards every pending op.
    pub fn revert(&mut self) {
        self.pending.clear();
        self.acl_dirty = false;
    }

    /// Discards the pending ops for the given keys only.
    pub fn revert_keys(&mut self, keys: &[&str]) {
        for key in keys {
            self.pending.remove(*key);
            if *key == "ACL" {
                self.acl_dirty = false;
            }
        }
    }

    // --- Server reconciliation ---

    /// Save payload: encoded pending ops plus the ACL when it changed.
    pub fn pending_payload(&self) -> Map<String, Value> {
        let mut body: Map<String, Value> = self
            .pending
            .iter()
            .map(|(k, op)| (k.clone(), op.encode()))
            .collect();
        if self.acl_dirty {
            if let Some(acl) = &self.acl {
                body.insert("ACL".to_string(), acl.to_json());
            }
        }
        body
    }

    fn apply_pending(&mut self) {
        let pending = std::mem::take(&mut self.pending);
        for (key, op) in pending {
            match op.apply_to(self.server_data.get(&key)) {
                Some(value) => {
                    self.server_data.insert(key, value);
                }
                None => {
                    self.server_data.remove(&key);
                }
            }
        }
        self.acl_dirty = false;
    }

    /// Merges a save acknowledgement: assigns the id once, refreshes timestamps,
    /// and takes any server-computed attribute values.
    fn absorb_save_response(&mut self, response: &Value) -> Result<(), ParseError> {
        let Some(fields) = response.as_object() else {
            return Err(ParseError::UnexpectedResponse(format!(
                "save response is not an object: {}",
                response
            )));
        };

        for (key, value) in fields {
            match key.as_str() {
                "objectId" => {
                    if self.object_id.is_none() {
                        self.object_id = value.as_str().map(str::to_string);
                    }
                }
                "createdAt" => {
                    if let Some(date) = ParseDate::from_json(value) {
                        if self.updated_at.is_none() {
                            self.updated_at = Some(date.clone());
                        }
                        self.created_at = Some(date);
                    }
                }
                "updatedAt" => self.updated_at = ParseDate::from_json(value),
                "ACL" => self.acl = ParseACL::from_json(value).ok(),
                "className" | "__type" => {}
                _ => {
                    self.server_data.insert(key.clone(), ParseValue::from_json(value));
                }
            }
        }

        if self.object_id.is_none() {
            return Err(ParseError::UnexpectedResponse(
                "save response carried no objectId".to_string(),
            ));
        }
        Ok(())
    }

    /// Overlays `incoming` server state onto this object's server state.
    /// Pending ops are left alone.
    pub(crate) fn merge_server_state(&mut self, incoming: &ParseObject) {
        for (key, value) in &incoming.server_data {
            self.server_data.insert(key.clone(), value.clone());
        }
        if incoming.created_at.is_some() {
            self.created_at = incoming.created_at.clone();
        }
        if incoming.updated_at.is_some() {
            self.updated_at = incoming.updated_at.clone();
        }
        if incoming.acl.is_some() {
            self.acl = incoming.acl.clone();
        }
    }

    /// Takes `incoming` as the complete server state. Pending ops are left alone.
    pub(crate) fn adopt_server_state(&mut self, incoming: &ParseObject) {
        self.server_data = incoming.server_data.clone();
        if incoming.created_at.is_some() {
            self.created_at = incoming.created_at.clone();
        }
        if incoming.updated_at.is_some() {
            self.updated_at = incoming.updated_at.clone();
        }
        self.acl = incoming.acl.clone();
    }

    pub(crate) fn drop_server_keys(&mut self, keys: &[String]) {
        for key in keys {
            self.server_data.remove(key);
        }
    }

    fn replace_server_state(&mut self, fetched: ParseObject) {
        self.server_data = fetched.server_data;
        self.created_at = fetched.created_at;
        self.updated_at = fetched.updated_at;
        self.acl = fetched.acl;
        self.pending.clear();
        self.acl_dirty = false;
    }

    /// Full JSON record of the server state, in the shape the server returns.
    pub fn to_json(&self) -> Value {
        let mut record: Map<String, Value> = self
            .server_data
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect();
        record.insert("className".to_string(), Value::String(self.class_name.clone()));
        if let Some(id) = &self.object_id {
            record.insert("objectId".to_string(), Value::String(id.clone()));
        }
        if let Some(d) = &self.created_at {
            record.insert("createdAt".to_string(), Value::String(d.iso.clone()));
        }
        if let Some(d) = &self.updated_at {
            record.insert("updatedAt".to_string(), Value::String(d.iso.clone()));
        }
        if let Some(acl) = &self.acl {
            record.insert("ACL".to_string(), acl.to_json());
        }
        Value::Object(record)
    }

    fn endpoint(&self) -> Result<String, ParseError> {
        validate_class_name(&self.class_name)?;
        match &self.object_id {
            Some(id) => Ok(format!("classes/{}/{}", self.class_name, id)),
            None => Ok(format!("classes/{}", self.class_name)),
        }
    }

    // --- Persistence ---

    /// Sends only the pending ops (POST for new objects, PUT otherwise).
    ///
    /// On success the ops are applied to the server state, server-assigned
    /// values are merged in, dirty state is cleared, and a cached copy of this
    /// entity is refreshed. On failure the object is left exactly as it was.
    pub async fn save(&mut self, client: &Parse) -> Result<(), ParseError> {
        let endpoint = self.endpoint()?;
        let body = self.pending_payload();
        if !self.is_new() && body.is_empty() {
            log::debug!("save skipped for {}: nothing pending", endpoint);
            return Ok(());
        }

        let method = if self.is_new() { Method::POST } else { Method::PUT };
        let response = client
            .execute(RestRequest::new(method, endpoint).with_body(Value::Object(body)))
            .await?;

        let removed: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, op)| matches!(op, FieldOp::Unset))
            .map(|(key, _)| key.clone())
            .collect();
        let mut saved = self.clone();
        saved.apply_pending();
        saved.absorb_save_response(&response)?;
        *self = saved;

        client.cache().refresh_if_cached(self, &removed);
        Ok(())
    }

    /// Replaces the server state with a fresh copy and discards pending ops.
    pub async fn fetch(&mut self, client: &Parse) -> Result<(), ParseError> {
        self.fetch_with_include(client, &[]).await
    }

    pub async fn fetch_with_include(&mut self, client: &Parse, include: &[&str]) -> Result<(), ParseError> {
        if self.object_id.is_none() {
            return Err(ParseError::InvalidInput(
                "cannot fetch an object that has not been saved".to_string(),
            ));
        }
        let endpoint = self.endpoint()?;
        let mut params = Vec::new();
        if !include.is_empty() {
            params.push(("include".to_string(), include.join(",")));
        }
        let record = client
            .execute(RestRequest::new(Method::GET, endpoint).with_params(params))
            .await?;
        let fetched = Materializer::new(include.iter().copied()).materialize(&self.class_name, &record)?;
        self.replace_server_state(fetched);
        Ok(())
    }

    /// Deletes the object on the server and evicts it from the entity cache.
    pub async fn destroy(&self, client: &Parse) -> Result<(), ParseError> {
        let Some(object_id) = self.object_id.as_deref() else {
            return Ok(());
        };
        let endpoint = self.endpoint()?;
        client.execute(RestRequest::new(Method::DELETE, endpoint)).await?;
        client.cache().evict(&self.class_name, object_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn set_then_unset_is_pure_unset() {
        let mut obj = ParseObject::new("GameScore");
        obj.set("a", 1).unwrap().unset("a").unwrap();
        assert_eq!(obj.op("a"), Some(&FieldOp::Unset));
        assert_eq!(obj.get("a"), None);
        assert_eq!(obj.pending_payload()["a"], json!({"__op": "Delete"}));
    }

    #[test]
    fn increments_accumulate_into_one_op() {
        let mut obj = ParseObject::create_without_data("GameScore", "abc");
        obj.increment("score", 1).unwrap();
        obj.increment("score", 2).unwrap();
        assert_eq!(obj.op("score"), Some(&FieldOp::Increment(ParseValue::Integer(3))));
        assert_eq!(obj.dirty_keys(), vec!["score".to_string()]);
    }

    #[test]
    fn reserved_keys_are_rejected() {
        let mut obj = ParseObject::new("GameScore");
        assert!(matches!(obj.set("objectId", "x"), Err(ParseError::InvalidInput(_))));
        assert!(matches!(obj.set("", 1), Err(ParseError::InvalidInput(_))));
    }

    #[test]
    fn client_ids_are_unique() {
        let a = ParseObject::new("A");
        let b = ParseObject::new("A");
        assert_ne!(a.client_id(), b.client_id());
        assert!(a.client_id().starts_with('c'));
        assert_eq!(a.clone().client_id(), a.client_id());
    }

    #[test]
    fn revert_restores_server_values() {
        let mut data = BTreeMap::new();
        data.insert("name".to_string(), ParseValue::from("old"));
        let mut obj = ParseObject::from_server(
            "Player",
            ServerMetadata {
                object_id: Some("p1".into()),
                ..Default::default()
            },
            data,
        );
        obj.set("name", "new").unwrap().set("level", 2).unwrap();
        assert_eq!(obj.get_as::<String>("name").as_deref(), Some("new"));
        obj.revert_keys(&["name"]);
        assert_eq!(obj.get_as::<String>("name").as_deref(), Some("old"));
        assert!(obj.dirty("level"));
        obj.revert();
        assert!(!obj.is_dirty());
    }

    #[test]
    fn save_response_assigns_id_once() {
        let mut obj = ParseObject::new("Player");
        obj.set("name", "x").unwrap();
        obj.apply_pending();
        obj.absorb_save_response(&json!({"objectId": "new1", "createdAt": "2024-01-01T00:00:00.000Z"}))
            .unwrap();
        assert_eq!(obj.object_id(), Some("new1"));
        assert_eq!(obj.updated_at().map(ParseDate::iso), Some("2024-01-01T00:00:00.000Z"));

        obj.absorb_save_response(&json!({"objectId": "other", "updatedAt": "2024-01-02T00:00:00.000Z"}))
            .unwrap();
        assert_eq!(obj.object_id(), Some("new1"));
    }

    #[test]
    fn unsaved_object_has_no_pointer() {
        assert!(ParseObject::new("A").to_pointer().is_err());
        assert_eq!(
            ParseObject::create_without_data("A", "1").to_pointer().unwrap(),
            Pointer::new("A", "1")
        );
    }

    #[test]
    fn class_name_validation() {
        assert!(validate_class_name("GameScore").is_ok());
        assert!(validate_class_name("_User").is_ok());
        assert!(validate_class_name("1Bad").is_err());
        assert!(validate_class_name("Bad-Name").is_err());
    }

    #[test]
    fn decrement_rejects_overflow() {
        let mut obj = ParseObject::new("GameScore");
        obj.decrement("score", 4).unwrap();
        assert_eq!(obj.op("score"), Some(&FieldOp::Increment(ParseValue::Integer(-4))));
        assert!(matches!(
            obj.decrement("lives", i64::MIN),
            Err(ParseError::InvalidInput(_))
        ));
        assert!(!obj.dirty("lives"));
    }
}
