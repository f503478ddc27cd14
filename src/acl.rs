// src/acl.rs
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::ParseError;

/// Who a permission entry applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AclTarget {
    Public,
    User(String),
    Role(String),
}

impl AclTarget {
    fn key(&self) -> String {
        match self {
            AclTarget::Public => "*".to_string(),
            AclTarget::User(id) => id.clone(),
            AclTarget::Role(name) => format!("role:{}", name),
        }
    }
}

/// Access control list carried in the reserved `ACL` attribute.
///
/// Entries are kept ordered so two equal ACLs always serialize identically.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ParseACL {
    permissions: BTreeMap<String, AccessLevel>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct AccessLevel {
    #[serde(skip_serializing_if = "Option::is_none")]
    read: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    write: Option<bool>,
}

impl ParseACL {
    pub fn new() -> Self {
        Self::default()
    }

    /// An ACL granting public read and write.
    pub fn public_read_write() -> Self {
        let mut acl = Self::new();
        acl.set_read_access(AclTarget::Public, true);
        acl.set_write_access(AclTarget::Public, true);
        acl
    }

    pub fn set_read_access(&mut self, target: AclTarget, allowed: bool) -> &mut Self {
        self.permissions.entry(target.key()).or_default().read = Some(allowed);
        self
    }

    pub fn set_write_access(&mut self, target: AclTarget, allowed: bool) -> &mut Self {
        self.permissions.entry(target.key()).or_default().write = Some(allowed);
        self
    }

    pub fn read_access(&self, target: &AclTarget) -> bool {
        self.permissions
            .get(&target.key())
            .and_then(|access| access.read)
            .unwrap_or(false)
    }

    pub fn write_access(&self, target: &AclTarget) -> bool {
        self.permissions
            .get(&target.key())
            .and_then(|access| access.write)
            .unwrap_or(false)
    }

    pub fn set_public_read_access(&mut self, allowed: bool) -> &mut Self {
        self.set_read_access(AclTarget::Public, allowed)
    }

    pub fn set_public_write_access(&mut self, allowed: bool) -> &mut Self {
        self.set_write_access(AclTarget::Public, allowed)
    }

    pub fn public_read_access(&self) -> bool {
        self.read_access(&AclTarget::Public)
    }

    pub fn public_write_access(&self) -> bool {
        self.write_access(&AclTarget::Public)
    }

    pub fn is_empty(&self) -> bool {
        self.permissions
            .values()
            .all(|a| a.read.is_none() && a.write.is_none())
    }

    pub fn from_json(value: &Value) -> Result<Self, ParseError> {
        serde_json::from_value(value.clone())
            .map_err(|e| ParseError::JsonDeserializationFailed(format!("invalid ACL: {}", e)))
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| Value::Object(Default::default()))
    }
}

impl Serialize for ParseACL {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_map(
            self.permissions
                .iter()
                .filter(|(_, v)| v.read.is_some() || v.write.is_some()),
        )
    }
}

impl<'de> Deserialize<'de> for ParseACL {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let permissions = BTreeMap::<String, AccessLevel>::deserialize(deserializer)?;
        Ok(ParseACL { permissions })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_and_user_entries() {
        let mut acl = ParseACL::new();
        acl.set_read_access(AclTarget::User("u1".into()), true)
            .set_write_access(AclTarget::Role("Admin".into()), true);
        assert!(acl.read_access(&AclTarget::User("u1".into())));
        assert!(!acl.write_access(&AclTarget::User("u1".into())));
        assert!(acl.write_access(&AclTarget::Role("Admin".into())));
        assert!(!acl.public_read_access());
    }

    #[test]
    fn serializes_in_key_order() {
        let mut acl = ParseACL::new();
        acl.set_read_access(AclTarget::User("user1".into()), true);
        acl.set_write_access(AclTarget::Role("Admin".into()), true);
        acl.set_public_read_access(true);
        assert_eq!(
            serde_json::to_string(&acl).unwrap(),
            r#"{"*":{"read":true},"role:Admin":{"write":true},"user1":{"read":true}}"#
        );
    }

    #[test]
    fn empty_acl_serializes_to_empty_object() {
        assert_eq!(serde_json::to_string(&ParseACL::new()).unwrap(), "{}");
        assert!(ParseACL::new().is_empty());
    }

    #[test]
    fn equality_ignores_insertion_order() {
        let mut a = ParseACL::new();
        a.set_public_read_access(true);
        a.set_read_access(AclTarget::User("x".into()), true);
        let mut b = ParseACL::new();
        b.set_read_access(AclTarget::User("x".into()), true);
        b.set_public_read_access(true);
        assert_eq!(a, b);
    }

    #[test]
    fn parses_server_payload() {
        let acl = ParseACL::from_json(&serde_json::json!({"*": {"read": true}, "role:Mods": {"write": true}}))
            .unwrap();
        assert!(acl.public_read_access());
        assert!(acl.write_access(&AclTarget::Role("Mods".into())));
    }
}
