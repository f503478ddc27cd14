use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Represents a Pointer to another Parse object.
/// Pointers are used to create relationships between objects.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Hash)]
pub struct Pointer {
    #[serde(rename = "__type")]
    pub __type: String, // Should always be "Pointer"
    #[serde(rename = "className")]
    pub class_name: String,
    #[serde(rename = "objectId")]
    pub object_id: String,
}

impl Pointer {
    pub fn new(class_name: impl Into<String>, object_id: impl Into<String>) -> Self {
        Pointer {
            __type: "Pointer".to_string(),
            class_name: class_name.into(),
            object_id: object_id.into(),
        }
    }

    pub fn to_json(&self) -> Value {
        json!({
            "__type": "Pointer",
            "className": self.class_name,
            "objectId": self.object_id,
        })
    }
}

/// Marker stored in a relation-typed attribute. Members are reached through a query.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ParseRelation {
    #[serde(rename = "__type")]
    pub __type: String, // Should always be "Relation"
    #[serde(rename = "className")]
    pub class_name: String,
}

impl ParseRelation {
    pub fn new(class_name: impl Into<String>) -> Self {
        ParseRelation {
            __type: "Relation".to_string(),
            class_name: class_name.into(),
        }
    }
}

/// A file attribute value. Uploading is handled elsewhere; only the reference is modelled.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FileField {
    pub name: String,
    pub url: Option<String>,
    #[serde(rename = "__type")]
    pub _type: String, // Should always be "File"
}

impl FileField {
    pub fn new(name: impl Into<String>, url: Option<String>) -> Self {
        FileField {
            name: name.into(),
            url,
            _type: "File".to_string(),
        }
    }
}
