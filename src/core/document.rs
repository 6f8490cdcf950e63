use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// A document is the unit of storage and replication: a loosely-typed JSON
/// object, matching the "document database" data model of spec.md §3.
pub type Document = serde_json::Map<String, Value>;

/// A fully-qualified collection name, `database.collection`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Namespace(pub String);

impl Namespace {
    pub fn new(db: impl AsRef<str>, collection: impl AsRef<str>) -> Self {
        Namespace(format!("{}.{}", db.as_ref(), collection.as_ref()))
    }

    pub fn database(&self) -> &str {
        self.0.split('.').next().unwrap_or(&self.0)
    }

    pub fn is_local(&self) -> bool {
        self.database() == "local"
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Namespace {
    fn from(value: &str) -> Self {
        Namespace(value.to_string())
    }
}

impl From<String> for Namespace {
    fn from(value: String) -> Self {
        Namespace(value)
    }
}

/// A primary-key value. Documents are identified by `_id` the way MongoDB-style
/// stores are; we keep it as a `Value` since keys can be any BSON-ish scalar.
pub type PrimaryKey = Value;
