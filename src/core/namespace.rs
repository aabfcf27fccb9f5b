//! Namespace naming and classification.
//!
//! A namespace is `<database>.<collection>`. Naming rules are enforced at
//! parse time so the catalog can assume every `Namespace` it sees is valid.

use std::fmt;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

const DB_FORBIDDEN: &[char] = &['/', '\\', '.', ' ', '"', '$', '\0'];

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum NamespaceError {
    #[error("namespace {0:?} has no dot separator")]
    MissingSeparator(String),
    #[error("invalid database name {0:?}")]
    InvalidDatabaseName(String),
    #[error("invalid collection name {0:?}")]
    InvalidCollectionName(String),
}

/// A fully qualified collection name.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Namespace {
    db: String,
    coll: String,
}

impl Namespace {
    pub fn new(db: &str, coll: &str) -> Result<Self, NamespaceError> {
        validate_db_name(db)?;
        validate_coll_name(coll)?;
        Ok(Self {
            db: db.to_string(),
            coll: coll.to_string(),
        })
    }

    pub fn parse(ns: &str) -> Result<Self, NamespaceError> {
        let (db, coll) = ns
            .split_once('.')
            .ok_or_else(|| NamespaceError::MissingSeparator(ns.to_string()))?;
        Self::new(db, coll)
    }

    pub fn db(&self) -> &str {
        &self.db
    }

    pub fn coll(&self) -> &str {
        &self.coll
    }

    pub fn is_command(&self) -> bool {
        self.coll == "$cmd"
    }

    pub fn is_system_dot_views(&self) -> bool {
        self.coll == "system.views"
    }

    /// The feature-compatibility document lives here; its updates must be
    /// applied in isolation.
    pub fn is_server_configuration(&self) -> bool {
        self.db == "admin" && self.coll == "system.version"
    }

    pub fn is_config_transactions(&self) -> bool {
        self.db == "config" && self.coll == "transactions"
    }

    pub fn is_oplog(&self) -> bool {
        self.db == "local" && self.coll == "oplog.rs"
    }

    pub fn oplog() -> Self {
        Self {
            db: "local".into(),
            coll: "oplog.rs".into(),
        }
    }

    pub fn min_valid() -> Self {
        Self {
            db: "local".into(),
            coll: "replset.minvalid".into(),
        }
    }

    pub fn oplog_truncate_after_point() -> Self {
        Self {
            db: "local".into(),
            coll: "replset.oplogTruncateAfterPoint".into(),
        }
    }

    pub fn applied_through() -> Self {
        Self {
            db: "local".into(),
            coll: "replset.appliedThrough".into(),
        }
    }

    pub fn config_transactions() -> Self {
        Self {
            db: "config".into(),
            coll: "transactions".into(),
        }
    }

    pub fn system_views(db: &str) -> Result<Self, NamespaceError> {
        validate_db_name(db)?;
        Ok(Self {
            db: db.to_string(),
            coll: "system.views".into(),
        })
    }
}

pub(crate) fn validate_db_name(db: &str) -> Result<(), NamespaceError> {
    if db.is_empty() || db.len() > 64 || db.contains(DB_FORBIDDEN) {
        return Err(NamespaceError::InvalidDatabaseName(db.to_string()));
    }
    Ok(())
}

pub(crate) fn validate_coll_name(coll: &str) -> Result<(), NamespaceError> {
    if coll.is_empty() || coll.contains('\0') {
        return Err(NamespaceError::InvalidCollectionName(coll.to_string()));
    }
    if coll.starts_with('$') && coll != "$cmd" {
        return Err(NamespaceError::InvalidCollectionName(coll.to_string()));
    }
    Ok(())
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.db, self.coll)
    }
}

impl fmt::Debug for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Namespace({}.{})", self.db, self.coll)
    }
}

impl Serialize for Namespace {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{}.{}", self.db, self.coll))
    }
}

impl<'de> Deserialize<'de> for Namespace {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Namespace::parse(&raw).map_err(D::Error::custom)
    }
}
