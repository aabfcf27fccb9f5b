//! View definitions and the per-database view cache.
//!
//! Definitions live as ordinary documents in `<db>.system.views`; the
//! cache rebuilds lazily and any write to that collection invalidates the
//! database's entry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::core::{Document, Namespace};

use super::{CatalogError, Collation};

#[derive(Clone, Debug, PartialEq)]
pub struct ViewDefinition {
    pub ns: Namespace,
    pub view_on: Namespace,
    pub pipeline: Vec<Document>,
    pub collation: Collation,
}

impl ViewDefinition {
    pub fn to_document(&self) -> Document {
        let mut doc = Document::new();
        doc.insert("_id", Value::String(self.ns.to_string()));
        doc.insert("viewOn", Value::String(self.view_on.coll().to_string()));
        doc.insert(
            "pipeline",
            Value::Array(
                self.pipeline
                    .iter()
                    .map(|stage| Value::Object(stage.0.clone()))
                    .collect(),
            ),
        );
        if self.collation == Collation::CaseInsensitive {
            doc.insert("collation", serde_json::json!({"locale": "en"}));
        }
        doc
    }

    pub fn from_document(doc: &Document) -> Result<Self, CatalogError> {
        let ns_raw = match doc.id() {
            Some(Value::String(s)) => s.clone(),
            _ => {
                return Err(CatalogError::InvalidView {
                    reason: "definition has no string _id".into(),
                })
            }
        };
        let ns = Namespace::parse(&ns_raw)?;
        let view_on = match doc.get("viewOn") {
            Some(Value::String(coll)) => Namespace::new(ns.db(), coll)?,
            _ => {
                return Err(CatalogError::InvalidView {
                    reason: format!("view {ns_raw} has no viewOn"),
                })
            }
        };
        let pipeline = match doc.get("pipeline") {
            None => Vec::new(),
            Some(Value::Array(stages)) => stages
                .iter()
                .map(|stage| match stage {
                    Value::Object(map) => Ok(Document(map.clone())),
                    _ => Err(CatalogError::InvalidView {
                        reason: format!("view {ns_raw} has a non-document pipeline stage"),
                    }),
                })
                .collect::<Result<_, _>>()?,
            Some(_) => {
                return Err(CatalogError::InvalidView {
                    reason: format!("view {ns_raw} pipeline is not an array"),
                })
            }
        };
        let collation = match doc.get("collation").and_then(|v| v.get("locale")) {
            Some(Value::String(locale)) if locale != "simple" => Collation::CaseInsensitive,
            _ => Collation::Binary,
        };
        Ok(Self {
            ns,
            view_on,
            pipeline,
            collation,
        })
    }
}

/// Lazily rebuilt per-database view definitions.
#[derive(Debug, Default)]
pub(crate) struct ViewCache {
    cache: Mutex<HashMap<String, Arc<Vec<ViewDefinition>>>>,
}

impl ViewCache {
    pub fn definitions(
        &self,
        db: &str,
        load: impl FnOnce() -> Result<Vec<ViewDefinition>, CatalogError>,
    ) -> Result<Arc<Vec<ViewDefinition>>, CatalogError> {
        let mut cache = self.cache.lock().expect("view cache poisoned");
        if let Some(defs) = cache.get(db) {
            return Ok(Arc::clone(defs));
        }
        let defs = Arc::new(load()?);
        cache.insert(db.to_string(), Arc::clone(&defs));
        Ok(defs)
    }

    pub fn invalidate(&self, db: &str) {
        self.cache.lock().expect("view cache poisoned").remove(db);
    }
}
