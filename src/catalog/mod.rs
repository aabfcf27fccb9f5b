//! The collection catalog.
//!
//! Owns every live collection and keeps three mappings in agreement:
//! `uuid -> Collection`, `namespace -> uuid`, and the database listing.
//! Rename mutates only the namespace mapping, atomically. The catalog also
//! hands out per-database locks and serves cached view definitions.

mod collection;
mod views;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use thiserror::Error;
use uuid::Uuid;

use crate::core::{Namespace, NamespaceError};

pub use collection::{Collation, Collection, CollectionOptions, IndexSpec};
pub use views::ViewDefinition;
use views::ViewCache;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CatalogError {
    #[error("namespace not found: {0}")]
    NamespaceNotFound(String),
    #[error("no collection with uuid {0}")]
    UuidNotFound(Uuid),
    #[error("namespace already exists: {0}")]
    NamespaceExists(Namespace),
    #[error("rename target already exists: {0}")]
    RenameTargetExists(Namespace),
    #[error("rename across databases: {from} -> {to}")]
    RenameAcrossDatabases { from: Namespace, to: Namespace },
    #[error("invalid view definition: {reason}")]
    InvalidView { reason: String },
    #[error(transparent)]
    Namespace(#[from] NamespaceError),
}

impl CatalogError {
    pub fn is_namespace_not_found(&self) -> bool {
        matches!(
            self,
            CatalogError::NamespaceNotFound(_) | CatalogError::UuidNotFound(_)
        )
    }
}

#[derive(Default)]
struct Inner {
    by_uuid: HashMap<Uuid, Arc<Collection>>,
    by_ns: HashMap<Namespace, Uuid>,
}

#[derive(Default)]
pub struct Catalog {
    inner: RwLock<Inner>,
    db_locks: Mutex<HashMap<String, Arc<RwLock<()>>>>,
    views: ViewCache,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// The database lock. Catalog mutations and `system.views` writes take
    /// it exclusively; CRUD application takes it shared.
    pub fn db_lock(&self, db: &str) -> Arc<RwLock<()>> {
        let mut locks = self.db_locks.lock().expect("db lock table poisoned");
        Arc::clone(locks.entry(db.to_string()).or_default())
    }

    pub fn create_collection(
        &self,
        ns: Namespace,
        uuid: Option<Uuid>,
        options: CollectionOptions,
    ) -> Result<Arc<Collection>, CatalogError> {
        let uuid = uuid.unwrap_or_else(Uuid::new_v4);
        let mut inner = self.inner.write().expect("catalog poisoned");
        if inner.by_ns.contains_key(&ns) {
            return Err(CatalogError::NamespaceExists(ns));
        }
        let collection = Collection::new(ns.clone(), uuid, options);
        inner.by_uuid.insert(uuid, Arc::clone(&collection));
        inner.by_ns.insert(ns.clone(), uuid);
        drop(inner);

        if ns.is_system_dot_views() {
            self.views.invalidate(ns.db());
        }
        tracing::debug!(%ns, %uuid, "created collection");
        Ok(collection)
    }

    pub fn drop_collection(&self, ns: &Namespace) -> Result<Uuid, CatalogError> {
        let mut inner = self.inner.write().expect("catalog poisoned");
        let uuid = inner
            .by_ns
            .remove(ns)
            .ok_or_else(|| CatalogError::NamespaceNotFound(ns.to_string()))?;
        inner.by_uuid.remove(&uuid);
        drop(inner);

        if ns.is_system_dot_views() {
            self.views.invalidate(ns.db());
        }
        tracing::debug!(%ns, %uuid, "dropped collection");
        Ok(uuid)
    }

    /// Atomically repoint a collection to a new namespace. Only the
    /// namespace mapping changes; the UUID and the live object survive.
    pub fn rename_collection(
        &self,
        from: &Namespace,
        to: Namespace,
        drop_target: bool,
    ) -> Result<(), CatalogError> {
        if from.db() != to.db() {
            return Err(CatalogError::RenameAcrossDatabases {
                from: from.clone(),
                to,
            });
        }
        let mut inner = self.inner.write().expect("catalog poisoned");
        if let Some(&target_uuid) = inner.by_ns.get(&to) {
            if !drop_target {
                return Err(CatalogError::RenameTargetExists(to));
            }
            inner.by_ns.remove(&to);
            inner.by_uuid.remove(&target_uuid);
        }
        let uuid = inner
            .by_ns
            .remove(from)
            .ok_or_else(|| CatalogError::NamespaceNotFound(from.to_string()))?;
        inner.by_ns.insert(to.clone(), uuid);
        let collection = inner
            .by_uuid
            .get(&uuid)
            .cloned()
            .expect("uuid map agrees with ns map");
        collection.set_ns(to.clone());
        drop(inner);

        tracing::debug!(%from, %to, %uuid, "renamed collection");
        Ok(())
    }

    /// Drop every collection in `db`. Returns the dropped namespaces.
    pub fn drop_database(&self, db: &str) -> Vec<Namespace> {
        let mut inner = self.inner.write().expect("catalog poisoned");
        let victims: Vec<Namespace> = inner
            .by_ns
            .keys()
            .filter(|ns| ns.db() == db)
            .cloned()
            .collect();
        for ns in &victims {
            if let Some(uuid) = inner.by_ns.remove(ns) {
                inner.by_uuid.remove(&uuid);
            }
        }
        drop(inner);
        self.views.invalidate(db);
        tracing::debug!(db, count = victims.len(), "dropped database");
        victims
    }

    pub fn collection(&self, ns: &Namespace) -> Option<Arc<Collection>> {
        let inner = self.inner.read().expect("catalog poisoned");
        let uuid = inner.by_ns.get(ns)?;
        inner.by_uuid.get(uuid).cloned()
    }

    pub fn collection_by_uuid(&self, uuid: Uuid) -> Option<Arc<Collection>> {
        let inner = self.inner.read().expect("catalog poisoned");
        inner.by_uuid.get(&uuid).cloned()
    }

    pub fn ns_for_uuid(&self, uuid: Uuid) -> Option<Namespace> {
        self.collection_by_uuid(uuid).map(|c| c.ns())
    }

    /// Resolve an op's target, preferring the UUID when it carries one.
    pub fn resolve(
        &self,
        ns: &Namespace,
        uuid: Option<Uuid>,
    ) -> Result<Arc<Collection>, CatalogError> {
        if let Some(uuid) = uuid {
            return self
                .collection_by_uuid(uuid)
                .ok_or(CatalogError::UuidNotFound(uuid));
        }
        self.collection(ns)
            .ok_or_else(|| CatalogError::NamespaceNotFound(ns.to_string()))
    }

    pub fn list_namespaces(&self, db: &str) -> Vec<Namespace> {
        let inner = self.inner.read().expect("catalog poisoned");
        let mut out: Vec<Namespace> = inner
            .by_ns
            .keys()
            .filter(|ns| ns.db() == db)
            .cloned()
            .collect();
        out.sort();
        out
    }

    /// Cached view definitions for `db`, rebuilt from `<db>.system.views`
    /// on first use after an invalidation.
    pub fn view_definitions(&self, db: &str) -> Result<Arc<Vec<ViewDefinition>>, CatalogError> {
        self.views.definitions(db, || {
            let Ok(views_ns) = Namespace::system_views(db) else {
                return Ok(Vec::new());
            };
            let Some(collection) = self.collection(&views_ns) else {
                return Ok(Vec::new());
            };
            collection
                .records()
                .all_docs()
                .iter()
                .map(ViewDefinition::from_document)
                .collect()
        })
    }

    pub fn invalidate_views(&self, db: &str) {
        self.views.invalidate(db);
    }

    /// Persist a view definition, creating `<db>.system.views` on demand.
    pub fn create_view(&self, definition: &ViewDefinition) -> Result<(), CatalogError> {
        let views_ns = Namespace::system_views(definition.ns.db())?;
        let collection = match self.collection(&views_ns) {
            Some(collection) => collection,
            None => self.create_collection(views_ns.clone(), None, CollectionOptions::default())?,
        };
        collection
            .records()
            .insert(definition.to_document(), crate::core::Timestamp::NULL)
            .map_err(|err| CatalogError::InvalidView {
                reason: err.to_string(),
            })?;
        self.views.invalidate(definition.ns.db());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ns(raw: &str) -> Namespace {
        Namespace::parse(raw).expect("ns")
    }

    fn assert_maps_agree(catalog: &Catalog, expect: &[(&str, Uuid)]) {
        for (raw, uuid) in expect {
            let namespace = ns(raw);
            let by_ns = catalog.collection(&namespace).expect("by ns");
            let by_uuid = catalog.collection_by_uuid(*uuid).expect("by uuid");
            assert_eq!(by_ns.uuid(), *uuid);
            assert_eq!(by_uuid.ns(), namespace);
            assert_eq!(catalog.ns_for_uuid(*uuid), Some(namespace));
        }
    }

    #[test]
    fn create_drop_keep_mappings_in_agreement() {
        let catalog = Catalog::new();
        let a = catalog
            .create_collection(ns("app.a"), None, CollectionOptions::default())
            .expect("create");
        let b = catalog
            .create_collection(ns("app.b"), None, CollectionOptions::default())
            .expect("create");
        assert_maps_agree(&catalog, &[("app.a", a.uuid()), ("app.b", b.uuid())]);

        assert!(matches!(
            catalog.create_collection(ns("app.a"), None, CollectionOptions::default()),
            Err(CatalogError::NamespaceExists(_))
        ));

        let dropped = catalog.drop_collection(&ns("app.a")).expect("drop");
        assert_eq!(dropped, a.uuid());
        assert!(catalog.collection(&ns("app.a")).is_none());
        assert!(catalog.collection_by_uuid(a.uuid()).is_none());
        assert_maps_agree(&catalog, &[("app.b", b.uuid())]);
    }

    #[test]
    fn rename_mutates_only_namespace_mapping() {
        let catalog = Catalog::new();
        let coll = catalog
            .create_collection(ns("app.old"), None, CollectionOptions::default())
            .expect("create");
        catalog
            .rename_collection(&ns("app.old"), ns("app.new"), false)
            .expect("rename");

        assert!(catalog.collection(&ns("app.old")).is_none());
        assert_maps_agree(&catalog, &[("app.new", coll.uuid())]);
        // Same live object, same uuid.
        assert_eq!(coll.ns(), ns("app.new"));
    }

    #[test]
    fn rename_with_drop_target_replaces_existing() {
        let catalog = Catalog::new();
        let src = catalog
            .create_collection(ns("app.src"), None, CollectionOptions::default())
            .expect("create");
        let dst = catalog
            .create_collection(ns("app.dst"), None, CollectionOptions::default())
            .expect("create");

        assert!(matches!(
            catalog.rename_collection(&ns("app.src"), ns("app.dst"), false),
            Err(CatalogError::RenameTargetExists(_))
        ));
        catalog
            .rename_collection(&ns("app.src"), ns("app.dst"), true)
            .expect("rename with dropTarget");
        assert!(catalog.collection_by_uuid(dst.uuid()).is_none());
        assert_maps_agree(&catalog, &[("app.dst", src.uuid())]);
    }

    #[test]
    fn rename_across_databases_is_rejected() {
        let catalog = Catalog::new();
        catalog
            .create_collection(ns("app.src"), None, CollectionOptions::default())
            .expect("create");
        assert!(matches!(
            catalog.rename_collection(&ns("app.src"), ns("other.dst"), false),
            Err(CatalogError::RenameAcrossDatabases { .. })
        ));
    }

    #[test]
    fn resolve_prefers_uuid() {
        let catalog = Catalog::new();
        let coll = catalog
            .create_collection(ns("app.a"), None, CollectionOptions::default())
            .expect("create");
        catalog
            .rename_collection(&ns("app.a"), ns("app.b"), false)
            .expect("rename");

        // The stale namespace fails, the uuid still resolves.
        assert!(catalog.resolve(&ns("app.a"), None).is_err());
        let resolved = catalog
            .resolve(&ns("app.a"), Some(coll.uuid()))
            .expect("resolve by uuid");
        assert_eq!(resolved.ns(), ns("app.b"));
    }

    #[test]
    fn view_cache_invalidates_on_writes() {
        let catalog = Catalog::new();
        assert!(catalog.view_definitions("app").expect("defs").is_empty());

        let definition = ViewDefinition {
            ns: ns("app.recent"),
            view_on: ns("app.events"),
            pipeline: vec![],
            collation: Collation::Binary,
        };
        catalog.create_view(&definition).expect("create view");

        let defs = catalog.view_definitions("app").expect("defs");
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0], definition);

        // Dropping system.views empties the cache too.
        catalog
            .drop_collection(&ns("app.system.views"))
            .expect("drop");
        assert!(catalog.view_definitions("app").expect("defs").is_empty());
    }

    #[test]
    fn drop_database_removes_only_that_database() {
        let catalog = Catalog::new();
        catalog
            .create_collection(ns("app.a"), None, CollectionOptions::default())
            .expect("create");
        catalog
            .create_collection(ns("app.b"), None, CollectionOptions::default())
            .expect("create");
        let other = catalog
            .create_collection(ns("other.c"), None, CollectionOptions::default())
            .expect("create");

        let mut dropped = catalog.drop_database("app");
        dropped.sort();
        assert_eq!(dropped, vec![ns("app.a"), ns("app.b")]);
        assert_maps_agree(&catalog, &[("other.c", other.uuid())]);
    }
}
