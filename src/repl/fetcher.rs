//! Missing-document fetch during initial sync.
//!
//! Collection cloning can miss documents that a later update touches.
//! When an update fails to find its target mid initial sync, the document
//! is fetched from the sync source and inserted locally before the op is
//! retried by the next pass over the data.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::core::{Document, Namespace};
use crate::error::fatal;
use crate::failpoint::HANG_BEFORE_MISSING_DOC_FETCH;

use super::apply::{ApplyContext, ApplyError};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FetchError {
    /// Transient transport failure; retried with backoff.
    #[error("network failure reaching sync source: {0}")]
    Network(String),
    /// The source answered with an error; not retried.
    #[error("sync source error: {0}")]
    Remote(String),
    #[error("sync source unreachable after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },
}

/// Read access to the sync source, by UUID when the op carries one.
pub trait SyncSourceClient: Send + Sync {
    fn find_by_id(
        &self,
        ns: &Namespace,
        uuid: Option<Uuid>,
        id: &serde_json::Value,
    ) -> Result<Option<Document>, FetchError>;
}

const FETCH_RETRY_MAX: u32 = 3;

/// Fetch the document an op failed to find and insert it locally.
pub(crate) fn fetch_and_insert_missing_document(
    ctx: &ApplyContext,
    entry: &crate::core::OpEntry,
    source: &Arc<dyn SyncSourceClient>,
) -> Result<(), ApplyError> {
    ctx.fail_points
        .pause_while_active(HANG_BEFORE_MISSING_DOC_FETCH, &ctx.shutdown);

    // Resolve through the uuid so a renamed collection fetches under its
    // live name.
    let ns = match entry.uuid().and_then(|uuid| ctx.catalog.ns_for_uuid(uuid)) {
        Some(ns) => ns,
        None => entry.ns().clone(),
    };

    // Capped collections legitimately lose documents to eviction; nothing
    // to repair.
    if let Some(collection) = ctx.catalog.collection(&ns) {
        if collection.is_capped() {
            tracing::info!(%ns, "not fetching missing document in capped collection");
            return Ok(());
        }
    }

    let Some(id) = entry.id_value() else {
        fatal(
            28742,
            format!("cannot fetch missing document without _id at {}", entry.optime()),
        );
    };

    let doc = fetch_with_retry(ctx, source, &ns, entry.uuid(), id)?;
    let Some(doc) = doc else {
        tracing::info!(
            %ns,
            optime = %entry.optime(),
            "missing document not found on source; presumably deleted later in the log"
        );
        return Ok(());
    };

    // Exclusive on the database so no other writer observes the half-state.
    let db_lock = ctx.catalog.db_lock(ns.db());
    let _db = db_lock.write().expect("db lock poisoned");
    let collection = ctx.catalog.resolve(&ns, entry.uuid())?;
    collection.records().insert(doc.clone(), entry.timestamp())?;
    ctx.metrics.missing_docs_fetched.incr();
    tracing::debug!(%ns, "inserted missing document fetched from sync source");
    ctx.observer.on_missing_document_fetched(&ns, &doc);
    Ok(())
}

fn fetch_with_retry(
    ctx: &ApplyContext,
    source: &Arc<dyn SyncSourceClient>,
    ns: &Namespace,
    uuid: Option<Uuid>,
    id: &serde_json::Value,
) -> Result<Option<Document>, FetchError> {
    for attempt in 1..=FETCH_RETRY_MAX {
        if attempt != 1 {
            // Quadratic backoff to let the network recover.
            let pause = ctx.config.fetch_retry_base_ms * u64::from(attempt * attempt);
            std::thread::sleep(Duration::from_millis(pause));
        }
        match source.find_by_id(ns, uuid, id) {
            Ok(doc) => return Ok(doc),
            Err(FetchError::Network(reason)) => {
                tracing::warn!(
                    %ns,
                    attempt,
                    max = FETCH_RETRY_MAX,
                    "network problem fetching missing document: {reason}"
                );
            }
            Err(other) => return Err(other),
        }
    }
    Err(FetchError::RetriesExhausted {
        attempts: FETCH_RETRY_MAX,
    })
}
