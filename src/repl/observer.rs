//! Apply-side observation points.
//!
//! A capability interface handed to the pipeline explicitly; no global
//! registration. Every method has a no-op default so observers implement
//! only what they watch.

use uuid::Uuid;

use crate::core::{Document, Namespace, OpTime};

pub trait ApplyObserver: Send + Sync {
    fn on_create_collection(&self, _ns: &Namespace, _uuid: Uuid) {}

    fn on_drop_collection(&self, _ns: &Namespace, _uuid: Uuid) {}

    fn on_inserts(&self, _ns: &Namespace, _count: usize) {}

    /// A document absent locally was fetched from the sync source and
    /// inserted during initial sync.
    fn on_missing_document_fetched(&self, _ns: &Namespace, _doc: &Document) {}

    fn on_batch_applied(&self, _last: OpTime) {}
}

#[derive(Debug, Default)]
pub struct NullObserver;

impl ApplyObserver for NullObserver {}
