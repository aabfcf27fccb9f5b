//! Crate-level error surface.
//!
//! Each subsystem owns its canonical error enum; this is a thin wrapper so
//! embedders can hold one type. Conditions the specification treats as
//! unrecoverable go through [`fatal`] instead of propagating.

use std::fmt;

use thiserror::Error;

use crate::catalog::CatalogError;
use crate::config::ConfigError;
use crate::core::{EntryParseError, NamespaceError};
use crate::repl::{ApplyError, TxnChainError};
use crate::storage::StorageError;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Apply(#[from] ApplyError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Entry(#[from] EntryParseError),

    #[error(transparent)]
    Namespace(#[from] NamespaceError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    TxnChain(#[from] TxnChainError),
}

/// Log-corruption and invariant-violation exits. These conditions leave no
/// safe way to continue applying: the process logs the reason and aborts,
/// leaving the crash-safe markers on disk for the next startup to recover
/// from.
pub(crate) fn fatal(code: u32, msg: impl fmt::Display) -> ! {
    tracing::error!(code, "fatal replication error: {msg}");
    std::process::abort();
}
