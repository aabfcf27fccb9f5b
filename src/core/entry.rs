//! Parsed replication log entries.
//!
//! An `OpEntry` is immutable once parsed and keeps its raw encoded bytes so
//! the entry can be persisted to the local log verbatim. Transaction
//! reconstruction rebuilds inner entries at the commit position via
//! [`OpEntry::at_commit_envelope`].

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use super::{Document, Namespace, NamespaceError, OpTime, SessionId, Timestamp};

/// Log format version this engine understands. A mismatch means the log is
/// corrupt or written by an incompatible producer and is fatal.
pub const OPLOG_VERSION: i64 = 2;

#[derive(Debug, Error)]
pub enum EntryParseError {
    #[error("entry is not a document: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("entry missing required field {0:?}")]
    MissingField(&'static str),
    #[error("entry field {field:?} has the wrong type")]
    WrongType { field: &'static str },
    #[error("unknown op tag {0:?}")]
    UnknownOpTag(String),
    #[error(transparent)]
    Namespace(#[from] NamespaceError),
    #[error("entry field {field:?} is not a uuid: {source}")]
    Uuid {
        field: &'static str,
        source: uuid::Error,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OpType {
    Noop,
    Insert,
    Update,
    Delete,
    Command,
}

impl OpType {
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "n" => Some(OpType::Noop),
            "i" => Some(OpType::Insert),
            "u" => Some(OpType::Update),
            "d" => Some(OpType::Delete),
            "c" => Some(OpType::Command),
            _ => None,
        }
    }

    pub fn tag(self) -> &'static str {
        match self {
            OpType::Noop => "n",
            OpType::Insert => "i",
            OpType::Update => "u",
            OpType::Delete => "d",
            OpType::Command => "c",
        }
    }

    pub fn is_crud(self) -> bool {
        matches!(self, OpType::Insert | OpType::Update | OpType::Delete)
    }
}

/// Command subtype carried in the payload of a `c` entry. The subtype is
/// the payload's first field name.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandKind {
    Create,
    Drop,
    DropDatabase,
    RenameCollection,
    CreateIndexes,
    DropIndexes,
    ApplyOps,
    CommitTransaction,
    AbortTransaction,
    PrepareTransaction,
}

impl CommandKind {
    pub fn from_command_name(name: &str) -> Option<Self> {
        match name {
            "create" => Some(CommandKind::Create),
            "drop" => Some(CommandKind::Drop),
            "dropDatabase" => Some(CommandKind::DropDatabase),
            "renameCollection" => Some(CommandKind::RenameCollection),
            "createIndexes" => Some(CommandKind::CreateIndexes),
            "dropIndexes" => Some(CommandKind::DropIndexes),
            "applyOps" => Some(CommandKind::ApplyOps),
            "commitTransaction" => Some(CommandKind::CommitTransaction),
            "abortTransaction" => Some(CommandKind::AbortTransaction),
            "prepareTransaction" => Some(CommandKind::PrepareTransaction),
            _ => None,
        }
    }
}

/// One replication log entry, parsed. Field meanings follow the producer
/// contract: `ts`/`t` the position, `v` the format version, `op` the type
/// tag, `ns` the namespace, `ui` the collection uuid, `o` the payload,
/// `o2` the update target, plus session/transaction envelope fields.
#[derive(Clone, Debug)]
pub struct OpEntry {
    raw: Bytes,
    optime: OpTime,
    wall: SystemTime,
    op_type: OpType,
    ns: Namespace,
    uuid: Option<Uuid>,
    doc: Document,
    doc2: Option<Document>,
    session_id: Option<SessionId>,
    txn_number: Option<i64>,
    stmt_id: Option<i64>,
    prev_optime: Option<OpTime>,
    prepare: bool,
    partial_txn: bool,
    version: i64,
}

impl OpEntry {
    /// Parse an entry from its encoded form. The bytes are retained.
    pub fn parse(raw: Bytes) -> Result<Self, EntryParseError> {
        let doc = Document::from_bytes(&raw)?;
        Self::from_parts(raw, doc)
    }

    /// Build an entry from an assembled document, encoding it as the raw
    /// form. Used for synthesized entries (session-table updates,
    /// transaction reconstruction).
    pub fn from_document(doc: Document) -> Result<Self, EntryParseError> {
        let raw = doc.to_bytes();
        Self::from_parts(raw, doc)
    }

    fn from_parts(raw: Bytes, doc: Document) -> Result<Self, EntryParseError> {
        let ts: Timestamp = take_typed(&doc, "ts")?;
        let term = take_i64(&doc, "t")?;
        let version = match doc.get("v") {
            Some(Value::Number(n)) => n.as_i64().ok_or(EntryParseError::WrongType { field: "v" })?,
            Some(_) => return Err(EntryParseError::WrongType { field: "v" }),
            None => OPLOG_VERSION,
        };
        let op_tag = take_str(&doc, "op")?;
        let op_type =
            OpType::from_tag(op_tag).ok_or_else(|| EntryParseError::UnknownOpTag(op_tag.into()))?;
        let ns = Namespace::parse(take_str(&doc, "ns")?)?;
        let uuid = match doc.get("ui") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(
                Uuid::parse_str(s).map_err(|source| EntryParseError::Uuid { field: "ui", source })?,
            ),
            Some(_) => return Err(EntryParseError::WrongType { field: "ui" }),
        };
        let payload = match doc.get("o") {
            Some(Value::Object(map)) => Document(map.clone()),
            Some(_) => return Err(EntryParseError::WrongType { field: "o" }),
            None => return Err(EntryParseError::MissingField("o")),
        };
        let doc2 = match doc.get("o2") {
            None | Some(Value::Null) => None,
            Some(Value::Object(map)) => Some(Document(map.clone())),
            Some(_) => return Err(EntryParseError::WrongType { field: "o2" }),
        };
        let wall_ms = match doc.get("wall") {
            Some(Value::Number(n)) => n
                .as_u64()
                .ok_or(EntryParseError::WrongType { field: "wall" })?,
            Some(_) => return Err(EntryParseError::WrongType { field: "wall" }),
            None => return Err(EntryParseError::MissingField("wall")),
        };
        let session_id = match doc.get("lsid") {
            None | Some(Value::Null) => None,
            Some(Value::Object(map)) => match map.get("id") {
                Some(Value::String(s)) => Some(SessionId(Uuid::parse_str(s).map_err(|source| {
                    EntryParseError::Uuid {
                        field: "lsid",
                        source,
                    }
                })?)),
                _ => return Err(EntryParseError::WrongType { field: "lsid" }),
            },
            Some(_) => return Err(EntryParseError::WrongType { field: "lsid" }),
        };
        let txn_number = opt_i64(&doc, "txnNumber")?;
        let stmt_id = opt_i64(&doc, "stmtId")?;
        let prev_optime = match doc.get("prevOpTime") {
            None | Some(Value::Null) => None,
            Some(v) => Some(
                serde_json::from_value::<OpTime>(v.clone())
                    .map_err(|_| EntryParseError::WrongType { field: "prevOpTime" })?,
            ),
        };

        Ok(Self {
            raw,
            optime: OpTime::new(ts, term),
            wall: UNIX_EPOCH + Duration::from_millis(wall_ms),
            op_type,
            ns,
            uuid,
            doc: payload,
            doc2,
            session_id,
            txn_number,
            stmt_id,
            prev_optime,
            prepare: opt_bool(&doc, "prepare")?,
            partial_txn: opt_bool(&doc, "partialTxn")?,
            version,
        })
    }

    pub fn raw(&self) -> &Bytes {
        &self.raw
    }

    pub fn raw_len(&self) -> usize {
        self.raw.len()
    }

    pub fn optime(&self) -> OpTime {
        self.optime
    }

    pub fn timestamp(&self) -> Timestamp {
        self.optime.ts
    }

    pub fn term(&self) -> i64 {
        self.optime.term
    }

    pub fn wall(&self) -> SystemTime {
        self.wall
    }

    pub fn op_type(&self) -> OpType {
        self.op_type
    }

    pub fn ns(&self) -> &Namespace {
        &self.ns
    }

    pub fn uuid(&self) -> Option<Uuid> {
        self.uuid
    }

    pub fn payload(&self) -> &Document {
        &self.doc
    }

    pub fn target(&self) -> Option<&Document> {
        self.doc2.as_ref()
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session_id
    }

    pub fn txn_number(&self) -> Option<i64> {
        self.txn_number
    }

    pub fn prev_optime(&self) -> Option<OpTime> {
        self.prev_optime
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    pub fn is_crud(&self) -> bool {
        self.op_type.is_crud()
    }

    pub fn is_command(&self) -> bool {
        self.op_type == OpType::Command
    }

    pub fn command_kind(&self) -> Option<CommandKind> {
        if !self.is_command() {
            return None;
        }
        self.doc.first_field().and_then(CommandKind::from_command_name)
    }

    pub fn should_prepare(&self) -> bool {
        self.prepare
    }

    /// Whether this entry belongs to a multi-entry transaction that has not
    /// committed yet. Such entries are withheld from lane assignment until
    /// the commit arrives.
    pub fn is_in_pending_txn(&self) -> bool {
        self.partial_txn
    }

    /// A `commitTransaction` for a transaction that was never prepared.
    /// Expands to plain CRUD at apply time, so it may batch freely.
    pub fn is_unprepared_commit(&self) -> bool {
        self.command_kind() == Some(CommandKind::CommitTransaction)
            && matches!(self.doc.get("prepared"), Some(Value::Bool(false)))
    }

    /// A self-contained atomic `applyOps`, as opposed to one that is part
    /// of a prepared transaction.
    pub fn is_unprepared_apply_ops(&self) -> bool {
        self.command_kind() == Some(CommandKind::ApplyOps) && !self.prepare
    }

    /// The `_id` this entry targets: the update/delete key document's
    /// `_id` when present, else the payload's.
    pub fn id_value(&self) -> Option<&Value> {
        match self.doc2.as_ref().and_then(|d| d.id()) {
            Some(id) => Some(id),
            None => self.doc.id(),
        }
    }

    /// The replicated-operation projection: just what the op does, with
    /// the envelope (position, session, transaction) stripped.
    pub fn repl_operation(&self) -> Document {
        let mut out = Document::new();
        out.insert("op", Value::String(self.op_type.tag().into()));
        out.insert("ns", Value::String(self.ns.to_string()));
        if let Some(uuid) = self.uuid {
            out.insert("ui", Value::String(uuid.to_string()));
        }
        out.insert("o", Value::Object(self.doc.0.clone()));
        if let Some(doc2) = &self.doc2 {
            out.insert("o2", Value::Object(doc2.0.clone()));
        }
        out
    }

    /// Rebuild this entry as if it had occurred at the commit (or prepare)
    /// position: the operation projection with the commit entry's envelope
    /// overlaid where this entry does not already provide a field.
    pub fn at_commit_envelope(&self, commit: &OpEntry) -> Result<OpEntry, EntryParseError> {
        let mut out = self.repl_operation();
        let commit_doc = Document::from_bytes(commit.raw())?;
        for (field, value) in &commit_doc.0 {
            if !out.contains(field) {
                out.insert(field.clone(), value.clone());
            }
        }
        OpEntry::from_document(out)
    }
}

fn take_str<'d>(doc: &'d Document, field: &'static str) -> Result<&'d str, EntryParseError> {
    match doc.get(field) {
        Some(Value::String(s)) => Ok(s),
        Some(_) => Err(EntryParseError::WrongType { field }),
        None => Err(EntryParseError::MissingField(field)),
    }
}

fn take_i64(doc: &Document, field: &'static str) -> Result<i64, EntryParseError> {
    match doc.get(field) {
        Some(Value::Number(n)) => n.as_i64().ok_or(EntryParseError::WrongType { field }),
        Some(_) => Err(EntryParseError::WrongType { field }),
        None => Err(EntryParseError::MissingField(field)),
    }
}

fn opt_i64(doc: &Document, field: &'static str) -> Result<Option<i64>, EntryParseError> {
    match doc.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_i64()
            .map(Some)
            .ok_or(EntryParseError::WrongType { field }),
        Some(_) => Err(EntryParseError::WrongType { field }),
    }
}

fn opt_bool(doc: &Document, field: &'static str) -> Result<bool, EntryParseError> {
    match doc.get(field) {
        None | Some(Value::Null) => Ok(false),
        Some(Value::Bool(b)) => Ok(*b),
        Some(_) => Err(EntryParseError::WrongType { field }),
    }
}

fn take_typed<T: serde::de::DeserializeOwned>(
    doc: &Document,
    field: &'static str,
) -> Result<T, EntryParseError> {
    let value = doc
        .get(field)
        .ok_or(EntryParseError::MissingField(field))?;
    serde_json::from_value(value.clone()).map_err(|_| EntryParseError::WrongType { field })
}
