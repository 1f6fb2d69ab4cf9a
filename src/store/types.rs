//! Types for the replicated table store.
//!
//! Everything the sync layer moves around (table ids, row keys, rows, cursors, event batches)
//! is defined here so that the indexer and ledger clients decode into the same model.

use crate::utils::{decode_hex, encode_hex};

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Column holding the packed static fields of a raw record.
pub const STATIC_DATA: &str = "staticData";
/// Column holding the packed lengths of the dynamic fields of a raw record.
pub const ENCODED_LENGTHS: &str = "encodedLengths";
/// Column holding the concatenated dynamic fields of a raw record.
pub const DYNAMIC_DATA: &str = "dynamicData";

/// Largest byte offset a splice may touch inside a record section.
pub const MAX_SPLICE_END: usize = 1 << 24;

const NAMESPACE_BYTES: usize = 14;
const NAME_BYTES: usize = 16;

/// Validation errors for store identifiers and encoded values
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreTypeError {
    #[error("Namespace too long: {0} (max 14 bytes)")]
    NamespaceTooLong(String),

    #[error("Table name too long: {0} (max 16 bytes)")]
    NameTooLong(String),

    #[error("Unknown resource type tag: {0}")]
    UnknownResourceType(String),

    #[error("Invalid hex value: {0}")]
    InvalidHex(String),

    #[error("Invalid length: expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("Invalid UTF-8 in resource id: {0}")]
    InvalidUtf8(String),

    #[error("Splice of {len} bytes at offset {start} is out of bounds")]
    SpliceOutOfBounds { start: usize, len: usize },
}

pub(crate) fn decode_fixed<const N: usize>(value: &str) -> Result<[u8; N], StoreTypeError> {
    let bytes =
        decode_hex(value).map_err(|e| StoreTypeError::InvalidHex(format!("{}: {}", value, e)))?;
    <[u8; N]>::try_from(bytes.as_slice()).map_err(|_| StoreTypeError::InvalidLength {
        expected: N,
        actual: bytes.len(),
    })
}

/// Kind of resource a table id refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceType {
    /// On-chain table (`tb`)
    Table,
    /// Offchain table (`ot`), only ever observed through events
    OffchainTable,
}

impl ResourceType {
    fn tag(self) -> [u8; 2] {
        match self {
            ResourceType::Table => *b"tb",
            ResourceType::OffchainTable => *b"ot",
        }
    }

    fn from_tag(tag: [u8; 2]) -> Result<Self, StoreTypeError> {
        match &tag {
            b"tb" => Ok(ResourceType::Table),
            b"ot" => Ok(ResourceType::OffchainTable),
            _ => Err(StoreTypeError::UnknownResourceType(hex::encode(tag))),
        }
    }
}

/// Identifier of a table: resource type, namespace and name.
///
/// Encodes to a 32-byte resource id (`type[2] | namespace[14] | name[16]`, zero padded), which is
/// how the ledger and the indexer refer to tables.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableId {
    resource_type: ResourceType,
    namespace: String,
    name: String,
}

impl TableId {
    /// Create an on-chain table id.
    pub fn new(namespace: &str, name: &str) -> Result<Self, StoreTypeError> {
        Self::with_type(ResourceType::Table, namespace, name)
    }

    /// Create an offchain table id.
    pub fn offchain(namespace: &str, name: &str) -> Result<Self, StoreTypeError> {
        Self::with_type(ResourceType::OffchainTable, namespace, name)
    }

    fn with_type(
        resource_type: ResourceType,
        namespace: &str,
        name: &str,
    ) -> Result<Self, StoreTypeError> {
        if namespace.len() > NAMESPACE_BYTES {
            return Err(StoreTypeError::NamespaceTooLong(namespace.to_string()));
        }
        if name.len() > NAME_BYTES {
            return Err(StoreTypeError::NameTooLong(name.to_string()));
        }
        Ok(Self {
            resource_type,
            namespace: namespace.to_string(),
            name: name.to_string(),
        })
    }

    pub fn resource_type(&self) -> ResourceType {
        self.resource_type
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Encode into the 32-byte resource id.
    pub fn to_bytes(&self) -> [u8; 32] {
        let mut out = [0u8; 32];
        out[..2].copy_from_slice(&self.resource_type.tag());
        out[2..2 + self.namespace.len()].copy_from_slice(self.namespace.as_bytes());
        out[16..16 + self.name.len()].copy_from_slice(self.name.as_bytes());
        out
    }

    /// Decode a 32-byte resource id.
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, StoreTypeError> {
        let resource_type = ResourceType::from_tag([bytes[0], bytes[1]])?;
        let namespace = trim_padding(&bytes[2..16])?;
        let name = trim_padding(&bytes[16..32])?;
        Self::with_type(resource_type, &namespace, &name)
    }

    pub fn to_hex(&self) -> String {
        encode_hex(&self.to_bytes())
    }

    pub fn from_hex(value: &str) -> Result<Self, StoreTypeError> {
        Self::from_bytes(&decode_fixed::<32>(value)?)
    }
}

fn trim_padding(bytes: &[u8]) -> Result<String, StoreTypeError> {
    let end = bytes.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1);
    String::from_utf8(bytes[..end].to_vec()).map_err(|e| StoreTypeError::InvalidUtf8(e.to_string()))
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.name)
    }
}

impl FromStr for TableId {
    type Err = StoreTypeError;

    /// Parse `namespace:name`, or a bare `name` in the root namespace.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((namespace, name)) => TableId::new(namespace.trim(), name.trim()),
            None => TableId::new("", s.trim()),
        }
    }
}

/// A typed column value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Value {
    Bool(bool),
    Uint(u64),
    Int(i64),
    Bytes(Vec<u8>),
    String(String),
}

impl Value {
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(v) => write!(f, "{}", v),
            Value::Uint(v) => write!(f, "{}", v),
            Value::Int(v) => write!(f, "{}", v),
            Value::Bytes(v) => write!(f, "{}", encode_hex(v)),
            Value::String(v) => write!(f, "{:?}", v),
        }
    }
}

/// Composite key of a row: ordered tuple of key-column values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RowKey(pub Vec<Value>);

impl RowKey {
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    /// Build a key from 32-byte key words, the way store events encode key tuples.
    pub fn from_words<I: IntoIterator<Item = [u8; 32]>>(words: I) -> Self {
        Self(words.into_iter().map(|w| Value::Bytes(w.to_vec())).collect())
    }

    pub fn values(&self) -> &[Value] {
        &self.0
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, value) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", value)?;
        }
        write!(f, ")")
    }
}

/// Column name to value for one row.
pub type Row = BTreeMap<String, Value>;

/// Build a row holding a raw record in its three byte columns.
pub fn raw_record(static_data: Vec<u8>, encoded_lengths: Vec<u8>, dynamic_data: Vec<u8>) -> Row {
    let mut row = Row::new();
    row.insert(STATIC_DATA.to_string(), Value::Bytes(static_data));
    row.insert(ENCODED_LENGTHS.to_string(), Value::Bytes(encoded_lengths));
    row.insert(DYNAMIC_DATA.to_string(), Value::Bytes(dynamic_data));
    row
}

/// Position in the event log: block number, then log index inside the block.
///
/// `Cursor::default()` is the position before any block; block 0 never carries store events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Cursor {
    pub block_number: u64,
    pub log_index: u64,
}

impl Cursor {
    pub fn new(block_number: u64, log_index: u64) -> Self {
        Self {
            block_number,
            log_index,
        }
    }

    /// Position covering every event of `block_number`.
    pub fn end_of_block(block_number: u64) -> Self {
        Self::new(block_number, u64::MAX)
    }

    /// Position right before the first event of `block_number`.
    pub fn before_block(block_number: u64) -> Self {
        match block_number.checked_sub(1) {
            Some(previous) => Self::end_of_block(previous),
            None => Self::default(),
        }
    }

    pub fn is_end_of_block(&self) -> bool {
        self.log_index == u64::MAX
    }

    /// First block that may still contain events after this cursor.
    pub fn next_block(&self) -> u64 {
        if self.is_end_of_block() {
            self.block_number.saturating_add(1)
        } else {
            self.block_number
        }
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_end_of_block() {
            write!(f, "#{}", self.block_number)
        } else {
            write!(f, "#{}:{}", self.block_number, self.log_index)
        }
    }
}

/// Hash identifying a submitted transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TxHash(pub [u8; 32]);

impl TxHash {
    pub fn from_hex(value: &str) -> Result<Self, StoreTypeError> {
        decode_fixed::<32>(value).map(Self)
    }
}

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", encode_hex(&self.0))
    }
}

/// Account address on the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address(pub [u8; 20]);

impl Address {
    pub fn from_hex(value: &str) -> Result<Self, StoreTypeError> {
        decode_fixed::<20>(value).map(Self)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", encode_hex(&self.0))
    }
}

impl FromStr for Address {
    type Err = StoreTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Address::from_hex(s)
    }
}

/// Operation carried by a row event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowOp {
    /// Replace the whole row.
    Set(Row),
    /// Remove the row.
    Delete,
    /// Overwrite bytes of the static section starting at `start`.
    SpliceStatic { start: usize, data: Vec<u8> },
    /// Replace `delete_count` bytes of the dynamic section at `start` with `data`.
    SpliceDynamic {
        start: usize,
        delete_count: usize,
        encoded_lengths: Vec<u8>,
        data: Vec<u8>,
    },
}

impl RowOp {
    /// Reject a splice whose byte range overflows or ends past `MAX_SPLICE_END`.
    pub fn check_bounds(&self) -> Result<(), StoreTypeError> {
        let (start, len) = match self {
            RowOp::Set(_) | RowOp::Delete => return Ok(()),
            RowOp::SpliceStatic { start, data } => (*start, data.len()),
            RowOp::SpliceDynamic {
                start,
                delete_count,
                data,
                ..
            } => (*start, (*delete_count).max(data.len())),
        };
        match start.checked_add(len) {
            Some(end) if end <= MAX_SPLICE_END => Ok(()),
            _ => Err(StoreTypeError::SpliceOutOfBounds { start, len }),
        }
    }
}

/// A single row-level change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowEvent {
    pub table: TableId,
    pub key: RowKey,
    pub op: RowOp,
    /// Index of the log inside its block
    pub log_index: u64,
    /// Transaction that emitted the event, when the source reports it
    pub transaction_hash: Option<TxHash>,
}

/// Ordered row events sharing one cursor position, applied as one unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventBatch {
    pub cursor: Cursor,
    pub events: Vec<RowEvent>,
}

impl EventBatch {
    pub fn new(cursor: Cursor, events: Vec<RowEvent>) -> Self {
        Self { cursor, events }
    }

    /// A batch with no events; applying it only advances the cursor.
    pub fn empty(cursor: Cursor) -> Self {
        Self::new(cursor, Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Log position of one of this batch's events.
    pub fn position_of(&self, event: &RowEvent) -> Cursor {
        Cursor::new(self.cursor.block_number, event.log_index)
    }

    /// Transactions with at least one event in this batch.
    pub fn transaction_hashes(&self) -> impl Iterator<Item = &TxHash> {
        self.events
            .iter()
            .filter_map(|event| event.transaction_hash.as_ref())
    }
}
