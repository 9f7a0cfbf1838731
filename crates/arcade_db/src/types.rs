//! Item, key, condition and request types shared by every backend.
//!
//! Items are opaque string-keyed attribute maps. Only the attributes named in
//! [`crate::schema`] carry storage meaning.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;

use crate::error::{Result, StoreError};
use crate::schema::{Index, ATTR_PK, ATTR_SK, MAX_TRANSACTION_ITEMS};

/// An item: every attribute, key attributes included.
pub type Attributes = serde_json::Map<String, Value>;

/// Read a string attribute.
pub fn string_attr<'a>(item: &'a Attributes, name: &str) -> Option<&'a str> {
    item.get(name).and_then(Value::as_str)
}

// ============================================================================
// Keys
// ============================================================================

/// Primary key of one item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemKey {
    pub pk: String,
    pub sk: String,
}

impl ItemKey {
    pub fn new(pk: impl Into<String>, sk: impl Into<String>) -> Self {
        Self {
            pk: pk.into(),
            sk: sk.into(),
        }
    }

    /// Extract the primary key of an item.
    pub fn of(item: &Attributes) -> Result<Self> {
        let pk = string_attr(item, ATTR_PK)
            .ok_or_else(|| StoreError::validation("item is missing string attribute 'pk'"))?;
        let sk = string_attr(item, ATTR_SK)
            .ok_or_else(|| StoreError::validation("item is missing string attribute 'sk'"))?;
        Ok(Self::new(pk, sk))
    }
}

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.pk, self.sk)
    }
}

/// Position of an item inside a secondary index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexPosition {
    pub hash: String,
    pub range: String,
}

/// Continuation marker: scans resume strictly after this key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartKey {
    pub pk: String,
    pub sk: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<IndexPosition>,
}

impl StartKey {
    pub fn table(pk: impl Into<String>, sk: impl Into<String>) -> Self {
        Self {
            pk: pk.into(),
            sk: sk.into(),
            index: None,
        }
    }

    pub fn indexed(
        pk: impl Into<String>,
        sk: impl Into<String>,
        hash: impl Into<String>,
        range: impl Into<String>,
    ) -> Self {
        Self {
            pk: pk.into(),
            sk: sk.into(),
            index: Some(IndexPosition {
                hash: hash.into(),
                range: range.into(),
            }),
        }
    }

    /// Ordering tuple inside an index: `(range, pk, sk)`.
    pub(crate) fn index_order(&self) -> Option<(&str, &str, &str)> {
        self.index
            .as_ref()
            .map(|p| (p.range.as_str(), self.pk.as_str(), self.sk.as_str()))
    }
}

// ============================================================================
// Conditions and write operations
// ============================================================================

/// Precondition evaluated against the current version of an item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Condition {
    /// The item must not exist
    NotExists,
    /// The item must exist
    Exists,
    /// The item must exist and carry `name == value`
    AttributeEquals { name: String, value: Value },
}

impl Condition {
    pub fn attribute_equals(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::AttributeEquals {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn evaluate(&self, existing: Option<&Attributes>) -> bool {
        match (self, existing) {
            (Condition::NotExists, existing) => existing.is_none(),
            (Condition::Exists, existing) => existing.is_some(),
            (Condition::AttributeEquals { name, value }, Some(item)) => {
                item.get(name) == Some(value)
            }
            (Condition::AttributeEquals { .. }, None) => false,
        }
    }
}

/// One operation of a transactional write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum WriteOp {
    /// Replace the whole item
    Put {
        item: Attributes,
        condition: Option<Condition>,
    },
    /// Remove the item by exact key
    Delete {
        key: ItemKey,
        condition: Option<Condition>,
    },
}

impl WriteOp {
    pub fn put(item: Attributes) -> Self {
        Self::Put {
            item,
            condition: None,
        }
    }

    pub fn put_if(item: Attributes, condition: Condition) -> Self {
        Self::Put {
            item,
            condition: Some(condition),
        }
    }

    pub fn delete(key: ItemKey) -> Self {
        Self::Delete {
            key,
            condition: None,
        }
    }

    pub fn delete_if(key: ItemKey, condition: Condition) -> Self {
        Self::Delete {
            key,
            condition: Some(condition),
        }
    }

    /// Key of the item this operation touches.
    pub fn key(&self) -> Result<ItemKey> {
        match self {
            WriteOp::Put { item, .. } => ItemKey::of(item),
            WriteOp::Delete { key, .. } => Ok(key.clone()),
        }
    }

    pub fn condition(&self) -> Option<&Condition> {
        match self {
            WriteOp::Put { condition, .. } | WriteOp::Delete { condition, .. } => {
                condition.as_ref()
            }
        }
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, WriteOp::Delete { .. })
    }
}

/// Validate a transactional write and return the key of every operation.
///
/// Rejects empty batches, batches above [`MAX_TRANSACTION_ITEMS`] and batches
/// touching the same item twice.
pub fn validate_transaction(ops: &[WriteOp]) -> Result<Vec<ItemKey>> {
    if ops.is_empty() {
        return Err(StoreError::validation("transaction has no operations"));
    }
    if ops.len() > MAX_TRANSACTION_ITEMS {
        return Err(StoreError::validation(format!(
            "transaction has {} operations, limit is {}",
            ops.len(),
            MAX_TRANSACTION_ITEMS
        )));
    }
    let mut seen = HashSet::with_capacity(ops.len());
    let mut keys = Vec::with_capacity(ops.len());
    for op in ops {
        let key = op.key()?;
        if !seen.insert(key.clone()) {
            return Err(StoreError::validation(format!(
                "transaction touches item {} more than once",
                key
            )));
        }
        keys.push(key);
    }
    Ok(keys)
}

// ============================================================================
// Cancellation reasons
// ============================================================================

/// Per-operation outcome of a cancelled transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CancellationCode {
    /// This operation was fine; another one cancelled the transaction
    None,
    /// The operation's condition did not hold
    ConditionalCheckFailed,
    /// A concurrent writer held the item
    TransactionConflict,
}

impl CancellationCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CancellationCode::None => "None",
            CancellationCode::ConditionalCheckFailed => "ConditionalCheckFailed",
            CancellationCode::TransactionConflict => "TransactionConflict",
        }
    }
}

/// Why one operation of a cancelled transaction did not apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancellationReason {
    pub code: CancellationCode,
    pub key: ItemKey,
    pub message: Option<String>,
}

impl CancellationReason {
    pub fn none(key: ItemKey) -> Self {
        Self {
            code: CancellationCode::None,
            key,
            message: None,
        }
    }

    pub fn condition_failed(key: ItemKey) -> Self {
        Self {
            code: CancellationCode::ConditionalCheckFailed,
            key,
            message: Some("The conditional request failed".to_string()),
        }
    }

    pub fn conflict(key: ItemKey, message: impl Into<String>) -> Self {
        Self {
            code: CancellationCode::TransactionConflict,
            key,
            message: Some(message.into()),
        }
    }

    /// True when this operation itself caused the cancellation.
    pub fn is_failure(&self) -> bool {
        self.code != CancellationCode::None
    }
}

impl fmt::Display for CancellationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(message) => write!(f, "{} {}: {}", self.code.as_str(), self.key, message),
            None => write!(f, "{} {}", self.code.as_str(), self.key),
        }
    }
}

// ============================================================================
// Read requests
// ============================================================================

/// Range read over one partition of the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryRequest {
    pub partition: String,
    pub sort_prefix: Option<String>,
    pub ascending: bool,
    pub limit: Option<usize>,
    pub exclusive_start: Option<StartKey>,
}

impl QueryRequest {
    pub fn partition(pk: impl Into<String>) -> Self {
        Self {
            partition: pk.into(),
            sort_prefix: None,
            ascending: true,
            limit: None,
            exclusive_start: None,
        }
    }

    pub fn with_sort_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.sort_prefix = Some(prefix.into());
        self
    }

    pub fn descending(mut self) -> Self {
        self.ascending = false;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn starting_after(mut self, start: Option<StartKey>) -> Self {
        self.exclusive_start = start;
        self
    }
}

/// Range read over one hash key of a secondary index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexQuery {
    pub index: Index,
    pub hash: String,
    pub range_prefix: Option<String>,
    pub ascending: bool,
    pub limit: Option<usize>,
    pub exclusive_start: Option<StartKey>,
}

impl IndexQuery {
    pub fn new(index: Index, hash: impl Into<String>) -> Self {
        Self {
            index,
            hash: hash.into(),
            range_prefix: None,
            ascending: true,
            limit: None,
            exclusive_start: None,
        }
    }

    pub fn with_range_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.range_prefix = Some(prefix.into());
        self
    }

    pub fn descending(mut self) -> Self {
        self.ascending = false;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn starting_after(mut self, start: Option<StartKey>) -> Self {
        self.exclusive_start = start;
        self
    }
}

/// Every item whose partition key is one of `partitions`, ordered by `(pk, sk)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchSelect {
    pub partitions: Vec<String>,
    pub limit: Option<usize>,
    pub exclusive_start: Option<StartKey>,
}

impl BatchSelect {
    pub fn new(partitions: Vec<String>) -> Self {
        Self {
            partitions,
            limit: None,
            exclusive_start: None,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn starting_after(mut self, start: Option<StartKey>) -> Self {
        self.exclusive_start = start;
        self
    }
}

/// One page of a read.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub items: Vec<Attributes>,
    /// Resume point; `None` once the read is exhausted.
    pub last_evaluated: Option<StartKey>,
}

impl Page {
    pub fn is_exhausted(&self) -> bool {
        self.last_evaluated.is_none()
    }
}

pub(crate) fn validate_limit(limit: Option<usize>) -> Result<()> {
    match limit {
        Some(0) => Err(StoreError::validation("limit must be positive")),
        _ => Ok(()),
    }
}

/// Compare two `(range, pk, sk)` tuples in scan direction.
pub(crate) fn directional(ord: Ordering, ascending: bool) -> Ordering {
    if ascending {
        ord
    } else {
        ord.reverse()
    }
}
