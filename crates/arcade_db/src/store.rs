//! The storage substrate every backend implements.

use async_trait::async_trait;

use crate::error::{Result, StoreError};
use crate::types::{
    Attributes, BatchSelect, CancellationCode, Condition, IndexQuery, ItemKey, Page, QueryRequest,
    WriteOp,
};

/// Single-table key-value store with secondary indexes and atomic
/// conditional multi-item writes.
///
/// All range reads are ordered and resumable from [`Page::last_evaluated`].
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Short backend name for logs.
    fn backend_name(&self) -> &'static str;

    /// Fetch one item by exact key.
    async fn get_item(&self, key: &ItemKey) -> Result<Option<Attributes>>;

    /// Range read over one partition.
    async fn query(&self, request: &QueryRequest) -> Result<Page>;

    /// Range read over one hash key of a secondary index.
    async fn query_index(&self, request: &IndexQuery) -> Result<Page>;

    /// Every item under any of the requested partitions.
    async fn batch_select(&self, request: &BatchSelect) -> Result<Page>;

    /// Apply every operation or none of them.
    ///
    /// A failed condition or a concurrent writer cancels the whole batch with
    /// [`StoreError::TransactionCanceled`], one reason per operation.
    async fn transact_write(&self, ops: &[WriteOp]) -> Result<()>;

    /// Write one item, optionally conditioned on its current version.
    async fn put_item(&self, item: Attributes, condition: Option<Condition>) -> Result<()> {
        let op = WriteOp::Put { item, condition };
        single_item_write(self, op).await
    }

    /// Delete one item, optionally conditioned on its current version.
    async fn delete_item(&self, key: ItemKey, condition: Option<Condition>) -> Result<()> {
        let op = WriteOp::Delete { key, condition };
        single_item_write(self, op).await
    }
}

async fn single_item_write<S: KvStore + ?Sized>(store: &S, op: WriteOp) -> Result<()> {
    let key = op.key()?;
    match store.transact_write(std::slice::from_ref(&op)).await {
        Err(StoreError::TransactionCanceled { reasons })
            if reasons
                .iter()
                .any(|r| r.code == CancellationCode::ConditionalCheckFailed) =>
        {
            Err(StoreError::ConditionFailed { key })
        }
        other => other,
    }
}
