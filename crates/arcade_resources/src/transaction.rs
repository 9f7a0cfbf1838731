//! Transaction assembly and execution.

use std::collections::HashMap;
use std::sync::Arc;

use arcade_db::{Attributes, Condition, ItemKey, KvStore, StoreError, WriteOp};
use tracing::{debug, error, warn};

use crate::error::{ResourceError, Result};

/// An in-flight transactional write.
///
/// Holds at most one operation per item key. A later operation on a key
/// already pending replaces the earlier one, so the batch keeps the meaning
/// of applying the calls in order.
#[derive(Debug, Default, Clone)]
pub struct TransactionBuilder {
    ops: Vec<WriteOp>,
    pending: HashMap<ItemKey, usize>,
}

impl TransactionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an unconditional put.
    pub fn put(&mut self, item: Attributes) -> Result<()> {
        self.push(WriteOp::put(item))
    }

    /// Queue a put guarded by `condition`.
    pub fn put_if(&mut self, item: Attributes, condition: Condition) -> Result<()> {
        self.push(WriteOp::put_if(item, condition))
    }

    /// Queue a delete. Returns `false` when a delete for the key is already
    /// queued and nothing changed.
    pub fn delete(&mut self, key: ItemKey) -> bool {
        self.delete_op(WriteOp::delete(key))
    }

    /// Queue a delete guarded by `condition`, unless one is already queued.
    pub fn delete_if(&mut self, key: ItemKey, condition: Condition) -> bool {
        self.delete_op(WriteOp::delete_if(key, condition))
    }

    fn delete_op(&mut self, op: WriteOp) -> bool {
        let key = match &op {
            WriteOp::Delete { key, .. } => key.clone(),
            WriteOp::Put { .. } => return false,
        };
        if let Some(&index) = self.pending.get(&key) {
            if self.ops[index].is_delete() {
                debug!(key = %key, "delete already queued, skipping");
                return false;
            }
            self.ops[index] = op;
            return true;
        }
        self.pending.insert(key, self.ops.len());
        self.ops.push(op);
        true
    }

    /// Queue any operation, replacing a pending one on the same key.
    pub fn push(&mut self, op: WriteOp) -> Result<()> {
        let key = op.key()?;
        match self.pending.get(&key) {
            Some(&index) => self.ops[index] = op,
            None => {
                self.pending.insert(key, self.ops.len());
                self.ops.push(op);
            }
        }
        Ok(())
    }

    pub fn extend(&mut self, ops: impl IntoIterator<Item = WriteOp>) -> Result<()> {
        for op in ops {
            self.push(op)?;
        }
        Ok(())
    }

    pub fn contains(&self, key: &ItemKey) -> bool {
        self.pending.contains_key(key)
    }

    /// True when a delete for `key` is queued.
    pub fn deletes(&self, key: &ItemKey) -> bool {
        self.pending
            .get(key)
            .is_some_and(|&index| self.ops[index].is_delete())
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }
}

/// Applies transactional writes, retrying when the store cancels them.
#[derive(Clone)]
pub struct TransactionExecutor {
    store: Arc<dyn KvStore>,
    retries: u32,
}

impl std::fmt::Debug for TransactionExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionExecutor")
            .field("backend", &self.store.backend_name())
            .field("retries", &self.retries)
            .finish()
    }
}

impl TransactionExecutor {
    pub fn new(store: Arc<dyn KvStore>, retries: u32) -> Self {
        Self { store, retries }
    }

    /// Apply a builder's operations. An empty builder is a no-op.
    pub async fn execute(&self, transaction: TransactionBuilder) -> Result<()> {
        self.execute_ops(transaction.ops()).await
    }

    /// Apply `ops` atomically. An empty slice is a no-op.
    pub async fn execute_ops(&self, ops: &[WriteOp]) -> Result<()> {
        if ops.is_empty() {
            warn!("Skipping empty transaction");
            return Ok(());
        }
        self.execute_with_retries(ops, self.retries.max(1)).await
    }

    /// Apply `ops`, making up to `attempts` tries while the store answers with
    /// a cancellation. Other errors surface immediately.
    pub async fn execute_with_retries(&self, ops: &[WriteOp], attempts: u32) -> Result<()> {
        let attempts = attempts.max(1);
        let mut attempt = 1;
        loop {
            debug!(operations = ops.len(), attempt, attempts, "Executing transaction");
            match self.store.transact_write(ops).await {
                Ok(()) => {
                    debug!(operations = ops.len(), attempt, "Transaction committed");
                    return Ok(());
                }
                Err(StoreError::TransactionCanceled { reasons }) => {
                    let failed: Vec<String> = reasons
                        .iter()
                        .filter(|r| r.is_failure())
                        .map(|r| r.to_string())
                        .collect();
                    if attempt < attempts {
                        warn!(attempt, attempts, reasons = ?failed, "Transaction cancelled, retrying");
                        attempt += 1;
                        continue;
                    }
                    warn!(attempts, reasons = ?failed, "Transaction cancelled, out of retries");
                    return Err(ResourceError::DatabaseTransaction { reasons });
                }
                Err(err) => {
                    error!(error = %err, "Transaction failed");
                    return Err(err.into());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arcade_db::{CancellationCode, InjectedFault, MemoryStore};
    use serde_json::json;

    fn item(pk: &str, sk: &str) -> Attributes {
        let mut item = Attributes::new();
        item.insert("pk".to_string(), json!(pk));
        item.insert("sk".to_string(), json!(sk));
        item
    }

    #[test]
    fn test_builder_skips_repeated_delete() {
        let mut txn = TransactionBuilder::new();
        assert!(txn.delete(ItemKey::new("s:1", "tk:___isLatest")));
        assert!(!txn.delete(ItemKey::new("s:1", "tk:___isLatest")));
        assert_eq!(txn.len(), 1);
        assert!(txn.deletes(&ItemKey::new("s:1", "tk:___isLatest")));
    }

    #[test]
    fn test_builder_later_operation_replaces_earlier() {
        let mut txn = TransactionBuilder::new();
        txn.delete(ItemKey::new("s:1", "tk:a"));
        txn.put(item("s:1", "tk:a")).unwrap();
        assert_eq!(txn.len(), 1);
        assert!(!txn.ops()[0].is_delete());

        assert!(txn.delete(ItemKey::new("s:1", "tk:a")));
        assert!(txn.ops()[0].is_delete());
    }

    #[tokio::test]
    async fn test_empty_transaction_is_noop() {
        let store = MemoryStore::new();
        let executor = TransactionExecutor::new(Arc::new(store.clone()), 2);
        executor.execute(TransactionBuilder::new()).await.unwrap();
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_conflict_is_retried() {
        let store = MemoryStore::new();
        store.fail_next_transactions(1).await;
        let executor = TransactionExecutor::new(Arc::new(store.clone()), 2);

        executor
            .execute_ops(&[WriteOp::put(item("s:1", "s:1"))])
            .await
            .unwrap();
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_retries_exhausted_surface_reasons() {
        let store = MemoryStore::new();
        store.fail_next_transactions(2).await;
        let executor = TransactionExecutor::new(Arc::new(store.clone()), 2);

        let err = executor
            .execute_ops(&[WriteOp::put(item("s:1", "s:1"))])
            .await
            .unwrap_err();
        match err {
            ResourceError::DatabaseTransaction { reasons } => {
                assert_eq!(reasons.len(), 1);
                assert_eq!(reasons[0].code, CancellationCode::TransactionConflict);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_other_errors_are_not_retried() {
        let store = MemoryStore::new();
        store
            .inject_fault(InjectedFault::Unavailable("maintenance".into()))
            .await;
        let executor = TransactionExecutor::new(Arc::new(store.clone()), 3);

        let err = executor
            .execute_ops(&[WriteOp::put(item("s:1", "s:1"))])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ResourceError::Store(StoreError::Unavailable(_))
        ));
    }
}
