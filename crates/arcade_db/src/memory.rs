//! In-memory store implementation for testing and embedding
//!
//! Items live in an ordered map behind `Arc<RwLock>`, so clones share one
//! table and the store is safe on multi-threaded runtimes. Secondary indexes
//! are evaluated by scanning; this backend is meant for small data sets.

use async_trait::async_trait;
use std::cmp::Ordering;
use std::collections::{BTreeMap, VecDeque};
use std::fmt::Debug;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use crate::error::{Result, StoreError};
use crate::schema::{ATTR_PK, ATTR_SK};
use crate::store::KvStore;
use crate::types::{
    directional, string_attr, validate_limit, validate_transaction, Attributes, BatchSelect,
    CancellationReason, IndexQuery, ItemKey, Page, QueryRequest, StartKey, WriteOp,
};

/// Fault returned by the next transactional write instead of applying it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InjectedFault {
    /// Cancel with a `TransactionConflict` reason for every operation
    Conflict,
    /// Fail with [`StoreError::Unavailable`]
    Unavailable(String),
}

/// In-memory store
#[derive(Clone, Default)]
pub struct MemoryStore {
    items: Arc<RwLock<BTreeMap<ItemKey, Attributes>>>,
    faults: Arc<Mutex<VecDeque<InjectedFault>>>,
}

impl Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore").finish_non_exhaustive()
    }
}

impl MemoryStore {
    /// Create a new empty in-memory store
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a fault for the next transactional write.
    pub async fn inject_fault(&self, fault: InjectedFault) {
        self.faults.lock().await.push_back(fault);
    }

    /// Cancel the next `count` transactional writes with a conflict.
    pub async fn fail_next_transactions(&self, count: usize) {
        let mut faults = self.faults.lock().await;
        faults.extend(std::iter::repeat(InjectedFault::Conflict).take(count));
    }

    /// Number of items currently stored.
    pub async fn len(&self) -> usize {
        self.items.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.items.read().await.is_empty()
    }

    /// Snapshot of every item, ordered by key.
    pub async fn dump(&self) -> Vec<Attributes> {
        self.items.read().await.values().cloned().collect()
    }
}

/// Cut an ordered candidate list down to one page.
///
/// `after` tells whether a candidate sorts strictly after the start key in
/// scan direction; `start_key_of` builds the resume point for a candidate.
fn paginate<F, K>(candidates: Vec<Attributes>, limit: Option<usize>, after: F, start_key_of: K) -> Page
where
    F: Fn(&Attributes) -> bool,
    K: Fn(&Attributes) -> StartKey,
{
    let mut remaining = candidates.into_iter().filter(|item| after(item)).peekable();
    let mut items = Vec::new();
    while let Some(item) = remaining.next() {
        items.push(item);
        if limit.is_some_and(|l| items.len() >= l) {
            break;
        }
    }
    let last_evaluated = match (remaining.peek(), items.last()) {
        (Some(_), Some(last)) => Some(start_key_of(last)),
        _ => None,
    };
    Page {
        items,
        last_evaluated,
    }
}

fn key_strings(item: &Attributes) -> (&str, &str) {
    (
        string_attr(item, ATTR_PK).unwrap_or_default(),
        string_attr(item, ATTR_SK).unwrap_or_default(),
    )
}

#[async_trait]
impl KvStore for MemoryStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn get_item(&self, key: &ItemKey) -> Result<Option<Attributes>> {
        Ok(self.items.read().await.get(key).cloned())
    }

    async fn query(&self, request: &QueryRequest) -> Result<Page> {
        validate_limit(request.limit)?;
        let prefix = request.sort_prefix.as_deref().unwrap_or_default();

        let mut candidates: Vec<Attributes> = {
            let items = self.items.read().await;
            items
                .iter()
                .filter(|(k, _)| k.pk == request.partition && k.sk.starts_with(prefix))
                .map(|(_, v)| v.clone())
                .collect()
        };
        if !request.ascending {
            candidates.reverse();
        }

        let start = request.exclusive_start.as_ref().map(|s| s.sk.clone());
        let ascending = request.ascending;
        let page = paginate(
            candidates,
            request.limit,
            |item| match &start {
                Some(start) => {
                    let (_, sk) = key_strings(item);
                    directional(sk.cmp(start.as_str()), ascending) == Ordering::Greater
                }
                None => true,
            },
            |item| {
                let (pk, sk) = key_strings(item);
                StartKey::table(pk, sk)
            },
        );
        debug!(partition = %request.partition, returned = page.items.len(), "memory query");
        Ok(page)
    }

    async fn query_index(&self, request: &IndexQuery) -> Result<Page> {
        validate_limit(request.limit)?;
        let hash_attr = request.index.hash_attr();
        let range_attr = request.index.range_attr();
        let prefix = request.range_prefix.as_deref().unwrap_or_default();

        let mut candidates: Vec<Attributes> = {
            let items = self.items.read().await;
            items
                .values()
                .filter(|item| string_attr(item, hash_attr) == Some(request.hash.as_str()))
                .filter(|item| {
                    string_attr(item, range_attr).is_some_and(|r| r.starts_with(prefix))
                })
                .cloned()
                .collect()
        };
        let order_of = |item: &Attributes| {
            let (pk, sk) = key_strings(item);
            (
                string_attr(item, range_attr).unwrap_or_default().to_string(),
                pk.to_string(),
                sk.to_string(),
            )
        };
        candidates.sort_by(|a, b| directional(order_of(a).cmp(&order_of(b)), request.ascending));

        let start = request
            .exclusive_start
            .as_ref()
            .and_then(|s| s.index_order())
            .map(|(r, p, s)| (r.to_string(), p.to_string(), s.to_string()));
        let ascending = request.ascending;
        let hash = request.hash.clone();
        let page = paginate(
            candidates,
            request.limit,
            |item| match &start {
                Some(start) => directional(order_of(item).cmp(start), ascending) == Ordering::Greater,
                None => true,
            },
            |item| {
                let (range, pk, sk) = order_of(item);
                StartKey::indexed(pk, sk, hash.clone(), range)
            },
        );
        debug!(
            index = %request.index,
            hash = %request.hash,
            returned = page.items.len(),
            "memory index query"
        );
        Ok(page)
    }

    async fn batch_select(&self, request: &BatchSelect) -> Result<Page> {
        validate_limit(request.limit)?;
        if request.partitions.is_empty() {
            return Ok(Page::default());
        }
        let candidates: Vec<Attributes> = {
            let items = self.items.read().await;
            items
                .iter()
                .filter(|(k, _)| request.partitions.contains(&k.pk))
                .map(|(_, v)| v.clone())
                .collect()
        };
        let start = request
            .exclusive_start
            .as_ref()
            .map(|s| ItemKey::new(s.pk.clone(), s.sk.clone()));
        Ok(paginate(
            candidates,
            request.limit,
            |item| match &start {
                Some(start) => {
                    let (pk, sk) = key_strings(item);
                    (pk, sk) > (start.pk.as_str(), start.sk.as_str())
                }
                None => true,
            },
            |item| {
                let (pk, sk) = key_strings(item);
                StartKey::table(pk, sk)
            },
        ))
    }

    async fn transact_write(&self, ops: &[WriteOp]) -> Result<()> {
        let keys = validate_transaction(ops)?;

        if let Some(fault) = self.faults.lock().await.pop_front() {
            debug!(?fault, "memory store injecting fault");
            return Err(match fault {
                InjectedFault::Conflict => StoreError::TransactionCanceled {
                    reasons: keys
                        .into_iter()
                        .map(|k| CancellationReason::conflict(k, "Transaction is ongoing for the item"))
                        .collect(),
                },
                InjectedFault::Unavailable(message) => StoreError::Unavailable(message),
            });
        }

        // Hold the write lock across check and apply so the batch is atomic.
        let mut items = self.items.write().await;

        let reasons: Vec<CancellationReason> = ops
            .iter()
            .zip(&keys)
            .map(|(op, key)| match op.condition() {
                Some(condition) if !condition.evaluate(items.get(key)) => {
                    CancellationReason::condition_failed(key.clone())
                }
                _ => CancellationReason::none(key.clone()),
            })
            .collect();
        if reasons.iter().any(CancellationReason::is_failure) {
            return Err(StoreError::TransactionCanceled { reasons });
        }

        for (op, key) in ops.iter().zip(keys) {
            match op {
                WriteOp::Put { item, .. } => {
                    items.insert(key, item.clone());
                }
                WriteOp::Delete { .. } => {
                    items.remove(&key);
                }
            }
        }
        debug!(operations = ops.len(), "memory transaction applied");
        Ok(())
    }
}
