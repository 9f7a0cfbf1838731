//! Latest-version pointers.
//!
//! For resource types versioned per parent, each parent partition holds one
//! pointer item naming the child with the greatest ordering value:
//!
//! ```text
//! pk        p:<parent id>
//! sk        s:___latest
//! type      ps
//! id        <child id>
//! ordering  <normalized timestamp>
//! ```
//!
//! The current child also carries the reserved tag `___isLatest = true`, so
//! "latest only" listings are an ordinary tag filter. Children are indexed
//! under their parent by `siKey2 = p:<parent id>`, `siKey3 = s:<ordering>`.

use std::sync::Arc;

use arcade_db::schema::{ATTR_PK, ATTR_SI_KEY2, ATTR_SI_KEY3, ATTR_SK, ATTR_TYPE};
use arcade_db::{string_attr, Attributes, Condition, Index, IndexQuery, ItemKey, KvStore, StoreError};
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use tracing::debug;

use crate::catalog::LatestSpec;
use crate::error::{ResourceError, Result};
use crate::keys::{self, IS_LATEST_TAG, IS_LATEST_VALUE, LATEST_POINTER};
use crate::paginator::Paginator;
use crate::tags::{tag_item, tag_item_key};
use crate::transaction::TransactionBuilder;

const ATTR_ID: &str = "id";
const ATTR_ORDERING: &str = "ordering";

/// Resolved pointer item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LatestPointer {
    pub child_id: String,
    pub ordering: String,
}

/// Normalize an ordering field value so string order is time order.
///
/// Accepts RFC 3339 timestamps with any offset and renders them in UTC with
/// fixed nanosecond precision.
pub fn ordering_key(value: &Value) -> Result<String> {
    let raw = value
        .as_str()
        .ok_or_else(|| ResourceError::invalid_request(format!("ordering value {value} is not a string")))?;
    let parsed = DateTime::parse_from_rfc3339(raw).map_err(|e| {
        ResourceError::invalid_request(format!("ordering value '{raw}' is not an RFC 3339 timestamp: {e}"))
    })?;
    Ok(parsed
        .with_timezone(&Utc)
        .to_rfc3339_opts(SecondsFormat::Nanos, true))
}

/// Key of the pointer for children of `child_type` under one parent.
pub fn pointer_key(child_type: &str, spec: &LatestSpec, parent_id: &str) -> ItemKey {
    ItemKey::new(
        keys::resource_key(&spec.parent_type, parent_id),
        keys::latest_pointer_sort_key(child_type),
    )
}

fn pointer_item(
    child_type: &str,
    spec: &LatestSpec,
    parent_id: &str,
    child_id: &str,
    ordering: &str,
) -> Attributes {
    let key = pointer_key(child_type, spec, parent_id);
    let mut item = Attributes::new();
    item.insert(ATTR_PK.to_string(), Value::from(key.pk));
    item.insert(ATTR_SK.to_string(), Value::from(key.sk));
    item.insert(ATTR_TYPE.to_string(), Value::from(LATEST_POINTER));
    item.insert(ATTR_ID.to_string(), Value::from(child_id));
    item.insert(ATTR_ORDERING.to_string(), Value::from(ordering));
    item
}

/// Index attributes placing a child under its parent in ordering order.
pub fn ordering_attributes(
    child_type: &str,
    spec: &LatestSpec,
    parent_id: &str,
    ordering: &str,
) -> [(&'static str, String); 2] {
    [
        (ATTR_SI_KEY2, keys::resource_key(&spec.parent_type, parent_id)),
        (ATTR_SI_KEY3, keys::encode(child_type, &[ordering])),
    ]
}

/// Keeps pointer items and `___isLatest` tags in step with child writes.
#[derive(Clone)]
pub struct LatestPointerMaintainer {
    store: Arc<dyn KvStore>,
}

impl LatestPointerMaintainer {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    /// Read the pointer for one parent.
    pub async fn current(
        &self,
        child_type: &str,
        spec: &LatestSpec,
        parent_id: &str,
    ) -> Result<Option<LatestPointer>> {
        let key = pointer_key(child_type, spec, parent_id);
        let Some(item) = self.store.get_item(&key).await? else {
            return Ok(None);
        };
        let field = |name: &str| {
            string_attr(&item, name).map(str::to_string).ok_or_else(|| {
                StoreError::validation(format!("pointer item {key} is missing '{name}'"))
            })
        };
        Ok(Some(LatestPointer {
            child_id: field(ATTR_ID)?,
            ordering: field(ATTR_ORDERING)?,
        }))
    }

    /// Queue pointer work for a new child. Returns whether the child becomes
    /// the latest.
    ///
    /// A child becomes latest when there is no pointer or its ordering value
    /// is not older than the current one.
    pub async fn prepare_create(
        &self,
        txn: &mut TransactionBuilder,
        child_type: &str,
        spec: &LatestSpec,
        parent_id: &str,
        child_id: &str,
        ordering: &str,
    ) -> Result<bool> {
        let existing = self.current(child_type, spec, parent_id).await?;
        if let Some(pointer) = &existing {
            if ordering < pointer.ordering.as_str() {
                debug!(child_type, parent_id, child_id, latest = %pointer.child_id, "Child is older than latest");
                return Ok(false);
            }
            txn.delete(tag_item_key(
                &keys::resource_key(child_type, &pointer.child_id),
                IS_LATEST_TAG,
            ));
        }

        txn.put(tag_item(
            &keys::resource_key(child_type, child_id),
            IS_LATEST_TAG,
            IS_LATEST_VALUE,
        ))?;
        let condition = match &existing {
            Some(pointer) => Condition::attribute_equals(ATTR_ID, pointer.child_id.as_str()),
            None => Condition::NotExists,
        };
        txn.put_if(
            pointer_item(child_type, spec, parent_id, child_id, ordering),
            condition,
        )?;
        debug!(
            child_type,
            parent_id,
            child_id,
            previous = ?existing.map(|p| p.child_id),
            "Child becomes latest"
        );
        Ok(true)
    }

    /// Queue pointer work for a child being deleted.
    ///
    /// Only the current latest child needs any: the next most recent child
    /// takes over, or the pointer goes away when none remains.
    pub async fn prepare_delete(
        &self,
        txn: &mut TransactionBuilder,
        child_type: &str,
        spec: &LatestSpec,
        parent_id: &str,
        child_id: &str,
    ) -> Result<()> {
        let Some(pointer) = self.current(child_type, spec, parent_id).await? else {
            return Ok(());
        };
        if pointer.child_id != child_id {
            return Ok(());
        }

        let survivor = self
            .previous_child(txn, child_type, spec, parent_id, child_id)
            .await?;

        txn.delete(tag_item_key(
            &keys::resource_key(child_type, child_id),
            IS_LATEST_TAG,
        ));
        let guard = Condition::attribute_equals(ATTR_ID, child_id);
        match survivor {
            Some(next) => {
                debug!(child_type, parent_id, child_id, next = %next.child_id, "Repointing latest");
                txn.put(tag_item(
                    &keys::resource_key(child_type, &next.child_id),
                    IS_LATEST_TAG,
                    IS_LATEST_VALUE,
                ))?;
                txn.put_if(
                    pointer_item(child_type, spec, parent_id, &next.child_id, &next.ordering),
                    guard,
                )?;
            }
            None => {
                debug!(child_type, parent_id, child_id, "Last child deleted, removing pointer");
                txn.delete_if(pointer_key(child_type, spec, parent_id), guard);
            }
        }
        Ok(())
    }

    /// Most recent child other than `child_id` that this transaction keeps.
    async fn previous_child(
        &self,
        txn: &TransactionBuilder,
        child_type: &str,
        spec: &LatestSpec,
        parent_id: &str,
        child_id: &str,
    ) -> Result<Option<LatestPointer>> {
        let request = IndexQuery::new(
            Index::ParentOrder,
            keys::resource_key(&spec.parent_type, parent_id),
        )
        .with_range_prefix(keys::encode_prefix(child_type))
        .descending()
        .with_limit(2);

        let mut paginator = Paginator::new(self.store.clone(), request);
        while let Some(page) = paginator.next_page().await? {
            for item in &page {
                let Some(id) = string_attr(item, ATTR_ID) else {
                    continue;
                };
                if id == child_id || txn.deletes(&ItemKey::of(item)?) {
                    continue;
                }
                let ordering = string_attr(item, ATTR_SI_KEY3)
                    .and_then(keys::decode_id)
                    .ok_or_else(|| {
                        StoreError::validation(format!("child '{id}' has no ordering value"))
                    })?;
                return Ok(Some(LatestPointer {
                    child_id: id.to_string(),
                    ordering: ordering.to_string(),
                }));
            }
        }
        Ok(None)
    }
}
