//! Full-type scans and multi-id hydration.

use std::collections::HashMap;
use std::sync::Arc;

use arcade_db::schema::ATTR_PK;
use arcade_db::{
    string_attr, Attributes, BatchSelect, Index, IndexQuery, KvStore, QueryRequest, StartKey,
};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use tracing::debug;

use crate::error::{ResourceError, Result};
use crate::keys;
use crate::paginator::Paginator;

/// Encode a scan's continuation key as an opaque token.
pub fn encode_token(start: &StartKey) -> Result<String> {
    let json = serde_json::to_vec(start).map_err(arcade_db::StoreError::from)?;
    Ok(URL_SAFE_NO_PAD.encode(json))
}

/// Decode a token produced by [`encode_token`].
pub fn decode_token(token: &str) -> Result<StartKey> {
    let invalid = || ResourceError::invalid_request(format!("invalid pagination token '{token}'"));
    let bytes = URL_SAFE_NO_PAD.decode(token).map_err(|_| invalid())?;
    serde_json::from_slice(&bytes).map_err(|_| invalid())
}

/// Reads resources by type or by id.
#[derive(Clone)]
pub struct ResourceLister {
    store: Arc<dyn KvStore>,
    batch_chunk: usize,
}

impl ResourceLister {
    pub fn new(store: Arc<dyn KvStore>, batch_chunk: usize) -> Self {
        Self {
            store,
            batch_chunk: batch_chunk.max(1),
        }
    }

    /// Every item under one resource's partition, canonical item and tags.
    pub async fn get_items(&self, type_prefix: &str, id: &str) -> Result<Vec<Attributes>> {
        let pk = keys::resource_key(type_prefix, id);
        let items = Paginator::new(self.store.clone(), QueryRequest::partition(pk.as_str()))
            .collect_all()
            .await?;
        debug!(pk = %pk, items = items.len(), "Fetched resource items");
        Ok(items)
    }

    /// Every item belonging to each of `ids`.
    ///
    /// Ids are fetched in chunks; each chunk follows continuation keys until
    /// exhausted. Use [`group_by_id`] to split the result per resource.
    pub async fn list_items_by_ids(&self, type_prefix: &str, ids: &[String]) -> Result<Vec<Attributes>> {
        if ids.is_empty() {
            debug!(type_prefix, "No ids to hydrate");
            return Ok(Vec::new());
        }
        let mut items = Vec::new();
        for chunk in ids.chunks(self.batch_chunk) {
            let partitions = chunk
                .iter()
                .map(|id| keys::resource_key(type_prefix, id))
                .collect();
            let fetched = Paginator::new(self.store.clone(), BatchSelect::new(partitions))
                .collect_all()
                .await?;
            items.extend(fetched);
        }
        debug!(type_prefix, ids = ids.len(), items = items.len(), "Hydrated ids");
        Ok(items)
    }

    /// One page of resource ids of a type, ascending.
    ///
    /// The returned token resumes the scan; it is `None` once the scan is
    /// exhausted.
    pub async fn list_resource_ids(
        &self,
        type_prefix: &str,
        count: usize,
        token: Option<&str>,
    ) -> Result<(Vec<String>, Option<String>)> {
        if count == 0 {
            return Err(ResourceError::invalid_request("page size must be positive"));
        }
        let start = token.map(decode_token).transpose()?;
        let request = IndexQuery::new(Index::TypeSort, type_prefix)
            .with_range_prefix(keys::encode_prefix(type_prefix))
            .with_limit(count)
            .starting_after(start);

        let mut paginator = Paginator::new(self.store.clone(), request);
        let items = paginator.next_page().await?.unwrap_or_default();
        let ids: Vec<String> = items
            .iter()
            .filter_map(|item| string_attr(item, ATTR_PK))
            .filter_map(keys::decode_id)
            .map(str::to_string)
            .collect();
        let next = paginator.position().map(encode_token).transpose()?;

        debug!(type_prefix, ids = ids.len(), more = next.is_some(), "Listed resource ids");
        Ok((ids, next))
    }
}

/// Split hydrated items per resource, in the order of `ids`.
///
/// Ids without any item are left out.
pub fn group_by_id(type_prefix: &str, ids: &[String], items: Vec<Attributes>) -> Vec<(String, Vec<Attributes>)> {
    let mut by_pk: HashMap<String, Vec<Attributes>> = HashMap::new();
    for item in items {
        if let Some(pk) = string_attr(&item, ATTR_PK) {
            by_pk.entry(pk.to_string()).or_default().push(item);
        }
    }
    ids.iter()
        .filter_map(|id| {
            by_pk
                .remove(&keys::resource_key(type_prefix, id))
                .map(|items| (id.clone(), items))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use arcade_db::{MemoryStore, WriteOp};
    use serde_json::json;

    fn canonical(prefix: &str, id: &str) -> Attributes {
        let key = keys::resource_key(prefix, id);
        let mut item = Attributes::new();
        item.insert("pk".into(), json!(key));
        item.insert("sk".into(), json!(key));
        item.insert("type".into(), json!(prefix));
        item.insert("id".into(), json!(id));
        item
    }

    async fn seeded(count: usize) -> Arc<dyn KvStore> {
        let store = MemoryStore::new();
        let mut ops = Vec::new();
        for i in 0..count {
            let id = format!("{i:03}");
            ops.push(WriteOp::put(canonical("g", &id)));
            ops.push(WriteOp::put(crate::tags::tag_item(
                &keys::resource_key("g", &id),
                "crop",
                "corn",
            )));
        }
        ops.push(WriteOp::put(canonical("r", "000")));
        store.transact_write(&ops).await.unwrap();
        Arc::new(store)
    }

    #[tokio::test]
    async fn test_list_resource_ids_pages_by_token() {
        let lister = ResourceLister::new(seeded(5).await, 50);

        let (first, token) = lister.list_resource_ids("g", 2, None).await.unwrap();
        assert_eq!(first, vec!["000", "001"]);
        let (second, token) = lister
            .list_resource_ids("g", 2, token.as_deref())
            .await
            .unwrap();
        assert_eq!(second, vec!["002", "003"]);
        let (third, token) = lister
            .list_resource_ids("g", 2, token.as_deref())
            .await
            .unwrap();
        assert_eq!(third, vec!["004"]);
        assert!(token.is_none());
    }

    #[tokio::test]
    async fn test_list_resource_ids_rejects_bad_token() {
        let lister = ResourceLister::new(seeded(1).await, 50);
        let err = lister
            .list_resource_ids("g", 2, Some("not a token"))
            .await
            .unwrap_err();
        assert!(matches!(err, ResourceError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_list_items_by_ids_chunks_and_groups() {
        let lister = ResourceLister::new(seeded(5).await, 2);
        let ids: Vec<String> = vec!["004".into(), "missing".into(), "001".into(), "002".into()];

        let items = lister.list_items_by_ids("g", &ids).await.unwrap();
        assert_eq!(items.len(), 6);

        let grouped = group_by_id("g", &ids, items);
        let order: Vec<&str> = grouped.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(order, vec!["004", "001", "002"]);
        assert!(grouped.iter().all(|(_, items)| items.len() == 2));
    }

    #[test]
    fn test_token_round_trip() {
        let start = StartKey::indexed("g:1", "g:1", "g", "g:1");
        let token = encode_token(&start).unwrap();
        assert_eq!(decode_token(&token).unwrap(), start);
    }
}
