#![cfg(feature = "sqlite")]

use std::sync::Arc;

use arcade_db::{
    Attributes, BatchSelect, CancellationCode, Condition, Index, IndexQuery, ItemKey, KvStore,
    MemoryStore, QueryRequest, SqliteStore, StoreError, WriteOp,
};
use serde_json::json;

fn item(pairs: &[(&str, &str)]) -> Attributes {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), json!(v)))
        .collect()
}

fn canonical(id: &str, parent: &str, ts: &str) -> Attributes {
    let key = format!("s:{id}");
    item(&[
        ("pk", key.as_str()),
        ("sk", key.as_str()),
        ("type", "s"),
        ("siKey2", parent),
        ("siKey3", ts),
        ("id", id),
    ])
}

fn tag(id: &str, key: &str, value: &str) -> Attributes {
    let pk = format!("s:{id}");
    let sk = format!("tk:{key}");
    let si_key1 = format!("tk:{key}:tv:{value}");
    item(&[
        ("pk", pk.as_str()),
        ("sk", sk.as_str()),
        ("type", "tk"),
        ("siKey1", si_key1.as_str()),
        ("key", key),
        ("value", value),
    ])
}

async fn backends() -> Vec<Arc<dyn KvStore>> {
    vec![
        Arc::new(MemoryStore::new()),
        Arc::new(SqliteStore::open_memory("arcade").await.unwrap()),
    ]
}

async fn seed(store: &dyn KvStore) {
    let mut ops = Vec::new();
    for (id, ts) in [("1", "2024-01-03"), ("2", "2024-01-01"), ("3", "2024-01-02")] {
        ops.push(WriteOp::put(canonical(id, "p:9", ts)));
        ops.push(WriteOp::put(tag(id, "crop", "corn")));
    }
    ops.push(WriteOp::put(tag("2", "year", "2024")));
    store.transact_write(&ops).await.unwrap();
}

fn keys(items: &[Attributes]) -> Vec<String> {
    items
        .iter()
        .map(|i| {
            let k = ItemKey::of(i).unwrap();
            format!("{}|{}", k.pk, k.sk)
        })
        .collect()
}

#[tokio::test]
async fn test_backends_agree_on_partition_query() {
    for store in backends().await {
        seed(store.as_ref()).await;

        let page = store
            .query(&QueryRequest::partition("s:2").with_sort_prefix("tk:"))
            .await
            .unwrap();
        assert_eq!(
            keys(&page.items),
            vec!["s:2|tk:crop", "s:2|tk:year"],
            "backend {}",
            store.backend_name()
        );
        assert!(page.is_exhausted());
    }
}

#[tokio::test]
async fn test_backends_agree_on_parent_order_index() {
    for store in backends().await {
        seed(store.as_ref()).await;

        let first = store
            .query_index(
                &IndexQuery::new(Index::ParentOrder, "p:9")
                    .descending()
                    .with_limit(2),
            )
            .await
            .unwrap();
        assert_eq!(keys(&first.items), vec!["s:1|s:1", "s:3|s:3"]);
        assert!(first.last_evaluated.is_some());

        let rest = store
            .query_index(
                &IndexQuery::new(Index::ParentOrder, "p:9")
                    .descending()
                    .with_limit(2)
                    .starting_after(first.last_evaluated),
            )
            .await
            .unwrap();
        assert_eq!(keys(&rest.items), vec!["s:2|s:2"], "backend {}", store.backend_name());
        assert!(rest.is_exhausted());
    }
}

#[tokio::test]
async fn test_backends_agree_on_tag_index_pagination() {
    for store in backends().await {
        seed(store.as_ref()).await;

        let mut seen = Vec::new();
        let mut start = None;
        loop {
            let page = store
                .query_index(
                    &IndexQuery::new(Index::TagValue, "tk:crop:tv:corn")
                        .with_limit(1)
                        .starting_after(start),
                )
                .await
                .unwrap();
            seen.extend(keys(&page.items));
            start = page.last_evaluated;
            if start.is_none() {
                break;
            }
        }
        assert_eq!(seen, vec!["s:1|tk:crop", "s:2|tk:crop", "s:3|tk:crop"]);
    }
}

#[tokio::test]
async fn test_backends_agree_on_batch_select() {
    for store in backends().await {
        seed(store.as_ref()).await;

        let page = store
            .batch_select(&BatchSelect::new(vec!["s:3".into(), "s:2".into()]))
            .await
            .unwrap();
        assert_eq!(
            keys(&page.items),
            vec!["s:2|s:2", "s:2|tk:crop", "s:2|tk:year", "s:3|s:3", "s:3|tk:crop"]
        );
    }
}

#[tokio::test]
async fn test_failed_condition_cancels_whole_transaction() {
    for store in backends().await {
        seed(store.as_ref()).await;

        let ops = vec![
            WriteOp::put(tag("1", "colour", "red")),
            WriteOp::put_if(canonical("2", "p:9", "2024-02-01"), Condition::NotExists),
        ];
        let err = store.transact_write(&ops).await.unwrap_err();
        match err {
            StoreError::TransactionCanceled { reasons } => {
                let codes: Vec<_> = reasons.iter().map(|r| r.code).collect();
                assert_eq!(
                    codes,
                    vec![CancellationCode::None, CancellationCode::ConditionalCheckFailed]
                );
            }
            other => panic!("unexpected error from {}: {other}", store.backend_name()),
        }

        let untouched = store
            .get_item(&ItemKey::new("s:1", "tk:colour"))
            .await
            .unwrap();
        assert!(untouched.is_none());
    }
}

#[tokio::test]
async fn test_conditional_single_item_writes() {
    for store in backends().await {
        seed(store.as_ref()).await;

        let err = store
            .put_item(canonical("1", "p:9", "x"), Some(Condition::NotExists))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ConditionFailed { .. }));

        store
            .delete_item(
                ItemKey::new("s:1", "s:1"),
                Some(Condition::attribute_equals("siKey3", "2024-01-03")),
            )
            .await
            .unwrap();
        assert!(store
            .get_item(&ItemKey::new("s:1", "s:1"))
            .await
            .unwrap()
            .is_none());
    }
}

#[tokio::test]
async fn test_sqlite_store_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("arcade.sqlite");

    let store = SqliteStore::open(&path, "arcade").await.unwrap();
    store.put_item(tag("7", "crop", "wheat"), None).await.unwrap();
    store.close().await;

    let reopened = SqliteStore::open(&path, "arcade").await.unwrap();
    let item = reopened
        .get_item(&ItemKey::new("s:7", "tk:crop"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(item.get("value"), Some(&json!("wheat")));
}

#[tokio::test]
async fn test_sqlite_store_rejects_non_string_index_attribute() {
    let store = SqliteStore::open_memory("arcade").await.unwrap();
    let mut bad = tag("1", "crop", "corn");
    bad.insert("siKey1".to_string(), json!(42));
    let err = store.put_item(bad, None).await.unwrap_err();
    assert!(matches!(err, StoreError::Validation(_)));
}
