//! End-to-end behaviour of the resource store over both backends.

use std::sync::Arc;

use arcade_db::{KvStore, MemoryStore, SqliteStore};
use arcade_resources::{
    ListOptions, NewResource, Resource, ResourceError, ResourceService, StoreConfig,
    TagIntersection, Tags,
};

async fn backends() -> Vec<Arc<dyn KvStore>> {
    vec![
        Arc::new(MemoryStore::new()),
        Arc::new(SqliteStore::open_memory("arcade").await.unwrap()),
    ]
}

async fn polygon(service: &ResourceService) -> Resource {
    let group = service
        .create("g", NewResource::new().with_field("name", "farm"), "tester")
        .await
        .unwrap();
    let region = service
        .create(
            "r",
            NewResource::new()
                .with_field("name", "north")
                .with_field("groupId", group.id.as_str()),
            "tester",
        )
        .await
        .unwrap();
    service
        .create(
            "p",
            NewResource::new()
                .with_field("name", "field 7")
                .with_field("regionId", region.id.as_str()),
            "tester",
        )
        .await
        .unwrap()
}

async fn state(service: &ResourceService, polygon_id: &str, timestamp: &str) -> Resource {
    service
        .create(
            "s",
            NewResource::new()
                .with_field("polygonId", polygon_id)
                .with_field("timestamp", timestamp),
            "tester",
        )
        .await
        .unwrap()
}

#[tokio::test]
async fn scenario_a_two_tag_intersection() {
    for store in backends().await {
        let service = ResourceService::new(store, StoreConfig::default()).unwrap();
        let tagged = |crop: &str, region: &str| {
            NewResource::new()
                .with_field("name", format!("{crop}-{region}"))
                .with_tag("crop", crop)
                .with_tag("region", region)
        };
        service.create("g", tagged("corn", "east"), "t").await.unwrap();
        let r2 = service.create("g", tagged("corn", "west"), "t").await.unwrap();
        service.create("g", tagged("wheat", "west"), "t").await.unwrap();

        let page = service
            .list(
                "g",
                ListOptions::new()
                    .with_tag("crop", "corn")
                    .with_tag("region", "west"),
            )
            .await
            .unwrap();
        let ids: Vec<&str> = page.items.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec![r2.id.as_str()]);
        assert!(page.next_token.is_none());
        assert_eq!(page.items[0].tags.get("crop").map(String::as_str), Some("corn"));
    }
}

#[tokio::test]
async fn scenario_b_latest_pointer_follows_create_and_delete() {
    for store in backends().await {
        let service = ResourceService::new(store, StoreConfig::default()).unwrap();
        let polygon = polygon(&service).await;

        let a = state(&service, &polygon.id, "2021-06-01T00:00:00Z").await;
        let b = state(&service, &polygon.id, "2023-06-01T00:00:00Z").await;
        assert_eq!(
            service.latest("s", &polygon.id).await.unwrap().map(|r| r.id),
            Some(b.id.clone())
        );

        let latest_only = service
            .list(
                "s",
                ListOptions::new()
                    .with_field("polygonId", polygon.id.as_str())
                    .latest_only(),
            )
            .await
            .unwrap();
        let ids: Vec<&str> = latest_only.items.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec![b.id.as_str()]);

        service.delete("s", &b.id).await.unwrap();
        assert_eq!(
            service.latest("s", &polygon.id).await.unwrap().map(|r| r.id),
            Some(a.id.clone())
        );
        let latest_only = service
            .list("s", ListOptions::new().latest_only())
            .await
            .unwrap();
        assert_eq!(latest_only.items.len(), 1);
        assert_eq!(latest_only.items[0].id, a.id);

        service.delete("s", &a.id).await.unwrap();
        assert!(service.latest("s", &polygon.id).await.unwrap().is_none());
    }
}

#[tokio::test]
async fn scenario_b_older_child_does_not_take_over() {
    let service = ResourceService::new(Arc::new(MemoryStore::new()), StoreConfig::default()).unwrap();
    let polygon = polygon(&service).await;

    let newer = state(&service, &polygon.id, "2023-01-01T00:00:00Z").await;
    let older = state(&service, &polygon.id, "2021-01-01T00:00:00Z").await;
    assert_eq!(
        service.latest("s", &polygon.id).await.unwrap().map(|r| r.id),
        Some(newer.id.clone())
    );

    service.delete("s", &older.id).await.unwrap();
    assert_eq!(
        service.latest("s", &polygon.id).await.unwrap().map(|r| r.id),
        Some(newer.id)
    );
}

#[tokio::test]
async fn deleting_a_polygon_with_states_is_refused() {
    for store in backends().await {
        let service = ResourceService::new(store, StoreConfig::default()).unwrap();
        let polygon = polygon(&service).await;
        let s = state(&service, &polygon.id, "2022-01-01T00:00:00Z").await;

        let err = service.delete("p", &polygon.id).await.unwrap_err();
        assert!(matches!(err, ResourceError::InvalidState(_)));
        let region_id = polygon.field_str("regionId").unwrap().to_string();
        let err = service.delete("r", &region_id).await.unwrap_err();
        assert!(matches!(err, ResourceError::InvalidState(_)));

        service.delete("s", &s.id).await.unwrap();
        service.delete("p", &polygon.id).await.unwrap();
        service.delete("r", &region_id).await.unwrap();
    }
}

#[tokio::test]
async fn polygon_listing_embeds_latest_state() {
    for store in backends().await {
        let service = ResourceService::new(store, StoreConfig::default()).unwrap();
        let with_states = polygon(&service).await;
        state(&service, &with_states.id, "2021-01-01T00:00:00Z").await;
        let newest = state(&service, &with_states.id, "2023-01-01T00:00:00Z").await;
        let bare = service
            .create(
                "p",
                NewResource::new()
                    .with_field("name", "bare")
                    .with_field("regionId", with_states.field_str("regionId").unwrap()),
                "tester",
            )
            .await
            .unwrap();

        let page = service
            .list("p", ListOptions::new().include_latest())
            .await
            .unwrap();
        assert_eq!(page.items.len(), 2);
        for item in &page.items {
            if item.id == with_states.id {
                assert_eq!(item.latest.get("s").map(|r| r.id.as_str()), Some(newest.id.as_str()));
            } else {
                assert_eq!(item.id, bare.id);
                assert!(item.latest.is_empty());
            }
        }

        let plain = service.list("p", ListOptions::new()).await.unwrap();
        assert!(plain.items.iter().all(|r| r.latest.is_empty()));
    }
}

#[tokio::test]
async fn unfiltered_listing_follows_tokens_to_the_end() {
    for store in backends().await {
        let service = ResourceService::new(store, StoreConfig::default()).unwrap();
        let mut created = Vec::new();
        for i in 0..5 {
            let group = service
                .create("g", NewResource::new().with_field("name", format!("g{i}")), "t")
                .await
                .unwrap();
            created.push(group.id);
        }
        created.sort();

        let mut seen = Vec::new();
        let mut token: Option<String> = None;
        for _ in 0..10 {
            let page = service
                .list("g", ListOptions::new().with_count(2).with_token(token.clone()))
                .await
                .unwrap();
            seen.extend(page.items.into_iter().map(|r| r.id));
            token = page.next_token;
            if token.is_none() {
                break;
            }
        }
        assert!(token.is_none(), "listing never reported its last page");
        assert_eq!(seen, created);
    }
}

#[tokio::test]
async fn scenario_c_empty_tag_filter_is_rejected() {
    for store in backends().await {
        let engine = TagIntersection::new(store);
        let err = engine.by_tags(&Tags::new(), "g", 20, None).await.unwrap_err();
        assert!(matches!(err, ResourceError::InvalidRequest(_)));
    }
}

#[tokio::test]
async fn state_inherits_reserved_fields_from_ancestors() {
    let service = ResourceService::new(Arc::new(MemoryStore::new()), StoreConfig::default()).unwrap();
    let polygon = polygon(&service).await;
    let s = state(&service, &polygon.id, "2022-01-01T00:00:00Z").await;

    assert_eq!(s.field_str("regionId"), polygon.field_str("regionId"));
    assert_eq!(s.field_str("groupId"), polygon.field_str("groupId"));

    let by_region = service
        .list(
            "s",
            ListOptions::new().with_field("regionId", polygon.field_str("regionId").unwrap()),
        )
        .await
        .unwrap();
    assert_eq!(by_region.items.len(), 1);
}

#[tokio::test]
async fn state_rejects_bad_timestamp_and_fixed_field_changes() {
    let service = ResourceService::new(Arc::new(MemoryStore::new()), StoreConfig::default()).unwrap();
    let polygon = polygon(&service).await;

    let err = service
        .create(
            "s",
            NewResource::new()
                .with_field("polygonId", polygon.id.as_str())
                .with_field("timestamp", "not a time"),
            "tester",
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ResourceError::InvalidRequest(_)));

    let s = state(&service, &polygon.id, "2022-01-01T00:00:00Z").await;
    let err = service
        .update(
            "s",
            &s.id,
            arcade_resources::ResourceUpdate::new().with_field("timestamp", "2024-01-01T00:00:00Z"),
            "tester",
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ResourceError::InvalidRequest(_)));
}

#[tokio::test]
async fn conflicting_writes_are_retried_then_reported() {
    let store = MemoryStore::new();
    let service = ResourceService::new(
        Arc::new(store.clone()),
        StoreConfig::default().with_transaction_retries(2),
    )
    .unwrap();

    store.fail_next_transactions(1).await;
    let created = service
        .create("g", NewResource::new().with_field("name", "retry"), "t")
        .await
        .unwrap();
    assert_eq!(created.field_str("name"), Some("retry"));

    store.fail_next_transactions(2).await;
    let err = service
        .create("g", NewResource::new().with_field("name", "gives up"), "t")
        .await
        .unwrap_err();
    match err {
        ResourceError::DatabaseTransaction { reasons } => assert_eq!(reasons.len(), 2),
        other => panic!("unexpected error: {other}"),
    }
    let page = service.list("g", ListOptions::new()).await.unwrap();
    assert_eq!(page.items.len(), 1);
}

#[tokio::test]
async fn sqlite_file_store_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("arcade.sqlite");

    let id = {
        let store = SqliteStore::open(&path, "arcade").await.unwrap();
        let service = ResourceService::new(Arc::new(store.clone()), StoreConfig::default()).unwrap();
        let created = service
            .create("g", NewResource::new().with_field("name", "kept").with_tag("a", "b"), "t")
            .await
            .unwrap();
        store.close().await;
        created.id
    };

    let store = SqliteStore::open(&path, "arcade").await.unwrap();
    let service = ResourceService::new(Arc::new(store), StoreConfig::default()).unwrap();
    let fetched = service.get("g", &id).await.unwrap();
    assert_eq!(fetched.field_str("name"), Some("kept"));
    assert_eq!(fetched.tags.get("a").map(String::as_str), Some("b"));
}
