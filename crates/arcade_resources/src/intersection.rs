//! Resolving resource ids carrying every one of several tags.
//!
//! Each filter is answered by a range read over the tag reverse index, which
//! yields ids in ascending order. The N-filter answer is a merge-intersection
//! of those sorted streams, pulling further pages per filter on demand.

use std::sync::Arc;

use arcade_db::schema::ATTR_PK;
use arcade_db::{string_attr, Index, IndexQuery, KvStore, StartKey};
use futures::future::try_join_all;
use tracing::{debug, trace};

use crate::error::{ResourceError, Result};
use crate::keys;
use crate::tags::Tags;

/// Answers tag filter queries for one resource type at a time.
#[derive(Clone)]
pub struct TagIntersection {
    store: Arc<dyn KvStore>,
}

/// Read position inside one filter's buffered page.
#[derive(Debug)]
struct Cursor<'a> {
    tag_key: &'a str,
    tag_value: &'a str,
    ids: Vec<String>,
    pos: usize,
    next_token: Option<String>,
}

impl Cursor<'_> {
    fn current(&self) -> Option<&str> {
        self.ids.get(self.pos).map(String::as_str)
    }
}

impl TagIntersection {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    /// One page of ids of `type_prefix` resources carrying `tag_key = tag_value`.
    ///
    /// Ids come back ascending, strictly after `token` when given. The next
    /// token is the last id, returned only when the page is full.
    pub async fn by_tag(
        &self,
        tag_key: &str,
        tag_value: &str,
        type_prefix: &str,
        count: usize,
        token: Option<&str>,
    ) -> Result<(Vec<String>, Option<String>)> {
        if count == 0 {
            return Err(ResourceError::invalid_request("page size must be positive"));
        }
        let index_key = keys::tag_index_key(tag_key, tag_value);
        let mut start = token.map(|id| {
            let pk = keys::resource_key(type_prefix, id);
            StartKey::indexed(pk.clone(), keys::tag_sort_key(tag_key), index_key.clone(), pk)
        });

        let mut ids = Vec::new();
        loop {
            let request = IndexQuery::new(Index::TagValue, index_key.as_str())
                .with_range_prefix(keys::encode_prefix(type_prefix))
                .with_limit(count - ids.len())
                .starting_after(start);
            let page = self.store.query_index(&request).await?;
            ids.extend(
                page.items
                    .iter()
                    .filter_map(|item| string_attr(item, ATTR_PK))
                    .filter_map(keys::decode_id)
                    .map(str::to_string),
            );
            start = page.last_evaluated;
            if ids.len() >= count || start.is_none() {
                break;
            }
        }

        let next_token = if ids.len() >= count {
            ids.truncate(count);
            ids.last().cloned()
        } else {
            None
        };
        debug!(
            tag_key,
            tag_value,
            type_prefix,
            ids = ids.len(),
            next = ?next_token,
            "Listed ids by tag"
        );
        Ok((ids, next_token))
    }

    /// One page of ids of `type_prefix` resources carrying every tag in `tags`.
    ///
    /// Zero filters is rejected; one filter is a plain [`Self::by_tag`].
    pub async fn by_tags(
        &self,
        tags: &Tags,
        type_prefix: &str,
        count: usize,
        token: Option<&str>,
    ) -> Result<(Vec<String>, Option<String>)> {
        if tags.is_empty() {
            return Err(ResourceError::invalid_request(
                "at least one tag filter is required",
            ));
        }
        if count == 0 {
            return Err(ResourceError::invalid_request("page size must be positive"));
        }
        if tags.len() == 1 {
            if let Some((key, value)) = tags.iter().next() {
                return self.by_tag(key, value, type_prefix, count, token).await;
            }
        }

        let first_pages = try_join_all(
            tags.iter()
                .map(|(key, value)| self.by_tag(key, value, type_prefix, count, token)),
        )
        .await?;

        if first_pages.iter().any(|(ids, _)| ids.is_empty()) {
            debug!(type_prefix, "A filter has no matches");
            return Ok((Vec::new(), None));
        }

        let mut cursors: Vec<Cursor<'_>> = tags
            .iter()
            .zip(first_pages)
            .map(|((tag_key, tag_value), (ids, next_token))| Cursor {
                tag_key,
                tag_value,
                ids,
                pos: 0,
                next_token,
            })
            .collect();

        let mut matched: Vec<String> = Vec::new();
        let mut watermark: Option<String> = None;

        'merge: while matched.len() < count {
            for cursor in cursors.iter_mut() {
                if cursor.current().is_none()
                    && !self
                        .refill(cursor, type_prefix, count, watermark.as_deref())
                        .await?
                {
                    break 'merge;
                }
            }

            let mut smallest: Option<&str> = None;
            let mut largest: Option<&str> = None;
            for cursor in &cursors {
                if let Some(id) = cursor.current() {
                    smallest = Some(smallest.map_or(id, |s| s.min(id)));
                    largest = Some(largest.map_or(id, |l| l.max(id)));
                }
            }
            let (Some(smallest), Some(largest)) = (smallest, largest) else {
                break;
            };

            if smallest == largest {
                let id = smallest.to_string();
                trace!(id = %id, "Match across all filters");
                for cursor in cursors.iter_mut() {
                    cursor.pos += 1;
                }
                watermark = Some(id.clone());
                matched.push(id);
            } else {
                let smallest = smallest.to_string();
                trace!(smallest = %smallest, largest, "Mismatch, advancing smallest");
                for cursor in cursors.iter_mut() {
                    if cursor.current() == Some(smallest.as_str()) {
                        cursor.pos += 1;
                    }
                }
            }
        }

        let next_token = if matched.len() >= count {
            matched.last().cloned()
        } else {
            None
        };
        debug!(
            type_prefix,
            filters = tags.len(),
            matched = matched.len(),
            next = ?next_token,
            "Listed ids by tags"
        );
        Ok((matched, next_token))
    }

    /// Load the next page of a cursor. Returns `false` once the filter has
    /// nothing left.
    async fn refill(
        &self,
        cursor: &mut Cursor<'_>,
        type_prefix: &str,
        count: usize,
        watermark: Option<&str>,
    ) -> Result<bool> {
        let Some(mut token) = cursor.next_token.take() else {
            trace!(tag_key = cursor.tag_key, "Filter exhausted");
            return Ok(false);
        };
        if let Some(watermark) = watermark {
            if watermark > token.as_str() {
                trace!(token = %token, watermark, "Token overridden by watermark");
                token = watermark.to_string();
            }
        }
        let (ids, next_token) = self
            .by_tag(cursor.tag_key, cursor.tag_value, type_prefix, count, Some(&token))
            .await?;
        if ids.is_empty() {
            return Ok(false);
        }
        cursor.ids = ids;
        cursor.pos = 0;
        cursor.next_token = next_token;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tags::tag_item;
    use arcade_db::{MemoryStore, WriteOp};

    async fn store_with(assignments: &[(&str, &[(&str, &str)])]) -> Arc<dyn KvStore> {
        let store = MemoryStore::new();
        let mut ops = Vec::new();
        for (id, tags) in assignments {
            for (k, v) in tags.iter() {
                ops.push(WriteOp::put(tag_item(&keys::resource_key("g", id), k, v)));
            }
        }
        if !ops.is_empty() {
            store.transact_write(&ops).await.unwrap();
        }
        Arc::new(store)
    }

    fn filter(pairs: &[(&str, &str)]) -> Tags {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_by_tag_token_only_on_full_page() {
        let store = store_with(&[
            ("a", &[("crop", "corn")]),
            ("b", &[("crop", "corn")]),
            ("c", &[("crop", "corn")]),
        ])
        .await;
        let engine = TagIntersection::new(store);

        let (ids, token) = engine.by_tag("crop", "corn", "g", 2, None).await.unwrap();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(token.as_deref(), Some("b"));

        let (ids, token) = engine
            .by_tag("crop", "corn", "g", 2, token.as_deref())
            .await
            .unwrap();
        assert_eq!(ids, vec!["c"]);
        assert!(token.is_none());
    }

    #[tokio::test]
    async fn test_by_tags_rejects_empty_filter() {
        let engine = TagIntersection::new(store_with(&[]).await);
        let err = engine.by_tags(&Tags::new(), "g", 10, None).await.unwrap_err();
        assert!(matches!(err, ResourceError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_by_tags_intersects_across_pages() {
        let store = store_with(&[
            ("a", &[("crop", "corn")]),
            ("b", &[("crop", "corn"), ("region", "west")]),
            ("c", &[("region", "west")]),
            ("d", &[("crop", "corn"), ("region", "west")]),
            ("e", &[("crop", "corn")]),
            ("f", &[("crop", "corn"), ("region", "west")]),
        ])
        .await;
        let engine = TagIntersection::new(store);
        let tags = filter(&[("crop", "corn"), ("region", "west")]);

        let (ids, token) = engine.by_tags(&tags, "g", 2, None).await.unwrap();
        assert_eq!(ids, vec!["b", "d"]);
        assert_eq!(token.as_deref(), Some("d"));

        let (ids, token) = engine
            .by_tags(&tags, "g", 2, token.as_deref())
            .await
            .unwrap();
        assert_eq!(ids, vec!["f"]);
        assert!(token.is_none());
    }

    #[tokio::test]
    async fn test_by_tags_empty_when_one_filter_misses() {
        let store = store_with(&[("a", &[("crop", "corn")])]).await;
        let engine = TagIntersection::new(store);
        let (ids, token) = engine
            .by_tags(&filter(&[("crop", "corn"), ("region", "east")]), "g", 5, None)
            .await
            .unwrap();
        assert!(ids.is_empty());
        assert!(token.is_none());
    }
}
