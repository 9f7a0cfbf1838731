//! Tag items: writing, diffing and reassembling the tags of a resource.
//!
//! A tag is stored as its own item in the owning resource's partition:
//!
//! ```text
//! pk      s:<id>
//! sk      tk:<key>
//! siKey1  tk:<key>:tv:<value>     (reverse lookup, siKey1-pk-index)
//! type    tk
//! key     <key>
//! value   <value>
//! ```

use std::collections::BTreeMap;

use arcade_db::schema::{ATTR_PK, ATTR_SI_KEY1, ATTR_SK, ATTR_TYPE};
use arcade_db::{string_attr, Attributes, Condition, ItemKey, WriteOp};
use percent_encoding::percent_decode_str;
use serde_json::Value;
use tracing::debug;

use crate::defaults::KEY_DELIMITER;
use crate::error::{ResourceError, Result};
use crate::keys::{self, TAG_KEY};
use crate::transaction::TransactionBuilder;

/// Flat tag key to value map.
pub type Tags = BTreeMap<String, String>;

/// Requested tag changes: `Some` sets a value, `None` removes the tag.
pub type TagUpdates = BTreeMap<String, Option<String>>;

/// Outcome of comparing two tag sets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagDiff {
    pub to_put: Tags,
    pub to_delete: Vec<String>,
}

impl TagDiff {
    pub fn is_empty(&self) -> bool {
        self.to_put.is_empty() && self.to_delete.is_empty()
    }
}

/// Build the item storing one tag.
pub fn tag_item(owner_key: &str, tag_key: &str, tag_value: &str) -> Attributes {
    let mut item = Attributes::new();
    item.insert(ATTR_PK.to_string(), Value::from(owner_key));
    item.insert(ATTR_SK.to_string(), Value::from(keys::tag_sort_key(tag_key)));
    item.insert(
        ATTR_SI_KEY1.to_string(),
        Value::from(keys::tag_index_key(tag_key, tag_value)),
    );
    item.insert(ATTR_TYPE.to_string(), Value::from(TAG_KEY));
    item.insert("key".to_string(), Value::from(tag_key));
    item.insert("value".to_string(), Value::from(tag_value));
    item
}

/// Key of the item storing `tag_key` for a resource.
pub fn tag_item_key(owner_key: &str, tag_key: &str) -> ItemKey {
    ItemKey::new(owner_key, keys::tag_sort_key(tag_key))
}

/// Queue one put per tag of a resource that does not exist yet.
pub fn add_tags(tags: &Tags, owner_key: &str, txn: &mut TransactionBuilder) -> Result<()> {
    for (key, value) in tags {
        txn.put_if(tag_item(owner_key, key, value), Condition::NotExists)?;
    }
    Ok(())
}

/// Operations applying a tag delta to an existing resource.
///
/// Puts come first, then deletes. Reserved and user tags are treated alike.
pub fn diff_and_write(
    resource_id: &str,
    type_prefix: &str,
    added: &Tags,
    removed: &[String],
) -> Vec<WriteOp> {
    let owner_key = keys::resource_key(type_prefix, resource_id);
    let mut ops: Vec<WriteOp> = added
        .iter()
        .map(|(key, value)| WriteOp::put(tag_item(&owner_key, key, value)))
        .collect();
    ops.extend(
        removed
            .iter()
            .map(|key| WriteOp::delete(tag_item_key(&owner_key, key))),
    );
    debug!(
        resource_id,
        type_prefix,
        puts = added.len(),
        deletes = removed.len(),
        "Prepared tag delta"
    );
    ops
}

/// Collect the caller-visible tags among a resource's items.
///
/// Reserved tags are left out.
pub fn assemble_tags(items: &[Attributes], out: &mut Tags) {
    let reserved_sk = keys::tag_sort_key(crate::defaults::RESERVED_PREFIX);
    for item in items {
        if string_attr(item, ATTR_TYPE) != Some(TAG_KEY) {
            continue;
        }
        if string_attr(item, ATTR_SK).is_some_and(|sk| sk.starts_with(&reserved_sk)) {
            continue;
        }
        if let (Some(key), Some(value)) = (string_attr(item, "key"), string_attr(item, "value")) {
            out.insert(key.to_string(), value.to_string());
        }
    }
}

/// Compare the stored tags with requested changes.
///
/// New keys and changed values are put; keys mapped to `None` are deleted
/// (whether or not they exist). Unchanged values produce nothing.
pub fn diff(existing: &Tags, updated: &TagUpdates) -> TagDiff {
    let mut result = TagDiff::default();
    for (key, value) in updated {
        match value {
            Some(value) if existing.get(key) != Some(value) => {
                result.to_put.insert(key.clone(), value.clone());
            }
            Some(_) => {}
            None => result.to_delete.push(key.clone()),
        }
    }
    result
}

/// Expand `key:value` query-string pairs into tags.
///
/// Both halves are percent-decoded after splitting, so an encoded `%3A` can
/// carry a delimiter inside a key or value.
pub fn expand_tag_pairs<S: AsRef<str>>(pairs: &[S]) -> Result<Tags> {
    let mut tags = Tags::new();
    for pair in pairs {
        let pair = pair.as_ref();
        let (key, value) = pair.split_once(KEY_DELIMITER).ok_or_else(|| {
            ResourceError::invalid_request(format!("tag filter '{pair}' is not key:value"))
        })?;
        let key = percent_decode(key)?;
        if key.is_empty() {
            return Err(ResourceError::invalid_request(format!(
                "tag filter '{pair}' has an empty key"
            )));
        }
        tags.insert(key, percent_decode(value)?);
    }
    Ok(tags)
}

fn percent_decode(raw: &str) -> Result<String> {
    percent_decode_str(raw)
        .decode_utf8()
        .map(|s| s.into_owned())
        .map_err(|e| ResourceError::invalid_request(format!("invalid tag encoding '{raw}': {e}")))
}
